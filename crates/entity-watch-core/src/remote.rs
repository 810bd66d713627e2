//! HTTP client for an OData-style service layer.

use anyhow::{anyhow, bail, Context, Result};
use entity_watch_config::config::{ConfigError, RemoteConfig};
use entity_watch_engine::{EntityCollection, Query, Record};
use reqwest::blocking::{Client, Request};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Page size preference; pages are otherwise capped at the service default.
const PREFER: HeaderName = HeaderName::from_static("prefer");

/// Queries `GET {base_url}/{entity}` with `$filter`, `$select`, `$orderby`,
/// `$top` and `$skip` parameters and reads records from the `value` array.
///
/// Uses the blocking reqwest client; build it outside of any tokio runtime.
#[derive(Clone)]
pub struct ServiceLayerClient {
    base_url: String,
    client: Client,
    username: Option<String>,
    password: Option<String>,
}

impl ServiceLayerClient {
    /// Create a new client from the `[remote]` settings.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ConfigError::MissingBaseUrl.into());
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(cookie) = &config.session_cookie {
            let value = HeaderValue::from_str(cookie).context("Invalid session cookie")?;
            headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            client,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The request that [`EntityCollection::query`] would send. The page size
    /// is requested explicitly so full pages are never truncated.
    pub fn request(&self, entity: &str, query: &Query) -> Result<Request> {
        let mut builder = self
            .client
            .get(format!("{}/{}", self.base_url, entity))
            .query(&query_params(query))
            .header(PREFER, format!("odata.maxpagesize={}", query.top));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_ref());
        }
        builder
            .build()
            .with_context(|| format!("Failed to build request for {}", entity))
    }
}

impl EntityCollection for ServiceLayerClient {
    fn query(&self, entity: &str, query: &Query) -> Result<Vec<Record>> {
        let request = self.request(entity, query)?;
        debug!(entity, url = %request.url(), "Querying remote collection");

        let response = self
            .client
            .execute(request)
            .with_context(|| format!("Request for {} failed", entity))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Query for {} failed: {} {}", entity, status, body.trim());
        }

        let body: Value = response
            .json()
            .with_context(|| format!("Invalid JSON response for {}", entity))?;
        parse_records(body)
    }
}

/// Query-string pairs for `query`; unset parts are omitted.
pub fn query_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if let Some(filter) = &query.filter {
        params.push(("$filter", filter.to_string()));
    }
    if !query.select.is_empty() {
        params.push(("$select", query.select.join(",")));
    }
    if let Some(order_by) = &query.order_by {
        params.push(("$orderby", order_by.to_string()));
    }
    params.push(("$top", query.top.to_string()));
    if query.skip > 0 {
        params.push(("$skip", query.skip.to_string()));
    }
    params
}

/// Records from a response body. A body without `value` is an empty page.
pub fn parse_records(body: Value) -> Result<Vec<Record>> {
    let value = match body {
        Value::Object(mut map) => map.remove("value"),
        other => bail!("Expected a JSON object response, got {}", other),
    };

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(anyhow!("Expected a record object, got {}", other)),
            })
            .collect(),
        Some(other) => bail!("Expected `value` to be an array, got {}", other),
    }
}
