//! Notification sinks for detected changes.
//!
//! Sinks are the subscription side of the engine: audit logs, downstream
//! sync jobs and application code receive a batch notification per entity
//! and one notification per change. Watcher callbacks are the simpler
//! in-process alternative.

use std::sync::mpsc::{self, Receiver, Sender};
use tracing::info;

use crate::change::Change;

pub trait ChangeSink: Send + Sync {
    /// All changes found for `entity` in one poll. Not called for empty polls.
    fn changes_detected(&self, _entity: &str, _changes: &[Change]) {}

    /// One detected change.
    fn change_detected(&self, _change: &Change) {}
}

/// Logs every notification through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ChangeSink for TracingSink {
    fn changes_detected(&self, entity: &str, changes: &[Change]) {
        info!(entity, count = changes.len(), "Changes detected");
    }

    fn change_detected(&self, change: &Change) {
        info!(
            entity = %change.entity,
            change_type = %change.change_type,
            key = %change.key,
            "Change detected"
        );
    }
}

/// Message forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Batch { entity: String, changes: Vec<Change> },
    Single(Change),
}

/// Forwards notifications into a std channel. A dropped receiver makes the
/// sink silently discard further events.
pub struct ChannelSink {
    sender: Sender<ChangeEvent>,
}

impl ChannelSink {
    /// Create a new sink and the receiver for its events.
    pub fn new() -> (Self, Receiver<ChangeEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: ChangeEvent) {
        let _ = self.sender.send(event);
    }
}

impl ChangeSink for ChannelSink {
    fn changes_detected(&self, entity: &str, changes: &[Change]) {
        self.send(ChangeEvent::Batch {
            entity: entity.to_string(),
            changes: changes.to_vec(),
        });
    }

    fn change_detected(&self, change: &Change) {
        self.send(ChangeEvent::Single(change.clone()));
    }
}
