pub mod bootstrap;
pub mod remote;
pub mod scheduler;
pub mod sync;

pub use bootstrap::{build_registry, open_state_store, DurableStateStore};
pub use entity_watch_config::{config, persistence};
pub use remote::ServiceLayerClient;
pub use scheduler::{PollScheduler, SchedulerConfig};
