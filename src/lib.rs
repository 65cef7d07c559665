pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod messaging;
pub mod scheduler;
pub mod stores;
pub mod sync;

// Re-export main components for easier use
pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use sync::{LifecycleState, Presence, PresenceVector, SyncEngine, SyncSummary};
