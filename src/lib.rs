pub mod agent;
pub mod cancel;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod object;
pub mod probe;
pub mod store;
pub mod watch;

// Re-export commonly used types
pub use agent::Agent;
pub use cancel::CancelToken;
pub use config::AgentConfig;
pub use controller::{DbController, DbSender};
pub use error::{Error, ProbeError, Result, StoreError};
pub use object::{FsObject, ObjectRecord, ObjectType};
pub use store::{open_store, DbOperation, ObjectStore, StoreLocation, StoreOptions};
pub use watch::{WatchSettings, WatcherPool};
