pub mod aa;
pub mod config;
pub mod error;
pub mod events;
pub mod formula;
pub mod kv;
pub mod ledger;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use aa::{AaResponse, AaServices, Trigger};
pub use config::EngineConfig;
pub use error::{AaError, ExecError, Result};
pub use events::{EventBus, Topic};
pub use scheduler::{AaScheduler, DrainReport, SchedulerDaemon};
