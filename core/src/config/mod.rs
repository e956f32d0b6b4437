//! Configuration management
//!
//! [`EngineConfig`] carries protocol header values and execution limits.

pub mod manager;
pub mod store;

pub use manager::{EngineConfig, EventsConfig, ExecutionConfig, ProtocolConfig};
pub use store::ENV_PREFIX;
