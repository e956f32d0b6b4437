//! Autonomous agent execution
//!
//! [`orchestrator::handle_trigger`] is the entry point; the other modules
//! are the stages it runs through.

pub mod balances;
pub mod coins;
pub mod composer;
pub mod orchestrator;
pub mod state;
pub mod template;
pub mod trigger;


pub use orchestrator::{handle_trigger, AaServices, Cascade, TriggerOutcome};
pub use state::{AaResponse, ResponseBody, StateValue, StateVars};
pub use trigger::Trigger;
