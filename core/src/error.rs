//! Structured error types for the AA engine
//!
//! Two channels exist side by side:
//! - [`AaError`]: fatal conditions. The input data or an external collaborator
//!   violated an invariant; the drain stops and the error escalates.
//! - [`ExecError::Bounce`]: recoverable conditions inside one AA invocation.
//!   They never leave the orchestrator, which turns them into a bounce.

use thiserror::Error;

/// Fatal error type for AA execution
#[derive(Error, Debug)]
pub enum AaError {
    // =========================================================================
    // Ledger data errors
    // =========================================================================
    /// Trigger or MC unit missing from storage
    #[error("unit not found: {unit}")]
    UnitNotFound { unit: String },

    /// Main chain must have exactly one unit per index
    #[error("found {count} MC units on MCI {mci}")]
    McUnitCount { mci: u64, count: usize },

    /// Definition is not an `["autonomous agent", {...}]` pair
    #[error("bad AA definition: {definition}")]
    BadDefinition { definition: String },

    /// A unit was queued as a trigger but pays nothing to the AA
    #[error("no outputs to {address}")]
    NoOutputsToAddress { address: String },

    /// Unit without authors cannot be a trigger
    #[error("unit {unit} has no authors")]
    NoAuthors { unit: String },

    /// Trigger unit carries a payment payload that does not parse
    #[error("malformed payment in unit {unit}: {reason}")]
    MalformedPayment { unit: String, reason: String },

    // =========================================================================
    // Template errors
    // =========================================================================
    /// Template node of a shape AA validation should have rejected
    #[error("unknown type of value in {name}")]
    UnknownTemplateValue { name: String },

    /// Selected case has no value under the slot name
    #[error("a case was selected but no replacement value in {name}")]
    CaseWithoutReplacement { name: String },

    // =========================================================================
    // Composition errors
    // =========================================================================
    /// Previous AA unit includes a later MCI than the one being processed
    #[error("limci of last AA > mci")]
    LimciAboveMci,

    /// Refund unit pays another AA
    #[error("secondary triggers while bouncing")]
    SecondaryTriggersWhileBouncing,

    /// A bounced secondary must not have produced a unit
    #[error("response_unit with bouncing a secondary AA")]
    ResponseUnitOnBouncedSecondary,

    /// Unstable unit cache lost a unit that was just written
    #[error("response unit {unit} missing from unstable unit cache")]
    UncachedResponseUnit { unit: String },

    /// Amount arithmetic left the u64 range
    #[error("amount overflow for asset {asset}")]
    AmountOverflow { asset: String },

    /// Balance update would go below zero
    #[error("negative balance of {asset} on {address}")]
    NegativeBalance { address: String, asset: String },

    // =========================================================================
    // Validation and persistence errors
    // =========================================================================
    /// Validator rejected the joint framing
    #[error("AA validation joint error: {0}")]
    JointError(String),

    /// Validator hit a transient condition
    #[error("AA validation transient error: {0}")]
    TransientError(String),

    /// Validator returned an outcome that AA units can never produce
    #[error("AA validation unexpected outcome: {0}")]
    UnexpectedValidation(String),

    /// AA units must always be serial
    #[error("nonserial AA")]
    NonserialAa,

    /// Unit writer failed to persist a validated unit
    #[error("AA writer returned error: {0}")]
    Writer(String),

    /// Key-value batch could not be written
    #[error("AA composer: batch write failed: {0}")]
    BatchWrite(String),

    /// Storage layer failure
    #[error("storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Invalid configuration value
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration source could not be read or deserialized
    #[error("config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    // =========================================================================
    // External error wrappers
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl AaError {
    /// Errors caused by corrupted ledger or definition data rather than a
    /// failing collaborator
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::UnitNotFound { .. }
                | Self::McUnitCount { .. }
                | Self::BadDefinition { .. }
                | Self::NoOutputsToAddress { .. }
                | Self::NoAuthors { .. }
                | Self::MalformedPayment { .. }
                | Self::UnknownTemplateValue { .. }
                | Self::CaseWithoutReplacement { .. }
                | Self::LimciAboveMci
        )
    }
}

/// Result type alias using AaError
pub type Result<T> = std::result::Result<T, AaError>;

/// Outcome channel used inside one AA invocation
#[derive(Error, Debug)]
pub enum ExecError {
    /// Recoverable: the AA bounces with this reason
    #[error("{0}")]
    Bounce(String),

    /// Unrecoverable: escalates out of the drain
    #[error(transparent)]
    Fatal(#[from] AaError),
}

impl ExecError {
    pub fn bounce(reason: impl Into<String>) -> Self {
        Self::Bounce(reason.into())
    }
}

/// Result alias for code that may bounce
pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Join a new bounce reason onto an existing one
pub fn append_reason(existing: Option<&str>, reason: &str) -> String {
    match existing {
        Some(prev) if !prev.is_empty() => format!("{}, then {}", prev, reason),
        _ => reason.to_string(),
    }
}
