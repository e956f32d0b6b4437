//! Formula evaluation seam
//!
//! The expression language lives outside the engine. The engine only
//! recognizes formula-valued strings, hands them to a [`FormulaEvaluator`]
//! together with the evaluation context, and interprets the result.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::aa::state::{Locals, ResponseVars, StateVars, ValidationState};
use crate::aa::trigger::Trigger;
use crate::kv::KvStore;
use crate::ledger::store::LedgerConn;

pub mod script;

pub use script::ScriptEvaluator;

/// Evaluation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaError {
    pub message: String,
    /// Set when the formula itself called `bounce(...)`
    pub bounce_message: Option<String>,
}

impl FormulaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bounce_message: None,
        }
    }

    /// Explicit bounce requested by the formula
    pub fn bounce(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            message: message.clone(),
            bounce_message: Some(message),
        }
    }

    /// Bounce reason for a failure of `formula`
    pub fn reason(&self, formula: &str) -> String {
        match &self.bounce_message {
            Some(msg) => msg.clone(),
            None => format!("formula {} failed: {}", formula, self.message),
        }
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FormulaError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalOptions {
    /// Result may be an object (template values only)
    pub object_result_allowed: bool,
    /// Formula is a statement list; its value is ignored
    pub statements_only: bool,
    /// `var[...] = ...` is permitted (state update formula only)
    pub state_var_assignment_allowed: bool,
}

impl EvalOptions {
    pub fn value() -> Self {
        Self {
            object_result_allowed: true,
            ..Self::default()
        }
    }

    pub fn condition() -> Self {
        Self::default()
    }

    pub fn statements() -> Self {
        Self {
            statements_only: true,
            ..Self::default()
        }
    }

    pub fn state_update() -> Self {
        Self {
            statements_only: true,
            state_var_assignment_allowed: true,
            ..Self::default()
        }
    }
}

/// Everything a formula may read or mutate
pub struct EvalRequest<'a> {
    /// Formula text without the surrounding braces
    pub formula: &'a str,
    pub trigger: &'a Trigger,
    pub locals: &'a mut Locals,
    pub state_vars: &'a mut StateVars,
    pub response_vars: &'a mut ResponseVars,
    pub validation_state: &'a ValidationState,
    /// Address of the executing AA
    pub address: &'a str,
    pub conn: &'a mut dyn LedgerConn,
    pub kv: &'a dyn KvStore,
    /// Only known to the state update formula of a unit-producing response
    pub response_unit: Option<&'a str>,
    pub options: EvalOptions,
}

/// External expression evaluator
#[async_trait]
pub trait FormulaEvaluator: Send + Sync {
    /// `Ok(Value::String(""))` asks the caller to delete the slot
    async fn evaluate(&self, request: EvalRequest<'_>) -> Result<Value, FormulaError>;
}

/// Evaluator for deployments without formulas: every evaluation fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvaluator;

#[async_trait]
impl FormulaEvaluator for NullEvaluator {
    async fn evaluate(&self, request: EvalRequest<'_>) -> Result<Value, FormulaError> {
        Err(FormulaError::new(format!(
            "no formula evaluator configured for {}",
            request.formula
        )))
    }
}

/// Evaluator backed by a synchronous closure
pub struct ClosureEvaluator<F> {
    func: F,
}

impl<F> ClosureEvaluator<F>
where
    F: Fn(&mut EvalRequest<'_>) -> Result<Value, FormulaError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> FormulaEvaluator for ClosureEvaluator<F>
where
    F: Fn(&mut EvalRequest<'_>) -> Result<Value, FormulaError> + Send + Sync,
{
    async fn evaluate(&self, mut request: EvalRequest<'_>) -> Result<Value, FormulaError> {
        (self.func)(&mut request)
    }
}

// ============================================================================
// Template shape predicates
// ============================================================================

/// Formula text of a `{...}` string
pub fn get_formula(text: &str) -> Option<&str> {
    text.strip_prefix('{')?.strip_suffix('}')
}

pub fn value_formula(value: &Value) -> Option<&str> {
    value.as_str().and_then(get_formula)
}

/// `{"cases": [..]}` with nothing else in the object
pub fn has_cases(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            obj.len() == 1
                && obj
                    .get("cases")
                    .and_then(Value::as_array)
                    .is_some_and(|cases| !cases.is_empty())
        }
        None => false,
    }
}

/// Object guarded by an `if` and/or prefixed by an `init`
pub fn is_conditional(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            obj.get("if").is_some_and(Value::is_string)
                || obj.get("init").is_some_and(Value::is_string)
        }
        None => false,
    }
}

/// `false`, `""`, `0` and null are falsy; everything else is truthy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}
