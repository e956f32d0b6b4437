//! Template resolution
//!
//! Walks an AA template depth-first in document order and replaces every
//! formula-valued node with its computed value. Besides plain formulas the
//! walk understands formula keys, `cases` blocks and `if`/`init` guarded
//! objects. The formula found at `/messages/state` is not evaluated here but
//! captured for execution after the response unit is built.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::aa::state::{Locals, ResponseVars, StateVars, ValidationState};
use crate::aa::trigger::Trigger;
use crate::error::{AaError, ExecError, ExecResult};
use crate::formula::{
    get_formula, has_cases, is_conditional, is_truthy, value_formula, EvalOptions, EvalRequest,
    FormulaError, FormulaEvaluator,
};
use crate::kv::KvStore;
use crate::ledger::store::LedgerConn;

const STATE_UPDATE_PATH: &str = "/messages/state";

/// Deferred state update formula
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub formula: String,
    /// Locals as seen at the point of capture
    pub locals: Locals,
}

/// Position of a node inside its parent
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Key(String),
    Index(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Key(key) => write!(f, "{}", key),
            Slot::Index(i) => write!(f, "{}", i),
        }
    }
}

/// Shape of a node, decided before it is visited
enum Node {
    Scalar,
    Formula(String),
    Cases,
    Conditional,
    Array(usize),
    Object(Vec<String>),
    Unknown,
}

fn classify(value: &Value) -> Node {
    match value {
        Value::Number(_) | Value::Bool(_) => Node::Scalar,
        Value::String(s) => match get_formula(s) {
            Some(f) => Node::Formula(f.to_string()),
            None => Node::Scalar,
        },
        v if has_cases(v) => Node::Cases,
        v if is_conditional(v) => Node::Conditional,
        Value::Array(items) => Node::Array(items.len()),
        Value::Object(map) if !map.is_empty() => Node::Object(map.keys().cloned().collect()),
        _ => Node::Unknown,
    }
}

fn slot_ref<'v>(container: &'v Value, slot: &Slot) -> Option<&'v Value> {
    match slot {
        Slot::Key(key) => container.as_object()?.get(key),
        Slot::Index(i) => container.as_array()?.get(*i),
    }
}

fn slot_mut<'v>(container: &'v mut Value, slot: &Slot) -> Option<&'v mut Value> {
    match slot {
        Slot::Key(key) => container.as_object_mut()?.get_mut(key),
        Slot::Index(i) => container.as_array_mut()?.get_mut(*i),
    }
}

fn set_slot(container: &mut Value, slot: &Slot, value: Value) {
    if let Some(target) = slot_mut(container, slot) {
        *target = value;
    }
}

/// Object keys are removed; array elements become null and are filtered by
/// the parent array
fn clear_slot(container: &mut Value, slot: &Slot) {
    match slot {
        Slot::Key(key) => {
            if let Some(obj) = container.as_object_mut() {
                obj.shift_remove(key);
            }
        }
        Slot::Index(_) => set_slot(container, slot, Value::Null),
    }
}

fn remove_key(container: &mut Value, slot: &Slot, key: &str) {
    if let Some(obj) = slot_mut(container, slot).and_then(Value::as_object_mut) {
        obj.shift_remove(key);
    }
}

/// Strings print bare, other values as JSON
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn failed(text: &str) -> impl FnOnce(FormulaError) -> ExecError + '_ {
    move |err| ExecError::Bounce(err.reason(text))
}

pub struct TemplateResolver<'r> {
    evaluator: &'r dyn FormulaEvaluator,
    kv: &'r dyn KvStore,
    conn: &'r mut dyn LedgerConn,
    trigger: &'r Trigger,
    state_vars: &'r mut StateVars,
    response_vars: &'r mut ResponseVars,
    validation_state: &'r ValidationState,
    address: &'r str,
    yield_every: u64,
    visited: u64,
    state_update: Option<StateUpdate>,
}

impl<'r> TemplateResolver<'r> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evaluator: &'r dyn FormulaEvaluator,
        kv: &'r dyn KvStore,
        conn: &'r mut dyn LedgerConn,
        trigger: &'r Trigger,
        state_vars: &'r mut StateVars,
        response_vars: &'r mut ResponseVars,
        validation_state: &'r ValidationState,
        address: &'r str,
        yield_every: u64,
    ) -> Self {
        Self {
            evaluator,
            kv,
            conn,
            trigger,
            state_vars,
            response_vars,
            validation_state,
            address,
            yield_every,
            visited: 0,
            state_update: None,
        }
    }

    /// Resolve the template in place. `definition` is the whole
    /// `["autonomous agent", {...}]` pair.
    pub async fn resolve(&mut self, definition: &mut Value) -> ExecResult<()> {
        self.replace(definition, Slot::Index(1), String::new(), Locals::new())
            .await
    }

    pub fn state_update(&self) -> Option<&StateUpdate> {
        self.state_update.as_ref()
    }

    pub fn into_state_update(self) -> Option<StateUpdate> {
        self.state_update
    }

    /// Template nodes visited so far
    pub fn visited(&self) -> u64 {
        self.visited
    }

    async fn evaluate(
        &mut self,
        formula: &str,
        locals: &mut Locals,
        options: EvalOptions,
    ) -> Result<Value, FormulaError> {
        self.evaluator
            .evaluate(EvalRequest {
                formula,
                trigger: self.trigger,
                locals,
                state_vars: &mut *self.state_vars,
                response_vars: &mut *self.response_vars,
                validation_state: self.validation_state,
                address: self.address,
                conn: &mut *self.conn,
                kv: self.kv,
                response_unit: None,
                options,
            })
            .await
    }

    fn replace<'s>(
        &'s mut self,
        container: &'s mut Value,
        slot: Slot,
        path: String,
        locals: Locals,
    ) -> BoxFuture<'s, ExecResult<()>> {
        async move {
            self.visited += 1;
            if self.yield_every > 0 && self.visited % self.yield_every == 0 {
                tokio::task::yield_now().await;
            }

            if let Slot::Key(name) = &slot {
                if let Some(f) = get_formula(name) {
                    let f = f.to_string();
                    return self.rename_key(container, name.clone(), f, path, locals).await;
                }
            }

            let node = match slot_ref(container, &slot) {
                Some(value) => classify(value),
                None => return Ok(()),
            };

            match node {
                Node::Scalar => Ok(()),
                Node::Formula(f) => {
                    if path == STATE_UPDATE_PATH {
                        if let Some(existing) = &self.state_update {
                            return Err(ExecError::bounce(format!(
                                "second state update formula: {}, existing: {}",
                                f, existing.formula
                            )));
                        }
                        self.state_update = Some(StateUpdate { formula: f, locals });
                        return Ok(());
                    }
                    let mut locals = locals;
                    let res = self
                        .evaluate(&f, &mut locals, EvalOptions::value())
                        .await
                        .map_err(failed(&f))?;
                    if res.as_str() == Some("") {
                        clear_slot(container, &slot);
                    } else {
                        set_slot(container, &slot, res);
                    }
                    Ok(())
                }
                Node::Cases => self.replace_cases(container, slot, path, locals).await,
                Node::Conditional => {
                    self.replace_conditional(container, slot, path, locals)
                        .await
                }
                Node::Array(len) => {
                    for i in 0..len {
                        let Some(items) = slot_mut(container, &slot) else {
                            break;
                        };
                        self.replace(items, Slot::Index(i), path.clone(), locals.clone())
                            .await?;
                    }
                    let now_empty = match slot_mut(container, &slot).and_then(Value::as_array_mut) {
                        Some(items) => {
                            items.retain(|item| !item.is_null());
                            items.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        clear_slot(container, &slot);
                    }
                    Ok(())
                }
                Node::Object(keys) => {
                    for key in keys {
                        let Some(obj) = slot_mut(container, &slot) else {
                            break;
                        };
                        let child_path = format!("{}/{}", path, key);
                        self.replace(obj, Slot::Key(key), child_path, locals.clone())
                            .await?;
                    }
                    let now_empty = slot_ref(container, &slot)
                        .and_then(Value::as_object)
                        .is_some_and(|obj| obj.is_empty());
                    if now_empty {
                        clear_slot(container, &slot);
                    }
                    Ok(())
                }
                Node::Unknown => Err(AaError::UnknownTemplateValue {
                    name: slot.to_string(),
                }
                .into()),
            }
        }
        .boxed()
    }

    /// The key is a formula: its result names the key
    async fn rename_key(
        &mut self,
        container: &mut Value,
        name: String,
        f: String,
        path: String,
        locals: Locals,
    ) -> ExecResult<()> {
        if slot_ref(container, &Slot::Key(name.clone())).is_none() {
            return Ok(());
        }
        let mut key_locals = locals.clone();
        let res = self
            .evaluate(&f, &mut key_locals, EvalOptions::condition())
            .await
            .map_err(failed(&f))?;

        let Some(obj) = container.as_object_mut() else {
            return Ok(());
        };
        let value = obj.shift_remove(&name).unwrap_or(Value::Null);
        let new_name = match res {
            Value::String(s) if s.is_empty() => return Ok(()),
            Value::String(s) => s,
            other => {
                return Err(ExecError::bounce(format!(
                    "result of formula {} is not a string: {}",
                    name,
                    display(&other)
                )))
            }
        };
        if obj.contains_key(&new_name) {
            return Err(ExecError::bounce(format!(
                "duplicate key {} calculated from {}",
                new_name, name
            )));
        }
        if get_formula(&new_name).is_some() {
            return Err(ExecError::bounce(format!(
                "calculated value of {} looks like a formula again: {}",
                name, new_name
            )));
        }
        obj.insert(new_name.clone(), value);
        self.replace(container, Slot::Key(new_name), path, locals)
            .await
    }

    async fn replace_cases(
        &mut self,
        container: &mut Value,
        slot: Slot,
        path: String,
        locals: Locals,
    ) -> ExecResult<()> {
        let cases = slot_ref(container, &slot)
            .and_then(|v| v.get("cases"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut locals = locals;
        let mut chosen = None;
        for case in cases {
            let Some(condition) = case.get("if") else {
                chosen = Some(case);
                break;
            };
            let text = display(condition);
            let f = value_formula(condition)
                .ok_or_else(|| ExecError::bounce(format!("case if is not a formula: {}", text)))?;
            // each case gets its own copy
            let mut case_locals = locals.clone();
            let res = self
                .evaluate(f, &mut case_locals, EvalOptions::condition())
                .await
                .map_err(failed(&text))?;
            if is_truthy(&res) {
                locals = case_locals;
                chosen = Some(case);
                break;
            }
        }

        let Some(case) = chosen else {
            return Err(ExecError::bounce(format!("neither case is true in {}", slot)));
        };
        let replacement = case
            .get(slot.to_string().as_str())
            .filter(|v| is_truthy(v))
            .cloned()
            .ok_or_else(|| AaError::CaseWithoutReplacement {
                name: slot.to_string(),
            })?;
        set_slot(container, &slot, replacement);

        if let Some(init) = case.get("init").filter(|v| is_truthy(v)) {
            let f = value_formula(init).ok_or_else(|| {
                ExecError::bounce(format!("case init is not a formula: {}", display(init)))
            })?;
            self.evaluate(f, &mut locals, EvalOptions::statements())
                .await
                .map_err(failed(f))?;
        }
        self.replace(container, slot, path, locals).await
    }

    async fn replace_conditional(
        &mut self,
        container: &mut Value,
        slot: Slot,
        path: String,
        locals: Locals,
    ) -> ExecResult<()> {
        let (condition, init) = match slot_ref(container, &slot).and_then(Value::as_object) {
            Some(obj) => (
                obj.get("if").and_then(Value::as_str).map(str::to_string),
                obj.get("init").and_then(Value::as_str).map(str::to_string),
            ),
            None => return Ok(()),
        };

        let mut locals = locals;
        if let Some(text) = condition {
            let f = get_formula(&text)
                .ok_or_else(|| ExecError::bounce(format!("if is not a formula: {}", text)))?;
            let res = self
                .evaluate(f, &mut locals, EvalOptions::condition())
                .await
                .map_err(failed(&text))?;
            if !is_truthy(&res) {
                clear_slot(container, &slot);
                return Ok(());
            }
            remove_key(container, &slot, "if");
        }

        if let Some(text) = init {
            let f = get_formula(&text)
                .ok_or_else(|| ExecError::bounce(format!("init is not a formula: {}", text)))?;
            self.evaluate(f, &mut locals, EvalOptions::statements())
                .await
                .map_err(failed(&text))?;
            remove_key(container, &slot, "init");
        }
        self.replace(container, slot, path, locals).await
    }
}
