//! A small formula language for templates
//!
//! [`ScriptEvaluator`] understands just enough to drive templates without a
//! full formula engine:
//!
//! - literals: `'text'`, integers, `true`, `false`
//! - reads: `$local`, `trigger.address`, `trigger.unit`,
//!   `trigger.output.<asset>`, `trigger.data.<path>`, `var.<name>`,
//!   `balance.<asset>`, `response_unit`, `this_address`, `mci`
//! - binary `+`, `-`, `*` between reads, left to right
//! - statements separated by `;`: `$x = e`, `var.x = e`, `response.x = e`
//! - `fail` errors, `bounce('reason')` bounces with that reason

use async_trait::async_trait;
use serde_json::{json, Number, Value};

use crate::aa::state::StateValue;
use crate::formula::{EvalRequest, FormulaError, FormulaEvaluator};

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptEvaluator;

#[async_trait]
impl FormulaEvaluator for ScriptEvaluator {
    async fn evaluate(&self, mut request: EvalRequest<'_>) -> std::result::Result<Value, FormulaError> {
        let formula = request.formula.to_string();
        let mut result = Value::Bool(true);
        for statement in statements(&formula) {
            let tokens = tokenize(statement)?;
            result = match tokens.as_slice() {
                [] => continue,
                [target, eq, expr @ ..] if eq == "=" => {
                    let value = expression(&mut request, expr).await?;
                    assign(&mut request, target, value)?;
                    Value::Bool(true)
                }
                expr => expression(&mut request, expr).await?,
            };
        }
        Ok(result)
    }
}

/// Split on `;` outside of string literals
fn statements(formula: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_text = false;
    let mut start = 0;
    for (i, c) in formula.char_indices() {
        match c {
            '\'' => in_text = !in_text,
            ';' if !in_text => {
                out.push(&formula[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&formula[start..]);
    out
}

/// Whitespace separated tokens; a quoted literal stays inside its token
fn tokenize(statement: &str) -> std::result::Result<Vec<String>, FormulaError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    for c in statement.chars() {
        match c {
            '\'' => {
                in_text = !in_text;
                current.push(c);
            }
            c if c.is_whitespace() && !in_text => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_text {
        return Err(FormulaError::new(format!("unterminated string in {}", statement.trim())));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn assign(request: &mut EvalRequest<'_>, target: &str, value: Value) -> std::result::Result<(), FormulaError> {
    if let Some(name) = target.strip_prefix('$') {
        request.locals.insert(name.to_string(), value);
    } else if let Some(name) = target.strip_prefix("response.") {
        request.response_vars.insert(name.to_string(), value);
    } else if let Some(name) = target.strip_prefix("var.") {
        if !request.options.state_var_assignment_allowed {
            return Err(FormulaError::new("state var assignment not allowed"));
        }
        let value = match value {
            Value::Number(n) => StateValue::Number(n),
            Value::String(s) => StateValue::Text(s),
            Value::Bool(b) => StateValue::Bool(b),
            other => return Err(FormulaError::new(format!("cannot store {}", other))),
        };
        request.state_vars.set(request.address, name, value);
    } else {
        return Err(FormulaError::new(format!("cannot assign to {}", target)));
    }
    Ok(())
}

async fn expression(request: &mut EvalRequest<'_>, tokens: &[String]) -> std::result::Result<Value, FormulaError> {
    let Some((first, rest)) = tokens.split_first() else {
        return Err(FormulaError::new("empty expression"));
    };
    let mut value = atom(request, first).await?;
    for pair in rest.chunks(2) {
        let [op, rhs] = pair else {
            return Err(FormulaError::new(format!("missing operand after {}", pair[0])));
        };
        let rhs = atom(request, rhs).await?;
        let (Some(a), Some(b)) = (value.as_i64(), rhs.as_i64()) else {
            return Err(FormulaError::new(format!("non-numeric operands in {}", tokens.join(" "))));
        };
        let computed = match op.as_str() {
            "+" => a.checked_add(b),
            "-" => a.checked_sub(b),
            "*" => a.checked_mul(b),
            other => return Err(FormulaError::new(format!("unknown operator {}", other))),
        };
        value = json!(computed.ok_or_else(|| FormulaError::new("arithmetic overflow"))?);
    }
    Ok(value)
}

async fn atom(request: &mut EvalRequest<'_>, token: &str) -> std::result::Result<Value, FormulaError> {
    if let Some(text) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(Value::String(text.to_string()));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Ok(json!(n));
    }
    if let Some(reason) = token
        .strip_prefix("bounce('")
        .and_then(|t| t.strip_suffix("')"))
    {
        return Err(FormulaError::bounce(reason));
    }
    if let Some(name) = token.strip_prefix('$') {
        return Ok(request.locals.get(name).cloned().unwrap_or(Value::Bool(false)));
    }
    if let Some(asset) = token.strip_prefix("trigger.output.") {
        return Ok(json!(request.trigger.amount(asset)));
    }
    if let Some(path) = token.strip_prefix("trigger.data.") {
        let mut current = request.trigger.data.clone().unwrap_or(Value::Null);
        for part in path.split('.') {
            current = current.get(part).cloned().unwrap_or(Value::Null);
        }
        return Ok(if current.is_null() { Value::Bool(false) } else { current });
    }
    if let Some(name) = token.strip_prefix("var.") {
        let value = request
            .state_vars
            .load(request.kv, request.address, name)
            .await
            .map_err(|e| FormulaError::new(e.to_string()))?;
        return Ok(match value {
            StateValue::Number(n) => Value::Number(n),
            StateValue::Text(s) => Value::String(s),
            StateValue::Bool(b) => Value::Bool(b),
        });
    }
    if let Some(asset) = token.strip_prefix("balance.") {
        return Ok(json!(request.validation_state.balance(request.address, asset)));
    }
    match token {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "trigger.address" => Ok(Value::String(request.trigger.address.clone())),
        "trigger.unit" => Ok(Value::String(request.trigger.unit.clone())),
        "this_address" => Ok(Value::String(request.address.to_string())),
        "mci" => Ok(Value::Number(Number::from(request.validation_state.last_ball_mci))),
        "response_unit" => Ok(request
            .response_unit
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Bool(false))),
        "fail" => Err(FormulaError::new("failure requested")),
        other => Err(FormulaError::new(format!("unknown expression {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::EvalOptions;
    use crate::kv::{KvStore, MemoryKv};
    use crate::test_support::{evaluate, trigger_from};

    #[tokio::test]
    async fn reads_and_arithmetic() {
        let trigger = trigger_from("USER", &[("base", 25_000)], Some(json!({"n": {"k": 4}})));
        let kv = MemoryKv::new();
        let out = evaluate(
            &ScriptEvaluator,
            "trigger.output.base - 5000 * 2",
            &trigger,
            &kv,
            EvalOptions::value(),
        )
        .await;
        assert_eq!(out.result, Ok(json!(40_000)));

        let out = evaluate(&ScriptEvaluator, "trigger.data.n.k", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result, Ok(json!(4)));
        let out = evaluate(&ScriptEvaluator, "trigger.data.missing", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result, Ok(json!(false)));
        let out = evaluate(&ScriptEvaluator, "balance.base", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result, Ok(json!(1_000)));
    }

    #[tokio::test]
    async fn statements_assign_locals_and_response_vars() {
        let trigger = trigger_from("USER", &[], None);
        let out = evaluate(
            &ScriptEvaluator,
            "$a = 'x'; response.r = $a; $a",
            &trigger,
            &MemoryKv::new(),
            EvalOptions::statements(),
        )
        .await;
        assert_eq!(out.result, Ok(json!("x")));
        assert_eq!(out.locals.get("a"), Some(&json!("x")));
        assert_eq!(out.response_vars.get("r"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn state_vars_need_permission() {
        let trigger = trigger_from("USER", &[], None);
        let kv = MemoryKv::new();
        let out = evaluate(&ScriptEvaluator, "var.x = 1", &trigger, &kv, EvalOptions::statements()).await;
        assert!(out.result.is_err());

        let out = evaluate(&ScriptEvaluator, "var.x = 1", &trigger, &kv, EvalOptions::state_update()).await;
        assert!(out.result.is_ok());
        assert_eq!(
            out.state_vars.get("AA", "x").map(|v| v.value.clone()),
            Some(StateValue::Number(1.into()))
        );
    }

    #[tokio::test]
    async fn stored_vars_are_read_through_the_kv_store() {
        let kv = MemoryKv::new();
        let mut batch = kv.batch();
        batch.put(crate::kv::state_var_key("AA", "owner"), "someone");
        kv.write(batch).await.expect("write");

        let trigger = trigger_from("USER", &[], None);
        let out = evaluate(&ScriptEvaluator, "var.owner", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result, Ok(json!("someone")));
    }

    #[tokio::test]
    async fn fail_and_bounce() {
        let trigger = trigger_from("USER", &[], None);
        let kv = MemoryKv::new();
        let out = evaluate(&ScriptEvaluator, "fail", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(
            out.result.expect_err("fails").reason("fail"),
            "formula fail failed: failure requested"
        );
        let out = evaluate(&ScriptEvaluator, "bounce('go away')", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result.expect_err("bounces").reason("x"), "go away");
    }

    #[tokio::test]
    async fn literals_keep_their_spaces_and_semicolons() {
        let trigger = trigger_from("USER", &[], None);
        let kv = MemoryKv::new();
        let out = evaluate(&ScriptEvaluator, "'hello world'", &trigger, &kv, EvalOptions::value()).await;
        assert_eq!(out.result, Ok(json!("hello world")));

        let out = evaluate(
            &ScriptEvaluator,
            "response.message = 'paid; thanks  a lot'; $done = true",
            &trigger,
            &kv,
            EvalOptions::statements(),
        )
        .await;
        assert_eq!(out.result, Ok(json!(true)));
        assert_eq!(out.response_vars.get("message"), Some(&json!("paid; thanks  a lot")));
        assert_eq!(out.locals.get("done"), Some(&json!(true)));

        let out = evaluate(&ScriptEvaluator, "'open ended", &trigger, &kv, EvalOptions::value()).await;
        assert!(out.result.is_err());
    }

    #[tokio::test]
    async fn overflow_is_an_error() {
        let trigger = trigger_from("USER", &[("base", 25_000)], None);
        let kv = MemoryKv::new();
        for formula in [
            "trigger.output.base * 9223372036854775807",
            "9223372036854775807 + 1",
            "-9223372036854775807 - 2",
        ] {
            let out = evaluate(&ScriptEvaluator, formula, &trigger, &kv, EvalOptions::value()).await;
            let err = out.result.expect_err("overflows");
            assert_eq!(err.reason("f"), "formula f failed: arithmetic overflow");
        }
    }

    #[tokio::test]
    async fn dangling_operator_is_an_error() {
        let trigger = trigger_from("USER", &[("base", 25_000)], None);
        let out = evaluate(
            &ScriptEvaluator,
            "trigger.output.base +",
            &trigger,
            &MemoryKv::new(),
            EvalOptions::value(),
        )
        .await;
        assert!(out.result.is_err());
    }
}
