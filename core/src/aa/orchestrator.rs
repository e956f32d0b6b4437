//! Execution of one AA trigger and its secondary cascade
//!
//! An invocation credits the received coins, checks bounce fees, resolves
//! the template, composes and saves the response unit, runs the deferred
//! state update and records the response. AAs paid by the response are
//! invoked in turn as secondaries. If any secondary bounces, the primary
//! rolls the whole cascade back and bounces itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::aa::balances::{update_final_balances, update_initial_balances};
use crate::aa::composer::{Composer, Composition};
use crate::aa::state::{AaResponse, ResponseBody, ResponseVars, StateVars, ValidationState};
use crate::aa::template::{StateUpdate, TemplateResolver};
use crate::aa::trigger::Trigger;
use crate::config::EngineConfig;
use crate::error::{append_reason, AaError, ExecError, ExecResult, Result};
use crate::formula::{EvalOptions, EvalRequest, FormulaEvaluator};
use crate::kv::{KvStore, WriteBatch};
use crate::ledger::hash::UnitHasher;
use crate::ledger::store::{LedgerConn, LedgerDb};
use crate::ledger::unit::{Joint, Message, Unit, BASE_ASSET};
use crate::ledger::validation::{UnitValidator, UnitWriter, ValidationOutcome};

/// Collaborators shared by every invocation
#[derive(Clone)]
pub struct AaServices {
    pub config: EngineConfig,
    pub db: Arc<dyn LedgerDb>,
    pub kv: Arc<dyn KvStore>,
    pub evaluator: Arc<dyn FormulaEvaluator>,
    pub validator: Arc<dyn UnitValidator>,
    pub writer: Arc<dyn UnitWriter>,
    pub hasher: Arc<dyn UnitHasher>,
}

/// State shared by a primary trigger and all of its secondaries
pub struct Cascade<'c> {
    pub conn: &'c mut dyn LedgerConn,
    pub batch: &'c mut WriteBatch,
    pub state_vars: &'c mut StateVars,
    pub responses: &'c mut Vec<AaResponse>,
    pub mci: u64,
    pub mc_unit: &'c Unit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerOutcome {
    pub response_unit: Option<String>,
    pub bounced: bool,
}

/// Handle `trigger` sent to the AA at `address`
pub fn handle_trigger<'a, 'c: 'a>(
    services: &'a AaServices,
    cascade: &'a mut Cascade<'c>,
    trigger: &'a Trigger,
    definition: &'a Value,
    address: &'a str,
    is_secondary: bool,
) -> BoxFuture<'a, Result<TriggerOutcome>> {
    async move {
        if definition.get(0).and_then(Value::as_str) != Some("autonomous agent") {
            return Err(AaError::BadDefinition {
                definition: definition.to_string(),
            });
        }
        let bounce_fees = bounce_fees(definition, services.config.execution.default_bounce_fee)?;
        let invocation = Invocation {
            services,
            validation_state: ValidationState::new(cascade.mci),
            cascade,
            trigger,
            definition: definition.clone(),
            address,
            is_secondary,
            bounce_fees,
            response_vars: ResponseVars::new(),
            state_update: None,
            error_message: None,
            bouncing: false,
        };
        invocation.execute().await
    }
    .boxed()
}

/// `bounce_fees` of the template, with the base fee always present
fn bounce_fees(definition: &Value, default_base: u64) -> Result<BTreeMap<String, u64>> {
    let mut fees: BTreeMap<String, u64> = match definition.get(1).and_then(|t| t.get("bounce_fees")) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| AaError::BadDefinition {
            definition: definition.to_string(),
        })?,
        None => BTreeMap::new(),
    };
    let base = fees.entry(BASE_ASSET.to_string()).or_insert(0);
    if *base == 0 {
        *base = default_base;
    }
    Ok(fees)
}

struct Invocation<'i, 'c> {
    services: &'i AaServices,
    cascade: &'i mut Cascade<'c>,
    trigger: &'i Trigger,
    /// Private copy, resolved in place
    definition: Value,
    address: &'i str,
    is_secondary: bool,
    bounce_fees: BTreeMap<String, u64>,
    validation_state: ValidationState,
    response_vars: ResponseVars,
    state_update: Option<StateUpdate>,
    error_message: Option<String>,
    bouncing: bool,
}

impl<'i, 'c> Invocation<'i, 'c> {
    async fn execute(mut self) -> Result<TriggerOutcome> {
        match self.run().await {
            Ok(outcome) => Ok(outcome),
            Err(ExecError::Bounce(reason)) => self.bounce(reason).await,
            Err(ExecError::Fatal(err)) => Err(err),
        }
    }

    async fn run(&mut self) -> ExecResult<TriggerOutcome> {
        update_initial_balances(
            &mut *self.cascade.conn,
            self.address,
            self.trigger,
            &mut self.validation_state,
        )
        .await?;

        // checked after the balances so that the coins are kept
        if self.cascade.responses.len() >= self.services.config.execution.max_responses_per_primary_trigger {
            return Err(ExecError::bounce("max number of responses per trigger exceeded"));
        }
        // secondaries never send a bounce, so they need not pay for one
        if !self.is_secondary {
            if let Some(message) = self.bounce_fee_shortfall() {
                debug!(address = %self.address, "{}", message);
                self.error_message = Some(message);
                return Ok(self.finish(None).await?);
            }
        }

        let mut definition = std::mem::take(&mut self.definition);
        self.resolve_template(&mut definition).await?;
        let messages = match definition.get_mut(1).and_then(|t| t.get_mut("messages")) {
            Some(Value::Array(messages)) => std::mem::take(messages),
            _ => return Err(ExecError::bounce("no messages")),
        };

        // drops the state pseudo-message too
        let mut messages: Vec<Value> = messages
            .into_iter()
            .filter(|m| {
                m.get("payload").is_some_and(|payload| {
                    m.get("app").and_then(Value::as_str) != Some("payment")
                        || payload.get("outputs").is_some()
                })
            })
            .collect();
        if messages.is_empty() {
            let reason = "no messages after filtering";
            debug!(address = %self.address, "{}", reason);
            self.error_message = Some(reason.to_string());
            return self.empty_response().await;
        }
        for message in messages.iter_mut() {
            sort_asset_lists(message);
        }
        let messages = messages
            .into_iter()
            .map(serde_json::from_value::<Message>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ExecError::bounce(format!("bad message: {}", e)))?;

        self.send_unit(messages).await
    }

    fn bounce_fee_shortfall(&self) -> Option<String> {
        let base_fee = self.bounce_fees.get(BASE_ASSET).copied().unwrap_or(0);
        if self.trigger.amount(BASE_ASSET) < base_fee {
            return Some("received bytes are not enough to cover bounce fees".to_string());
        }
        self.trigger.outputs.iter().find_map(|(asset, amount)| {
            let fee = self.bounce_fees.get(asset).copied().unwrap_or(0);
            (fee > 0 && *amount < fee)
                .then(|| format!("received {} is not enough to cover bounce fees", asset))
        })
    }

    async fn resolve_template(&mut self, definition: &mut Value) -> ExecResult<()> {
        let mut resolver = TemplateResolver::new(
            self.services.evaluator.as_ref(),
            self.services.kv.as_ref(),
            &mut *self.cascade.conn,
            self.trigger,
            &mut *self.cascade.state_vars,
            &mut self.response_vars,
            &self.validation_state,
            self.address,
            self.services.config.execution.yield_every_nodes,
        );
        resolver.resolve(definition).await?;
        self.state_update = resolver.into_state_update();
        Ok(())
    }

    async fn send_unit(&mut self, messages: Vec<Message>) -> ExecResult<TriggerOutcome> {
        let composition = Composer::new(
            self.services.hasher.as_ref(),
            &self.services.config,
            self.address,
            self.cascade.mci,
            self.cascade.mc_unit,
        )
        .compose(&mut *self.cascade.conn, messages)
        .await?;

        let (unit, consumed, output_addresses) = match composition {
            Composition::Empty(reason) => {
                debug!(address = %self.address, "{}", reason);
                self.error_message = Some(reason);
                return self.empty_response().await;
            }
            Composition::Unit {
                unit,
                consumed,
                output_addresses,
            } => (unit, consumed, output_addresses),
        };
        let response_unit = unit.hash().to_string();

        self.execute_state_update(Some(&response_unit)).await?;
        self.validate_and_save(&unit).await?;
        update_final_balances(&mut *self.cascade.conn, self.address, &consumed, &unit).await?;

        if output_addresses.is_empty() {
            return Ok(self.flush_and_finish(Some(response_unit)).await?);
        }
        if !self.bouncing {
            // later secondaries must see normalized values
            self.cascade.state_vars.apply_updates(None);
        }
        self.add_response(Some(response_unit)).await?;
        self.handle_secondary_triggers(&unit, &output_addresses).await
    }

    async fn handle_secondary_triggers(
        &mut self,
        unit: &Unit,
        output_addresses: &[String],
    ) -> ExecResult<TriggerOutcome> {
        let outcome = TriggerOutcome {
            response_unit: Some(unit.hash().to_string()),
            bounced: self.bouncing,
        };
        let rows = self
            .cascade
            .conn
            .aa_definitions(output_addresses, self.cascade.mci)
            .await?;
        if rows.is_empty() {
            self.flush_state_vars();
            return Ok(outcome);
        }
        if self.bouncing {
            return Err(AaError::SecondaryTriggersWhileBouncing.into());
        }

        let mut secondary_bounced = false;
        for row in &rows {
            let child_trigger = Trigger::from_unit(unit, &row.address)?;
            let child_definition: Value =
                serde_json::from_str(&row.definition).map_err(|_| AaError::BadDefinition {
                    definition: row.definition.clone(),
                })?;
            let child = handle_trigger(
                self.services,
                &mut *self.cascade,
                &child_trigger,
                &child_definition,
                &row.address,
                true,
            )
            .await?;
            if child.bounced {
                secondary_bounced = true;
                break;
            }
        }
        if !secondary_bounced {
            self.flush_state_vars();
            return Ok(outcome);
        }

        // only the primary rolls back
        if self.is_secondary {
            return Err(ExecError::bounce("a sub-secondary AA bounced"));
        }
        self.revert_cascade().await?;
        Err(ExecError::bounce("one of secondary AAs bounced"))
    }

    /// Undo everything the cascade did and start over with a clean
    /// transaction holding only the received coins
    async fn revert_cascade(&mut self) -> Result<()> {
        let response_units: Vec<String> = self
            .cascade
            .responses
            .iter()
            .filter_map(|r| r.response_unit.clone())
            .collect();
        info!(
            address = %self.address,
            trigger_unit = %self.trigger.unit,
            "reverting cascade, forgetting response units {:?}",
            response_units
        );
        if let Some(first) = response_units.first() {
            let parent_units = self
                .cascade
                .conn
                .unstable_unit(first)
                .ok_or_else(|| AaError::UncachedResponseUnit {
                    unit: first.clone(),
                })?
                .parent_units;
            for unit in &response_units {
                self.cascade.conn.forget_unit(unit);
            }
            self.cascade.conn.fix_is_free_after_forgetting(&parent_units);
        }
        self.cascade.responses.clear();
        self.cascade.state_vars.clear();
        self.cascade.batch.clear();

        self.cascade.conn.rollback().await?;
        self.cascade.conn.begin().await?;
        update_initial_balances(
            &mut *self.cascade.conn,
            self.address,
            self.trigger,
            &mut self.validation_state,
        )
        .await
    }

    async fn execute_state_update(&mut self, response_unit: Option<&str>) -> ExecResult<()> {
        if self.bouncing {
            return Ok(());
        }
        let Some(update) = self.state_update.as_ref() else {
            return Ok(());
        };
        let mut locals = update.locals.clone();
        self.services
            .evaluator
            .evaluate(EvalRequest {
                formula: &update.formula,
                trigger: self.trigger,
                locals: &mut locals,
                state_vars: &mut *self.cascade.state_vars,
                response_vars: &mut self.response_vars,
                validation_state: &self.validation_state,
                address: self.address,
                conn: &mut *self.cascade.conn,
                kv: self.services.kv.as_ref(),
                response_unit,
                options: EvalOptions::state_update(),
            })
            .await
            .map_err(|err| ExecError::Bounce(err.reason(&update.formula)))?;
        Ok(())
    }

    /// Nothing to send: the state update still runs and the coins are kept
    async fn empty_response(&mut self) -> ExecResult<TriggerOutcome> {
        match self.execute_state_update(None).await {
            Ok(()) => Ok(self.flush_and_finish(None).await?),
            Err(ExecError::Bounce(reason)) => {
                self.error_message = None;
                Err(ExecError::Bounce(reason))
            }
            Err(fatal) => Err(fatal),
        }
    }

    async fn validate_and_save(&mut self, unit: &Unit) -> ExecResult<()> {
        let joint = Joint {
            unit: unit.clone(),
            aa: true,
        };
        let state = match self
            .services
            .validator
            .validate(&joint, &mut *self.cascade.conn)
            .await?
        {
            ValidationOutcome::Ok(state) => state,
            ValidationOutcome::UnitError(err) => {
                info!(address = %self.address, "AA validation unit error: {}", err);
                return Err(ExecError::Bounce(err));
            }
            ValidationOutcome::JointError(err) => return Err(AaError::JointError(err).into()),
            ValidationOutcome::TransientError(err) => {
                return Err(AaError::TransientError(err).into())
            }
            ValidationOutcome::NeedHashTree => {
                return Err(AaError::UnexpectedValidation("need hash tree".to_string()).into())
            }
            ValidationOutcome::NeedParentUnits(missing) => {
                return Err(AaError::UnexpectedValidation(format!(
                    "dependencies: {}",
                    missing.join(", ")
                ))
                .into())
            }
            ValidationOutcome::OkUnsigned => {
                return Err(AaError::UnexpectedValidation("ok unsigned".to_string()).into())
            }
        };
        if state.sequence != "good" {
            return Err(AaError::NonserialAa.into());
        }
        self.services
            .writer
            .save_joint(&joint, &state, &mut *self.cascade.conn, &mut *self.cascade.batch)
            .await?;
        Ok(())
    }

    /// Stage state var changes. Secondaries only normalize; the primary
    /// writes everything the cascade changed.
    fn flush_state_vars(&mut self) {
        if self.bouncing {
            return;
        }
        let batch = if self.is_secondary {
            None
        } else {
            Some(&mut *self.cascade.batch)
        };
        let updated = self.cascade.state_vars.apply_updates(batch);
        debug!(
            address = %self.address,
            secondary = self.is_secondary,
            "{} state vars updated",
            updated
        );
    }

    async fn flush_and_finish(&mut self, response_unit: Option<String>) -> Result<TriggerOutcome> {
        self.flush_state_vars();
        self.finish(response_unit).await
    }

    async fn finish(&mut self, response_unit: Option<String>) -> Result<TriggerOutcome> {
        if self.bouncing && self.is_secondary {
            if response_unit.is_some() {
                return Err(AaError::ResponseUnitOnBouncedSecondary);
            }
            return Ok(TriggerOutcome {
                response_unit: None,
                bounced: true,
            });
        }
        self.add_response(response_unit.clone()).await?;
        Ok(TriggerOutcome {
            response_unit,
            bounced: self.bouncing,
        })
    }

    async fn add_response(&mut self, response_unit: Option<String>) -> Result<()> {
        let response = ResponseBody {
            response_vars: (!self.bouncing && !self.response_vars.is_empty())
                .then(|| self.response_vars.clone()),
            error: self.error_message.clone().filter(|m| !m.is_empty()),
        };
        let record = AaResponse {
            mci: self.cascade.mci,
            trigger_address: self.trigger.address.clone(),
            trigger_unit: self.trigger.unit.clone(),
            aa_address: self.address.to_string(),
            bounced: self.bouncing,
            response_unit,
            response,
        };
        self.cascade.conn.insert_aa_response(&record.to_row()?).await?;
        self.cascade.responses.push(record);
        Ok(())
    }

    /// Give the received coins back minus the bounce fees. A failure while
    /// bouncing keeps the coins.
    async fn bounce(&mut self, reason: String) -> Result<TriggerOutcome> {
        info!(
            address = %self.address,
            trigger_unit = %self.trigger.unit,
            secondary = self.is_secondary,
            "bouncing with error: {}",
            reason
        );
        self.state_update = None;
        self.error_message = Some(append_reason(self.error_message.as_deref(), &reason));
        if self.bouncing || self.is_secondary {
            self.bouncing = true;
            return self.finish(None).await;
        }
        self.bouncing = true;

        let messages = self.refund_messages();
        if messages.is_empty() {
            return self.finish(None).await;
        }
        match self.send_unit(messages).await {
            Ok(outcome) => Ok(outcome),
            Err(ExecError::Bounce(reason)) => {
                info!(address = %self.address, "refund failed: {}", reason);
                self.error_message = Some(append_reason(self.error_message.as_deref(), &reason));
                self.finish(None).await
            }
            Err(ExecError::Fatal(err)) => Err(err),
        }
    }

    fn refund_messages(&self) -> Vec<Message> {
        self.trigger
            .outputs
            .iter()
            .filter_map(|(asset, amount)| {
                let fee = self.bounce_fees.get(asset).copied().unwrap_or(0);
                (*amount > fee).then(|| {
                    Message::new(
                        "payment",
                        json!({
                            "asset": asset,
                            "outputs": [{"address": self.trigger.address, "amount": amount - fee}]
                        }),
                    )
                })
            })
            .collect()
    }
}

/// Deterministic order for lists an asset definition carries
fn sort_asset_lists(message: &mut Value) {
    let app = message.get("app").and_then(Value::as_str).unwrap_or_default().to_string();
    let Some(payload) = message.get_mut("payload") else {
        return;
    };
    if app == "asset" {
        if let Some(denominations) = payload.get_mut("denominations").and_then(Value::as_array_mut) {
            denominations.sort_by_key(|d| d.get("denomination").and_then(Value::as_u64).unwrap_or(0));
        }
    }
    if app == "asset" || app == "asset_attestors" {
        if let Some(attestors) = payload.get_mut("attestors").and_then(Value::as_array_mut) {
            attestors.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounce_fee_defaults() {
        let fees = bounce_fees(&json!(["autonomous agent", {}]), 10_000).expect("fees");
        assert_eq!(fees.get("base"), Some(&10_000));

        let fees = bounce_fees(
            &json!(["autonomous agent", {"bounce_fees": {"base": 0, "TOKEN": 5}}]),
            10_000,
        )
        .expect("fees");
        assert_eq!(fees.get("base"), Some(&10_000));
        assert_eq!(fees.get("TOKEN"), Some(&5));

        assert!(bounce_fees(&json!(["autonomous agent", {"bounce_fees": "x"}]), 1).is_err());
    }

    #[test]
    fn asset_lists_are_sorted() {
        let mut message = json!({"app": "asset", "payload": {
            "denominations": [{"denomination": 5}, {"denomination": 1}],
            "attestors": ["B", "A"]
        }});
        sort_asset_lists(&mut message);
        assert_eq!(
            message["payload"],
            json!({"denominations": [{"denomination": 1}, {"denomination": 5}], "attestors": ["A", "B"]})
        );
    }
}
