//! Shared fixtures for unit and scenario tests

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::aa::orchestrator::{AaServices, Cascade, TriggerOutcome};
use crate::aa::state::{AaResponse, Locals, ResponseVars, StateVars, ValidationState};
use crate::aa::trigger::Trigger;
use crate::config::EngineConfig;
use crate::error::Result;
pub use crate::formula::ScriptEvaluator;
use crate::formula::{EvalOptions, EvalRequest, FormulaError, FormulaEvaluator};
use crate::kv::{KvStore, MemoryKv};
use crate::ledger::hash::ObjectHasher;
use crate::ledger::memory::{MemoryLedger, MemoryUnitWriter, MemoryValidator, UnitProps};
use crate::ledger::store::LedgerDb;
use crate::ledger::unit::{Author, Message, Unit};
use crate::ledger::validation::UnitValidator;

pub fn script_evaluator() -> ScriptEvaluator {
    ScriptEvaluator
}

/// What a single evaluation produced
pub struct Evaluated {
    pub result: std::result::Result<Value, FormulaError>,
    pub locals: Locals,
    pub state_vars: StateVars,
    pub response_vars: ResponseVars,
}

/// Evaluate `formula` for the AA `"AA"` against an empty ledger
pub async fn evaluate(
    evaluator: &dyn FormulaEvaluator,
    formula: &str,
    trigger: &Trigger,
    kv: &MemoryKv,
    options: EvalOptions,
) -> Evaluated {
    let ledger = MemoryLedger::new();
    let mut conn = ledger.connection().await.expect("conn");
    let mut locals = Locals::new();
    let mut state_vars = StateVars::new();
    let mut response_vars = ResponseVars::new();
    let mut validation_state = ValidationState::new(MCI);
    validation_state
        .assoc_balances
        .entry("AA".to_string())
        .or_default()
        .insert("base".to_string(), 1_000);
    let result = evaluator
        .evaluate(EvalRequest {
            formula,
            trigger,
            locals: &mut locals,
            state_vars: &mut state_vars,
            response_vars: &mut response_vars,
            validation_state: &validation_state,
            address: "AA",
            conn: conn.as_mut(),
            kv,
            response_unit: None,
            options,
        })
        .await;
    Evaluated {
        result,
        locals,
        state_vars,
        response_vars,
    }
}

/// Trigger from `address` carrying `outputs` and optional data
pub fn trigger_from(address: &str, outputs: &[(&str, u64)], data: Option<Value>) -> Trigger {
    Trigger {
        address: address.to_string(),
        unit: "TRIGGER".to_string(),
        data,
        outputs: outputs
            .iter()
            .map(|(asset, amount)| (asset.to_string(), *amount))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Address of canonical length, so that composed units balance exactly
pub fn addr(name: &str) -> String {
    format!("{:A<32}", name)
}

/// Unit id of canonical length
pub fn unit_id(name: &str) -> String {
    format!("{:0<44}", name)
}

pub const MCI: u64 = 10;

/// Ledger with one main chain unit at [`MCI`] and engine services over it
pub struct Fixture {
    pub ledger: MemoryLedger,
    pub kv: Arc<MemoryKv>,
    pub services: Arc<AaServices>,
    pub mc_unit: Unit,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let ledger = MemoryLedger::new();
        let kv = Arc::new(MemoryKv::new());

        let last_ball_unit = unit_id("LASTBALL");
        ledger.insert_unit(
            Unit {
                unit: Some(last_ball_unit.clone()),
                version: "4.0".into(),
                alt: "1".into(),
                authors: vec![Author::new(addr("WITNESS"))],
                ..Default::default()
            },
            UnitProps::main_chain(MCI - 1),
        );
        let mc_unit = Unit {
            unit: Some(unit_id("MC")),
            version: "4.0".into(),
            alt: "1".into(),
            timestamp: Some(1_700_000_000),
            authors: vec![Author::new(addr("WITNESS"))],
            parent_units: vec![last_ball_unit.clone()],
            last_ball: Some(unit_id("BALL")),
            last_ball_unit: Some(last_ball_unit),
            witness_list_unit: Some(unit_id("WITNESSES")),
            ..Default::default()
        };
        ledger.insert_unit(mc_unit.clone(), UnitProps::main_chain(MCI));

        let services = Arc::new(AaServices {
            config,
            db: Arc::new(ledger.clone()),
            kv: kv.clone(),
            evaluator: Arc::new(ScriptEvaluator),
            validator: Arc::new(MemoryValidator::new(ledger.clone())),
            writer: Arc::new(MemoryUnitWriter::new(ledger.clone())),
            hasher: Arc::new(ObjectHasher),
        });
        Self {
            ledger,
            kv,
            services,
            mc_unit,
        }
    }

    /// Register an AA with `template` and give it `funds` in stable base outputs
    pub fn deploy(&self, name: &str, template: Value, funds: &[u64]) -> String {
        let address = addr(name);
        self.ledger
            .add_aa(&address, &json!(["autonomous agent", template]), 0);
        for (i, amount) in funds.iter().enumerate() {
            self.ledger.add_stable_output(
                &address,
                None,
                &unit_id(&format!("FUND{}{}", name, i)),
                *amount,
                (i as u64) + 1,
            );
        }
        if !funds.is_empty() {
            self.ledger
                .set_aa_balance(&address, "base", funds.iter().sum());
        }
        address
    }

    /// Stable unit at [`MCI`] from `from` paying `to`; queued as a trigger
    pub fn send(&self, name: &str, from: &str, to: &str, outputs: &[(&str, u64)], data: Option<Value>) -> Unit {
        let mut messages = Vec::new();
        if let Some(data) = data {
            messages.push(Message::new("data", data));
        }
        for (asset, amount) in outputs {
            let mut payload = json!({"outputs": [{"address": to, "amount": amount}]});
            if *asset != "base" {
                payload["asset"] = json!(asset);
            }
            messages.push(Message::new("payment", payload));
        }
        let unit = Unit {
            unit: Some(unit_id(name)),
            version: "4.0".into(),
            alt: "1".into(),
            authors: vec![Author::new(from)],
            messages,
            ..Default::default()
        };
        self.ledger.insert_unit(unit.clone(), UnitProps::stable(MCI));
        self.ledger.add_trigger(MCI, &unit_id(name), to);
        unit
    }

    pub fn with_validator(mut self, validator: Arc<dyn UnitValidator>) -> Self {
        let mut services = (*self.services).clone();
        services.validator = validator;
        self.services = Arc::new(services);
        self
    }

    pub async fn state_var(&self, address: &str, name: &str) -> Option<String> {
        self.kv
            .get(&crate::kv::state_var_key(address, name))
            .await
            .expect("kv get")
    }

    /// Run one primary trigger the way the scheduler does, committing on success
    pub async fn execute(&self, unit: &Unit, address: &str) -> Result<(TriggerOutcome, Vec<AaResponse>)> {
        self.run(unit, address, false).await
    }

    /// Run `unit` as if it were a response unit triggering the secondary at `address`
    pub async fn execute_secondary(&self, unit: &Unit, address: &str) -> Result<(TriggerOutcome, Vec<AaResponse>)> {
        self.run(unit, address, true).await
    }

    async fn run(&self, unit: &Unit, address: &str, is_secondary: bool) -> Result<(TriggerOutcome, Vec<AaResponse>)> {
        let trigger = Trigger::from_unit(unit, address)?;
        let definition = self.definition(address).await?;
        let mut conn = self.ledger.connection().await?;
        conn.begin().await?;
        let mut batch = self.kv.batch();
        let mut state_vars = StateVars::new();
        let mut responses = Vec::new();
        let outcome = {
            let mut cascade = Cascade {
                conn: conn.as_mut(),
                batch: &mut batch,
                state_vars: &mut state_vars,
                responses: &mut responses,
                mci: MCI,
                mc_unit: &self.mc_unit,
            };
            crate::aa::orchestrator::handle_trigger(
                &self.services,
                &mut cascade,
                &trigger,
                &definition,
                address,
                is_secondary,
            )
            .await?
        };
        self.kv.write(batch).await?;
        conn.commit().await?;
        Ok((outcome, responses))
    }

    async fn definition(&self, address: &str) -> Result<Value> {
        let mut conn = self.ledger.connection().await?;
        let rows = conn.aa_definitions(&[address.to_string()], MCI).await?;
        let row = rows.into_iter().next().ok_or_else(|| crate::error::AaError::BadDefinition {
            definition: format!("no AA at {}", address),
        })?;
        Ok(serde_json::from_str(&row.definition)?)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
