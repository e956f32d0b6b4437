//! Per-invocation and per-cascade execution state

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::Result;
use crate::kv::{state_var_key, KvStore, WriteBatch};
use crate::ledger::store::AaResponseRow;

/// Formula-local variables
pub type Locals = serde_json::Map<String, Value>;

/// Values published by `response[...] = ...` assignments
pub type ResponseVars = serde_json::Map<String, Value>;

/// Stored state variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Number(Number),
    Text(String),
    /// `false` marks a deleted variable; `true` is flushed as `1`
    Bool(bool),
}

impl StateValue {
    /// Parse a stored string: numeric text becomes a number
    pub fn from_stored(raw: &str) -> Self {
        match Number::from_str(raw) {
            Ok(n) => StateValue::Number(n),
            Err(_) => StateValue::Text(raw.to_string()),
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, StateValue::Bool(false))
    }

    fn storage_string(&self) -> String {
        match self {
            StateValue::Number(n) => n.to_string(),
            StateValue::Text(s) => s.clone(),
            StateValue::Bool(true) => "1".to_string(),
            StateValue::Bool(false) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateVar {
    pub value: StateValue,
    pub updated: bool,
}

/// State variables touched during one cascade, keyed by AA address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateVars {
    vars: BTreeMap<String, BTreeMap<String, StateVar>>,
}

impl StateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str, name: &str) -> Option<&StateVar> {
        self.vars.get(address).and_then(|vars| vars.get(name))
    }

    /// Assignment by a state-update formula
    pub fn set(&mut self, address: &str, name: &str, value: StateValue) {
        self.vars.entry(address.to_string()).or_default().insert(
            name.to_string(),
            StateVar {
                value,
                updated: true,
            },
        );
    }

    /// Read through to the store on first access
    pub async fn load(
        &mut self,
        kv: &dyn KvStore,
        address: &str,
        name: &str,
    ) -> Result<StateValue> {
        if let Some(var) = self.get(address, name) {
            return Ok(var.value.clone());
        }
        let value = match kv.get(&state_var_key(address, name)).await? {
            Some(raw) => StateValue::from_stored(&raw),
            None => StateValue::Bool(false),
        };
        self.vars.entry(address.to_string()).or_default().insert(
            name.to_string(),
            StateVar {
                value: value.clone(),
                updated: false,
            },
        );
        Ok(value)
    }

    /// Normalize updated values and, when a batch is given, stage them.
    /// Returns the number of updated variables.
    pub fn apply_updates(&mut self, mut batch: Option<&mut WriteBatch>) -> usize {
        let mut count = 0;
        for (address, vars) in self.vars.iter_mut() {
            for (name, var) in vars.iter_mut() {
                if !var.updated {
                    continue;
                }
                count += 1;
                if var.value == StateValue::Bool(true) {
                    var.value = StateValue::Number(Number::from(1));
                }
                let Some(batch) = batch.as_deref_mut() else {
                    continue;
                };
                let key = state_var_key(address, name);
                if var.value.is_deleted() {
                    batch.del(key);
                } else {
                    batch.put(key, var.value.storage_string());
                }
            }
        }
        count
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Scratch context formulas read balances from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationState {
    pub last_ball_mci: u64,
    /// address -> asset -> balance after the trigger's coins arrived
    pub assoc_balances: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ValidationState {
    pub fn new(last_ball_mci: u64) -> Self {
        Self {
            last_ball_mci,
            assoc_balances: BTreeMap::new(),
        }
    }

    pub fn balance(&self, address: &str, asset: &str) -> u64 {
        self.assoc_balances
            .get(address)
            .and_then(|b| b.get(asset))
            .copied()
            .unwrap_or(0)
    }
}

/// Body of an AA response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(rename = "responseVars", default, skip_serializing_if = "Option::is_none")]
    pub response_vars: Option<ResponseVars>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome record of one AA invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaResponse {
    pub mci: u64,
    pub trigger_address: String,
    pub trigger_unit: String,
    pub aa_address: String,
    pub bounced: bool,
    pub response_unit: Option<String>,
    pub response: ResponseBody,
}

impl AaResponse {
    pub fn to_row(&self) -> Result<AaResponseRow> {
        Ok(AaResponseRow {
            mci: self.mci,
            trigger_address: self.trigger_address.clone(),
            aa_address: self.aa_address.clone(),
            trigger_unit: self.trigger_unit.clone(),
            bounced: self.bounced,
            response_unit: self.response_unit.clone(),
            response: serde_json::to_string(&self.response)?,
        })
    }
}
