//! Trigger extraction
//!
//! A trigger is the view of one ledger unit from the perspective of one
//! receiving address: who sent it, what it paid to that address per asset,
//! and the first data payload it carried.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AaError, Result};
use crate::ledger::unit::Unit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// First author of the triggering unit
    pub address: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Asset ("base" for the native currency) -> amount received
    pub outputs: BTreeMap<String, u64>,
}

impl Trigger {
    /// Build the trigger `unit` represents for `receiving_address`
    pub fn from_unit(unit: &Unit, receiving_address: &str) -> Result<Self> {
        let address = unit
            .first_author()
            .ok_or_else(|| AaError::NoAuthors {
                unit: unit.hash().to_string(),
            })?
            .to_string();

        let mut data = None;
        let mut outputs: BTreeMap<String, u64> = BTreeMap::new();
        for message in &unit.messages {
            if message.app == "data" {
                // later data messages are ignored
                if data.is_none() {
                    data = Some(message.payload.clone());
                }
                continue;
            }
            let Some(parsed) = message.payment_payload() else {
                continue;
            };
            let payload = parsed.map_err(|e| AaError::MalformedPayment {
                unit: unit.hash().to_string(),
                reason: e.to_string(),
            })?;
            let asset = payload.asset_key().to_string();
            for output in payload
                .outputs
                .iter()
                .filter(|o| o.address == receiving_address)
            {
                let total = outputs.entry(asset.clone()).or_insert(0);
                *total = total
                    .checked_add(output.amount)
                    .ok_or_else(|| AaError::AmountOverflow {
                        asset: asset.clone(),
                    })?;
            }
        }

        if outputs.is_empty() {
            return Err(AaError::NoOutputsToAddress {
                address: receiving_address.to_string(),
            });
        }

        Ok(Self {
            address,
            unit: unit.hash().to_string(),
            data,
            outputs,
        })
    }

    pub fn amount(&self, asset: &str) -> u64 {
        self.outputs.get(asset).copied().unwrap_or(0)
    }
}
