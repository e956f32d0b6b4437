//! Response unit composition
//!
//! Turns the resolved message list of an AA into a complete, hashed unit:
//! payments are cleaned up and funded, asset metadata is checked, parents
//! are chosen, and the base payment finally absorbs the unit's own fees.

use serde_json::Value;
use tracing::debug;

use crate::aa::coins::{CoinSelector, ConsumedOutput};
use crate::config::EngineConfig;
use crate::error::{AaError, ExecError, ExecResult, Result};
use crate::ledger::hash::UnitHasher;
use crate::ledger::store::LedgerConn;
use crate::ledger::unit::{
    payment_to_value, Author, Message, PaymentPayload, Unit, BASE_ASSET, HASH_LENGTH,
};

/// Result of composing a response
#[derive(Debug, Clone)]
pub enum Composition {
    /// Nothing left to send; the reason becomes the response error
    Empty(String),
    Unit {
        unit: Unit,
        consumed: Vec<ConsumedOutput>,
        /// Recipients other than the AA itself, in order of appearance
        output_addresses: Vec<String>,
    },
}

/// Composer for units authored by one AA at one MCI
pub struct Composer<'a> {
    hasher: &'a dyn UnitHasher,
    config: &'a EngineConfig,
    address: &'a str,
    mci: u64,
    mc_unit: &'a Unit,
}

impl<'a> Composer<'a> {
    pub fn new(
        hasher: &'a dyn UnitHasher,
        config: &'a EngineConfig,
        address: &'a str,
        mci: u64,
        mc_unit: &'a Unit,
    ) -> Self {
        Self {
            hasher,
            config,
            address,
            mci,
            mc_unit,
        }
    }

    pub async fn compose(
        &self,
        conn: &mut dyn LedgerConn,
        mut messages: Vec<Message>,
    ) -> ExecResult<Composition> {
        for message in messages.iter_mut().filter(|m| m.is_payment()) {
            remove_zero_outputs(message)?;
        }
        messages.retain(|m| !m.is_payment() || has_outputs(m));
        if messages.is_empty() {
            return Ok(Composition::Empty(
                "no messages after removing 0-outputs".to_string(),
            ));
        }

        let mut selector = CoinSelector::new(
            self.address,
            self.mci,
            self.config.execution.min_base_output_amount,
        );
        let mut have_base_payment = false;
        let mut retained = Vec::with_capacity(messages.len());
        for mut message in messages {
            if !message.is_payment() {
                if message.app == "definition" {
                    let address = self.hasher.definition_address(
                        message.payload.get("definition").unwrap_or(&Value::Null),
                    )?;
                    if let Some(payload) = message.payload.as_object_mut() {
                        payload.insert("address".to_string(), Value::String(address));
                    }
                }
                self.complete_message(&mut message)?;
                retained.push(message);
                continue;
            }

            let mut payload: PaymentPayload = serde_json::from_value(message.payload.clone())
                .map_err(|e| ExecError::bounce(format!("bad payment: {}", e)))?;
            if payload.asset.as_deref() == Some(BASE_ASSET) {
                payload.asset = None;
            }
            let Some(asset) = payload.asset.clone() else {
                if have_base_payment {
                    return Err(ExecError::bounce("already have base payment"));
                }
                have_base_payment = true;
                // funded last, once the size of everything else is known
                message.payload = payment_to_value(&payload);
                retained.push(message);
                continue;
            };

            let info = conn
                .load_asset(&asset, self.mci, &[self.address.to_string()])
                .await?
                .map_err(ExecError::Bounce)?;
            if info.fixed_denominations {
                debug!(asset = %asset, "skipping fixed denomination payment");
                continue;
            }
            selector
                .complete_payment(conn, &mut payload, 0, Some(&info))
                .await?;
            message.payload = payment_to_value(&payload);
            self.complete_message(&mut message)?;
            retained.push(message);
        }
        let mut messages = retained;
        if messages.is_empty() {
            return Ok(Composition::Empty(
                "no messages after removing fixed denominations".to_string(),
            ));
        }

        let output_addresses = self.output_addresses(&messages);

        let base_index = match messages
            .iter()
            .position(|m| m.is_payment() && m.payload.get("asset").is_none())
        {
            Some(index) => index,
            None => {
                messages.push(Message::payment(&PaymentPayload::default()));
                messages.len() - 1
            }
        };
        messages[base_index].payload_location = Some("inline".to_string());
        messages[base_index].payload_hash = Some("-".repeat(HASH_LENGTH));

        let mut unit = Unit {
            unit: None,
            version: self.config.protocol.version.clone(),
            alt: self.config.protocol.alt.clone(),
            timestamp: self.mc_unit.timestamp,
            authors: vec![Author::new(self.address)],
            messages,
            parent_units: Vec::new(),
            last_ball: self.mc_unit.last_ball.clone(),
            last_ball_unit: self.mc_unit.last_ball_unit.clone(),
            witness_list_unit: match self.mc_unit.witnesses {
                Some(_) => Some(self.mc_unit.hash().to_string()),
                None => self.mc_unit.witness_list_unit.clone(),
            },
            witnesses: None,
            headers_commission: None,
            payload_commission: None,
        };
        unit.parent_units = self.pick_parents(conn).await?;
        let headers_commission = self.hasher.headers_size(&unit)?;
        let payload_commission = self.hasher.total_payload_size(&unit)?;
        unit.headers_commission = Some(headers_commission);
        unit.payload_commission = Some(payload_commission);
        debug!(
            address = %self.address,
            headers_commission,
            payload_commission,
            "unit before completing bytes payment: {}",
            serde_json::to_string(&unit).unwrap_or_default()
        );

        let mut base_payload: PaymentPayload =
            serde_json::from_value(unit.messages[base_index].payload.clone())
                .map_err(AaError::from)?;
        selector
            .complete_payment(
                conn,
                &mut base_payload,
                headers_commission + payload_commission,
                None,
            )
            .await?;
        unit.messages[base_index].payload = payment_to_value(&base_payload);
        self.complete_message(&mut unit.messages[base_index])?;
        unit.payload_commission = Some(self.hasher.total_payload_size(&unit)?);
        unit.unit = Some(self.hasher.unit_hash(&unit)?);

        Ok(Composition::Unit {
            unit,
            consumed: selector.into_consumed(),
            output_addresses,
        })
    }

    fn complete_message(&self, message: &mut Message) -> Result<()> {
        message.payload_location = Some("inline".to_string());
        message.payload_hash = Some(self.hasher.payload_hash(&message.payload)?);
        Ok(())
    }

    fn output_addresses(&self, messages: &[Message]) -> Vec<String> {
        let mut addresses: Vec<String> = Vec::new();
        for message in messages.iter().filter(|m| m.is_payment()) {
            let Some(outputs) = message.payload.get("outputs").and_then(Value::as_array) else {
                continue;
            };
            for address in outputs
                .iter()
                .filter_map(|o| o.get("address").and_then(Value::as_str))
            {
                if address != self.address && !addresses.iter().any(|a| a == address) {
                    addresses.push(address.to_string());
                }
            }
        }
        addresses
    }

    /// Continue the AA chain of this MCI if there is one, else attach to
    /// the newest unstable AA unit next to the MC unit, else to the MC
    /// unit alone
    async fn pick_parents(&self, conn: &mut dyn LedgerConn) -> Result<Vec<String>> {
        if let Some(tip) = conn.aa_chain_tip(self.mci).await? {
            return Ok(vec![tip]);
        }
        if let Some(latest) = conn.latest_unstable_aa_unit(self.mci).await? {
            if latest.latest_included_mc_index >= self.mci {
                return Err(AaError::LimciAboveMci);
            }
            let mut parents = vec![latest.unit, self.mc_unit.hash().to_string()];
            parents.sort();
            return Ok(parents);
        }
        Ok(vec![self.mc_unit.hash().to_string()])
    }
}

/// Reject negative or fractional amounts, then drop zero outputs
fn remove_zero_outputs(message: &mut Message) -> ExecResult<()> {
    let Some(outputs) = message
        .payload
        .get_mut("outputs")
        .and_then(Value::as_array_mut)
    else {
        return Err(ExecError::bounce("payment without outputs"));
    };
    if !outputs
        .iter()
        .all(|o| o.get("amount").and_then(Value::as_u64).is_some())
    {
        return Err(ExecError::bounce("negative or fractional amounts"));
    }
    outputs.retain(|o| o.get("amount").and_then(Value::as_u64) != Some(0));
    Ok(())
}

fn has_outputs(message: &Message) -> bool {
    message
        .payload
        .get("outputs")
        .and_then(Value::as_array)
        .is_some_and(|outputs| !outputs.is_empty())
}
