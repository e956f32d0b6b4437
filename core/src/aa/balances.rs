//! AA balance bookkeeping
//!
//! `aa_balances` tracks what each AA owns per asset. Coins received with a
//! trigger are credited before any formula runs; the net effect of the
//! response unit is applied once the unit is saved.

use std::collections::BTreeMap;

use crate::aa::coins::ConsumedOutput;
use crate::aa::state::ValidationState;
use crate::aa::trigger::Trigger;
use crate::error::{AaError, Result};
use crate::ledger::store::LedgerConn;
use crate::ledger::unit::Unit;

/// Credit the trigger's coins to `address` and mirror the resulting
/// balances into the validation state
pub async fn update_initial_balances(
    conn: &mut dyn LedgerConn,
    address: &str,
    trigger: &Trigger,
    validation_state: &mut ValidationState,
) -> Result<()> {
    let assets: Vec<String> = trigger.outputs.keys().cloned().collect();
    let existing = conn.aa_balances(address, &assets).await?;

    let mut balances = BTreeMap::new();
    for (asset, balance) in &existing {
        let received = trigger.amount(asset);
        conn.add_aa_balance(address, asset, received as i128).await?;
        let total = balance
            .checked_add(received)
            .ok_or_else(|| AaError::AmountOverflow {
                asset: asset.clone(),
            })?;
        balances.insert(asset.clone(), total);
    }
    for (asset, amount) in &trigger.outputs {
        if balances.contains_key(asset) {
            continue;
        }
        conn.insert_aa_balance(address, asset, *amount).await?;
        balances.insert(asset.clone(), *amount);
    }

    validation_state
        .assoc_balances
        .insert(address.to_string(), balances);
    Ok(())
}

/// Apply the net per-asset effect of a response unit authored by `address`
pub async fn update_final_balances(
    conn: &mut dyn LedgerConn,
    address: &str,
    consumed: &[ConsumedOutput],
    unit: &Unit,
) -> Result<()> {
    let mut deltas: BTreeMap<String, i128> = BTreeMap::new();
    for output in consumed {
        *deltas.entry(output.asset.clone()).or_insert(0) -= output.amount as i128;
    }

    // assets the AA issued in this unit have no balance row yet
    let mut new_assets = Vec::new();
    for message in &unit.messages {
        let Some(parsed) = message.payment_payload() else {
            continue;
        };
        let payload = parsed.map_err(|e| AaError::MalformedPayment {
            unit: unit.hash().to_string(),
            reason: e.to_string(),
        })?;
        let asset = payload.asset_key();
        for output in payload.outputs.iter().filter(|o| o.address == address) {
            if !deltas.contains_key(asset) {
                deltas.insert(asset.to_string(), 0);
                new_assets.push(asset.to_string());
            }
            if let Some(delta) = deltas.get_mut(asset) {
                *delta += output.amount as i128;
            }
        }
    }

    for asset in &new_assets {
        conn.ensure_aa_balance(address, asset).await?;
    }
    for (asset, delta) in &deltas {
        if *delta != 0 {
            conn.add_aa_balance(address, asset, *delta).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::store::LedgerDb;
    use crate::ledger::unit::{Author, Message};
    use crate::test_support::trigger_from;
    use serde_json::json;

    #[tokio::test]
    async fn initial_balances_credit_existing_and_new_assets() {
        let ledger = MemoryLedger::new();
        ledger.set_aa_balance("AA", "base", 1_000);
        let mut conn = ledger.connection().await.expect("conn");

        let trigger = trigger_from("USER", &[("base", 20_000), ("TOKEN", 5)], None);
        let mut vs = ValidationState::new(10);
        update_initial_balances(conn.as_mut(), "AA", &trigger, &mut vs)
            .await
            .expect("update");

        assert_eq!(vs.balance("AA", "base"), 21_000);
        assert_eq!(vs.balance("AA", "TOKEN"), 5);
        assert_eq!(ledger.aa_balance("AA", "base"), Some(21_000));
        assert_eq!(ledger.aa_balance("AA", "TOKEN"), Some(5));
    }

    #[tokio::test]
    async fn final_balances_apply_net_delta() {
        let ledger = MemoryLedger::new();
        ledger.set_aa_balance("AA", "base", 50_000);
        let mut conn = ledger.connection().await.expect("conn");

        let unit = Unit {
            unit: Some("RESP".into()),
            authors: vec![Author::new("AA")],
            messages: vec![
                Message::new(
                    "payment",
                    json!({"outputs": [{"address": "AA", "amount": 4_900}, {"address": "USER", "amount": 25_000}]}),
                ),
                Message::new(
                    "payment",
                    json!({"asset": "NEW", "outputs": [{"address": "AA", "amount": 100}]}),
                ),
            ],
            ..Default::default()
        };
        let consumed = vec![ConsumedOutput {
            asset: "base".into(),
            amount: 30_000,
        }];
        update_final_balances(conn.as_mut(), "AA", &consumed, &unit)
            .await
            .expect("update");

        assert_eq!(ledger.aa_balance("AA", "base"), Some(50_000 - 30_000 + 4_900));
        assert_eq!(ledger.aa_balance("AA", "NEW"), Some(100));
    }
}
