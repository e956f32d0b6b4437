//! Deterministic coin selection and asset issuance
//!
//! Every node must pick exactly the same inputs, so candidate outputs are
//! always sorted here, whatever order the storage layer returns them in:
//! stable outputs by (mci, unit, output_index), then unstable outputs sent
//! by AAs by (latest included mci, level, unit, output_index).

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::{AaError, ExecError, ExecResult};
use crate::ledger::store::{LedgerConn, UnspentOutput};
use crate::ledger::unit::{
    AssetInfo, Input, Output, PaymentPayload, OUTPUT_SIZE, TRANSFER_INPUT_SIZE,
};

/// Output spent by a response unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedOutput {
    pub asset: String,
    pub amount: u64,
}

/// Sort stable candidates into spending order
pub fn sort_stable(rows: &mut [UnspentOutput]) {
    rows.sort_by(|a, b| {
        a.main_chain_index
            .cmp(&b.main_chain_index)
            .then_with(|| a.unit.cmp(&b.unit))
            .then_with(|| a.output_index.cmp(&b.output_index))
    });
}

/// Sort unstable AA-sent candidates into spending order
pub fn sort_unstable(rows: &mut [UnspentOutput]) {
    rows.sort_by(|a, b| {
        a.latest_included_mc_index
            .cmp(&b.latest_included_mc_index)
            .then_with(|| a.level.cmp(&b.level))
            .then_with(|| a.unit.cmp(&b.unit))
            .then_with(|| a.output_index.cmp(&b.output_index))
    });
}

/// Funding state of one payment payload
struct Funding {
    asset: String,
    is_base: bool,
    total: u128,
    target: u128,
    found: bool,
}

/// Coin selector for one response unit
///
/// Outputs picked for one payment are never offered to another payment of
/// the same unit.
pub struct CoinSelector<'a> {
    address: &'a str,
    mci: u64,
    min_base_output_amount: u64,
    used_output_ids: BTreeSet<u64>,
    consumed: Vec<ConsumedOutput>,
}

impl<'a> CoinSelector<'a> {
    pub fn new(address: &'a str, mci: u64, min_base_output_amount: u64) -> Self {
        Self {
            address,
            mci,
            min_base_output_amount,
            used_output_ids: BTreeSet::new(),
            consumed: Vec::new(),
        }
    }

    pub fn consumed(&self) -> &[ConsumedOutput] {
        &self.consumed
    }

    pub fn into_consumed(self) -> Vec<ConsumedOutput> {
        self.consumed
    }

    /// Fill `payload.inputs` so that they cover the outputs plus
    /// `additional_amount`, adding change back to the AA when needed.
    /// Non-base assets fall back to issuance, which needs `asset_info`.
    pub async fn complete_payment(
        &mut self,
        conn: &mut dyn LedgerConn,
        payload: &mut PaymentPayload,
        additional_amount: u64,
        asset_info: Option<&AssetInfo>,
    ) -> ExecResult<()> {
        payload.inputs.clear();
        let mut funding = Funding {
            asset: payload.asset_key().to_string(),
            is_base: payload.is_base(),
            total: 0,
            target: payload.total_output() + additional_amount as u128,
            found: false,
        };
        let asset = payload.asset.clone();

        let mut stable = conn
            .stable_outputs(self.address, asset.as_deref(), self.mci)
            .await?;
        sort_stable(&mut stable);
        self.iterate(&stable, payload, &mut funding)?;
        if funding.found {
            payload.sort_outputs();
            return Ok(());
        }

        let mut unstable = conn
            .unstable_outputs_from_aas(self.address, asset.as_deref(), self.mci)
            .await?;
        sort_unstable(&mut unstable);
        self.iterate(&unstable, payload, &mut funding)?;
        if funding.found {
            payload.sort_outputs();
            return Ok(());
        }

        let Some(asset) = asset else {
            return Err(ExecError::bounce(format!(
                "not enough funds for {} bytes",
                funding.target
            )));
        };
        let issued = match asset_info {
            Some(info) => self.issue(conn, info, payload, &mut funding).await?,
            None => Err(format!("asset {} not loaded", asset)),
        };
        if let Err(reason) = issued {
            warn!(asset = %asset, address = %self.address, "issue failed: {}", reason);
            return Err(ExecError::bounce(format!(
                "not enough funds for {} of asset {}",
                funding.target, asset
            )));
        }
        payload.sort_outputs();
        Ok(())
    }

    fn iterate(
        &mut self,
        rows: &[UnspentOutput],
        payload: &mut PaymentPayload,
        funding: &mut Funding,
    ) -> ExecResult<()> {
        for row in rows {
            if self.used_output_ids.contains(&row.output_id) {
                continue;
            }
            // dust is not worth the input it costs to spend
            if funding.is_base && row.amount < self.min_base_output_amount {
                continue;
            }
            self.used_output_ids.insert(row.output_id);
            self.consumed.push(ConsumedOutput {
                asset: funding.asset.clone(),
                amount: row.amount,
            });
            payload.inputs.push(Input::transfer(
                row.unit.clone(),
                row.message_index,
                row.output_index,
            ));
            funding.total += row.amount as u128;
            if funding.is_base {
                funding.target += TRANSFER_INPUT_SIZE as u128;
            }
            if funding.total < funding.target {
                continue;
            }
            if funding.total == funding.target && !payload.outputs.is_empty() {
                funding.found = true;
                return Ok(());
            }
            let change_cost = if funding.is_base { OUTPUT_SIZE as u128 } else { 0 };
            if funding.total > funding.target + change_cost {
                let change = funding.total - (funding.target + change_cost);
                self.push_change(payload, change, &funding.asset)?;
                funding.found = true;
                return Ok(());
            }
        }
        Ok(())
    }

    /// `Ok(Err(reason))` when the asset cannot be issued to cover the shortfall
    async fn issue(
        &mut self,
        conn: &mut dyn LedgerConn,
        info: &AssetInfo,
        payload: &mut PaymentPayload,
        funding: &mut Funding,
    ) -> ExecResult<std::result::Result<(), String>> {
        if info.issued_by_definer_only && self.address != info.definer_address {
            return Ok(Err("not a definer".to_string()));
        }
        let cap = info.cap.filter(|cap| *cap > 0);
        let issue_amount = match cap {
            Some(cap) => cap as u128,
            None => funding.target - funding.total,
        };
        let serial_number = match cap {
            Some(_) => {
                if conn.is_issued(&info.asset).await? {
                    return Ok(Err("already issued".to_string()));
                }
                1
            }
            None => {
                conn.max_serial_number(&info.asset, self.address)
                    .await?
                    .unwrap_or(0)
                    + 1
            }
        };

        let amount = u64::try_from(issue_amount).map_err(|_| AaError::AmountOverflow {
            asset: info.asset.clone(),
        })?;
        payload.inputs.insert(0, Input::issue(amount, serial_number));
        funding.total += issue_amount;
        if funding.total < funding.target {
            return Ok(Err(format!(
                "issued {} but {} is needed",
                issue_amount, funding.target
            )));
        }
        if funding.total > funding.target {
            let change = funding.total - funding.target;
            self.push_change(payload, change, &funding.asset)?;
        }
        Ok(Ok(()))
    }

    fn push_change(
        &self,
        payload: &mut PaymentPayload,
        change: u128,
        asset: &str,
    ) -> ExecResult<()> {
        let amount = u64::try_from(change).map_err(|_| AaError::AmountOverflow {
            asset: asset.to_string(),
        })?;
        payload.outputs.push(Output {
            address: self.address.to_string(),
            amount,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::store::LedgerDb;

    fn payment(asset: Option<&str>, outputs: &[(&str, u64)]) -> PaymentPayload {
        PaymentPayload {
            asset: asset.map(str::to_string),
            inputs: vec![],
            outputs: outputs
                .iter()
                .map(|(address, amount)| Output {
                    address: address.to_string(),
                    amount: *amount,
                })
                .collect(),
        }
    }

    fn input_units(payload: &PaymentPayload) -> Vec<String> {
        payload
            .inputs
            .iter()
            .map(|i| i.unit.clone().unwrap_or_else(|| "issue".into()))
            .collect()
    }

    #[tokio::test]
    async fn exact_cover_with_change() {
        let ledger = MemoryLedger::new();
        ledger.add_stable_output("AA", None, "U1", 30_000, 5);
        ledger.add_stable_output("AA", None, "U2", 30_000, 6);
        let mut conn = ledger.connection().await.expect("conn");

        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(None, &[("USER", 25_000)]);
        selector
            .complete_payment(conn.as_mut(), &mut payload, 0, None)
            .await
            .expect("funded");

        assert_eq!(input_units(&payload), vec!["U1"]);
        let change: Vec<u64> = payload
            .outputs
            .iter()
            .filter(|o| o.address == "AA")
            .map(|o| o.amount)
            .collect();
        assert_eq!(change, vec![30_000 - 25_000 - TRANSFER_INPUT_SIZE - OUTPUT_SIZE]);
        assert_eq!(selector.consumed().len(), 1);
    }

    #[tokio::test]
    async fn dust_is_skipped_and_stable_order_is_fixed() {
        let ledger = MemoryLedger::new();
        ledger.add_stable_output("AA", None, "UC", 10_000, 3);
        ledger.add_stable_output("AA", None, "UA", 59, 2);
        ledger.add_stable_output("AA", None, "UB", 10_000, 3);
        let mut conn = ledger.connection().await.expect("conn");

        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(None, &[("USER", 12_000)]);
        selector
            .complete_payment(conn.as_mut(), &mut payload, 0, None)
            .await
            .expect("funded");
        // mci 3 ties are broken by unit id
        assert_eq!(input_units(&payload), vec!["UB", "UC"]);
    }

    #[tokio::test]
    async fn unstable_outputs_from_aas_come_second() {
        let ledger = MemoryLedger::new();
        ledger.add_stable_output("AA", None, "S1", 1_000, 1);
        ledger.add_unstable_aa_output("AA", None, "N2", 50_000, 9, 4);
        ledger.add_unstable_aa_output("AA", None, "N1", 50_000, 9, 7);
        let mut conn = ledger.connection().await.expect("conn");

        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(None, &[("USER", 20_000)]);
        selector
            .complete_payment(conn.as_mut(), &mut payload, 0, None)
            .await
            .expect("funded");
        // same limci, lower level first
        assert_eq!(input_units(&payload), vec!["S1", "N2"]);
    }

    #[tokio::test]
    async fn base_shortfall_bounces() {
        let ledger = MemoryLedger::new();
        ledger.add_stable_output("AA", None, "U1", 1_000, 1);
        let mut conn = ledger.connection().await.expect("conn");

        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(None, &[("USER", 5_000)]);
        let err = selector
            .complete_payment(conn.as_mut(), &mut payload, 0, None)
            .await
            .expect_err("short");
        assert_eq!(err.to_string(), "not enough funds for 5060 bytes");
    }

    #[tokio::test]
    async fn uncapped_asset_issues_the_shortfall() {
        let ledger = MemoryLedger::new();
        ledger.add_stable_output("AA", Some("TOKEN"), "U1", 30, 1);
        ledger.add_issue("TOKEN", "AA", 4, 100);
        let mut conn = ledger.connection().await.expect("conn");

        let info = AssetInfo {
            asset: "TOKEN".into(),
            definer_address: "AA".into(),
            is_transferrable: true,
            ..Default::default()
        };
        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(Some("TOKEN"), &[("USER", 100)]);
        selector
            .complete_payment(conn.as_mut(), &mut payload, 0, Some(&info))
            .await
            .expect("issued");

        assert!(payload.inputs[0].is_issue());
        assert_eq!(payload.inputs[0].amount, Some(70));
        assert_eq!(payload.inputs[0].serial_number, Some(5));
        assert_eq!(payload.outputs.len(), 1);
    }

    #[tokio::test]
    async fn capped_asset_issues_once() {
        let ledger = MemoryLedger::new();
        let mut conn = ledger.connection().await.expect("conn");
        let info = AssetInfo {
            asset: "CAPPED".into(),
            cap: Some(1_000),
            definer_address: "AA".into(),
            is_transferrable: true,
            ..Default::default()
        };

        let mut selector = CoinSelector::new("AA", 10, 60);
        let mut payload = payment(Some("CAPPED"), &[("USER", 400)]);
        selector
            .complete_payment(conn.as_mut(), &mut payload, 0, Some(&info))
            .await
            .expect("issued");
        assert_eq!(payload.inputs[0].serial_number, Some(1));
        let change = payload.outputs.iter().find(|o| o.address == "AA").map(|o| o.amount);
        assert_eq!(change, Some(600));

        ledger.add_issue("CAPPED", "AA", 1, 1_000);
        let mut payload = payment(Some("CAPPED"), &[("USER", 400)]);
        let err = CoinSelector::new("AA", 10, 60)
            .complete_payment(conn.as_mut(), &mut payload, 0, Some(&info))
            .await
            .expect_err("already issued");
        assert_eq!(err.to_string(), "not enough funds for 400 of asset CAPPED");
    }

    #[tokio::test]
    async fn definer_only_asset_rejects_other_issuers() {
        let ledger = MemoryLedger::new();
        let mut conn = ledger.connection().await.expect("conn");
        let info = AssetInfo {
            asset: "OWNED".into(),
            issued_by_definer_only: true,
            definer_address: "SOMEONE".into(),
            is_transferrable: true,
            ..Default::default()
        };
        let mut payload = payment(Some("OWNED"), &[("USER", 5)]);
        let err = CoinSelector::new("AA", 10, 60)
            .complete_payment(conn.as_mut(), &mut payload, 0, Some(&info))
            .await
            .expect_err("not a definer");
        assert_eq!(err.to_string(), "not enough funds for 5 of asset OWNED");
    }

    #[tokio::test]
    async fn selection_ignores_storage_order() {
        let build = |reverse: bool| {
            let ledger = MemoryLedger::new();
            let mut rows = vec![("U3", 9_000u64, 2u64), ("U1", 9_000, 2), ("U2", 9_000, 1)];
            if reverse {
                rows.reverse();
            }
            for (unit, amount, mci) in rows {
                ledger.add_stable_output("AA", None, unit, amount, mci);
            }
            ledger
        };
        let mut picks = Vec::new();
        for reverse in [false, true] {
            let ledger = build(reverse);
            let mut conn = ledger.connection().await.expect("conn");
            let mut payload = payment(None, &[("USER", 15_000)]);
            CoinSelector::new("AA", 10, 60)
                .complete_payment(conn.as_mut(), &mut payload, 0, None)
                .await
                .expect("funded");
            picks.push(input_units(&payload));
        }
        assert_eq!(picks[0], vec!["U2", "U1"]);
        assert_eq!(picks[0], picks[1]);
    }
}
