//! In-memory ledger
//!
//! [`MemoryLedger`] keeps every table behind one mutex. A connection takes a
//! full copy of the tables on `begin` and puts it back on `rollback`, which
//! gives the all-or-nothing behaviour the engine relies on. The unstable
//! unit cache lives outside the tables, like the process-level cache of a
//! real node, and is not touched by rollback.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AaError, Result};
use crate::kv::WriteBatch;
use crate::ledger::hash::{ObjectHasher, UnitHasher};
use crate::ledger::store::{
    AaAddress, AaResponseRow, LedgerConn, LedgerDb, PendingTrigger, UnspentOutput,
    UnstableAaUnit,
};
use crate::ledger::unit::{AssetInfo, Author, Joint, Message, Unit, BASE_ASSET};
use crate::ledger::validation::{AaValidationState, UnitValidator, UnitWriter, ValidationOutcome};

/// Position of a unit in the DAG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProps {
    #[serde(default)]
    pub main_chain_index: Option<u64>,
    #[serde(default)]
    pub is_on_main_chain: bool,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub latest_included_mc_index: Option<u64>,
    #[serde(default)]
    pub level: u64,
}

impl UnitProps {
    /// Stable main chain unit at `mci`
    pub fn main_chain(mci: u64) -> Self {
        Self {
            main_chain_index: Some(mci),
            is_on_main_chain: true,
            is_stable: true,
            latest_included_mc_index: Some(mci.saturating_sub(1)),
            level: mci,
        }
    }

    /// Stable unit off the main chain, included at `mci`
    pub fn stable(mci: u64) -> Self {
        Self {
            main_chain_index: Some(mci),
            is_on_main_chain: false,
            is_stable: true,
            latest_included_mc_index: Some(mci.saturating_sub(1)),
            level: mci,
        }
    }
}

#[derive(Debug, Clone)]
struct UnitRecord {
    unit: Unit,
    props: UnitProps,
    sequence: String,
}

#[derive(Debug, Clone)]
struct OutputRecord {
    output_id: u64,
    unit: String,
    message_index: u32,
    output_index: u32,
    address: String,
    asset: Option<String>,
    amount: u64,
    is_spent: bool,
}

#[derive(Debug, Clone)]
struct IssueRecord {
    asset: String,
    address: String,
    serial_number: u64,
}

#[derive(Debug, Clone, Default)]
struct LedgerTables {
    units: BTreeMap<String, UnitRecord>,
    outputs: Vec<OutputRecord>,
    issues: Vec<IssueRecord>,
    /// asset -> (metadata, mci of the definition)
    assets: BTreeMap<String, (AssetInfo, u64)>,
    aa_addresses: BTreeMap<String, AaAddress>,
    aa_balances: BTreeMap<(String, String), u64>,
    aa_triggers: BTreeSet<(u64, String, String)>,
    aa_responses: Vec<AaResponseRow>,
    next_output_id: u64,
}

impl LedgerTables {
    fn is_aa_unit(&self, record: &UnitRecord, max_aa_mci: u64) -> bool {
        record.unit.authors.iter().any(|author| {
            self.aa_addresses
                .get(&author.address)
                .is_some_and(|aa| aa.mci <= max_aa_mci)
        })
    }

    fn index_outputs(&mut self, unit: &Unit) {
        for (message_index, message) in unit.messages.iter().enumerate() {
            let Some(Ok(payload)) = message.payment_payload() else {
                continue;
            };
            for (output_index, output) in payload.outputs.iter().enumerate() {
                self.next_output_id += 1;
                self.outputs.push(OutputRecord {
                    output_id: self.next_output_id,
                    unit: unit.hash().to_string(),
                    message_index: message_index as u32,
                    output_index: output_index as u32,
                    address: output.address.clone(),
                    asset: payload.asset.clone(),
                    amount: output.amount,
                    is_spent: false,
                });
            }
        }
    }

    fn find_output(&mut self, unit: &str, message_index: u32, output_index: u32) -> Option<&mut OutputRecord> {
        self.outputs.iter_mut().find(|o| {
            o.unit == unit && o.message_index == message_index && o.output_index == output_index
        })
    }

    fn unspent<'a>(
        &'a self,
        address: &'a str,
        asset: Option<&str>,
    ) -> impl Iterator<Item = (&'a OutputRecord, &'a UnitRecord)> + 'a {
        let asset = asset.map(str::to_string);
        self.outputs
            .iter()
            .filter(move |o| o.address == address && o.asset == asset && !o.is_spent)
            .filter_map(move |o| self.units.get(&o.unit).map(|u| (o, u)))
            .filter(|(_, u)| u.sequence == "good")
    }
}

fn to_unspent(output: &OutputRecord, unit: &UnitRecord) -> UnspentOutput {
    UnspentOutput {
        output_id: output.output_id,
        unit: output.unit.clone(),
        message_index: output.message_index,
        output_index: output.output_index,
        amount: output.amount,
        main_chain_index: unit.props.main_chain_index,
        latest_included_mc_index: unit.props.latest_included_mc_index,
        level: unit.props.level,
    }
}

#[derive(Debug, Clone)]
struct CachedUnit {
    unit: Unit,
    is_free: bool,
}

/// Shared in-memory ledger
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    tables: Arc<Mutex<LedgerTables>>,
    cache: Arc<Mutex<BTreeMap<String, CachedUnit>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- seeding ----

    /// Store a unit and index its payment outputs. Unstable units also
    /// enter the unstable unit cache as free units.
    pub fn insert_unit(&self, unit: Unit, props: UnitProps) {
        let mut tables = self.tables.lock();
        tables.index_outputs(&unit);
        if !props.is_stable {
            let mut cache = self.cache.lock();
            for parent in &unit.parent_units {
                if let Some(cached) = cache.get_mut(parent) {
                    cached.is_free = false;
                }
            }
            cache.insert(
                unit.hash().to_string(),
                CachedUnit {
                    unit: unit.clone(),
                    is_free: true,
                },
            );
        }
        tables.units.insert(
            unit.hash().to_string(),
            UnitRecord {
                unit,
                props,
                sequence: "good".to_string(),
            },
        );
    }

    /// Stable single-output unit paying `address`, at `mci`
    pub fn add_stable_output(&self, address: &str, asset: Option<&str>, unit: &str, amount: u64, mci: u64) {
        self.insert_unit(
            payment_unit(unit, "FUNDER", address, asset, amount),
            UnitProps::stable(mci),
        );
    }

    /// Unstable single-output unit paying `address`, authored by an AA
    pub fn add_unstable_aa_output(
        &self,
        address: &str,
        asset: Option<&str>,
        unit: &str,
        amount: u64,
        latest_included_mc_index: u64,
        level: u64,
    ) {
        const SOURCE_AA: &str = "SOURCE_AA";
        self.tables
            .lock()
            .aa_addresses
            .entry(SOURCE_AA.to_string())
            .or_insert_with(|| AaAddress {
                address: SOURCE_AA.to_string(),
                definition: r#"["autonomous agent",{}]"#.to_string(),
                mci: 0,
            });
        self.insert_unit(
            payment_unit(unit, SOURCE_AA, address, asset, amount),
            UnitProps {
                main_chain_index: None,
                is_on_main_chain: false,
                is_stable: false,
                latest_included_mc_index: Some(latest_included_mc_index),
                level,
            },
        );
    }

    pub fn add_issue(&self, asset: &str, address: &str, serial_number: u64, _amount: u64) {
        self.tables.lock().issues.push(IssueRecord {
            asset: asset.to_string(),
            address: address.to_string(),
            serial_number,
        });
    }

    pub fn add_asset(&self, info: AssetInfo, mci: u64) {
        self.tables.lock().assets.insert(info.asset.clone(), (info, mci));
    }

    pub fn add_aa(&self, address: &str, definition: &Value, mci: u64) {
        self.tables.lock().aa_addresses.insert(
            address.to_string(),
            AaAddress {
                address: address.to_string(),
                definition: definition.to_string(),
                mci,
            },
        );
    }

    pub fn add_trigger(&self, mci: u64, unit: &str, address: &str) {
        self.tables
            .lock()
            .aa_triggers
            .insert((mci, unit.to_string(), address.to_string()));
    }

    pub fn set_aa_balance(&self, address: &str, asset: &str, balance: u64) {
        self.tables
            .lock()
            .aa_balances
            .insert((address.to_string(), asset.to_string()), balance);
    }

    // ---- inspection ----

    pub fn aa_balance(&self, address: &str, asset: &str) -> Option<u64> {
        self.tables
            .lock()
            .aa_balances
            .get(&(address.to_string(), asset.to_string()))
            .copied()
    }

    pub fn aa_balances(&self) -> BTreeMap<(String, String), u64> {
        self.tables.lock().aa_balances.clone()
    }

    pub fn responses(&self) -> Vec<AaResponseRow> {
        self.tables.lock().aa_responses.clone()
    }

    pub fn pending_trigger_count(&self) -> usize {
        self.tables.lock().aa_triggers.len()
    }

    pub fn unit(&self, unit: &str) -> Option<Unit> {
        self.tables.lock().units.get(unit).map(|r| r.unit.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.tables.lock().units.len()
    }

    /// Unspent amounts of `address` in `asset`, in storage order
    pub fn unspent_amounts(&self, address: &str, asset: Option<&str>) -> Vec<u64> {
        let tables = self.tables.lock();
        tables.unspent(address, asset).map(|(o, _)| o.amount).collect()
    }

    pub fn is_cached(&self, unit: &str) -> bool {
        self.cache.lock().contains_key(unit)
    }

    pub fn is_free(&self, unit: &str) -> Option<bool> {
        self.cache.lock().get(unit).map(|c| c.is_free)
    }

    /// Build a ledger from a serialized snapshot
    pub fn from_snapshot(snapshot: &LedgerSnapshot) -> Self {
        let ledger = Self::new();
        for entry in &snapshot.units {
            ledger.insert_unit(entry.unit.clone(), entry.props.clone());
        }
        for entry in &snapshot.assets {
            ledger.add_asset(entry.info.clone(), entry.mci);
        }
        for entry in &snapshot.aa_addresses {
            ledger.add_aa(&entry.address, &entry.definition, entry.mci);
        }
        for entry in &snapshot.aa_balances {
            ledger.set_aa_balance(&entry.address, &entry.asset, entry.balance);
        }
        for entry in &snapshot.aa_triggers {
            ledger.add_trigger(entry.mci, &entry.unit, &entry.address);
        }
        ledger
    }
}

fn payment_unit(unit: &str, author: &str, address: &str, asset: Option<&str>, amount: u64) -> Unit {
    let mut payload = serde_json::json!({"outputs": [{"address": address, "amount": amount}]});
    if let Some(asset) = asset.filter(|a| *a != BASE_ASSET) {
        payload["asset"] = Value::String(asset.to_string());
    }
    Unit {
        unit: Some(unit.to_string()),
        version: "4.0".to_string(),
        alt: "1".to_string(),
        authors: vec![Author::new(author)],
        messages: vec![Message::new("payment", payload)],
        ..Default::default()
    }
}

#[async_trait]
impl LedgerDb for MemoryLedger {
    async fn connection(&self) -> Result<Box<dyn LedgerConn>> {
        Ok(Box::new(MemoryConn {
            ledger: self.clone(),
            snapshot: None,
        }))
    }
}

/// Connection over a [`MemoryLedger`]
pub struct MemoryConn {
    ledger: MemoryLedger,
    snapshot: Option<LedgerTables>,
}

#[async_trait]
impl LedgerConn for MemoryConn {
    async fn begin(&mut self) -> Result<()> {
        self.snapshot = Some(self.ledger.tables.lock().clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.snapshot.take() {
            Some(tables) => {
                *self.ledger.tables.lock() = tables;
                Ok(())
            }
            None => Err(AaError::Storage("rollback without transaction".to_string())),
        }
    }

    async fn mc_units_at(&mut self, mci: u64) -> Result<Vec<String>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .units
            .values()
            .filter(|r| r.props.is_on_main_chain && r.props.main_chain_index == Some(mci))
            .map(|r| r.unit.hash().to_string())
            .collect())
    }

    async fn read_unit(&mut self, unit: &str) -> Result<Option<Unit>> {
        Ok(self.ledger.unit(unit))
    }

    async fn aa_definitions(&mut self, addresses: &[String], mci: u64) -> Result<Vec<AaAddress>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .aa_addresses
            .values()
            .filter(|aa| aa.mci <= mci && addresses.contains(&aa.address))
            .cloned()
            .collect())
    }

    async fn pending_triggers(&mut self) -> Result<Vec<PendingTrigger>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .aa_triggers
            .iter()
            .filter_map(|(mci, unit, address)| {
                tables.aa_addresses.get(address).map(|aa| PendingTrigger {
                    mci: *mci,
                    unit: unit.clone(),
                    address: address.clone(),
                    definition: aa.definition.clone(),
                })
            })
            .collect())
    }

    async fn delete_trigger(&mut self, mci: u64, unit: &str, address: &str) -> Result<()> {
        self.ledger
            .tables
            .lock()
            .aa_triggers
            .remove(&(mci, unit.to_string(), address.to_string()));
        Ok(())
    }

    async fn aa_balances(&mut self, address: &str, assets: &[String]) -> Result<Vec<(String, u64)>> {
        let tables = self.ledger.tables.lock();
        Ok(assets
            .iter()
            .filter_map(|asset| {
                tables
                    .aa_balances
                    .get(&(address.to_string(), asset.clone()))
                    .map(|balance| (asset.clone(), *balance))
            })
            .collect())
    }

    async fn add_aa_balance(&mut self, address: &str, asset: &str, delta: i128) -> Result<()> {
        let mut tables = self.ledger.tables.lock();
        // like an UPDATE, a missing row is left alone
        let Some(balance) = tables
            .aa_balances
            .get_mut(&(address.to_string(), asset.to_string()))
        else {
            return Ok(());
        };
        let updated = *balance as i128 + delta;
        if updated < 0 {
            return Err(AaError::NegativeBalance {
                address: address.to_string(),
                asset: asset.to_string(),
            });
        }
        *balance = u64::try_from(updated).map_err(|_| AaError::AmountOverflow {
            asset: asset.to_string(),
        })?;
        Ok(())
    }

    async fn insert_aa_balance(&mut self, address: &str, asset: &str, balance: u64) -> Result<()> {
        let mut tables = self.ledger.tables.lock();
        let key = (address.to_string(), asset.to_string());
        if tables.aa_balances.contains_key(&key) {
            return Err(AaError::Storage(format!(
                "duplicate balance row for {} {}",
                address, asset
            )));
        }
        tables.aa_balances.insert(key, balance);
        Ok(())
    }

    async fn ensure_aa_balance(&mut self, address: &str, asset: &str) -> Result<()> {
        self.ledger
            .tables
            .lock()
            .aa_balances
            .entry((address.to_string(), asset.to_string()))
            .or_insert(0);
        Ok(())
    }

    async fn stable_outputs(
        &mut self,
        address: &str,
        asset: Option<&str>,
        max_mci: u64,
    ) -> Result<Vec<UnspentOutput>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .unspent(address, asset)
            .filter(|(_, u)| u.props.main_chain_index.is_some_and(|m| m <= max_mci))
            .map(|(o, u)| to_unspent(o, u))
            .collect())
    }

    async fn unstable_outputs_from_aas(
        &mut self,
        address: &str,
        asset: Option<&str>,
        mci: u64,
    ) -> Result<Vec<UnspentOutput>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .unspent(address, asset)
            .filter(|(_, u)| u.props.main_chain_index.map_or(true, |m| m > mci))
            .filter(|(_, u)| tables.is_aa_unit(u, u64::MAX))
            .map(|(o, u)| to_unspent(o, u))
            .collect())
    }

    async fn is_issued(&mut self, asset: &str) -> Result<bool> {
        Ok(self.ledger.tables.lock().issues.iter().any(|i| i.asset == asset))
    }

    async fn max_serial_number(&mut self, asset: &str, address: &str) -> Result<Option<u64>> {
        Ok(self
            .ledger
            .tables
            .lock()
            .issues
            .iter()
            .filter(|i| i.asset == asset && i.address == address)
            .map(|i| i.serial_number)
            .max())
    }

    async fn load_asset(
        &mut self,
        asset: &str,
        mci: u64,
        _authors: &[String],
    ) -> Result<std::result::Result<AssetInfo, String>> {
        let tables = self.ledger.tables.lock();
        Ok(match tables.assets.get(asset) {
            None => Err(format!("asset {} not found", asset)),
            Some((_, defined_at)) if *defined_at > mci => {
                Err(format!("asset definition must be before last ball: {}", asset))
            }
            Some((info, _)) => Ok(info.clone()),
        })
    }

    async fn aa_chain_tip(&mut self, mci: u64) -> Result<Option<String>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .units
            .values()
            .filter(|r| r.props.latest_included_mc_index == Some(mci))
            .filter(|r| tables.is_aa_unit(r, mci))
            .max_by_key(|r| (r.props.level, Reverse(r.unit.hash().to_string())))
            .map(|r| r.unit.hash().to_string()))
    }

    async fn latest_unstable_aa_unit(&mut self, mci: u64) -> Result<Option<UnstableAaUnit>> {
        let tables = self.ledger.tables.lock();
        Ok(tables
            .units
            .values()
            .filter(|r| r.props.main_chain_index.map_or(true, |m| m > mci))
            .filter(|r| tables.is_aa_unit(r, mci))
            .max_by_key(|r| {
                (
                    r.props.latest_included_mc_index,
                    r.props.level,
                    Reverse(r.unit.hash().to_string()),
                )
            })
            .map(|r| UnstableAaUnit {
                unit: r.unit.hash().to_string(),
                latest_included_mc_index: r.props.latest_included_mc_index.unwrap_or(0),
            }))
    }

    async fn insert_aa_response(&mut self, row: &AaResponseRow) -> Result<()> {
        self.ledger.tables.lock().aa_responses.push(row.clone());
        Ok(())
    }

    fn unstable_unit(&self, unit: &str) -> Option<Unit> {
        self.ledger.cache.lock().get(unit).map(|c| c.unit.clone())
    }

    fn forget_unit(&mut self, unit: &str) {
        self.ledger.cache.lock().remove(unit);
    }

    fn fix_is_free_after_forgetting(&mut self, parent_units: &[String]) {
        let mut cache = self.ledger.cache.lock();
        for parent in parent_units {
            let has_children = cache
                .values()
                .any(|c| c.unit.parent_units.iter().any(|p| p == parent));
            if let Some(cached) = cache.get_mut(parent) {
                cached.is_free = !has_children;
            }
        }
    }
}

// ============================================================================
// Validator and writer
// ============================================================================

/// Structural and balance checks for AA-authored units
#[derive(Debug, Clone)]
pub struct MemoryValidator {
    ledger: MemoryLedger,
}

impl MemoryValidator {
    pub fn new(ledger: MemoryLedger) -> Self {
        Self { ledger }
    }

    fn check(&self, unit: &Unit) -> Result<ValidationOutcome> {
        let hasher = ObjectHasher;
        let tables = self.ledger.tables.lock();

        let missing: Vec<String> = unit
            .parent_units
            .iter()
            .filter(|p| !tables.units.contains_key(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(ValidationOutcome::NeedParentUnits(missing));
        }

        let reject = |reason: &str| Ok(ValidationOutcome::UnitError(reason.to_string()));

        if unit.unit.as_deref() != Some(hasher.unit_hash(unit)?.as_str()) {
            return reject("wrong unit hash");
        }
        let [author] = unit.authors.as_slice() else {
            return reject("AA unit must have exactly one author");
        };
        if unit.parent_units.is_empty() || !unit.parent_units.windows(2).all(|w| w[0] < w[1]) {
            return reject("parent units not ordered");
        }
        if unit.headers_commission != Some(hasher.headers_size(unit)?) {
            return reject("wrong headers commission");
        }
        if unit.payload_commission != Some(hasher.total_payload_size(unit)?) {
            return reject("wrong payload commission");
        }

        let mut spent = BTreeSet::new();
        let mut base_payments = 0;
        for message in &unit.messages {
            if message.payload_location.as_deref() != Some("inline") {
                return reject("wrong payload location");
            }
            if message.payload_hash.as_deref() != Some(hasher.payload_hash(&message.payload)?.as_str()) {
                return reject("wrong payload hash");
            }
            let Some(parsed) = message.payment_payload() else {
                continue;
            };
            let Ok(payload) = parsed else {
                return reject("malformed payment");
            };
            if payload.is_base() {
                base_payments += 1;
            }
            if payload.outputs.is_empty() || payload.outputs.iter().any(|o| o.amount == 0) {
                return reject("bad outputs");
            }
            let mut sorted = payload.clone();
            sorted.sort_outputs();
            if sorted.outputs != payload.outputs {
                return reject("outputs not sorted");
            }

            let mut input_total: u128 = 0;
            for input in &payload.inputs {
                if input.is_issue() {
                    input_total += input.amount.unwrap_or(0) as u128;
                    continue;
                }
                let (Some(src), Some(mi), Some(oi)) = (&input.unit, input.message_index, input.output_index) else {
                    return reject("bad input");
                };
                if !spent.insert((src.clone(), mi, oi)) {
                    return reject("double spend within unit");
                }
                let found = tables.outputs.iter().find(|o| {
                    o.unit == *src && o.message_index == mi && o.output_index == oi
                });
                match found {
                    Some(o) if !o.is_spent && o.address == author.address && o.asset == payload.asset => {
                        input_total += o.amount as u128;
                    }
                    _ => return reject("input is not an unspent output of the author"),
                }
            }
            let mut required = payload.total_output();
            if payload.is_base() {
                required += unit.headers_commission.unwrap_or(0) as u128
                    + unit.payload_commission.unwrap_or(0) as u128;
            }
            if input_total != required {
                return reject("inputs and outputs do not balance");
            }
        }
        if base_payments != 1 {
            return reject("must have exactly one base payment");
        }

        let mut max_parent_level = 0;
        let mut max_parent_limci = 0;
        for parent in &unit.parent_units {
            if let Some(record) = tables.units.get(parent) {
                max_parent_level = max_parent_level.max(record.props.level);
                let included = if record.props.is_on_main_chain {
                    record.props.main_chain_index
                } else {
                    record.props.latest_included_mc_index
                };
                max_parent_limci = max_parent_limci.max(included.unwrap_or(0));
            }
        }
        let last_ball_mci = unit
            .last_ball_unit
            .as_ref()
            .and_then(|u| tables.units.get(u))
            .and_then(|r| r.props.main_chain_index)
            .unwrap_or(0);

        Ok(ValidationOutcome::Ok(AaValidationState {
            sequence: "good".to_string(),
            last_ball_mci,
            max_parent_level,
            max_parent_limci,
        }))
    }
}

#[async_trait]
impl UnitValidator for MemoryValidator {
    async fn validate(&self, joint: &Joint, _conn: &mut dyn LedgerConn) -> Result<ValidationOutcome> {
        if !joint.aa {
            return Ok(ValidationOutcome::JointError("not an AA joint".to_string()));
        }
        self.check(&joint.unit)
    }
}

/// Writes validated units into a [`MemoryLedger`]
#[derive(Debug, Clone)]
pub struct MemoryUnitWriter {
    ledger: MemoryLedger,
}

impl MemoryUnitWriter {
    pub fn new(ledger: MemoryLedger) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl UnitWriter for MemoryUnitWriter {
    async fn save_joint(
        &self,
        joint: &Joint,
        state: &AaValidationState,
        _conn: &mut dyn LedgerConn,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let unit = &joint.unit;
        let author = unit.first_author().unwrap_or_default().to_string();
        {
            let mut tables = self.ledger.tables.lock();
            for (message_index, message) in unit.messages.iter().enumerate() {
                let Some(parsed) = message.payment_payload() else {
                    continue;
                };
                let payload = parsed.map_err(|e| AaError::Writer(e.to_string()))?;
                for input in &payload.inputs {
                    if input.is_issue() {
                        tables.issues.push(IssueRecord {
                            asset: payload.asset.clone().unwrap_or_default(),
                            address: author.clone(),
                            serial_number: input.serial_number.unwrap_or(0),
                        });
                        continue;
                    }
                    let (Some(src), Some(mi), Some(oi)) = (&input.unit, input.message_index, input.output_index) else {
                        return Err(AaError::Writer(format!(
                            "bad input in message {} of {}",
                            message_index,
                            unit.hash()
                        )));
                    };
                    match tables.find_output(src, mi, oi) {
                        Some(output) => output.is_spent = true,
                        None => return Err(AaError::Writer(format!("output {}:{}:{} not found", src, mi, oi))),
                    }
                }
            }
            tables.index_outputs(unit);
            tables.units.insert(
                unit.hash().to_string(),
                UnitRecord {
                    unit: unit.clone(),
                    props: UnitProps {
                        main_chain_index: None,
                        is_on_main_chain: false,
                        is_stable: false,
                        latest_included_mc_index: Some(state.max_parent_limci),
                        level: state.max_parent_level + 1,
                    },
                    sequence: state.sequence.clone(),
                },
            );
        }

        {
            let mut cache = self.ledger.cache.lock();
            for parent in &unit.parent_units {
                if let Some(cached) = cache.get_mut(parent) {
                    cached.is_free = false;
                }
            }
            cache.insert(
                unit.hash().to_string(),
                CachedUnit {
                    unit: unit.clone(),
                    is_free: true,
                },
            );
        }

        batch.put(format!("j\n{}", unit.hash()), serde_json::to_string(joint)?);
        Ok(())
    }
}

// ============================================================================
// Snapshot format
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotUnit {
    pub unit: Unit,
    #[serde(flatten)]
    pub props: UnitProps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAsset {
    #[serde(flatten)]
    pub info: AssetInfo,
    pub mci: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAa {
    pub address: String,
    pub definition: Value,
    #[serde(default)]
    pub mci: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBalance {
    pub address: String,
    pub asset: String,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTrigger {
    pub mci: u64,
    pub unit: String,
    pub address: String,
}

/// JSON document describing a ledger to replay triggers against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub units: Vec<SnapshotUnit>,
    #[serde(default)]
    pub assets: Vec<SnapshotAsset>,
    #[serde(default)]
    pub aa_addresses: Vec<SnapshotAa>,
    #[serde(default)]
    pub aa_balances: Vec<SnapshotBalance>,
    #[serde(default)]
    pub aa_triggers: Vec<SnapshotTrigger>,
    /// Raw key-value entries, state variables included
    #[serde(default)]
    pub kv: BTreeMap<String, String>,
}
