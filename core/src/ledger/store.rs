//! Storage contract consumed by the engine
//!
//! One [`LedgerConn`] is held for a whole primary trigger and its cascade.
//! Everything it writes between `begin` and `commit` must disappear on
//! `rollback`; the unstable unit cache is process memory and is corrected
//! separately through `forget_unit` / `fix_is_free_after_forgetting`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::unit::{AssetInfo, Unit};

/// Spendable output row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub output_id: u64,
    pub unit: String,
    pub message_index: u32,
    pub output_index: u32,
    pub amount: u64,
    /// Set once the unit is on or below the main chain
    pub main_chain_index: Option<u64>,
    pub latest_included_mc_index: Option<u64>,
    pub level: u64,
}

/// Registered AA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaAddress {
    pub address: String,
    /// Definition JSON text, parsed afresh for every invocation
    pub definition: String,
    pub mci: u64,
}

/// Queued trigger joined with the receiving AA's definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrigger {
    pub mci: u64,
    pub unit: String,
    pub address: String,
    pub definition: String,
}

/// Persisted `aa_responses` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaResponseRow {
    pub mci: u64,
    pub trigger_address: String,
    pub aa_address: String,
    pub trigger_unit: String,
    pub bounced: bool,
    pub response_unit: Option<String>,
    /// JSON text of the response body
    pub response: String,
}

/// Latest AA unit that is not yet on the main chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstableAaUnit {
    pub unit: String,
    pub latest_included_mc_index: u64,
}

/// Connection pool
#[async_trait]
pub trait LedgerDb: Send + Sync {
    async fn connection(&self) -> Result<Box<dyn LedgerConn>>;
}

/// Transactional connection with the queries the engine runs
#[async_trait]
pub trait LedgerConn: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    // ---- units ----

    /// Units flagged on the main chain at `mci`
    async fn mc_units_at(&mut self, mci: u64) -> Result<Vec<String>>;
    async fn read_unit(&mut self, unit: &str) -> Result<Option<Unit>>;

    // ---- AA registry and queue ----

    /// AAs among `addresses` defined at or before `mci`, ordered by address
    async fn aa_definitions(&mut self, addresses: &[String], mci: u64) -> Result<Vec<AaAddress>>;
    /// All queued triggers, ordered by (mci, unit, address)
    async fn pending_triggers(&mut self) -> Result<Vec<PendingTrigger>>;
    async fn delete_trigger(&mut self, mci: u64, unit: &str, address: &str) -> Result<()>;

    // ---- balances ----

    async fn aa_balances(&mut self, address: &str, assets: &[String]) -> Result<Vec<(String, u64)>>;
    async fn add_aa_balance(&mut self, address: &str, asset: &str, delta: i128) -> Result<()>;
    async fn insert_aa_balance(&mut self, address: &str, asset: &str, balance: u64) -> Result<()>;
    /// Zero-balance row unless one exists
    async fn ensure_aa_balance(&mut self, address: &str, asset: &str) -> Result<()>;

    // ---- outputs and issuance ----

    /// Unspent good outputs of `address` in `asset` (None = base) with
    /// main_chain_index <= `max_mci`. Order is not significant.
    async fn stable_outputs(
        &mut self,
        address: &str,
        asset: Option<&str>,
        max_mci: u64,
    ) -> Result<Vec<UnspentOutput>>;

    /// Unspent good outputs of `address` in units authored by AAs that are
    /// above `mci` or not yet on the main chain. Order is not significant.
    async fn unstable_outputs_from_aas(
        &mut self,
        address: &str,
        asset: Option<&str>,
        mci: u64,
    ) -> Result<Vec<UnspentOutput>>;

    async fn is_issued(&mut self, asset: &str) -> Result<bool>;
    async fn max_serial_number(&mut self, asset: &str, address: &str) -> Result<Option<u64>>;

    /// Asset metadata; `Ok(Err(reason))` when the asset cannot be used
    async fn load_asset(
        &mut self,
        asset: &str,
        mci: u64,
        authors: &[String],
    ) -> Result<std::result::Result<AssetInfo, String>>;

    // ---- parent selection ----

    /// Highest-level AA unit whose latest included MC index equals `mci`
    async fn aa_chain_tip(&mut self, mci: u64) -> Result<Option<String>>;
    /// Most recent AA unit above `mci` or not yet on the main chain
    async fn latest_unstable_aa_unit(&mut self, mci: u64) -> Result<Option<UnstableAaUnit>>;

    // ---- responses ----

    async fn insert_aa_response(&mut self, row: &AaResponseRow) -> Result<()>;

    // ---- unstable unit cache ----

    fn unstable_unit(&self, unit: &str) -> Option<Unit>;
    fn forget_unit(&mut self, unit: &str);
    fn fix_is_free_after_forgetting(&mut self, parent_units: &[String]);
}
