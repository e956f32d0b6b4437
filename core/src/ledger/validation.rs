//! Unit validation and persistence seams

use async_trait::async_trait;

use crate::error::Result;
use crate::kv::WriteBatch;
use crate::ledger::store::LedgerConn;
use crate::ledger::unit::Joint;

/// What the validator learned about an accepted unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AaValidationState {
    /// `good` for serial units
    pub sequence: String,
    pub last_ball_mci: u64,
    /// Maximum level among the parents
    pub max_parent_level: u64,
    /// Maximum latest included MC index among the parents
    pub max_parent_limci: u64,
}

/// Validator verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok(AaValidationState),
    /// The unit breaks a protocol rule; the AA bounces
    UnitError(String),
    JointError(String),
    TransientError(String),
    NeedHashTree,
    NeedParentUnits(Vec<String>),
    OkUnsigned,
}

#[async_trait]
pub trait UnitValidator: Send + Sync {
    async fn validate(&self, joint: &Joint, conn: &mut dyn LedgerConn) -> Result<ValidationOutcome>;
}

#[async_trait]
pub trait UnitWriter: Send + Sync {
    /// Persist a validated joint through `conn`, staging key-value data in
    /// `batch`, and add it to the unstable unit cache
    async fn save_joint(
        &self,
        joint: &Joint,
        state: &AaValidationState,
        conn: &mut dyn LedgerConn,
        batch: &mut WriteBatch,
    ) -> Result<()>;
}
