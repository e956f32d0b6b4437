use serde::{Deserialize, Serialize};

use crate::aa::state::AaResponse;

/// What one drain did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Primary triggers handled
    pub triggers: usize,
    /// Responses of all cascades, in the order they were recorded
    pub responses: Vec<AaResponse>,
    /// Response units announced as `new_aa_unit`
    pub posted_units: Vec<String>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.triggers == 0
    }

    pub fn bounced(&self) -> usize {
        self.responses.iter().filter(|r| r.bounced).count()
    }
}
