//! Ledger records, hashing and the storage contract

pub mod hash;
pub mod memory;
pub mod store;
pub mod unit;
pub mod validation;

pub use hash::{ObjectHasher, UnitHasher};
pub use memory::{LedgerSnapshot, MemoryLedger, MemoryUnitWriter, MemoryValidator};
pub use store::{LedgerConn, LedgerDb};
pub use unit::{Joint, Message, PaymentPayload, Unit};
pub use validation::{UnitValidator, UnitWriter, ValidationOutcome};
