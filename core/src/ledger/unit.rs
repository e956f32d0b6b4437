//! Unit, message and payment records
//!
//! Non-payment payloads stay as raw JSON; payments get a typed view because
//! the composer rewrites their inputs and outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Asset identifier used for the native currency in trigger and balance maps
pub const BASE_ASSET: &str = "base";

/// Bytes added to a payment by one transfer input: unit (44) + message_index (8) + output_index (8)
pub const TRANSFER_INPUT_SIZE: u64 = 44 + 8 + 8;

/// Bytes added by one output: address (32) + amount (8)
pub const OUTPUT_SIZE: u64 = 32 + 8;

/// Length of a base64 SHA-256 hash
pub const HASH_LENGTH: usize = 44;

/// Payment output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Output {
    pub address: String,
    pub amount: u64,
}

/// Payment input: a spent output reference or an issuance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Input {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<u64>,
}

impl Input {
    /// Reference to an existing unspent output
    pub fn transfer(unit: impl Into<String>, message_index: u32, output_index: u32) -> Self {
        Self {
            kind: None,
            unit: Some(unit.into()),
            message_index: Some(message_index),
            output_index: Some(output_index),
            amount: None,
            serial_number: None,
        }
    }

    /// Issuance of new coins of the payment's asset
    pub fn issue(amount: u64, serial_number: u64) -> Self {
        Self {
            kind: Some("issue".to_string()),
            unit: None,
            message_index: None,
            output_index: None,
            amount: Some(amount),
            serial_number: Some(serial_number),
        }
    }

    pub fn is_issue(&self) -> bool {
        self.kind.as_deref() == Some("issue")
    }
}

/// Typed payment payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentPayload {
    /// `None` is the native asset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

impl PaymentPayload {
    /// Asset key as used in trigger and balance maps
    pub fn asset_key(&self) -> &str {
        self.asset.as_deref().unwrap_or(BASE_ASSET)
    }

    pub fn is_base(&self) -> bool {
        self.asset.is_none()
    }

    pub fn total_output(&self) -> u128 {
        self.outputs.iter().map(|o| o.amount as u128).sum()
    }

    /// Deterministic serialization order: address, then amount
    pub fn sort_outputs(&mut self) {
        self.outputs
            .sort_by(|a, b| a.address.cmp(&b.address).then(a.amount.cmp(&b.amount)));
    }
}

/// Unit message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(app: impl Into<String>, payload: Value) -> Self {
        Self {
            app: app.into(),
            payload_location: None,
            payload_hash: None,
            payload,
        }
    }

    pub fn payment(payload: &PaymentPayload) -> Self {
        Self::new("payment", payment_to_value(payload))
    }

    pub fn is_payment(&self) -> bool {
        self.app == "payment"
    }

    /// Typed view of a payment payload
    pub fn payment_payload(&self) -> Option<Result<PaymentPayload, serde_json::Error>> {
        if !self.is_payment() {
            return None;
        }
        Some(serde_json::from_value(self.payload.clone()))
    }
}

pub fn payment_to_value(payload: &PaymentPayload) -> Value {
    // a struct of strings and integers always serializes
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Unit author
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentifiers: Option<Value>,
}

impl Author {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            authentifiers: None,
        }
    }
}

/// Ledger unit
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Unit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub version: String,
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    pub authors: Vec<Author>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_units: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_list_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witnesses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_commission: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_commission: Option<u64>,
}

impl Unit {
    pub fn hash(&self) -> &str {
        self.unit.as_deref().unwrap_or("")
    }

    pub fn first_author(&self) -> Option<&str> {
        self.authors.first().map(|a| a.address.as_str())
    }
}

/// Unit wrapped for validation and storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Joint {
    pub unit: Unit,
    #[serde(default)]
    pub aa: bool,
}

/// Asset metadata needed for spending and issuing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetInfo {
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<u64>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default = "default_true")]
    pub is_transferrable: bool,
    #[serde(default)]
    pub fixed_denominations: bool,
    #[serde(default)]
    pub issued_by_definer_only: bool,
    pub definer_address: String,
}

fn default_true() -> bool {
    true
}
