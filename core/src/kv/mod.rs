//! Key-value store and write batches
//!
//! A [`WriteBatch`] buffers puts and deletes for one primary trigger and is
//! written once, after the trigger's cascade settles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Buffered mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Del { key: String },
}

/// Atomic write group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn del(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Del { key: key.into() });
    }

    /// Discard everything buffered so far
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Durable key-value storage
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply all operations of the batch atomically, in order
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    fn batch(&self) -> WriteBatch {
        WriteBatch::new()
    }
}

/// Key of a state variable
pub fn state_var_key(address: &str, var_name: &str) -> String {
    format!("st\n{}\n{}", address, var_name)
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: BTreeMap<String, String>) -> Self {
        Self {
            data: RwLock::new(entries),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    /// Entries whose key starts with `prefix`
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Del { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
