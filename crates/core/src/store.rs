//! State store boundary.
//!
//! The store is assumed linearizable with an atomic compare-and-set (an
//! etcd-like backend). Everything the lifecycle state machine guarantees
//! rests on `compare_and_set` being atomic; implementations must not emulate
//! it with a read followed by a separate write.

use serde::{Deserialize, Serialize};

/// One resource's current lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("compare-and-set failed for {key}: expected {expected}, found {actual}")]
    Conflict { key: String, expected: String, actual: String },
    #[error("store backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Fails with `AlreadyExists` when `key` is present.
    async fn create(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Write `new` only if the stored value still equals `expected`.
    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}
