//! Shared, time-stamped parameter cache.
//!
//! Every device reads and writes its parameters through a [`CacheBackend`]
//! keyed by `(device, parameter)`. Entries carry a timestamp and an optional
//! time-to-live; callers bound acceptable staleness with a `max_age`.
//!
//! The backend also provides named, expiring locks used to serialize
//! multi-step hardware sequences across processes, and change subscriptions
//! whose callbacks run on a cache-owned delivery task.

pub mod memory;
pub mod protocol;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::DaqResult;

pub use memory::MemoryCache;
pub use protocol::{CacheCodec, CacheMessage, CacheOp};

/// Logical record stored for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub timestamp: f64,
    /// `None` = valid until the next update
    pub ttl: Option<f64>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: f64) -> bool {
        self.ttl.is_some_and(|ttl| now > self.timestamp + ttl)
    }

    /// Unexpired and, if `max_age` is given, no older than it.
    pub fn is_fresh(&self, now: f64, max_age: Option<f64>) -> bool {
        !self.is_expired(now) && max_age.map_or(true, |max| now - self.timestamp <= max)
    }
}

/// Delivered to subscribers. `value` is `None` for an invalidation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    pub device: String,
    pub param: String,
    pub value: Option<Value>,
    pub timestamp: f64,
}

/// Subscriber callback; must return quickly and never perform hardware I/O.
pub type CacheCallback = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Denied { holder: String },
}

/// Contract every cache implementation fulfils.
///
/// All methods fail with `DaqError::Communication` when the store is
/// unreachable.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Value of an unexpired entry, optionally no older than `max_age` seconds.
    async fn get(&self, device: &str, param: &str, max_age: Option<f64>) -> DaqResult<Option<Value>>;

    /// Last stored value regardless of age or TTL.
    async fn get_any(&self, device: &str, param: &str) -> DaqResult<Option<Value>>;

    async fn put(&self, device: &str, param: &str, value: Value, ttl: Option<f64>) -> DaqResult<()>;

    /// Mark the entry absent.
    async fn invalidate(&self, device: &str, param: &str) -> DaqResult<()>;

    /// Try once to take the named lock for `owner`, expiring after `ttl` seconds.
    async fn try_lock(&self, key: &str, owner: &str, ttl: f64) -> DaqResult<LockOutcome>;

    /// Release a lock held by `owner`. Releasing an unheld lock is a no-op.
    async fn unlock(&self, key: &str, owner: &str) -> DaqResult<()>;

    async fn subscribe(
        &self,
        device: &str,
        param: &str,
        callback: CacheCallback,
    ) -> DaqResult<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> DaqResult<()>;

    /// Current time on the cache's clock.
    fn now(&self) -> f64;
}
