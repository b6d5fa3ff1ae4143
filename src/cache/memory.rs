//! In-process cache backend.
//!
//! `MemoryCache` keeps entries in a `DashMap` and delivers change callbacks
//! from its own tokio task, fed through an unbounded channel, so a `put`
//! never waits on subscriber code. Every mutation is also encoded in the wire
//! grammar and broadcast to forwarding collaborators (see
//! [`MemoryCache::subscribe_wire`]); lines received from a peer are applied
//! with [`MemoryCache::apply_line`].
//!
//! Must be created inside a tokio runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::protocol::{CacheCodec, CacheMessage, CacheOp};
use super::{CacheBackend, CacheCallback, CacheEntry, CacheUpdate, LockOutcome, SubscriptionId};
use crate::clock::Clock;
use crate::error::{DaqError, DaqResult};

type Key = (String, String);

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires: f64,
}

enum Delivery {
    Update(CacheUpdate),
    Barrier(oneshot::Sender<()>),
}

type SubscriberMap = HashMap<Key, Vec<(SubscriptionId, CacheCallback)>>;

pub struct MemoryCache {
    entries: DashMap<Key, CacheEntry>,
    locks: Mutex<HashMap<String, LockEntry>>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: AtomicU64,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    wire_tx: broadcast::Sender<String>,
    codec: CacheCodec,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::new(RwLock::new(HashMap::new()));
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(delivery_rx, subscribers.clone()));
        let (wire_tx, _) = broadcast::channel(1024);

        Self {
            entries: DashMap::new(),
            locks: Mutex::new(HashMap::new()),
            subscribers,
            next_id: AtomicU64::new(1),
            delivery_tx,
            wire_tx,
            codec: CacheCodec::new(prefix),
            clock,
            online: AtomicBool::new(true),
        }
    }

    /// Stream of encoded wire lines for every local mutation.
    pub fn subscribe_wire(&self) -> broadcast::Receiver<String> {
        self.wire_tx.subscribe()
    }

    /// Apply a line received from a peer. UPDATE acts as `put`, EXPIRE as
    /// `invalidate`; the line is not re-broadcast.
    pub fn apply_line(&self, line: &str) -> DaqResult<()> {
        self.ensure_online()?;
        let msg = self.codec.decode(line)?;
        let key = key(&msg.device, &msg.param);
        match msg.op {
            CacheOp::Update { value } => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        value: value.clone(),
                        timestamp: msg.timestamp,
                        ttl: msg.ttl,
                    },
                );
                self.notify(&msg.device, &msg.param, Some(value), msg.timestamp);
            }
            CacheOp::Expire => {
                self.entries.remove(&key);
                self.notify(&msg.device, &msg.param, None, msg.timestamp);
            }
        }
        Ok(())
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Resolves once every callback queued before this call has run.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.delivery_tx.send(Delivery::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Raw entry, including expired ones.
    pub fn entry(&self, device: &str, param: &str) -> Option<CacheEntry> {
        self.entries.get(&key(device, param)).map(|e| e.value().clone())
    }

    fn ensure_online(&self) -> DaqResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DaqError::Communication("cache is unreachable".into()))
        }
    }

    fn notify(&self, device: &str, param: &str, value: Option<Value>, timestamp: f64) {
        let update = CacheUpdate {
            device: device.to_lowercase(),
            param: param.to_lowercase(),
            value,
            timestamp,
        };
        // Delivery task only stops when the cache is dropped
        let _ = self.delivery_tx.send(Delivery::Update(update));
    }

    fn broadcast(&self, msg: &CacheMessage) {
        if self.wire_tx.receiver_count() == 0 {
            return;
        }
        match self.codec.encode(msg) {
            Ok(line) => {
                let _ = self.wire_tx.send(line);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode cache line"),
        }
    }
}

fn key(device: &str, param: &str) -> Key {
    (device.to_lowercase(), param.to_lowercase())
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>, subscribers: Arc<RwLock<SubscriberMap>>) {
    while let Some(item) = rx.recv().await {
        match item {
            Delivery::Update(update) => {
                let callbacks: Vec<CacheCallback> = subscribers
                    .read()
                    .get(&(update.device.clone(), update.param.clone()))
                    .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
                    .unwrap_or_default();
                for cb in callbacks {
                    cb(&update);
                }
            }
            Delivery::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, device: &str, param: &str, max_age: Option<f64>) -> DaqResult<Option<Value>> {
        self.ensure_online()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .get(&key(device, param))
            .filter(|e| e.is_fresh(now, max_age))
            .map(|e| e.value.clone()))
    }

    async fn get_any(&self, device: &str, param: &str) -> DaqResult<Option<Value>> {
        self.ensure_online()?;
        Ok(self.entries.get(&key(device, param)).map(|e| e.value.clone()))
    }

    async fn put(&self, device: &str, param: &str, value: Value, ttl: Option<f64>) -> DaqResult<()> {
        self.ensure_online()?;
        let timestamp = self.clock.now();
        self.entries.insert(
            key(device, param),
            CacheEntry {
                value: value.clone(),
                timestamp,
                ttl,
            },
        );
        self.broadcast(&CacheMessage::update(
            timestamp,
            ttl,
            device.to_lowercase(),
            param.to_lowercase(),
            value.clone(),
        ));
        self.notify(device, param, Some(value), timestamp);
        Ok(())
    }

    async fn invalidate(&self, device: &str, param: &str) -> DaqResult<()> {
        self.ensure_online()?;
        let timestamp = self.clock.now();
        self.entries.remove(&key(device, param));
        self.broadcast(&CacheMessage::expire(
            timestamp,
            device.to_lowercase(),
            param.to_lowercase(),
        ));
        self.notify(device, param, None, timestamp);
        Ok(())
    }

    async fn try_lock(&self, key: &str, owner: &str, ttl: f64) -> DaqResult<LockOutcome> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock();
        if let Some(held) = locks.get(key) {
            if held.expires > now && held.owner != owner {
                return Ok(LockOutcome::Denied {
                    holder: held.owner.clone(),
                });
            }
        }
        locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires: now + ttl,
            },
        );
        Ok(LockOutcome::Granted)
    }

    async fn unlock(&self, key: &str, owner: &str) -> DaqResult<()> {
        self.ensure_online()?;
        let now = self.clock.now();
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(held) if held.expires > now && held.owner != owner => Err(DaqError::Communication(
                format!("{key}: device locked by other instance ({})", held.owner),
            )),
            _ => {
                locks.remove(key);
                Ok(())
            }
        }
    }

    async fn subscribe(
        &self,
        device: &str,
        param: &str,
        callback: CacheCallback,
    ) -> DaqResult<SubscriptionId> {
        self.ensure_online()?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .entry(key(device, param))
            .or_default()
            .push((id, callback));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> DaqResult<()> {
        let mut subs = self.subscribers.write();
        for list in subs.values_mut() {
            list.retain(|(sid, _)| *sid != id);
        }
        subs.retain(|_, list| !list.is_empty());
        Ok(())
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }
}
