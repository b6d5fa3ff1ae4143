//! The device session.
//!
//! A [`Session`] bundles the process-wide resources every device shares: the
//! type and device registries, the cache handle, the execution mode and the
//! clocks. It orchestrates the device lifecycle:
//!
//! - **Creation** registers the name, resolves attached devices (creating them
//!   on demand from setup definitions), resolves pre-init parameters, runs the
//!   pre-init hook, resolves the remaining parameters, subscribes to cache
//!   updates and runs the init hook. Any failure unwinds completely.
//! - **Shutdown** refuses while other devices depend on the target; bulk
//!   shutdown goes dependents first.
//! - **Mode switches** are serialized and published as one atomic snapshot.
//! - **Device locks** are named, expiring cache locks with scoped release.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = Session::new(Arc::new(MemoryCache::new(clock.clone(), "daq/")), clock);
//! session.register_type(virtual_motor_type()?)?;
//! let motor = session.create_device("m1", "VirtualMotor", config).await?;
//! motor.maw(json!(10.0)).await?;
//! session.set_mode(ExecutionMode::Simulation).await?;
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheBackend, LockOutcome, MemoryCache};
use crate::clock::{Clock, SimClock, SystemClock};
use crate::config::{CacheConfig, DeviceDefinition, RuntimeConfig};
use crate::device::{Device, DeviceContext, DeviceType, LASTCONFIG_PARAM};
use crate::error::{DaqError, DaqResult};
use crate::mode::{ExecutionMode, ModeContext, ModeSnapshot};
use crate::poller::{self, PollerHandle};
use crate::registry::{DeviceRegistry, Lookup, Reservation, TypeRegistry};

const CYCLIC_ATTACHMENT: &str = "cyclic attachment";

/// Cache key of a device's lock.
pub fn lock_key(device: &str) -> String {
    format!("{}/_lock_", device.to_lowercase())
}

pub struct Session {
    id: Uuid,
    owner: String,
    types: TypeRegistry,
    devices: DeviceRegistry,
    setups: RwLock<HashMap<String, DeviceDefinition>>,
    mode: ModeContext,
    cache: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    sim_clock: Arc<SimClock>,
    transition: tokio::sync::Mutex<()>,
    strict_config: bool,
    cache_config: CacheConfig,
}

impl Session {
    /// New session in `Master` mode with default lock timing.
    pub fn new(cache: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        let id = Uuid::new_v4();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let sim_clock = Arc::new(SimClock::new(clock.now()));
        Self {
            id,
            owner: format!("{host}:{}:{id}", std::process::id()),
            types: TypeRegistry::new(),
            devices: DeviceRegistry::new(),
            setups: RwLock::new(HashMap::new()),
            mode: ModeContext::new(ExecutionMode::Master),
            cache,
            clock,
            sim_clock,
            transition: tokio::sync::Mutex::new(()),
            strict_config: false,
            cache_config: CacheConfig::default(),
        }
    }

    /// Session built from a loaded configuration, with an in-process cache
    /// and the system clock. Must be called inside a tokio runtime.
    pub fn from_config(config: &RuntimeConfig) -> DaqResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(MemoryCache::new(clock.clone(), config.cache.prefix.clone()));
        let session = Self::new(cache, clock)
            .with_mode(config.session.mode)
            .with_strict_config(config.session.strict_config)
            .with_cache_config(config.cache.clone());
        session.load_config(config);
        Ok(session)
    }

    /// Initial mode. Only meaningful before any device exists.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = ModeContext::new(mode);
        self
    }

    pub fn with_strict_config(mut self, strict: bool) -> Self {
        self.strict_config = strict;
        self
    }

    pub fn with_cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    // ===== accessors =====

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lock owner identity: `<hostname>:<pid>:<session uuid>`.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode.current()
    }

    pub fn mode_context(&self) -> &ModeContext {
        &self.mode
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sim_clock(&self) -> &Arc<SimClock> {
        &self.sim_clock
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn register_type(&self, dtype: Arc<DeviceType>) -> DaqResult<()> {
        self.types.register(dtype)
    }

    /// Live device by name.
    pub fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.get(name)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.names()
    }

    // ===== setup definitions =====

    /// Register the `[[devices]]` entries so they can be created on demand.
    pub fn load_config(&self, config: &RuntimeConfig) {
        for def in &config.devices {
            self.define(def.clone());
        }
        info!(count = config.devices.len(), "loaded device setup definitions");
    }

    pub fn define(&self, def: DeviceDefinition) {
        self.setups.write().insert(def.name.to_lowercase(), def);
    }

    /// Live device, created from its setup definition if needed.
    ///
    /// A device another task is creating is awaited rather than created
    /// twice.
    pub fn get_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, DaqResult<Arc<Device>>> {
        self.get_device_for(None, name)
    }

    /// [`get_device`](Self::get_device) on behalf of `requester`, a device
    /// under construction that attaches `name`. Waiting on a construction
    /// that in turn waits on the requester is a `Configuration` error.
    fn get_device_for<'a>(
        &'a self,
        requester: Option<&'a str>,
        name: &'a str,
    ) -> BoxFuture<'a, DaqResult<Arc<Device>>> {
        async move {
            loop {
                let mut done = match self.devices.lookup_for(requester, name) {
                    Lookup::Live(dev) => return Ok(dev),
                    Lookup::Cycle(path) => {
                        return Err(DaqError::config(
                            name,
                            format!("{CYCLIC_ATTACHMENT}: {}", path.join(" -> ")),
                        ))
                    }
                    Lookup::Wait(done) => done,
                    Lookup::Absent => {
                        let def = self
                            .setups
                            .read()
                            .get(&name.to_lowercase())
                            .cloned()
                            .ok_or_else(|| DaqError::config(name, "device not found in setup"))?;
                        match self.try_create(&def.name, &def.r#type, def.config).await? {
                            Creation::Created(dev) => return Ok(dev),
                            Creation::Busy(done) => done,
                        }
                    }
                };
                debug!(device = %name, "waiting for device under construction");
                // closes once the owner publishes or rolls back
                let _ = done.changed().await;
            }
        }
        .boxed()
    }

    // ===== lifecycle =====

    /// Create and initialize a device of registered type `type_name`.
    ///
    /// Fails if another task is creating the same name.
    pub async fn create_device(
        &self,
        name: &str,
        type_name: &str,
        config: Map<String, Value>,
    ) -> DaqResult<Arc<Device>> {
        match self.try_create(name, type_name, config).await? {
            Creation::Created(dev) => Ok(dev),
            Creation::Busy(_) => Err(DaqError::config(name, "device is already being created")),
        }
    }

    async fn try_create(
        &self,
        name: &str,
        type_name: &str,
        config: Map<String, Value>,
    ) -> DaqResult<Creation> {
        let dtype = self.types.get(type_name).ok_or_else(|| {
            DaqError::config(name, format!("unknown device type '{type_name}'"))
        })?;

        let _guard = match self.devices.reserve(name, dtype.is_unique())? {
            Reservation::Busy(done) => return Ok(Creation::Busy(done)),
            Reservation::Fresh(guard) => guard,
            Reservation::Replacing(old, guard) => {
                debug!(device = %name, "replacing non-unique device instance");
                old.unsubscribe_all().await;
                guard
            }
        };

        let device = Arc::new(Device::new(
            name,
            dtype,
            config,
            DeviceContext {
                mode: self.mode.clone(),
                cache: Some(self.cache.clone()),
                clock: self.clock.clone(),
                sim_clock: self.sim_clock.clone(),
            },
        ));

        match self.initialize(&device).await {
            Ok(()) => {
                self.devices.publish(device.clone());
                info!(device = %name, device_type = %type_name, mode = %self.mode(), "device created");
                Ok(Creation::Created(device))
            }
            Err(e) => {
                device.unsubscribe_all().await;
                self.devices.unregister(name);
                warn!(device = %name, error = %e, "device creation failed, rolled back");
                Err(e)
            }
        }
    }

    async fn initialize(&self, device: &Arc<Device>) -> DaqResult<()> {
        let dtype = device.device_type().clone();
        self.check_config_keys(device)?;

        for (aname, spec) in dtype.attachments() {
            let names = spec.resolve(device.name(), aname, device.config().get(aname))?;
            let mut attached = Vec::with_capacity(names.len());
            for name in names {
                let Some(name) = name else {
                    attached.push(None);
                    continue;
                };
                let found = self.get_device_for(Some(device.name()), &name).await;
                self.devices.clear_waiting(device.name());
                let dev = match found {
                    Ok(dev) => dev,
                    Err(e) if spec.tolerate_missing && !e.to_string().contains(CYCLIC_ATTACHMENT) => {
                        warn!(device = %device.name(), attached = %name, error = %e,
                            "attached device could not be created, continuing without it");
                        attached.push(None);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if !dev.device_type().has_capability(&spec.capability) {
                    return Err(DaqError::config(
                        device.name(),
                        format!(
                            "attached device '{aname}' ({}) must provide {}",
                            dev.name(),
                            spec.capability
                        ),
                    ));
                }
                self.devices.add_edge(device.name(), aname, dev.name());
                attached.push(Some(dev));
            }
            device.set_attached(aname, attached);
        }

        if let Some(cache) = device.cache_handle() {
            let last = match cache.get_any(device.name(), LASTCONFIG_PARAM).await? {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            };
            device.set_last_config(last);
        }

        for spec in dtype.params().iter().filter(|p| p.preinit) {
            device.resolve_initial(spec).await?;
        }
        if let Some(hook) = &dtype.pre_init {
            if !device.sim_active() {
                hook(device.clone()).await?;
            }
        }
        for spec in dtype.params().iter().filter(|p| !p.preinit && p.name != "value") {
            device.resolve_initial(spec).await?;
        }
        device.init_limits().await?;

        device.subscribe_updates().await?;
        if let Some(cache) = device.cache_handle() {
            cache
                .put(
                    device.name(),
                    LASTCONFIG_PARAM,
                    Value::Object(device.config().clone()),
                    None,
                )
                .await?;
        }
        if let Some(hook) = &dtype.init {
            if !device.sim_active() {
                hook(device.clone()).await?;
            }
        }
        Ok(())
    }

    fn check_config_keys(&self, device: &Device) -> DaqResult<()> {
        let dtype = device.device_type();
        let strict = self.strict_config || dtype.strict_config();
        for key in device.config().keys() {
            if dtype.param(key).is_some() || dtype.attachment(key).is_some() {
                continue;
            }
            if strict {
                return Err(DaqError::config(
                    device.name(),
                    format!("unknown configuration key '{key}'"),
                ));
            }
            warn!(device = %device.name(), key = %key, "ignoring unknown configuration key");
        }
        Ok(())
    }

    /// Shut down one device. Fails while other live devices use it.
    ///
    /// The shutdown hook is skipped in simulation.
    pub async fn shutdown_device(&self, name: &str) -> DaqResult<()> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| DaqError::config(name, "no such device"))?;
        if let Err(users) = self.devices.can_remove(name) {
            return Err(DaqError::config(
                name,
                format!("cannot shut down, still used by {}", users.join(", ")),
            ));
        }

        if let Some(hook) = &device.device_type().shutdown {
            if !device.sim_active() {
                if let Err(e) = hook(device.clone()).await {
                    warn!(device = %name, error = %e, "error in shutdown hook");
                }
            }
        }
        device.unsubscribe_all().await;
        self.devices.unregister(name);
        info!(device = %name, "device shut down");
        Ok(())
    }

    /// Shut down every live device, dependents first. Returns the first
    /// error after attempting all of them.
    pub async fn shutdown_all(&self) -> DaqResult<()> {
        let mut first_err = None;
        for device in self.devices.dependents_first() {
            if let Err(e) = self.shutdown_device(device.name()).await {
                warn!(device = %device.name(), error = %e, "shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ===== execution mode =====

    /// Switch the process-wide mode.
    ///
    /// On entering simulation every device first captures its last values
    /// while the cache is still reachable.
    pub async fn set_mode(&self, mode: ExecutionMode) -> DaqResult<ModeSnapshot> {
        let _transition = self.transition.lock().await;
        let old = self.mode.current();
        if old == mode {
            return Ok(self.mode.snapshot());
        }
        let devices = self.devices.dependents_first();

        let entering_sim = mode.is_simulation() && !old.is_simulation();
        let leaving_sim = old.is_simulation() && !mode.is_simulation();
        if entering_sim {
            for dev in &devices {
                dev.capture_for_simulation().await;
            }
            self.sim_clock.reset(self.clock.now());
        }

        let snapshot = self.mode.publish(mode);
        for dev in &devices {
            dev.apply_mode(mode);
        }

        if entering_sim {
            for dev in &devices {
                dev.unsubscribe_all().await;
            }
        }
        if leaving_sim {
            for dev in &devices {
                if let Err(e) = dev.subscribe_updates().await {
                    warn!(device = %dev.name(), error = %e, "could not resubscribe to cache updates");
                }
            }
        }
        info!(from = %old, to = %mode, version = snapshot.version, "execution mode switched");
        Ok(snapshot)
    }

    // ===== device locks =====

    /// Take the named cache lock of `name`, retrying until `timeout`
    /// (default `cache.lock_timeout_ms`). No-op in simulation.
    pub async fn lock_device(&self, name: &str, timeout: Option<Duration>) -> DaqResult<()> {
        if self.mode().is_simulation() {
            return Ok(());
        }
        let key = lock_key(name);
        let ttl = self.cache_config.lock_ttl().as_secs_f64();
        let deadline =
            tokio::time::Instant::now() + timeout.unwrap_or(self.cache_config.lock_timeout());
        loop {
            match self.cache.try_lock(&key, &self.owner, ttl).await? {
                LockOutcome::Granted => {
                    debug!(device = %name, owner = %self.owner, "device lock acquired");
                    return Ok(());
                }
                LockOutcome::Denied { holder } => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(DaqError::communication(
                            name,
                            format!("device locked in cache (held by {holder})"),
                        ));
                    }
                    let retry = self.cache_config.lock_retry().min(deadline - now);
                    tokio::time::sleep(retry).await;
                }
            }
        }
    }

    pub async fn unlock_device(&self, name: &str) -> DaqResult<()> {
        if self.mode().is_simulation() {
            return Ok(());
        }
        self.cache.unlock(&lock_key(name), &self.owner).await
    }

    /// Run `f` while holding the device lock of `name`.
    ///
    /// The lock is released on every exit path. If the returned future is
    /// dropped early, release happens on a spawned task.
    pub async fn with_device_lock<F, Fut, T>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> DaqResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DaqResult<T>>,
    {
        let simulated = self.mode().is_simulation();
        self.lock_device(name, timeout).await?;
        let guard = (!simulated).then(|| LockGuard {
            cache: self.cache.clone(),
            key: lock_key(name),
            owner: self.owner.clone(),
            armed: true,
        });

        let result = f().await;
        let released = match guard {
            Some(guard) => guard.release().await,
            None => Ok(()),
        };
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(unlock_err) = released {
                    warn!(device = %name, error = %unlock_err, "failed to release device lock");
                }
                Err(e)
            }
        }
    }

    // ===== polling =====

    /// Keep the cache warm for `name`'s volatile parameters.
    pub fn start_polling(&self, name: &str) -> DaqResult<PollerHandle> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| DaqError::config(name, "no such device"))?;
        Ok(poller::spawn(device, self.mode.clone()))
    }
}

enum Creation {
    Created(Arc<Device>),
    Busy(watch::Receiver<()>),
}

/// Releases a device lock when dropped without an explicit release.
struct LockGuard {
    cache: Arc<dyn CacheBackend>,
    key: String,
    owner: String,
    armed: bool,
}

impl LockGuard {
    async fn release(mut self) -> DaqResult<()> {
        self.armed = false;
        self.cache.unlock(&self.key, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.cache.clone();
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                if let Err(e) = cache.unlock(&key, &owner).await {
                    warn!(key = %key, error = %e, "failed to release abandoned device lock");
                }
            });
        }
    }
}
