//! Runtime device instances.
//!
//! A [`Device`] is created by the [`Session`](crate::session::Session) from a
//! [`DeviceType`](spec::DeviceType) and a configuration map. Every parameter
//! access goes through the cache-coherent protocol:
//!
//! - `get` prefers a fresh cache entry, re-reads volatile parameters from
//!   hardware on a miss, and otherwise serves the locally held value.
//! - `set` validates, calls the hardware write hook and writes through to the
//!   cache.
//! - Both are gated by the process-wide [`ExecutionMode`]; in simulation the
//!   cache is dropped and hardware is never touched.
//!
//! Reads and writes of the same parameter are serialized by a per-parameter
//! async mutex; different parameters and devices proceed concurrently.
//!
//! Device events go through `tracing` tagged with the device name and are
//! filtered by the device's own `loglevel` parameter.

pub mod format;
pub mod spec;
pub mod status;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::Level;

use crate::cache::{CacheBackend, CacheUpdate, SubscriptionId};
use crate::clock::{Clock, SimClock};
use crate::error::{DaqError, DaqResult};
use crate::logging::DeviceLogLevel;
use crate::mode::{ExecutionMode, ModeContext};
use crate::parameter::ParamSpec;
use crate::validation::{values_equal, InfoCategory};

pub use format::format_value;
pub use spec::{Capability, DeviceType};
pub use status::{DeviceStatus, StatusCode, STATUS_PARAM};

/// Emit a tracing event for `$dev` if its `loglevel` lets `$level` through.
macro_rules! device_event {
    ($dev:expr, $level:expr, $($rest:tt)+) => {
        if $dev.log_enabled($level) {
            tracing::event!($level, device = %$dev.name(), $($rest)+)
        }
    };
}

/// Name under which a device stores the configuration it was created with.
pub const LASTCONFIG_PARAM: &str = "_lastconfig_";

/// Synthetic per-device state tracked while simulating.
#[derive(Debug, Clone, Default)]
pub struct SimState {
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Simulation clock time at which the current movement started
    pub started: Option<f64>,
}

/// Result of waiting for a movement.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub value: Value,
    /// Seconds the movement took (or would have taken, when simulated)
    pub elapsed: f64,
}

/// One line of a device info snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEntry {
    pub category: InfoCategory,
    pub name: String,
    pub formatted: String,
}

/// Everything a device needs from its session.
pub(crate) struct DeviceContext {
    pub mode: ModeContext,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub clock: Arc<dyn Clock>,
    pub sim_clock: Arc<SimClock>,
}

pub struct Device {
    name: String,
    dtype: Arc<DeviceType>,
    config: Map<String, Value>,
    values: RwLock<HashMap<String, Value>>,
    param_locks: HashMap<String, tokio::sync::Mutex<()>>,
    attached: RwLock<BTreeMap<String, Vec<Option<Arc<Device>>>>>,
    mode: ModeContext,
    shared_cache: Option<Arc<dyn CacheBackend>>,
    cache: RwLock<Option<Arc<dyn CacheBackend>>>,
    last_config: RwLock<Option<Map<String, Value>>>,
    sim: Mutex<SimState>,
    clock: Arc<dyn Clock>,
    sim_clock: Arc<SimClock>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    driver: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    /// Reason given to `fix`, cleared by `release`
    fixed: Mutex<Option<String>>,
    log_level: DeviceLogLevel,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("type", &self.dtype.name())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        name: &str,
        dtype: Arc<DeviceType>,
        config: Map<String, Value>,
        ctx: DeviceContext,
    ) -> Self {
        let config = config
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let param_locks = dtype
            .params()
            .iter()
            .map(|p| (p.name.clone(), tokio::sync::Mutex::new(())))
            .collect();
        let cache = if ctx.mode.current().uses_cache() {
            ctx.cache.clone()
        } else {
            None
        };
        Self {
            name: name.to_string(),
            dtype,
            config,
            values: RwLock::new(HashMap::new()),
            param_locks,
            attached: RwLock::new(BTreeMap::new()),
            mode: ctx.mode,
            shared_cache: ctx.cache,
            cache: RwLock::new(cache),
            last_config: RwLock::new(None),
            sim: Mutex::new(SimState::default()),
            clock: ctx.clock,
            sim_clock: ctx.sim_clock,
            subscriptions: Mutex::new(Vec::new()),
            driver: RwLock::new(None),
            fixed: Mutex::new(None),
            log_level: DeviceLogLevel::default(),
        }
    }

    // ===== identity & wiring =====

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> &Arc<DeviceType> {
        &self.dtype
    }

    /// Lower-cased configuration map the device was created with.
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode.current()
    }

    /// Simulation replaces hardware access only for hardware devices.
    pub fn sim_active(&self) -> bool {
        self.mode().is_simulation() && self.dtype.hardware_access()
    }

    /// All devices attached under `aname`, in configured order.
    pub fn attached(&self, aname: &str) -> Vec<Option<Arc<Device>>> {
        self.attached.read().get(aname).cloned().unwrap_or_default()
    }

    /// Device at position `idx` of slot `aname`; `None` past the configured length.
    pub fn attached_at(&self, aname: &str, idx: usize) -> Option<Arc<Device>> {
        self.attached
            .read()
            .get(aname)
            .and_then(|devs| devs.get(idx).cloned().flatten())
    }

    pub fn attached_one(&self, aname: &str) -> Option<Arc<Device>> {
        self.attached_at(aname, 0)
    }

    pub(crate) fn set_attached(&self, aname: &str, devices: Vec<Option<Arc<Device>>>) {
        self.attached.write().insert(aname.to_string(), devices);
    }

    /// Names of all devices this device is attached to.
    pub fn attached_names(&self) -> Vec<String> {
        self.attached
            .read()
            .values()
            .flatten()
            .flatten()
            .map(|d| d.name.clone())
            .collect()
    }

    /// Install per-instance driver state for the hooks to use.
    pub fn set_driver<T: Any + Send + Sync>(&self, driver: Arc<T>) {
        *self.driver.write() = Some(driver);
    }

    pub fn driver<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.driver.read().clone()?.downcast::<T>().ok()
    }

    /// Driver state, or a `Programming` error if none of that type is installed.
    pub fn require_driver<T: Any + Send + Sync>(&self) -> DaqResult<Arc<T>> {
        self.driver::<T>().ok_or_else(|| {
            DaqError::Programming(format!("{}: driver state not initialized", self.name))
        })
    }

    pub fn sim_state(&self) -> SimState {
        self.sim.lock().clone()
    }

    /// Cache reference, absent while the published mode bypasses the cache.
    pub(crate) fn cache_handle(&self) -> Option<Arc<dyn CacheBackend>> {
        self.cache
            .read()
            .clone()
            .filter(|_| self.mode().uses_cache())
    }

    pub(crate) fn set_last_config(&self, last: Option<Map<String, Value>>) {
        *self.last_config.write() = last;
    }

    // ===== local values =====

    fn spec(&self, param: &str) -> DaqResult<&ParamSpec> {
        self.dtype.param(param).ok_or_else(|| {
            DaqError::config(&self.name, format!("device has no parameter '{param}'"))
        })
    }

    /// Locally held value, without consulting cache or hardware.
    pub fn local(&self, param: &str) -> Option<Value> {
        self.values.read().get(param).cloned()
    }

    pub(crate) fn store_local(&self, param: &str, value: Value) {
        if param == "loglevel" {
            self.log_level.set_from_param(&value);
        }
        self.values.write().insert(param.to_string(), value);
    }

    /// Whether the device's `loglevel` lets events at `level` through.
    pub fn log_enabled(&self, level: Level) -> bool {
        self.log_level.enabled(level)
    }

    fn local_f64(&self, param: &str) -> Option<f64> {
        self.local(param).and_then(|v| v.as_f64())
    }

    /// TTL for values read from hardware: the `maxage` parameter.
    fn cache_ttl(&self) -> Option<f64> {
        self.local_f64("maxage")
    }

    async fn lock_param(&self, param: &str) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match self.param_locks.get(param) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    // ===== cache-coherent access =====

    /// Read `param`, accepting a cached value no older than `max_age` seconds.
    ///
    /// `max_age = None` accepts any unexpired cache entry; `Some(0.0)` forces a
    /// hardware read for volatile parameters.
    pub async fn get(self: &Arc<Self>, param: &str, max_age: Option<f64>) -> DaqResult<Value> {
        let param = param.to_lowercase();
        let spec = self.spec(&param)?;

        if self.sim_active() {
            if param == "value" {
                if let Some(v) = self.sim.lock().value.clone() {
                    return Ok(v);
                }
            }
            if let Some(v) = self.local(&param) {
                return Ok(v);
            }
            return self.resolve_initial(spec).await;
        }

        let cache = self.cache_handle();
        if max_age != Some(0.0) {
            if let Some(cache) = &cache {
                if let Some(v) = cache.get(&self.name, &param, max_age).await? {
                    self.store_local(&param, v.clone());
                    return Ok(v);
                }
            }
        }

        if spec.volatile {
            return self.read_hardware(spec, cache.as_ref()).await;
        }
        if let Some(v) = self.local(&param) {
            return Ok(v);
        }
        self.resolve_initial(spec).await
    }

    async fn read_hardware(
        self: &Arc<Self>,
        spec: &ParamSpec,
        cache: Option<&Arc<dyn CacheBackend>>,
    ) -> DaqResult<Value> {
        let read = spec.read_hook.as_ref().ok_or_else(|| {
            DaqError::Programming(format!("{}: parameter '{}' has no read hook", self.name, spec.name))
        })?;
        let _guard = self.lock_param(&spec.name).await;
        let raw = read(self.clone()).await?;
        let raw = if spec.name == "value" {
            self.from_hardware(raw)
        } else {
            raw
        };
        let value = spec.validator.validate(&spec.name, Some(&raw))?;
        self.store_local(&spec.name, value.clone());
        if let Some(cache) = cache {
            cache
                .put(&self.name, &spec.name, value.clone(), self.cache_ttl())
                .await?;
        }
        Ok(value)
    }

    /// Write `param`. Returns the value that was finally stored.
    ///
    /// Writing `value` of a moveable device starts a movement to it.
    pub async fn set(self: &Arc<Self>, param: &str, value: Value) -> DaqResult<Value> {
        let param = param.to_lowercase();
        let spec = self.spec(&param)?;
        let mode = self.mode();
        if !mode.may_write() {
            return Err(DaqError::mode(
                &self.name,
                format!("setting parameter {param} not possible in slave mode"),
            ));
        }
        if param == "value" && self.dtype.has_capability(&Capability::Moveable) {
            return self.start_target(value).await;
        }
        if !spec.settable {
            return Err(DaqError::mode(
                &self.name,
                format!("the {param} parameter can only be changed in the setup file"),
            ));
        }
        let value = spec
            .validator
            .validate(&param, Some(&value))
            .map_err(|e| DaqError::config(&self.name, e))?;
        if param == "userlimits" && self.dtype.has_capability(&Capability::HasLimits) {
            let limits = limits_of(&value).ok_or_else(|| {
                DaqError::config(&self.name, "user limits cannot be cleared")
            })?;
            self.check_user_limits(limits)?;
        }

        let _guard = self.lock_param(&param).await;
        let offset_shift = match (param.as_str(), value.as_f64()) {
            ("offset", Some(new)) => Some(new - self.local_f64("offset").unwrap_or(0.0)),
            _ => None,
        };

        let value = if self.sim_active() {
            if let Some(update) = &spec.update_hook {
                update(&**self, &value);
            }
            self.store_local(&param, value.clone());
            value
        } else {
            let mut value = value;
            if let Some(write) = &spec.write_hook {
                if let Some(rewritten) = write(self.clone(), value.clone()).await? {
                    value = spec.validator.validate(&param, Some(&rewritten))?;
                }
            }
            if let Some(update) = &spec.update_hook {
                update(&**self, &value);
            }
            if spec.chatty && self.local(&param).is_some_and(|old| !values_equal(&old, &value)) {
                device_event!(self, Level::INFO, param = %param, value = %value, "parameter changed");
            }
            self.store_local(&param, value.clone());
            if let Some(cache) = self.cache_handle() {
                cache.put(&self.name, &param, value.clone(), None).await?;
            }
            value
        };

        if let Some(diff) = offset_shift.filter(|d| *d != 0.0) {
            self.shift_offset(diff).await?;
        }
        Ok(value)
    }

    /// Update a parameter that is read-only to users but changes at runtime.
    pub async fn set_internal(&self, param: &str, value: Value) -> DaqResult<()> {
        self.store_local(param, value.clone());
        if let Some(cache) = self.cache_handle() {
            cache.put(&self.name, param, value, None).await?;
        }
        Ok(())
    }

    /// Initial value resolution for one parameter.
    ///
    /// Cache and configuration are consulted; on conflict the configured
    /// value wins if it changed since the last creation, otherwise the
    /// parameter's cache preference decides. Without either source the
    /// hardware read hook (or, in simulation, the default) supplies the value.
    pub(crate) async fn resolve_initial(self: &Arc<Self>, spec: &ParamSpec) -> DaqResult<Value> {
        let param = spec.name.as_str();
        let cache = self.cache_handle();
        let configured = self.config.get(param).filter(|v| !v.is_null());

        let cached = match &cache {
            Some(c) => c.get_any(&self.name, param).await?,
            None => None,
        };
        if spec.mandatory && configured.is_none() && cached.is_none() {
            return Err(DaqError::config(
                &self.name,
                format!("missing configuration parameter '{param}'"),
            ));
        }

        let configured = configured
            .map(|raw| {
                spec.validator
                    .validate(param, Some(raw))
                    .map_err(|e| DaqError::config(&self.name, e))
            })
            .transpose()?;
        let cached = cached.and_then(|v| match spec.validator.validate(param, Some(&v)) {
            Ok(v) => Some(v),
            Err(e) => {
                device_event!(self, Level::WARN, param = %param, error = %e, "value in cache is invalid, ignoring it");
                None
            }
        });

        let value = match (cached, configured) {
            (Some(cached), Some(cfg)) if !values_equal(&cached, &cfg) => {
                let changed_in_setup = self
                    .last_config
                    .read()
                    .as_ref()
                    .is_some_and(|last| !last.get(param).is_some_and(|v| values_equal(v, &cfg)));
                if changed_in_setup {
                    device_event!(self, Level::WARN, param = %param, cached = %cached, configured = %cfg,
                        "value from cache differs from configured value, using configured since it was changed in the setup file");
                    self.put_cache(cache.as_ref(), param, cfg.clone()).await?;
                    cfg
                } else if spec.prefers_cache() {
                    device_event!(self, Level::WARN, param = %param, cached = %cached, configured = %cfg,
                        "value from cache differs from configured value, using cached");
                    cached
                } else {
                    device_event!(self, Level::WARN, param = %param, cached = %cached, configured = %cfg,
                        "value from cache differs from configured value, using configured");
                    self.put_cache(cache.as_ref(), param, cfg.clone()).await?;
                    cfg
                }
            }
            (Some(cached), _) => cached,
            (None, configured) => {
                let value = self.initial_without_cache(spec, configured).await?;
                self.put_cache(cache.as_ref(), param, value.clone()).await?;
                value
            }
        };

        if let Some(update) = &spec.update_hook {
            update(&**self, &value);
        }
        self.store_local(param, value.clone());
        Ok(value)
    }

    async fn initial_without_cache(
        self: &Arc<Self>,
        spec: &ParamSpec,
        configured: Option<Value>,
    ) -> DaqResult<Value> {
        if !self.sim_active() {
            if let Some(read) = &spec.read_hook {
                match read(self.clone()).await {
                    Ok(raw) => return spec.validator.validate(&spec.name, Some(&raw)),
                    Err(e) => device_event!(self, Level::WARN, param = %spec.name, error = %e,
                        "could not read initial value for parameter from device"),
                }
            }
        }
        match configured {
            Some(v) => Ok(v),
            None => spec
                .validator
                .validate(&spec.name, spec.default.as_ref())
                .map_err(|e| DaqError::config(&self.name, e)),
        }
    }

    async fn put_cache(
        &self,
        cache: Option<&Arc<dyn CacheBackend>>,
        param: &str,
        value: Value,
    ) -> DaqResult<()> {
        match cache {
            Some(c) => c.put(&self.name, param, value, None).await,
            None => Ok(()),
        }
    }

    // ===== readable / moveable =====

    /// Main value of a readable device.
    pub async fn read(self: &Arc<Self>, max_age: Option<f64>) -> DaqResult<Value> {
        self.get("value", max_age).await
    }

    /// Start moving to `target` without waiting.
    pub async fn start(self: &Arc<Self>, target: Value) -> DaqResult<()> {
        self.start_target(target).await.map(|_| ())
    }

    /// Start a movement and return the normalized target.
    async fn start_target(self: &Arc<Self>, target: Value) -> DaqResult<Value> {
        if !self.mode().may_write() {
            return Err(DaqError::mode(&self.name, "start not possible in slave mode"));
        }
        if !self.dtype.has_capability(&Capability::Moveable) {
            return Err(DaqError::Programming(format!("{}: not a moveable device", self.name)));
        }
        if let Some(reason) = self.fixed() {
            return Err(DaqError::mode(
                &self.name,
                format!("device fixed ({reason}), use release() first"),
            ));
        }
        let target = self.spec("value")?.validator.validate("target", Some(&target))?;
        if let Err(why) = self.is_allowed(&target) {
            return Err(DaqError::InvalidValue {
                param: "target".to_string(),
                reason: format!("moving to {target} is not allowed: {why}"),
                value: target,
            });
        }
        self.set_internal("target", target.clone()).await?;
        device_event!(self, Level::DEBUG, target = %target, "starting movement");

        if self.sim_active() {
            self.sim_set_value(&target);
            self.sim.lock().started = Some(self.sim_clock.time());
            return Ok(target);
        }
        if let Some(cache) = self.cache_handle() {
            cache.invalidate(&self.name, "value").await?;
        }
        let start = self.dtype.start.as_ref().ok_or_else(|| {
            DaqError::Programming(format!("{}: type has no start hook", self.name))
        })?;
        start(self.clone(), self.to_hardware(&target)).await?;
        Ok(target)
    }

    /// Wait for the current movement to finish and return the reached value.
    pub async fn wait(self: &Arc<Self>) -> DaqResult<Completion> {
        if self.sim_active() {
            let elapsed = self.sim_duration();
            let mut sim = self.sim.lock();
            if let Some(started) = sim.started.take() {
                self.sim_clock.wait_until(started + elapsed);
            }
            sim.old_value = sim.value.clone();
            let value = sim.value.clone().unwrap_or(Value::Null);
            return Ok(Completion { value, elapsed });
        }

        let began = self.clock.now();
        if let Some(wait) = &self.dtype.wait {
            wait(self.clone()).await?;
        }
        let value = self.get("value", Some(0.0)).await?;
        Ok(Completion {
            value,
            elapsed: self.clock.now() - began,
        })
    }

    /// Move to `target` and wait for completion.
    pub async fn maw(self: &Arc<Self>, target: Value) -> DaqResult<Completion> {
        self.start(target).await?;
        self.wait().await
    }

    pub async fn stop(self: &Arc<Self>) -> DaqResult<()> {
        if !self.mode().may_write() {
            return Err(DaqError::mode(&self.name, "stop not possible in slave mode"));
        }
        if self.sim_active() {
            return Ok(());
        }
        if let Some(reason) = self.fixed() {
            return Err(DaqError::mode(
                &self.name,
                format!("device fixed ({reason}), use release() first"),
            ));
        }
        if let Some(stop) = &self.dtype.stop {
            stop(self.clone()).await?;
        }
        if let Some(cache) = self.cache_handle() {
            cache.invalidate(&self.name, "value").await?;
        }
        Ok(())
    }

    /// Check whether moving to `target` is permitted: within the user
    /// limits, then the type's own check.
    pub fn is_allowed(&self, target: &Value) -> Result<(), String> {
        if self.dtype.has_capability(&Capability::HasLimits) {
            if let (Some(pos), Some((lo, hi))) = (target.as_f64(), self.user_limits()) {
                if pos < lo || pos > hi {
                    return Err(format!("limits are [{lo}, {hi}]"));
                }
            }
        }
        match &self.dtype.is_allowed {
            Some(check) => check(self, target),
            None => Ok(()),
        }
    }

    // ===== fix / release =====

    /// Refuse movements until [`release`](Self::release) is called.
    pub async fn fix(self: &Arc<Self>, reason: &str) -> DaqResult<()> {
        if let Some(hook) = &self.dtype.fix {
            if !self.sim_active() {
                hook(self.clone()).await?;
            }
        }
        *self.fixed.lock() = Some(reason.to_string());
        device_event!(self, Level::INFO, reason = %reason, "device fixed");
        Ok(())
    }

    pub async fn release(self: &Arc<Self>) -> DaqResult<()> {
        if let Some(hook) = &self.dtype.release {
            if !self.sim_active() {
                hook(self.clone()).await?;
            }
        }
        if self.fixed.lock().take().is_some() {
            device_event!(self, Level::INFO, "device released");
        }
        Ok(())
    }

    /// Reason the device is fixed, if it is.
    pub fn fixed(&self) -> Option<String> {
        self.fixed.lock().clone()
    }

    // ===== status =====

    /// Current status, served from the cache when no older than `max_age`.
    ///
    /// Simulated devices are always `Ok`. Types without a status hook
    /// report `Unknown`.
    pub async fn status(self: &Arc<Self>, max_age: Option<f64>) -> DaqResult<DeviceStatus> {
        if self.sim_active() {
            return Ok(DeviceStatus::ok("simulated"));
        }
        let Some(hook) = self.dtype.status.clone() else {
            return Ok(DeviceStatus::new(StatusCode::Unknown, "status not implemented"));
        };
        let cache = self.cache_handle();
        if max_age != Some(0.0) {
            if let Some(cache) = &cache {
                if let Some(cached) = cache.get(&self.name, STATUS_PARAM, max_age).await? {
                    match serde_json::from_value(cached) {
                        Ok(status) => return Ok(status),
                        Err(e) => device_event!(self, Level::WARN, error = %e,
                            "status in cache is invalid, asking the device"),
                    }
                }
            }
        }
        let status = hook(self.clone()).await?;
        if let Some(cache) = &cache {
            cache
                .put(&self.name, STATUS_PARAM, serde_json::to_value(&status)?, self.cache_ttl())
                .await?;
        }
        Ok(status)
    }

    /// Clear a hardware fault and return the fresh status.
    pub async fn reset(self: &Arc<Self>) -> DaqResult<DeviceStatus> {
        if !self.mode().may_write() {
            return Err(DaqError::mode(&self.name, "reset not possible in slave mode"));
        }
        if self.sim_active() {
            return Ok(DeviceStatus::ok("simulated"));
        }
        if let Some(reset) = &self.dtype.reset {
            reset(self.clone()).await?;
        }
        if let Some(cache) = self.cache_handle() {
            cache.invalidate(&self.name, STATUS_PARAM).await?;
        }
        device_event!(self, Level::INFO, "device reset");
        self.status(Some(0.0)).await
    }

    // ===== limits & offset =====

    /// `userlimits` as `(min, max)` in logical units.
    pub fn user_limits(&self) -> Option<(f64, f64)> {
        self.local("userlimits").as_ref().and_then(limits_of)
    }

    /// `abslimits` as `(min, max)` in hardware units.
    pub fn abs_limits(&self) -> Option<(f64, f64)> {
        self.local("abslimits").as_ref().and_then(limits_of)
    }

    fn offset(&self) -> f64 {
        if self.dtype.has_capability(&Capability::HasOffset) {
            self.local_f64("offset").unwrap_or(0.0)
        } else {
            0.0
        }
    }

    /// User limits shifted by the offset must lie within the absolute limits.
    fn check_user_limits(&self, (umin, umax): (f64, f64)) -> DaqResult<()> {
        let Some((amin, amax)) = self.abs_limits() else {
            return Ok(());
        };
        let offset = self.offset();
        if umin + offset < amin {
            return Err(DaqError::config(
                &self.name,
                format!("user minimum ({umin}, offset {offset}) below the absolute minimum ({amin})"),
            ));
        }
        if umax + offset > amax {
            return Err(DaqError::config(
                &self.name,
                format!("user maximum ({umax}, offset {offset}) above the absolute maximum ({amax})"),
            ));
        }
        Ok(())
    }

    /// Default unset user limits to the absolute ones, else check them.
    pub(crate) async fn init_limits(&self) -> DaqResult<()> {
        if !self.dtype.has_capability(&Capability::HasLimits) {
            return Ok(());
        }
        let (amin, amax) = self
            .abs_limits()
            .ok_or_else(|| DaqError::config(&self.name, "missing absolute limits"))?;
        if let Some(limits) = self.user_limits() {
            return self.check_user_limits(limits);
        }
        let offset = self.offset();
        let limits = Value::Array(vec![Value::from(amin - offset), Value::from(amax - offset)]);
        device_event!(self, Level::INFO, userlimits = %limits, "setting user limits from absolute limits");
        self.set_internal("userlimits", limits).await
    }

    /// Logical value from a raw hardware reading.
    fn from_hardware(&self, raw: Value) -> Value {
        match (raw.as_f64(), self.offset()) {
            (Some(pos), offset) if offset != 0.0 => Value::from(pos - offset),
            _ => raw,
        }
    }

    fn to_hardware(&self, target: &Value) -> Value {
        match (target.as_f64(), self.offset()) {
            (Some(pos), offset) if offset != 0.0 => Value::from(pos + offset),
            _ => target.clone(),
        }
    }

    /// Keep the logical value and user limits consistent after the offset
    /// grew by `diff`.
    async fn shift_offset(&self, diff: f64) -> DaqResult<()> {
        if let Some((lo, hi)) = self.user_limits() {
            let shifted = Value::Array(vec![Value::from(lo - diff), Value::from(hi - diff)]);
            self.set_internal("userlimits", shifted).await?;
        }
        if self.sim_active() {
            let mut sim = self.sim.lock();
            if let Some(pos) = sim.value.as_ref().and_then(Value::as_f64) {
                sim.value = Some(Value::from(pos - diff));
            }
        } else if let Some(cache) = self.cache_handle() {
            cache.invalidate(&self.name, "value").await?;
        }
        Ok(())
    }

    fn sim_set_value(&self, target: &Value) {
        let mut sim = self.sim.lock();
        sim.old_value = Some(sim.value.clone().unwrap_or_else(|| Value::from(0.0)));
        sim.value = Some(target.clone());
        if let Some(pos) = target.as_f64() {
            sim.min = Some(sim.min.map_or(pos, |m| m.min(pos)));
            sim.max = Some(sim.max.map_or(pos, |m| m.max(pos)));
        }
    }

    /// Estimated duration of the simulated movement from `speed` or `ramp`.
    fn sim_duration(&self) -> f64 {
        let (new, old) = {
            let sim = self.sim.lock();
            (
                sim.value.as_ref().and_then(Value::as_f64),
                sim.old_value.as_ref().and_then(Value::as_f64),
            )
        };
        let (Some(new), Some(old)) = (new, old) else {
            return 0.0;
        };
        let distance = (new - old).abs();
        if self.dtype.param("speed").is_some() {
            if let Some(speed) = self.local_f64("speed").filter(|s| *s != 0.0) {
                return distance / speed.abs();
            }
        }
        if self.dtype.param("ramp").is_some() {
            if let Some(ramp) = self.local_f64("ramp").filter(|r| *r != 0.0) {
                return distance / (ramp.abs() / 60.0);
            }
        }
        0.0
    }

    // ===== info =====

    /// Categorized snapshot of the device's informational parameters.
    pub async fn info(self: &Arc<Self>) -> Vec<InfoEntry> {
        let unit = self
            .local("unit")
            .and_then(|u| u.as_str().map(str::to_string))
            .unwrap_or_default();
        let mut entries = Vec::new();

        if self.dtype.has_capability(&Capability::Readable) {
            let formatted = match self.read(None).await {
                Ok(v) => {
                    let fmtstr = self
                        .local("fmtstr")
                        .and_then(|f| f.as_str().map(str::to_string))
                        .unwrap_or_else(|| "%s".to_string());
                    format!("{} {}", format_value(&fmtstr, &v), unit).trim_end().to_string()
                }
                Err(e) => {
                    device_event!(self, Level::WARN, error = %e, "error reading device for info()");
                    format!("Error: {e}")
                }
            };
            entries.push(InfoEntry {
                category: InfoCategory::General,
                name: "value".to_string(),
                formatted,
            });
        }

        match self.status(None).await {
            Ok(status) if status.is_notable() => entries.push(InfoEntry {
                category: InfoCategory::Status,
                name: STATUS_PARAM.to_string(),
                formatted: status.to_string(),
            }),
            Ok(_) => {}
            Err(e) => device_event!(self, Level::WARN, error = %e, "error getting status for info()"),
        }

        for spec in self.dtype.params() {
            let Some(category) = spec.category else {
                continue;
            };
            let value = match self.get(&spec.name, None).await {
                Ok(v) => v,
                Err(e) => {
                    device_event!(self, Level::WARN, param = %spec.name, error = %e,
                        "error getting parameter for info()");
                    continue;
                }
            };
            let par_unit = spec.unit.as_deref().unwrap_or("").replace("main", &unit);
            let rendered = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            entries.push(InfoEntry {
                category,
                name: spec.name.clone(),
                formatted: format!("{rendered} {par_unit}").trim_end().to_string(),
            });
        }

        entries.sort_by_key(|e| e.category);
        entries
    }

    // ===== mode transitions & subscriptions =====

    /// Record the last known values as synthetic state before simulating.
    pub(crate) async fn capture_for_simulation(self: &Arc<Self>) {
        if !self.dtype.hardware_access() {
            return;
        }
        for spec in self.dtype.params().iter().filter(|p| p.volatile) {
            match self.get(&spec.name, None).await {
                Ok(v) if spec.name == "value" => {
                    device_event!(self, Level::DEBUG, value = %v, "last value before simulation mode");
                    let mut sim = self.sim.lock();
                    sim.value = Some(v);
                    sim.started = None;
                }
                Ok(_) => {}
                Err(e) => device_event!(self, Level::WARN, param = %spec.name, error = %e,
                    "error reading last value before simulation"),
            }
        }
    }

    /// Re-derive the cache reference for a freshly published mode.
    pub(crate) fn apply_mode(&self, mode: ExecutionMode) {
        *self.cache.write() = if mode.uses_cache() {
            self.shared_cache.clone()
        } else {
            None
        };
    }

    /// Register cache callbacks for every parameter with an update hook.
    pub(crate) async fn subscribe_updates(self: &Arc<Self>) -> DaqResult<()> {
        let Some(cache) = self.cache_handle() else {
            return Ok(());
        };
        for spec in self.dtype.params() {
            let Some(hook) = spec.update_hook.clone() else {
                continue;
            };
            let weak: Weak<Device> = Arc::downgrade(self);
            let param = spec.name.clone();
            let id = cache
                .subscribe(
                    &self.name,
                    &spec.name,
                    Arc::new(move |update: &CacheUpdate| {
                        let (Some(dev), Some(value)) = (weak.upgrade(), &update.value) else {
                            return;
                        };
                        dev.store_local(&param, value.clone());
                        hook(&*dev, value);
                    }),
                )
                .await?;
            self.subscriptions.lock().push(id);
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe_all(&self) {
        let ids: Vec<SubscriptionId> = std::mem::take(&mut *self.subscriptions.lock());
        let Some(cache) = self.shared_cache.clone() else {
            return;
        };
        for id in ids {
            if let Err(e) = cache.unsubscribe(id).await {
                device_event!(self, Level::WARN, error = %e, "failed to remove cache subscription");
            }
        }
    }
}

fn limits_of(value: &Value) -> Option<(f64, f64)> {
    match value.as_array()?.as_slice() {
        [lo, hi] => Some((lo.as_f64()?, hi.as_f64()?)),
        _ => None,
    }
}
