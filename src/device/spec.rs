//! Device type tables.
//!
//! A [`DeviceType`] is the explicit, per-type registry of parameter and attach
//! specifications plus lifecycle hooks. Types are built once with
//! [`DeviceTypeBuilder`], which merges inherited tables, applies overrides and
//! checks the definition invariants up front.
//!
//! # Example
//!
//! ```rust,ignore
//! let motor = DeviceType::builder("VirtualMotor")
//!     .extends(&moveable_base()?)
//!     .param(ParamSpec::new("speed", Validator::float_range(0.0, None)?).settable())
//!     .override_param(Override::new("value").validator(Validator::Float).on_read(read_pos))
//!     .on_start(move_to)
//!     .build()?;
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use super::status::DeviceStatus;
use super::Device;
use crate::attach::AttachSpec;
use crate::error::{DaqError, DaqResult};
use crate::parameter::{Override, ParamSpec};
use crate::validation::{InfoCategory, Validator};

/// Hook without payload (pre-init, init, shutdown, wait, stop).
pub type LifecycleHook = Arc<dyn Fn(Arc<Device>) -> BoxFuture<'static, DaqResult<()>> + Send + Sync>;

/// Hook receiving a movement target.
pub type StartHook = Arc<dyn Fn(Arc<Device>, Value) -> BoxFuture<'static, DaqResult<()>> + Send + Sync>;

/// Hook asking the hardware for its status.
pub type StatusHook =
    Arc<dyn Fn(Arc<Device>) -> BoxFuture<'static, DaqResult<DeviceStatus>> + Send + Sync>;

/// Type-specific movement check; `Err` carries the reason.
pub type AllowedHook = Arc<dyn Fn(&Device, &Value) -> Result<(), String> + Send + Sync>;

/// Interface a device type provides; used for attach type checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Device,
    Readable,
    Moveable,
    Measurable,
    /// User and absolute limits checked before every move
    HasLimits,
    /// Hardware zero shifted by the `offset` parameter
    HasOffset,
    Other(String),
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Device => f.write_str("Device"),
            Capability::Readable => f.write_str("Readable"),
            Capability::Moveable => f.write_str("Moveable"),
            Capability::Measurable => f.write_str("Measurable"),
            Capability::HasLimits => f.write_str("HasLimits"),
            Capability::HasOffset => f.write_str("HasOffset"),
            Capability::Other(name) => f.write_str(name),
        }
    }
}

pub struct DeviceType {
    name: String,
    capabilities: Vec<Capability>,
    params: Vec<ParamSpec>,
    attachments: Vec<(String, AttachSpec)>,
    pub(crate) pre_init: Option<LifecycleHook>,
    pub(crate) init: Option<LifecycleHook>,
    pub(crate) shutdown: Option<LifecycleHook>,
    pub(crate) start: Option<StartHook>,
    pub(crate) wait: Option<LifecycleHook>,
    pub(crate) stop: Option<LifecycleHook>,
    pub(crate) status: Option<StatusHook>,
    pub(crate) reset: Option<LifecycleHook>,
    pub(crate) fix: Option<LifecycleHook>,
    pub(crate) release: Option<LifecycleHook>,
    pub(crate) is_allowed: Option<AllowedHook>,
    unique: bool,
    abstract_type: bool,
    hardware_access: bool,
    strict_config: bool,
}

impl std::fmt::Debug for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceType")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("params", &self.params.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("attachments", &self.attachments.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceType {
    pub fn builder(name: impl Into<String>) -> DeviceTypeBuilder {
        DeviceTypeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters in declaration order, base types first.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn attachments(&self) -> &[(String, AttachSpec)] {
        &self.attachments
    }

    pub fn attachment(&self, name: &str) -> Option<&AttachSpec> {
        self.attachments.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn has_capability(&self, cap: &Capability) -> bool {
        self.capabilities.contains(cap)
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Unique types may only have one live instance per name.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_abstract(&self) -> bool {
        self.abstract_type
    }

    pub fn hardware_access(&self) -> bool {
        self.hardware_access
    }

    pub fn strict_config(&self) -> bool {
        self.strict_config
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct DeviceTypeBuilder {
    name: String,
    capabilities: Vec<Capability>,
    params: Vec<ParamSpec>,
    inherited: HashSet<String>,
    overrides: Vec<Override>,
    attachments: Vec<(String, AttachSpec)>,
    pre_init: Option<LifecycleHook>,
    init: Option<LifecycleHook>,
    shutdown: Option<LifecycleHook>,
    start: Option<StartHook>,
    wait: Option<LifecycleHook>,
    stop: Option<LifecycleHook>,
    status: Option<StatusHook>,
    reset: Option<LifecycleHook>,
    fix: Option<LifecycleHook>,
    release: Option<LifecycleHook>,
    is_allowed: Option<AllowedHook>,
    unique: bool,
    abstract_type: bool,
    /// Unset until given explicitly or inherited from the first base
    hardware_access: Option<bool>,
    strict_config: bool,
    errors: Vec<String>,
}

fn lifecycle<F, Fut>(f: F) -> LifecycleHook
where
    F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DaqResult<()>> + Send + 'static,
{
    Arc::new(move |dev| f(dev).boxed())
}

impl DeviceTypeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: vec![Capability::Device],
            params: Vec::new(),
            inherited: HashSet::new(),
            overrides: Vec::new(),
            attachments: Vec::new(),
            pre_init: None,
            init: None,
            shutdown: None,
            start: None,
            wait: None,
            stop: None,
            status: None,
            reset: None,
            fix: None,
            release: None,
            is_allowed: None,
            unique: true,
            abstract_type: false,
            hardware_access: None,
            strict_config: false,
            errors: Vec::new(),
        }
    }

    /// Inherit parameters, attachments, capabilities and hooks of `base`.
    /// Hooks and hardware access already set on this builder are kept.
    pub fn extends(mut self, base: &Arc<DeviceType>) -> Self {
        for cap in &base.capabilities {
            if !self.capabilities.contains(cap) {
                self.capabilities.push(cap.clone());
            }
        }
        for p in &base.params {
            if self.inherited.insert(p.name.clone()) {
                self.params.push(p.clone());
            }
        }
        for (name, a) in &base.attachments {
            if !self.attachments.iter().any(|(n, _)| n == name) {
                self.attachments.push((name.clone(), a.clone()));
            }
        }
        self.pre_init = self.pre_init.or_else(|| base.pre_init.clone());
        self.init = self.init.or_else(|| base.init.clone());
        self.shutdown = self.shutdown.or_else(|| base.shutdown.clone());
        self.start = self.start.or_else(|| base.start.clone());
        self.wait = self.wait.or_else(|| base.wait.clone());
        self.stop = self.stop.or_else(|| base.stop.clone());
        self.status = self.status.or_else(|| base.status.clone());
        self.reset = self.reset.or_else(|| base.reset.clone());
        self.fix = self.fix.or_else(|| base.fix.clone());
        self.release = self.release.or_else(|| base.release.clone());
        self.is_allowed = self.is_allowed.or_else(|| base.is_allowed.clone());
        self.hardware_access = self.hardware_access.or(Some(base.hardware_access));
        self
    }

    pub fn capability(mut self, cap: Capability) -> Self {
        if !self.capabilities.contains(&cap) {
            self.capabilities.push(cap);
        }
        self
    }

    /// Declare a new parameter. Redeclaring an inherited name is an error;
    /// use [`override_param`](Self::override_param).
    pub fn param(mut self, spec: ParamSpec) -> Self {
        if self.inherited.contains(&spec.name) {
            self.errors.push(format!(
                "parameter '{}' is inherited; refine it with an override",
                spec.name
            ));
        } else if self.params.iter().any(|p| p.name == spec.name) {
            self.errors.push(format!("parameter '{}' declared twice", spec.name));
        } else {
            self.params.push(spec);
        }
        self
    }

    pub fn override_param(mut self, patch: Override) -> Self {
        self.overrides.push(patch);
        self
    }

    pub fn attach(mut self, name: impl Into<String>, spec: AttachSpec) -> Self {
        let name = name.into().to_lowercase();
        if self.attachments.iter().any(|(n, _)| *n == name) {
            self.errors.push(format!("attached device '{name}' declared twice"));
        } else {
            self.attachments.push((name, spec));
        }
        self
    }

    pub fn on_pre_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.pre_init = Some(lifecycle(f));
        self
    }

    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.init = Some(lifecycle(f));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.shutdown = Some(lifecycle(f));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.start = Some(Arc::new(move |dev, target| f(dev, target).boxed()));
        self
    }

    pub fn on_wait<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.wait = Some(lifecycle(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.stop = Some(lifecycle(f));
        self
    }

    pub fn on_status<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<DeviceStatus>> + Send + 'static,
    {
        self.status = Some(Arc::new(move |dev| f(dev).boxed()));
        self
    }

    /// Clear a hardware fault; the status is re-read afterwards.
    pub fn on_reset<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.reset = Some(lifecycle(f));
        self
    }

    pub fn on_fix<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.fix = Some(lifecycle(f));
        self
    }

    pub fn on_release<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.release = Some(lifecycle(f));
        self
    }

    /// Extra movement check run after the limit check.
    pub fn is_allowed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.is_allowed = Some(Arc::new(f));
        self
    }

    /// Allow re-creating an instance under an existing name.
    pub fn non_unique(mut self) -> Self {
        self.unique = false;
        self
    }

    /// Base types may leave volatile read hooks to their subtypes but cannot
    /// be instantiated.
    pub fn abstract_type(mut self) -> Self {
        self.abstract_type = true;
        self
    }

    /// Logical devices without their own hardware keep working normally in
    /// simulation.
    pub fn hardware_access(mut self, enabled: bool) -> Self {
        self.hardware_access = Some(enabled);
        self
    }

    pub fn strict_config(mut self, strict: bool) -> Self {
        self.strict_config = strict;
        self
    }

    pub fn build(mut self) -> DaqResult<Arc<DeviceType>> {
        for patch in std::mem::take(&mut self.overrides) {
            match self.params.iter_mut().find(|p| p.name == patch.name) {
                Some(spec) => *spec = patch.apply(spec),
                None => self
                    .errors
                    .push(format!("override for unknown parameter '{}'", patch.name)),
            }
        }
        if let Some((name, _)) = self
            .attachments
            .iter()
            .find(|(n, _)| self.params.iter().any(|p| p.name == *n))
        {
            self.errors
                .push(format!("'{name}' is both a parameter and an attached device"));
        }
        if !self.errors.is_empty() {
            return Err(DaqError::Programming(format!(
                "device type {}: {}",
                self.name,
                self.errors.join("; ")
            )));
        }
        for spec in &self.params {
            spec.check(&self.name, !self.abstract_type)?;
        }

        Ok(Arc::new(DeviceType {
            name: self.name,
            capabilities: self.capabilities,
            params: self.params,
            attachments: self.attachments,
            pre_init: self.pre_init,
            init: self.init,
            shutdown: self.shutdown,
            start: self.start,
            wait: self.wait,
            stop: self.stop,
            status: self.status,
            reset: self.reset,
            fix: self.fix,
            release: self.release,
            is_allowed: self.is_allowed,
            unique: self.unique,
            abstract_type: self.abstract_type,
            hardware_access: self.hardware_access.unwrap_or(true),
            strict_config: self.strict_config,
        }))
    }
}

// =============================================================================
// Base types
// =============================================================================

/// Parameters every device has.
pub fn device_base() -> DaqResult<Arc<DeviceType>> {
    DeviceType::builder("Device")
        .param(
            ParamSpec::new("description", Validator::Str)
                .description("A description of the device")
                .settable(),
        )
        .param(
            ParamSpec::new("lowlevel", Validator::Bool)
                .description("Whether the device is not interesting to users")
                .default(json!(false))
                .hidden(),
        )
        .param(
            ParamSpec::new("loglevel", Validator::one_of(["debug", "info", "warning", "error"])?)
                .description("The logging level of the device")
                .default(json!("info"))
                .settable()
                .preinit(),
        )
        .abstract_type()
        .build()
}

/// Devices with a main value read from hardware.
pub fn readable_base() -> DaqResult<Arc<DeviceType>> {
    DeviceType::builder("Readable")
        .extends(&device_base()?)
        .capability(Capability::Readable)
        .param(
            ParamSpec::new("value", Validator::Any)
                .description("Main device value")
                .volatile()
                .internal(),
        )
        .param(
            ParamSpec::new("fmtstr", Validator::Str)
                .description("Format string for the device value")
                .default(json!("%.3f"))
                .settable(),
        )
        .param(
            ParamSpec::new("unit", Validator::Str)
                .description("Unit of the device main value")
                .mandatory()
                .settable(),
        )
        .param(
            ParamSpec::new("maxage", Validator::none_or(Validator::float_range(0.0, Some(86400.0))?))
                .description("Maximum age of cached value (zero to never use cached values, or null to cache them indefinitely)")
                .unit("s")
                .default(json!(6.0))
                .settable(),
        )
        .param(
            ParamSpec::new(
                "pollinterval",
                Validator::none_or(Validator::float_range(0.5, Some(86400.0))?),
            )
            .description("Polling interval for value (or null to disable polling)")
            .unit("s")
            .default(json!(5.0))
            .settable(),
        )
        .abstract_type()
        .build()
}

/// Readable devices that can be moved to a target.
pub fn moveable_base() -> DaqResult<Arc<DeviceType>> {
    DeviceType::builder("Moveable")
        .extends(&readable_base()?)
        .capability(Capability::Moveable)
        .param(
            ParamSpec::new("target", Validator::Any)
                .description("Last target position of a start() action")
                .category(InfoCategory::General)
                .unit("main")
                .internal(),
        )
        .abstract_type()
        .build()
}

/// Mixin adding user and absolute limits to a moveable type.
///
/// `abslimits` are in hardware units; `userlimits` are in logical units and
/// default to the absolute limits.
pub fn has_limits() -> DaqResult<Arc<DeviceType>> {
    DeviceType::builder("HasLimits")
        .capability(Capability::HasLimits)
        .param(
            ParamSpec::new("userlimits", Validator::none_or(Validator::Limits))
                .description("User defined limits of device value")
                .category(InfoCategory::Limits)
                .unit("main")
                .settable()
                .chatty(),
        )
        .param(
            ParamSpec::new("abslimits", Validator::Limits)
                .description("Absolute limits of device value")
                .category(InfoCategory::Limits)
                .unit("main")
                .mandatory(),
        )
        .abstract_type()
        .build()
}

/// Mixin for devices whose value is `hardware position - offset`.
pub fn has_offset() -> DaqResult<Arc<DeviceType>> {
    DeviceType::builder("HasOffset")
        .capability(Capability::HasOffset)
        .param(
            ParamSpec::new("offset", Validator::Float)
                .description("Offset of device zero to hardware zero")
                .category(InfoCategory::Offsets)
                .unit("main")
                .default(json!(0.0))
                .settable()
                .chatty(),
        )
        .abstract_type()
        .build()
}
