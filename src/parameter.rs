//! Declarative parameter descriptors.
//!
//! A [`ParamSpec`] is the static metadata for one parameter of a device type:
//! its validator, default, access flags and the explicit hardware hooks that
//! replace name-based `doRead`/`doWrite` lookup. Specs are immutable once the
//! owning [`DeviceType`](crate::device::spec::DeviceType) is built; subtypes
//! refine inherited specs through an [`Override`] patch instead of redefining
//! the name.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_runtime::parameter::ParamSpec;
//! use daq_runtime::validation::Validator;
//! use serde_json::json;
//!
//! let speed = ParamSpec::new("speed", Validator::float_range(0.0, None)?)
//!     .description("Motor speed")
//!     .unit("main/s")
//!     .default(json!(1.0))
//!     .settable()
//!     .on_write(|dev, value| async move {
//!         driver(&dev).set_speed(value.as_f64().unwrap_or_default()).await?;
//!         Ok(None)
//!     });
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{DaqError, DaqResult};
use crate::validation::{InfoCategory, Validator};

/// Hardware read: returns the raw current value.
pub type ReadHook = Arc<dyn Fn(Arc<Device>) -> BoxFuture<'static, DaqResult<Value>> + Send + Sync>;

/// Hardware write: may return `Some(v)` to replace the value that gets stored.
pub type WriteHook =
    Arc<dyn Fn(Arc<Device>, Value) -> BoxFuture<'static, DaqResult<Option<Value>>> + Send + Sync>;

/// Local update notification. Runs on the cache delivery task, must not block
/// and must not perform hardware I/O.
pub type UpdateHook = Arc<dyn Fn(&Device, &Value) + Send + Sync>;

// =============================================================================
// ParamSpec
// =============================================================================

#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    pub validator: Validator,
    /// Raw default, normalized through `validator` when the type is built
    pub default: Option<Value>,
    pub mandatory: bool,
    pub settable: bool,
    /// Always re-read from hardware on a cache miss or forced read
    pub volatile: bool,
    /// Resolved before the pre-init hook runs
    pub preinit: bool,
    /// `None` means "prefer cache iff settable"
    pub prefer_cache: Option<bool>,
    pub category: Option<InfoCategory>,
    /// Unit for display; `main` is replaced with the device unit
    pub unit: Option<String>,
    pub internal: bool,
    pub user_visible: bool,
    /// Log changes at info level
    pub chatty: bool,
    pub read_hook: Option<ReadHook>,
    pub write_hook: Option<WriteHook>,
    pub update_hook: Option<UpdateHook>,
}

impl std::fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("validator", &self.validator)
            .field("default", &self.default)
            .field("mandatory", &self.mandatory)
            .field("settable", &self.settable)
            .field("volatile", &self.volatile)
            .field("preinit", &self.preinit)
            .field("prefer_cache", &self.prefer_cache)
            .field("has_read_hook", &self.read_hook.is_some())
            .field("has_write_hook", &self.write_hook.is_some())
            .finish()
    }
}

impl ParamSpec {
    /// Create a spec with all flags off; the name is lower-cased.
    pub fn new(name: impl Into<String>, validator: Validator) -> Self {
        Self {
            name: name.into().to_lowercase(),
            description: String::new(),
            validator,
            default: None,
            mandatory: false,
            settable: false,
            volatile: false,
            preinit: false,
            prefer_cache: None,
            category: None,
            unit: None,
            internal: false,
            user_visible: true,
            chatty: false,
            read_hook: None,
            write_hook: None,
            update_hook: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn preinit(mut self) -> Self {
        self.preinit = true;
        self
    }

    pub fn prefer_cache(mut self, prefer: bool) -> Self {
        self.prefer_cache = Some(prefer);
        self
    }

    pub fn category(mut self, category: InfoCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.user_visible = false;
        self
    }

    pub fn chatty(mut self) -> Self {
        self.chatty = true;
        self
    }

    /// Attach the hardware read function.
    pub fn on_read<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<Value>> + Send + 'static,
    {
        self.read_hook = Some(read_hook(f));
        self
    }

    /// Attach the hardware write function.
    pub fn on_write<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<Option<Value>>> + Send + 'static,
    {
        self.write_hook = Some(write_hook(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &Value) + Send + Sync + 'static,
    {
        self.update_hook = Some(Arc::new(f));
        self
    }

    /// Effective cache preference.
    pub fn prefers_cache(&self) -> bool {
        self.prefer_cache.unwrap_or(self.settable)
    }

    /// Backed by a hardware read hook.
    pub fn is_hardware_backed(&self) -> bool {
        self.read_hook.is_some()
    }

    /// Normalized default; a default the validator rejects is a type definition bug.
    pub fn normalized_default(&self) -> DaqResult<Value> {
        self.validator
            .validate(&self.name, self.default.as_ref())
            .map_err(|e| {
                DaqError::Programming(format!("default of parameter '{}' is invalid: {e}", self.name))
            })
    }

    /// Check the invariants that do not depend on other parameters.
    pub(crate) fn check(&self, type_name: &str, concrete: bool) -> DaqResult<()> {
        if concrete && self.volatile && self.read_hook.is_none() {
            return Err(DaqError::Programming(format!(
                "{type_name}: parameter '{}' is marked as volatile, but has no read hook",
                self.name
            )));
        }
        if self.write_hook.is_some() && !self.settable {
            return Err(DaqError::Programming(format!(
                "{type_name}: parameter '{}' has a write hook but is not settable",
                self.name
            )));
        }
        self.normalized_default().map(|_| ())
    }
}

pub(crate) fn read_hook<F, Fut>(f: F) -> ReadHook
where
    F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DaqResult<Value>> + Send + 'static,
{
    Arc::new(move |dev| f(dev).boxed())
}

pub(crate) fn write_hook<F, Fut>(f: F) -> WriteHook
where
    F: Fn(Arc<Device>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DaqResult<Option<Value>>> + Send + 'static,
{
    Arc::new(move |dev, value| f(dev, value).boxed())
}

// =============================================================================
// Override
// =============================================================================

/// Patch applied to an inherited [`ParamSpec`]. Unset fields keep the
/// inherited setting.
#[derive(Clone, Default)]
pub struct Override {
    pub name: String,
    description: Option<String>,
    validator: Option<Validator>,
    default: Option<Value>,
    mandatory: Option<bool>,
    settable: Option<bool>,
    volatile: Option<bool>,
    preinit: Option<bool>,
    prefer_cache: Option<Option<bool>>,
    category: Option<Option<InfoCategory>>,
    unit: Option<String>,
    user_visible: Option<bool>,
    read_hook: Option<ReadHook>,
    write_hook: Option<WriteHook>,
    update_hook: Option<UpdateHook>,
}

impl Override {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            ..Default::default()
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn settable(mut self, settable: bool) -> Self {
        self.settable = Some(settable);
        self
    }

    pub fn volatile(mut self, volatile: bool) -> Self {
        self.volatile = Some(volatile);
        self
    }

    pub fn preinit(mut self, preinit: bool) -> Self {
        self.preinit = Some(preinit);
        self
    }

    pub fn prefer_cache(mut self, prefer: Option<bool>) -> Self {
        self.prefer_cache = Some(prefer);
        self
    }

    pub fn category(mut self, category: Option<InfoCategory>) -> Self {
        self.category = Some(category);
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn user_visible(mut self, visible: bool) -> Self {
        self.user_visible = Some(visible);
        self
    }

    pub fn on_read<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<Value>> + Send + 'static,
    {
        self.read_hook = Some(read_hook(f));
        self
    }

    pub fn on_write<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Device>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DaqResult<Option<Value>>> + Send + 'static,
    {
        self.write_hook = Some(write_hook(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Device, &Value) + Send + Sync + 'static,
    {
        self.update_hook = Some(Arc::new(f));
        self
    }

    /// Produce the refined spec.
    pub fn apply(&self, base: &ParamSpec) -> ParamSpec {
        let mut spec = base.clone();
        if let Some(d) = &self.description {
            spec.description = d.clone();
        }
        if let Some(v) = &self.validator {
            spec.validator = v.clone();
        }
        if let Some(d) = &self.default {
            spec.default = Some(d.clone());
        }
        if let Some(m) = self.mandatory {
            spec.mandatory = m;
        }
        if let Some(s) = self.settable {
            spec.settable = s;
        }
        if let Some(v) = self.volatile {
            spec.volatile = v;
        }
        if let Some(p) = self.preinit {
            spec.preinit = p;
        }
        if let Some(p) = self.prefer_cache {
            spec.prefer_cache = p;
        }
        if let Some(c) = self.category {
            spec.category = c;
        }
        if let Some(u) = &self.unit {
            spec.unit = Some(u.clone());
        }
        if let Some(v) = self.user_visible {
            spec.user_visible = v;
        }
        if let Some(h) = &self.read_hook {
            spec.read_hook = Some(h.clone());
        }
        if let Some(h) = &self.write_hook {
            spec.write_hook = Some(h.clone());
        }
        if let Some(h) = &self.update_hook {
            spec.update_hook = Some(h.clone());
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefers_cache_defaults_to_settable() {
        let ro = ParamSpec::new("offset", Validator::Float);
        assert!(!ro.prefers_cache());
        let rw = ParamSpec::new("offset", Validator::Float).settable();
        assert!(rw.prefers_cache());
        let forced = ParamSpec::new("offset", Validator::Float).prefer_cache(true);
        assert!(forced.prefers_cache());
    }

    #[test]
    fn test_volatile_without_read_hook_is_rejected() {
        let spec = ParamSpec::new("temperature", Validator::Float).volatile();
        assert!(matches!(spec.check("Sensor", true), Err(DaqError::Programming(_))));
        // abstract base types may leave the hook to subtypes
        assert!(spec.check("Sensor", false).is_ok());

        let spec = spec.on_read(|_dev| async { Ok(json!(4.2)) });
        assert!(spec.check("Sensor", true).is_ok());
    }

    #[test]
    fn test_invalid_default_is_programming_error() {
        let spec = ParamSpec::new("speed", Validator::float_range(0.0, Some(1.0)).unwrap())
            .default(json!(5.0));
        assert!(matches!(spec.normalized_default(), Err(DaqError::Programming(_))));
    }

    #[test]
    fn test_override_patches_only_given_fields() {
        let base = ParamSpec::new("Unit", Validator::Str)
            .mandatory()
            .settable()
            .description("Unit of the device main value");
        assert_eq!(base.name, "unit");

        let patched = Override::new("unit")
            .mandatory(false)
            .default(json!("mm"))
            .apply(&base);
        assert!(!patched.mandatory);
        assert!(patched.settable);
        assert_eq!(patched.default, Some(json!("mm")));
        assert_eq!(patched.description, "Unit of the device main value");
    }
}
