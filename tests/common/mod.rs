//! Shared fixtures for the integration suites: a session over an in-process
//! cache driven by a manual clock, and a fake axis standing in for hardware.
#![allow(dead_code)]

use daq_runtime::attach::AttachSpec;
use daq_runtime::cache::MemoryCache;
use daq_runtime::clock::{Clock, ManualClock};
use daq_runtime::config::CacheConfig;
use daq_runtime::device::spec::{moveable_base, readable_base, Capability};
use daq_runtime::device::DeviceType;
use daq_runtime::parameter::{Override, ParamSpec};
use daq_runtime::validation::Validator;
use daq_runtime::{DaqError, ExecutionMode, Session};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const START_TIME: f64 = 1_000.0;

pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub cache: Arc<MemoryCache>,
    pub session: Session,
}

/// Session in `mode` over a fresh cache. Call inside a tokio runtime.
pub fn rig_with_mode(mode: ExecutionMode) -> Rig {
    let clock = Arc::new(ManualClock::new(START_TIME));
    let cache = Arc::new(MemoryCache::new(clock.clone(), "daq/"));
    let session = Session::new(cache.clone(), clock.clone())
        .with_mode(mode)
        .with_cache_config(fast_locks());
    Rig {
        clock,
        cache,
        session,
    }
}

pub fn rig() -> Rig {
    rig_with_mode(ExecutionMode::Master)
}

/// Second session sharing `rig`'s cache and clock, like another process.
pub fn peer(rig: &Rig) -> Session {
    let clock: Arc<dyn Clock> = rig.clock.clone();
    Session::new(rig.cache.clone(), clock).with_cache_config(fast_locks())
}

pub fn fast_locks() -> CacheConfig {
    CacheConfig {
        lock_retry_ms: 10,
        lock_timeout_ms: 60,
        ..CacheConfig::default()
    }
}

pub fn config(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Hardware stand-in with call counters.
#[derive(Default)]
pub struct FakeAxis {
    pub position: Mutex<f64>,
    pub reads: AtomicUsize,
    pub moves: AtomicUsize,
    pub speed_writes: AtomicUsize,
    pub fail_reads: AtomicBool,
}

impl FakeAxis {
    pub fn at(position: f64) -> Arc<Self> {
        let axis = Self::default();
        *axis.position.lock() = position;
        Arc::new(axis)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn moves(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<Value, DaqError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DaqError::Communication("axis: no response".into()));
        }
        Ok(json!(*self.position.lock()))
    }
}

/// Moveable type backed by `hw`, with `speed` and `ramp` parameters.
pub fn motor_type(name: &str, hw: Arc<FakeAxis>) -> Arc<DeviceType> {
    let read_hw = hw.clone();
    let move_hw = hw.clone();
    let speed_hw = hw;
    DeviceType::builder(name)
        .extends(&moveable_base().unwrap())
        .param(
            ParamSpec::new("speed", Validator::float_range(0.0, None).unwrap())
                .description("Motor speed")
                .unit("main/s")
                .default(json!(0.0))
                .settable()
                .on_write(move |_dev, _value| {
                    let hw = speed_hw.clone();
                    async move {
                        hw.speed_writes.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                }),
        )
        .param(
            ParamSpec::new("ramp", Validator::float_range(0.0, None).unwrap())
                .description("Ramp in main units per minute")
                .default(json!(0.0))
                .settable(),
        )
        .override_param(Override::new("value").validator(Validator::Float).on_read(move |_dev| {
            let hw = read_hw.clone();
            async move { hw.read() }
        }))
        .on_start(move |_dev, target| {
            let hw = move_hw.clone();
            async move {
                hw.moves.fetch_add(1, Ordering::SeqCst);
                *hw.position.lock() = target.as_f64().unwrap_or_default();
                Ok(())
            }
        })
        .build()
        .unwrap()
}

/// Readable type backed by `hw`.
pub fn sensor_type(name: &str, hw: Arc<FakeAxis>) -> Arc<DeviceType> {
    DeviceType::builder(name)
        .extends(&readable_base().unwrap())
        .override_param(Override::new("value").validator(Validator::Float).on_read(move |_dev| {
            let hw = hw.clone();
            async move { hw.read() }
        }))
        .build()
        .unwrap()
}

/// Logical device attaching one moveable in slot `x`.
pub fn table_type(name: &str) -> Arc<DeviceType> {
    DeviceType::builder(name)
        .attach("x", AttachSpec::new("X axis", Capability::Moveable))
        .hardware_access(false)
        .build()
        .unwrap()
}
