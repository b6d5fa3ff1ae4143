//! # DAQ Device Runtime
//!
//! This crate is the device/parameter runtime underlying an instrument-control
//! environment. Every piece of controllable or readable hardware is modeled as a
//! [`Device`](device::Device) whose parameters are accessed through a shared,
//! time-stamped cache rather than always touching hardware.
//!
//! ## Crate Structure
//!
//! - **`validation`**: the composable validator algebra used to type-check and
//!   normalize parameter values and configuration input.
//! - **`parameter`**: `ParamSpec` tables and the `Override` patches subtypes use to
//!   refine inherited parameters.
//! - **`attach`**: attached-device slots with cardinality policies.
//! - **`device`**: device types (`DeviceType`, base tables) and live devices with the
//!   cache-coherent `get`/`set`, readable/moveable operations and info snapshots.
//! - **`registry`**: type and device registries plus the attachment dependency graph.
//! - **`session`**: device lifecycle with rollback, execution mode switches and
//!   device locks.
//! - **`cache`**: the `CacheBackend` contract, the in-process `MemoryCache` and the
//!   line-oriented wire codec.
//! - **`mode`**: the process-wide execution mode published as versioned snapshots.
//! - **`poller`**: background tasks keeping volatile parameters warm in the cache.
//! - **`clock`**: injected time sources, including a manual clock for tests.
//! - **`config`** / **`logging`**: figment-based configuration and tracing setup.
//! - **`error`**: the `DaqError` taxonomy.

pub mod attach;
pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod mode;
pub mod parameter;
pub mod poller;
pub mod registry;
pub mod session;
pub mod validation;

pub use error::{DaqError, DaqResult};
pub use mode::ExecutionMode;
pub use session::Session;
