//! Process-wide execution mode.
//!
//! The mode is not a hidden global: a [`ModeContext`] is created by the
//! session and handed to every device. Transitions are published as a single
//! versioned [`ModeSnapshot`] through a `tokio::sync::watch` channel, so any
//! reader sees either the old or the new snapshot, never a mixture.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::DaqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Full read/write, hardware contacted, cache active.
    #[default]
    Master,
    /// Read-only; writes fail with a mode error.
    Slave,
    /// Writes only touch in-memory state; no cache, no hardware.
    Simulation,
    /// Full access for out-of-band recovery.
    Maintenance,
}

impl ExecutionMode {
    pub fn may_write(self) -> bool {
        self != ExecutionMode::Slave
    }

    pub fn uses_cache(self) -> bool {
        self != ExecutionMode::Simulation
    }

    pub fn is_simulation(self) -> bool {
        self == ExecutionMode::Simulation
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExecutionMode::Master => "master",
            ExecutionMode::Slave => "slave",
            ExecutionMode::Simulation => "simulation",
            ExecutionMode::Maintenance => "maintenance",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(ExecutionMode::Master),
            "slave" => Ok(ExecutionMode::Slave),
            "simulation" => Ok(ExecutionMode::Simulation),
            "maintenance" => Ok(ExecutionMode::Maintenance),
            _ => Err(DaqError::Configuration(format!(
                "Invalid mode '{s}'. Must be one of: master, slave, simulation, maintenance"
            ))),
        }
    }
}

/// One published mode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub mode: ExecutionMode,
    /// Incremented on every transition
    pub version: u64,
}

/// Shared, observable handle on the current mode.
#[derive(Debug, Clone)]
pub struct ModeContext {
    tx: Arc<watch::Sender<ModeSnapshot>>,
}

impl ModeContext {
    pub fn new(initial: ExecutionMode) -> Self {
        let (tx, _rx) = watch::channel(ModeSnapshot {
            mode: initial,
            version: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        *self.tx.borrow()
    }

    pub fn current(&self) -> ExecutionMode {
        self.tx.borrow().mode
    }

    pub fn subscribe(&self) -> watch::Receiver<ModeSnapshot> {
        self.tx.subscribe()
    }

    /// Publish a new mode. Returns the new snapshot.
    pub(crate) fn publish(&self, mode: ExecutionMode) -> ModeSnapshot {
        let mut published = self.snapshot();
        self.tx.send_modify(|snap| {
            snap.mode = mode;
            snap.version += 1;
            published = *snap;
        });
        published
    }
}
