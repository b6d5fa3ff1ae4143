//! Device type and live device registries.
//!
//! [`TypeRegistry`] maps type names to their [`DeviceType`] tables.
//! [`DeviceRegistry`] owns the set of live devices keyed by lower-cased name,
//! marks devices that are still being constructed, and keeps the attachment
//! [`DependencyGraph`] in sync with registrations.

pub mod dependencies;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::device::{Device, DeviceType};
use crate::error::{DaqError, DaqResult};
use dependencies::DependencyGraph;

/// Instantiable device types by name.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<DeviceType>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete type. Abstract base types are rejected.
    pub fn register(&self, dtype: Arc<DeviceType>) -> DaqResult<()> {
        if dtype.is_abstract() {
            return Err(DaqError::Programming(format!(
                "device type {} is abstract and cannot be instantiated",
                dtype.name()
            )));
        }
        self.types.write().insert(dtype.name().to_string(), dtype);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceType>> {
        self.types.read().get(name).cloned()
    }

    /// Registered type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A name under construction.
///
/// Waiters hold a receiver of `done`; the channel closes when the owning
/// task publishes or unregisters the device. `waiting_on` is the attached
/// device the owner is currently resolving.
struct Pending {
    done: watch::Receiver<()>,
    waiting_on: Option<String>,
}

enum Slot {
    Constructing(Pending),
    Live(Arc<Device>),
}

/// Held by the task constructing a device. Dropping it wakes every task
/// waiting for the name.
pub(crate) struct ConstructionGuard {
    _done: watch::Sender<()>,
}

/// Result of reserving a name for construction.
pub(crate) enum Reservation {
    Fresh(ConstructionGuard),
    /// A non-unique type replaces this live instance
    Replacing(Arc<Device>, ConstructionGuard),
    /// Another task is constructing the name right now
    Busy(watch::Receiver<()>),
}

/// Outcome of looking up an attached device on behalf of a device under
/// construction.
pub(crate) enum Lookup {
    Live(Arc<Device>),
    /// Under construction by a task that does not wait on the requester
    Wait(watch::Receiver<()>),
    /// Waiting would close a loop back to the requester
    Cycle(Vec<String>),
    Absent,
}

#[derive(Default)]
pub struct DeviceRegistry {
    slots: RwLock<HashMap<String, Slot>>,
    graph: RwLock<DependencyGraph>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for a device about to be constructed.
    pub(crate) fn reserve(&self, name: &str, unique: bool) -> DaqResult<Reservation> {
        let key = name.to_lowercase();
        let mut slots = self.slots.write();
        let replacing = match slots.get(&key) {
            Some(Slot::Constructing(pending)) => return Ok(Reservation::Busy(pending.done.clone())),
            Some(Slot::Live(_)) if unique => {
                return Err(DaqError::config(name, "a device with this name already exists"))
            }
            Some(Slot::Live(old)) => {
                self.graph.write().remove_dependent(&key);
                Some(old.clone())
            }
            None => None,
        };
        let (tx, rx) = watch::channel(());
        slots.insert(
            key,
            Slot::Constructing(Pending {
                done: rx,
                waiting_on: None,
            }),
        );
        let guard = ConstructionGuard { _done: tx };
        Ok(match replacing {
            Some(old) => Reservation::Replacing(old, guard),
            None => Reservation::Fresh(guard),
        })
    }

    /// Look up `target` for `requester`, recording that the requester now
    /// waits on it.
    ///
    /// A target under construction is followed along the `waiting_on`
    /// chain; reaching the requester means the two constructions need each
    /// other and neither can finish.
    pub(crate) fn lookup_for(&self, requester: Option<&str>, target: &str) -> Lookup {
        let target = target.to_lowercase();
        let requester = requester.map(str::to_lowercase);
        let mut slots = self.slots.write();
        if let Some(req) = &requester {
            if let Some(Slot::Constructing(pending)) = slots.get_mut(req) {
                pending.waiting_on = Some(target.clone());
            }
        }

        let done = match slots.get(&target) {
            Some(Slot::Live(dev)) => return Lookup::Live(dev.clone()),
            Some(Slot::Constructing(pending)) => pending.done.clone(),
            None => return Lookup::Absent,
        };
        if let Some(req) = &requester {
            let mut path = vec![req.clone()];
            let mut current = Some(target.clone());
            while let Some(name) = current {
                path.push(name.clone());
                if name == *req {
                    return Lookup::Cycle(path);
                }
                if path[..path.len() - 1].contains(&name) {
                    break;
                }
                current = match slots.get(&name) {
                    Some(Slot::Constructing(pending)) => pending.waiting_on.clone(),
                    _ => None,
                };
            }
        }
        Lookup::Wait(done)
    }

    /// The requester finished resolving its current attached device.
    pub(crate) fn clear_waiting(&self, requester: &str) {
        if let Some(Slot::Constructing(pending)) = self.slots.write().get_mut(&requester.to_lowercase()) {
            pending.waiting_on = None;
        }
    }

    pub(crate) fn publish(&self, device: Arc<Device>) {
        self.slots
            .write()
            .insert(device.name().to_lowercase(), Slot::Live(device));
    }

    /// Remove `name` and every edge where it is the dependent.
    ///
    /// Edges from devices still using `name` are kept; callers check
    /// [`can_remove`](Self::can_remove) first where that matters.
    pub(crate) fn unregister(&self, name: &str) {
        let key = name.to_lowercase();
        self.slots.write().remove(&key);
        self.graph.write().remove_dependent(&key);
    }

    pub(crate) fn add_edge(&self, dependent: &str, slot: &str, device: &str) {
        self.graph
            .write()
            .add_assignment(&dependent.to_lowercase(), slot, &device.to_lowercase());
    }

    /// Live device by name.
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        match self.slots.read().get(&name.to_lowercase()) {
            Some(Slot::Live(dev)) => Some(dev.clone()),
            _ => None,
        }
    }

    pub fn is_constructing(&self, name: &str) -> bool {
        matches!(
            self.slots.read().get(&name.to_lowercase()),
            Some(Slot::Constructing(_))
        )
    }

    /// True if the name is registered, live or under construction.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().contains_key(&name.to_lowercase())
    }

    /// Names of live devices, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .read()
            .iter()
            .filter(|(_, s)| matches!(s, Slot::Live(_)))
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// `(dependent, slot)` pairs using `name`.
    pub fn dependents(&self, name: &str) -> Vec<(String, String)> {
        self.graph.read().get_dependents(&name.to_lowercase())
    }

    pub fn can_remove(&self, name: &str) -> Result<(), Vec<String>> {
        self.graph.read().can_remove(&name.to_lowercase())
    }

    /// Live devices ordered so dependents come before what they use.
    pub fn dependents_first(&self) -> Vec<Arc<Device>> {
        let order = self.graph.read().dependents_first(&self.names());
        order.iter().filter_map(|n| self.get(n)).collect()
    }
}
