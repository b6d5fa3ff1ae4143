//! Attachment dependency tracking between live devices.
//!
//! The dependency graph records which devices are attached to which others and
//! under which attach slot. It is used to:
//! - Refuse shutting down a device that other live devices still use
//! - Order bulk shutdown and mode transitions so dependents go first
//! - Clean up when a device goes away
//!
//! # Example
//!
//! ```rust
//! use daq_runtime::registry::dependencies::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//!
//! // Device "table" uses "motor_x" in its "x" slot
//! graph.add_assignment("table", "x", "motor_x");
//!
//! match graph.can_remove("motor_x") {
//!     Ok(()) => println!("motor_x is unused"),
//!     Err(users) => println!("motor_x used by {:?}", users),
//! }
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};

/// Tracks `device → {(dependent, slot)}` edges.
///
/// Names are stored exactly as given; the registry lower-cases them before
/// calling in.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    // attached device -> set of (dependent device, attach slot)
    dependents: HashMap<String, HashSet<(String, String)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `dependent` uses `device` in attach slot `slot`.
    ///
    /// Adding an existing edge is a no-op.
    pub fn add_assignment(&mut self, dependent: &str, slot: &str, device: &str) {
        self.dependents
            .entry(device.to_string())
            .or_default()
            .insert((dependent.to_string(), slot.to_string()));
    }

    /// Removes every slot through which `dependent` uses `device`.
    pub fn remove_assignment(&mut self, dependent: &str, device: &str) {
        if let Some(users) = self.dependents.get_mut(device) {
            users.retain(|(d, _)| d != dependent);
            if users.is_empty() {
                self.dependents.remove(device);
            }
        }
    }

    /// Drops all edges where `dependent` is the user, e.g. after it shut down.
    pub fn remove_dependent(&mut self, dependent: &str) {
        self.dependents.retain(|_, users| {
            users.retain(|(d, _)| d != dependent);
            !users.is_empty()
        });
    }

    /// All `(dependent, slot)` pairs using `device`, sorted.
    pub fn get_dependents(&self, device: &str) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .dependents
            .get(device)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// `Ok(())` if no device uses `device`, else the sorted, de-duplicated
    /// names of its users.
    pub fn can_remove(&self, device: &str) -> Result<(), Vec<String>> {
        let users: BTreeSet<String> = self
            .get_dependents(device)
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        if users.is_empty() {
            Ok(())
        } else {
            Err(users.into_iter().collect())
        }
    }

    /// Clears all dependency information for `device`.
    pub fn remove_all(&mut self, device: &str) {
        self.dependents.remove(device);
        self.remove_dependent(device);
    }

    /// Orders `devices` so every dependent precedes the devices it uses.
    ///
    /// Ties keep the order of the input. Edges that would form a cycle are
    /// ignored; such graphs cannot be built by the registry.
    pub fn dependents_first(&self, devices: &[String]) -> Vec<String> {
        let mut ordered = Vec::with_capacity(devices.len());
        let mut visited = HashSet::new();
        for name in devices {
            self.visit(name, devices, &mut visited, &mut ordered);
        }
        ordered
    }

    fn visit(
        &self,
        name: &str,
        universe: &[String],
        visited: &mut HashSet<String>,
        ordered: &mut Vec<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        for (user, _) in self.get_dependents(name) {
            if universe.contains(&user) {
                self.visit(&user, universe, visited, ordered);
            }
        }
        ordered.push(name.to_string());
    }
}
