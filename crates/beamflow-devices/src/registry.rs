/*!
 * Device registry for beamflow.
 *
 * The registry indexes the descriptors produced by one discovery cycle:
 * name lookup is exact, pattern lookup is regex over both the sanitized
 * and the original name, and iteration order is always discovery order.
 * A re-discovery replaces the whole registry in one step; it is never
 * partially updated.
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device::{Descriptor, DeviceKind, DeviceName};

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Event types for registry refreshes
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device appeared in the latest discovery cycle
    DeviceAdded(Descriptor),
    /// A device disappeared in the latest discovery cycle
    DeviceRemoved(DeviceName),
    /// A discovery cycle replaced the registry
    Refreshed {
        /// Number of devices now registered
        devices: usize,
    },
}

/// Insertion-ordered index of descriptors from one discovery cycle
#[derive(Debug, Default)]
pub struct Registry {
    order: Vec<DeviceName>,
    by_name: HashMap<DeviceName, Descriptor>,
    by_kind: HashMap<DeviceKind, Vec<DeviceName>>,
}

impl Registry {
    /// Build a registry from descriptors in discovery order
    ///
    /// Names are unique by construction: discovery fails a cycle that
    /// produces a collision before a registry is built from it.
    pub fn from_descriptors(descriptors: Vec<Descriptor>) -> Self {
        let mut registry = Registry::default();
        for descriptor in descriptors {
            registry.order.push(descriptor.name.clone());
            registry
                .by_kind
                .entry(descriptor.kind)
                .or_default()
                .push(descriptor.name.clone());
            registry.by_name.insert(descriptor.name.clone(), descriptor);
        }
        registry
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Exact-match lookup by sanitized name
    pub fn find_by_name(&self, name: &str) -> Option<&Descriptor> {
        self.by_name.get(&DeviceName::sanitize(name))
    }

    /// Regex lookup over sanitized and original names, in discovery order
    pub fn find_by_pattern(&self, pattern: &str) -> Result<Vec<&Descriptor>, regex::Error> {
        let regex = Regex::new(pattern)?;
        Ok(self
            .descriptors()
            .filter(|d| regex.is_match(d.name.as_str()) || regex.is_match(&d.original_name))
            .collect())
    }

    /// All descriptors of one kind, in discovery order
    pub fn find_by_kind(&self, kind: DeviceKind) -> Vec<&Descriptor> {
        self.by_kind
            .get(&kind)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| self.by_name.get(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterate descriptors in discovery order
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.order.iter().filter_map(|name| self.by_name.get(name))
    }

    /// Whether a device name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&DeviceName::sanitize(name))
    }
}

/// A shared, refreshable registry handle
///
/// Device handles hold one of these and re-check membership on every
/// operation, so a discovery cycle that drops a device invalidates the
/// handles bound to it.
#[derive(Debug, Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Registry>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl SharedRegistry {
    /// Create a shared registry around an initial snapshot
    pub fn new(registry: Registry) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(registry)),
            event_tx,
        }
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Exact-match lookup by sanitized name
    pub fn find_by_name(&self, name: &str) -> Option<Descriptor> {
        self.read().find_by_name(name).cloned()
    }

    /// Regex lookup over sanitized and original names, in discovery order
    pub fn find_by_pattern(&self, pattern: &str) -> Result<Vec<Descriptor>, regex::Error> {
        Ok(self
            .read()
            .find_by_pattern(pattern)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// All descriptors of one kind, in discovery order
    pub fn find_by_kind(&self, kind: DeviceKind) -> Vec<Descriptor> {
        self.read()
            .find_by_kind(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    /// All descriptors in discovery order
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.read().descriptors().cloned().collect()
    }

    /// Whether a device name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains(name)
    }

    /// Replace the registry wholesale with a new discovery snapshot
    pub fn replace(&self, registry: Registry) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let old_names: HashSet<DeviceName> = guard.order.iter().cloned().collect();
        let new_names: HashSet<DeviceName> = registry.order.iter().cloned().collect();

        for name in registry.order.iter() {
            if !old_names.contains(name) {
                if let Some(descriptor) = registry.by_name.get(name) {
                    debug!(device = %name, "device added");
                    let _ = self.event_tx.send(RegistryEvent::DeviceAdded(descriptor.clone()));
                }
            }
        }
        for name in old_names.difference(&new_names) {
            debug!(device = %name, "device removed");
            let _ = self.event_tx.send(RegistryEvent::DeviceRemoved(name.clone()));
        }

        let devices = registry.len();
        *guard = registry;
        drop(guard);

        let _ = self.event_tx.send(RegistryEvent::Refreshed { devices });
        info!(devices, "registry refreshed");
    }

    /// Subscribe to registry refresh events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new(Registry::default())
    }
}
