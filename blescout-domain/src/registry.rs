use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::{device::Device, discover::DiscoveryEvent, snapshot::Snapshot};

/// How long a device may go unseen before it is evicted.
pub const EVICTION_WINDOW: Duration = Duration::minutes(5);

/// How often the eviction sweep runs.
pub const EVICTION_PERIOD: Duration = Duration::seconds(30);

/// Devices currently in view, keyed by address.
#[derive(Default, Debug)]
pub struct Registry {
    devices: HashMap<String, Device>,
    next_sequence: u64,
}

impl Registry {
    pub fn upsert(&mut self, event: &DiscoveryEvent) {
        if let Some(device) = self.devices.get_mut(&event.address) {
            device.update(event);
        } else {
            let device = Device::from_event(event, self.next_sequence);
            self.next_sequence += 1;
            self.devices.insert(event.address.clone(), device);
        }
    }

    /// Drops every non-favorite device last seen more than `window` before
    /// `now`. Returns how many were removed.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, window: Duration) -> usize {
        let before = self.devices.len();
        self.devices
            .retain(|_, d| d.favorite || now - d.last_seen <= window);
        before - self.devices.len()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Flips the favorite flag. Returns the new value, `None` if the address
    /// is unknown.
    pub fn toggle_favorite(&mut self, address: &str) -> Option<bool> {
        let device = self.devices.get_mut(address)?;
        device.favorite = !device.favorite;
        Some(device.favorite)
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.get(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.sequence);
        Snapshot(devices)
    }
}

/// The writable handle. Whoever holds one is the registry's owner.
#[derive(Default, Debug, Clone)]
pub struct SharedRegistry(Arc<RwLock<Registry>>);

impl SharedRegistry {
    #[must_use]
    pub fn new() -> SharedRegistry {
        SharedRegistry::default()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.0.write()
    }

    #[must_use]
    pub fn reader(&self) -> RegistryReader {
        RegistryReader(Arc::clone(&self.0))
    }
}

/// Read-only view handed to consumers; all they can do is copy.
#[derive(Debug, Clone)]
pub struct RegistryReader(Arc<RwLock<Registry>>);

impl RegistryReader {
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.0.read().snapshot()
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<Device> {
        self.0.read().get(address).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
