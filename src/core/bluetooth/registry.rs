//! Ordered, duplicate-free list of discovered devices.

use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::core::bluetooth::types::{ConnectionState, Device, DeviceId};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Device>> {
        // A panic while holding the lock cannot leave the list half-written.
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a device unless it is unnamed or already listed. Returns whether it was added.
    pub fn on_discovered(&self, device: Device) -> bool {
        let named = device.name.as_deref().is_some_and(|n| !n.trim().is_empty());
        if !named {
            debug!("Ignoring unnamed device {}", device.id);
            return false;
        }

        let mut devices = self.lock();
        if devices.iter().any(|d| d.id == device.id) {
            return false;
        }
        debug!("Registered device {} ({})", device.display_name(), device.id);
        devices.push(device);
        true
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Devices in discovery order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.lock().clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.lock().iter().find(|d| &d.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn set_connection_state(&self, id: &DeviceId, state: ConnectionState) {
        if let Some(device) = self.lock().iter_mut().find(|d| &d.id == id) {
            device.connection_state = state;
        }
    }
}
