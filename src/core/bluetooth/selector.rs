//! Picks the characteristic commands are written to.

use log::debug;

use crate::core::bluetooth::types::{DiscoveredService, GattCharacteristic};

/// Walks services then characteristics in platform order and returns the first
/// writable characteristic that can also notify or indicate. Failing that, the
/// first writable one. `None` when nothing in the tree accepts writes.
pub fn select_write_characteristic<C: GattCharacteristic>(
    services: &[DiscoveredService<C>],
) -> Option<&C> {
    let mut first_writable = None;

    for service in services {
        for characteristic in &service.characteristics {
            let properties = characteristic.properties();
            if !properties.is_writable() {
                continue;
            }
            if properties.can_notify() {
                debug!(
                    "Selected bidirectional characteristic {} in service {}",
                    characteristic.uuid(),
                    service.uuid
                );
                return Some(characteristic);
            }
            first_writable.get_or_insert(characteristic);
        }
    }

    if let Some(characteristic) = first_writable {
        debug!("Selected write-only characteristic {}", characteristic.uuid());
    }
    first_writable
}
