//! Bluetooth functionality for the robot bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, characteristic selection and command writes.

mod adapter;
mod bluest_adapter;
mod channel;
mod commands;
mod connection;
mod constants;
mod registry;
mod selector;
mod types;

#[cfg(test)]
pub(crate) mod mock;

// Re-export types that should be publicly accessible
pub use adapter::{AdapterError, AdapterEvent, BleAdapter};
pub use bluest_adapter::{BluestAdapter, BluestCharacteristic};
pub use channel::{CommandChannel, SendError};
pub use commands::{CommandParseError, CommandSender, Direction, RobotCommand};
pub use connection::{ConnectionManager, ConnectionOptions};
pub use constants::*; // Re-export all constants
pub use registry::DeviceRegistry;
pub use selector::select_write_characteristic;
pub use types::{
    AdapterState, CharacteristicProperties, ConnectionPhase, ConnectionSession,
    ConnectionState, Device, DeviceId, DiscoveredService, GattCharacteristic,
};
