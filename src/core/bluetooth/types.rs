//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Stable, platform-specific identifier of a peripheral.
///
/// Used for de-duplication and equality; two handles with the same id are the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Link state of a discovered device, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    /// Platform-specific unique identifier for the device
    pub id: DeviceId,
    /// The advertised name of the device, display only
    pub name: Option<String>,
    /// Current link state
    pub connection_state: ConnectionState,
}

impl Device {
    /// Creates a new, disconnected Device
    pub fn new(id: impl Into<DeviceId>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            connection_state: ConnectionState::Disconnected,
        }
    }

    /// Name to show to a user, falling back to "Unknown".
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

/// GATT capability flags relevant to command writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Accepts writes with or without response.
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Can push data back to us.
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic handle as exposed by an adapter.
pub trait GattCharacteristic: Clone + fmt::Debug + Send + Sync + 'static {
    fn uuid(&self) -> Uuid;
    fn properties(&self) -> CharacteristicProperties;
}

/// One service of a discovered service tree with its characteristics, in platform order.
#[derive(Debug, Clone)]
pub struct DiscoveredService<C> {
    pub uuid: Uuid,
    pub characteristics: Vec<C>,
}

/// Power/availability state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Unknown,
    Unavailable,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Unavailable => "Unavailable",
            Self::PoweredOff => "Off",
            Self::PoweredOn => "On",
        };
        f.write_str(s)
    }
}

/// Lifecycle phase of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionPhase {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
}

/// Represents the single active connection.
/// This struct holds the active handles needed for interaction.
///
/// `is_ready` implies a selected characteristic and a connected device.
#[derive(Debug, Clone)]
pub struct ConnectionSession<C> {
    /// The connected device
    pub device: Device,
    /// The characteristic handle commands are written to
    pub primary_write_characteristic: Option<C>,
    /// Whether commands may be sent
    pub is_ready: bool,
}

impl<C> ConnectionSession<C> {
    pub fn new(mut device: Device) -> Self {
        device.connection_state = ConnectionState::Connected;
        Self {
            device,
            primary_write_characteristic: None,
            is_ready: false,
        }
    }

    /// Installs the selected characteristic; readiness follows the selection.
    pub fn set_primary(&mut self, characteristic: Option<C>) {
        self.is_ready = characteristic.is_some()
            && self.device.connection_state == ConnectionState::Connected;
        self.primary_write_characteristic = characteristic;
    }
}
