//! Platform adapter seam
//! Everything the core needs from a BLE stack: scanning, connecting, GATT
//! enumeration, writes, and a stream of lifecycle events.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::bluetooth::types::{
    AdapterState, Device, DeviceId, DiscoveredService, GattCharacteristic,
};

/// Events raised by the platform adapter, in the order they happened.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    DeviceDiscovered(Device),
    DeviceConnected(Device),
    DeviceDisconnected(DeviceId),
    ScanTimeoutElapsed,
    AdapterStateChanged(AdapterState),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bluetooth adapter not available")]
    Unavailable,
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),
    #[error("device not connected: {0}")]
    NotConnected(DeviceId),
    #[error("event stream already taken")]
    EventsTaken,
    #[error("{0}")]
    Operation(String),
}

impl From<bluest::Error> for AdapterError {
    fn from(err: bluest::Error) -> Self {
        Self::Operation(err.to_string())
    }
}

/// Platform BLE primitives consumed by the connection manager.
#[async_trait::async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    type Service: Clone + Send + Sync + 'static;
    type Characteristic: GattCharacteristic;

    /// Hands out the event stream. Only the first caller gets it.
    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError>;

    async fn state(&self) -> AdapterState;

    fn is_scanning(&self) -> bool;

    /// Starts discovery; the adapter stops on its own after `timeout` and raises
    /// [`AdapterEvent::ScanTimeoutElapsed`].
    async fn start_scan(&self, timeout: Duration) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Requests a connection; success is reported by [`AdapterEvent::DeviceConnected`].
    async fn connect(&self, device: &DeviceId) -> Result<(), AdapterError>;

    /// Requests a disconnect; completion is reported by [`AdapterEvent::DeviceDisconnected`].
    async fn disconnect(&self, device: &DeviceId) -> Result<(), AdapterError>;

    async fn is_connected(&self, device: &DeviceId) -> bool;

    async fn services(&self, device: &DeviceId) -> Result<Vec<Self::Service>, AdapterError>;

    async fn characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<Self::Characteristic>, AdapterError>;

    fn service_uuid(&self, service: &Self::Service) -> uuid::Uuid;

    /// Writes `data`, returning the number of bytes the stack accepted.
    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> Result<usize, AdapterError>;

    /// Enumerates services, then each service's characteristics, preserving platform order.
    async fn service_tree(
        &self,
        device: &DeviceId,
    ) -> Result<Vec<DiscoveredService<Self::Characteristic>>, AdapterError> {
        let mut tree = Vec::new();
        for service in self.services(device).await? {
            let characteristics = self.characteristics(&service).await?;
            tree.push(DiscoveredService {
                uuid: self.service_uuid(&service),
                characteristics,
            });
        }
        Ok(tree)
    }
}
