//! `BleAdapter` over the bluest crate.
//! bluest reports scan results as a stream and connections as plain futures, so
//! this adapter synthesises the lifecycle events the connection manager consumes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, ConnectionEvent, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterError, AdapterEvent, BleAdapter};
use crate::core::bluetooth::types::{
    AdapterState, CharacteristicProperties, Device, DeviceId, GattCharacteristic,
};

type DeviceMap = Arc<Mutex<HashMap<DeviceId, bluest::Device>>>;

fn encode_state(state: AdapterState) -> u8 {
    match state {
        AdapterState::Unknown => 0,
        AdapterState::Unavailable => 1,
        AdapterState::PoweredOff => 2,
        AdapterState::PoweredOn => 3,
    }
}

fn decode_state(raw: u8) -> AdapterState {
    match raw {
        1 => AdapterState::Unavailable,
        2 => AdapterState::PoweredOff,
        3 => AdapterState::PoweredOn,
        _ => AdapterState::Unknown,
    }
}

/// A bluest characteristic with its properties read once at enumeration.
#[derive(Debug, Clone)]
pub struct BluestCharacteristic {
    inner: Characteristic,
    uuid: Uuid,
    properties: CharacteristicProperties,
}

impl GattCharacteristic for BluestCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        self.properties
    }
}

pub struct BluestAdapter {
    adapter: Adapter,
    devices: DeviceMap,
    tx: mpsc::UnboundedSender<AdapterEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    scanning: Arc<AtomicBool>,
    /// Last availability reported by the adapter's event stream
    state: Arc<AtomicU8>,
    scan_cancel: Mutex<CancellationToken>,
    link_watchers: Mutex<HashMap<DeviceId, CancellationToken>>,
    watch_interval: Duration,
    shutdown: CancellationToken,
}

impl BluestAdapter {
    /// Opens the default adapter and waits for it to become available.
    pub async fn new(watch_interval: Duration) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let (tx, rx) = mpsc::unbounded_channel();
        let this = Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            tx,
            rx: Mutex::new(Some(rx)),
            scanning: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(encode_state(AdapterState::PoweredOn))),
            scan_cancel: Mutex::new(CancellationToken::new()),
            link_watchers: Mutex::new(HashMap::new()),
            watch_interval,
            shutdown: CancellationToken::new(),
        };
        this.spawn_state_watcher();
        Ok(this)
    }

    fn device(&self, id: &DeviceId) -> Result<bluest::Device, AdapterError> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::DeviceNotFound(id.clone()))
    }

    fn emit(&self, event: AdapterEvent) {
        if self.tx.send(event).is_err() {
            debug!("Adapter event dropped: nobody is listening");
        }
    }

    /// Tracks availability changes of the local adapter.
    fn spawn_state_watcher(&self) {
        let adapter = self.adapter.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Adapter events unavailable: {}", e);
                    return;
                }
            };
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.next() => event,
                };
                let next = match event {
                    Some(Ok(bluest::AdapterEvent::Available)) => AdapterState::PoweredOn,
                    Some(Ok(bluest::AdapterEvent::Unavailable)) => AdapterState::PoweredOff,
                    Some(Err(e)) => {
                        warn!("Adapter event error: {}", e);
                        continue;
                    }
                    None => break,
                };
                if state.swap(encode_state(next), Ordering::SeqCst) != encode_state(next)
                    && tx.send(AdapterEvent::AdapterStateChanged(next)).is_err()
                {
                    break;
                }
            }
        });
    }

    /// Emits `DeviceDisconnected` once the link to `device` drops on its own.
    fn watch_link(&self, id: DeviceId, device: bluest::Device) {
        let token = CancellationToken::new();
        self.link_watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), token.clone());

        let adapter = self.adapter.clone();
        let tx = self.tx.clone();
        let interval = self.watch_interval;
        tokio::spawn(async move {
            match adapter.device_connection_events(&device).await {
                Ok(mut events) => loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        event = events.next() => match event {
                            Some(ConnectionEvent::Connected) => {}
                            Some(ConnectionEvent::Disconnected) => break,
                            None => {
                                debug!("Connection events for {} ended", id);
                                return;
                            }
                        },
                    }
                },
                // Some platforms only report connection events for their own connects.
                Err(e) => {
                    debug!("No connection events for {} ({}), polling instead", id, e);
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {}
                            _ = token.cancelled() => return,
                        }
                        if !device.is_connected().await {
                            break;
                        }
                    }
                }
            }
            info!("Link to {} dropped", id);
            let _ = tx.send(AdapterEvent::DeviceDisconnected(id));
        });
    }

    fn stop_watching(&self, id: &DeviceId) {
        if let Some(token) = self
            .link_watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
        {
            token.cancel();
        }
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceMap,
        tx: mpsc::UnboundedSender<AdapterEvent>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        info!("Starting bluetooth scan");
        let scan_stream = adapter.scan(&[]).await?;
        tokio::pin!(scan_stream);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered) => {
                            let device = discovered.device;
                            let id = DeviceId::new(device.id().to_string());
                            let name = device.name().ok();
                            debug!("Found device - ID: {}, Name: {:?}, RSSI: {:?}", id, name, discovered.rssi);

                            devices
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(id.clone(), device);
                            let _ = tx.send(AdapterEvent::DeviceDiscovered(Device::new(id, name)));
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    let _ = tx.send(AdapterEvent::ScanTimeoutElapsed);
                    break;
                }
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}

impl Drop for BluestAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.scan_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        for (_, token) in self
            .link_watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            token.cancel();
        }
    }
}

#[async_trait::async_trait]
impl BleAdapter for BluestAdapter {
    type Service = Service;
    type Characteristic = BluestCharacteristic;

    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(AdapterError::EventsTaken)
    }

    async fn state(&self) -> AdapterState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, timeout: Duration) -> Result<(), AdapterError> {
        let cancel = CancellationToken::new();
        *self.scan_cancel.lock().unwrap_or_else(|e| e.into_inner()) = cancel.clone();
        self.scanning.store(true, Ordering::SeqCst);

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let tx = self.tx.clone();
        let scanning = self.scanning.clone();

        tokio::spawn(async move {
            if let Err(e) =
                Self::internal_scan_task(adapter, devices, tx.clone(), cancel, timeout).await
            {
                error!("Scan task finished with an error: {:?}", e);
                let _ = tx.send(AdapterEvent::ScanTimeoutElapsed);
            }
            scanning.store(false, Ordering::SeqCst);
        });
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        info!("Stopping Bluetooth scan.");
        self.scan_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), AdapterError> {
        let device = self.device(id)?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(&device).await?;
        }
        self.watch_link(id.clone(), device.clone());
        self.emit(AdapterEvent::DeviceConnected(Device::new(
            id.clone(),
            device.name().ok(),
        )));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), AdapterError> {
        let device = self.device(id)?;
        self.stop_watching(id);
        if device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("Device {} not connected", id);
        }
        self.emit(AdapterEvent::DeviceDisconnected(id.clone()));
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> bool {
        match self.device(id) {
            Ok(device) => device.is_connected().await,
            Err(_) => false,
        }
    }

    async fn services(&self, id: &DeviceId) -> Result<Vec<Self::Service>, AdapterError> {
        let device = self.device(id)?;
        Ok(device.services().await?)
    }

    async fn characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<Self::Characteristic>, AdapterError> {
        let mut out = Vec::new();
        for characteristic in service.characteristics().await? {
            let props = characteristic.properties().await?;
            out.push(BluestCharacteristic {
                uuid: characteristic.uuid(),
                properties: CharacteristicProperties {
                    read: props.read,
                    write: props.write,
                    write_without_response: props.write_without_response,
                    notify: props.notify,
                    indicate: props.indicate,
                },
                inner: characteristic,
            });
        }
        Ok(out)
    }

    fn service_uuid(&self, service: &Self::Service) -> Uuid {
        service.uuid()
    }

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> Result<usize, AdapterError> {
        if characteristic.properties.write {
            characteristic.inner.write(data).await?;
        } else {
            characteristic.inner.write_without_response(data).await?;
        }
        Ok(data.len())
    }
}
