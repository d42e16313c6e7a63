//! In-memory adapter used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{AdapterError, AdapterEvent, BleAdapter};
use crate::core::bluetooth::types::{
    AdapterState, CharacteristicProperties, Device, DeviceId, DiscoveredService,
    GattCharacteristic,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MockCharacteristic {
    pub id: u128,
    pub properties: CharacteristicProperties,
}

impl MockCharacteristic {
    pub fn write_notify(id: u128) -> Self {
        Self {
            id,
            properties: CharacteristicProperties {
                write: true,
                notify: true,
                ..Default::default()
            },
        }
    }

    pub fn write_only(id: u128) -> Self {
        Self {
            id,
            properties: CharacteristicProperties {
                write: true,
                ..Default::default()
            },
        }
    }

    pub fn read_only(id: u128) -> Self {
        Self {
            id,
            properties: CharacteristicProperties {
                read: true,
                ..Default::default()
            },
        }
    }
}

impl GattCharacteristic for MockCharacteristic {
    fn uuid(&self) -> Uuid {
        Uuid::from_u128(self.id)
    }

    fn properties(&self) -> CharacteristicProperties {
        self.properties
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteBehavior {
    Ack,
    Zero,
    Fail,
}

pub struct MockAdapter {
    tx: mpsc::UnboundedSender<AdapterEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    state: Mutex<AdapterState>,
    scanning: AtomicBool,
    auto_events: AtomicBool,
    fail_connect: AtomicBool,
    trees: Mutex<HashMap<DeviceId, Vec<DiscoveredService<MockCharacteristic>>>>,
    connected: Mutex<HashSet<DeviceId>>,
    disconnect_requests: Mutex<Vec<DeviceId>>,
    writes: Mutex<Vec<String>>,
    write_behavior: Mutex<WriteBehavior>,
    write_delay: Mutex<Duration>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            state: Mutex::new(AdapterState::PoweredOn),
            scanning: AtomicBool::new(false),
            auto_events: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            trees: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            disconnect_requests: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            write_behavior: Mutex::new(WriteBehavior::Ack),
            write_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Registers the service tree a device reports once connected.
    pub fn with_device(self, id: &str, tree: Vec<Vec<MockCharacteristic>>) -> Self {
        let services = tree
            .into_iter()
            .enumerate()
            .map(|(i, characteristics)| DiscoveredService {
                uuid: Uuid::from_u128(0x1000 + i as u128),
                characteristics,
            })
            .collect();
        self.trees.lock().unwrap().insert(id.into(), services);
        self
    }

    /// When off, connect/disconnect requests raise no events; tests push them by hand.
    pub fn set_auto_events(&self, on: bool) {
        self.auto_events.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        *self.write_behavior.lock().unwrap() = behavior;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn push(&self, event: AdapterEvent) {
        if let AdapterEvent::DeviceDisconnected(id) = &event {
            self.connected.lock().unwrap().remove(id);
        }
        let _ = self.tx.send(event);
    }

    pub fn written(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn disconnect_requests(&self) -> Vec<DeviceId> {
        self.disconnect_requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl BleAdapter for MockAdapter {
    type Service = DiscoveredService<MockCharacteristic>;
    type Characteristic = MockCharacteristic;

    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        self.rx.lock().unwrap().take().ok_or(AdapterError::EventsTaken)
    }

    async fn state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, _timeout: Duration) -> Result<(), AdapterError> {
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), AdapterError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AdapterError::Operation("connection refused".into()));
        }
        self.connected.lock().unwrap().insert(device.clone());
        if self.auto_events.load(Ordering::SeqCst) {
            let _ = self.tx.send(AdapterEvent::DeviceConnected(Device::new(
                device.clone(),
                Some(format!("Robot {}", device)),
            )));
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), AdapterError> {
        self.disconnect_requests.lock().unwrap().push(device.clone());
        if self.auto_events.load(Ordering::SeqCst) {
            self.push(AdapterEvent::DeviceDisconnected(device.clone()));
        }
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceId) -> bool {
        self.connected.lock().unwrap().contains(device)
    }

    async fn services(&self, device: &DeviceId) -> Result<Vec<Self::Service>, AdapterError> {
        self.trees
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .ok_or_else(|| AdapterError::DeviceNotFound(device.clone()))
    }

    async fn characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<Self::Characteristic>, AdapterError> {
        Ok(service.characteristics.clone())
    }

    fn service_uuid(&self, service: &Self::Service) -> Uuid {
        service.uuid
    }

    async fn write(
        &self,
        _characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> Result<usize, AdapterError> {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let behavior = *self.write_behavior.lock().unwrap();
        match behavior {
            WriteBehavior::Ack => {
                self.writes
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(data).into_owned());
                Ok(data.len())
            }
            WriteBehavior::Zero => Ok(0),
            WriteBehavior::Fail => Err(AdapterError::Operation("GATT write error".into())),
        }
    }
}
