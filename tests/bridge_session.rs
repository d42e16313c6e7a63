use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_robot_bridge_lib::commands;
use ble_robot_bridge_lib::core::bluetooth::{
    AdapterError, AdapterEvent, AdapterState, BleAdapter, CharacteristicProperties,
    ConnectionPhase, Device, DeviceId, DiscoveredService, Direction, GattCharacteristic, SendError,
};
use ble_robot_bridge_lib::core::script::{ScriptEngine, ScriptError, ScriptHost, ScriptOutcome};
use ble_robot_bridge_lib::{AppState, BridgeConfig, BridgeEvent};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Pipe {
    uuid: Uuid,
    properties: CharacteristicProperties,
}

impl GattCharacteristic for Pipe {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn properties(&self) -> CharacteristicProperties {
        self.properties
    }
}

/// A robot with a battery service, a write-only config pipe and a UART style
/// write+notify pipe behind it.
struct FakeRadio {
    tx: mpsc::UnboundedSender<AdapterEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    scanning: AtomicBool,
    connected: Mutex<HashSet<DeviceId>>,
    writes: Mutex<Vec<(Uuid, String)>>,
}

impl FakeRadio {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            scanning: AtomicBool::new(false),
            connected: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn advertise(&self, id: &str, name: Option<&str>) {
        let _ = self.tx.send(AdapterEvent::DeviceDiscovered(Device::new(
            id,
            name.map(str::to_string),
        )));
    }

    fn drop_link(&self, id: &str) {
        self.connected.lock().unwrap().remove(&DeviceId::from(id));
        let _ = self.tx.send(AdapterEvent::DeviceDisconnected(id.into()));
    }

    fn writes(&self) -> Vec<(Uuid, String)> {
        self.writes.lock().unwrap().clone()
    }

    fn last_write(&self) -> Option<String> {
        self.writes().last().map(|(_, text)| text.clone())
    }
}

const UART: Uuid = Uuid::from_u128(0x6e40_0002);
const CONFIG: Uuid = Uuid::from_u128(0x2a00);

fn props(write: bool, notify: bool) -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        write,
        notify,
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl BleAdapter for FakeRadio {
    type Service = DiscoveredService<Pipe>;
    type Characteristic = Pipe;

    fn take_events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>, AdapterError> {
        self.rx.lock().unwrap().take().ok_or(AdapterError::EventsTaken)
    }

    async fn state(&self) -> AdapterState {
        AdapterState::PoweredOn
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
        self.connected.lock().unwrap().insert(device.clone());
        let _ = self
            .tx
            .send(AdapterEvent::DeviceConnected(Device::new(device.clone(), None)));
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), AdapterError> {
        self.drop_link(device.as_str());
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceId) -> bool {
        self.connected.lock().unwrap().contains(device)
    }

    async fn services(&self, _device: &DeviceId) -> Result<Vec<Self::Service>, AdapterError> {
        Ok(vec![
            DiscoveredService {
                uuid: Uuid::from_u128(0x180f),
                characteristics: vec![Pipe {
                    uuid: Uuid::from_u128(0x2a19),
                    properties: props(false, true),
                }],
            },
            DiscoveredService {
                uuid: Uuid::from_u128(0x6e40_0001),
                characteristics: vec![
                    Pipe {
                        uuid: CONFIG,
                        properties: props(true, false),
                    },
                    Pipe {
                        uuid: UART,
                        properties: props(true, true),
                    },
                ],
            },
        ])
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

    async fn write(&self, characteristic: &Pipe, data: &[u8]) -> Result<usize, AdapterError> {
        self.writes
            .lock()
            .unwrap()
            .push((characteristic.uuid, String::from_utf8_lossy(data).into_owned()));
        Ok(data.len())
    }
}

/// Drives forward and naps forever, checking nothing.
struct PatrolEngine;

impl ScriptEngine for PatrolEngine {
    fn name(&self) -> &'static str {
        "patrol"
    }

    fn execute(&self, _source: &str, host: Arc<dyn ScriptHost>) -> Result<(), ScriptError> {
        loop {
            host.drive("w")?;
            host.sleep_ms(5_000)?;
        }
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<BridgeEvent>, mut pred: F) -> BridgeEvent
where
    F: FnMut(&BridgeEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn state_with(engine: Arc<dyn ScriptEngine>) -> (AppState<FakeRadio>, Arc<FakeRadio>) {
    let radio = Arc::new(FakeRadio::new());
    let state = AppState::with_adapter(radio.clone(), engine, BridgeConfig::default())
        .expect("state builds");
    (state, radio)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_connect_drive_and_lose_the_link() {
    let (state, radio) = state_with(Arc::new(PatrolEngine));
    let mut rx = state.events.subscribe();

    commands::start_scan(&state).await.unwrap();
    radio.advertise("AA:01", Some("Scribby"));
    radio.advertise("AA:02", None);
    radio.advertise("AA:01", Some("Scribby"));
    wait_for(&mut rx, |e| matches!(e, BridgeEvent::DeviceDiscovered(_))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let devices = commands::list_devices(&state);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].display_name(), "Scribby");

    commands::connect_to_device("AA:01", &state).await.unwrap();
    let done = wait_for(&mut rx, |e| matches!(e, BridgeEvent::DiscoveryCompleted { .. })).await;
    assert!(matches!(done, BridgeEvent::DiscoveryCompleted { ready: true, .. }));
    assert_eq!(state.connection.phase(), ConnectionPhase::Ready);
    assert_eq!(state.connection.connected_device().unwrap().display_name(), "Scribby");

    commands::press_direction(Direction::Right, &state).await.unwrap();
    commands::release(&state).await.unwrap();
    assert_eq!(
        radio.writes(),
        vec![(UART, "d".to_string()), (UART, "s".to_string())]
    );

    radio.drop_link("AA:01");
    wait_for(&mut rx, |e| matches!(e, BridgeEvent::Disconnected(_))).await;
    assert!(!state.connection.is_ready());
    assert_eq!(
        commands::press_direction(Direction::Forward, &state).await,
        Err(SendError::NotConnected)
    );

    state.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_stops_a_sleeping_script() {
    let (state, radio) = state_with(Arc::new(PatrolEngine));
    let mut rx = state.events.subscribe();

    commands::connect_to_device("AA:01", &state).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, BridgeEvent::DiscoveryCompleted { .. })).await;

    let run_id = commands::run_script("patrol", &state).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(radio.last_write().as_deref(), Some("w"));

    commands::abort_script(&state).await.unwrap();
    assert_eq!(radio.last_write().as_deref(), Some("s"));

    let finished = wait_for(&mut rx, |e| matches!(e, BridgeEvent::ScriptFinished { .. })).await;
    match finished {
        BridgeEvent::ScriptFinished { run_id: id, outcome } => {
            assert_eq!(id, run_id);
            assert_eq!(outcome, ScriptOutcome::Aborted);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(radio.last_write().as_deref(), Some("s"));

    state.shutdown().await;
}

#[cfg(feature = "scripting")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rhai_script_drives_the_robot() {
    use ble_robot_bridge_lib::core::script::RhaiEngine;

    let (state, radio) = state_with(Arc::new(RhaiEngine::new()));
    let mut rx = state.events.subscribe();

    commands::connect_to_device("AA:01", &state).await.unwrap();
    wait_for(&mut rx, |e| matches!(e, BridgeEvent::DiscoveryCompleted { .. })).await;

    let source = r#"
        log_info("square");
        for i in 0..2 {
            drive("w");
            sleep_ms(10);
            send_d();
        }
        stop();
    "#;
    commands::run_script(source, &state).await.unwrap();
    let finished = wait_for(&mut rx, |e| matches!(e, BridgeEvent::ScriptFinished { .. })).await;
    assert!(matches!(
        finished,
        BridgeEvent::ScriptFinished {
            outcome: ScriptOutcome::Completed,
            ..
        }
    ));

    let sent: Vec<String> = radio.writes().into_iter().map(|(_, text)| text).collect();
    assert_eq!(sent, vec!["w", "d", "w", "d", "s"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        state
            .status_log
            .recent()
            .iter()
            .any(|line| line.message == "square")
    );

    state.shutdown().await;
}
