//! Bluetooth connection handling for the robot
//! This module owns the single active session: scan, connect, service
//! discovery, characteristic selection and teardown.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdapterError, AdapterEvent, BleAdapter};
use crate::core::bluetooth::channel::{CommandChannel, SendError};
use crate::core::bluetooth::commands::{CommandSender, RobotCommand};
use crate::core::bluetooth::constants::{DEFAULT_SCAN_DURATION_SECS, SESSION_TEARDOWN_TIMEOUT_MS};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::selector::select_write_characteristic;
use crate::core::bluetooth::types::{
    AdapterState, ConnectionPhase, ConnectionSession, ConnectionState, Device, DeviceId,
};
use crate::core::events::{BridgeEvent, EventSink};

/// Tunables for the connection lifecycle
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub scan_timeout: Duration,
    /// Upper bound on waiting for an old session's disconnect event
    pub teardown_timeout: Duration,
    /// Drop the link when discovery finds nothing to write to
    pub disconnect_on_unusable: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_DURATION_SECS),
            teardown_timeout: Duration::from_millis(SESSION_TEARDOWN_TIMEOUT_MS),
            disconnect_on_unusable: true,
        }
    }
}

struct Inner<C> {
    phase: ConnectionPhase,
    session: Option<ConnectionSession<C>>,
    /// Device a connect request is outstanding for
    pending: Option<DeviceId>,
}

impl<C> Inner<C> {
    fn active_device(&self) -> Option<DeviceId> {
        self.session
            .as_ref()
            .map(|s| s.device.id.clone())
            .or_else(|| self.pending.clone())
    }

    fn is_busy(&self) -> bool {
        self.session.is_some() || self.pending.is_some()
    }
}

/// Connection manager for the robot
pub struct ConnectionManager<A: BleAdapter> {
    adapter: Arc<A>,
    registry: DeviceRegistry,
    channel: CommandChannel<A>,
    events: EventSink,
    options: ConnectionOptions,
    inner: Mutex<Inner<A::Characteristic>>,
    /// True while a session or connect attempt exists
    busy: watch::Sender<bool>,
}

impl<A: BleAdapter> ConnectionManager<A> {
    pub fn new(adapter: Arc<A>, events: EventSink, options: ConnectionOptions) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            channel: CommandChannel::new(adapter.clone(), events.clone()),
            adapter,
            registry: DeviceRegistry::new(),
            events,
            options,
            inner: Mutex::new(Inner {
                phase: ConnectionPhase::Idle,
                session: None,
                pending: None,
            }),
            busy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<A::Characteristic>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_busy(&self, inner: &Inner<A::Characteristic>) {
        self.busy.send_replace(inner.is_busy());
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Discovered devices in discovery order
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.lock().phase
    }

    pub fn is_ready(&self) -> bool {
        self.lock().session.as_ref().is_some_and(|s| s.is_ready)
    }

    pub fn connected_device(&self) -> Option<Device> {
        self.lock().session.as_ref().map(|s| s.device.clone())
    }

    pub fn primary_write_characteristic(&self) -> Option<A::Characteristic> {
        self.lock()
            .session
            .as_ref()
            .and_then(|s| s.primary_write_characteristic.clone())
    }

    /// Starts discovery. Does nothing when already scanning or the adapter is not powered on.
    /// An existing session is torn down first. Returns whether a scan was started.
    pub async fn start_scanning(&self, timeout: Option<Duration>) -> bool {
        let state = self.adapter.state().await;
        if state != AdapterState::PoweredOn {
            self.events.status("Bluetooth is not enabled");
            return false;
        }
        if self.adapter.is_scanning() {
            debug!("Scan already running");
            return false;
        }

        self.teardown_existing().await;
        self.registry.clear();
        self.lock().phase = ConnectionPhase::Scanning;
        self.events.status("Scanning for devices...");

        let timeout = timeout.unwrap_or(self.options.scan_timeout);
        match self.adapter.start_scan(timeout).await {
            Ok(()) => {
                info!("Device scan started for {:?}", timeout);
                true
            }
            Err(e) => {
                self.leave_scanning();
                self.events.status(format!("Scan error: {}", e));
                false
            }
        }
    }

    pub async fn stop_scanning(&self) {
        if !self.adapter.is_scanning() {
            return;
        }
        if let Err(e) = self.adapter.stop_scan().await {
            self.events.status(format!("Scan error: {}", e));
        }
        self.leave_scanning();
    }

    fn leave_scanning(&self) {
        let mut inner = self.lock();
        if inner.phase == ConnectionPhase::Scanning {
            inner.phase = ConnectionPhase::Idle;
        }
    }

    /// Requests a connection to `id`. Scanning is stopped and any other session torn
    /// down first. Service discovery follows the adapter's connected event.
    /// Returns false (after a status message) when the adapter refuses.
    pub async fn connect(&self, id: &DeviceId) -> bool {
        self.stop_scanning().await;

        let already = {
            let inner = self.lock();
            inner
                .session
                .as_ref()
                .is_some_and(|s| &s.device.id == id && s.is_ready)
        };
        if already {
            info!("Device {} already connected.", id);
            return true;
        }

        self.teardown_existing().await;

        let name = self
            .registry
            .get(id)
            .map(|d| d.display_name().to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        {
            let mut inner = self.lock();
            inner.pending = Some(id.clone());
            inner.phase = ConnectionPhase::Connecting;
            self.publish_busy(&inner);
        }
        self.registry.set_connection_state(id, ConnectionState::Connecting);
        self.events.status(format!("Connecting to {}...", name));

        match self.adapter.connect(id).await {
            Ok(()) => true,
            Err(e) => {
                {
                    let mut inner = self.lock();
                    if inner.pending.as_ref() == Some(id) {
                        inner.pending = None;
                        if inner.session.is_none() {
                            inner.phase = ConnectionPhase::Idle;
                        }
                    }
                    self.publish_busy(&inner);
                }
                self.registry.set_connection_state(id, ConnectionState::Disconnected);
                self.events.status(format!("Connection error: {}", e));
                false
            }
        }
    }

    /// Asks the adapter to drop the current link. State is cleared only when the
    /// adapter reports the disconnect.
    pub async fn disconnect(&self) {
        let target = self.lock().active_device();
        match target {
            Some(id) => {
                info!("Disconnecting from device {}", id);
                if let Err(e) = self.adapter.disconnect(&id).await {
                    self.events.status(format!("Disconnect error: {}", e));
                }
            }
            None => debug!("No device connected"),
        }
    }

    /// Disconnects whatever is active and waits until the disconnect handler has run.
    async fn teardown_existing(&self) {
        let Some(id) = self.lock().active_device() else {
            return;
        };
        info!("Tearing down session with {} first", id);

        let mut busy = self.busy.subscribe();
        self.disconnect().await;

        let cleared = matches!(
            tokio::time::timeout(self.options.teardown_timeout, busy.wait_for(|busy| !*busy))
                .await,
            Ok(Ok(_))
        );
        if !cleared {
            warn!("No disconnect event for {} in time, clearing locally", id);
            self.handle_disconnected(&id);
        }
    }

    /// Enumerates the connected device's services, selects the write characteristic and
    /// marks the session ready when one was found. Always emits exactly one
    /// [`BridgeEvent::DiscoveryCompleted`].
    pub async fn discover_services_and_select_characteristic(&self) -> bool {
        let device = self.lock().session.as_ref().map(|s| s.device.clone());
        let connected = match &device {
            Some(device) => self.adapter.is_connected(&device.id).await,
            None => false,
        };
        let Some(device) = device.filter(|_| connected) else {
            self.events.status("Not connected. Cannot discover services.");
            self.events.emit(BridgeEvent::DiscoveryCompleted {
                device: None,
                ready: false,
            });
            return false;
        };

        {
            let mut inner = self.lock();
            if let Some(session) = inner.session.as_mut() {
                session.set_primary(None);
            }
            inner.phase = ConnectionPhase::DiscoveringServices;
        }

        let ready = match self.adapter.service_tree(&device.id).await {
            Ok(tree) => {
                let selected = select_write_characteristic(&tree).cloned();
                let found = selected.is_some();
                let ready = {
                    let mut inner = self.lock();
                    match inner.session.as_mut() {
                        Some(session) if session.device.id == device.id => {
                            session.set_primary(selected);
                            let ready = session.is_ready;
                            if ready {
                                inner.phase = ConnectionPhase::Ready;
                            }
                            ready
                        }
                        _ => false,
                    }
                };
                if ready {
                    self.events.status("Service discovery complete. Ready.");
                } else if !found {
                    self.events
                        .status("Discovery complete, but no writable characteristic found.");
                } else {
                    self.events.status("Device disconnected during service discovery.");
                }
                ready
            }
            Err(e) => {
                self.events.status(format!("Service discovery error: {}", e));
                false
            }
        };

        self.events.emit(BridgeEvent::DiscoveryCompleted {
            device: Some(device.id.clone()),
            ready,
        });

        if !ready && self.options.disconnect_on_unusable {
            let still_ours = self.lock().active_device().as_ref() == Some(&device.id);
            if still_ours {
                self.events
                    .status("Connection failed: No usable characteristic found.");
                self.disconnect().await;
            }
        }
        ready
    }

    /// Applies one adapter event.
    pub async fn handle_event(&self, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceDiscovered(device) => {
                if self.registry.on_discovered(device.clone()) {
                    self.events.emit(BridgeEvent::DeviceDiscovered(device));
                }
            }
            AdapterEvent::DeviceConnected(device) => self.handle_connected(device).await,
            AdapterEvent::DeviceDisconnected(id) => {
                self.handle_disconnected(&id);
            }
            AdapterEvent::ScanTimeoutElapsed => {
                self.leave_scanning();
                self.events.status("Scan completed");
                self.events.emit(BridgeEvent::ScanCompleted);
            }
            AdapterEvent::AdapterStateChanged(state) => {
                self.events.status(format!("Bluetooth: {}", state));
            }
        }
    }

    async fn handle_connected(&self, mut device: Device) {
        if let Some(known) = self.registry.get(&device.id) {
            device.name = device.name.or(known.name);
        }
        {
            let mut inner = self.lock();
            if let Some(session) = &inner.session {
                if session.device.id != device.id {
                    warn!(
                        "Ignoring connection from {} while {} is active",
                        device.id, session.device.id
                    );
                }
                return;
            }
            if inner.pending.as_ref() != Some(&device.id) {
                warn!("Ignoring unrequested connection from {}", device.id);
                return;
            }
            inner.pending = None;
            inner.session = Some(ConnectionSession::new(device.clone()));
            inner.phase = ConnectionPhase::DiscoveringServices;
            self.publish_busy(&inner);
        }
        self.registry.set_connection_state(&device.id, ConnectionState::Connected);
        self.events.status(format!(
            "Connected to {}. Discovering services...",
            device.display_name()
        ));
        self.discover_services_and_select_characteristic().await;
    }

    /// The one place session state is cleared. Runs the cleanup before the
    /// `Disconnected` notification and ignores repeats for a device already gone.
    fn handle_disconnected(&self, id: &DeviceId) -> bool {
        let cleared = {
            let mut inner = self.lock();
            let mut cleared = false;
            if inner.session.as_ref().is_some_and(|s| &s.device.id == id) {
                inner.session = None;
                cleared = true;
            }
            if inner.pending.as_ref() == Some(id) {
                inner.pending = None;
                cleared = true;
            }
            if cleared {
                inner.phase = if inner.pending.is_some() {
                    ConnectionPhase::Connecting
                } else {
                    ConnectionPhase::Idle
                };
                self.publish_busy(&inner);
            }
            cleared
        };

        if !cleared {
            debug!("Ignoring disconnect of {}: no session", id);
            return false;
        }
        self.registry.set_connection_state(id, ConnectionState::Disconnected);
        self.events.status("Device disconnected.");
        self.events.emit(BridgeEvent::Disconnected(id.clone()));
        true
    }

    /// Pumps adapter events into [`Self::handle_event`] until `cancel` fires.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>, AdapterError> {
        let mut rx = self.adapter.take_events()?;
        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => manager.handle_event(event).await,
                        None => {
                            info!("Adapter event stream has ended.");
                            break;
                        }
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }

    /// Sends `command` over the ready session.
    pub async fn send_command(&self, command: &RobotCommand) -> Result<(), SendError> {
        let characteristic = {
            let inner = self.lock();
            inner
                .session
                .as_ref()
                .filter(|s| s.is_ready)
                .and_then(|s| s.primary_write_characteristic.clone())
        };
        let Some(characteristic) = characteristic else {
            self.events.status("Error: Not connected.");
            return Err(SendError::NotConnected);
        };
        self.channel.send(Some(&characteristic), command).await
    }
}

#[async_trait::async_trait]
impl<A: BleAdapter> CommandSender for ConnectionManager<A> {
    async fn send_command(&self, command: &RobotCommand) -> Result<(), SendError> {
        ConnectionManager::send_command(self, command).await
    }

    async fn is_ready(&self) -> bool {
        ConnectionManager::is_ready(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{MockAdapter, MockCharacteristic};
    use tokio::sync::broadcast;

    fn robot_tree() -> Vec<Vec<MockCharacteristic>> {
        vec![
            vec![MockCharacteristic::read_only(1)],
            vec![
                MockCharacteristic::write_only(2),
                MockCharacteristic::write_notify(3),
            ],
        ]
    }

    fn manager(adapter: MockAdapter) -> Arc<ConnectionManager<MockAdapter>> {
        let options = ConnectionOptions {
            teardown_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        Arc::new(ConnectionManager::new(Arc::new(adapter), EventSink::new(64), options))
    }

    /// Feeds every queued adapter event through the manager.
    async fn pump(
        manager: &ConnectionManager<MockAdapter>,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<AdapterEvent>,
    ) {
        while let Ok(event) = rx.try_recv() {
            manager.handle_event(event).await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn connect_discovers_and_becomes_ready() {
        let manager = manager(MockAdapter::new().with_device("A", robot_tree()));
        let mut adapter_rx = manager.adapter().take_events().unwrap();
        let mut events = manager.events().subscribe();

        assert!(manager.connect(&"A".into()).await);
        assert_eq!(manager.phase(), ConnectionPhase::Connecting);
        pump(&manager, &mut adapter_rx).await;

        assert!(manager.is_ready());
        assert_eq!(manager.phase(), ConnectionPhase::Ready);
        assert_eq!(manager.primary_write_characteristic(), Some(MockCharacteristic::write_notify(3)));

        let completed: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::DiscoveryCompleted { ready, .. } => Some(ready),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![true]);
    }

    #[tokio::test]
    async fn read_only_device_never_ready_and_is_dropped() {
        let manager = manager(
            MockAdapter::new().with_device("A", vec![vec![MockCharacteristic::read_only(1)]]),
        );
        let mut adapter_rx = manager.adapter().take_events().unwrap();
        let mut events = manager.events().subscribe();

        manager.connect(&"A".into()).await;
        pump(&manager, &mut adapter_rx).await;

        assert!(!manager.is_ready());
        assert!(manager.primary_write_characteristic().is_none());
        assert_eq!(manager.adapter().disconnect_requests(), vec![DeviceId::from("A")]);
        pump(&manager, &mut adapter_rx).await;
        assert_eq!(manager.phase(), ConnectionPhase::Idle);

        let events = drain(&mut events);
        let completions = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::DiscoveryCompleted { ready: false, .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(events.iter().any(|e| matches!(e, BridgeEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn failed_connect_leaves_state_untouched() {
        let adapter = MockAdapter::new().with_device("A", robot_tree());
        adapter.set_fail_connect(true);
        let manager = manager(adapter);

        assert!(!manager.connect(&"A".into()).await);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
        assert!(manager.connected_device().is_none());
    }

    #[tokio::test]
    async fn second_connect_tears_down_first_session() {
        let manager = manager(
            MockAdapter::new()
                .with_device("A", robot_tree())
                .with_device("B", robot_tree()),
        );
        let cancel = CancellationToken::new();
        let event_loop = manager.spawn_event_loop(cancel.clone()).unwrap();
        let mut events = manager.events().subscribe();

        manager.connect(&"A".into()).await;
        while !manager.is_ready() {
            tokio::task::yield_now().await;
        }

        assert!(manager.connect(&"B".into()).await);
        // A must be gone before B can get anywhere near ready.
        assert_eq!(manager.adapter().disconnect_requests(), vec![DeviceId::from("A")]);

        let mut ready_sessions = 0;
        let mut saw_a_disconnect = false;
        loop {
            match events.recv().await.unwrap() {
                BridgeEvent::Disconnected(id) => {
                    assert_eq!(id, DeviceId::from("A"));
                    ready_sessions -= 1;
                    saw_a_disconnect = true;
                }
                BridgeEvent::DiscoveryCompleted { ready: true, device } => {
                    ready_sessions += 1;
                    assert!(ready_sessions <= 1, "two sessions ready at once");
                    if device == Some(DeviceId::from("B")) {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert!(saw_a_disconnect);
        assert_eq!(manager.connected_device().map(|d| d.id), Some(DeviceId::from("B")));
        cancel.cancel();
        event_loop.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_clears_state_once() {
        let adapter = MockAdapter::new().with_device("A", robot_tree());
        let manager = manager(adapter);
        let mut adapter_rx = manager.adapter().take_events().unwrap();
        manager.connect(&"A".into()).await;
        pump(&manager, &mut adapter_rx).await;
        assert!(manager.is_ready());

        let mut events = manager.events().subscribe();
        manager.adapter().push(AdapterEvent::DeviceDisconnected("A".into()));
        manager.adapter().push(AdapterEvent::DeviceDisconnected("A".into()));
        pump(&manager, &mut adapter_rx).await;

        assert!(!manager.is_ready());
        assert!(manager.primary_write_characteristic().is_none());
        let disconnects = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, BridgeEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_cancel_reconnect_in_flight() {
        let adapter = MockAdapter::new().with_device("A", robot_tree()).with_device("B", robot_tree());
        let manager = manager(adapter);
        let mut adapter_rx = manager.adapter().take_events().unwrap();
        manager.connect(&"A".into()).await;
        pump(&manager, &mut adapter_rx).await;

        // Teardown of A times out without an event, then B is requested.
        manager.adapter().set_auto_events(false);
        manager.connect(&"B".into()).await;
        assert_eq!(manager.phase(), ConnectionPhase::Connecting);
        assert!(manager.connected_device().is_none());

        // The late disconnect for A must not touch B's attempt.
        let mut events = manager.events().subscribe();
        manager.handle_event(AdapterEvent::DeviceDisconnected("A".into())).await;
        assert_eq!(manager.phase(), ConnectionPhase::Connecting);
        assert!(drain(&mut events).iter().all(|e| !matches!(e, BridgeEvent::Disconnected(_))));

        manager
            .handle_event(AdapterEvent::DeviceConnected(Device::new("B", None)))
            .await;
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn send_requires_ready_session() {
        let manager = manager(MockAdapter::new().with_device("A", robot_tree()));
        assert_eq!(
            manager.send_command(&RobotCommand::STOP).await,
            Err(SendError::NotConnected)
        );

        let mut adapter_rx = manager.adapter().take_events().unwrap();
        manager.connect(&"A".into()).await;
        pump(&manager, &mut adapter_rx).await;
        assert_eq!(manager.send_command(&"d".parse().unwrap()).await, Ok(()));
        assert_eq!(manager.adapter().written(), vec!["d".to_string()]);
    }

    #[tokio::test]
    async fn scanning_respects_adapter_state_and_clears_registry() {
        let adapter = MockAdapter::new();
        adapter.set_state(AdapterState::PoweredOff);
        let manager = manager(adapter);

        assert!(!manager.start_scanning(None).await);
        assert_eq!(manager.phase(), ConnectionPhase::Idle);

        manager.adapter().set_state(AdapterState::PoweredOn);
        manager
            .handle_event(AdapterEvent::DeviceDiscovered(Device::new("X", Some("Old".into()))))
            .await;
        assert_eq!(manager.devices().len(), 1);

        assert!(manager.start_scanning(None).await);
        assert!(manager.devices().is_empty());
        assert_eq!(manager.phase(), ConnectionPhase::Scanning);
        assert!(!manager.start_scanning(None).await, "second scan is a no-op");

        manager
            .handle_event(AdapterEvent::DeviceDiscovered(Device::new("R", Some("Robot".into()))))
            .await;
        manager
            .handle_event(AdapterEvent::DeviceDiscovered(Device::new("N", None)))
            .await;
        manager.handle_event(AdapterEvent::ScanTimeoutElapsed).await;
        assert_eq!(manager.phase(), ConnectionPhase::Idle);
        assert_eq!(manager.devices().len(), 1);
    }

    #[tokio::test]
    async fn discovery_without_session_still_signals_once() {
        let manager = manager(MockAdapter::new());
        let mut events = manager.events().subscribe();
        assert!(!manager.discover_services_and_select_characteristic().await);
        let completions = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, BridgeEvent::DiscoveryCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
    }
}
