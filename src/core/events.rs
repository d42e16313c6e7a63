//! Notifications from the core to whoever is listening (UI, console, tests).

use tokio::sync::broadcast;

use crate::core::bluetooth::{Device, DeviceId};
use crate::core::script::ScriptOutcome;

/// Everything observers may want to react to.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Human readable status line
    Status(String),
    DeviceDiscovered(Device),
    ScanCompleted,
    /// Signalled exactly once per service discovery, whatever the result.
    DiscoveryCompleted { device: Option<DeviceId>, ready: bool },
    /// Delivered after session state has been cleared.
    Disconnected(DeviceId),
    ScriptFinished { run_id: u64, outcome: ScriptOutcome },
}

/// Sending side shared by the core components.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BridgeEvent) {
        // No receivers is fine; nobody is looking.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.emit(BridgeEvent::Status(message));
    }
}
