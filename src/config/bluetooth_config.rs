use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::{
    CONNECTION_WATCH_INTERVAL_MS, ConnectionOptions, DEFAULT_SCAN_DURATION_SECS,
    SESSION_TEARDOWN_TIMEOUT_MS,
};

/// Scanning and connection lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// How long a scan runs before it stops on its own.
    pub scan_timeout_secs: u64,
    /// How long a new connect waits for the old session to report its disconnect.
    pub teardown_timeout_ms: u64,
    /// Poll interval for adapter availability and link loss.
    pub watch_interval_ms: u64,
    /// Drop connections that expose no writable characteristic.
    pub disconnect_on_unusable: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            teardown_timeout_ms: SESSION_TEARDOWN_TIMEOUT_MS,
            watch_interval_ms: CONNECTION_WATCH_INTERVAL_MS,
            disconnect_on_unusable: true,
        }
    }
}

impl BluetoothConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(50))
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            scan_timeout: Duration::from_secs(self.scan_timeout_secs.max(1)),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            disconnect_on_unusable: self.disconnect_on_unusable,
        }
    }
}
