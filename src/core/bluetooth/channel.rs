//! Serialised command writes onto the selected characteristic.

use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::bluetooth::adapter::BleAdapter;
use crate::core::bluetooth::commands::RobotCommand;
use crate::core::bluetooth::types::GattCharacteristic;
use crate::core::events::EventSink;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("no write characteristic selected")]
    NoCharacteristic,
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Writes commands one at a time; a second sender waits for the first write to finish.
pub struct CommandChannel<A: BleAdapter> {
    adapter: Arc<A>,
    events: EventSink,
    write_slot: Mutex<()>,
}

impl<A: BleAdapter> CommandChannel<A> {
    pub fn new(adapter: Arc<A>, events: EventSink) -> Self {
        Self {
            adapter,
            events,
            write_slot: Mutex::new(()),
        }
    }

    /// Encodes `command` as UTF-8 and issues a single write. Only a positive byte
    /// count counts as success. Every outcome is also reported as a status line.
    pub async fn send(
        &self,
        characteristic: Option<&A::Characteristic>,
        command: &RobotCommand,
    ) -> Result<(), SendError> {
        let Some(characteristic) = characteristic else {
            self.events
                .status(format!("Cannot send '{}': not connected.", command));
            return Err(SendError::NoCharacteristic);
        };

        let data = command.to_bytes();
        let _slot = self.write_slot.lock().await;
        debug!("Writing {:?} to {}", command, characteristic.uuid());

        match self.adapter.write(characteristic, &data).await {
            Ok(written) if written > 0 => {
                self.events.status(format!("Sent '{}' successfully.", command));
                Ok(())
            }
            Ok(_) => {
                warn!("Write of '{}' acknowledged zero bytes", command);
                self.events.status(format!("Failed to send '{}'.", command));
                Err(SendError::WriteFailed("no bytes written".to_string()))
            }
            Err(e) => {
                self.events.status(format!("Send error: {}", e));
                Err(SendError::WriteFailed(e.to_string()))
            }
        }
    }
}
