use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Local;
use env_logger::{Builder, Env};
use log::{SetLoggerError, debug, warn};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::events::{BridgeEvent, EventSink};

/// Installs the stderr logger. `RUST_LOG` wins over `level`.
///
/// Calling this more than once returns an error instead of panicking.
pub fn init_logging(level: &str) -> Result<(), SetLoggerError> {
    Builder::from_env(Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Keeps the most recent status lines for display, and logs every other
/// notification at debug level.
#[derive(Clone)]
pub struct StatusLog {
    capacity: usize,
    recent: Arc<Mutex<VecDeque<LogMessage>>>,
}

impl StatusLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn recent(&self) -> Vec<LogMessage> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, level: &str, message: String) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(LogMessage {
            level: level.to_string(),
            message,
            timestamp: Local::now().to_rfc3339(),
        });
    }

    /// Subscribes to `events` until `cancel` fires or the sink goes away.
    pub fn spawn(&self, events: &EventSink, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(BridgeEvent::Status(message)) => this.record("INFO", message),
                    Ok(BridgeEvent::ScriptFinished { run_id, outcome }) => {
                        this.record("INFO", format!("Script run {} ended: {:?}", run_id, outcome))
                    }
                    Ok(other) => debug!("Bridge event: {:?}", other),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Status log fell behind, {} events skipped", skipped);
                        this.record("WARN", format!("{} notifications were dropped", skipped));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
