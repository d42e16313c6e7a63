//! Application state management
//! This module wires the connection manager, the script runner and the
//! notification stream together for a front-end.

use std::sync::Arc;

use anyhow::{Result, bail};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::BridgeUrls;
use crate::config::BridgeConfig;
use crate::core::bluetooth::{BleAdapter, BluestAdapter, ConnectionManager, EVENT_CHANNEL_CAPACITY};
use crate::core::events::EventSink;
use crate::core::script::{ScriptEngine, ScriptRunner};
use crate::logging::StatusLog;

/// Number of status lines kept for display.
const STATUS_HISTORY: usize = 50;

/// Picks the interpreter registered under `name`.
pub fn engine_by_name(name: &str) -> Result<Arc<dyn ScriptEngine>> {
    match name.to_ascii_lowercase().as_str() {
        #[cfg(feature = "scripting")]
        "rhai" => Ok(Arc::new(crate::core::script::RhaiEngine::new())),
        other => bail!("Unknown script engine '{}'", other),
    }
}

/// Global application state
pub struct AppState<A: BleAdapter = BluestAdapter> {
    pub config: BridgeConfig,
    pub events: EventSink,
    /// Matcher for web bridge navigations under the configured scheme
    pub bridge: BridgeUrls,
    pub connection: Arc<ConnectionManager<A>>,
    pub runner: ScriptRunner<ConnectionManager<A>>,
    pub status_log: StatusLog,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AppState<BluestAdapter> {
    /// Opens the system adapter and builds the state from `config`.
    pub async fn new(config: BridgeConfig) -> Result<Self> {
        info!("Initializing Bluetooth adapter...");
        let adapter = BluestAdapter::new(config.bluetooth.watch_interval()).await?;
        let engine = engine_by_name(&config.script.default_engine)?;
        Self::with_adapter(Arc::new(adapter), engine, config)
    }
}

impl<A: BleAdapter> AppState<A> {
    /// Builds the state around an already opened adapter. Must be called inside a runtime.
    pub fn with_adapter(
        adapter: Arc<A>,
        engine: Arc<dyn ScriptEngine>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let bridge = BridgeUrls::new(
            &config.commands.bridge_scheme,
            config.commands.max_advanced_len,
        )?;
        let events = EventSink::new(EVENT_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let status_log = StatusLog::new(STATUS_HISTORY);
        let log_task = status_log.spawn(&events, shutdown.child_token());

        let connection = Arc::new(ConnectionManager::new(
            adapter,
            events.clone(),
            config.bluetooth.connection_options(),
        ));
        let event_loop = connection.spawn_event_loop(shutdown.child_token())?;

        let runner = ScriptRunner::new(
            connection.clone(),
            engine,
            events.clone(),
            config.script.runner_options(),
        );

        Ok(Self {
            config,
            events,
            bridge,
            connection,
            runner,
            status_log,
            shutdown,
            tasks: vec![event_loop, log_task],
        })
    }

    /// Aborts any script, drops the link and stops the background tasks.
    pub async fn shutdown(self) {
        info!("Shutting down bridge state");
        let _ = self.runner.abort().await;
        self.connection.stop_scanning().await;
        self.connection.disconnect().await;
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
