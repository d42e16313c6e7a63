//! Runs one script at a time on a blocking worker and guarantees that an abort
//! stops the robot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::{CommandSender, RobotCommand};
use crate::core::events::{BridgeEvent, EventSink};
use crate::core::script::engine::{ScriptEngine, ScriptError};
use crate::core::script::host::{RunnerHost, ScriptHost};

/// Terminal result of a script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason")]
pub enum ScriptOutcome {
    Completed,
    Aborted,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("a script is already running")]
    AlreadyRunning,
    #[error("robot is not ready")]
    NotReady,
    #[error("no script is running")]
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Upper bound for a single `sleep_ms` call.
    pub max_sleep: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_secs(60),
        }
    }
}

struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
}

/// Handle to a started run.
pub struct ScriptHandle {
    pub run_id: u64,
    join: JoinHandle<ScriptOutcome>,
}

impl ScriptHandle {
    /// Waits for the run's terminal outcome.
    pub async fn wait(self) -> ScriptOutcome {
        self.join
            .await
            .unwrap_or_else(|e| ScriptOutcome::Failed(format!("script supervisor failed: {}", e)))
    }
}

pub struct ScriptRunner<S: CommandSender> {
    sender: Arc<S>,
    engine: Arc<dyn ScriptEngine>,
    events: EventSink,
    options: RunnerOptions,
    active: Arc<Mutex<Option<ActiveRun>>>,
    last_outcome: Arc<Mutex<Option<ScriptOutcome>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: CommandSender> ScriptRunner<S> {
    pub fn new(
        sender: Arc<S>,
        engine: Arc<dyn ScriptEngine>,
        events: EventSink,
        options: RunnerOptions,
    ) -> Self {
        Self {
            sender,
            engine,
            events,
            options,
            active: Arc::new(Mutex::new(None)),
            last_outcome: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn status(&self) -> ScriptStatus {
        if lock(&self.active).is_some() {
            ScriptStatus::Running
        } else {
            ScriptStatus::Idle
        }
    }

    pub fn last_outcome(&self) -> Option<ScriptOutcome> {
        lock(&self.last_outcome).clone()
    }

    /// Starts `source` on a worker thread. Only accepted while idle and ready.
    pub async fn run(&self, source: impl Into<String>) -> Result<ScriptHandle, RunError> {
        if !self.sender.is_ready().await {
            self.events.status("Cannot run script: robot is not connected.");
            return Err(RunError::NotReady);
        }

        let cancel = CancellationToken::new();
        let run_id = {
            let mut active = lock(&self.active);
            if active.is_some() {
                return Err(RunError::AlreadyRunning);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            *active = Some(ActiveRun {
                id,
                cancel: cancel.clone(),
            });
            id
        };

        info!("Starting script run {} with {}", run_id, self.engine.name());
        self.events.status("Running script...");

        let host: Arc<dyn ScriptHost> = Arc::new(RunnerHost::new(
            self.sender.clone(),
            cancel.clone(),
            Handle::current(),
            self.events.clone(),
            self.options.max_sleep,
        ));
        let engine = self.engine.clone();
        let source = source.into();
        let worker = tokio::task::spawn_blocking(move || engine.execute(&source, host));

        let active = self.active.clone();
        let last_outcome = self.last_outcome.clone();
        let events = self.events.clone();
        let join = tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(_) if cancel.is_cancelled() => ScriptOutcome::Aborted,
                Ok(Ok(())) => ScriptOutcome::Completed,
                Ok(Err(ScriptError::Cancelled)) => ScriptOutcome::Aborted,
                Ok(Err(e)) => ScriptOutcome::Failed(e.to_string()),
                Err(e) => {
                    error!("Script worker for run {} panicked: {}", run_id, e);
                    ScriptOutcome::Failed(format!("script worker crashed: {}", e))
                }
            };

            {
                let mut active = lock(&active);
                if active.as_ref().is_some_and(|run| run.id == run_id) {
                    *active = None;
                }
            }
            *lock(&last_outcome) = Some(outcome.clone());

            match &outcome {
                ScriptOutcome::Completed => events.status("Script finished successfully."),
                ScriptOutcome::Aborted => events.status("Script execution was aborted."),
                ScriptOutcome::Failed(reason) => events.status(format!("Script error: {}", reason)),
            }
            events.emit(BridgeEvent::ScriptFinished {
                run_id,
                outcome: outcome.clone(),
            });
            outcome
        });

        Ok(ScriptHandle { run_id, join })
    }

    /// Cancels the running script and sends a stop without waiting for it to exit.
    pub async fn abort(&self) -> Result<(), RunError> {
        let cancel = lock(&self.active)
            .as_ref()
            .map(|run| run.cancel.clone())
            .ok_or(RunError::NotRunning)?;

        self.events.status("Abort requested.");
        cancel.cancel();

        if let Err(e) = self.sender.send_command(&RobotCommand::STOP).await {
            warn!("Stop after abort was not delivered: {}", e);
        }
        Ok(())
    }
}
