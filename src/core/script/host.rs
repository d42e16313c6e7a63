//! Host functions a script can call, independent of the interpreter.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::{CommandSender, Direction, RobotCommand};
use crate::core::events::EventSink;

/// Names the host functions are bound under in every interpreter.
pub const HOST_FN_DRIVE: &str = "drive";
pub const HOST_FN_STOP: &str = "stop";
pub const HOST_FN_SLEEP: &str = "sleep_ms";
pub const HOST_FN_SHOULD_ABORT: &str = "should_abort";
pub const HOST_FN_CHECKPOINT: &str = "checkpoint";
pub const HOST_FN_LOG: &str = "log_info";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("script aborted")]
    Cancelled,
    #[error("unsupported direction '{0}'")]
    InvalidDirection(String),
}

/// The narrow capability interface every embedded interpreter binds to.
///
/// All calls block the calling (worker) thread. After an abort every call except
/// [`ScriptHost::should_abort`] and [`ScriptHost::log_info`] returns
/// [`HostError::Cancelled`] without touching the robot.
pub trait ScriptHost: Send + Sync {
    /// Sends one of `w`, `a`, `s`, `d`, `x` and waits for the write to finish.
    fn drive(&self, direction: &str) -> Result<(), HostError>;

    fn stop(&self) -> Result<(), HostError> {
        self.drive(&Direction::Stop.as_char().to_string())
    }

    /// Waits `ms` milliseconds, returning early with `Cancelled` on abort.
    fn sleep_ms(&self, ms: u64) -> Result<(), HostError>;

    /// Explicit poll for interpreters that prefer checking a flag.
    fn should_abort(&self) -> bool;

    /// Raises `Cancelled` when an abort was requested.
    fn checkpoint(&self) -> Result<(), HostError> {
        if self.should_abort() {
            Err(HostError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn log_info(&self, message: &str);
}

/// Host bound to one script run.
pub struct RunnerHost<S: CommandSender> {
    sender: Arc<S>,
    cancel: CancellationToken,
    runtime: Handle,
    events: EventSink,
    max_sleep: Duration,
}

impl<S: CommandSender> RunnerHost<S> {
    pub fn new(
        sender: Arc<S>,
        cancel: CancellationToken,
        runtime: Handle,
        events: EventSink,
        max_sleep: Duration,
    ) -> Self {
        Self {
            sender,
            cancel,
            runtime,
            events,
            max_sleep,
        }
    }
}

impl<S: CommandSender> ScriptHost for RunnerHost<S> {
    fn drive(&self, direction: &str) -> Result<(), HostError> {
        self.checkpoint()?;

        let mut chars = direction.trim().chars();
        let direction = match (chars.next(), chars.next()) {
            (Some(c), None) => Direction::from_char(c),
            _ => None,
        }
        .ok_or_else(|| HostError::InvalidDirection(direction.to_string()))?;

        let command = RobotCommand::from(direction);
        // Transport failures are already reported as status; the script keeps going.
        if let Err(e) = self.runtime.block_on(self.sender.send_command(&command)) {
            warn!("Script command '{}' not delivered: {}", command, e);
        }

        // An abort that landed while the write was queued must still be the last word.
        if self.cancel.is_cancelled() {
            if !command.is_stop() {
                warn!("Script command '{}' went out after abort, stopping again", command);
                if let Err(e) = self.runtime.block_on(self.sender.send_command(&RobotCommand::STOP)) {
                    warn!("Stop after abort not delivered: {}", e);
                }
            }
            return Err(HostError::Cancelled);
        }
        Ok(())
    }

    fn sleep_ms(&self, ms: u64) -> Result<(), HostError> {
        self.checkpoint()?;
        let requested = Duration::from_millis(ms);
        if requested > self.max_sleep {
            warn!("Script asked to sleep {:?}, clamped to {:?}", requested, self.max_sleep);
        }
        let duration = requested.min(self.max_sleep);
        debug!("Script sleeping for {:?}", duration);

        self.runtime.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(HostError::Cancelled),
                _ = tokio::time::sleep(duration) => Ok(()),
            }
        })
    }

    fn should_abort(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn log_info(&self, message: &str) {
        self.events.status(message.to_string());
    }
}
