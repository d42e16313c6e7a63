//! Rhai binding for the script host.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use rhai::{Dynamic, Engine, EvalAltResult};

use crate::core::bluetooth::Direction;
use crate::core::script::engine::{ScriptEngine, ScriptError};
use crate::core::script::host::{
    HOST_FN_CHECKPOINT, HOST_FN_DRIVE, HOST_FN_LOG, HOST_FN_SHOULD_ABORT, HOST_FN_SLEEP,
    HOST_FN_STOP, HostError, ScriptHost,
};

type HostResult = Result<(), Box<EvalAltResult>>;

/// Operations a script may still run after an abort before it is terminated.
/// Gives polling loops room to reach their `should_abort()` check.
const ABORT_GRACE_OPS: u64 = 1_000;

/// Marks that no abort has been seen yet.
const NOT_ABORTED: u64 = u64::MAX;

fn raise(err: HostError) -> Box<EvalAltResult> {
    err.to_string().into()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RhaiEngine;

impl RhaiEngine {
    pub fn new() -> Self {
        Self
    }

    fn build(host: &Arc<dyn ScriptHost>) -> Engine {
        let mut engine = Engine::new();

        let h = host.clone();
        engine.register_fn(HOST_FN_DRIVE, move |direction: &str| -> HostResult {
            h.drive(direction).map_err(raise)
        });
        let h = host.clone();
        engine.register_fn(HOST_FN_STOP, move || -> HostResult { h.stop().map_err(raise) });
        let h = host.clone();
        engine.register_fn(HOST_FN_SLEEP, move |ms: i64| -> HostResult {
            h.sleep_ms(ms.max(0) as u64).map_err(raise)
        });
        let h = host.clone();
        engine.register_fn(HOST_FN_SHOULD_ABORT, move || h.should_abort());
        let h = host.clone();
        engine.register_fn(HOST_FN_CHECKPOINT, move || -> HostResult {
            h.checkpoint().map_err(raise)
        });
        let h = host.clone();
        engine.register_fn(HOST_FN_LOG, move |message: &str| h.log_info(message));

        // send_w(), send_a(), ... shortcuts
        for direction in Direction::ALL {
            let h = host.clone();
            let letter = direction.as_char().to_string();
            let name = format!("send_{}", letter);
            engine.register_fn(name, move || -> HostResult { h.drive(&letter).map_err(raise) });
        }

        // Breaks tight loops that never call back into the host.
        let h = host.clone();
        let aborted_at = AtomicU64::new(NOT_ABORTED);
        engine.on_progress(move |ops| {
            if !h.should_abort() {
                return None;
            }
            let seen = match aborted_at.compare_exchange(
                NOT_ABORTED,
                ops,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => ops,
                Err(earlier) => earlier,
            };
            (ops.saturating_sub(seen) >= ABORT_GRACE_OPS).then_some(Dynamic::UNIT)
        });

        engine
    }
}

fn classify(err: EvalAltResult) -> ScriptError {
    match err {
        EvalAltResult::ErrorParsing(kind, position) => {
            ScriptError::Syntax(format!("{} ({})", kind, position))
        }
        EvalAltResult::ErrorTerminated(..) => ScriptError::Cancelled,
        other => ScriptError::Runtime(other.to_string()),
    }
}

impl ScriptEngine for RhaiEngine {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn execute(&self, source: &str, host: Arc<dyn ScriptHost>) -> Result<(), ScriptError> {
        let engine = Self::build(&host);
        debug!("Evaluating {} bytes of Rhai", source.len());
        engine.run(source).map_err(|e| classify(*e))
    }
}
