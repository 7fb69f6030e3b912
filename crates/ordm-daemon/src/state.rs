//! Shared runtime state for ordm-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The engine handle is
//! cheap to clone and owns the store and oracle.

use std::sync::Arc;
use std::time::Duration;

use ordm_runtime::MintEngine;
use ordm_stuck::SweepReport;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

// ---------------------------------------------------------------------------
// BusMsg
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Sweep(SweepReport),
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub engine: MintEngine,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(engine: MintEngine) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            engine,
            bus,
            build: BuildInfo {
                service: "ordm-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    /// Run one stuck sweep and publish its report on the bus.
    pub async fn sweep_once(&self) -> Result<SweepReport, ordm_runtime::EngineError> {
        match self.engine.run_stuck_sweep().await {
            Ok(report) => {
                let _ = self.bus.send(BusMsg::Sweep(report.clone()));
                if !report.is_clean() {
                    let _ = self.bus.send(BusMsg::LogLine {
                        level: "WARN".to_string(),
                        msg: format!(
                            "stuck sweep finished with {} oracle and {} store error(s)",
                            report.oracle_errors, report.store_errors
                        ),
                    });
                }
                Ok(report)
            }
            Err(e) => {
                let _ = self.bus.send(BusMsg::LogLine {
                    level: "ERROR".to_string(),
                    msg: format!("stuck sweep failed: {e}"),
                });
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn the periodic stuck sweep.
///
/// A failed sweep is logged and retried on the next tick; the task never
/// exits on its own. A tick that arrives while a sweep is still running is
/// delayed, not stacked.
pub fn spawn_stuck_sweep(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.sweep_once().await {
                Ok(report) if !report.is_clean() => {
                    warn!(
                        oracle_errors = report.oracle_errors,
                        store_errors = report.store_errors,
                        "stuck sweep had per-candidate failures"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "stuck sweep failed"),
            }
        }
    });
}
