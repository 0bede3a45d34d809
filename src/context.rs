// =============================================================================
// Engine Context — central shared state and collaborator surface
// =============================================================================
//
// The single source of truth for the engine.  Subsystems manage their own
// interior mutability; the context ties them together and exposes the
// operations a front end or embedding process calls: candle snapshots,
// connection status, task timings, order placement, script execution, and
// shutdown.
//
// Thread safety:
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems with their own locking.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{ApiKeys, Settings};
use crate::error::EngineError;
use crate::exchange::{ApiClient, RateLimitLedger};
use crate::indicator::{IndicatorPipeline, IndicatorSet};
use crate::market_data::{CandleStore, CandleTable, StreamManager, SubscriptionStatus, TickerBoard};
use crate::scheduler::Scheduler;
use crate::timing::{TaskTimings, TimingSummary};

/// Candle interval the engine operates on.
pub const INTERVAL_MS: i64 = 60_000;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Server-time difference samples kept for the online summary.
const TIME_DIFF_WINDOW: usize = 60;

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the operational error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Machine-readable code where one exists (e.g. an exchange error code).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// Online status
// =============================================================================

/// Connectivity health derived from the secondly status checks.
#[derive(Debug, Clone, Serialize)]
pub struct OnlineSummary {
    /// Most recent REST ping round trip in milliseconds.
    pub ping_ms: Option<f64>,
    /// Mean local-clock-minus-server-clock difference over the window, ms.
    pub mean_server_time_diff_ms: Option<f64>,
    pub samples: usize,
}

struct OnlineStatus {
    ping_ms: RwLock<Option<f64>>,
    server_time_diffs: RwLock<VecDeque<f64>>,
}

// =============================================================================
// Board lock
// =============================================================================

struct BoardState {
    locked: RwLock<bool>,
    last_activity: RwLock<Instant>,
}

// =============================================================================
// EngineContext
// =============================================================================

pub struct EngineContext {
    // ── Configuration ───────────────────────────────────────────────────
    pub settings: RwLock<Settings>,
    settings_path: PathBuf,

    // ── Exchange ────────────────────────────────────────────────────────
    pub client: Arc<ApiClient>,

    // ── Market data ─────────────────────────────────────────────────────
    pub store: Arc<CandleStore>,
    pub tickers: Arc<TickerBoard>,
    pub streams: Arc<StreamManager>,

    // ── Indicators ──────────────────────────────────────────────────────
    pub pipeline: Arc<IndicatorPipeline>,
    pub indicators: Arc<IndicatorSet>,

    // ── Scheduling / timing ─────────────────────────────────────────────
    pub scheduler: Arc<Scheduler>,
    pub timings: Arc<TaskTimings>,

    // ── Operational status ──────────────────────────────────────────────
    recent_errors: RwLock<Vec<ErrorRecord>>,
    online: OnlineStatus,
    board: BoardState,
    shutdown: watch::Sender<bool>,
    pub start_time: Instant,
}

impl EngineContext {
    /// Wire up every subsystem from loaded settings.  The returned value is
    /// wrapped in `Arc` immediately by the caller.
    pub fn new(settings: Settings, settings_path: PathBuf) -> Self {
        let timings = Arc::new(TaskTimings::new());
        let limits = Arc::new(RateLimitLedger::new());
        let client = Arc::new(ApiClient::new(
            ApiKeys::from_env(),
            limits,
            timings.clone(),
        ));

        let store = Arc::new(CandleStore::new(INTERVAL_MS));
        let tickers = Arc::new(TickerBoard::new());
        let streams = Arc::new(StreamManager::new(
            client.clone(),
            store.clone(),
            tickers.clone(),
        ));

        let (shutdown, _) = watch::channel(false);

        Self {
            settings: RwLock::new(settings),
            settings_path,
            client,
            store,
            tickers,
            streams,
            pipeline: Arc::new(IndicatorPipeline::new()),
            indicators: Arc::new(IndicatorSet::new()),
            scheduler: Arc::new(Scheduler::new(timings.clone())),
            timings,
            recent_errors: RwLock::new(Vec::new()),
            online: OnlineStatus {
                ping_ms: RwLock::new(None),
                server_time_diffs: RwLock::new(VecDeque::new()),
            },
            board: BoardState {
                locked: RwLock::new(false),
                last_activity: RwLock::new(Instant::now()),
            },
            shutdown,
            start_time: Instant::now(),
        }
    }

    // ── Collaborator surface ────────────────────────────────────────────

    /// Immutable copy of one symbol's candle table.
    pub fn get_candle_snapshot(&self, symbol: &str) -> CandleTable {
        self.store.snapshot(symbol)
    }

    /// Duration statistics for every recorded task.
    pub fn get_task_timings(&self) -> Vec<TimingSummary> {
        self.timings.summaries()
    }

    /// State of every websocket subscription.
    pub fn get_connection_status(&self) -> Vec<SubscriptionStatus> {
        self.streams.status()
    }

    /// Place an order.  Failures are recorded in the error log and returned.
    pub async fn submit_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
    ) -> Result<serde_json::Value, EngineError> {
        self.touch_board();
        let result = self
            .client
            .submit_order(symbol, side, order_type, quantity, price, time_in_force)
            .await;
        if let Err(e) = &result {
            self.push_engine_error(e);
        }
        result
    }

    /// Cancel every open order on one market.
    pub async fn cancel_symbol_orders(
        &self,
        symbol: &str,
    ) -> Result<serde_json::Value, EngineError> {
        self.touch_board();
        let result = self.client.cancel_symbol_orders(symbol).await;
        if let Err(e) = &result {
            self.push_engine_error(e);
        }
        result
    }

    /// Run a strategy script against snapshots of every target symbol and
    /// publish each successful table.  Returns the per-symbol outcome; a
    /// failed symbol keeps its previously published table.
    pub fn run_script(&self, script: &str) -> HashMap<String, Result<(), EngineError>> {
        let symbols = self.settings.read().target_symbols.clone();
        let compiled = match self.pipeline.compile(script) {
            Ok(compiled) => compiled,
            Err(e) => {
                self.push_engine_error(&e);
                return symbols.into_iter().map(|s| (s, Err(e.clone()))).collect();
            }
        };

        let snapshots = self.store.snapshot_many(&symbols);
        let results = self.pipeline.compute(&snapshots, &compiled, INTERVAL_MS);

        results
            .into_iter()
            .map(|(symbol, result)| {
                let outcome = match result {
                    Ok(table) => {
                        self.indicators.replace(&symbol, table);
                        Ok(())
                    }
                    Err(e) => {
                        self.push_engine_error(&e);
                        Err(e)
                    }
                };
                (symbol, outcome)
            })
            .collect()
    }

    /// Run the script stored in the active strategy slot.
    pub fn run_active_script(&self) -> Result<()> {
        let (settings, slot) = {
            let s = self.settings.read();
            (s.clone(), s.strategy_slot)
        };
        let script = settings
            .load_script(slot)
            .context("failed to load active strategy script")?;
        let results = self.run_script(&script);
        let failures = results.values().filter(|r| r.is_err()).count();
        if failures > 0 {
            warn!(failures, "strategy script failed for some symbols");
        }
        Ok(())
    }

    /// Replace the tracked symbol set.  New symbols start streaming at once;
    /// data for removed symbols stays in the store but is no longer refreshed
    /// by new subscriptions.
    pub fn set_target_symbols(self: &Arc<Self>, symbols: Vec<String>) -> Result<()> {
        {
            let mut settings = self.settings.write();
            settings.target_symbols = symbols.clone();
            settings.save(&self.settings_path)?;
        }
        for symbol in &symbols {
            self.streams.subscribe_symbol(symbol);
        }
        info!(symbols = ?symbols, "target symbols updated");
        Ok(())
    }

    /// Swap API credentials on the live client.  Keys are never persisted.
    pub fn set_api_keys(&self, keys: ApiKeys) {
        self.client.set_keys(keys);
        info!("api keys updated");
    }

    /// Ask the engine to shut down.  Idempotent, and effective even before
    /// anything has subscribed to the shutdown signal.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // ── Error log ───────────────────────────────────────────────────────

    /// Record an error message, evicting the oldest entry past the cap.
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    fn push_engine_error(&self, error: &EngineError) {
        let code = match error {
            EngineError::Exchange { code, .. } => Some(code.to_string()),
            _ => None,
        };
        self.push_error(error.to_string(), code);
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    // ── Online status ───────────────────────────────────────────────────

    pub fn record_ping(&self, round_trip: std::time::Duration) {
        *self.online.ping_ms.write() = Some(round_trip.as_secs_f64() * 1000.0);
    }

    pub fn record_server_time_diff(&self, diff_ms: f64) {
        let mut diffs = self.online.server_time_diffs.write();
        diffs.push_back(diff_ms);
        while diffs.len() > TIME_DIFF_WINDOW {
            diffs.pop_front();
        }
    }

    pub fn online_summary(&self) -> OnlineSummary {
        let diffs = self.online.server_time_diffs.read();
        let mean = (!diffs.is_empty())
            .then(|| diffs.iter().sum::<f64>() / diffs.len() as f64);
        OnlineSummary {
            ping_ms: *self.online.ping_ms.read(),
            mean_server_time_diff_ms: mean,
            samples: diffs.len(),
        }
    }

    // ── Board lock ──────────────────────────────────────────────────────

    /// Note user or API activity: unlocks the board and resets the idle clock.
    pub fn touch_board(&self) {
        *self.board.last_activity.write() = Instant::now();
        *self.board.locked.write() = false;
    }

    /// Lock the board when the configured idle timeout has elapsed.  Returns
    /// the current locked state.
    pub fn lock_board_if_idle(&self) -> bool {
        let timeout = self.settings.read().board_lock;
        if let Some(idle_secs) = timeout.idle_secs() {
            let idle = self.board.last_activity.read().elapsed().as_secs();
            if idle >= idle_secs {
                let mut locked = self.board.locked.write();
                if !*locked {
                    info!(idle_secs = idle, "board locked after idle timeout");
                }
                *locked = true;
            }
        }
        *self.board.locked.read()
    }

    pub fn board_locked(&self) -> bool {
        *self.board.locked.read()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardLockTimeout;
    use crate::types::Candle;

    // The tempdir rides along so it outlives the context and cleans up after
    // the test.
    fn test_context() -> (tempfile::TempDir, Arc<EngineContext>) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.data_dir = dir.path().to_path_buf();
        let path = dir.path().join("settings.json");
        (dir, Arc::new(EngineContext::new(settings, path)))
    }

    #[test]
    fn error_log_is_capped() {
        let (_dir, ctx) = test_context();
        for i in 0..(MAX_RECENT_ERRORS + 20) {
            ctx.push_error(format!("error {i}"), None);
        }
        let errors = ctx.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "error 20");
    }

    #[test]
    fn online_summary_averages_the_window() {
        let (_dir, ctx) = test_context();
        assert!(ctx.online_summary().mean_server_time_diff_ms.is_none());

        ctx.record_server_time_diff(10.0);
        ctx.record_server_time_diff(20.0);
        let summary = ctx.online_summary();
        assert_eq!(summary.samples, 2);
        assert!((summary.mean_server_time_diff_ms.unwrap() - 15.0).abs() < 1e-9);

        for _ in 0..(TIME_DIFF_WINDOW + 10) {
            ctx.record_server_time_diff(5.0);
        }
        assert_eq!(ctx.online_summary().samples, TIME_DIFF_WINDOW);
    }

    #[test]
    fn board_never_locks_by_default() {
        let (_dir, ctx) = test_context();
        assert!(!ctx.lock_board_if_idle());
        assert!(!ctx.board_locked());
    }

    #[test]
    fn board_locks_after_idle_and_unlocks_on_touch() {
        let (_dir, ctx) = test_context();
        ctx.settings.write().board_lock = BoardLockTimeout::TenSeconds;

        // Simulate elapsed idle time by back-dating the activity clock.
        *ctx.board.last_activity.write() = Instant::now() - std::time::Duration::from_secs(11);
        assert!(ctx.lock_board_if_idle());
        assert!(ctx.board_locked());

        ctx.touch_board();
        assert!(!ctx.board_locked());
    }

    #[test]
    fn run_script_publishes_tables_per_symbol() {
        let (_dir, ctx) = test_context();
        ctx.settings.write().target_symbols = vec!["BTCUSDT".to_string()];
        for i in 0..5 {
            ctx.store.ingest_candle(
                "BTCUSDT",
                Candle {
                    open_time: i * INTERVAL_MS,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + i as f64,
                    volume: 1.0,
                    is_closed: true,
                },
            );
        }

        let results = ctx.run_script(r#"out["Price:SMA 2"] = sma(closes, 2);"#);
        assert!(results["BTCUSDT"].is_ok());

        let table = ctx.indicators.get("BTCUSDT").unwrap();
        assert_eq!(table.open_times.len(), 5);
        assert!(table.get("Price", "SMA 2").is_some());
    }

    #[test]
    fn run_script_compile_error_is_reported_for_every_symbol() {
        let (_dir, ctx) = test_context();
        ctx.settings.write().target_symbols =
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];

        let results = ctx.run_script("out[ = ;");
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.is_err()));
        assert!(!ctx.recent_errors().is_empty());
    }

    #[test]
    fn shutdown_request_is_idempotent() {
        let (_dir, ctx) = test_context();
        assert!(!ctx.shutdown_requested());
        ctx.request_shutdown();
        ctx.request_shutdown();
        assert!(ctx.shutdown_requested());
    }
}
