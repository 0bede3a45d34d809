// =============================================================================
// Meridian Engine — Main Entry Point
// =============================================================================
//
// Boot order matters: persisted candle history is restored and the most
// recent gap is filled over REST before the websocket streams start, so the
// first snapshot a consumer takes is already continuous.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod context;
mod error;
mod exchange;
mod indicator;
mod market_data;
mod scheduler;
mod timing;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;
use crate::context::EngineContext;
use crate::scheduler::Cadence;

/// History seeded for a symbol with no persisted candles.
const COLD_START_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;

/// Bound on the final candle flush during shutdown.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Engine — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings_path = PathBuf::from(
        std::env::var("MERIDIAN_SETTINGS").unwrap_or_else(|_| "settings.json".into()),
    );
    let mut settings = Settings::load(&settings_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        let parsed: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            settings.target_symbols = parsed;
        }
    }
    info!(symbols = ?settings.target_symbols, "configured symbols");

    let ctx = Arc::new(EngineContext::new(settings, settings_path));

    // ── 2. Restore persisted candle history ──────────────────────────────
    let candle_dir = ctx.settings.read().data_dir.join("candles");
    match ctx.store.restore(&candle_dir) {
        Ok(restored) if !restored.is_empty() => {
            info!(symbols = ?restored, "restored candle history")
        }
        Ok(_) => info!("no persisted candle history found"),
        Err(e) => {
            warn!(error = %e, "failed to restore candle history");
            ctx.push_error(format!("candle restore failed: {e}"), None);
        }
    }

    // ── 3. Time sync and declared rate limits ────────────────────────────
    match ctx.client.sync_time().await {
        Ok(offset_ms) => {
            info!(offset_ms, "server time synchronised");
            ctx.record_server_time_diff(offset_ms as f64);
        }
        Err(e) => warn!(error = %e, "initial time sync failed"),
    }
    match ctx.client.refresh_limits().await {
        Ok(buckets) => info!(buckets, "rate limits loaded from exchange"),
        Err(e) => warn!(error = %e, "failed to load rate limits, using boot defaults"),
    }

    // ── 4. Seed history and launch streams ───────────────────────────────
    let symbols = ctx.settings.read().target_symbols.clone();
    for symbol in &symbols {
        let start = ctx
            .store
            .last_open_time(symbol)
            .unwrap_or_else(|| Utc::now().timestamp_millis() - COLD_START_LOOKBACK_MS);
        match ctx.client.get_klines(symbol, Some(start), None, 1000).await {
            Ok(candles) => {
                let merged = ctx.store.ingest_candles(symbol, candles);
                info!(symbol, merged, "seeded candle history");
            }
            Err(e) => {
                warn!(symbol, error = %e, "failed to seed candle history");
                ctx.push_error(format!("history seed failed for {symbol}: {e}"), None);
            }
        }
        ctx.streams.subscribe_symbol(symbol);
    }
    info!(count = symbols.len(), "market data streams launched");

    // ── 5. Periodic jobs ─────────────────────────────────────────────────
    let job_ctx = ctx.clone();
    ctx.scheduler
        .add_job("check_online_status", Cadence::Secondly, move || {
            let ctx = job_ctx.clone();
            async move {
                let round_trip = ctx.client.ping().await?;
                ctx.record_ping(round_trip);
                let server_ms = ctx.client.get_server_time().await?;
                let diff = Utc::now().timestamp_millis() - server_ms;
                ctx.record_server_time_diff(diff as f64);
                Ok(())
            }
        });

    let job_ctx = ctx.clone();
    ctx.scheduler
        .add_job("lock_board", Cadence::Secondly, move || {
            let ctx = job_ctx.clone();
            async move {
                ctx.lock_board_if_idle();
                Ok(())
            }
        });

    let job_ctx = ctx.clone();
    ctx.scheduler
        .add_job("correct_time", Cadence::Minutely, move || {
            let ctx = job_ctx.clone();
            async move {
                let offset_ms = ctx.client.sync_time().await?;
                ctx.record_server_time_diff(offset_ms as f64);
                Ok(())
            }
        });

    let job_ctx = ctx.clone();
    ctx.scheduler
        .add_job("refresh_limits", Cadence::Hourly, move || {
            let ctx = job_ctx.clone();
            async move {
                ctx.client.refresh_limits().await?;
                Ok(())
            }
        });

    let job_ctx = ctx.clone();
    ctx.scheduler
        .add_job("compute_indicators", Cadence::Minutely, move || {
            let ctx = job_ctx.clone();
            async move {
                tokio::task::spawn_blocking(move || ctx.run_active_script()).await??;
                Ok(())
            }
        });

    let job_ctx = ctx.clone();
    ctx.scheduler.add_job(
        "persist_candles",
        Cadence::Every(Duration::from_secs(600)),
        move || {
            let ctx = job_ctx.clone();
            async move {
                let store = ctx.store.clone();
                let dir = ctx.settings.read().data_dir.join("candles");
                let _ = tokio::task::spawn_blocking(move || store.persist(&dir)).await??;
                Ok(())
            }
        },
    );

    let scheduler_handle = ctx.scheduler.run();
    info!("scheduler running");

    // ── 6. Wait for shutdown ─────────────────────────────────────────────
    let mut shutdown_rx = ctx.subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = shutdown_rx.changed() => info!("shutdown requested"),
    }

    // ── 7. Ordered shutdown ──────────────────────────────────────────────
    // Streams drain first so no ingestion overlaps the final flush, then the
    // scheduler drains its jobs.
    ctx.streams.shutdown(Duration::from_secs(5)).await;
    ctx.scheduler.shutdown(Duration::from_secs(5)).await;
    let _ = scheduler_handle.await;

    let store = ctx.store.clone();
    let dir = ctx.settings.read().data_dir.join("candles");
    match tokio::time::timeout(
        PERSIST_TIMEOUT,
        tokio::task::spawn_blocking(move || store.persist(&dir)),
    )
    .await
    {
        Ok(Ok(Ok(tables))) => info!(tables, "final candle flush complete"),
        Ok(Ok(Err(e))) => warn!(error = %e, "final candle flush failed"),
        Ok(Err(e)) => warn!(error = %e, "final candle flush task failed"),
        Err(_) => warn!("final candle flush timed out"),
    }

    info!("shutdown complete");
    Ok(())
}
