//! Periodic bounded-batch deletion of aged rows.
//!
//! Each table is cleaned with a repeated bounded `DELETE ... LIMIT batch`
//! (see `cgtw_db::cleanup_*`) until a round removes fewer than `batch_size`
//! rows, so a single sweep never holds a long-running transaction over a
//! huge backlog.

use std::time::Duration;

use sqlx::PgPool;

use cgtw_config::RetentionCfg;

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupCounts {
    pub gps_raw: u64,
    pub history: u64,
    pub events: u64,
}

/// Run one sweep across all three aged tables.
pub async fn cleanup_once(pool: &PgPool, cfg: &RetentionCfg) -> anyhow::Result<CleanupCounts> {
    tracing::info!("retention cleanup started");

    let gps_raw = cgtw_db::cleanup_gps_raw(pool, cfg.gps_raw_hours, cfg.batch_size).await?;
    if gps_raw > 0 {
        tracing::info!(deleted = gps_raw, table = "gps_raw_history", "retention cleanup");
    }

    let history = cgtw_db::cleanup_history(pool, cfg.history_days, cfg.batch_size).await?;
    if history > 0 {
        tracing::info!(deleted = history, table = "history", "retention cleanup");
    }

    let events = cgtw_db::cleanup_events(pool, cfg.events_days, cfg.batch_size).await?;
    if events > 0 {
        tracing::info!(deleted = events, table = "events", "retention cleanup");
    }

    tracing::info!(gps_raw, history, events, "retention cleanup done");
    Ok(CleanupCounts { gps_raw, history, events })
}

/// Runs `cleanup_once` immediately, then every `cleanup_interval_hours` — a
/// restart never has to wait out a full interval before the first sweep.
/// Errors are logged and the loop continues at the next interval.
pub async fn retention_loop(pool: PgPool, cfg: RetentionCfg) {
    let interval = Duration::from_secs(cfg.cleanup_interval_hours.max(1) * 3600);
    tracing::info!(
        interval_hours = cfg.cleanup_interval_hours,
        gps_raw_hours = cfg.gps_raw_hours,
        history_days = cfg.history_days,
        events_days = cfg.events_days,
        "retention task started"
    );

    loop {
        if let Err(e) = cleanup_once(&pool, &cfg).await {
            tracing::error!(error = %e, "retention cleanup error");
        }
        tokio::time::sleep(interval).await;
    }
}
