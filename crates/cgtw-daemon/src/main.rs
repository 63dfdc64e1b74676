//! cgtw-writer entry point.
//!
//! Thin by design: load config, init tracing, connect the pool, warm-start
//! the GPS filter from the last stored fix per router, then spawn the
//! ingest loop, the watchdog, the retention sweeper, and the worker pool.
//! `--cleanup` runs one retention sweep and exits without starting the
//! broker connection.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use cgtw_dispatch::DispatchState;
use cgtw_ingest::Queues;
use cgtw_watchdog::LivenessMap;

#[derive(Parser)]
#[command(name = "cgtw-writer")]
#[command(about = "CG telemetry writer: MQTT -> Postgres ingest daemon")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yml")]
    config: String,

    /// Run one retention sweep and exit, without starting the ingest pipeline.
    #[arg(long)]
    cleanup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();
    let cfg = cgtw_config::load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;

    let _log_guard = init_tracing(&cfg.logging);

    let pool = cgtw_db::connect(&cfg.postgres).await?;
    cgtw_db::migrate(&pool).await?;

    if cli.cleanup {
        let counts = cgtw_retention::cleanup_once(&pool, &cfg.retention).await?;
        tracing::info!(?counts, "one-shot cleanup complete");
        return Ok(());
    }

    let dispatch_state = Arc::new(DispatchState::new());
    let warm_started = dispatch_state.warm_start_gps(&pool, &cfg).await?;
    tracing::info!(routers = warm_started, "gps filter warm start complete");

    let cfg = Arc::new(cfg);
    let liveness = Arc::new(LivenessMap::new());
    let queues = Arc::new(Queues::new(&cfg));

    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(cgtw_ingest::ingest_loop(cfg.clone(), liveness.clone(), queues.clone()));
    tasks.spawn(cgtw_watchdog::watchdog_loop(
        pool.clone(),
        liveness.clone(),
        cfg.events_policy.clone(),
    ));
    tasks.spawn(cgtw_retention::retention_loop(pool.clone(), cfg.retention.clone()));

    for worker_id in 0..cfg.ingest.worker_count.max(1) {
        tasks.spawn(cgtw_ingest::worker_loop(
            worker_id,
            cfg.clone(),
            pool.clone(),
            dispatch_state.clone(),
            queues.clone(),
        ));
    }

    tracing::info!(workers = cfg.ingest.worker_count.max(1), "cgtw-writer running");

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping");
        }
        Some(res) = tasks.join_next() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "a pipeline task panicked");
            }
        }
    }

    tasks.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Plain or JSON formatting per config, level from `EnvFilter` (falling back
/// to `logging.level`), and an optional rolling file tee. The returned guard
/// must be held for the life of the process or buffered file lines are lost.
fn init_tracing(cfg: &cgtw_config::LoggingCfg) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let stdout_layer = if cfg.json_logs {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

    if cfg.log_file.is_empty() {
        registry.init();
        return None;
    }

    let path = std::path::Path::new(&cfg.log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "cgtw-writer.log".to_string());
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = if cfg.json_logs {
        fmt::layer().json().with_writer(non_blocking).with_ansi(false).boxed()
    } else {
        fmt::layer().with_writer(non_blocking).with_ansi(false).boxed()
    };

    registry.with(file_layer).init();
    Some(guard)
}
