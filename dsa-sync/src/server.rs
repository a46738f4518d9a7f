//! Triggers for `serve` mode: the HTTP endpoint and the daily scheduler.
//!
//! Both go through one [`SyncRunner`], which allows a single run at a time.
//! An HTTP request that arrives while a run is active gets `409 Conflict`; a
//! scheduler tick that finds a run in flight is skipped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Days, Local, TimeZone};
use dsa_sync_core::config::SyncConfig;
use dsa_sync_core::contract::{ArtifactCache, RemoteStore, SheetTransformer};
use dsa_sync_core::synchronise::{synchronise, SyncError, SynchroniseReport};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::load_config::ServerSection;

/// Owns the collaborators of a run and serializes runs.
pub struct SyncRunner {
    parts: Arc<RunParts>,
    running: Arc<Mutex<()>>,
}

struct RunParts {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    transformer: Arc<dyn SheetTransformer>,
    cache: Arc<dyn ArtifactCache>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(SynchroniseReport),
    Busy,
    Failed(SyncError),
    /// The run task panicked or was cancelled by runtime shutdown.
    Aborted(String),
}

impl SyncRunner {
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        transformer: Arc<dyn SheetTransformer>,
        cache: Arc<dyn ArtifactCache>,
    ) -> Self {
        Self {
            parts: Arc::new(RunParts {
                config,
                remote,
                transformer,
                cache,
            }),
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run a synchronization unless one is already in progress.
    ///
    /// The run lives in its own task and holds the lock until it finishes, so
    /// dropping the returned future (a disconnected HTTP caller) does not stop it.
    pub async fn try_run(&self) -> RunOutcome {
        let Ok(guard) = self.running.clone().try_lock_owned() else {
            warn!("Synchronisation already running, not starting another");
            return RunOutcome::Busy;
        };
        let parts = self.parts.clone();
        let run = tokio::spawn(async move {
            let _guard = guard;
            synchronise(
                &parts.config,
                parts.remote.as_ref(),
                parts.transformer.as_ref(),
                parts.cache.as_ref(),
            )
            .await
        });

        match run.await {
            Ok(Ok(report)) => RunOutcome::Completed(report),
            Ok(Err(e)) => RunOutcome::Failed(e),
            Err(e) => {
                error!(error = %e, "Synchronisation task did not finish");
                RunOutcome::Aborted(e.to_string())
            }
        }
    }
}

pub fn router(runner: Arc<SyncRunner>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files", get(sync_files))
        .with_state(runner)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// `GET /files`: run a full synchronization and answer with its report.
async fn sync_files(State(runner): State<Arc<SyncRunner>>) -> Response {
    info!(trigger = "http", "Synchronisation requested");
    match runner.try_run().await {
        RunOutcome::Completed(report) => (StatusCode::OK, Json(report)).into_response(),
        RunOutcome::Busy => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "synchronisation already running" })),
        )
            .into_response(),
        RunOutcome::Failed(e) => {
            error!(trigger = "http", error = %e, "Synchronisation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        RunOutcome::Aborted(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": reason })),
        )
            .into_response(),
    }
}

/// First occurrence of `hour:minute` strictly after `now`, in `now`'s time zone.
///
/// Returns `None` only for an invalid time of day.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32, minute: u32) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let today = now.date_naive();
    // A DST gap can swallow the target time on one day, never on three.
    (0..3u64).find_map(|offset| {
        let date = today.checked_add_days(Days::new(offset))?;
        let local = date.and_hms_opt(hour, minute, 0)?;
        let candidate = tz.from_local_datetime(&local).earliest()?;
        (candidate > *now).then_some(candidate)
    })
}

/// Trigger a run every day at `hour:minute` local time until shutdown.
pub async fn run_daily(
    runner: Arc<SyncRunner>,
    hour: u32,
    minute: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let now = Local::now();
        let Some(next) = next_run_after(&now, hour, minute) else {
            error!(hour, minute, "Invalid schedule time, scheduler stopped");
            return;
        };
        let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
        info!(next_run = %next, "Next scheduled synchronisation");

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(wait) => {
                match runner.try_run().await {
                    RunOutcome::Completed(report) => {
                        info!(trigger = "schedule", ?report, "Scheduled synchronisation complete");
                    }
                    RunOutcome::Busy => {
                        warn!(trigger = "schedule", "Previous run still active, skipping this tick");
                    }
                    RunOutcome::Failed(e) => {
                        error!(trigger = "schedule", error = %e, "Scheduled synchronisation failed");
                    }
                    RunOutcome::Aborted(reason) => {
                        error!(trigger = "schedule", reason = %reason, "Scheduled synchronisation aborted");
                    }
                }
            }
        }
    }
    info!("Scheduler stopped");
}

/// Serve the HTTP trigger and run the daily scheduler until Ctrl-C.
pub async fn serve(runner: Arc<SyncRunner>, settings: &ServerSection) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let scheduler = tokio::spawn(run_daily(
        runner.clone(),
        settings.schedule_hour,
        settings.schedule_minute,
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "Listening for synchronisation requests");

    axum::serve(listener, router(runner))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = ?e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    let _ = shutdown_tx.send(());
    scheduler.await.ok();
    Ok(())
}
