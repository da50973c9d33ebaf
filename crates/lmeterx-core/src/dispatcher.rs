use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Configuration;
use crate::error::EngineError;
use crate::runner;
use crate::store::Store;
use crate::task::TaskStatus;

/// Long-lived process that polls for `CREATED` tasks, claims one at a time
/// with a DB row-lock fencing token, and supervises the Task Runner
/// subprocess it spawns for each. Exposes `GET /health` for liveness probes.
pub struct Dispatcher {
    id: String,
    store: Store,
    config: Configuration,
    self_exe: PathBuf,
    last_tick_unix: Arc<AtomicI64>,
}

impl Dispatcher {
    pub fn new(store: Store, config: Configuration, self_exe: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            config,
            self_exe,
            last_tick_unix: Arc::new(AtomicI64::new(Utc::now().timestamp())),
        }
    }

    pub async fn run(self) -> Result<(), EngineError> {
        let recovered = self.store.recover_orphans().await?;
        if recovered > 0 {
            warn!(recovered, "reset orphaned tasks left LOCKED/RUNNING by a previous dispatcher");
        }

        let health = tokio::spawn(serve_health(self.last_tick_unix.clone(), self.config.health_port));

        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            self.last_tick_unix.store(Utc::now().timestamp(), Ordering::Relaxed);

            match self.store.claim_pending_task(&self.id).await {
                Ok(Some(task)) => {
                    let task_id = task.id;
                    info!(%task_id, dispatcher = %self.id, "claimed task");
                    if let Err(e) = self.store.update_task_status(task_id, TaskStatus::Running, None).await {
                        error!(%task_id, error = %e, "failed to mark task RUNNING");
                        continue;
                    }

                    // Owned here so an operator-issued STOPPING can be
                    // turned into a Scheduler cancellation without blocking
                    // this poll loop on anything but the run itself: the
                    // watcher polls `store` concurrently with `run_task`.
                    let cancel = CancellationToken::new();
                    let watcher = runner::spawn_stop_watcher(
                        self.store.clone(),
                        task_id,
                        cancel.clone(),
                        self.config.poll_interval,
                    );
                    let outcome = runner::run_task(task, &self.config, &self.store, &self.self_exe, cancel.clone()).await;
                    watcher.abort();

                    match outcome {
                        Ok(summary) => {
                            if let Err(e) = self.store.insert_final_summary(&summary).await {
                                error!(%task_id, error = %e, "failed to persist final summary");
                            }
                            let status = if cancel.is_cancelled() {
                                TaskStatus::Stopped
                            } else if self.config.meets_success_floor(summary.success_rate) {
                                TaskStatus::Completed
                            } else {
                                TaskStatus::FailedRequests
                            };
                            let _ = self.store.update_task_status(task_id, status, None).await;
                            info!(%task_id, %status, "task finished");
                        }
                        Err(e) => {
                            error!(%task_id, error = %e, "task runner failed");
                            let _ = self
                                .store
                                .update_task_status(task_id, TaskStatus::Failed, Some(&e.to_string()))
                                .await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to poll for pending tasks"),
            }

            if health.is_finished() {
                warn!("health server task exited, dispatcher continuing without it");
            }
        }
    }
}

async fn serve_health(last_tick_unix: Arc<AtomicI64>, port: u16) {
    let app = Router::new().route(
        "/health",
        get(move || {
            let last_tick_unix = last_tick_unix.clone();
            async move {
                let last = last_tick_unix.load(Ordering::Relaxed);
                let age = Utc::now().timestamp() - last;
                if age <= 30 {
                    (axum::http::StatusCode::OK, Json(json!({"status": "ok", "last_tick_age_secs": age})))
                } else {
                    (
                        axum::http::StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({"status": "stale", "last_tick_age_secs": age})),
                    )
                }
            }
        }),
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "health server exited");
            }
        }
        Err(e) => error!(error = %e, port, "failed to bind health server"),
    }
}
