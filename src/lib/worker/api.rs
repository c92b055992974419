use axum::{
    Json, Router,
    extract::State as AxumState,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use sysinfo::System;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::listener::{RunningTask, TaskListener};
use super::stats::{SystemStats, get_stats};
use crate::lib::queue::types::{PurgeCacheMessage, TaskExceptionMessage};

/// Local status API and ingress for the cancellation and purge feeds.
pub struct TaskServer {
    pub listener: Arc<TaskListener>,
    pub address: String,
    sysinfo: Mutex<System>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub idle: bool,
    pub paused: bool,
    pub pending: usize,
    pub capacity: usize,
}

impl TaskServer {
    pub fn new(listener: Arc<TaskListener>, address: &str) -> Self {
        Self {
            listener,
            address: address.to_string(),
            sysinfo: Mutex::new(System::new()),
        }
    }

    async fn get_tasks(AxumState(server): AxumState<Arc<TaskServer>>) -> Json<Vec<RunningTask>> {
        Json(server.listener.running_tasks())
    }

    async fn get_stats(AxumState(server): AxumState<Arc<TaskServer>>) -> Json<SystemStats> {
        let running = server.listener.running_tasks().len() as u64;
        let mut sysinfo = server.sysinfo.lock().await;
        sysinfo.refresh_all();
        Json(get_stats(&sysinfo, running))
    }

    async fn health(AxumState(server): AxumState<Arc<TaskServer>>) -> Json<Health> {
        let listener = &server.listener;
        Json(Health {
            idle: listener.is_idle(),
            paused: listener.is_paused(),
            pending: listener.pending(),
            capacity: listener.capacity(),
        })
    }

    async fn task_exception(
        AxumState(server): AxumState<Arc<TaskServer>>,
        Json(message): Json<TaskExceptionMessage>,
    ) -> impl IntoResponse {
        tracing::debug!(task_id = %message.status.task_id, run_id = message.run_id, "task-exception message");
        server.listener.cancel_task(&message).await;
        StatusCode::ACCEPTED
    }

    async fn purge_cache(
        AxumState(server): AxumState<Arc<TaskServer>>,
        Json(message): Json<PurgeCacheMessage>,
    ) -> impl IntoResponse {
        server.listener.purge_cache(&message);
        StatusCode::ACCEPTED
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/tasks", get(TaskServer::get_tasks))
            .route("/stats", get(TaskServer::get_stats))
            .route("/health", get(TaskServer::health))
            .route("/events/task-exception", post(TaskServer::task_exception))
            .route("/events/purge-cache", post(TaskServer::purge_cache))
            .with_state(self)
    }

    /// Serve until `shutdown` fires.
    pub async fn start_server(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let address = self.address.clone();
        let app = Arc::new(self).router();

        let listener = TcpListener::bind(&address).await?;
        tracing::info!(address = %address, "status api listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
