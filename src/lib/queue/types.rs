use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: u32,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub reason_resolved: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(default)]
    pub runs: Vec<RunInfo>,
}

/// The exclusive right to run `(status.task_id, run_id)` until `taken_until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub status: TaskStatus,
    pub run_id: u32,
    pub taken_until: DateTime<Utc>,
}

impl Claim {
    pub fn task_id(&self) -> &str {
        &self.status.task_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Validated later; a malformed payload is reported, not rejected here.
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimWorkRequest {
    pub tasks: usize,
    pub worker_group: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimWorkResponse {
    #[serde(default)]
    pub tasks: Vec<Claim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionReason {
    MalformedPayload,
    WorkerShutdown,
}

impl ExceptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionReason::MalformedPayload => "malformed-payload",
            ExceptionReason::WorkerShutdown => "worker-shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionRequest {
    pub reason: ExceptionReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    S3,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRequest {
    pub storage_type: StorageType,
    pub expires: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ArtifactRequest {
    pub fn s3(expires: DateTime<Utc>, content_type: impl Into<String>) -> Self {
        Self {
            storage_type: StorageType::S3,
            expires,
            content_type: Some(content_type.into()),
            reason: None,
            message: None,
        }
    }

    pub fn error(
        expires: DateTime<Utc>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            storage_type: StorageType::Error,
            expires,
            content_type: None,
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResponse {
    #[serde(default)]
    pub put_url: Option<String>,
}

/// A task-exception event as published by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExceptionMessage {
    pub status: TaskStatus,
    pub run_id: u32,
}

impl TaskExceptionMessage {
    /// `reasonResolved` of the run this message is about.
    pub fn reason_resolved(&self) -> Option<&str> {
        self.status
            .runs
            .iter()
            .find(|run| run.run_id == self.run_id)
            .and_then(|run| run.reason_resolved.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeCacheMessage {
    pub cache_name: String,
}


/// Body of an artifact upload.
#[derive(Debug)]
pub enum ArtifactBody {
    Bytes(Vec<u8>),
    /// Streamed from disk so large artifacts never sit in memory.
    File(PathBuf),
}
