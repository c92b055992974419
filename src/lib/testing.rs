//! In-memory stand-ins for the queue and the container engine.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::lib::error::{DockerError, QueueError};
use crate::lib::queue::Queue;
use crate::lib::queue::types::{
    ArtifactBody, ArtifactRequest, ArtifactResponse, Claim, ExceptionReason, RunInfo, TaskDefinition,
    TaskStatus,
};
use crate::lib::tasks::docker::{
    ArchiveStream, ContainerRuntime, ContainerStatus, LogStream, RegistryAuth,
};
use crate::lib::tasks::log::TaskLog;
use crate::lib::tasks::types::ContainerSpec;

pub fn claim(task_id: &str, run_id: u32, lease: Duration) -> Claim {
    Claim {
        status: TaskStatus {
            task_id: task_id.to_string(),
            runs: vec![RunInfo {
                run_id,
                state: Some("running".to_string()),
                reason_resolved: None,
            }],
        },
        run_id,
        taken_until: lease_from_now(lease),
    }
}

fn lease_from_now(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero())
}

pub fn definition(payload: serde_json::Value, scopes: &[&str]) -> TaskDefinition {
    TaskDefinition {
        created: Some(Utc::now()),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        payload,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Completed,
    Failed,
    Exception(ExceptionReason),
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub put_url: String,
    pub body: Vec<u8>,
    /// Sent from a file on disk rather than from memory.
    pub streamed: bool,
    pub content_type: String,
    pub content_encoding: Option<String>,
}

#[derive(Default)]
struct QueueState {
    pending_claims: VecDeque<Claim>,
    claim_requests: Vec<usize>,
    definitions: HashMap<String, TaskDefinition>,
    reclaims: Vec<(String, u32, tokio::time::Instant)>,
    fail_reclaim: bool,
    reports: Vec<(String, u32, Report)>,
    artifacts: Vec<(String, ArtifactRequest)>,
    uploads: Vec<Upload>,
}

pub struct FakeQueue {
    state: Mutex<QueueState>,
    reclaim_lease: Duration,
}

impl Default for FakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            reclaim_lease: Duration::from_secs(20 * 60),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    pub fn push_claim(&self, claim: Claim) {
        self.lock().pending_claims.push_back(claim);
    }

    pub fn define(&self, task_id: &str, definition: TaskDefinition) {
        self.lock()
            .definitions
            .insert(task_id.to_string(), definition);
    }

    pub fn fail_reclaims(&self) {
        self.lock().fail_reclaim = true;
    }

    pub fn claim_requests(&self) -> Vec<usize> {
        self.lock().claim_requests.clone()
    }

    pub fn reclaims(&self) -> Vec<(String, u32, tokio::time::Instant)> {
        self.lock().reclaims.clone()
    }

    pub fn reports(&self) -> Vec<(String, u32, Report)> {
        self.lock().reports.clone()
    }

    pub fn reports_for(&self, task_id: &str) -> Vec<Report> {
        self.lock()
            .reports
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .map(|(_, _, report)| report.clone())
            .collect()
    }

    pub fn artifacts(&self) -> Vec<(String, ArtifactRequest)> {
        self.lock().artifacts.clone()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    fn report(&self, task_id: &str, run_id: u32, report: Report) {
        self.lock()
            .reports
            .push((task_id.to_string(), run_id, report));
    }
}

#[async_trait]
impl Queue for FakeQueue {
    async fn claim_work(&self, count: usize) -> Result<Vec<Claim>, QueueError> {
        let mut state = self.lock();
        state.claim_requests.push(count);
        let take = count.min(state.pending_claims.len());
        Ok(state.pending_claims.drain(..take).collect())
    }

    async fn task(&self, task_id: &str) -> Result<TaskDefinition, QueueError> {
        self.lock()
            .definitions
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::Status {
                endpoint: format!("/task/{task_id}"),
                status: 404,
                message: "not found".to_string(),
            })
    }

    async fn reclaim_task(&self, task_id: &str, run_id: u32) -> Result<Claim, QueueError> {
        let mut state = self.lock();
        state
            .reclaims
            .push((task_id.to_string(), run_id, tokio::time::Instant::now()));
        if state.fail_reclaim {
            return Err(QueueError::Status {
                endpoint: format!("/task/{task_id}/runs/{run_id}/reclaim"),
                status: 409,
                message: "run is not running".to_string(),
            });
        }
        Ok(claim(task_id, run_id, self.reclaim_lease))
    }

    async fn report_completed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError> {
        self.report(task_id, run_id, Report::Completed);
        Ok(())
    }

    async fn report_failed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError> {
        self.report(task_id, run_id, Report::Failed);
        Ok(())
    }

    async fn report_exception(
        &self,
        task_id: &str,
        run_id: u32,
        reason: ExceptionReason,
    ) -> Result<(), QueueError> {
        self.report(task_id, run_id, Report::Exception(reason));
        Ok(())
    }

    async fn create_artifact(
        &self,
        _task_id: &str,
        _run_id: u32,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<ArtifactResponse, QueueError> {
        self.lock()
            .artifacts
            .push((name.to_string(), request.clone()));
        let put_url = request
            .content_type
            .as_ref()
            .map(|_| format!("http://storage.test/{name}"));
        Ok(ArtifactResponse { put_url })
    }

    fn build_artifact_url(&self, task_id: &str, run_id: u32, name: &str) -> String {
        format!("http://queue.test/task/{task_id}/runs/{run_id}/artifacts/{name}")
    }

    async fn put_artifact(
        &self,
        put_url: &str,
        body: ArtifactBody,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), QueueError> {
        let (body, streamed) = match body {
            ArtifactBody::Bytes(bytes) => (bytes, false),
            ArtifactBody::File(path) => (std::fs::read(path)?, true),
        };
        self.lock().uploads.push(Upload {
            put_url: put_url.to_string(),
            body,
            streamed,
            content_type: content_type.to_string(),
            content_encoding: content_encoding.map(str::to_string),
        });
        Ok(())
    }
}

/// How a fake container behaves once started.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Output chunks and their offset from container start.
    pub output: Vec<(Duration, Vec<u8>)>,
    pub run_for: Duration,
    pub exit_code: i64,
    /// How long `start_container` takes to return.
    pub start_delay: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            output: vec![(Duration::ZERO, b"hello\n".to_vec())],
            run_for: Duration::from_millis(10),
            exit_code: 0,
            start_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub killed: bool,
    pub removed: bool,
    started_at: Option<tokio::time::Instant>,
    stop: CancellationToken,
}

#[derive(Default)]
struct DockerState {
    containers: HashMap<String, FakeContainer>,
    created: Vec<String>,
    next_id: usize,
    pulled: Vec<String>,
    removed_images: Vec<String>,
    failing_pulls: HashSet<String>,
    fail_create: bool,
    remove_failures: HashMap<String, u32>,
    archives: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<DockerState>,
    behavior: Mutex<Behavior>,
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        let docker = Self::default();
        *docker.behavior.lock().unwrap() = behavior;
        docker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DockerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_pull(&self, image: &str) {
        self.lock().failing_pulls.insert(image.to_string());
    }

    pub fn fail_create(&self) {
        self.lock().fail_create = true;
    }

    /// Make the next `times` removals of `id` fail.
    pub fn fail_removal(&self, id: &str, times: u32) {
        self.lock().remove_failures.insert(id.to_string(), times);
    }

    pub fn add_archive(&self, path: &str, tar: Vec<u8>) {
        self.lock().archives.insert(path.to_string(), tar);
    }

    /// Register a container that was not created through the runtime.
    pub fn add_container(&self, id: &str, running: bool) {
        self.lock().containers.insert(
            id.to_string(),
            FakeContainer {
                spec: ContainerSpec::default(),
                running,
                killed: false,
                removed: false,
                started_at: None,
                stop: CancellationToken::new(),
            },
        );
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    /// Container ids in creation order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.lock().removed_images.clone()
    }

    fn not_found(id: &str) -> DockerError {
        DockerError::NotFound(id.to_string())
    }

    fn live(&self, id: &str) -> Result<FakeContainer, DockerError> {
        self.lock()
            .containers
            .get(id)
            .filter(|c| !c.removed)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }
}

#[async_trait]
impl ContainerRuntime for FakeDocker {
    async fn pull_image(
        &self,
        image: &str,
        _auth: Option<RegistryAuth>,
        log: &TaskLog,
    ) -> Result<(), DockerError> {
        let mut state = self.lock();
        if state.failing_pulls.contains(image) {
            return Err(DockerError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        state.pulled.push(image.to_string());
        log.write(format!("pulled {image}\r\n"));
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        let state = self.lock();
        Ok(state.pulled.iter().any(|i| i == image)
            && !state.removed_images.iter().any(|i| i == image))
    }

    async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        self.lock().removed_images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(DockerError::ClientError("no space left on device".to_string()));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.created.push(id.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                killed: false,
                removed: false,
                started_at: None,
                stop: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let delay = self.behavior.lock().unwrap().start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Self::not_found(id))?;
        // A kill that landed before the start does not stop the new process.
        if container.stop.is_cancelled() {
            container.stop = CancellationToken::new();
        }
        container.running = true;
        container.started_at = Some(tokio::time::Instant::now());
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<LogStream, DockerError> {
        let container = self.live(id)?;
        let started = container
            .started_at
            .unwrap_or_else(tokio::time::Instant::now);
        let behavior = self.behavior.lock().unwrap().clone();
        let chunks: VecDeque<(Duration, Vec<u8>)> = behavior
            .output
            .into_iter()
            .filter(|(at, _)| *at <= behavior.run_for)
            .collect();
        let stop = container.stop;

        Ok(stream::unfold(chunks, move |mut chunks| {
            let stop = stop.clone();
            async move {
                let (at, chunk) = chunks.pop_front()?;
                tokio::select! {
                    _ = stop.cancelled() => None,
                    _ = tokio::time::sleep_until(started + at) => Some((Ok(chunk), chunks)),
                }
            }
        })
        .boxed())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let container = self.live(id)?;
        let behavior = self.behavior.lock().unwrap().clone();
        let started = container
            .started_at
            .unwrap_or_else(tokio::time::Instant::now);

        let code = tokio::select! {
            _ = container.stop.cancelled() => 137,
            _ = tokio::time::sleep_until(started + behavior.run_for) => behavior.exit_code,
        };
        if let Some(c) = self.lock().containers.get_mut(id) {
            c.running = false;
        }
        Ok(code)
    }

    async fn kill_container(&self, id: &str) -> Result<(), DockerError> {
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .filter(|c| !c.removed)
            .ok_or_else(|| Self::not_found(id))?;
        container.killed = true;
        container.running = false;
        container.stop.cancel();
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, DockerError> {
        let container = self.live(id)?;
        Ok(ContainerStatus {
            name: id.to_string(),
            running: container.running,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let mut state = self.lock();
        if let Some(remaining) = state.remove_failures.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DockerError::ClientError(format!(
                    "removal of container {id} is already in progress"
                )));
            }
        }
        let container = state
            .containers
            .get_mut(id)
            .filter(|c| !c.removed)
            .ok_or_else(|| Self::not_found(id))?;
        container.removed = true;
        container.running = false;
        container.stop.cancel();
        Ok(())
    }

    async fn download_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<ArchiveStream, DockerError> {
        self.live(id)?;
        let archive = self
            .lock()
            .archives
            .get(path)
            .cloned()
            .ok_or_else(|| DockerError::NotFound(path.to_string()))?;
        // Hand the tar back in small chunks, the way the engine streams it.
        let chunks: Vec<Result<Vec<u8>, DockerError>> =
            archive.chunks(64 * 1024).map(|c| Ok(c.to_vec())).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Tar archive holding a single regular file, as docker would return it.
pub fn tar_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

/// Tar archive holding a directory with the given files.
pub fn tar_with_dir(dir: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o755);
    header.set_entry_type(tar::EntryType::Directory);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{dir}/"), std::io::empty())
        .unwrap();
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{dir}/{name}"), *contents)
            .unwrap();
    }
    builder.into_inner().unwrap()
}
