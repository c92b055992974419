//! One claimed task run, from claim to report.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use chrono::Utc;
use futures_util::StreamExt;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use super::docker::RegistryAuth;
use super::log::{TaskLog, fmt_log};
use super::payload::{SchemaError, validate_payload};
use super::scopes::{PRIVILEGED_SCOPE, cache_scope, device_scope, missing_scopes, scope_match};
use super::state::valid_state_transition;
use super::types::{Bind, ContainerSpec, DeviceBinding, Payload, TaskState, env_to_docker};
use crate::lib::error::{FeatureError, TaskError};
use crate::lib::features::{Feature, LinkInfo};
use crate::lib::queue::types::{Claim, ExceptionReason, TaskDefinition};
use crate::lib::worker::runtime::Runtime;

pub const CANCEL_MESSAGE: &str = "Task was canceled by another entity. This can happen using \
    a queue client or by cancelling the task from a dashboard.";

/// How long container output may keep flowing after the container exited.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a killed container gets to report its exit.
const KILL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The container ran to the end; the caller reports the result.
    Finished { success: bool },
    /// The run was cut short and already resolved through `abort_run`.
    Aborted,
}

struct ExecState {
    state: TaskState,
    exception: Option<ExceptionReason>,
    container_id: Option<String>,
    volume_caches: Vec<String>,
    claim: Claim,
    started_at: Option<Instant>,
}

pub struct TaskExecution {
    runtime: Arc<Runtime>,
    task_id: String,
    run_id: u32,
    definition: TaskDefinition,
    payload: OnceLock<Payload>,
    cpuset: Option<usize>,
    features: Vec<Box<dyn Feature>>,
    log: Arc<TaskLog>,
    inner: Mutex<ExecState>,
    interrupted: CancellationToken,
    reclaim_timer: Mutex<Option<JoinHandle<()>>>,
    runtime_timer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskExecution {
    pub fn new(
        runtime: Arc<Runtime>,
        definition: TaskDefinition,
        claim: Claim,
        cpuset: Option<usize>,
    ) -> Arc<Self> {
        let features = runtime.features.select(&definition.payload);
        Arc::new(Self {
            task_id: claim.task_id().to_string(),
            run_id: claim.run_id,
            runtime,
            definition,
            payload: OnceLock::new(),
            cpuset,
            features,
            log: Arc::new(TaskLog::new()),
            inner: Mutex::new(ExecState {
                state: TaskState::Pending,
                exception: None,
                container_id: None,
                volume_caches: Vec::new(),
                claim,
                started_at: None,
            }),
            interrupted: CancellationToken::new(),
            reclaim_timer: Mutex::new(None),
            runtime_timer: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ExecState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn log(&self) -> &TaskLog {
        &self.log
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn raw_payload(&self) -> &serde_json::Value {
        &self.definition.payload
    }

    /// Set once the payload passed validation.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.get()
    }

    pub fn cpuset(&self) -> Option<usize> {
        self.cpuset
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TaskState::Aborted
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    pub fn container_id(&self) -> Option<String> {
        self.lock().container_id.clone()
    }

    pub fn claim(&self) -> Claim {
        self.lock().claim.clone()
    }

    fn transition(&self, to: TaskState) -> bool {
        let mut inner = self.lock();
        if valid_state_transition(&inner.state, &to) {
            inner.state = to;
            true
        } else {
            false
        }
    }

    /// Resolve a finished run. Loses against any abort or cancel that got in
    /// first.
    fn try_finish(&self, success: bool) -> bool {
        let target = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        let mut inner = self.lock();
        if inner.state == TaskState::Running {
            inner.state = target;
            true
        } else {
            false
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TaskError> {
        let claim = self.claim();
        tracing::info!(
            task_id = %self.task_id,
            run_id = self.run_id,
            taken_until = %claim.taken_until,
            "task start"
        );
        self.schedule_reclaim(&claim);

        let result = self.run().await;

        self.clear_timers();
        self.hand_off_resources();

        match result? {
            RunOutcome::Finished { success } => {
                if self.try_finish(success) {
                    self.complete_run(success).await?;
                } else if self.is_aborted() {
                    // Aborted after the last checkpoint.
                    self.report_abort().await?;
                }
            }
            RunOutcome::Aborted => {}
        }
        Ok(())
    }

    pub async fn run(self: &Arc<Self>) -> Result<RunOutcome, TaskError> {
        if let Some(max_run_time) = self.raw_payload().get("maxRunTime").and_then(|v| v.as_u64()) {
            self.set_runtime_timeout(max_run_time);
        }

        if !self.transition(TaskState::Running) {
            return self.abort_run(&self.state().to_string(), None).await;
        }
        self.lock().started_at = Some(Instant::now());
        self.log.write(self.log_header());

        let link_info = match self.setup_features().await {
            Ok(info) => info,
            Err(e) => {
                self.transition(TaskState::StatesFailed);
                self.abort(
                    &format!(
                        "Task was aborted because states could not be created successfully. Error: {e}"
                    ),
                    None,
                )
                .await;
                LinkInfo::default()
            }
        };
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        let payload = match validate_payload(
            self.raw_payload(),
            self.runtime.config.task.max_run_time_ceiling,
        ) {
            Ok(payload) => payload,
            Err(errors) => {
                self.lock().exception = Some(ExceptionReason::MalformedPayload);
                return self
                    .abort_run("validation_failed", Some(log_schema_errors(&errors)))
                    .await;
            }
        };
        let payload = self.payload.get_or_init(|| payload);

        let image = payload.image.name().to_string();
        let auth = self
            .runtime
            .config
            .registry_for(&image)
            .map(|(server, creds)| RegistryAuth {
                server: server.to_string(),
                username: creds.username.clone(),
                password: creds.password.clone(),
            });
        if let Err(e) = self.runtime.docker.pull_image(&image, auth, &self.log).await {
            let error = fmt_log(&format!(
                "Pulling docker image \"{image}\" has failed. This may indicate an error with \
                 the registry or with the credentials used to pull it. Error: {e}"
            ));
            return self.abort_run("pull_failed", Some(error)).await;
        }
        self.runtime.gc.mark_image(&image);
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        let spec = match self.docker_config(payload, &link_info).await {
            Ok(spec) => spec,
            Err(e) => {
                let error = fmt_log(&format!(
                    "Docker configuration could not be created. This may indicate an \
                     authentication error when validating scopes necessary for running the \
                     task.\n Error {e}"
                ));
                return self.abort_run("docker_configuration", Some(error)).await;
            }
        };
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        let container_id = match self.runtime.docker.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                let error = fmt_log(&format!("Failure to properly create the container: {e}"));
                return self.abort_run("create_container", Some(error)).await;
            }
        };
        self.lock().container_id = Some(container_id.clone());
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        if let Err(e) = self.runtime.docker.start_container(&container_id).await {
            let error = fmt_log(&format!("Failure to properly start the container: {e}"));
            return self.abort_run("start_container", Some(error)).await;
        }
        // A kill issued while the start was in flight hit a stopped container.
        if self.interrupted.is_cancelled() {
            self.kill_container(&container_id).await;
        }
        let pump = self.pipe_output(&container_id).await;
        tracing::info!(task_id = %self.task_id, run_id = self.run_id, container_id = %container_id, "task run");

        let mut exit_code = tokio::select! {
            code = self.runtime.docker.wait_container(&container_id) => code?,
            _ = self.interrupted.cancelled() => {
                match tokio::time::timeout(KILL_GRACE, self.runtime.docker.wait_container(&container_id)).await {
                    Ok(Ok(code)) => code,
                    _ => -1,
                }
            }
        };
        let mut success = exit_code == 0;

        if let Some(pump) = pump {
            let handle = pump.abort_handle();
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, pump).await.is_err() {
                tracing::warn!(task_id = %self.task_id, "container output did not finish draining");
                handle.abort();
            }
        }
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        for feature in &self.features {
            if let Err(e) = feature.stopped(self).await {
                let incident_id = uuid::Uuid::new_v4();
                tracing::error!(
                    task_id = %self.task_id,
                    run_id = self.run_id,
                    feature = feature.name(),
                    incident_id = %incident_id,
                    error = %e,
                    "error stopping features for running task"
                );
                self.log.write(fmt_log(&format!(
                    "Unknown worker error encountered. Ask an administrator to look up \
                     incidentId in the worker log. Incident ID: {incident_id}"
                )));
                success = false;
                exit_code = -1;
            }
        }

        self.clear_runtime_timeout();
        if let Some(outcome) = self.checkpoint().await? {
            return Ok(outcome);
        }

        self.log.end(self.log_footer(success, exit_code));

        for feature in &self.features {
            if let Err(e) = feature.killed(self).await {
                tracing::error!(
                    task_id = %self.task_id,
                    run_id = self.run_id,
                    feature = feature.name(),
                    error = %e,
                    "error killing features for completed task"
                );
            }
        }

        Ok(RunOutcome::Finished { success })
    }

    async fn setup_features(&self) -> Result<LinkInfo, FeatureError> {
        let mut info = LinkInfo::default();
        for feature in &self.features {
            info.merge(feature.link(self).await?);
        }
        for feature in &self.features {
            feature.created(self).await?;
        }
        Ok(info)
    }

    /// Resolve through `abort_run` if the run was interrupted.
    async fn checkpoint(&self) -> Result<Option<RunOutcome>, TaskError> {
        let state = self.state();
        match state {
            TaskState::Aborted | TaskState::Canceled => {
                Ok(Some(self.abort_run(&state.to_string(), None).await?))
            }
            _ => Ok(None),
        }
    }

    async fn pipe_output(&self, container_id: &str) -> Option<JoinHandle<()>> {
        let mut stream = match self.runtime.docker.logs(container_id).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, container_id, error = %e, "could not attach to container output");
                return None;
            }
        };
        let log = self.log.clone();
        let task_id = self.task_id.clone();
        Some(tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        log.write(bytes);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "container output stream failed");
                        break;
                    }
                }
            }
        }))
    }

    /// Stop the run in favour of the worker: kill the container and record
    /// what to report. Only the first terminal transition takes effect.
    pub async fn abort(&self, reason: &str, exception: Option<ExceptionReason>) {
        let container_id = {
            let mut inner = self.lock();
            if !valid_state_transition(&inner.state, &TaskState::Aborted) {
                tracing::debug!(task_id = %self.task_id, state = %inner.state, reason, "abort ignored");
                return;
            }
            inner.state = TaskState::Aborted;
            inner.exception = exception;
            inner.container_id.clone()
        };
        self.interrupted.cancel();
        tracing::warn!(task_id = %self.task_id, run_id = self.run_id, reason, "abort task");
        self.log.write(fmt_log(&format!(
            "Task has been aborted prematurely. Reason: {reason}"
        )));
        if let Some(id) = container_id {
            self.kill_container(&id).await;
        }
    }

    /// The queue already resolved this run elsewhere; stop without reporting.
    pub async fn cancel(&self, reason: &str) {
        let container_id = {
            let mut inner = self.lock();
            if !valid_state_transition(&inner.state, &TaskState::Canceled) {
                tracing::debug!(task_id = %self.task_id, state = %inner.state, reason, "cancel ignored");
                return;
            }
            inner.state = TaskState::Canceled;
            inner.container_id.clone()
        };
        self.interrupted.cancel();
        tracing::info!(task_id = %self.task_id, run_id = self.run_id, reason, "cancel task");
        self.log.write(fmt_log(CANCEL_MESSAGE));
        if let Some(id) = container_id {
            self.kill_container(&id).await;
        }
    }

    async fn kill_container(&self, container_id: &str) {
        match self.runtime.docker.kill_container(container_id).await {
            Ok(()) => tracing::debug!(task_id = %self.task_id, container_id, "killed container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(task_id = %self.task_id, container_id, error = %e, "failed to kill container")
            }
        }
    }

    /// Resolve a run that did not exit cleanly: explain, close the log, run
    /// `killed` hooks and report unless the run was canceled.
    pub async fn abort_run(
        &self,
        stage: &str,
        error: Option<String>,
    ) -> Result<RunOutcome, TaskError> {
        let state = {
            let mut inner = self.lock();
            if inner.state != TaskState::Canceled
                && valid_state_transition(&inner.state, &TaskState::Aborted)
            {
                inner.state = TaskState::Aborted;
            }
            inner.state
        };
        self.interrupted.cancel();

        if let Some(error) = error {
            self.log.write(error);
        }
        self.log.end(self.log_footer(false, -1));

        for feature in &self.features {
            if let Err(e) = feature.killed(self).await {
                tracing::warn!(
                    task_id = %self.task_id,
                    run_id = self.run_id,
                    feature = feature.name(),
                    stage,
                    error = %e,
                    "error killing features for aborted task"
                );
            }
        }

        if state == TaskState::Aborted {
            self.report_abort().await?;
        }
        tracing::info!(task_id = %self.task_id, run_id = self.run_id, stage, state = %state, "task resolved");
        Ok(RunOutcome::Aborted)
    }

    async fn report_abort(&self) -> Result<(), TaskError> {
        let exception = self.lock().exception;
        let queue = &self.runtime.queue;
        match exception {
            Some(reason) => {
                queue
                    .report_exception(&self.task_id, self.run_id, reason)
                    .await?
            }
            None => queue.report_failed(&self.task_id, self.run_id).await?,
        }
        Ok(())
    }

    pub async fn complete_run(&self, success: bool) -> Result<(), TaskError> {
        let queue = &self.runtime.queue;
        if success {
            queue.report_completed(&self.task_id, self.run_id).await?;
        } else {
            queue.report_failed(&self.task_id, self.run_id).await?;
        }
        tracing::info!(
            task_id = %self.task_id,
            run_id = self.run_id,
            state = if success { "completed" } else { "failed" },
            "task resolved"
        );
        Ok(())
    }

    /// Renew the lease and store the new claim.
    pub async fn reclaim_task(&self) -> Result<Claim, TaskError> {
        tracing::debug!(task_id = %self.task_id, run_id = self.run_id, "issue reclaim");
        let claim = self
            .runtime
            .queue
            .reclaim_task(&self.task_id, self.run_id)
            .await?;
        self.lock().claim = claim.clone();
        Ok(claim)
    }

    pub fn reclaim_delay(&self, claim: &Claim) -> Duration {
        let remaining = (claim.taken_until - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        remaining.div_f64(self.runtime.config.task.reclaim_divisor)
    }

    /// Replace the reclaim timer. Each successful reclaim schedules the next
    /// one from the renewed lease; a failed reclaim ends the chain.
    pub fn schedule_reclaim(self: &Arc<Self>, claim: &Claim) {
        let first = self.reclaim_delay(claim);
        tracing::debug!(task_id = %self.task_id, run_id = self.run_id, delay_ms = first.as_millis() as u64, "next reclaim");

        let task = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::time::sleep(delay).await;
                let Some(task) = task.upgrade() else { return };
                if task.state().is_terminal() {
                    return;
                }
                match task.reclaim_task().await {
                    Ok(claim) => {
                        delay = task.reclaim_delay(&claim);
                        tracing::debug!(task_id = %task.task_id, delay_ms = delay.as_millis() as u64, "next reclaim");
                    }
                    Err(e) => {
                        tracing::error!(
                            task_id = %task.task_id,
                            run_id = task.run_id,
                            error = %e,
                            "reclaim failed, lease will not be renewed"
                        );
                        return;
                    }
                }
            }
        });
        replace_timer(&self.reclaim_timer, handle);
    }

    pub fn set_runtime_timeout(self: &Arc<Self>, max_run_time: u64) {
        let task = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(max_run_time)).await;
            if let Some(task) = task.upgrade() {
                tracing::warn!(task_id = %task.task_id, run_id = task.run_id, max_run_time, "task max runtime timeout");
                task.abort(
                    &format!("Task timeout after {max_run_time} seconds. Force killing container."),
                    None,
                )
                .await;
            }
        });
        replace_timer(&self.runtime_timer, handle);
    }

    fn clear_runtime_timeout(&self) {
        clear_timer(&self.runtime_timer);
    }

    fn clear_timers(&self) {
        clear_timer(&self.reclaim_timer);
        clear_timer(&self.runtime_timer);
    }

    /// Give the container and cache keys to the GC. Caches checked out for a
    /// container that was never created are released directly.
    fn hand_off_resources(&self) {
        let (container_id, caches) = {
            let mut inner = self.lock();
            (
                inner.container_id.clone(),
                std::mem::take(&mut inner.volume_caches),
            )
        };
        match container_id {
            Some(id) => self.runtime.gc.remove_container(&id, caches),
            None => {
                for key in caches {
                    if let Err(e) = self.runtime.volume_cache.release(&key) {
                        tracing::error!(alert = true, task_id = %self.task_id, key = %key, error = %e, "failed to release cache");
                    }
                }
            }
        }
    }

    async fn docker_config(
        &self,
        payload: &Payload,
        link: &LinkInfo,
    ) -> Result<ContainerSpec, TaskError> {
        // Task env wins over feature env.
        let mut env: BTreeMap<String, String> = link.env.clone();
        env.extend(payload.env.clone());
        env.extend(
            self.runtime
                .decryptor
                .decrypt_env(&self.task_id, &payload.encrypted_env)
                .await?,
        );
        env.insert("TASK_ID".to_string(), self.task_id.clone());
        env.insert("RUN_ID".to_string(), self.run_id.to_string());

        let privileged = self.run_as_privileged(payload)?;
        let devices = self.device_bindings(payload)?;

        let mut binds: Vec<String> = link.binds.iter().map(Bind::to_docker).collect();
        binds.extend(self.volume_bindings(payload)?);

        Ok(ContainerSpec {
            name: None,
            image: payload.image.name().to_string(),
            cmd: payload.command.clone(),
            env: env_to_docker(&env),
            tty: true,
            privileged,
            binds,
            links: link
                .links
                .iter()
                .map(|l| format!("{}:{}", l.name, l.alias))
                .collect(),
            devices,
            cpuset: self.cpuset.map(|cpu| cpu.to_string()),
        })
    }

    fn run_as_privileged(&self, payload: &Payload) -> Result<bool, TaskError> {
        if !payload.capabilities.privileged {
            return Ok(false);
        }
        if !scope_match(&self.definition.scopes, &[PRIVILEGED_SCOPE.to_string()]) {
            return Err(TaskError::InsufficientScopes(format!(
                "Insufficient scopes to run task in privileged mode. Try adding \
                 {PRIVILEGED_SCOPE} to the .scopes array"
            )));
        }
        if !self.runtime.config.allow_privileged {
            return Err(TaskError::Configuration(
                "Cannot run task using docker privileged mode. Worker must be enabled to \
                 allow running of privileged tasks."
                    .to_string(),
            ));
        }
        Ok(true)
    }

    fn device_bindings(&self, payload: &Payload) -> Result<Vec<DeviceBinding>, TaskError> {
        let requested: Vec<&String> = payload
            .capabilities
            .devices
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(device, _)| device)
            .collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let needed: Vec<String> = requested.iter().map(|d| device_scope(d)).collect();
        let missing = missing_scopes(&self.definition.scopes, &needed);
        if !missing.is_empty() {
            return Err(TaskError::InsufficientScopes(format!(
                "Insufficient scopes to attach devices to task container. Try adding {} to \
                 the .scopes array.",
                missing.join(", ")
            )));
        }

        let mut bindings = Vec::new();
        for device in requested {
            let paths = self.runtime.config.devices.get(device).ok_or_else(|| {
                TaskError::Configuration(format!("Device {device:?} is not available on this worker"))
            })?;
            bindings.extend(paths.iter().map(|path| DeviceBinding {
                path_on_host: path.clone(),
                path_in_container: path.clone(),
                cgroup_permissions: "rwm".to_string(),
            }));
        }
        Ok(bindings)
    }

    /// Check every cache scope first so nothing is checked out for a task
    /// that may not use all of its caches.
    fn volume_bindings(&self, payload: &Payload) -> Result<Vec<String>, TaskError> {
        if payload.cache.is_empty() {
            return Ok(Vec::new());
        }
        let needed: Vec<String> = payload.cache.keys().map(|name| cache_scope(name)).collect();
        let missing = missing_scopes(&self.definition.scopes, &needed);
        if !missing.is_empty() {
            let names: Vec<&str> = payload.cache.keys().map(String::as_str).collect();
            return Err(TaskError::InsufficientScopes(format!(
                "Insufficient scopes to attach \"{}\" as a cached volume. Try adding {} to \
                 the .scopes array.",
                names.join(", "),
                missing.join(", ")
            )));
        }

        let mut binds = Vec::new();
        for (name, mount_point) in &payload.cache {
            let handle = self.runtime.volume_cache.get(name)?;
            self.lock().volume_caches.push(handle.key.clone());
            binds.push(format!("{}:{}", handle.path.display(), mount_point));
        }
        Ok(binds)
    }

    fn log_header(&self) -> String {
        let mut header = fmt_log(&format!(
            "taskId: {}, workerId: {}",
            self.task_id,
            self.runtime.worker_id()
        ));
        if let Some(caches) = self.raw_payload().get("cache").and_then(|c| c.as_object()) {
            for (name, path) in caches {
                let path = path.as_str().unwrap_or_default();
                header.push_str(&fmt_log(&format!("using cache \"{name}\" -> {path}")));
            }
        }
        header.push_str("\r\n");
        header
    }

    fn log_footer(&self, success: bool, exit_code: i64) -> String {
        let elapsed = self
            .lock()
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let human = if success { "Successful" } else { "Unsuccessful" };
        fmt_log(&format!(
            "{human} task run with exit code: {exit_code} completed in {} seconds",
            elapsed.as_secs()
        ))
    }
}

fn log_schema_errors(errors: &[SchemaError]) -> String {
    let dump = serde_json::to_string_pretty(errors).unwrap_or_default();
    fmt_log(&format!(
        "`task.payload` format is invalid json schema errors:\n {dump}"
    ))
}

fn replace_timer(slot: &Mutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    let previous = slot
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .replace(handle);
    if let Some(previous) = previous {
        previous.abort();
    }
}

fn clear_timer(slot: &Mutex<Option<JoinHandle<()>>>) {
    let handle = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(handle) = handle {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::lib::config::WorkerConfig;
    use crate::lib::features::FeatureRegistry;
    use crate::lib::testing::{
        Behavior, FakeDocker, Report, claim, definition, tar_with_dir, tar_with_file,
    };
    use crate::lib::worker::runtime::test_support::{Harness, PLENTY_OF_DISK, harness};

    const LEASE: Duration = Duration::from_secs(20 * 60);

    fn payload(extra: serde_json::Value) -> serde_json::Value {
        let mut base = json!({
            "image": "ubuntu:24.04",
            "command": ["/bin/bash", "-c", "echo hello"],
            "maxRunTime": 600
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        base
    }

    /// Task log with the 80 column wrapping undone.
    fn log_text(task: &TaskExecution) -> String {
        task.log().contents_lossy().replace("\r\n", "")
    }

    struct Setup {
        harness: Harness,
        task: Arc<TaskExecution>,
        _dir: tempfile::TempDir,
    }

    fn setup_with(
        config: WorkerConfig,
        docker: FakeDocker,
        features: FeatureRegistry,
        payload: serde_json::Value,
        scopes: &[&str],
        lease: Duration,
    ) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness(config, docker, features, dir.path(), PLENTY_OF_DISK);
        let task = TaskExecution::new(
            harness.runtime.clone(),
            definition(payload, scopes),
            claim("task-1", 0, lease),
            None,
        );
        Setup {
            harness,
            task,
            _dir: dir,
        }
    }

    fn setup(docker: FakeDocker, payload: serde_json::Value, scopes: &[&str]) -> Setup {
        setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::empty(),
            payload,
            scopes,
            LEASE,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_is_reported_completed() {
        let s = setup(FakeDocker::new(), payload(json!({})), &[]);
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
        assert_eq!(s.task.state(), TaskState::Completed);

        let log = log_text(&s.task);
        assert!(log.starts_with("[dockworker] taskId: task-1"));
        assert!(log.contains("hello\n"));
        assert!(log.contains("Successful task run with exit code: 0"));
        assert!(s.task.log().is_closed());

        let id = s.harness.docker.created()[0].clone();
        let container = s.harness.docker.container(&id).unwrap();
        assert!(container.spec.env.contains(&"TASK_ID=task-1".to_string()));
        assert!(container.spec.env.contains(&"RUN_ID=0".to_string()));
        assert_eq!(s.harness.runtime.gc.marked_containers(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_zero_exit_is_reported_failed() {
        let docker = FakeDocker::with_behavior(Behavior {
            exit_code: 3,
            ..Default::default()
        });
        let s = setup(docker, payload(json!({})), &[]);
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        assert!(
            log_text(&s.task).contains("Unsuccessful task run with exit code: 3")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn max_run_time_kills_the_container() {
        let docker = FakeDocker::with_behavior(Behavior {
            output: vec![
                (Duration::from_secs(1), b"before timeout\n".to_vec()),
                (Duration::from_secs(15), b"after timeout\n".to_vec()),
            ],
            run_for: Duration::from_secs(20),
            exit_code: 0,
            ..Default::default()
        });
        let s = setup(docker, payload(json!({ "maxRunTime": 10 })), &[]);
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        let log = log_text(&s.task);
        assert!(log.contains("Task timeout after 10 seconds"));
        assert!(log.contains("before timeout"));
        assert!(!log.contains("after timeout"));

        let id = s.harness.docker.created()[0].clone();
        assert!(s.harness.docker.container(&id).unwrap().killed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_cache_scope_fails_before_container_start() {
        let s = setup(
            FakeDocker::new(),
            payload(json!({ "cache": { "foo": "/cache" } })),
            &[],
        );
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        assert!(s.harness.docker.created().is_empty());
        assert!(!s.harness.runtime.volume_cache.root().join("foo").exists());
        let log = log_text(&s.task);
        assert!(log.contains("Insufficient scopes"));
        assert!(log.contains("cache-access:foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_mounted_and_released_after_removal() {
        let s = setup(
            FakeDocker::new(),
            payload(json!({ "cache": { "foo": "/cache" } })),
            &["cache-access:*"],
        );
        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);

        let id = s.harness.docker.created()[0].clone();
        let binds = s.harness.docker.container(&id).unwrap().spec.binds;
        assert_eq!(binds.len(), 1);
        assert!(binds[0].ends_with(":/cache"));
        assert_eq!(s.harness.runtime.volume_cache.instances("foo")[0].refs, 1);

        s.harness.runtime.gc.sweep().await;
        assert_eq!(s.harness.runtime.volume_cache.instances("foo")[0].refs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_reported_as_exception() {
        let s = setup(FakeDocker::new(), json!({ "command": ["true"], "maxRunTime": 5 }), &[]);
        s.task.start().await.unwrap();

        assert_eq!(
            s.harness.queue.reports_for("task-1"),
            vec![Report::Exception(ExceptionReason::MalformedPayload)]
        );
        assert!(log_text(&s.task).contains("format is invalid"));
        assert!(s.harness.docker.pulled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pull_failure_is_reported_failed() {
        let docker = FakeDocker::new();
        docker.fail_pull("ubuntu:24.04");
        let s = setup(docker, payload(json!({})), &[]);
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        let log = log_text(&s.task);
        assert!(log.contains("Pulling docker image \"ubuntu:24.04\" has failed"));
        assert!(log.contains("Unsuccessful task run with exit code: -1"));
    }

    #[tokio::test(start_paused = true)]
    async fn container_create_failure_is_reported_failed() {
        let docker = FakeDocker::new();
        docker.fail_create();
        let s = setup(docker, payload(json!({})), &[]);
        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_kills_container_without_report() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(60),
            ..Default::default()
        });
        let s = setup(docker, payload(json!({})), &[]);

        let task = s.task.clone();
        let run = tokio::spawn(async move { task.start().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        s.task.cancel("canceled").await;
        run.await.unwrap().unwrap();

        assert!(s.harness.queue.reports().is_empty());
        assert_eq!(s.task.state(), TaskState::Canceled);
        let id = s.harness.docker.created()[0].clone();
        assert!(s.harness.docker.container(&id).unwrap().killed);
        assert!(log_text(&s.task).contains("Task was canceled"));

        // A later abort does not resurrect the run.
        s.task.abort("too late", None).await;
        assert!(s.harness.queue.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_container_start_still_kills_it() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(3600),
            start_delay: Duration::from_secs(5),
            ..Default::default()
        });
        let s = setup(docker, payload(json!({})), &[]);
        let begin = Instant::now();

        let task = s.task.clone();
        let run = tokio::spawn(async move { task.start().await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(s.harness.docker.created().len(), 1);
        s.task.cancel("canceled").await;
        run.await.unwrap().unwrap();

        let id = s.harness.docker.created()[0].clone();
        let container = s.harness.docker.container(&id).unwrap();
        assert!(container.killed);
        assert!(!container.running);
        // Exited on the second kill, not after the kill grace ran out.
        assert!(begin.elapsed() < KILL_GRACE);
        assert!(s.harness.queue.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abort_reports_exception_once() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(60),
            ..Default::default()
        });
        let s = setup(docker, payload(json!({})), &[]);

        let task = s.task.clone();
        let run = tokio::spawn(async move { task.start().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        s.task
            .abort("worker-shutdown", Some(ExceptionReason::WorkerShutdown))
            .await;
        s.task.abort("again", None).await;
        run.await.unwrap().unwrap();

        assert_eq!(
            s.harness.queue.reports_for("task-1"),
            vec![Report::Exception(ExceptionReason::WorkerShutdown)]
        );
        assert!(
            log_text(&s.task).contains("Task has been aborted prematurely. Reason: worker-shutdown")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_fires_at_lease_over_divisor() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(250),
            ..Default::default()
        });
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::empty(),
            payload(json!({ "maxRunTime": 1000 })),
            &[],
            Duration::from_secs(130),
        );
        let begin = Instant::now();

        let task = s.task.clone();
        let run = tokio::spawn(async move { task.start().await });

        tokio::time::sleep(Duration::from_secs(99)).await;
        assert!(s.harness.queue.reclaims().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let reclaims = s.harness.queue.reclaims();
        assert_eq!(reclaims.len(), 1);
        let fired_after = reclaims[0].2 - begin;
        assert!(fired_after > Duration::from_secs(99) && fired_after <= Duration::from_secs(100));

        run.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        // The renewed lease would fire after ~923s; the timer died with the run.
        assert_eq!(s.harness.queue.reclaims().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_schedules_the_next_reclaim() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(1100),
            ..Default::default()
        });
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::empty(),
            payload(json!({ "maxRunTime": 2000 })),
            &[],
            Duration::from_secs(130),
        );
        let begin = Instant::now();

        let task = s.task.clone();
        let run = tokio::spawn(async move { task.start().await });

        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(s.harness.queue.reclaims().len(), 1);

        // The fake queue renews for 20 minutes: 1200s / 1.3 after the first.
        tokio::time::sleep(Duration::from_secs(920)).await;
        assert_eq!(s.harness.queue.reclaims().len(), 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let reclaims = s.harness.queue.reclaims();
        assert_eq!(reclaims.len(), 2);
        let gap = reclaims[1].2 - reclaims[0].2;
        assert!(gap > Duration::from_secs(922) && gap <= Duration::from_secs(924));
        assert!(reclaims[1].2 - begin <= Duration::from_secs(1024));

        {
            let timer = s.task.reclaim_timer.lock().unwrap();
            assert!(timer.as_ref().is_some_and(|handle| !handle.is_finished()));
        }

        run.await.unwrap().unwrap();
        assert!(s.task.reclaim_timer.lock().unwrap().is_none());
        assert_eq!(s.harness.queue.reclaims().len(), 2);
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reclaim_is_not_renewed() {
        let docker = FakeDocker::with_behavior(Behavior {
            run_for: Duration::from_secs(120),
            ..Default::default()
        });
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::empty(),
            payload(json!({})),
            &[],
            Duration::from_secs(13),
        );
        s.harness.queue.fail_reclaims();

        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reclaims().len(), 1);
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn privileged_needs_scope_and_worker_opt_in() {
        let s = setup(
            FakeDocker::new(),
            payload(json!({ "capabilities": { "privileged": true } })),
            &[],
        );
        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        assert!(s.harness.docker.created().is_empty());

        let s = setup(
            FakeDocker::new(),
            payload(json!({ "capabilities": { "privileged": true } })),
            &["capability:privileged"],
        );
        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        assert!(log_text(&s.task).contains("Worker must be enabled"));

        let config = WorkerConfig {
            allow_privileged: true,
            ..Default::default()
        };
        let s = setup_with(
            config,
            FakeDocker::new(),
            FeatureRegistry::empty(),
            payload(json!({ "capabilities": { "privileged": true } })),
            &["capability:privileged"],
            LEASE,
        );
        s.task.start().await.unwrap();
        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
        let id = s.harness.docker.created()[0].clone();
        assert!(s.harness.docker.container(&id).unwrap().spec.privileged);
    }

    #[tokio::test(start_paused = true)]
    async fn devices_are_bound_when_scoped_and_configured() {
        let mut config = WorkerConfig::default();
        config
            .devices
            .insert("kvm".to_string(), vec!["/dev/kvm".to_string()]);
        let s = setup_with(
            config,
            FakeDocker::new(),
            FeatureRegistry::empty(),
            payload(json!({ "capabilities": { "devices": { "kvm": true } } })),
            &["capability:device:kvm"],
            LEASE,
        );
        s.task.start().await.unwrap();

        let id = s.harness.docker.created()[0].clone();
        let devices = s.harness.docker.container(&id).unwrap().spec.devices;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path_on_host, "/dev/kvm");
    }

    struct FailingLink;

    #[async_trait]
    impl Feature for FailingLink {
        fn name(&self) -> &'static str {
            "failingLink"
        }

        async fn link(&self, _task: &TaskExecution) -> Result<LinkInfo, FeatureError> {
            Err(FeatureError::Failed {
                feature: "failingLink",
                reason: "boom".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn feature_setup_failure_aborts_the_run() {
        let s = setup_with(
            WorkerConfig::default(),
            FakeDocker::new(),
            FeatureRegistry::empty().with("failingLink", true, || Box::new(FailingLink)),
            payload(json!({})),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        assert!(s.harness.docker.created().is_empty());
        assert!(
            log_text(&s.task).contains("states could not be created successfully")
        );
    }

    struct FailingStop;

    #[async_trait]
    impl Feature for FailingStop {
        fn name(&self) -> &'static str {
            "failingStop"
        }

        async fn stopped(&self, _task: &TaskExecution) -> Result<(), FeatureError> {
            Err(FeatureError::Failed {
                feature: "failingStop",
                reason: "upload rejected".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_hook_failure_fails_the_run() {
        let s = setup_with(
            WorkerConfig::default(),
            FakeDocker::new(),
            FeatureRegistry::empty().with("failingStop", true, || Box::new(FailingStop)),
            payload(json!({})),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Failed]);
        let log = log_text(&s.task);
        assert!(log.contains("Incident ID: "));
        assert!(log.contains("exit code: -1"));
    }

    struct EnvFeature;

    #[async_trait]
    impl Feature for EnvFeature {
        fn name(&self) -> &'static str {
            "env"
        }

        async fn link(&self, _task: &TaskExecution) -> Result<LinkInfo, FeatureError> {
            let mut info = LinkInfo::default();
            info.env.insert("FOO".to_string(), "feature".to_string());
            info.env.insert("BAR".to_string(), "feature".to_string());
            info.env.insert("TASK_ID".to_string(), "spoofed".to_string());
            Ok(info)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_env_overrides_feature_env() {
        let s = setup_with(
            WorkerConfig::default(),
            FakeDocker::new(),
            FeatureRegistry::empty().with("env", true, || Box::new(EnvFeature)),
            payload(json!({ "env": { "FOO": "task", "TASK_ID": "also-spoofed" } })),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        let id = s.harness.docker.created()[0].clone();
        let env = s.harness.docker.container(&id).unwrap().spec.env;
        assert!(env.contains(&"FOO=task".to_string()));
        assert!(env.contains(&"BAR=feature".to_string()));
        assert!(env.contains(&"TASK_ID=task-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn artifacts_are_uploaded_or_marked_missing() {
        let docker = FakeDocker::new();
        docker.add_archive("/out/result.txt", tar_with_file("result.txt", b"42"));
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::standard(),
            payload(json!({
                "features": { "bulkLog": false },
                "artifacts": {
                    "public/result.txt": { "type": "file", "path": "/out/result.txt" },
                    "public/missing": { "type": "directory", "path": "/nope" }
                }
            })),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
        let uploads = s.harness.queue.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].put_url, "http://storage.test/public/result.txt");
        assert_eq!(uploads[0].body, b"42");
        assert_eq!(uploads[0].content_type, "text/plain");

        let missing = s
            .harness
            .queue
            .artifacts()
            .into_iter()
            .find(|(name, _)| name == "public/missing")
            .unwrap();
        assert_eq!(missing.1.reason.as_deref(), Some("file-missing-on-worker"));
    }

    #[tokio::test(start_paused = true)]
    async fn large_artifacts_are_uploaded_from_disk() {
        let big: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let docker = FakeDocker::new();
        docker.add_archive("/out", tar_with_dir("out", &[("big.bin", big.as_slice()), ("small.txt", &b"ok"[..])]));
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::standard(),
            payload(json!({
                "features": { "bulkLog": false },
                "artifacts": { "public/out": { "type": "directory", "path": "/out" } }
            })),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        assert_eq!(s.harness.queue.reports_for("task-1"), vec![Report::Completed]);
        let uploads = s.harness.queue.uploads();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.iter().all(|u| u.streamed));
        assert_eq!(uploads[0].put_url, "http://storage.test/public/out/big.bin");
        assert_eq!(uploads[0].body.len(), big.len());
        assert!(uploads[0].body == big);
        assert_eq!(uploads[1].body, b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_artifact_type_is_an_error_artifact() {
        let docker = FakeDocker::new();
        docker.add_archive("/out", tar_with_file("out", b"not a dir"));
        let s = setup_with(
            WorkerConfig::default(),
            docker,
            FeatureRegistry::standard(),
            payload(json!({
                "features": { "bulkLog": false },
                "artifacts": { "public/out": { "type": "directory", "path": "/out" } }
            })),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        let artifacts = s.harness.queue.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].1.reason.as_deref(), Some("invalid-resource-on-worker"));
        assert!(s.harness.queue.uploads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_log_is_uploaded_gzipped() {
        let s = setup_with(
            WorkerConfig::default(),
            FakeDocker::new(),
            FeatureRegistry::standard(),
            payload(json!({})),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        let uploads = s.harness.queue.uploads();
        let log = uploads
            .iter()
            .find(|u| u.put_url.ends_with("public/logs/live_backing.log"))
            .unwrap();
        assert_eq!(log.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(log.content_type, "text/plain");
    }

    #[tokio::test(start_paused = true)]
    async fn services_are_linked_and_collected() {
        let s = setup_with(
            WorkerConfig::default(),
            FakeDocker::new(),
            FeatureRegistry::standard(),
            payload(json!({
                "features": { "bulkLog": false },
                "services": [{ "image": "postgres:16", "alias": "db" }]
            })),
            &[],
            LEASE,
        );
        s.task.start().await.unwrap();

        let created = s.harness.docker.created();
        assert_eq!(created.len(), 2);
        let task_container = s.harness.docker.container(&created[1]).unwrap();
        assert_eq!(task_container.spec.links, vec![format!("{}:db", created[0])]);

        let mut marked = s.harness.runtime.gc.marked_containers();
        marked.sort();
        assert_eq!(marked, created);
    }
}
