use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::cpu::CpuPool;
use super::runtime::Runtime;
use super::stats::exceeds_disk_threshold;
use crate::lib::error::WorkerError;
use crate::lib::queue::types::{Claim, ExceptionReason, PurgeCacheMessage, TaskExceptionMessage};
use crate::lib::tasks::execution::TaskExecution;
use crate::lib::tasks::types::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The first task started while idle.
    Working,
    /// The last running task finished.
    Idle,
}

/// API view of one running slot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTask {
    pub task_id: String,
    pub run_id: u32,
    pub state: TaskState,
    pub cpu: Option<usize>,
    pub container_id: Option<String>,
    pub taken_until: DateTime<Utc>,
}

struct RunningTaskSlot {
    handler: Arc<TaskExecution>,
    cpu: Option<usize>,
}

type SlotKey = (String, u32);

pub struct TaskListener {
    runtime: Arc<Runtime>,
    capacity: usize,
    cpus: Option<CpuPool>,
    running: Mutex<HashMap<SlotKey, RunningTaskSlot>>,
    pending: AtomicUsize,
    paused: AtomicBool,
    shutting_down: AtomicBool,
    closed: CancellationToken,
    events: broadcast::Sender<WorkerEvent>,
}

/// Counts one claimed task from hand-off until its run is over.
struct PendingGuard {
    listener: Arc<TaskListener>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.listener.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.listener.events.send(WorkerEvent::Idle);
        }
    }
}

impl TaskListener {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        let capacity = runtime.config.capacity;
        let cpus = runtime
            .config
            .isolated_containers
            .then(|| CpuPool::new(runtime.config.cpu_count));
        if let Some(pool) = &cpus {
            tracing::info!(cores = pool.cores(), capacity, "pinning each task to one core");
        }
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            runtime,
            capacity,
            cpus,
            running: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            closed: CancellationToken::new(),
            events,
        })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, RunningTaskSlot>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stop claiming. Running tasks are left alone.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("task listener paused");
        }
    }

    pub fn resume(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!("not resuming a worker that is shutting down");
            return;
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("task listener resumed");
        }
    }

    /// Stop polling for good.
    pub fn close(&self) {
        self.pause();
        self.closed.cancel();
    }

    pub fn running_tasks(&self) -> Vec<RunningTask> {
        let slots = self.slots();
        let mut tasks: Vec<RunningTask> = slots
            .iter()
            .map(|((task_id, run_id), slot)| RunningTask {
                task_id: task_id.clone(),
                run_id: *run_id,
                state: slot.handler.state(),
                cpu: slot.cpu,
                container_id: slot.handler.container_id(),
                taken_until: slot.handler.claim().taken_until,
            })
            .collect();
        tasks.sort_by(|a, b| (&a.task_id, a.run_id).cmp(&(&b.task_id, b.run_id)));
        tasks
    }

    /// Claim as many tasks as there is room for and start them. Returns the
    /// number of claims received.
    pub async fn get_tasks(self: &Arc<Self>) -> Result<usize, WorkerError> {
        if self.is_paused() {
            return Ok(0);
        }
        let available = self.capacity.saturating_sub(self.pending());
        if available == 0 {
            tracing::debug!(capacity = self.capacity, "worker at capacity");
            return Ok(0);
        }

        let threshold = self.runtime.config.capacity_management.diskspace_threshold;
        match exceeds_disk_threshold(self.runtime.disk.as_ref(), threshold, available) {
            Ok(false) => {}
            Ok(true) => return Ok(0),
            Err(e) => {
                tracing::warn!(error = %e, "could not check free disk space, skipping poll");
                return Ok(0);
            }
        }

        let claims = self.runtime.queue.claim_work(available).await?;
        let count = claims.len();
        if count > 0 {
            tracing::info!(claimed = count, available, "claimed tasks");
        }
        for claim in claims {
            self.run_task(claim);
        }
        Ok(count)
    }

    pub fn schedule_task_poll(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let listener = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = listener.closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = listener.get_tasks().await {
                    tracing::warn!(error = %e, "task poll failed");
                }
            }
            tracing::debug!("task poll stopped");
        })
    }

    /// Run one claim to completion in the background. The task counts
    /// against capacity from this call until its run is over.
    pub fn run_task(self: &Arc<Self>, claim: Claim) -> JoinHandle<()> {
        if self.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.events.send(WorkerEvent::Working);
        }
        let pending = PendingGuard {
            listener: self.clone(),
        };
        let listener = self.clone();
        tokio::spawn(async move {
            let key: SlotKey = (claim.task_id().to_string(), claim.run_id);
            let result = listener.execute_claim(&key, claim).await;
            listener.cleanup_running_state(&key);
            drop(pending);
            if let Err(e) = result {
                tracing::error!(task_id = %key.0, run_id = key.1, error = %e, "task run failed");
            }
        })
    }

    async fn execute_claim(&self, key: &SlotKey, claim: Claim) -> Result<(), WorkerError> {
        let definition = self.runtime.queue.task(claim.task_id()).await?;
        let cpu = match &self.cpus {
            Some(pool) => Some(pool.acquire()?),
            None => None,
        };
        let handler = TaskExecution::new(self.runtime.clone(), definition, claim, cpu);
        self.slots().insert(
            key.clone(),
            RunningTaskSlot {
                handler: handler.clone(),
                cpu,
            },
        );

        if self.shutting_down.load(Ordering::SeqCst) {
            handler
                .abort("worker-shutdown", Some(ExceptionReason::WorkerShutdown))
                .await;
        }
        handler.start().await?;
        Ok(())
    }

    /// Drop the slot and give back its CPU. Safe to call more than once.
    fn cleanup_running_state(&self, key: &SlotKey) {
        let slot = self.slots().remove(key);
        let Some(slot) = slot else { return };
        if let (Some(cpu), Some(pool)) = (slot.cpu, &self.cpus) {
            if let Err(e) = pool.release(cpu) {
                tracing::error!(alert = true, task_id = %key.0, cpu, error = %e, "failed to release cpu slot");
            }
        }
    }

    /// Cancellation feed: stop a run the queue resolved as canceled.
    pub async fn cancel_task(&self, message: &TaskExceptionMessage) {
        if self.is_paused() {
            tracing::info!(task_id = %message.status.task_id, "listener paused, dropping task-exception message");
            return;
        }
        let key: SlotKey = (message.status.task_id.clone(), message.run_id);
        let handler = self.slots().get(&key).map(|slot| slot.handler.clone());
        let Some(handler) = handler else {
            tracing::debug!(task_id = %key.0, run_id = key.1, "task-exception for a run not held here");
            return;
        };

        let reason = message.reason_resolved();
        if reason != Some("canceled") {
            tracing::info!(task_id = %key.0, run_id = key.1, reason = ?reason, "ignoring task-exception message");
            return;
        }
        handler.cancel("canceled").await;
        self.cleanup_running_state(&key);
    }

    /// Purge feed: invalidate every instance of a cache.
    pub fn purge_cache(&self, message: &PurgeCacheMessage) {
        if self.is_paused() {
            tracing::info!(cache = %message.cache_name, "listener paused, dropping purge-cache message");
            return;
        }
        let removed = self.runtime.volume_cache.purge(&message.cache_name);
        tracing::debug!(cache = %message.cache_name, removed, "purge-cache message handled");
    }

    /// The host is going away: stop claiming and abort everything running.
    pub async fn handle_termination(&self) {
        tracing::warn!(running = self.pending(), "host termination, aborting running tasks");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.pause();

        let running: Vec<(SlotKey, Arc<TaskExecution>)> = self
            .slots()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.handler.clone()))
            .collect();
        for (key, handler) in running {
            handler
                .abort("worker-shutdown", Some(ExceptionReason::WorkerShutdown))
                .await;
            self.cleanup_running_state(&key);
        }
    }
}
