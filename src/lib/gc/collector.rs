use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::lib::config::GcConfig;
use crate::lib::error::DockerError;
use crate::lib::tasks::docker::ContainerRuntime;
use crate::lib::worker::stats::{DiskProbe, exceeds_disk_threshold};

/// Something that owns host resources tied to task containers.
pub trait GcManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per removed container with the cache keys it held.
    fn container_removed(&self, container_id: &str, cache_keys: &[String]);

    /// Drop whatever can be rebuilt. `disk_pressure` is set when the docker
    /// volume is below the free space threshold.
    fn clear(&self, disk_pressure: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcEvent {
    ContainerMarked { container_id: String },
    ContainerRemoved { container_id: String },
    RemovalFailed { container_id: String, attempts: u32, error: String },
    ImageRemoved { image: String },
    SweepCompleted { removed: usize, pending: usize },
}

#[derive(Debug, Default)]
struct MarkedContainer {
    cache_keys: Vec<String>,
    attempts: u32,
}

#[derive(Default)]
struct GcState {
    containers: HashMap<String, MarkedContainer>,
    images: HashMap<String, Instant>,
}

pub struct GarbageCollector {
    docker: Arc<dyn ContainerRuntime>,
    disk: Arc<dyn DiskProbe>,
    diskspace_threshold: u64,
    image_expiration: Duration,
    max_removal_attempts: u32,
    state: Mutex<GcState>,
    managers: Mutex<Vec<Arc<dyn GcManager>>>,
    sweeping: tokio::sync::Mutex<()>,
    events: broadcast::Sender<GcEvent>,
}

impl GarbageCollector {
    pub fn new(
        config: &GcConfig,
        docker: Arc<dyn ContainerRuntime>,
        disk: Arc<dyn DiskProbe>,
        diskspace_threshold: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            docker,
            disk,
            diskspace_threshold,
            image_expiration: Duration::from_millis(config.image_expiration_ms),
            max_removal_attempts: config.max_removal_attempts,
            state: Mutex::new(GcState::default()),
            managers: Mutex::new(Vec::new()),
            sweeping: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GcEvent> {
        self.events.subscribe()
    }

    pub fn add_manager(&self, manager: Arc<dyn GcManager>) {
        tracing::debug!(manager = manager.name(), "registered gc manager");
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(manager);
    }

    /// Queue a container for removal. Its cache keys are handed to the
    /// managers once docker confirms the container is gone.
    pub fn remove_container(&self, container_id: &str, cache_keys: Vec<String>) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .containers
                .entry(container_id.to_string())
                .or_default()
                .cache_keys
                .extend(cache_keys);
        }
        tracing::debug!(container_id, "container marked for removal");
        self.emit(GcEvent::ContainerMarked {
            container_id: container_id.to_string(),
        });
    }

    /// Record that `image` was just used by a task.
    pub fn mark_image(&self, image: &str) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .images
            .insert(image.to_string(), Instant::now());
    }

    pub fn marked_containers(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .keys()
            .cloned()
            .collect()
    }

    pub async fn sweep(&self) {
        let _guard = self.sweeping.lock().await;

        let marked: Vec<String> = self.marked_containers();
        let mut removed = 0;
        for container_id in marked {
            match self.remove(&container_id).await {
                Ok(()) => {
                    let record = self
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .containers
                        .remove(&container_id);
                    if let Some(record) = record {
                        self.notify_removed(&container_id, &record.cache_keys);
                        removed += 1;
                        tracing::info!(container_id = %container_id, "removed container");
                        self.emit(GcEvent::ContainerRemoved { container_id });
                    }
                }
                Err(e) => self.record_failure(&container_id, &e),
            }
        }

        self.sweep_images().await;

        match exceeds_disk_threshold(self.disk.as_ref(), self.diskspace_threshold, 1) {
            Ok(true) => {
                for manager in self.managers() {
                    manager.clear(true);
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "could not check disk space during sweep"),
        }

        let pending = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .len();
        tracing::debug!(removed, pending, "gc sweep finished");
        self.emit(GcEvent::SweepCompleted { removed, pending });
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let gc = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => gc.sweep().await,
                }
            }
            tracing::info!("garbage collector stopped");
        })
    }

    async fn remove(&self, container_id: &str) -> Result<(), DockerError> {
        match self.docker.inspect_container(container_id).await {
            Ok(status) if status.running => {
                if let Err(e) = self.docker.kill_container(container_id).await {
                    if !e.is_not_found() {
                        return Err(e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }

        match self.docker.remove_container(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn record_failure(&self, container_id: &str, error: &DockerError) {
        let attempts = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.containers.get_mut(container_id) {
                Some(record) => {
                    record.attempts += 1;
                    record.attempts
                }
                None => return,
            }
        };

        if attempts >= self.max_removal_attempts {
            tracing::error!(
                alert = true,
                container_id,
                attempts,
                error = %error,
                "container removal keeps failing"
            );
        } else {
            tracing::warn!(container_id, attempts, error = %error, "container removal failed, will retry");
        }
        self.emit(GcEvent::RemovalFailed {
            container_id: container_id.to_string(),
            attempts,
            error: error.to_string(),
        });
    }

    async fn sweep_images(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .images
            .iter()
            .filter(|(_, last_used)| now.duration_since(**last_used) >= self.image_expiration)
            .map(|(image, _)| image.clone())
            .collect();

        for image in expired {
            match self.docker.remove_image(&image).await {
                Ok(()) => {
                    self.forget_image(&image, now);
                    tracing::info!(image = %image, "removed expired image");
                    self.emit(GcEvent::ImageRemoved { image });
                }
                Err(e) if e.is_not_found() => self.forget_image(&image, now),
                // Usually still referenced by a container; retry next sweep.
                Err(e) => tracing::warn!(image = %image, error = %e, "could not remove image"),
            }
        }
    }

    /// Drop the record unless the image was marked again during removal.
    fn forget_image(&self, image: &str, swept_at: Instant) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.images.get(image).is_some_and(|used| *used < swept_at) {
            state.images.remove(image);
        }
    }

    fn notify_removed(&self, container_id: &str, cache_keys: &[String]) {
        for manager in self.managers() {
            manager.container_removed(container_id, cache_keys);
        }
    }

    fn managers(&self) -> Vec<Arc<dyn GcManager>> {
        self.managers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn emit(&self, event: GcEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
