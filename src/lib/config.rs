use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::lib::error::ConfigError;

/// Identity under which this worker claims work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerIdentity {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,
}

impl Default for WorkerIdentity {
    fn default() -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        Self {
            provisioner_id: "local".to_string(),
            worker_type: "dockworker".to_string(),
            worker_group: "default".to_string(),
            worker_id: hostname,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    pub root_url: String,
    /// Sent as a bearer token; usually supplied through the environment.
    pub access_token: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root_url: "http://localhost:8080/queue/v1".to_string(),
            access_token: None,
            poll_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskConfig {
    /// Reclaim fires after `(takenUntil - now) / reclaimDivisor`.
    pub reclaim_divisor: f64,
    /// Upper bound accepted for `payload.maxRunTime`, in seconds.
    pub max_run_time_ceiling: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            reclaim_divisor: 1.3,
            max_run_time_ceiling: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapacityConfig {
    /// Free bytes required on the docker volume for every additional task.
    pub diskspace_threshold: u64,
    /// Mount point probed for free space.
    pub docker_volume: PathBuf,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            diskspace_threshold: 10 * 1024 * 1024 * 1024,
            docker_volume: PathBuf::from("/"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GcConfig {
    pub interval_ms: u64,
    /// Images unused for this long are removed on sweep.
    pub image_expiration_ms: u64,
    /// Removal attempts before a stuck container is reported to operators.
    pub max_removal_attempts: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            image_expiration_ms: 2 * 60 * 60 * 1000,
            max_removal_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub bulk_log_expires_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            bulk_log_expires_ms: 365 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShutdownConfig {
    /// Polled for host termination notices; a 200 response means terminate.
    pub termination_url: Option<String>,
    pub termination_poll_ms: u64,
    /// How long to wait for running tasks to drain before exiting.
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            termination_url: None,
            termination_poll_ms: 5_000,
            grace_ms: 110_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(flatten)]
    pub identity: WorkerIdentity,
    pub capacity: usize,
    /// Pin each task to its own core; capacity becomes the core count.
    pub restrict_cpu: bool,
    pub isolated_containers: bool,
    /// Cores on the host. Filled in by `finalize`, never read from the file.
    #[serde(skip)]
    pub cpu_count: usize,
    pub allow_privileged: bool,
    /// Device type -> host paths bound into the container when requested.
    pub devices: HashMap<String, Vec<String>>,
    /// Registry prefix -> credentials, matched by longest prefix.
    pub registries: HashMap<String, RegistryCredentials>,
    pub cache_dir: PathBuf,
    pub api_addr: String,
    pub queue: QueueConfig,
    pub task: TaskConfig,
    pub capacity_management: CapacityConfig,
    pub garbage_collection: GcConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: WorkerIdentity::default(),
            capacity: 1,
            restrict_cpu: false,
            isolated_containers: false,
            cpu_count: 1,
            allow_privileged: false,
            devices: HashMap::new(),
            registries: HashMap::new(),
            cache_dir: PathBuf::from("/var/cache/dockworker"),
            api_addr: "127.0.0.1:60023".to_string(),
            queue: QueueConfig::default(),
            task: TaskConfig::default(),
            capacity_management: CapacityConfig::default(),
            garbage_collection: GcConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_json::from_str(raw)?;
        Ok(config)
    }

    /// Apply settings derived from the host, then check invariants.
    pub fn finalize(mut self, cpu_count: usize) -> Result<Self, ConfigError> {
        self.cpu_count = cpu_count;
        // Capacity 0 means the host asked us not to take work; keep it that way.
        if self.restrict_cpu && self.capacity > 0 {
            self.capacity = cpu_count;
            self.isolated_containers = true;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.isolated_containers && self.capacity > self.cpu_count {
            return Err(ConfigError::InvalidValue {
                key: "capacity".to_string(),
                message: format!(
                    "isolated containers need a core per task, but capacity {} exceeds {} cores",
                    self.capacity, self.cpu_count
                ),
            });
        }
        if !(self.task.reclaim_divisor > 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "task.reclaimDivisor".to_string(),
                message: format!("must be greater than 1, got {}", self.task.reclaim_divisor),
            });
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue.pollIntervalMs".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.garbage_collection.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "garbageCollection.intervalMs".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.garbage_collection.interval_ms)
    }

    /// Credentials for the registry whose prefix best matches `image`.
    pub fn registry_for(&self, image: &str) -> Option<(&str, &RegistryCredentials)> {
        self.registries
            .iter()
            .filter(|(prefix, _)| image.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, creds)| (prefix.as_str(), creds))
    }
}
