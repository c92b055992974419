use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Queue returned {status} for {endpoint}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Invalid queue response: {0}")]
    InvalidResponse(String),

    #[error("Could not read upload body: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker client error: {0}")]
    ClientError(String),

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
}

impl DockerError {
    /// True when the engine reported the object as already gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            DockerError::NotFound(_) => true,
            DockerError::Api(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache key {0} is not known to the volume cache")]
    UnknownKey(String),

    #[error("Cache key {0} released more times than it was acquired")]
    OverRelease(String),

    #[error("Invalid cache name: {0:?}")]
    InvalidName(String),

    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("Feature {feature} failed: {reason}")]
    Failed {
        feature: &'static str,
        reason: String,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced while preparing or running a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    InsufficientScopes(String),

    #[error("{0}")]
    Configuration(String),

    #[error("Failed to decrypt environment: {0}")]
    Decrypt(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No free cpu slot available (capacity {capacity})")]
    NoFreeCpu { capacity: usize },

    #[error("Cpu slot {0} released while not active")]
    CpuNotActive(usize),

    #[error("Unknown cpu slot {0}")]
    UnknownCpu(usize),

    #[error("Disk probe failed: {0}")]
    DiskProbe(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
