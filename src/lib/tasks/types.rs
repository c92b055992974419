use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    StatesFailed,
    Aborted,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted | TaskState::Canceled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::StatesFailed => "states_failed",
            TaskState::Aborted => "aborted",
            TaskState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// `image` may be a plain reference or a typed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSpec {
    Name(String),
    Typed {
        #[serde(rename = "type")]
        kind: String,
        name: String,
    },
}

impl ImageSpec {
    pub fn name(&self) -> &str {
        match self {
            ImageSpec::Name(name) => name,
            ImageSpec::Typed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    File,
    Directory,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Directory => "directory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactSpec {
    #[serde(rename = "type")]
    pub kind: ArtifactKind,
    pub path: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Capabilities {
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub devices: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub alias: String,
}

/// The validated `task.payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Payload {
    pub image: ImageSpec,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds.
    pub max_run_time: u64,
    /// Cache name -> mount point inside the container.
    #[serde(default)]
    pub cache: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactSpec>,
    #[serde(default)]
    pub features: HashMap<String, bool>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub encrypted_env: Vec<String>,
}

/// A bind mount contributed by a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Bind {
    pub fn to_docker(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// A container linked into the task container as `name:alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

/// Everything needed to create a container, independent of the engine client.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub privileged: bool,
    pub binds: Vec<String>,
    pub links: Vec<String>,
    pub devices: Vec<DeviceBinding>,
    pub cpuset: Option<String>,
}

/// Flatten an env map into docker's `KEY=value` list.
pub fn env_to_docker(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(key, value)| format!("{key}={value}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_spec_accepts_both_forms() {
        let plain: ImageSpec = serde_json::from_str(r#""ubuntu:24.04""#).unwrap();
        assert_eq!(plain.name(), "ubuntu:24.04");

        let typed: ImageSpec =
            serde_json::from_str(r#"{"type": "docker-image", "name": "alpine:3"}"#).unwrap();
        assert_eq!(typed.name(), "alpine:3");
    }

    #[test]
    fn bind_formats_read_only() {
        let bind = Bind {
            source: "/host".to_string(),
            target: "/container".to_string(),
            read_only: true,
        };
        assert_eq!(bind.to_docker(), "/host:/container:ro");
    }

    #[test]
    fn env_is_sorted_key_value_pairs() {
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(env_to_docker(&env), vec!["A=1", "B=2"]);
    }
}
