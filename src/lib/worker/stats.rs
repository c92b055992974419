use std::path::PathBuf;

use serde::{Serialize, ser::SerializeStruct};
use sysinfo::{Disks, System};

use crate::lib::error::WorkerError;

#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub cpu_usage: f32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: u64,
    pub disk_usage: f32,
    pub disk_available: u64,
    pub running_tasks: u64,
}

impl Serialize for SystemStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("SystemStats", 11)?;
        state.serialize_field("cpu_usage", &format!("{:.2}%", self.cpu_usage))?;
        state.serialize_field("total_memory", &format!("{} MB", self.total_memory))?;
        state.serialize_field("used_memory", &format!("{} MB", self.used_memory))?;
        state.serialize_field("total_swap", &format!("{} MB", self.total_swap))?;
        state.serialize_field("used_swap", &format!("{} MB", self.used_swap))?;
        state.serialize_field("system_name", &self.system_name)?;
        state.serialize_field("hostname", &self.hostname)?;
        state.serialize_field("total_cpus", &self.total_cpus)?;
        state.serialize_field("disk_usage", &format!("{:.2}%", self.disk_usage))?;
        state.serialize_field("disk_available", &format!("{} MB", self.disk_available / 1024 / 1024))?;
        state.serialize_field("running_tasks", &self.running_tasks)?;
        state.end()
    }
}

pub fn get_stats(sysinfo: &System, running_tasks: u64) -> SystemStats {
    let disks = Disks::new_with_refreshed_list();
    let used_space: f32 = disks
        .iter()
        .map(|disk| disk.total_space() as f32 - disk.available_space() as f32)
        .sum();
    let total_space: f32 = disks.iter().map(|disk| disk.total_space() as f32).sum();

    SystemStats {
        cpu_usage: (sysinfo.global_cpu_usage() * 100.0).round() / 100.0,
        total_memory: sysinfo.total_memory() / 1024 / 1024,
        used_memory: sysinfo.used_memory() / 1024 / 1024,
        total_swap: sysinfo.total_swap() / 1024 / 1024,
        used_swap: sysinfo.used_swap() / 1024 / 1024,
        system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
        hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
        total_cpus: sysinfo.cpus().len() as u64,
        disk_usage: if total_space > 0.0 {
            (used_space / total_space) * 100.0
        } else {
            0.0
        },
        disk_available: disks.iter().map(|disk| disk.available_space()).sum(),
        running_tasks,
    }
}

/// Free space on the volume docker writes to.
pub trait DiskProbe: Send + Sync {
    fn available_bytes(&self) -> Result<u64, WorkerError>;
}

pub struct SysinfoDiskProbe {
    volume: PathBuf,
}

impl SysinfoDiskProbe {
    pub fn new(volume: impl Into<PathBuf>) -> Self {
        Self {
            volume: volume.into(),
        }
    }
}

impl DiskProbe for SysinfoDiskProbe {
    fn available_bytes(&self) -> Result<u64, WorkerError> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| self.volume.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                WorkerError::DiskProbe(format!("no disk mounted at {}", self.volume.display()))
            })
    }
}

/// True when taking `available_capacity` more tasks would leave less than
/// `threshold` bytes free per task.
pub fn exceeds_disk_threshold(
    probe: &dyn DiskProbe,
    threshold: u64,
    available_capacity: usize,
) -> Result<bool, WorkerError> {
    let available = probe.available_bytes()?;
    let required = threshold.saturating_mul(available_capacity as u64);
    if available < required {
        tracing::info!(available, required, "disk space threshold exceeded");
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
pub struct FixedDiskProbe(pub u64);

#[cfg(test)]
impl DiskProbe for FixedDiskProbe {
    fn available_bytes(&self) -> Result<u64, WorkerError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn threshold_scales_with_requested_capacity() {
        let probe = FixedDiskProbe(25 * GIB);
        assert!(!exceeds_disk_threshold(&probe, 10 * GIB, 2).unwrap());
        assert!(exceeds_disk_threshold(&probe, 10 * GIB, 3).unwrap());
    }

    #[test]
    fn stats_serialize_with_units() {
        let stats = SystemStats {
            cpu_usage: 12.5,
            total_memory: 2048,
            disk_available: 3 * 1024 * 1024,
            ..Default::default()
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["cpu_usage"], "12.50%");
        assert_eq!(value["total_memory"], "2048 MB");
        assert_eq!(value["disk_available"], "3 MB");
    }
}
