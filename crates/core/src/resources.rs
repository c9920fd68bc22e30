use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Ram,
    Vram,
    Cpu,
    Disk,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Ram => write!(f, "RAM"),
            ResourceKind::Vram => write!(f, "VRAM"),
            ResourceKind::Cpu => write!(f, "CPU"),
            ResourceKind::Disk => write!(f, "disk"),
        }
    }
}

/// What a load (or any other allocation) needs from the host.
///
/// CPU headroom is expressed in whole percent of total CPU capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub ram_bytes: u64,
    pub vram_bytes: u64,
    /// Restrict the VRAM check to one device. `None` pools all devices.
    pub gpu_id: Option<u32>,
    pub cpu_headroom_percent: Option<u32>,
    pub disk_bytes: u64,
}

impl ResourceRequirements {
    pub fn ram(bytes: u64) -> Self {
        Self {
            ram_bytes: bytes,
            ..Default::default()
        }
    }

    pub fn with_vram(mut self, bytes: u64, gpu_id: Option<u32>) -> Self {
        self.vram_bytes = bytes;
        self.gpu_id = gpu_id;
        self
    }
}

/// One insufficient resource found by a feasibility check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceIssue {
    pub kind: ResourceKind,
    pub gpu_id: Option<u32>,
    pub required: u64,
    pub available: u64,
    pub message: String,
}

impl ResourceIssue {
    pub fn new(kind: ResourceKind, gpu_id: Option<u32>, required: u64, available: u64) -> Self {
        let message = match (kind, gpu_id) {
            (ResourceKind::Cpu, _) => format!(
                "CPU headroom {}% required but only {}% is idle",
                required, available
            ),
            (ResourceKind::Vram, Some(id)) => format!(
                "VRAM on GPU {} insufficient: {:.2} GiB required, {:.2} GiB available",
                id,
                required as f64 / GIB,
                available as f64 / GIB
            ),
            _ => format!(
                "{} insufficient: {:.2} GiB required, {:.2} GiB available",
                kind,
                required as f64 / GIB,
                available as f64 / GIB
            ),
        };
        Self {
            kind,
            gpu_id,
            required,
            available,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityReport {
    pub is_sufficient: bool,
    pub issues: Vec<ResourceIssue>,
    /// Timestamp of the sample the verdict was computed from.
    pub sampled_at: Option<DateTime<Utc>>,
}

impl FeasibilityReport {
    pub fn from_issues(issues: Vec<ResourceIssue>, sampled_at: Option<DateTime<Utc>>) -> Self {
        Self {
            is_sufficient: issues.is_empty(),
            issues,
            sampled_at,
        }
    }
}

/// A GPU as advertised by the hardware capability source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub id: u32,
    pub name: String,
    pub vram_total_bytes: u64,
}

/// Per-GPU reading. Fields the driver failed to report stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub id: u32,
    pub name: String,
    pub vram_total_bytes: u64,
    pub vram_used_bytes: Option<u64>,
    pub utilization_percent: Option<f32>,
    pub temperature_c: Option<f32>,
    pub power_watts: Option<f32>,
}

impl GpuSample {
    pub fn from_device(device: &GpuDevice) -> Self {
        Self {
            id: device.id,
            name: device.name.clone(),
            vram_total_bytes: device.vram_total_bytes,
            vram_used_bytes: None,
            utilization_percent: None,
            temperature_c: None,
            power_watts: None,
        }
    }

    /// Free VRAM. An unknown usage counts the whole device as free.
    pub fn vram_free_bytes(&self) -> u64 {
        self.vram_total_bytes
            .saturating_sub(self.vram_used_bytes.unwrap_or(0))
    }

    pub fn vram_used_percent(&self) -> Option<f32> {
        match self.vram_used_bytes {
            Some(used) if self.vram_total_bytes > 0 => {
                Some(used as f32 / self.vram_total_bytes as f32 * 100.0)
            }
            _ => None,
        }
    }
}

/// Point-in-time host reading recorded by the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub ram_total_bytes: u64,
    pub ram_used_bytes: u64,
    pub ram_available_bytes: u64,
    pub process_ram_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub disk_available_bytes: Option<u64>,
    pub gpus: Vec<GpuSample>,
    pub active_models: u32,
    pub active_requests: u32,
    pub tokens_per_second: f64,
}

impl ResourceSample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ram_total_bytes: 0,
            ram_used_bytes: 0,
            ram_available_bytes: 0,
            process_ram_bytes: None,
            cpu_percent: None,
            disk_available_bytes: None,
            gpus: Vec::new(),
            active_models: 0,
            active_requests: 0,
            tokens_per_second: 0.0,
        }
    }

    pub fn ram_used_percent(&self) -> Option<f32> {
        if self.ram_total_bytes == 0 {
            return None;
        }
        Some(self.ram_used_bytes as f32 / self.ram_total_bytes as f32 * 100.0)
    }

    pub fn vram_free_bytes(&self) -> u64 {
        self.gpus.iter().map(GpuSample::vram_free_bytes).sum()
    }

    pub fn vram_used_bytes(&self) -> u64 {
        self.gpus.iter().filter_map(|g| g.vram_used_bytes).sum()
    }

    pub fn gpu(&self, id: u32) -> Option<&GpuSample> {
        self.gpus.iter().find(|g| g.id == id)
    }
}

/// Alert thresholds. `None` disables the corresponding alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub ram_percent: Option<f32>,
    pub vram_percent: Option<f32>,
    pub cpu_percent: Option<f32>,
    pub gpu_temperature_c: Option<f32>,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            ram_percent: Some(90.0),
            vram_percent: Some(95.0),
            cpu_percent: Some(95.0),
            gpu_temperature_c: Some(85.0),
        }
    }
}

impl AlertThresholds {
    pub fn disabled() -> Self {
        Self {
            ram_percent: None,
            vram_percent: None,
            cpu_percent: None,
            gpu_temperature_c: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RamUsage,
    VramUsage,
    CpuUsage,
    GpuTemperature,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::RamUsage => write!(f, "RAM usage"),
            AlertKind::VramUsage => write!(f, "VRAM usage"),
            AlertKind::CpuUsage => write!(f, "CPU usage"),
            AlertKind::GpuTemperature => write!(f, "GPU temperature"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAlert {
    pub kind: AlertKind,
    pub gpu_id: Option<u32>,
    pub value: f32,
    pub threshold: f32,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ResourceAlert {
    pub fn new(
        kind: AlertKind,
        gpu_id: Option<u32>,
        value: f32,
        threshold: f32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let unit = match kind {
            AlertKind::GpuTemperature => "°C",
            _ => "%",
        };
        let target = gpu_id.map(|id| format!(" on GPU {}", id)).unwrap_or_default();
        let message = format!(
            "{}{} at {:.1}{} crossed threshold {:.1}{}",
            kind, target, value, unit, threshold, unit
        );
        Self {
            kind,
            gpu_id,
            value,
            threshold,
            timestamp,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_free_vram_with_unknown_usage() {
        let sample = GpuSample::from_device(&GpuDevice {
            id: 0,
            name: "test".to_string(),
            vram_total_bytes: 8_000,
        });
        assert_eq!(sample.vram_free_bytes(), 8_000);
        assert_eq!(sample.vram_used_percent(), None);
    }

    #[test]
    fn test_sample_aggregates_gpus() {
        let mut sample = ResourceSample::empty(Utc::now());
        for (id, used) in [(0, 2_000), (1, 6_000)] {
            let mut gpu = GpuSample::from_device(&GpuDevice {
                id,
                name: format!("gpu{}", id),
                vram_total_bytes: 8_000,
            });
            gpu.vram_used_bytes = Some(used);
            sample.gpus.push(gpu);
        }
        assert_eq!(sample.vram_free_bytes(), 8_000);
        assert_eq!(sample.vram_used_bytes(), 8_000);
        assert_eq!(sample.gpu(1).and_then(|g| g.vram_used_percent()), Some(75.0));
    }

    #[test]
    fn test_issue_message_names_gpu() {
        let issue = ResourceIssue::new(ResourceKind::Vram, Some(1), 1 << 30, 0);
        assert!(issue.message.contains("GPU 1"));
        assert!(issue.message.contains("1.00 GiB required"));
    }

    #[test]
    fn test_report_sufficiency_follows_issues() {
        assert!(FeasibilityReport::from_issues(vec![], None).is_sufficient);
        let report = FeasibilityReport::from_issues(
            vec![ResourceIssue::new(ResourceKind::Ram, None, 2, 1)],
            None,
        );
        assert!(!report.is_sufficient);
    }
}
