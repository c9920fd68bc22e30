//! GPU capability sources.

use hearth_core::{BackendError, GpuDevice, GpuSample, GpuSource};
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// CPU-only host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGpuSource;

impl GpuSource for NoGpuSource {
    fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
        Ok(Vec::new())
    }
}

/// Fixed device list with optionally injected live readings.
#[derive(Debug, Default)]
pub struct StaticGpuSource {
    devices: Vec<GpuDevice>,
    samples: Mutex<HashMap<u32, GpuSample>>,
}

impl StaticGpuSource {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices,
            samples: Mutex::new(HashMap::new()),
        }
    }

    fn samples(&self) -> MutexGuard<'_, HashMap<u32, GpuSample>> {
        self.samples.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces the reading reported for `sample.id`.
    pub fn set_sample(&self, sample: GpuSample) {
        self.samples().insert(sample.id, sample);
    }

    pub fn set_vram_used(&self, gpu_id: u32, used_bytes: u64) {
        let mut samples = self.samples();
        if let Some(device) = self.devices.iter().find(|d| d.id == gpu_id) {
            samples
                .entry(gpu_id)
                .or_insert_with(|| GpuSample::from_device(device))
                .vram_used_bytes = Some(used_bytes);
        }
    }
}

impl GpuSource for StaticGpuSource {
    fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
        Ok(self.devices.clone())
    }

    fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
        Ok(self
            .samples()
            .get(&device.id)
            .cloned()
            .unwrap_or_else(|| GpuSample::from_device(device)))
    }
}

/// NVIDIA devices read through `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiSource {
    binary: String,
}

impl Default for NvidiaSmiSource {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn query(&self) -> Result<Vec<GpuSample>, BackendError> {
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| BackendError::ConfigurationError {
                message: format!("Failed to run {}: {}", self.binary, e),
            })?;
        if !output.status.success() {
            return Err(BackendError::other(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

impl GpuSource for NvidiaSmiSource {
    fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
        Ok(self
            .query()?
            .into_iter()
            .map(|s| GpuDevice {
                id: s.id,
                name: s.name,
                vram_total_bytes: s.vram_total_bytes,
            })
            .collect())
    }

    fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
        pick(&self.query()?, device)
    }

    fn sample_gpus(&self, devices: &[GpuDevice]) -> Vec<Result<GpuSample, BackendError>> {
        match self.query() {
            Ok(samples) => devices.iter().map(|device| pick(&samples, device)).collect(),
            Err(e) => devices.iter().map(|_| Err(e.clone())).collect(),
        }
    }
}

fn pick(samples: &[GpuSample], device: &GpuDevice) -> Result<GpuSample, BackendError> {
    samples
        .iter()
        .find(|s| s.id == device.id)
        .cloned()
        .ok_or_else(|| BackendError::other(format!("GPU {} disappeared", device.id)))
}

/// Parses `--format=csv,noheader,nounits` output. Unreported fields read as
/// `[N/A]` and map to `None`. The name column may itself contain commas, so the
/// index is taken from the left and the five numeric columns from the right.
fn parse_nvidia_smi(output: &str) -> Result<Vec<GpuSample>, BackendError> {
    let mut samples = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let malformed = |message: String| BackendError::InvalidResponse {
            message,
            raw_response: Some(line.to_string()),
        };
        let (index, rest) = line
            .split_once(',')
            .ok_or_else(|| malformed("expected 7 columns, got 1".to_string()))?;
        let mut tail: Vec<&str> = rest.rsplitn(6, ',').map(str::trim).collect();
        if tail.len() < 6 {
            return Err(malformed(format!("expected 7 columns, got {}", tail.len() + 1)));
        }
        tail.reverse();

        let id = index
            .trim()
            .parse::<u32>()
            .map_err(|e| malformed(format!("bad GPU index: {}", e)))?;
        let number = |s: &str| s.parse::<f64>().ok();
        samples.push(GpuSample {
            id,
            name: tail[0].to_string(),
            vram_total_bytes: number(tail[1]).map_or(0, |m| (m as u64) * MIB),
            vram_used_bytes: number(tail[2]).map(|m| (m as u64) * MIB),
            utilization_percent: number(tail[3]).map(|v| v as f32),
            temperature_c: number(tail[4]).map(|v| v as f32),
            power_watts: number(tail[5]).map(|v| v as f32),
        });
    }
    debug!(gpus = samples.len(), "Parsed nvidia-smi output");
    Ok(samples)
}
