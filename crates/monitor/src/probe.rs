//! Host readings: a sysinfo-backed probe for real hosts and a static probe
//! for tests and synthetic scenarios.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use sysinfo::{
    CpuRefreshKind, Disks, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate,
    RefreshKind, System,
};
use tracing::debug;

/// Host-level figures for one sample. Metrics the OS failed to report stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub ram_total_bytes: u64,
    pub ram_used_bytes: u64,
    pub ram_available_bytes: u64,
    pub process_ram_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub disk_available_bytes: Option<u64>,
}

/// Source of host readings. Must answer quickly; it runs on every tick.
pub trait SystemProbe: Send + Sync {
    fn read(&self) -> HostReading;

    /// Logical CPU count, used for the default thread setting.
    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Free disk space changes slowly; refreshing it every tick walks every mount.
const DISK_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

struct DiskCache {
    disks: Disks,
    available: Option<u64>,
    refreshed_at: Option<Instant>,
}

pub struct SysinfoProbe {
    system: Mutex<System>,
    disks: Mutex<DiskCache>,
    disk_refresh_interval: Duration,
    pid: Option<Pid>,
    model_dir: PathBuf,
}

impl SysinfoProbe {
    /// `model_dir` selects the disk whose free space is reported.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("Current process id unavailable: {}", e);
                None
            }
        };

        Self {
            system: Mutex::new(system),
            disks: Mutex::new(DiskCache {
                disks: Disks::new_with_refreshed_list(),
                available: None,
                refreshed_at: None,
            }),
            disk_refresh_interval: DISK_REFRESH_INTERVAL,
            pid,
            model_dir: model_dir.into(),
        }
    }

    /// Sets how long a free-space reading is reused between disk refreshes.
    pub fn with_disk_refresh_interval(mut self, interval: Duration) -> Self {
        self.disk_refresh_interval = interval;
        self
    }

    fn disk_available(&self) -> Option<u64> {
        let mut cache = lock(&self.disks);
        let stale = cache
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= self.disk_refresh_interval);
        if stale {
            cache.disks.refresh(true);
            cache.available = best_mount(&cache.disks, &self.model_dir);
            cache.refreshed_at = Some(Instant::now());
        }
        cache.available
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

/// Free space on the disk with the longest mount point containing `path`.
fn best_mount(disks: &Disks, path: &Path) -> Option<u64> {
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

impl SystemProbe for SysinfoProbe {
    fn read(&self) -> HostReading {
        let mut system = lock(&self.system);
        system.refresh_memory();
        system.refresh_cpu_usage();

        let ram_total_bytes = system.total_memory();
        let ram_available_bytes = system.available_memory();
        let ram_used_bytes = system.used_memory();

        let cpu_percent = if system.cpus().is_empty() {
            None
        } else {
            Some(system.global_cpu_usage())
        };

        let process_ram_bytes = self.pid.and_then(|pid| {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            system.process(pid).map(|p| p.memory())
        });
        drop(system);

        HostReading {
            ram_total_bytes,
            ram_used_bytes,
            ram_available_bytes,
            process_ram_bytes,
            cpu_percent,
            disk_available_bytes: self.disk_available(),
        }
    }

    fn cpu_count(&self) -> usize {
        let count = lock(&self.system).cpus().len();
        if count == 0 {
            1
        } else {
            count
        }
    }
}

/// Probe returning whatever reading it was last given.
#[derive(Debug, Default)]
pub struct StaticProbe {
    reading: Mutex<HostReading>,
}

impl StaticProbe {
    pub fn new(reading: HostReading) -> Self {
        Self {
            reading: Mutex::new(reading),
        }
    }

    /// A host with `total` bytes of RAM of which `available` are free.
    pub fn with_ram(total: u64, available: u64) -> Self {
        Self::new(HostReading {
            ram_total_bytes: total,
            ram_used_bytes: total.saturating_sub(available),
            ram_available_bytes: available,
            process_ram_bytes: None,
            cpu_percent: Some(5.0),
            disk_available_bytes: None,
        })
    }

    pub fn set(&self, reading: HostReading) {
        *lock(&self.reading) = reading;
    }

    pub fn update(&self, f: impl FnOnce(&mut HostReading)) {
        f(&mut lock(&self.reading));
    }
}

impl SystemProbe for StaticProbe {
    fn read(&self) -> HostReading {
        lock(&self.reading).clone()
    }
}
