use hearth_core::{
    AlertKind, AlertThresholds, BackendError, GpuDevice, GpuSample, GpuSource, ResourceAlert,
    ResourceKind, ResourceRequirements,
};
use hearth_monitor::{
    AlertHandler, HostReading, MonitorSettings, ResourceMonitor, RuntimeGauges, StaticProbe,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Default)]
struct Collect(Mutex<Vec<ResourceAlert>>);

impl AlertHandler for Collect {
    fn on_alert(&self, alert: &ResourceAlert) {
        self.0.lock().unwrap().push(alert.clone());
    }
}

struct HotGpu {
    temperature: Mutex<f32>,
}

impl GpuSource for HotGpu {
    fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
        Ok(vec![GpuDevice {
            id: 0,
            name: "gpu0".to_string(),
            vram_total_bytes: 16 * GIB,
        }])
    }

    fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
        let mut sample = GpuSample::from_device(device);
        sample.vram_used_bytes = Some(4 * GIB);
        sample.temperature_c = Some(*self.temperature.lock().unwrap());
        Ok(sample)
    }
}

fn monitor(probe: Arc<StaticProbe>, gpus: Option<Arc<dyn GpuSource>>) -> ResourceMonitor {
    ResourceMonitor::new(
        probe,
        gpus,
        Arc::new(RuntimeGauges::new()),
        MonitorSettings {
            interval: Duration::from_millis(10),
            history_capacity: 100,
            retention: Duration::from_secs(3600),
            thresholds: AlertThresholds::default(),
        },
    )
}

#[test]
fn test_ram_shortfall_is_reported() {
    let probe = Arc::new(StaticProbe::with_ram(16_000_000_000, 4_000_000_000));
    let monitor = monitor(probe, None);

    let report = monitor.check_feasible(&ResourceRequirements::ram(8_000_000_000));

    assert!(!report.is_sufficient);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, ResourceKind::Ram);
    assert_eq!(report.issues[0].required, 8_000_000_000);
    assert_eq!(report.issues[0].available, 4_000_000_000);
}

#[test]
fn test_vram_pinned_to_gpu() {
    let probe = Arc::new(StaticProbe::with_ram(64 * GIB, 32 * GIB));
    let gpus: Arc<dyn GpuSource> = Arc::new(HotGpu {
        temperature: Mutex::new(40.0),
    });
    let monitor = monitor(probe, Some(gpus));

    let fits = ResourceRequirements::ram(GIB).with_vram(10 * GIB, Some(0));
    assert!(monitor.check_feasible(&fits).is_sufficient);

    let too_big = ResourceRequirements::ram(GIB).with_vram(13 * GIB, Some(0));
    let report = monitor.check_feasible(&too_big);
    assert_eq!(report.issues[0].kind, ResourceKind::Vram);
    assert_eq!(report.issues[0].gpu_id, Some(0));
    assert_eq!(report.issues[0].available, 12 * GIB);

    let missing = ResourceRequirements::ram(GIB).with_vram(GIB, Some(3));
    assert!(!monitor.check_feasible(&missing).is_sufficient);
}

#[test]
fn test_synthetic_samples_drive_alerts_without_background_task() {
    let probe = Arc::new(StaticProbe::with_ram(100 * GIB, 50 * GIB));
    let gpu = Arc::new(HotGpu {
        temperature: Mutex::new(40.0),
    });
    let monitor = monitor(probe.clone(), Some(gpu.clone() as Arc<dyn GpuSource>));
    let alerts = Arc::new(Collect::default());
    monitor.add_alert_handler(alerts.clone());

    monitor.tick();
    assert!(alerts.0.lock().unwrap().is_empty());

    *gpu.temperature.lock().unwrap() = 92.0;
    probe.update(|r| r.cpu_percent = Some(99.0));
    monitor.tick();
    monitor.tick();

    let raised: Vec<AlertKind> = alerts.0.lock().unwrap().iter().map(|a| a.kind).collect();
    assert_eq!(raised.len(), 2);
    assert!(raised.contains(&AlertKind::CpuUsage));
    assert!(raised.contains(&AlertKind::GpuTemperature));
    assert!(!monitor.is_running());
}

#[test]
fn test_missing_metrics_are_absorbed() {
    let probe = Arc::new(StaticProbe::new(HostReading {
        ram_total_bytes: 8 * GIB,
        ram_used_bytes: 2 * GIB,
        ram_available_bytes: 6 * GIB,
        process_ram_bytes: None,
        cpu_percent: None,
        disk_available_bytes: None,
    }));
    let monitor = monitor(probe, None);

    let sample = monitor.tick();
    assert!(sample.cpu_percent.is_none());
    assert!(sample.gpus.is_empty());
    assert_eq!(monitor.history(Duration::from_secs(60)).len(), 1);
}

#[tokio::test]
async fn test_background_task_fills_history() {
    let probe = Arc::new(StaticProbe::with_ram(16 * GIB, 8 * GIB));
    let monitor = monitor(probe, None);

    monitor.start();
    assert!(monitor.is_running());
    tokio::time::sleep(Duration::from_millis(80)).await;
    monitor.stop().await;
    assert!(!monitor.is_running());

    let count = monitor.history(Duration::from_secs(60)).len();
    assert!(count >= 2, "expected several samples, got {}", count);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(monitor.history(Duration::from_secs(60)).len(), count);
}
