use crate::alerts::AlertEvaluator;
use crate::feasibility;
use crate::gauges::RuntimeGauges;
use crate::history::ResourceHistory;
use crate::probe::SystemProbe;
use chrono::Utc;
use hearth_core::{
    AlertThresholds, FeasibilityReport, GpuDevice, GpuSample, GpuSource, ResourceAlert,
    ResourceRequirements, ResourceSample, RuntimeConfig,
};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives alerts as the monitor raises them.
pub trait AlertHandler: Send + Sync {
    fn on_alert(&self, alert: &ResourceAlert);
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub history_capacity: usize,
    pub retention: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for MonitorSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            interval: config.monitor_interval(),
            history_capacity: config.history_capacity(),
            retention: config.history_retention(),
            thresholds: config.alerts.clone(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct State {
    history: ResourceHistory,
    alerts: AlertEvaluator,
}

struct Inner {
    probe: Arc<dyn SystemProbe>,
    gpus: Option<Arc<dyn GpuSource>>,
    devices: Mutex<Option<Vec<GpuDevice>>>,
    state: Mutex<State>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    gauges: Arc<RuntimeGauges>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Periodic host sampler with a bounded history and edge-triggered alerts.
///
/// Nothing runs in the background until [`ResourceMonitor::start`]; tests can
/// drive it entirely through [`ResourceMonitor::record`].
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<Inner>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn SystemProbe>,
        gpus: Option<Arc<dyn GpuSource>>,
        gauges: Arc<RuntimeGauges>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                probe,
                gpus,
                devices: Mutex::new(None),
                state: Mutex::new(State {
                    history: ResourceHistory::new(settings.history_capacity, settings.retention),
                    alerts: AlertEvaluator::new(settings.thresholds),
                }),
                handlers: RwLock::new(Vec::new()),
                gauges,
                interval: settings.interval,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn gauges(&self) -> &Arc<RuntimeGauges> {
        &self.inner.gauges
    }

    pub fn add_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(handler);
    }

    /// GPUs reported by the hardware source. The list is cached after the
    /// first successful query.
    pub fn gpus(&self) -> Vec<GpuDevice> {
        let Some(source) = &self.inner.gpus else {
            return Vec::new();
        };
        let mut cached = lock(&self.inner.devices);
        if let Some(devices) = cached.as_ref() {
            return devices.clone();
        }
        match source.list_gpus() {
            Ok(devices) => {
                debug!(count = devices.len(), "GPU devices listed");
                *cached = Some(devices.clone());
                devices
            }
            Err(e) => {
                warn!(error = %e, "Failed to list GPUs");
                Vec::new()
            }
        }
    }

    /// Takes a fresh reading without recording it.
    pub fn read_sample(&self) -> ResourceSample {
        let reading = self.inner.probe.read();
        let gpus = self.sample_gpus(&self.gpus());
        let gauges = &self.inner.gauges;

        ResourceSample {
            timestamp: Utc::now(),
            ram_total_bytes: reading.ram_total_bytes,
            ram_used_bytes: reading.ram_used_bytes,
            ram_available_bytes: reading.ram_available_bytes,
            process_ram_bytes: reading.process_ram_bytes,
            cpu_percent: reading.cpu_percent,
            disk_available_bytes: reading.disk_available_bytes,
            gpus,
            active_models: gauges.active_models(),
            active_requests: gauges.active_requests(),
            tokens_per_second: gauges.tokens_per_second(),
        }
    }

    fn sample_gpus(&self, devices: &[GpuDevice]) -> Vec<GpuSample> {
        let Some(source) = &self.inner.gpus else {
            return devices.iter().map(GpuSample::from_device).collect();
        };
        devices
            .iter()
            .zip(source.sample_gpus(devices))
            .map(|(device, reading)| match reading {
                Ok(sample) => sample,
                Err(e) => {
                    debug!(gpu_id = device.id, error = %e, "GPU query failed, reporting capacity only");
                    GpuSample::from_device(device)
                }
            })
            .collect()
    }

    /// Appends a sample to the history and dispatches any alerts it raises.
    pub fn record(&self, sample: ResourceSample) -> Vec<ResourceAlert> {
        let alerts = {
            let mut state = lock(&self.inner.state);
            let alerts = state.alerts.evaluate(&sample);
            state.history.push(sample);
            alerts
        };

        if !alerts.is_empty() {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            for alert in &alerts {
                debug!(kind = %alert.kind, gpu_id = ?alert.gpu_id, "{}", alert.message);
                for handler in &handlers {
                    handler.on_alert(alert);
                }
            }
        }
        alerts
    }

    /// One monitoring step: read and record.
    pub fn tick(&self) -> ResourceSample {
        let sample = self.read_sample();
        self.record(sample.clone());
        sample
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        lock(&self.inner.state).history.latest().cloned()
    }

    /// Latest recorded sample, taking one if the history is empty.
    pub fn sample(&self) -> ResourceSample {
        match self.latest() {
            Some(sample) => sample,
            None => self.tick(),
        }
    }

    /// Samples within `period` of now, oldest first.
    pub fn history(&self, period: Duration) -> Vec<ResourceSample> {
        lock(&self.inner.state).history.window(period, Utc::now())
    }

    pub fn check_feasible(&self, requirements: &ResourceRequirements) -> FeasibilityReport {
        let sample = self.sample();
        feasibility::check(&sample, requirements)
    }

    pub fn alert_thresholds(&self) -> AlertThresholds {
        lock(&self.inner.state).alerts.thresholds().clone()
    }

    pub fn set_alert_thresholds(&self, thresholds: AlertThresholds) {
        info!(?thresholds, "Alert thresholds replaced");
        lock(&self.inner.state).alerts.set_thresholds(thresholds);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawns the periodic sampling task. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut running = lock(&self.inner.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(run_loop(weak, self.inner.interval, cancel.clone()));
        info!(interval_ms = self.inner.interval.as_millis(), "Resource monitor started");
        *running = Some(Running { cancel, handle });
    }

    pub async fn stop(&self) {
        let running = lock(&self.inner.running).take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                warn!(error = %e, "Resource monitor task ended abnormally");
            }
            info!("Resource monitor stopped");
        }
    }
}

async fn run_loop(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                // Probes query the OS and may spawn driver tools.
                let monitor = ResourceMonitor { inner };
                if let Err(e) = tokio::task::spawn_blocking(move || monitor.tick()).await {
                    warn!(error = %e, "Resource sampling task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use hearth_core::{AlertKind, BackendError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        count: AtomicUsize,
    }

    impl AlertHandler for CountingHandler {
        fn on_alert(&self, _alert: &ResourceAlert) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FlakyGpus;

    impl GpuSource for FlakyGpus {
        fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
            Ok(vec![
                GpuDevice {
                    id: 0,
                    name: "ok".to_string(),
                    vram_total_bytes: 8_000,
                },
                GpuDevice {
                    id: 1,
                    name: "broken".to_string(),
                    vram_total_bytes: 4_000,
                },
            ])
        }

        fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
            if device.id == 1 {
                return Err(BackendError::other("driver call failed"));
            }
            let mut sample = GpuSample::from_device(device);
            sample.vram_used_bytes = Some(1_000);
            sample.temperature_c = Some(50.0);
            Ok(sample)
        }
    }

    /// Counts how the monitor queries it.
    #[derive(Default)]
    struct BatchGpus {
        batches: AtomicUsize,
        singles: AtomicUsize,
    }

    impl GpuSource for BatchGpus {
        fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError> {
            Ok((0..3)
                .map(|id| GpuDevice {
                    id,
                    name: format!("gpu{}", id),
                    vram_total_bytes: 8_000,
                })
                .collect())
        }

        fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
            self.singles.fetch_add(1, Ordering::SeqCst);
            Ok(GpuSample::from_device(device))
        }

        fn sample_gpus(&self, devices: &[GpuDevice]) -> Vec<Result<GpuSample, BackendError>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            devices.iter().map(|d| Ok(GpuSample::from_device(d))).collect()
        }
    }

    fn monitor_with(probe: Arc<StaticProbe>, gpus: Option<Arc<dyn GpuSource>>) -> ResourceMonitor {
        ResourceMonitor::new(
            probe,
            gpus,
            Arc::new(RuntimeGauges::new()),
            MonitorSettings {
                interval: Duration::from_millis(10),
                history_capacity: 16,
                retention: Duration::from_secs(60),
                thresholds: AlertThresholds::default(),
            },
        )
    }

    #[test]
    fn test_failed_gpu_query_keeps_sample() {
        let probe = Arc::new(StaticProbe::with_ram(16_000, 8_000));
        let monitor = monitor_with(probe, Some(Arc::new(FlakyGpus)));

        let sample = monitor.tick();
        assert_eq!(sample.gpus.len(), 2);
        assert_eq!(sample.gpus[0].vram_used_bytes, Some(1_000));
        assert_eq!(sample.gpus[1].vram_used_bytes, None);
        assert_eq!(sample.gpus[1].vram_total_bytes, 4_000);
        assert_eq!(monitor.history(Duration::from_secs(60)).len(), 1);
    }

    #[test]
    fn test_tick_queries_all_gpus_at_once() {
        let source = Arc::new(BatchGpus::default());
        let monitor = monitor_with(
            Arc::new(StaticProbe::with_ram(100, 10)),
            Some(source.clone()),
        );

        let sample = monitor.tick();
        monitor.tick();

        assert_eq!(sample.gpus.len(), 3);
        assert_eq!(source.batches.load(Ordering::SeqCst), 2);
        assert_eq!(source.singles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_injected_samples_raise_alerts_once() {
        let probe = Arc::new(StaticProbe::with_ram(100, 50));
        let monitor = monitor_with(probe.clone(), None);
        let handler = Arc::new(CountingHandler {
            count: AtomicUsize::new(0),
        });
        monitor.add_alert_handler(handler.clone());

        monitor.tick();
        probe.update(|r| {
            r.ram_used_bytes = 95;
            r.ram_available_bytes = 5;
        });
        let sample = monitor.tick();
        assert!(sample.ram_used_percent().is_some_and(|p| p > 90.0));
        monitor.tick();

        assert_eq!(handler.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_record_returns_alerts() {
        let monitor = monitor_with(Arc::new(StaticProbe::default()), None);
        let mut sample = ResourceSample::empty(Utc::now());
        sample.cpu_percent = Some(99.0);

        let alerts = monitor.record(sample);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::CpuUsage);
    }

    #[test]
    fn test_feasibility_samples_when_history_empty() {
        let probe = Arc::new(StaticProbe::with_ram(16_000_000_000, 4_000_000_000));
        let monitor = monitor_with(probe, None);
        assert!(monitor.latest().is_none());

        let report = monitor.check_feasible(&ResourceRequirements::ram(8_000_000_000));
        assert!(!report.is_sufficient);
        assert_eq!(report.issues[0].available, 4_000_000_000);
        assert!(monitor.latest().is_some());
    }

    #[test]
    fn test_sample_copies_gauges() {
        let gauges = Arc::new(RuntimeGauges::new());
        let monitor = ResourceMonitor::new(
            Arc::new(StaticProbe::default()),
            None,
            gauges.clone(),
            MonitorSettings::default(),
        );
        gauges.set_active_models(2);
        gauges.request_started();

        let sample = monitor.read_sample();
        assert_eq!(sample.active_models, 2);
        assert_eq!(sample.active_requests, 1);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let monitor = monitor_with(Arc::new(StaticProbe::with_ram(100, 50)), None);
        monitor.start();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop().await;
        assert!(!monitor.is_running());

        let recorded = monitor.history(Duration::from_secs(60)).len();
        assert!(recorded >= 2, "expected several ticks, got {}", recorded);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(monitor.history(Duration::from_secs(60)).len(), recorded);
    }
}
