use hearth_core::{AlertKind, AlertThresholds, ResourceAlert, ResourceSample};
use std::collections::HashSet;

type AlertKey = (AlertKind, Option<u32>);

/// Edge-triggered threshold evaluation.
///
/// An alert fires when a metric goes from at-or-below its threshold to above
/// it, and re-arms once the metric drops back. A metric missing from a sample
/// leaves its state unchanged.
#[derive(Debug, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    above: HashSet<AlertKey>,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            above: HashSet::new(),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Replaces every threshold at once and re-arms all alerts.
    pub fn set_thresholds(&mut self, thresholds: AlertThresholds) {
        self.thresholds = thresholds;
        self.above.clear();
    }

    pub fn evaluate(&mut self, sample: &ResourceSample) -> Vec<ResourceAlert> {
        let mut fired = Vec::new();

        self.check(
            (AlertKind::RamUsage, None),
            sample.ram_used_percent(),
            self.thresholds.ram_percent,
            sample,
            &mut fired,
        );
        self.check(
            (AlertKind::CpuUsage, None),
            sample.cpu_percent,
            self.thresholds.cpu_percent,
            sample,
            &mut fired,
        );
        for gpu in &sample.gpus {
            self.check(
                (AlertKind::VramUsage, Some(gpu.id)),
                gpu.vram_used_percent(),
                self.thresholds.vram_percent,
                sample,
                &mut fired,
            );
            self.check(
                (AlertKind::GpuTemperature, Some(gpu.id)),
                gpu.temperature_c,
                self.thresholds.gpu_temperature_c,
                sample,
                &mut fired,
            );
        }

        fired
    }

    fn check(
        &mut self,
        key: AlertKey,
        value: Option<f32>,
        threshold: Option<f32>,
        sample: &ResourceSample,
        fired: &mut Vec<ResourceAlert>,
    ) {
        let (Some(value), Some(threshold)) = (value, threshold) else {
            return;
        };
        if value > threshold {
            if self.above.insert(key) {
                fired.push(ResourceAlert::new(
                    key.0,
                    key.1,
                    value,
                    threshold,
                    sample.timestamp,
                ));
            }
        } else {
            self.above.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_core::{GpuDevice, GpuSample};

    fn ram_sample(used_percent: u64) -> ResourceSample {
        let mut sample = ResourceSample::empty(Utc::now());
        sample.ram_total_bytes = 100;
        sample.ram_used_bytes = used_percent;
        sample.ram_available_bytes = 100 - used_percent;
        sample
    }

    #[test]
    fn test_fires_once_per_crossing() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds {
            ram_percent: Some(90.0),
            ..AlertThresholds::disabled()
        });

        assert!(evaluator.evaluate(&ram_sample(50)).is_empty());
        let alerts = evaluator.evaluate(&ram_sample(95));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::RamUsage);
        assert!(evaluator.evaluate(&ram_sample(97)).is_empty());
        assert!(evaluator.evaluate(&ram_sample(99)).is_empty());

        assert!(evaluator.evaluate(&ram_sample(80)).is_empty());
        assert_eq!(evaluator.evaluate(&ram_sample(92)).len(), 1);
    }

    #[test]
    fn test_first_sample_above_threshold_fires() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        assert_eq!(evaluator.evaluate(&ram_sample(95)).len(), 1);
    }

    #[test]
    fn test_gpu_alerts_are_tracked_per_device() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds {
            gpu_temperature_c: Some(80.0),
            ..AlertThresholds::disabled()
        });

        let mut sample = ResourceSample::empty(Utc::now());
        for id in 0..2 {
            let mut gpu = GpuSample::from_device(&GpuDevice {
                id,
                name: format!("gpu{}", id),
                vram_total_bytes: 1,
            });
            gpu.temperature_c = Some(if id == 0 { 85.0 } else { 60.0 });
            sample.gpus.push(gpu);
        }
        let alerts = evaluator.evaluate(&sample);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].gpu_id, Some(0));

        sample.gpus[1].temperature_c = Some(90.0);
        let alerts = evaluator.evaluate(&sample);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].gpu_id, Some(1));
    }

    #[test]
    fn test_missing_metric_keeps_state() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds {
            cpu_percent: Some(90.0),
            ..AlertThresholds::disabled()
        });
        let mut sample = ram_sample(10);
        sample.cpu_percent = Some(99.0);
        assert_eq!(evaluator.evaluate(&sample).len(), 1);

        sample.cpu_percent = None;
        assert!(evaluator.evaluate(&sample).is_empty());

        sample.cpu_percent = Some(99.0);
        assert!(evaluator.evaluate(&sample).is_empty());
    }

    #[test]
    fn test_replacing_thresholds_rearms() {
        let mut evaluator = AlertEvaluator::new(AlertThresholds::default());
        assert_eq!(evaluator.evaluate(&ram_sample(95)).len(), 1);

        evaluator.set_thresholds(AlertThresholds {
            ram_percent: Some(96.0),
            ..AlertThresholds::disabled()
        });
        assert!(evaluator.evaluate(&ram_sample(95)).is_empty());
        assert_eq!(evaluator.evaluate(&ram_sample(97)).len(), 1);
    }
}
