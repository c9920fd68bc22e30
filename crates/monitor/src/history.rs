use chrono::{DateTime, TimeDelta, Utc};
use hearth_core::ResourceSample;
use std::collections::VecDeque;
use std::time::Duration;

/// Rolling window of samples, oldest first.
///
/// Bounded twice: by sample count and by age relative to the newest sample.
#[derive(Debug)]
pub struct ResourceHistory {
    samples: VecDeque<ResourceSample>,
    capacity: usize,
    /// `None` when the retention is beyond what timestamps can express.
    retention: Option<TimeDelta>,
}

impl ResourceHistory {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            retention: TimeDelta::from_std(retention).ok(),
        }
    }

    pub fn push(&mut self, sample: ResourceSample) {
        let newest = sample.timestamp;
        self.samples.push_back(sample);

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        let Some(cutoff) = cutoff(newest, self.retention) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|s| s.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.back()
    }

    /// Samples no older than `period` before `now`, oldest first.
    ///
    /// A period reaching past the earliest representable time returns everything.
    pub fn window(&self, period: Duration, now: DateTime<Utc>) -> Vec<ResourceSample> {
        let cutoff = cutoff(now, TimeDelta::from_std(period).ok());
        self.samples
            .iter()
            .filter(|s| cutoff.map_or(true, |cutoff| s.timestamp >= cutoff))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

fn cutoff(from: DateTime<Utc>, span: Option<TimeDelta>) -> Option<DateTime<Utc>> {
    span.and_then(|span| from.checked_sub_signed(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(ts: DateTime<Utc>, used: u64) -> ResourceSample {
        let mut sample = ResourceSample::empty(ts);
        sample.ram_used_bytes = used;
        sample
    }

    #[test]
    fn test_evicts_oldest_over_capacity() {
        let mut history = ResourceHistory::new(3, Duration::from_secs(3600));
        let start = Utc::now();
        for i in 0..5 {
            history.push(sample_at(start + chrono::Duration::seconds(i), i as u64));
        }

        assert_eq!(history.len(), 3);
        let window = history.window(Duration::from_secs(3600), start + chrono::Duration::seconds(5));
        let used: Vec<u64> = window.iter().map(|s| s.ram_used_bytes).collect();
        assert_eq!(used, vec![2, 3, 4]);
    }

    #[test]
    fn test_evicts_by_retention() {
        let mut history = ResourceHistory::new(100, Duration::from_secs(10));
        let start = Utc::now();
        history.push(sample_at(start, 1));
        history.push(sample_at(start + chrono::Duration::seconds(5), 2));
        history.push(sample_at(start + chrono::Duration::seconds(20), 3));

        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().map(|s| s.ram_used_bytes), Some(3));
    }

    #[test]
    fn test_window_filters_by_period() {
        let mut history = ResourceHistory::new(100, Duration::from_secs(3600));
        let now = Utc::now();
        history.push(sample_at(now - chrono::Duration::seconds(120), 1));
        history.push(sample_at(now - chrono::Duration::seconds(30), 2));
        history.push(sample_at(now, 3));

        let recent = history.window(Duration::from_secs(60), now);
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp <= recent[1].timestamp);
    }

    #[test]
    fn test_huge_periods_return_everything() {
        let mut history = ResourceHistory::new(100, Duration::from_secs(3600));
        let now = Utc::now();
        history.push(sample_at(now - chrono::Duration::seconds(30), 1));
        history.push(sample_at(now, 2));

        assert_eq!(history.window(Duration::from_secs(100_000_000_000_000), now).len(), 2);
        assert_eq!(history.window(Duration::from_secs(u64::MAX / 2), now).len(), 2);
        assert_eq!(history.window(Duration::MAX, now).len(), 2);
    }

    #[test]
    fn test_unbounded_retention_keeps_samples() {
        let mut history = ResourceHistory::new(3, Duration::from_secs(100_000_000_000_000));
        let start = Utc::now();
        for i in 0..4 {
            history.push(sample_at(start + chrono::Duration::seconds(i), i as u64));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest().map(|s| s.ram_used_bytes), Some(3));
    }
}
