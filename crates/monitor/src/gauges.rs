use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Live request-load counters the manager publishes and every sample copies.
#[derive(Debug, Default)]
pub struct RuntimeGauges {
    active_models: AtomicU32,
    active_requests: AtomicU32,
    tokens_per_second: AtomicU64,
}

impl RuntimeGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active_models(&self, count: u32) {
        self.active_models.store(count, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        let _ = self
            .active_requests
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Most recent generation throughput seen by the manager.
    pub fn set_tokens_per_second(&self, value: f64) {
        self.tokens_per_second
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn active_models(&self) -> u32 {
        self.active_models.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn tokens_per_second(&self) -> f64 {
        f64::from_bits(self.tokens_per_second.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counter_never_underflows() {
        let gauges = RuntimeGauges::new();
        gauges.request_started();
        gauges.request_finished();
        gauges.request_finished();
        assert_eq!(gauges.active_requests(), 0);
    }

    #[test]
    fn test_tokens_per_second_round_trips_bits() {
        let gauges = RuntimeGauges::new();
        assert_eq!(gauges.tokens_per_second(), 0.0);
        gauges.set_tokens_per_second(42.5);
        assert_eq!(gauges.tokens_per_second(), 42.5);
    }
}
