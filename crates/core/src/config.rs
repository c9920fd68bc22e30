use crate::resources::AlertThresholds;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MONITOR_INTERVAL_MS: u64 = 100;
const DEFAULT_HISTORY_RETENTION_SECS: u64 = 86_400;
const DEFAULT_MAX_HISTORY_SAMPLES: usize = 36_000;
const DEFAULT_EVENT_BUFFER: usize = 1024;
const DEFAULT_BATCH_SIZE: u32 = 256;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub monitor_interval_ms: u64,
    pub history_retention_secs: u64,
    pub max_history_samples: usize,
    pub event_buffer: usize,
    pub batch_size: u32,
    pub threads: u32,
    pub request_timeout_secs: Option<u64>,
    pub alerts: AlertThresholds,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            monitor_interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            history_retention_secs: DEFAULT_HISTORY_RETENTION_SECS,
            max_history_samples: DEFAULT_MAX_HISTORY_SAMPLES,
            event_buffer: DEFAULT_EVENT_BUFFER,
            batch_size: DEFAULT_BATCH_SIZE,
            threads,
            request_timeout_secs: None,
            alerts: AlertThresholds::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                field: key.to_string(),
                error: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl RuntimeConfig {
    /// Reads `HEARTH_*` overrides on top of the defaults and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse("HEARTH_MONITOR_INTERVAL_MS")? {
            config.monitor_interval_ms = v;
        }
        if let Some(v) = env_parse("HEARTH_HISTORY_RETENTION_SECS")? {
            config.history_retention_secs = v;
        }
        if let Some(v) = env_parse("HEARTH_MAX_HISTORY_SAMPLES")? {
            config.max_history_samples = v;
        }
        if let Some(v) = env_parse("HEARTH_EVENT_BUFFER")? {
            config.event_buffer = v;
        }
        if let Some(v) = env_parse("HEARTH_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env_parse("HEARTH_THREADS")? {
            config.threads = v;
        }
        if let Some(v) = env_parse("HEARTH_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = Some(v);
        }
        if let Some(v) = env_parse("HEARTH_ALERT_RAM_PERCENT")? {
            config.alerts.ram_percent = Some(v);
        }
        if let Some(v) = env_parse("HEARTH_ALERT_VRAM_PERCENT")? {
            config.alerts.vram_percent = Some(v);
        }
        if let Some(v) = env_parse("HEARTH_ALERT_CPU_PERCENT")? {
            config.alerts.cpu_percent = Some(v);
        }
        if let Some(v) = env_parse("HEARTH_ALERT_GPU_TEMP_C")? {
            config.alerts.gpu_temperature_c = Some(v);
        }
        if let Ok(level) = env::var("HEARTH_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor_interval_ms < 10 {
            return Err(ConfigError::ValidationFailed(
                "Monitor interval must be at least 10ms".to_string(),
            ));
        }
        if self.monitor_interval_ms > 60_000 {
            return Err(ConfigError::ValidationFailed(
                "Monitor interval cannot exceed 60 seconds".to_string(),
            ));
        }

        if self.history_retention_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "History retention must be at least 1 second".to_string(),
            ));
        }
        if self.max_history_samples == 0 {
            return Err(ConfigError::ValidationFailed(
                "Max history samples must be at least 1".to_string(),
            ));
        }
        if self.max_history_samples > 1_000_000 {
            return Err(ConfigError::ValidationFailed(
                "Max history samples cannot exceed 1000000".to_string(),
            ));
        }

        if self.event_buffer < 16 {
            return Err(ConfigError::ValidationFailed(
                "Event buffer must hold at least 16 events".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "Batch size must be at least 1".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "Threads must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "Request timeout must be at least 1 second".to_string(),
            ));
        }

        for (name, value) in [
            ("RAM", self.alerts.ram_percent),
            ("VRAM", self.alerts.vram_percent),
            ("CPU", self.alerts.cpu_percent),
        ] {
            if let Some(v) = value {
                if !(0.0..=100.0).contains(&v) {
                    return Err(ConfigError::ValidationFailed(format!(
                        "{} alert threshold must be between 0 and 100, got {}",
                        name, v
                    )));
                }
            }
        }
        if let Some(t) = self.alerts.gpu_temperature_c {
            if !t.is_finite() || t <= 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "GPU temperature threshold must be positive, got {}",
                    t
                )));
            }
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationFailed(format!(
                    "Invalid log level: {}. Valid options: trace, debug, info, warn, error",
                    self.log_level
                )))
            }
        }

        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    /// Samples the history keeps: the retention window at the configured tick,
    /// capped by `max_history_samples`.
    pub fn history_capacity(&self) -> usize {
        let per_window = (self.history_retention_secs * 1000) / self.monitor_interval_ms.max(1);
        (per_window as usize).clamp(1, self.max_history_samples)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn to_display_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();

        map.insert(
            "monitor_interval_ms".to_string(),
            self.monitor_interval_ms.to_string(),
        );
        map.insert(
            "history_retention_secs".to_string(),
            self.history_retention_secs.to_string(),
        );
        map.insert(
            "max_history_samples".to_string(),
            self.max_history_samples.to_string(),
        );
        map.insert(
            "history_capacity".to_string(),
            self.history_capacity().to_string(),
        );
        map.insert("event_buffer".to_string(), self.event_buffer.to_string());
        map.insert("batch_size".to_string(), self.batch_size.to_string());
        map.insert("threads".to_string(), self.threads.to_string());
        map.insert(
            "request_timeout_secs".to_string(),
            self.request_timeout_secs
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
        );
        map.insert("alert_ram_percent".to_string(), opt(self.alerts.ram_percent));
        map.insert(
            "alert_vram_percent".to_string(),
            opt(self.alerts.vram_percent),
        );
        map.insert("alert_cpu_percent".to_string(), opt(self.alerts.cpu_percent));
        map.insert(
            "alert_gpu_temp_c".to_string(),
            opt(self.alerts.gpu_temperature_c),
        );
        map.insert("log_level".to_string(), self.log_level.clone());

        map
    }
}

fn opt(value: Option<f32>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "disabled".to_string())
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hearth Configuration:")?;
        writeln!(f, "  Monitor Interval: {}ms", self.monitor_interval_ms)?;
        writeln!(
            f,
            "  History: {}s retention, {} samples max ({} kept)",
            self.history_retention_secs,
            self.max_history_samples,
            self.history_capacity()
        )?;
        writeln!(f, "  Event Buffer: {}", self.event_buffer)?;
        writeln!(f, "  Batch Size: {}", self.batch_size)?;
        writeln!(f, "  Threads: {}", self.threads)?;
        match self.request_timeout_secs {
            Some(secs) => writeln!(f, "  Request Timeout: {}s", secs)?,
            None => writeln!(f, "  Request Timeout: none")?,
        }
        writeln!(
            f,
            "  Alerts: RAM {} / VRAM {} / CPU {} / GPU temp {}",
            opt(self.alerts.ram_percent),
            opt(self.alerts.vram_percent),
            opt(self.alerts.cpu_percent),
            opt(self.alerts.gpu_temperature_c)
        )?;
        writeln!(f, "  Log Level: {}", self.log_level)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard {
        key: String,
        old_value: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old_value = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                old_value,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.old_value {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_default_configuration() {
        let config = RuntimeConfig::default();

        assert_eq!(config.monitor_interval_ms, DEFAULT_MONITOR_INTERVAL_MS);
        assert_eq!(config.history_retention_secs, DEFAULT_HISTORY_RETENTION_SECS);
        assert_eq!(config.max_history_samples, DEFAULT_MAX_HISTORY_SAMPLES);
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.threads >= 1);
        assert_eq!(config.request_timeout_secs, None);
        assert_eq!(config.alerts, AlertThresholds::default());
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_variable_parsing() {
        let _guards = [
            EnvGuard::set("HEARTH_MONITOR_INTERVAL_MS", "250"),
            EnvGuard::set("HEARTH_MAX_HISTORY_SAMPLES", "1000"),
            EnvGuard::set("HEARTH_THREADS", "6"),
            EnvGuard::set("HEARTH_REQUEST_TIMEOUT_SECS", "45"),
            EnvGuard::set("HEARTH_ALERT_RAM_PERCENT", "80.5"),
            EnvGuard::set("HEARTH_LOG_LEVEL", "DEBUG"),
        ];

        let config = RuntimeConfig::from_env().unwrap();

        assert_eq!(config.monitor_interval_ms, 250);
        assert_eq!(config.max_history_samples, 1000);
        assert_eq!(config.threads, 6);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.alerts.ram_percent, Some(80.5));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_unparsable_value_names_the_variable() {
        let _guard = EnvGuard::set("HEARTH_BATCH_SIZE", "lots");

        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("HEARTH_BATCH_SIZE"));
    }

    #[test]
    #[serial]
    fn test_from_env_validates() {
        let _guard = EnvGuard::set("HEARTH_MONITOR_INTERVAL_MS", "1");

        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("10ms"));
    }

    #[test]
    fn test_configuration_validation_invalid_log_level() {
        let config = RuntimeConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configuration_validation_alert_range() {
        let mut config = RuntimeConfig::default();
        config.alerts.vram_percent = Some(120.0);

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("VRAM"));
    }

    #[test]
    fn test_history_capacity_bounded_by_max_samples() {
        let config = RuntimeConfig::default();
        // 24h at 100ms would be 864000 samples
        assert_eq!(config.history_capacity(), DEFAULT_MAX_HISTORY_SAMPLES);

        let config = RuntimeConfig {
            monitor_interval_ms: 1000,
            history_retention_secs: 60,
            ..Default::default()
        };
        assert_eq!(config.history_capacity(), 60);
    }

    #[test]
    fn test_config_display() {
        let config = RuntimeConfig::default();
        let display = format!("{}", config);
        assert!(display.contains("Hearth Configuration:"));
        assert!(display.contains("Monitor Interval: 100ms"));
        assert!(display.contains("Request Timeout: none"));

        let map = config.to_display_map();
        assert_eq!(map.get("batch_size").map(String::as_str), Some("256"));
    }
}
