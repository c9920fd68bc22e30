use crate::backend::BackendCapabilities;
use crate::error::{Result, RuntimeError};
use crate::types::{GenerationMetrics, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// KV-cache cost assumed when the store does not advertise one
/// (f16 cache of a 7B-class model: 32 layers × 2 × 4096 × 2 bytes / 4 for GQA).
pub const DEFAULT_KV_BYTES_PER_TOKEN: u64 = 131_072;

/// Installed-model metadata as returned by a model store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub parameter_count: Option<u64>,
    pub max_context_size: u32,
    #[serde(default)]
    pub layer_count: Option<u32>,
    #[serde(default)]
    pub kv_bytes_per_token: Option<u64>,
    #[serde(default)]
    pub embedding_length: Option<u32>,
    #[serde(default)]
    pub quantization: Option<String>,
    /// Preferred backend family, when the artifact only runs on one.
    #[serde(default)]
    pub backend: Option<String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, size_bytes: u64, max_context_size: u32) -> Self {
        let id = id.into();
        Self {
            path: PathBuf::from(&id),
            id,
            size_bytes,
            parameter_count: None,
            max_context_size,
            layer_count: None,
            kv_bytes_per_token: None,
            embedding_length: None,
            quantization: None,
            backend: None,
        }
    }

    pub fn with_layers(mut self, layer_count: u32) -> Self {
        self.layer_count = Some(layer_count);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_kv_bytes_per_token(mut self, bytes: u64) -> Self {
        self.kv_bytes_per_token = Some(bytes);
        self
    }

    pub fn kv_bytes_per_token_or_default(&self) -> u64 {
        self.kv_bytes_per_token.unwrap_or(DEFAULT_KV_BYTES_PER_TOKEN)
    }
}

/// Per-load placement and sizing options. Unset fields take runtime defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Layers offloaded to GPU. Defaults to all layers when a GPU exists.
    pub gpu_layers: Option<u32>,
    /// KV-cache budget in tokens. Defaults to the model's maximum.
    pub context_size: Option<u32>,
    pub batch_size: Option<u32>,
    pub threads: Option<u32>,
    pub gpu_id: Option<u32>,
    pub main_gpu: Option<u32>,
    /// Per-GPU weights, passed to the backend untouched.
    pub tensor_split: Option<Vec<f32>>,
    /// Backend family to load with.
    pub backend: Option<String>,
}

impl LoadOptions {
    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = Some(layers);
        self
    }

    pub fn with_context_size(mut self, tokens: u32) -> Self {
        self.context_size = Some(tokens);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_size == Some(0) {
            return Err(RuntimeError::invalid("context_size must be at least 1"));
        }
        if self.batch_size == Some(0) {
            return Err(RuntimeError::invalid("batch_size must be at least 1"));
        }
        if self.threads == Some(0) {
            return Err(RuntimeError::invalid("threads must be at least 1"));
        }
        if let Some(split) = &self.tensor_split {
            if split.is_empty() {
                return Err(RuntimeError::invalid("tensor_split must not be empty"));
            }
            if split.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(RuntimeError::invalid(
                    "tensor_split weights must be finite and non-negative",
                ));
            }
            if split.iter().all(|w| *w == 0.0) {
                return Err(RuntimeError::invalid(
                    "tensor_split must assign weight to at least one GPU",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loading,
    Ready,
    Busy,
    Unloading,
    Error,
}

impl ModelStatus {
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        match (self, next) {
            (_, Error) => self != Error,
            (Loading, Ready) | (Loading, Unloading) => true,
            (Ready, Busy) | (Ready, Unloading) => true,
            (Busy, Ready) | (Busy, Unloading) => true,
            (Error, Unloading) => true,
            _ => false,
        }
    }

    /// Whether new requests may be admitted.
    pub fn accepts_requests(self) -> bool {
        matches!(self, ModelStatus::Ready | ModelStatus::Busy)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Loading => "loading",
            ModelStatus::Ready => "ready",
            ModelStatus::Busy => "busy",
            ModelStatus::Unloading => "unloading",
            ModelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Running totals for one loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    pub embedding_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_tokens_generated: u64,
    pub total_inference_time_ms: u64,
    pub average_tokens_per_second: f64,
    pub peak_tokens_per_second: f64,
    pub average_time_to_first_token_ms: f64,
    /// Completed requests that reported a first token.
    pub first_token_samples: u64,
}

impl ModelMetrics {
    pub fn record_admitted(&mut self) {
        self.total_requests += 1;
    }

    /// Undoes [`record_admitted`](Self::record_admitted) for a request refused at admission.
    pub fn record_withdrawn(&mut self) {
        self.total_requests = self.total_requests.saturating_sub(1);
    }

    /// Folds a completed generation into the cumulative averages.
    pub fn record_completed(&mut self, usage: &TokenUsage, metrics: &GenerationMetrics) {
        self.completed_requests += 1;
        self.total_prompt_tokens += u64::from(usage.prompt_tokens);
        self.total_tokens_generated += u64::from(usage.completion_tokens);
        self.total_inference_time_ms += metrics.total_time_ms;

        let n = self.completed_requests as f64;
        self.average_tokens_per_second +=
            (metrics.tokens_per_second - self.average_tokens_per_second) / n;
        if metrics.tokens_per_second > self.peak_tokens_per_second {
            self.peak_tokens_per_second = metrics.tokens_per_second;
        }

        if let Some(ttft) = metrics.time_to_first_token_ms {
            self.first_token_samples += 1;
            let k = self.first_token_samples as f64;
            self.average_time_to_first_token_ms +=
                (ttft as f64 - self.average_time_to_first_token_ms) / k;
        }
    }

    pub fn record_failed(&mut self, usage: &TokenUsage, elapsed_ms: u64) {
        self.failed_requests += 1;
        self.total_tokens_generated += u64::from(usage.completion_tokens);
        self.total_inference_time_ms += elapsed_ms;
    }

    pub fn record_cancelled(&mut self, usage: &TokenUsage, elapsed_ms: u64) {
        self.cancelled_requests += 1;
        self.total_tokens_generated += u64::from(usage.completion_tokens);
        self.total_inference_time_ms += elapsed_ms;
    }

    pub fn record_embedding(&mut self, prompt_tokens: u32, elapsed_ms: u64) {
        self.embedding_requests += 1;
        self.total_prompt_tokens += u64::from(prompt_tokens);
        self.total_inference_time_ms += elapsed_ms;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResources {
    pub ram_bytes: u64,
    pub vram_bytes: u64,
    pub gpu_layers: u32,
    pub total_layers: Option<u32>,
    pub context_size: u32,
    pub context_used: u32,
}

/// An in-memory, ready-to-run model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    /// Instance id, unique per successful or attempted load.
    pub id: String,
    pub model_id: String,
    pub descriptor: ModelDescriptor,
    pub options: LoadOptions,
    pub backend: String,
    pub capabilities: BackendCapabilities,
    pub status: ModelStatus,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub active_requests: u32,
    pub metrics: ModelMetrics,
    pub resources: ModelResources,
    pub last_error: Option<String>,
}

impl LoadedModel {
    /// Applies a status change, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ModelStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_only_leads_to_unloading() {
        assert!(ModelStatus::Error.can_transition_to(ModelStatus::Unloading));
        assert!(!ModelStatus::Error.can_transition_to(ModelStatus::Ready));
        assert!(!ModelStatus::Error.can_transition_to(ModelStatus::Busy));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for status in [
            ModelStatus::Loading,
            ModelStatus::Ready,
            ModelStatus::Busy,
            ModelStatus::Unloading,
        ] {
            assert!(status.can_transition_to(ModelStatus::Error));
        }
    }

    #[test]
    fn test_unloading_is_terminal() {
        assert!(!ModelStatus::Unloading.can_transition_to(ModelStatus::Ready));
        assert!(!ModelStatus::Unloading.can_transition_to(ModelStatus::Busy));
    }

    #[test]
    fn test_metrics_averages_and_peak() {
        let mut metrics = ModelMetrics::default();
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 20,
        };
        metrics.record_completed(
            &usage,
            &GenerationMetrics {
                time_to_first_token_ms: Some(100),
                generation_time_ms: 1000,
                total_time_ms: 1100,
                tokens_per_second: 20.0,
            },
        );
        metrics.record_completed(
            &usage,
            &GenerationMetrics {
                time_to_first_token_ms: None,
                generation_time_ms: 500,
                total_time_ms: 500,
                tokens_per_second: 40.0,
            },
        );

        assert_eq!(metrics.completed_requests, 2);
        assert_eq!(metrics.total_tokens_generated, 40);
        assert!((metrics.average_tokens_per_second - 30.0).abs() < 1e-9);
        assert_eq!(metrics.peak_tokens_per_second, 40.0);
        assert_eq!(metrics.first_token_samples, 1);
        assert!((metrics.average_time_to_first_token_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_options_validation() {
        assert!(LoadOptions::default().validate().is_ok());
        assert!(LoadOptions::default().with_context_size(0).validate().is_err());

        let options = LoadOptions {
            tensor_split: Some(vec![0.0, 0.0]),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = LoadOptions {
            tensor_split: Some(vec![0.7, 0.3]),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_descriptor_kv_default() {
        let descriptor = ModelDescriptor::new("m", 1, 2048);
        assert_eq!(
            descriptor.kv_bytes_per_token_or_default(),
            DEFAULT_KV_BYTES_PER_TOKEN
        );
        assert_eq!(
            descriptor.with_kv_bytes_per_token(64).kv_bytes_per_token_or_default(),
            64
        );
    }
}
