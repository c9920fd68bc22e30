//! Boundary traits for the collaborators the runtime consumes but does not
//! implement: inference backends, model metadata stores, and GPU sources.

use crate::error::BackendError;
use crate::model::ModelDescriptor;
use crate::resources::{GpuDevice, GpuSample};
use crate::types::{FinishReason, PromptInput, SamplingParams};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a backend family can do. The manager branches on these flags, never
/// on backend identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    pub supports_concurrent_requests: bool,
    pub supports_streaming: bool,
    pub supports_embeddings: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self {
            supports_concurrent_requests: false,
            supports_streaming: true,
            supports_embeddings: false,
        }
    }
}

/// Fully resolved placement for one weight materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightLoadSpec {
    pub model_id: String,
    pub path: PathBuf,
    pub gpu_layers: u32,
    pub total_layers: Option<u32>,
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_id: Option<u32>,
    pub main_gpu: Option<u32>,
    pub tensor_split: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub request_id: String,
    pub input: PromptInput,
    pub sampling: SamplingParams,
    /// Completion budget after context accounting.
    pub max_tokens: u32,
}

/// What the backend reports once a run finishes. Missing counts are filled in
/// by the runtime from its own estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendRunStats {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResources {
    pub ram_bytes: u64,
    pub vram_bytes: u64,
}

/// A backend family able to materialize model weights.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    async fn load_weights(
        &self,
        spec: &WeightLoadSpec,
    ) -> Result<Arc<dyn BackendModel>, BackendError>;
}

/// Handle to weights materialized by a backend.
#[async_trait]
pub trait BackendModel: Send + Sync {
    /// Runs one generation, sending each token's text on `chunks` as it is
    /// produced. Implementations stop early once `cancel` fires and return
    /// `BackendError::Cancelled` (or the partial stats).
    async fn run(
        &self,
        request: BackendRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<BackendRunStats, BackendError>;

    async fn embed(
        &self,
        texts: &[String],
        cancel: CancellationToken,
    ) -> Result<Vec<Vec<f32>>, BackendError>;

    async fn report_resources(&self) -> Result<BackendResources, BackendError>;

    async fn unload(&self) -> Result<(), BackendError>;
}

/// Installed-model metadata lookup.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// `Ok(None)` means the id is unknown.
    async fn resolve(&self, model_id: &str) -> Result<Option<ModelDescriptor>, BackendError>;

    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError>;
}

/// Hardware capability source. Called from the monitor tick, so it is
/// synchronous.
pub trait GpuSource: Send + Sync {
    fn list_gpus(&self) -> Result<Vec<GpuDevice>, BackendError>;

    /// Live reading for one device. The default reports capacity only.
    fn sample_gpu(&self, device: &GpuDevice) -> Result<GpuSample, BackendError> {
        Ok(GpuSample::from_device(device))
    }

    /// Readings for every device, one entry per device in order. Sources whose
    /// query covers all devices at once should answer from a single query.
    fn sample_gpus(&self, devices: &[GpuDevice]) -> Vec<Result<GpuSample, BackendError>> {
        devices.iter().map(|device| self.sample_gpu(device)).collect()
    }
}
