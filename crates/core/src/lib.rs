pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod resources;
pub mod types;

pub use backend::{
    BackendCapabilities, BackendModel, BackendRequest, BackendResources, BackendRunStats,
    GpuSource, InferenceBackend, ModelStore, WeightLoadSpec,
};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{BackendError, CancelReason, Result, RuntimeError};
pub use events::{EventEnvelope, InferenceEvent};
pub use model::{
    LoadOptions, LoadedModel, ModelDescriptor, ModelMetrics, ModelResources, ModelStatus,
};
pub use resources::{
    AlertKind, AlertThresholds, FeasibilityReport, GpuDevice, GpuSample, ResourceAlert,
    ResourceIssue, ResourceKind, ResourceRequirements, ResourceSample,
};
pub use types::{
    ChatMessage, EmbeddingRequest, EmbeddingResult, FinishReason, GenerationChunk,
    GenerationMetrics, GenerationRequest, GenerationResult, MessageRole, PromptInput,
    SamplingParams, TokenUsage,
};
