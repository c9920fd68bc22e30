use crate::resources::ResourceAlert;
use crate::types::{FinishReason, GenerationMetrics, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events published on the manager's event feed.
///
/// For one request the feed carries `GenerationStarted`, then its chunks in
/// `token_index` order, then exactly one of `GenerationCompleted` or
/// `GenerationFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceEvent {
    ModelLoadStarted {
        model_id: String,
        backend: String,
    },
    ModelLoadCompleted {
        model_id: String,
        instance_id: String,
        duration_ms: u64,
        ram_bytes: u64,
        vram_bytes: u64,
        gpu_layers: u32,
        context_size: u32,
    },
    ModelLoadFailed {
        model_id: String,
        error: String,
    },
    ModelUnloaded {
        model_id: String,
        instance_id: String,
    },
    ActiveModelChanged {
        previous: Option<String>,
        current: Option<String>,
    },
    GenerationStarted {
        request_id: String,
        model_id: String,
        prompt_tokens: u32,
        max_tokens: u32,
    },
    GenerationChunk {
        request_id: String,
        model_id: String,
        token_index: u32,
        text: String,
    },
    GenerationCompleted {
        request_id: String,
        model_id: String,
        usage: TokenUsage,
        finish_reason: FinishReason,
        metrics: GenerationMetrics,
    },
    GenerationFailed {
        request_id: String,
        model_id: String,
        error: String,
        cancelled: bool,
    },
    /// Embeddings have no started or chunk events; only failures reach the feed.
    EmbeddingFailed {
        model_id: String,
        inputs: usize,
        error: String,
        cancelled: bool,
    },
    ResourceAlert(ResourceAlert),
    ContextTruncated {
        model_id: String,
        removed_turns: usize,
        removed_tokens: u32,
        used_tokens: u32,
    },
    ContextCleared {
        model_id: String,
        removed_tokens: u32,
    },
    SnapshotSaved {
        model_id: String,
        snapshot_id: String,
        token_count: u32,
        size_bytes: u64,
    },
    SnapshotRestored {
        model_id: String,
        snapshot_id: String,
        token_count: u32,
    },
}

impl InferenceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InferenceEvent::ModelLoadStarted { .. } => "model_load_started",
            InferenceEvent::ModelLoadCompleted { .. } => "model_load_completed",
            InferenceEvent::ModelLoadFailed { .. } => "model_load_failed",
            InferenceEvent::ModelUnloaded { .. } => "model_unloaded",
            InferenceEvent::ActiveModelChanged { .. } => "active_model_changed",
            InferenceEvent::GenerationStarted { .. } => "generation_started",
            InferenceEvent::GenerationChunk { .. } => "generation_chunk",
            InferenceEvent::GenerationCompleted { .. } => "generation_completed",
            InferenceEvent::GenerationFailed { .. } => "generation_failed",
            InferenceEvent::EmbeddingFailed { .. } => "embedding_failed",
            InferenceEvent::ResourceAlert(_) => "resource_alert",
            InferenceEvent::ContextTruncated { .. } => "context_truncated",
            InferenceEvent::ContextCleared { .. } => "context_cleared",
            InferenceEvent::SnapshotSaved { .. } => "snapshot_saved",
            InferenceEvent::SnapshotRestored { .. } => "snapshot_restored",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            InferenceEvent::GenerationStarted { request_id, .. }
            | InferenceEvent::GenerationChunk { request_id, .. }
            | InferenceEvent::GenerationCompleted { request_id, .. }
            | InferenceEvent::GenerationFailed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            InferenceEvent::ModelLoadStarted { model_id, .. }
            | InferenceEvent::ModelLoadCompleted { model_id, .. }
            | InferenceEvent::ModelLoadFailed { model_id, .. }
            | InferenceEvent::ModelUnloaded { model_id, .. }
            | InferenceEvent::GenerationStarted { model_id, .. }
            | InferenceEvent::GenerationChunk { model_id, .. }
            | InferenceEvent::GenerationCompleted { model_id, .. }
            | InferenceEvent::GenerationFailed { model_id, .. }
            | InferenceEvent::EmbeddingFailed { model_id, .. }
            | InferenceEvent::ContextTruncated { model_id, .. }
            | InferenceEvent::ContextCleared { model_id, .. }
            | InferenceEvent::SnapshotSaved { model_id, .. }
            | InferenceEvent::SnapshotRestored { model_id, .. } => Some(model_id),
            InferenceEvent::ActiveModelChanged { current, .. } => current.as_deref(),
            InferenceEvent::ResourceAlert(_) => None,
        }
    }

    /// Whether this event ends a generation request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InferenceEvent::GenerationCompleted { .. } | InferenceEvent::GenerationFailed { .. }
        )
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per manager, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: InferenceEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = InferenceEvent::ModelUnloaded {
            model_id: "m1".to_string(),
            instance_id: "abc".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "model_unloaded");
        assert_eq!(json["model_id"], "m1");
        assert_eq!(event.name(), "model_unloaded");
    }

    #[test]
    fn test_request_scoped_accessors() {
        let event = InferenceEvent::GenerationFailed {
            request_id: "r1".to_string(),
            model_id: "m1".to_string(),
            error: "boom".to_string(),
            cancelled: false,
        };
        assert_eq!(event.request_id(), Some("r1"));
        assert_eq!(event.model_id(), Some("m1"));
        assert!(event.is_terminal());

        let event = InferenceEvent::ActiveModelChanged {
            previous: Some("a".to_string()),
            current: None,
        };
        assert_eq!(event.request_id(), None);
        assert_eq!(event.model_id(), None);
        assert!(!event.is_terminal());
    }
}
