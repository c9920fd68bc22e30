//! Event handlers attached to the bus

use crate::bus::EventBus;
use hearth_core::InferenceEvent;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Trait for consuming events off the feed
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &InferenceEvent);
}

/// Runs `handler` for every event on `bus` until the bus closes.
pub fn attach(bus: &EventBus, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
    let mut subscription = bus.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            handler.on_event(&envelope.event);
        }
        if subscription.missed() > 0 {
            warn!(missed = subscription.missed(), "Event handler fell behind");
        }
    })
}

/// Handler that logs events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &InferenceEvent) {
        match event {
            InferenceEvent::ModelLoadStarted { model_id, backend } => {
                info!(model_id = %model_id, backend = %backend, "Loading model");
            }
            InferenceEvent::ModelLoadCompleted {
                model_id,
                instance_id,
                duration_ms,
                ram_bytes,
                vram_bytes,
                gpu_layers,
                context_size,
            } => {
                info!(
                    model_id = %model_id,
                    instance_id = %instance_id,
                    duration_ms,
                    ram_bytes,
                    vram_bytes,
                    gpu_layers,
                    context_size,
                    "Model loaded"
                );
            }
            InferenceEvent::ModelLoadFailed { model_id, error } => {
                warn!(model_id = %model_id, error = %error, "Model load failed");
            }
            InferenceEvent::ModelUnloaded {
                model_id,
                instance_id,
            } => {
                info!(model_id = %model_id, instance_id = %instance_id, "Model unloaded");
            }
            InferenceEvent::ActiveModelChanged { previous, current } => {
                info!(previous = ?previous, current = ?current, "Active model changed");
            }
            InferenceEvent::GenerationStarted {
                request_id,
                model_id,
                prompt_tokens,
                max_tokens,
            } => {
                debug!(
                    request_id = %request_id,
                    model_id = %model_id,
                    prompt_tokens,
                    max_tokens,
                    "Generation started"
                );
            }
            InferenceEvent::GenerationChunk {
                request_id,
                token_index,
                ..
            } => {
                tracing::trace!(request_id = %request_id, token_index, "Chunk");
            }
            InferenceEvent::GenerationCompleted {
                request_id,
                model_id,
                usage,
                finish_reason,
                metrics,
            } => {
                info!(
                    request_id = %request_id,
                    model_id = %model_id,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    finish_reason = ?finish_reason,
                    ttft_ms = ?metrics.time_to_first_token_ms,
                    tokens_per_second = metrics.tokens_per_second,
                    "Generation complete"
                );
            }
            InferenceEvent::GenerationFailed {
                request_id,
                model_id,
                error,
                cancelled,
            } => {
                if *cancelled {
                    info!(request_id = %request_id, model_id = %model_id, reason = %error, "Generation cancelled");
                } else {
                    warn!(request_id = %request_id, model_id = %model_id, error = %error, "Generation failed");
                }
            }
            InferenceEvent::EmbeddingFailed {
                model_id,
                inputs,
                error,
                cancelled,
            } => {
                if *cancelled {
                    info!(model_id = %model_id, inputs, reason = %error, "Embedding cancelled");
                } else {
                    warn!(model_id = %model_id, inputs, error = %error, "Embedding failed");
                }
            }
            InferenceEvent::ResourceAlert(alert) => {
                warn!(
                    kind = %alert.kind,
                    gpu_id = ?alert.gpu_id,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                );
            }
            InferenceEvent::ContextTruncated {
                model_id,
                removed_turns,
                removed_tokens,
                used_tokens,
            } => {
                debug!(
                    model_id = %model_id,
                    removed_turns,
                    removed_tokens,
                    used_tokens,
                    "Context truncated"
                );
            }
            InferenceEvent::ContextCleared {
                model_id,
                removed_tokens,
            } => {
                debug!(model_id = %model_id, removed_tokens, "Context cleared");
            }
            InferenceEvent::SnapshotSaved {
                model_id,
                snapshot_id,
                token_count,
                size_bytes,
            } => {
                info!(
                    model_id = %model_id,
                    snapshot_id = %snapshot_id,
                    token_count,
                    size_bytes,
                    "Context snapshot saved"
                );
            }
            InferenceEvent::SnapshotRestored {
                model_id,
                snapshot_id,
                token_count,
            } => {
                info!(
                    model_id = %model_id,
                    snapshot_id = %snapshot_id,
                    token_count,
                    "Context snapshot restored"
                );
            }
        }
    }
}
