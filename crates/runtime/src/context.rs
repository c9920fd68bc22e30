use crate::bus::EventBus;
use chrono::{DateTime, Utc};
use hearth_core::{InferenceEvent, MessageRole, Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Snapshot payload layout understood by this build.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: MessageRole,
    pub tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct ContextState {
    max_context_size: u32,
    kv_bytes_per_token: u64,
    turns: VecDeque<Turn>,
    used_tokens: u32,
}

impl ContextState {
    fn kv_cache_bytes(&self) -> u64 {
        u64::from(self.used_tokens) * self.kv_bytes_per_token
    }

    /// Drops whole turns, oldest first, until at most `keep` tokens remain.
    fn truncate_to(&mut self, keep: u32) -> (usize, u32) {
        let mut removed_turns = 0;
        let mut removed_tokens = 0;
        while self.used_tokens > keep {
            let Some(turn) = self.turns.pop_front() else {
                break;
            };
            self.used_tokens -= turn.tokens;
            removed_turns += 1;
            removed_tokens += turn.tokens;
        }
        (removed_turns, removed_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextStatus {
    pub model_id: String,
    pub max_tokens: u32,
    pub used_tokens: u32,
    pub available_tokens: u32,
    pub percent_used: f32,
    pub kv_cache_bytes: u64,
    pub turns: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub removed_turns: usize,
    pub removed_tokens: u32,
    pub used_tokens: u32,
}

/// Outcome of admitting a prompt into a model's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub truncation: Option<Truncation>,
    /// Tokens the completion may use without overflowing the context.
    pub completion_budget: u32,
}

/// Immutable capture of a context, produced by `save_snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub model_id: String,
    pub token_count: u32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    model_id: String,
    kv_bytes_per_token: u64,
    turns: Vec<Turn>,
}

/// Owns one context per loaded model.
#[derive(Clone)]
pub struct ContextManager {
    contexts: Arc<Mutex<HashMap<String, Arc<Mutex<ContextState>>>>>,
    bus: EventBus,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ContextManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Creates an empty context, replacing any previous one for `model_id`.
    pub fn create(&self, model_id: &str, max_context_size: u32, kv_bytes_per_token: u64) {
        let state = ContextState {
            max_context_size,
            kv_bytes_per_token,
            turns: VecDeque::new(),
            used_tokens: 0,
        };
        lock(&self.contexts).insert(model_id.to_string(), Arc::new(Mutex::new(state)));
        debug!(model_id = %model_id, max_context_size, "Context created");
    }

    pub fn remove(&self, model_id: &str) -> bool {
        lock(&self.contexts).remove(model_id).is_some()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        lock(&self.contexts).contains_key(model_id)
    }

    fn state(&self, model_id: &str) -> Result<Arc<Mutex<ContextState>>> {
        lock(&self.contexts)
            .get(model_id)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(model_id))
    }

    pub fn status(&self, model_id: &str) -> Result<ContextStatus> {
        let state = self.state(model_id)?;
        let state = lock(&state);
        Ok(status_of(model_id, &state))
    }

    /// Empties the context and its KV cache.
    pub fn clear(&self, model_id: &str) -> Result<u32> {
        let state = self.state(model_id)?;
        let removed_tokens = {
            let mut state = lock(&state);
            let removed = state.used_tokens;
            state.turns.clear();
            state.used_tokens = 0;
            removed
        };
        self.bus.publish(InferenceEvent::ContextCleared {
            model_id: model_id.to_string(),
            removed_tokens,
        });
        Ok(removed_tokens)
    }

    /// Removes the oldest whole turns until at most `keep_tokens` remain.
    pub fn truncate(&self, model_id: &str, keep_tokens: u32) -> Result<Truncation> {
        let state = self.state(model_id)?;
        let truncation = {
            let mut state = lock(&state);
            let (removed_turns, removed_tokens) = state.truncate_to(keep_tokens);
            Truncation {
                removed_turns,
                removed_tokens,
                used_tokens: state.used_tokens,
            }
        };
        if truncation.removed_turns > 0 {
            self.publish_truncation(model_id, &truncation);
        }
        Ok(truncation)
    }

    /// Makes room for a prompt of `prompt_tokens`, truncating old turns as needed.
    ///
    /// At least one completion token must fit. A prompt that cannot fit even in
    /// an empty context fails with `ContextTooLarge` and leaves the context as is.
    pub fn admit(
        &self,
        model_id: &str,
        prompt_tokens: u32,
        max_tokens: Option<u32>,
    ) -> Result<Admission> {
        let state = self.state(model_id)?;
        let (truncation, completion_budget) = {
            let mut state = lock(&state);
            let max = state.max_context_size;
            if prompt_tokens >= max {
                return Err(RuntimeError::ContextTooLarge {
                    required: prompt_tokens,
                    max,
                });
            }

            let keep = max - prompt_tokens - 1;
            let truncation = if state.used_tokens > keep {
                let (removed_turns, removed_tokens) = state.truncate_to(keep);
                Some(Truncation {
                    removed_turns,
                    removed_tokens,
                    used_tokens: state.used_tokens,
                })
            } else {
                None
            };

            let room = max - state.used_tokens - prompt_tokens;
            let budget = max_tokens.map_or(room, |requested| requested.min(room));
            (truncation, budget)
        };

        if let Some(truncation) = &truncation {
            self.publish_truncation(model_id, truncation);
        }
        Ok(Admission {
            truncation,
            completion_budget,
        })
    }

    /// Records a finished exchange. Older turns make way if concurrent
    /// requests filled the context in the meantime.
    pub fn append_exchange(
        &self,
        model_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<u32> {
        let state = self.state(model_id)?;
        let (truncation, used) = {
            let mut state = lock(&state);
            let max = state.max_context_size;
            let mut prompt = prompt_tokens;
            let mut completion = completion_tokens;
            if prompt.saturating_add(completion) > max {
                warn!(
                    model_id = %model_id,
                    prompt_tokens,
                    completion_tokens,
                    max,
                    "Exchange exceeds context, clipping"
                );
                prompt = prompt.min(max);
                completion = completion.min(max - prompt);
            }

            let incoming = prompt + completion;
            let truncation = if state.used_tokens + incoming > max {
                let (removed_turns, removed_tokens) = state.truncate_to(max - incoming);
                Some(Truncation {
                    removed_turns,
                    removed_tokens,
                    used_tokens: state.used_tokens,
                })
            } else {
                None
            };

            for (role, tokens) in [(MessageRole::User, prompt), (MessageRole::Assistant, completion)] {
                if tokens > 0 {
                    state.turns.push_back(Turn { role, tokens });
                    state.used_tokens += tokens;
                }
            }
            (truncation, state.used_tokens)
        };

        if let Some(truncation) = &truncation {
            self.publish_truncation(model_id, truncation);
        }
        Ok(used)
    }

    /// Serializes the context without changing it.
    pub fn save_snapshot(&self, model_id: &str) -> Result<ContextSnapshot> {
        let state = self.state(model_id)?;
        let (payload, token_count, size_bytes) = {
            let state = lock(&state);
            let payload = SnapshotPayload {
                model_id: model_id.to_string(),
                kv_bytes_per_token: state.kv_bytes_per_token,
                turns: state.turns.iter().copied().collect(),
            };
            let bytes = bincode::serialize(&payload).map_err(|e| {
                RuntimeError::invalid(format!("failed to encode snapshot: {}", e))
            })?;
            (bytes, state.used_tokens, state.kv_cache_bytes())
        };

        let snapshot = ContextSnapshot {
            id: Uuid::new_v4().to_string(),
            model_id: model_id.to_string(),
            token_count,
            size_bytes,
            created_at: Utc::now(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            payload,
        };
        self.bus.publish(InferenceEvent::SnapshotSaved {
            model_id: model_id.to_string(),
            snapshot_id: snapshot.id.clone(),
            token_count,
            size_bytes,
        });
        Ok(snapshot)
    }

    /// Replaces the live context with the snapshot's contents.
    pub fn restore_snapshot(
        &self,
        model_id: &str,
        snapshot: &ContextSnapshot,
    ) -> Result<ContextStatus> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(RuntimeError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: snapshot.format_version,
            });
        }
        let payload: SnapshotPayload = bincode::deserialize(&snapshot.payload)
            .map_err(|e| RuntimeError::invalid(format!("corrupt snapshot payload: {}", e)))?;
        if payload.model_id != model_id || snapshot.model_id != model_id {
            return Err(RuntimeError::invalid(format!(
                "snapshot belongs to model {}, not {}",
                payload.model_id, model_id
            )));
        }

        let used: u64 = payload.turns.iter().map(|t| u64::from(t.tokens)).sum();
        let state = self.state(model_id)?;
        let status = {
            let mut state = lock(&state);
            if used > u64::from(state.max_context_size) {
                return Err(RuntimeError::ContextTooLarge {
                    required: u32::try_from(used).unwrap_or(u32::MAX),
                    max: state.max_context_size,
                });
            }
            state.turns = payload.turns.into_iter().collect();
            state.used_tokens = used as u32;
            state.kv_bytes_per_token = payload.kv_bytes_per_token;
            status_of(model_id, &state)
        };

        self.bus.publish(InferenceEvent::SnapshotRestored {
            model_id: model_id.to_string(),
            snapshot_id: snapshot.id.clone(),
            token_count: status.used_tokens,
        });
        Ok(status)
    }

    fn publish_truncation(&self, model_id: &str, truncation: &Truncation) {
        debug!(
            model_id = %model_id,
            removed_turns = truncation.removed_turns,
            removed_tokens = truncation.removed_tokens,
            "Context truncated"
        );
        self.bus.publish(InferenceEvent::ContextTruncated {
            model_id: model_id.to_string(),
            removed_turns: truncation.removed_turns,
            removed_tokens: truncation.removed_tokens,
            used_tokens: truncation.used_tokens,
        });
    }

    #[cfg(test)]
    fn push_turns(&self, model_id: &str, sizes: &[u32]) {
        let state = self.state(model_id).unwrap();
        let mut state = lock(&state);
        for &tokens in sizes {
            state.turns.push_back(Turn {
                role: MessageRole::User,
                tokens,
            });
            state.used_tokens += tokens;
        }
    }
}

fn status_of(model_id: &str, state: &ContextState) -> ContextStatus {
    let max = state.max_context_size;
    ContextStatus {
        model_id: model_id.to_string(),
        max_tokens: max,
        used_tokens: state.used_tokens,
        available_tokens: max - state.used_tokens,
        percent_used: if max == 0 {
            0.0
        } else {
            state.used_tokens as f32 / max as f32 * 100.0
        },
        kv_cache_bytes: state.kv_cache_bytes(),
        turns: state.turns.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ContextManager, EventBus) {
        let bus = EventBus::new(64);
        let contexts = ContextManager::new(bus.clone());
        contexts.create("m1", 4096, 1024);
        (contexts, bus)
    }

    #[test]
    fn test_truncate_removes_oldest_whole_turns() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[1000, 1200, 900]);

        let truncation = contexts.truncate("m1", 2048).unwrap();
        assert_eq!(truncation.removed_turns, 2);
        assert_eq!(truncation.removed_tokens, 2200);
        assert_eq!(truncation.used_tokens, 900);

        let status = contexts.status("m1").unwrap();
        assert_eq!(status.used_tokens, 900);
        assert_eq!(status.turns, 1);
        assert_eq!(status.kv_cache_bytes, 900 * 1024);
    }

    #[test]
    fn test_truncate_noop_when_within_budget() {
        let (contexts, bus) = manager();
        let mut sub = bus.subscribe();
        contexts.push_turns("m1", &[100, 200]);

        let truncation = contexts.truncate("m1", 300).unwrap();
        assert_eq!(truncation.removed_turns, 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_admit_truncates_just_enough() {
        let (contexts, bus) = manager();
        let mut sub = bus.subscribe();
        contexts.push_turns("m1", &[1000, 1000, 1000, 1000]);

        let admission = contexts.admit("m1", 500, Some(256)).unwrap();
        let truncation = admission.truncation.unwrap();
        assert_eq!(truncation.removed_turns, 1);
        assert_eq!(truncation.used_tokens, 3000);
        assert_eq!(admission.completion_budget, 256);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event.name(), "context_truncated");
    }

    #[test]
    fn test_admit_caps_budget_to_room() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[3000]);

        let admission = contexts.admit("m1", 1000, None).unwrap();
        assert!(admission.truncation.is_none());
        assert_eq!(admission.completion_budget, 96);

        let admission = contexts.admit("m1", 1000, Some(10_000)).unwrap();
        assert_eq!(admission.completion_budget, 96);
    }

    #[test]
    fn test_oversized_prompt_leaves_context_untouched() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[100]);

        let err = contexts.admit("m1", 5000, None).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ContextTooLarge {
                required: 5000,
                max: 4096
            }
        ));
        assert_eq!(contexts.status("m1").unwrap().used_tokens, 100);
    }

    #[test]
    fn test_append_keeps_invariant() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[2000, 1500]);

        let used = contexts.append_exchange("m1", 400, 300).unwrap();
        assert!(used <= 4096);
        assert_eq!(used, 1500 + 700);

        let used = contexts.append_exchange("m1", 5000, 10).unwrap();
        assert_eq!(used, 4096);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[300, 700]);
        let before = contexts.status("m1").unwrap();

        let snapshot = contexts.save_snapshot("m1").unwrap();
        assert_eq!(snapshot.token_count, 1000);
        assert_eq!(contexts.status("m1").unwrap(), before);

        contexts.clear("m1").unwrap();
        assert_eq!(contexts.status("m1").unwrap().used_tokens, 0);

        let restored = contexts.restore_snapshot("m1", &snapshot).unwrap();
        assert_eq!(restored.used_tokens, before.used_tokens);
        assert_eq!(restored.kv_cache_bytes, before.kv_cache_bytes);
        assert_eq!(restored.turns, 2);
    }

    #[test]
    fn test_restore_rejects_other_version() {
        let (contexts, _bus) = manager();
        let mut snapshot = contexts.save_snapshot("m1").unwrap();
        snapshot.format_version = 99;

        let err = contexts.restore_snapshot("m1", &snapshot).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: 99
            }
        ));
    }

    #[test]
    fn test_restore_rejects_foreign_model() {
        let (contexts, _bus) = manager();
        contexts.create("m2", 4096, 1024);
        let snapshot = contexts.save_snapshot("m1").unwrap();

        let err = contexts.restore_snapshot("m2", &snapshot).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn test_restore_into_smaller_context_fails() {
        let (contexts, _bus) = manager();
        contexts.push_turns("m1", &[3000]);
        let snapshot = contexts.save_snapshot("m1").unwrap();

        contexts.create("m1", 2048, 1024);
        let err = contexts.restore_snapshot("m1", &snapshot).unwrap_err();
        assert!(matches!(err, RuntimeError::ContextTooLarge { .. }));
        assert_eq!(contexts.status("m1").unwrap().used_tokens, 0);
    }

    #[test]
    fn test_unknown_model() {
        let (contexts, _bus) = manager();
        assert!(matches!(
            contexts.status("nope"),
            Err(RuntimeError::NotFound { .. })
        ));
    }
}
