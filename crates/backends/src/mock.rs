//! Scripted in-process backend for tests and dry runs.

use async_trait::async_trait;
use hearth_core::{
    BackendCapabilities, BackendError, BackendModel, BackendRequest, BackendResources,
    BackendRunStats, FinishReason, InferenceBackend, WeightLoadSpec,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One scripted generation.
#[derive(Debug, Clone, PartialEq)]
pub struct MockRun {
    pub tokens: Vec<String>,
    /// Fails after emitting this many tokens.
    pub fail_after: Option<(usize, BackendError)>,
    pub panic: bool,
}

impl MockRun {
    pub fn tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            fail_after: None,
            panic: false,
        }
    }

    /// Splits `text` on whitespace, keeping the separator on the following token.
    pub fn text(text: &str) -> Self {
        let mut tokens = Vec::new();
        for (i, word) in text.split(' ').enumerate() {
            tokens.push(if i == 0 {
                word.to_string()
            } else {
                format!(" {}", word)
            });
        }
        Self::tokens(tokens)
    }

    pub fn error(error: BackendError) -> Self {
        Self {
            tokens: Vec::new(),
            fail_after: Some((0, error)),
            panic: false,
        }
    }

    pub fn failing_after(mut self, emitted: usize, error: BackendError) -> Self {
        self.fail_after = Some((emitted, error));
        self
    }

    pub fn panicking() -> Self {
        Self {
            tokens: Vec::new(),
            fail_after: None,
            panic: true,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicUsize,
    runs: AtomicUsize,
    embeds: AtomicUsize,
    unloads: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

#[derive(Debug)]
struct Script {
    runs: VecDeque<MockRun>,
    fallback: MockRun,
    token_delay: Duration,
    load_delay: Duration,
    load_failures: VecDeque<BackendError>,
    embed_error: Option<BackendError>,
    unload_error: Option<BackendError>,
    resources: Option<BackendResources>,
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    counters: Counters,
    dimensions: usize,
}

/// Scripted backend. Runs pop from a queue and fall back to a fixed reply
/// once it is empty. Clones share the same script and counters.
#[derive(Debug, Clone)]
pub struct MockBackend {
    name: String,
    capabilities: BackendCapabilities,
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_name("mock")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BackendCapabilities {
                supports_concurrent_requests: true,
                supports_streaming: true,
                supports_embeddings: true,
            },
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    runs: VecDeque::new(),
                    fallback: MockRun::text("mock response"),
                    token_delay: Duration::ZERO,
                    load_delay: Duration::ZERO,
                    load_failures: VecDeque::new(),
                    embed_error: None,
                    unload_error: None,
                    resources: None,
                }),
                counters: Counters::default(),
                dimensions: 8,
            }),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Serves one request at a time and cannot embed.
    pub fn serialized(self) -> Self {
        self.with_capabilities(BackendCapabilities::default())
    }

    pub fn with_token_delay(self, delay: Duration) -> Self {
        lock(&self.shared.script).token_delay = delay;
        self
    }

    pub fn with_load_delay(self, delay: Duration) -> Self {
        lock(&self.shared.script).load_delay = delay;
        self
    }

    pub fn with_fallback(self, run: MockRun) -> Self {
        lock(&self.shared.script).fallback = run;
        self
    }

    pub fn with_resources(self, resources: BackendResources) -> Self {
        lock(&self.shared.script).resources = Some(resources);
        self
    }

    pub fn add_run(&self, run: MockRun) {
        lock(&self.shared.script).runs.push_back(run);
    }

    pub fn add_runs(&self, runs: impl IntoIterator<Item = MockRun>) {
        lock(&self.shared.script).runs.extend(runs);
    }

    pub fn fail_next_load(&self, error: BackendError) {
        lock(&self.shared.script).load_failures.push_back(error);
    }

    pub fn fail_embeddings(&self, error: Option<BackendError>) {
        lock(&self.shared.script).embed_error = error;
    }

    pub fn fail_unload(&self, error: Option<BackendError>) {
        lock(&self.shared.script).unload_error = error;
    }

    pub fn remaining_runs(&self) -> usize {
        lock(&self.shared.script).runs.len()
    }

    pub fn load_count(&self) -> usize {
        self.shared.counters.loads.load(Ordering::SeqCst)
    }

    pub fn run_count(&self) -> usize {
        self.shared.counters.runs.load(Ordering::SeqCst)
    }

    pub fn embed_count(&self) -> usize {
        self.shared.counters.embeds.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.shared.counters.unloads.load(Ordering::SeqCst)
    }

    /// Highest number of runs observed executing at once.
    pub fn peak_concurrent_runs(&self) -> usize {
        self.shared.counters.peak_running.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn load_weights(
        &self,
        spec: &WeightLoadSpec,
    ) -> Result<Arc<dyn BackendModel>, BackendError> {
        self.shared.counters.loads.fetch_add(1, Ordering::SeqCst);
        let (delay, failure) = {
            let mut script = lock(&self.shared.script);
            (script.load_delay, script.load_failures.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(Arc::new(MockModel {
            model_id: spec.model_id.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Weights handle issued by [`MockBackend`].
#[derive(Debug)]
pub struct MockModel {
    model_id: String,
    shared: Arc<Shared>,
}

impl MockModel {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

struct RunningGuard<'a>(&'a Counters);

impl<'a> RunningGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_running.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackendModel for MockModel {
    async fn run(
        &self,
        request: BackendRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<BackendRunStats, BackendError> {
        let counters = &self.shared.counters;
        counters.runs.fetch_add(1, Ordering::SeqCst);
        let _running = RunningGuard::enter(counters);

        let (run, delay) = {
            let mut script = lock(&self.shared.script);
            let run = script
                .runs
                .pop_front()
                .unwrap_or_else(|| script.fallback.clone());
            (run, script.token_delay)
        };
        if run.panic {
            panic!("scripted backend panic");
        }

        let mut emitted = 0u32;
        for (index, token) in run.tokens.into_iter().enumerate() {
            if let Some((after, error)) = &run.fail_after {
                if index == *after {
                    return Err(error.clone());
                }
            }
            if emitted >= request.max_tokens {
                return Ok(BackendRunStats {
                    prompt_tokens: None,
                    completion_tokens: Some(emitted),
                    finish_reason: Some(FinishReason::Length),
                });
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() || chunks.send(token).await.is_err() {
                return Err(BackendError::Cancelled);
            }
            emitted += 1;
        }
        if let Some((_, error)) = run.fail_after {
            return Err(error);
        }

        Ok(BackendRunStats {
            prompt_tokens: None,
            completion_tokens: Some(emitted),
            finish_reason: Some(FinishReason::Stop),
        })
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: CancellationToken,
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        self.shared.counters.embeds.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.shared.script).embed_error.clone() {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        Ok(texts
            .iter()
            .map(|text| pseudo_embedding(text, self.shared.dimensions))
            .collect())
    }

    async fn report_resources(&self) -> Result<BackendResources, BackendError> {
        lock(&self.shared.script)
            .resources
            .ok_or_else(|| BackendError::other("mock backend does not report resources"))
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.shared.counters.unloads.fetch_add(1, Ordering::SeqCst);
        match lock(&self.shared.script).unload_error.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Deterministic vector derived from the text bytes.
fn pseudo_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimensions];
    for (i, byte) in text.bytes().enumerate() {
        vector[i % dimensions] += f32::from(byte) / 255.0;
    }
    if vector.iter().all(|v| *v == 0.0) {
        vector[0] = 1.0;
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::{PromptInput, SamplingParams};
    use std::path::PathBuf;

    fn spec() -> WeightLoadSpec {
        WeightLoadSpec {
            model_id: "mock-7b".to_string(),
            path: PathBuf::from("mock-7b.gguf"),
            gpu_layers: 0,
            total_layers: Some(32),
            context_size: 2048,
            batch_size: 256,
            threads: 4,
            gpu_id: None,
            main_gpu: None,
            tensor_split: None,
        }
    }

    fn request(max_tokens: u32) -> BackendRequest {
        BackendRequest {
            request_id: "r1".to_string(),
            input: PromptInput::Prompt("hi".to_string()),
            sampling: SamplingParams::default(),
            max_tokens,
        }
    }

    async fn collect(model: &Arc<dyn BackendModel>, max_tokens: u32) -> (Vec<String>, Result<BackendRunStats, BackendError>) {
        let (tx, mut rx) = mpsc::channel(16);
        let result = model.run(request(max_tokens), tx, CancellationToken::new()).await;
        let mut tokens = Vec::new();
        while let Ok(token) = rx.try_recv() {
            tokens.push(token);
        }
        (tokens, result)
    }

    #[tokio::test]
    async fn test_scripted_runs_then_fallback() {
        let backend = MockBackend::new();
        backend.add_run(MockRun::tokens(["a", "b"]));
        let model = backend.load_weights(&spec()).await.unwrap();

        let (tokens, result) = collect(&model, 10).await;
        assert_eq!(tokens, vec!["a", "b"]);
        assert_eq!(result.unwrap().completion_tokens, Some(2));

        let (tokens, _) = collect(&model, 10).await;
        assert_eq!(tokens.concat(), "mock response");
        assert_eq!(backend.run_count(), 2);
        assert_eq!(backend.remaining_runs(), 0);
    }

    #[tokio::test]
    async fn test_run_honors_budget() {
        let backend = MockBackend::new().with_fallback(MockRun::text("one two three four"));
        let model = backend.load_weights(&spec()).await.unwrap();

        let (tokens, result) = collect(&model, 2).await;
        assert_eq!(tokens.len(), 2);
        assert_eq!(result.unwrap().finish_reason, Some(FinishReason::Length));
    }

    #[tokio::test]
    async fn test_failure_after_tokens() {
        let backend = MockBackend::new();
        backend.add_run(
            MockRun::tokens(["a", "b", "c"])
                .failing_after(1, BackendError::other("device lost")),
        );
        let model = backend.load_weights(&spec()).await.unwrap();

        let (tokens, result) = collect(&model, 10).await;
        assert_eq!(tokens, vec!["a"]);
        assert_eq!(result.unwrap_err(), BackendError::other("device lost"));
    }

    #[tokio::test]
    async fn test_load_failure_is_one_shot() {
        let backend = MockBackend::new();
        backend.fail_next_load(BackendError::TimeoutError { seconds: 5 });

        assert!(backend.load_weights(&spec()).await.is_err());
        assert!(backend.load_weights(&spec()).await.is_ok());
        assert_eq!(backend.load_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_delayed_run() {
        let backend = MockBackend::new().with_token_delay(Duration::from_secs(60));
        let model = backend.load_weights(&spec()).await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = model.run(request(10), tx, cancel).await;
        assert_eq!(result.unwrap_err(), BackendError::Cancelled);
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic() {
        let backend = MockBackend::new();
        let model = backend.load_weights(&spec()).await.unwrap();
        let texts = vec!["hello".to_string(), "hello".to_string(), String::new()];

        let vectors = model.embed(&texts, CancellationToken::new()).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        assert!(vectors.iter().all(|v| v.len() == 8));
        assert_eq!(vectors[2][0], 1.0);
    }

    #[tokio::test]
    async fn test_resources_unreported_by_default() {
        let backend = MockBackend::new();
        let model = backend.load_weights(&spec()).await.unwrap();
        assert!(model.report_resources().await.is_err());

        let backend = MockBackend::new().with_resources(BackendResources {
            ram_bytes: 1,
            vram_bytes: 2,
        });
        let model = backend.load_weights(&spec()).await.unwrap();
        assert_eq!(model.report_resources().await.unwrap().vram_bytes, 2);
    }

    #[test]
    fn test_serialized_capabilities() {
        let backend = MockBackend::with_name("single").serialized();
        assert_eq!(backend.name(), "single");
        assert!(!backend.capabilities().supports_concurrent_requests);
        assert!(!backend.capabilities().supports_embeddings);
    }
}
