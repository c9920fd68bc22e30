use crate::bus::{EventBus, EventSubscription};
use crate::context::ContextManager;
use crate::events::{self, EventHandler};
use crate::loader::{BackendSet, LoadPlan, LoaderDefaults, ModelLoader};
use crate::registry::{ModelRegistry, ModelSlot};
use futures_util::future::{self, FutureExt};
use futures_util::Stream;
use hearth_core::types::{estimate_tokens, l2_normalize};
use hearth_core::{
    AlertThresholds, BackendError, BackendModel, BackendRequest, BackendRunStats, CancelReason,
    EmbeddingRequest, EmbeddingResult, FeasibilityReport, FinishReason, GenerationChunk,
    GenerationMetrics, GenerationRequest, GenerationResult, GpuSource, InferenceBackend,
    InferenceEvent, LoadOptions, LoadedModel, ModelStore, PromptInput,
    ResourceAlert, ResourceRequirements, ResourceSample, Result, RuntimeConfig, RuntimeError,
    SamplingParams, TokenUsage,
};
use hearth_monitor::{AlertHandler, MonitorSettings, ResourceMonitor, RuntimeGauges, SystemProbe};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunks buffered between the generation task and the caller.
const CHUNK_BUFFER: usize = 32;
/// Tokens buffered between the backend and the generation task.
const TOKEN_BUFFER: usize = 64;

struct BusAlerts(EventBus);

impl AlertHandler for BusAlerts {
    fn on_alert(&self, alert: &ResourceAlert) {
        self.0.publish(InferenceEvent::ResourceAlert(alert.clone()));
    }
}

pub struct InferenceManagerBuilder {
    config: RuntimeConfig,
    backends: BackendSet,
    default_backend: Option<String>,
    store: Option<Arc<dyn ModelStore>>,
    gpus: Option<Arc<dyn GpuSource>>,
    probe: Option<Arc<dyn SystemProbe>>,
}

impl InferenceManagerBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backends.register(backend);
        self
    }

    pub fn default_backend(mut self, name: impl Into<String>) -> Self {
        self.default_backend = Some(name.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gpus(mut self, gpus: Arc<dyn GpuSource>) -> Self {
        self.gpus = Some(gpus);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(mut self) -> Result<InferenceManager> {
        self.config
            .validate()
            .map_err(|e| RuntimeError::invalid(e.to_string()))?;
        let store = self
            .store
            .ok_or_else(|| RuntimeError::invalid("a model store is required"))?;
        if self.backends.is_empty() {
            return Err(RuntimeError::invalid("at least one backend is required"));
        }
        if let Some(name) = &self.default_backend {
            self.backends.set_default(name)?;
        }

        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(hearth_monitor::SysinfoProbe::default()),
        };

        let bus = EventBus::new(self.config.event_buffer);
        let gauges = Arc::new(RuntimeGauges::new());
        let monitor = ResourceMonitor::new(
            probe,
            self.gpus,
            Arc::clone(&gauges),
            MonitorSettings::from(&self.config),
        );
        monitor.add_alert_handler(Arc::new(BusAlerts(bus.clone())));

        let registry = Arc::new(ModelRegistry::new());
        let contexts = ContextManager::new(bus.clone());
        let loader = Arc::new(ModelLoader::new(
            self.backends,
            store,
            monitor.clone(),
            Arc::clone(&registry),
            contexts.clone(),
            bus.clone(),
            LoaderDefaults {
                batch_size: self.config.batch_size,
                threads: self.config.threads,
            },
        ));

        Ok(InferenceManager {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                loader,
                contexts,
                monitor,
                bus,
                gauges,
            }),
        })
    }
}

struct Inner {
    config: RuntimeConfig,
    registry: Arc<ModelRegistry>,
    loader: Arc<ModelLoader>,
    contexts: ContextManager,
    monitor: ResourceMonitor,
    bus: EventBus,
    gauges: Arc<RuntimeGauges>,
}

/// Owns the loaded models and routes every request to their backends.
///
/// Cheap to clone; clones share the same models, monitor, and event feed.
#[derive(Clone)]
pub struct InferenceManager {
    inner: Arc<Inner>,
}

impl InferenceManager {
    pub fn builder() -> InferenceManagerBuilder {
        InferenceManagerBuilder {
            config: RuntimeConfig::default(),
            backends: BackendSet::new(),
            default_backend: None,
            store: None,
            gpus: None,
            probe: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Starts the resource monitor's periodic task.
    pub fn start(&self) {
        self.inner.monitor.start();
    }

    /// Stops monitoring and unloads every model.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.monitor.stop().await;
        self.unload_all().await
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.bus.subscribe()
    }

    /// Runs `handler` for every event until the manager is dropped.
    pub fn attach_handler(&self, handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        events::attach(&self.inner.bus, handler)
    }

    pub fn context(&self) -> &ContextManager {
        &self.inner.contexts
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.inner.monitor
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.inner.loader.backends().names()
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        self.inner.loader.store()
    }

    pub async fn load_model(&self, model_id: &str, options: LoadOptions) -> Result<LoadedModel> {
        self.inner.loader.load(model_id, options).await
    }

    /// Dry run of [`load_model`](Self::load_model): placement, memory estimate,
    /// and feasibility verdict. Nothing is registered and no event is emitted.
    pub async fn plan_load(&self, model_id: &str, options: &LoadOptions) -> Result<LoadPlan> {
        self.inner.loader.plan(model_id, options).await
    }

    /// Stops the model's requests, releases its weights, and forgets it.
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        let inner = &self.inner;
        let slot = inner
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| RuntimeError::not_found(model_id))?;
        let instance_id = slot.instance_id();

        let first = slot.begin_unload();
        debug!(model_id = %model_id, "Unloading, waiting for in-flight requests");
        slot.wait_idle().await;

        if first {
            if let Some(handle) = slot.handle() {
                if let Err(e) = handle.unload().await {
                    warn!(model_id = %model_id, error = %e, "Backend failed to release weights");
                }
            }
        }

        if !inner.registry.remove_instance(model_id, &instance_id).await {
            return Ok(());
        }
        inner.contexts.remove(model_id);
        if inner.registry.clear_active_if(model_id) {
            inner.bus.publish(InferenceEvent::ActiveModelChanged {
                previous: Some(model_id.to_string()),
                current: None,
            });
        }
        inner
            .gauges
            .set_active_models(inner.registry.loaded_count().await as u32);
        inner.bus.publish(InferenceEvent::ModelUnloaded {
            model_id: model_id.to_string(),
            instance_id,
        });
        Ok(())
    }

    pub async fn unload_all(&self) -> Result<()> {
        let ids = self.inner.registry.ids().await;
        let results = future::join_all(ids.iter().map(|id| self.unload_model(id))).await;
        results
            .into_iter()
            .filter(|r| !matches!(r, Err(RuntimeError::NotFound { .. })))
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
    }

    pub async fn list_models(&self) -> Vec<LoadedModel> {
        let mut models: Vec<LoadedModel> = self
            .inner
            .registry
            .slots()
            .await
            .iter()
            .map(|slot| slot.snapshot())
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    pub async fn get_model(&self, model_id: &str) -> Option<LoadedModel> {
        self.inner
            .registry
            .get(model_id)
            .await
            .map(|slot| slot.snapshot())
    }

    pub fn active_model(&self) -> Option<String> {
        self.inner.registry.active()
    }

    /// Points requests without a model id at `model_id`, which must be loaded.
    pub async fn set_active_model(&self, model_id: &str) -> Result<()> {
        let slot = self
            .inner
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| RuntimeError::not_found(model_id))?;
        let status = slot.status();
        if !status.accepts_requests() {
            return Err(RuntimeError::ModelUnavailable {
                model_id: model_id.to_string(),
                status,
            });
        }

        let previous = self.inner.registry.set_active(Some(model_id.to_string()));
        if previous.as_deref() != Some(model_id) {
            self.inner.bus.publish(InferenceEvent::ActiveModelChanged {
                previous,
                current: Some(model_id.to_string()),
            });
        }
        Ok(())
    }

    pub fn clear_active_model(&self) {
        if let Some(previous) = self.inner.registry.set_active(None) {
            self.inner.bus.publish(InferenceEvent::ActiveModelChanged {
                previous: Some(previous),
                current: None,
            });
        }
    }

    async fn resolve(&self, model_id: Option<&str>) -> Result<(String, Arc<ModelSlot>)> {
        let model_id = match model_id {
            Some(id) => id.to_string(),
            None => self.inner.registry.active().ok_or(RuntimeError::NoActiveModel)?,
        };
        let slot = self
            .inner
            .registry
            .get(&model_id)
            .await
            .ok_or_else(|| RuntimeError::not_found(&model_id))?;
        let status = slot.status();
        if !status.accepts_requests() {
            return Err(RuntimeError::ModelUnavailable { model_id, status });
        }
        Ok((model_id, slot))
    }

    /// Runs a generation to completion.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        self.generate_stream(request).await?.into_result().await
    }

    /// Starts a generation and returns its chunks as they are produced.
    ///
    /// Validation, routing, and context admission happen before this returns;
    /// a failure there emits no events and changes no state.
    pub async fn generate_stream(&self, request: GenerationRequest) -> Result<GenerationStream> {
        request.validate()?;
        let (model_id, slot) = self.resolve(request.model_id.as_deref()).await?;

        // The slot is claimed first so a model that started unloading is
        // refused before its context can be truncated.
        let (handle, cancel) = slot.begin_request()?;
        let guard = ActiveRequest::new(Arc::clone(&slot), Arc::clone(&self.inner.gauges));
        let prompt_tokens = request.input.estimated_tokens();
        let admission = match self
            .inner
            .contexts
            .admit(&model_id, prompt_tokens, request.max_tokens)
        {
            Ok(admission) => admission,
            Err(e) => {
                guard.withdraw();
                return Err(e);
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let budget = admission.completion_budget;
        self.inner.bus.publish(InferenceEvent::GenerationStarted {
            request_id: request_id.clone(),
            model_id: model_id.clone(),
            prompt_tokens,
            max_tokens: budget,
        });

        let (sender, receiver) = mpsc::channel(CHUNK_BUFFER);
        let task = GenerationTask {
            inner: Arc::clone(&self.inner),
            slot,
            handle,
            guard,
            request_id: request_id.clone(),
            model_id: model_id.clone(),
            input: request.input,
            sampling: request.sampling,
            budget,
            prompt_tokens,
            timeout: request.timeout.or_else(|| self.inner.config.request_timeout()),
            cancel: cancel.clone(),
            out: sender,
            admitted_at: Instant::now(),
        };
        tokio::spawn(task.run());

        Ok(GenerationStream {
            request_id,
            model_id,
            receiver,
            cancel,
            finished: false,
        })
    }

    /// Embeds every input. No context is consumed.
    pub async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResult> {
        request.validate()?;
        let (model_id, slot) = self.resolve(request.model_id.as_deref()).await?;
        if !slot.capabilities().supports_embeddings {
            return Err(RuntimeError::Unsupported(format!(
                "backend for {} does not produce embeddings",
                model_id
            )));
        }

        let (handle, cancel) = slot.begin_request()?;
        let guard = ActiveRequest::new(Arc::clone(&slot), Arc::clone(&self.inner.gauges));
        let started = Instant::now();
        let prompt_tokens: u32 = request.inputs.iter().map(|t| estimate_tokens(t)).sum();
        let timeout = request.timeout.or_else(|| self.inner.config.request_timeout());

        let outcome = run_embedding(&slot, handle, &request.inputs, &cancel, timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut embeddings) => {
                if request.normalize {
                    embeddings.iter_mut().for_each(|v| l2_normalize(v));
                }
                guard.finish(|record| record.metrics.record_embedding(prompt_tokens, elapsed_ms));
                let dimensions = embeddings.first().map_or(0, Vec::len);
                debug!(model_id = %model_id, inputs = embeddings.len(), dimensions, elapsed_ms, "Embedding complete");
                Ok(EmbeddingResult {
                    model_id,
                    embeddings,
                    dimensions,
                    prompt_tokens,
                    total_time_ms: elapsed_ms,
                })
            }
            Err(e) => {
                let cancelled = e.is_cancelled();
                let message = e.to_string();
                guard.finish(|record| {
                    if cancelled {
                        record.metrics.record_cancelled(&TokenUsage::default(), elapsed_ms);
                    } else {
                        record.metrics.record_failed(&TokenUsage::default(), elapsed_ms);
                        record.last_error = Some(message.clone());
                    }
                });
                self.inner.bus.publish(InferenceEvent::EmbeddingFailed {
                    model_id,
                    inputs: request.inputs.len(),
                    error: message,
                    cancelled,
                });
                Err(e)
            }
        }
    }

    /// Current host reading. Takes a fresh one when the monitor is not running.
    pub fn resource_usage(&self) -> ResourceSample {
        if self.inner.monitor.is_running() {
            self.inner.monitor.sample()
        } else {
            self.inner.monitor.tick()
        }
    }

    pub fn resource_history(&self, period: Duration) -> Vec<ResourceSample> {
        self.inner.monitor.history(period)
    }

    pub fn check_feasible(&self, requirements: &ResourceRequirements) -> FeasibilityReport {
        self.inner.monitor.check_feasible(requirements)
    }

    pub fn set_alert_thresholds(&self, thresholds: AlertThresholds) {
        self.inner.monitor.set_alert_thresholds(thresholds);
    }
}

async fn run_embedding(
    slot: &ModelSlot,
    handle: Arc<dyn BackendModel>,
    inputs: &[String],
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<Vec<Vec<f32>>> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancel_error(slot)),
        permit = slot.acquire_gate() => permit,
    };

    let call = handle.embed(inputs, cancel.clone());
    let vectors = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(cancel_error(slot)),
        _ = deadline(timeout) => {
            cancel.cancel();
            return Err(timed_out());
        }
        result = call => result?,
    };

    if vectors.len() != inputs.len() {
        return Err(RuntimeError::Backend(BackendError::InvalidResponse {
            message: format!(
                "expected {} embeddings, backend returned {}",
                inputs.len(),
                vectors.len()
            ),
            raw_response: None,
        }));
    }
    let dimensions = vectors.first().map_or(0, Vec::len);
    if vectors.iter().any(|v| v.len() != dimensions) {
        return Err(RuntimeError::Backend(BackendError::InvalidResponse {
            message: "embeddings have inconsistent dimensions".to_string(),
            raw_response: None,
        }));
    }
    Ok(vectors)
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => time::sleep(duration).await,
        None => future::pending::<()>().await,
    }
}

async fn deadline_at(at: Option<time::Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => future::pending::<()>().await,
    }
}

fn timed_out() -> RuntimeError {
    RuntimeError::Cancelled {
        reason: CancelReason::Timeout,
    }
}

fn cancel_error(slot: &ModelSlot) -> RuntimeError {
    let reason = if slot.is_unloading() {
        CancelReason::Unload
    } else {
        CancelReason::Caller
    };
    RuntimeError::Cancelled { reason }
}

/// Holds one admitted request against a model. Releasing it restores the
/// active count and `Ready` status; dropping it unreleased records a cancellation.
struct ActiveRequest {
    slot: Arc<ModelSlot>,
    gauges: Arc<RuntimeGauges>,
    released: bool,
}

impl ActiveRequest {
    fn new(slot: Arc<ModelSlot>, gauges: Arc<RuntimeGauges>) -> Self {
        gauges.request_started();
        Self {
            slot,
            gauges,
            released: false,
        }
    }

    fn finish(mut self, f: impl FnOnce(&mut LoadedModel)) {
        self.released = true;
        self.slot.end_request(f);
        self.gauges.request_finished();
    }

    /// Releases a request that was refused before it reached the backend.
    fn withdraw(self) {
        self.finish(|record| record.metrics.record_withdrawn());
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        if !self.released {
            self.slot
                .end_request(|record| record.metrics.record_cancelled(&TokenUsage::default(), 0));
            self.gauges.request_finished();
        }
    }
}

/// Incremental generation output. Dropping the stream cancels the request.
pub struct GenerationStream {
    request_id: String,
    model_id: String,
    receiver: mpsc::Receiver<Result<GenerationChunk>>,
    cancel: CancellationToken,
    finished: bool,
}

impl GenerationStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Signals cancellation. The stream then yields `Cancelled` once the
    /// request has been released.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into a single result.
    pub async fn into_result(mut self) -> Result<GenerationResult> {
        let mut text = String::new();
        while let Some(item) = self.receiver.recv().await {
            let chunk = item?;
            text.push_str(&chunk.text);
            if chunk.done {
                self.finished = true;
                return Ok(GenerationResult {
                    request_id: self.request_id.clone(),
                    model_id: self.model_id.clone(),
                    text,
                    usage: chunk.usage.unwrap_or_default(),
                    finish_reason: chunk.finish_reason.unwrap_or(FinishReason::Stop),
                    metrics: chunk.metrics.unwrap_or_default(),
                });
            }
        }
        Err(RuntimeError::Cancelled {
            reason: CancelReason::Caller,
        })
    }
}

impl Stream for GenerationStream {
    type Item = Result<GenerationChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if item.as_ref().map_or(true, |chunk| chunk.done) {
                    self.finished = true;
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

#[derive(Default)]
struct Progress {
    text: String,
    tokens: u32,
    first_token_at: Option<Instant>,
    stopped: Option<FinishReason>,
}

struct Completion {
    text: String,
    usage: TokenUsage,
    finish_reason: FinishReason,
    metrics: GenerationMetrics,
}

struct GenerationTask {
    inner: Arc<Inner>,
    slot: Arc<ModelSlot>,
    handle: Arc<dyn BackendModel>,
    guard: ActiveRequest,
    request_id: String,
    model_id: String,
    input: PromptInput,
    sampling: SamplingParams,
    budget: u32,
    prompt_tokens: u32,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    out: mpsc::Sender<Result<GenerationChunk>>,
    admitted_at: Instant,
}

impl GenerationTask {
    async fn run(self) {
        let mut progress = Progress::default();
        let outcome = self.drive(&mut progress).await;
        self.finish(outcome, progress).await;
    }

    async fn drive(&self, progress: &mut Progress) -> Result<Completion> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(cancel_error(&self.slot)),
            permit = self.slot.acquire_gate() => permit,
        };
        if self.cancel.is_cancelled() {
            return Err(cancel_error(&self.slot));
        }

        let backend_cancel = self.cancel.child_token();
        let (token_tx, mut token_rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let request = BackendRequest {
            request_id: self.request_id.clone(),
            input: self.input.clone(),
            sampling: self.sampling.clone(),
            max_tokens: self.budget,
        };
        let handle = Arc::clone(&self.handle);
        let run = AssertUnwindSafe(handle.run(request, token_tx, backend_cancel.clone()))
            .catch_unwind();
        tokio::pin!(run);
        let expires_at = self.timeout.map(|timeout| time::Instant::now() + timeout);
        let expiry = deadline_at(expires_at);
        tokio::pin!(expiry);

        let mut tokens_open = true;
        let stats = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    backend_cancel.cancel();
                    return Err(cancel_error(&self.slot));
                }
                _ = &mut expiry => {
                    self.cancel.cancel();
                    return Err(timed_out());
                }
                token = token_rx.recv(), if tokens_open => match token {
                    Some(text) => {
                        if self.on_token(progress, text, expires_at).await? {
                            backend_cancel.cancel();
                            break BackendRunStats::default();
                        }
                    }
                    None => tokens_open = false,
                },
                result = &mut run => {
                    if !self.cancel.is_cancelled() {
                        while let Ok(text) = token_rx.try_recv() {
                            if self.on_token(progress, text, expires_at).await? {
                                break;
                            }
                        }
                    }
                    break match result {
                        Ok(Ok(stats)) => stats,
                        Ok(Err(_)) | Err(_) if self.cancel.is_cancelled() => {
                            return Err(cancel_error(&self.slot));
                        }
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => {
                            return Err(RuntimeError::Backend(BackendError::other(
                                "backend panicked during generation",
                            )))
                        }
                    };
                }
            }
        };

        Ok(self.complete(progress, stats))
    }

    /// Forwards one token. Returns true once generation should stop.
    ///
    /// A caller that stops reading must not hold the request past its deadline,
    /// so the deadline also bounds the wait for channel capacity.
    async fn on_token(
        &self,
        progress: &mut Progress,
        token: String,
        expires_at: Option<time::Instant>,
    ) -> Result<bool> {
        if progress.stopped.is_some() {
            return Ok(true);
        }
        let now = Instant::now();
        progress.first_token_at.get_or_insert(now);

        let emitted_before = progress.text.len();
        progress.text.push_str(&token);
        let mut delta_end = progress.text.len();

        let stop_at = self
            .sampling
            .stop
            .iter()
            .filter_map(|stop| progress.text.find(stop.as_str()))
            .min();
        if let Some(pos) = stop_at {
            progress.stopped = Some(FinishReason::StopSequence);
            delta_end = pos.max(emitted_before);
            progress.text.truncate(delta_end);
        }

        let index = progress.tokens;
        progress.tokens += 1;
        if progress.stopped.is_none() && progress.tokens >= self.budget {
            progress.stopped = Some(FinishReason::Length);
        }

        let delta = progress.text[emitted_before..delta_end].to_string();
        if !delta.is_empty() {
            self.inner.bus.publish(InferenceEvent::GenerationChunk {
                request_id: self.request_id.clone(),
                model_id: self.model_id.clone(),
                token_index: index,
                text: delta.clone(),
            });
            let chunk = GenerationChunk {
                request_id: self.request_id.clone(),
                text: delta,
                token_index: index,
                done: false,
                finish_reason: None,
                usage: None,
                metrics: None,
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                _ = deadline_at(expires_at) => {
                    self.cancel.cancel();
                    return Err(timed_out());
                }
                sent = self.out.send(Ok(chunk)) => {
                    if sent.is_err() {
                        self.cancel.cancel();
                    }
                }
            }
        }

        Ok(progress.stopped.is_some())
    }

    fn complete(&self, progress: &mut Progress, stats: BackendRunStats) -> Completion {
        let finished_at = Instant::now();
        let completion_tokens = if progress.stopped.is_some() {
            progress.tokens
        } else {
            stats.completion_tokens.unwrap_or(progress.tokens)
        };
        let usage = TokenUsage {
            prompt_tokens: stats.prompt_tokens.unwrap_or(self.prompt_tokens),
            completion_tokens,
        };
        let finish_reason = progress
            .stopped
            .or(stats.finish_reason)
            .unwrap_or(if completion_tokens >= self.budget {
                FinishReason::Length
            } else {
                FinishReason::Stop
            });

        let total = finished_at.duration_since(self.admitted_at);
        let generation = match progress.first_token_at {
            Some(first) if finished_at.duration_since(first) >= Duration::from_millis(1) => {
                finished_at.duration_since(first)
            }
            _ => total,
        };
        let tokens_per_second = if generation.as_secs_f64() > 0.0 {
            f64::from(completion_tokens) / generation.as_secs_f64()
        } else {
            0.0
        };

        Completion {
            text: std::mem::take(&mut progress.text),
            usage,
            finish_reason,
            metrics: GenerationMetrics {
                time_to_first_token_ms: progress
                    .first_token_at
                    .map(|first| first.duration_since(self.admitted_at).as_millis() as u64),
                generation_time_ms: generation.as_millis() as u64,
                total_time_ms: total.as_millis() as u64,
                tokens_per_second,
            },
        }
    }

    async fn finish(self, outcome: Result<Completion>, progress: Progress) {
        let GenerationTask {
            inner,
            guard,
            request_id,
            model_id,
            out,
            admitted_at,
            ..
        } = self;
        let elapsed_ms = admitted_at.elapsed().as_millis() as u64;

        match outcome {
            Ok(completion) => {
                let used = match inner.contexts.append_exchange(
                    &model_id,
                    completion.usage.prompt_tokens,
                    completion.usage.completion_tokens,
                ) {
                    Ok(used) => Some(used),
                    Err(e) => {
                        debug!(model_id = %model_id, error = %e, "Context gone before exchange was recorded");
                        None
                    }
                };
                let usage = completion.usage;
                let metrics = completion.metrics;
                guard.finish(|record| {
                    record.metrics.record_completed(&usage, &metrics);
                    if let Some(used) = used {
                        record.resources.context_used = used;
                    }
                });
                inner.gauges.set_tokens_per_second(metrics.tokens_per_second);

                inner.bus.publish(InferenceEvent::GenerationCompleted {
                    request_id: request_id.clone(),
                    model_id: model_id.clone(),
                    usage,
                    finish_reason: completion.finish_reason,
                    metrics,
                });
                info!(
                    request_id = %request_id,
                    model_id = %model_id,
                    tokens = usage.completion_tokens,
                    chars = completion.text.len(),
                    "Generation finished"
                );
                let _ = out
                    .send(Ok(GenerationChunk {
                        request_id,
                        text: String::new(),
                        token_index: progress.tokens,
                        done: true,
                        finish_reason: Some(completion.finish_reason),
                        usage: Some(usage),
                        metrics: Some(metrics),
                    }))
                    .await;
            }
            Err(error) => {
                let cancelled = error.is_cancelled();
                let partial = TokenUsage {
                    prompt_tokens: 0,
                    completion_tokens: progress.tokens,
                };
                guard.finish(|record| {
                    if cancelled {
                        record.metrics.record_cancelled(&partial, elapsed_ms);
                    } else {
                        record.metrics.record_failed(&partial, elapsed_ms);
                        record.last_error = Some(error.to_string());
                    }
                });
                inner.bus.publish(InferenceEvent::GenerationFailed {
                    request_id,
                    model_id,
                    error: error.to_string(),
                    cancelled,
                });
                let _ = out.send(Err(error)).await;
            }
        }
    }
}
