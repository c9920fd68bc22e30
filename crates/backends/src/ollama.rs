//! Ollama HTTP backend and model store.
//!
//! Weights live in the Ollama server process; "loading" a model pins it in
//! memory through `keep_alive` with the requested placement options, and
//! unloading sets `keep_alive` to zero. Generation streams NDJSON from
//! `/api/generate` (plain prompts) or `/api/chat` (chat transcripts).

use async_trait::async_trait;
use futures_util::StreamExt;
use hearth_core::{
    BackendCapabilities, BackendError, BackendModel, BackendRequest, BackendResources,
    BackendRunStats, FinishReason, InferenceBackend, ModelDescriptor, ModelStore, PromptInput,
    SamplingParams, WeightLoadSpec,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
/// Applies to connection setup and to non-streaming calls.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_KEEP_ALIVE: &str = "-1m";

/// Shared HTTP plumbing for the backend and the store.
pub struct OllamaClient {
    endpoint: String,
    http_client: Client,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_timeout(endpoint, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::ConfigurationError {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http_client,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// `Ok(false)` when the server is unreachable.
    pub async fn health_check(&self) -> Result<bool, BackendError> {
        let url = self.url("/api/version");
        debug!("Checking Ollama health at {}", url);

        match self.http_client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    warn!("Ollama health check failed with status: {}", response.status());
                }
                Ok(healthy)
            }
            Err(e) if e.is_timeout() || e.is_connect() => {
                warn!("Cannot reach Ollama at {}", self.endpoint);
                Ok(false)
            }
            Err(e) => Err(self.transport_error(e)),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            error!("Ollama request timed out after {:?}", self.timeout);
            BackendError::TimeoutError {
                seconds: self.timeout.as_secs(),
            }
        } else if e.is_connect() {
            error!("Cannot connect to Ollama at {}", self.endpoint);
            BackendError::NetworkError {
                message: format!("Connection failed: {}", e),
            }
        } else {
            error!("Ollama request error: {}", e);
            BackendError::NetworkError {
                message: format!("Request failed: {}", e),
            }
        }
    }

    async fn check_status(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("Ollama API returned error status {}: {}", status, body);
        Err(BackendError::ApiError {
            message: format!("HTTP {}: {}", status, body),
            status_code: Some(status.as_u16()),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        bounded: bool,
    ) -> Result<Response, BackendError> {
        let mut request = self.http_client.post(self.url(path)).json(body);
        if bounded {
            request = request.timeout(self.timeout);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        Self::check_status(response).await
    }

    async fn post_json<T: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, BackendError> {
        self.post(path, body, true).await?.json().await.map_err(|e| {
            error!("Failed to parse Ollama response: {}", e);
            BackendError::InvalidResponse {
                message: format!("JSON parse error: {}", e),
                raw_response: None,
            }
        })
    }

    async fn get_json<R: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<R, BackendError> {
        let response = self
            .http_client
            .get(self.url(path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        Self::check_status(response).await?.json().await.map_err(|e| {
            BackendError::InvalidResponse {
                message: format!("JSON parse error: {}", e),
                raw_response: None,
            }
        })
    }
}

impl fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OllamaClient")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Backend family that delegates to a running Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Arc<OllamaClient>,
    keep_alive: String,
}

impl OllamaBackend {
    pub fn new(client: Arc<OllamaClient>) -> Self {
        Self {
            client,
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
        }
    }

    /// Ollama duration string, e.g. `"30m"`. Negative values pin the model.
    pub fn with_keep_alive(mut self, keep_alive: impl Into<String>) -> Self {
        self.keep_alive = keep_alive.into();
        self
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_concurrent_requests: true,
            supports_streaming: true,
            supports_embeddings: true,
        }
    }

    async fn load_weights(
        &self,
        spec: &WeightLoadSpec,
    ) -> Result<Arc<dyn BackendModel>, BackendError> {
        let options = PlacementOptions::from(spec);
        let request = GenerateRequest {
            model: &spec.model_id,
            prompt: Some(""),
            stream: false,
            keep_alive: Some(Value::String(self.keep_alive.clone())),
            options: Some(GenerateOptions {
                placement: options.clone(),
                ..GenerateOptions::default()
            }),
            format: None,
        };

        let start = Instant::now();
        let response = self.client.post("/api/generate", &request, false).await;
        if let Err(BackendError::ApiError {
            status_code: Some(404),
            ..
        }) = &response
        {
            return Err(BackendError::other(format!(
                "Model '{}' not found. Please pull it with: ollama pull {}",
                spec.model_id, spec.model_id
            )));
        }
        response?;
        info!(
            model = %spec.model_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            num_gpu = spec.gpu_layers,
            num_ctx = spec.context_size,
            "Ollama model resident"
        );

        Ok(Arc::new(OllamaModel {
            client: Arc::clone(&self.client),
            model: spec.model_id.clone(),
            placement: options,
            keep_alive: self.keep_alive.clone(),
        }))
    }
}

/// A model pinned in the Ollama server.
#[derive(Debug)]
pub struct OllamaModel {
    client: Arc<OllamaClient>,
    model: String,
    placement: PlacementOptions,
    keep_alive: String,
}

impl OllamaModel {
    fn options(&self, sampling: &SamplingParams, max_tokens: u32) -> GenerateOptions {
        GenerateOptions {
            placement: self.placement.clone(),
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repeat_penalty: sampling.repeat_penalty,
            frequency_penalty: sampling.frequency_penalty,
            presence_penalty: sampling.presence_penalty,
            seed: sampling.seed,
            stop: (!sampling.stop.is_empty()).then(|| sampling.stop.clone()),
            num_predict: Some(max_tokens),
        }
    }

    async fn open_stream(&self, request: &BackendRequest) -> Result<Response, BackendError> {
        if request.sampling.grammar.is_some() {
            return Err(BackendError::ConfigurationError {
                message: "Ollama does not accept GBNF grammars; use a JSON schema".to_string(),
            });
        }
        let options = Some(self.options(&request.sampling, request.max_tokens));
        let format = request.sampling.json_schema.clone();
        let keep_alive = Some(Value::String(self.keep_alive.clone()));

        match &request.input {
            PromptInput::Prompt(prompt) => {
                let body = GenerateRequest {
                    model: &self.model,
                    prompt: Some(prompt),
                    stream: true,
                    keep_alive,
                    options,
                    format,
                };
                self.client.post("/api/generate", &body, false).await
            }
            PromptInput::Chat(messages) => {
                let body = ChatRequest {
                    model: &self.model,
                    messages: messages
                        .iter()
                        .map(|m| ChatTurn {
                            role: m.role.as_str(),
                            content: &m.content,
                        })
                        .collect(),
                    stream: true,
                    keep_alive,
                    options,
                    format,
                };
                self.client.post("/api/chat", &body, false).await
            }
        }
    }
}

#[async_trait]
impl BackendModel for OllamaModel {
    async fn run(
        &self,
        request: BackendRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<BackendRunStats, BackendError> {
        debug!(
            model = %self.model,
            request_id = %request.request_id,
            max_tokens = request.max_tokens,
            "Sending streaming request to Ollama"
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            response = self.open_stream(&request) => response?,
        };

        let mut body = response.bytes_stream();
        let mut lines = NdjsonLines::default();
        let mut stats = BackendRunStats::default();
        loop {
            let bytes = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                next = body.next() => match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => return Err(self.client.transport_error(e)),
                    None => break,
                },
            };
            for line in lines.push(&bytes) {
                let chunk = parse_stream_line(&line)?;
                if let Some(text) = chunk.text() {
                    if !text.is_empty() && chunks.send(text.to_string()).await.is_err() {
                        return Err(BackendError::Cancelled);
                    }
                }
                if chunk.done {
                    return Ok(chunk.stats());
                }
            }
        }
        if let Some(line) = lines.finish() {
            let chunk = parse_stream_line(&line)?;
            if let Some(text) = chunk.text() {
                if !text.is_empty() {
                    let _ = chunks.send(text.to_string()).await;
                }
            }
            stats = chunk.stats();
        }
        warn!(model = %self.model, "Ollama stream ended without a done marker");
        Ok(stats)
    }

    async fn embed(
        &self,
        texts: &[String],
        cancel: CancellationToken,
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
            keep_alive: Some(Value::String(self.keep_alive.clone())),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            response = self.client.post_json::<_, EmbedResponse>("/api/embed", &body) => response?,
        };
        Ok(response.embeddings)
    }

    async fn report_resources(&self) -> Result<BackendResources, BackendError> {
        let running: RunningModels = self.client.get_json("/api/ps").await?;
        running
            .models
            .iter()
            .find(|m| m.name == self.model || m.model == self.model)
            .map(|m| BackendResources {
                ram_bytes: m.size.saturating_sub(m.size_vram),
                vram_bytes: m.size_vram,
            })
            .ok_or_else(|| BackendError::InvalidResponse {
                message: format!("{} is not resident in Ollama", self.model),
                raw_response: None,
            })
    }

    async fn unload(&self) -> Result<(), BackendError> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: None,
            stream: false,
            keep_alive: Some(Value::from(0)),
            options: None,
            format: None,
        };
        self.client.post("/api/generate", &body, true).await?;
        debug!(model = %self.model, "Ollama model released");
        Ok(())
    }
}

/// Installed-model metadata from `/api/tags` and `/api/show`.
#[derive(Debug, Clone)]
pub struct OllamaModelStore {
    client: Arc<OllamaClient>,
}

impl OllamaModelStore {
    pub fn new(client: Arc<OllamaClient>) -> Self {
        Self { client }
    }

    async fn tags(&self) -> Result<Vec<TagEntry>, BackendError> {
        let tags: Tags = self.client.get_json("/api/tags").await?;
        Ok(tags.models)
    }

    async fn show(&self, model: &str, size_bytes: u64) -> Result<ModelDescriptor, BackendError> {
        let show: ShowResponse = self.client.post_json("/api/show", &ShowRequest { model }).await?;
        Ok(show.into_descriptor(model, size_bytes))
    }
}

#[async_trait]
impl ModelStore for OllamaModelStore {
    async fn resolve(&self, model_id: &str) -> Result<Option<ModelDescriptor>, BackendError> {
        let tags = self.tags().await?;
        let Some(entry) = tags
            .iter()
            .find(|t| t.name == model_id || t.name == format!("{}:latest", model_id))
        else {
            return Ok(None);
        };
        match self.show(model_id, entry.size).await {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(BackendError::ApiError {
                status_code: Some(code),
                ..
            }) if code == StatusCode::NOT_FOUND.as_u16() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        let mut models = Vec::new();
        for entry in self.tags().await? {
            models.push(self.show(&entry.name, entry.size).await?);
        }
        Ok(models)
    }
}

/// Hardware placement shared by the load call and every request, so Ollama
/// never reloads the model with different parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct PlacementOptions {
    num_ctx: u32,
    num_gpu: u32,
    num_batch: u32,
    num_thread: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    main_gpu: Option<u32>,
}

impl From<&WeightLoadSpec> for PlacementOptions {
    fn from(spec: &WeightLoadSpec) -> Self {
        Self {
            num_ctx: spec.context_size,
            num_gpu: spec.gpu_layers,
            num_batch: spec.batch_size,
            num_thread: spec.threads,
            main_gpu: spec.main_gpu.or(spec.gpu_id),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct GenerateOptions {
    #[serde(flatten)]
    placement: PlacementOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatTurn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: String,
}

/// One NDJSON line from `/api/generate` or `/api/chat`.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    message: Option<ChatContent>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl StreamChunk {
    fn text(&self) -> Option<&str> {
        self.response
            .as_deref()
            .or_else(|| self.message.as_ref().map(|m| m.content.as_str()))
    }

    fn stats(&self) -> BackendRunStats {
        BackendRunStats {
            prompt_tokens: self.prompt_eval_count,
            completion_tokens: self.eval_count,
            finish_reason: match self.done_reason.as_deref() {
                Some("length") => Some(FinishReason::Length),
                Some("stop") => Some(FinishReason::Stop),
                _ => None,
            },
        }
    }
}

fn parse_stream_line(line: &str) -> Result<StreamChunk, BackendError> {
    let chunk: StreamChunk =
        serde_json::from_str(line).map_err(|e| BackendError::InvalidResponse {
            message: format!("JSON parse error: {}", e),
            raw_response: Some(line.chars().take(200).collect()),
        })?;
    if let Some(message) = chunk.error {
        return Err(BackendError::ApiError {
            message,
            status_code: None,
        });
    }
    Ok(chunk)
}

/// Reassembles newline-delimited records split across body chunks.
#[derive(Debug, Default)]
struct NdjsonLines {
    buffer: Vec<u8>,
}

impl NdjsonLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct RunningModels {
    #[serde(default)]
    models: Vec<RunningModel>,
}

#[derive(Debug, Deserialize)]
struct RunningModel {
    name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    size_vram: u64,
}

#[derive(Debug, Deserialize)]
struct Tags {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Serialize)]
struct ShowRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ShowDetails {
    #[serde(default)]
    quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    details: ShowDetails,
    #[serde(default)]
    model_info: serde_json::Map<String, Value>,
}

/// Used when `/api/show` does not report a context length.
const FALLBACK_CONTEXT_LENGTH: u32 = 2048;

impl ShowResponse {
    fn arch_u64(&self, arch: &str, key: &str) -> Option<u64> {
        self.model_info
            .get(&format!("{}.{}", arch, key))
            .and_then(Value::as_u64)
    }

    fn into_descriptor(self, model: &str, size_bytes: u64) -> ModelDescriptor {
        let arch = self
            .model_info
            .get("general.architecture")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context = self.arch_u64(&arch, "context_length");
        let layers = self.arch_u64(&arch, "block_count");
        let embedding = self.arch_u64(&arch, "embedding_length");
        let heads = self.arch_u64(&arch, "attention.head_count");
        let kv_heads = self.arch_u64(&arch, "attention.head_count_kv").or(heads);

        // K and V per layer, f16 cache, width scaled down for grouped-query attention.
        let kv_bytes_per_token = match (layers, embedding, heads, kv_heads) {
            (Some(l), Some(e), Some(h), Some(kv)) if h > 0 => Some(2 * l * e * kv / h * 2),
            _ => None,
        };

        ModelDescriptor {
            id: model.to_string(),
            path: PathBuf::from(model),
            size_bytes,
            parameter_count: self
                .model_info
                .get("general.parameter_count")
                .and_then(Value::as_u64),
            max_context_size: context
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(FALLBACK_CONTEXT_LENGTH),
            layer_count: layers.and_then(|l| u32::try_from(l).ok()),
            kv_bytes_per_token,
            embedding_length: embedding.and_then(|e| u32::try_from(e).ok()),
            quantization: self.details.quantization_level,
            backend: Some("ollama".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::ChatMessage;

    fn spec() -> WeightLoadSpec {
        WeightLoadSpec {
            model_id: "qwen2.5:7b".to_string(),
            path: PathBuf::from("qwen2.5:7b"),
            gpu_layers: 20,
            total_layers: Some(28),
            context_size: 8192,
            batch_size: 512,
            threads: 8,
            gpu_id: Some(1),
            main_gpu: None,
            tensor_split: None,
        }
    }

    #[test]
    fn test_client_trims_endpoint() {
        let client = OllamaClient::new("http://localhost:11434/").unwrap();
        assert_eq!(client.endpoint(), "http://localhost:11434");
        assert_eq!(client.url("/api/ps"), "http://localhost:11434/api/ps");
    }

    #[test]
    fn test_generate_request_serialization() {
        let model = "qwen2.5:7b";
        let sampling = SamplingParams {
            temperature: Some(0.3),
            stop: vec!["\n\n".to_string()],
            ..SamplingParams::default()
        };
        let request = GenerateRequest {
            model,
            prompt: Some("test prompt"),
            stream: true,
            keep_alive: Some(Value::String("-1m".to_string())),
            options: Some(GenerateOptions {
                placement: PlacementOptions::from(&spec()),
                temperature: sampling.temperature,
                stop: Some(sampling.stop.clone()),
                num_predict: Some(64),
                ..GenerateOptions::default()
            }),
            format: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "qwen2.5:7b");
        assert_eq!(json["stream"], true);
        assert_eq!(json["options"]["num_ctx"], 8192);
        assert_eq!(json["options"]["num_gpu"], 20);
        assert_eq!(json["options"]["main_gpu"], 1);
        assert_eq!(json["options"]["num_predict"], 64);
        assert!(json["options"].get("top_k").is_none());
        assert!(json.get("format").is_none());
    }

    #[test]
    fn test_chat_request_roles() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "m",
            messages: messages
                .iter()
                .map(|m| ChatTurn {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
            keep_alive: None,
            options: None,
            format: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_ndjson_lines_across_chunks() {
        let mut lines = NdjsonLines::default();
        assert!(lines.push(br#"{"response":"He"#).is_empty());
        let out = lines.push(b"llo\",\"done\":false}\n{\"response\":\"!\",\"done\":false}\n{\"done\"");
        assert_eq!(out.len(), 2);
        assert_eq!(parse_stream_line(&out[0]).unwrap().text(), Some("Hello"));
        assert!(lines.push(b":true}").is_empty());
        assert_eq!(lines.finish().as_deref(), Some(r#"{"done":true}"#));
        assert!(lines.finish().is_none());
    }

    #[test]
    fn test_final_chunk_stats() {
        let chunk = parse_stream_line(
            r#"{"model":"m","response":"","done":true,"done_reason":"length","prompt_eval_count":12,"eval_count":64}"#,
        )
        .unwrap();
        let stats = chunk.stats();
        assert_eq!(stats.prompt_tokens, Some(12));
        assert_eq!(stats.completion_tokens, Some(64));
        assert_eq!(stats.finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_chat_chunk_text() {
        let chunk =
            parse_stream_line(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#)
                .unwrap();
        assert_eq!(chunk.text(), Some("Hi"));
    }

    #[test]
    fn test_stream_error_line() {
        let err = parse_stream_line(r#"{"error":"model runner crashed"}"#).unwrap_err();
        assert!(matches!(err, BackendError::ApiError { message, .. } if message == "model runner crashed"));
        assert!(matches!(
            parse_stream_line("not json"),
            Err(BackendError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_show_response_descriptor() {
        let json = r#"{
            "details": {"quantization_level": "Q4_K_M"},
            "model_info": {
                "general.architecture": "llama",
                "general.parameter_count": 8030261248,
                "llama.context_length": 131072,
                "llama.block_count": 32,
                "llama.embedding_length": 4096,
                "llama.attention.head_count": 32,
                "llama.attention.head_count_kv": 8
            }
        }"#;
        let show: ShowResponse = serde_json::from_str(json).unwrap();
        let descriptor = show.into_descriptor("llama3.1:8b", 4_920_753_328);

        assert_eq!(descriptor.max_context_size, 131072);
        assert_eq!(descriptor.layer_count, Some(32));
        assert_eq!(descriptor.kv_bytes_per_token, Some(131_072));
        assert_eq!(descriptor.quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(descriptor.size_bytes, 4_920_753_328);
        assert_eq!(descriptor.backend.as_deref(), Some("ollama"));
    }

    #[test]
    fn test_show_response_minimal() {
        let show: ShowResponse = serde_json::from_str("{}").unwrap();
        let descriptor = show.into_descriptor("tiny", 10);
        assert_eq!(descriptor.max_context_size, FALLBACK_CONTEXT_LENGTH);
        assert!(descriptor.layer_count.is_none());
        assert!(descriptor.kv_bytes_per_token.is_none());
    }

    #[test]
    fn test_running_models_deserialization() {
        let json = r#"{"models":[{"name":"m:latest","model":"m:latest","size":6000,"size_vram":4000}]}"#;
        let running: RunningModels = serde_json::from_str(json).unwrap();
        assert_eq!(running.models[0].size - running.models[0].size_vram, 2000);
    }

    #[tokio::test]
    async fn test_health_check_unreachable() {
        let client =
            OllamaClient::with_timeout("http://localhost:59999", Duration::from_millis(100))
                .unwrap();

        let result = client.health_check().await;
        assert!(!result.unwrap());
    }
}
