use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chars-per-token ratio used when no tokenizer is available.
const CHARS_PER_TOKEN: usize = 4;
/// Tokens charged per chat message for role markers and separators.
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Rough token estimate for a piece of text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn estimated_tokens(&self) -> u32 {
        estimate_tokens(&self.content) + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Either a raw prompt or a list of chat turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptInput {
    Prompt(String),
    Chat(Vec<ChatMessage>),
}

impl PromptInput {
    pub fn estimated_tokens(&self) -> u32 {
        match self {
            PromptInput::Prompt(text) => estimate_tokens(text),
            PromptInput::Chat(messages) => messages.iter().map(ChatMessage::estimated_tokens).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PromptInput::Prompt(text) => text.trim().is_empty(),
            PromptInput::Chat(messages) => messages.is_empty(),
        }
    }
}

/// Sampling controls. Unset fields leave the backend default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub seed: Option<u64>,
    /// GBNF grammar constraint.
    pub grammar: Option<String>,
    /// JSON schema constraint.
    pub json_schema: Option<serde_json::Value>,
}

impl SamplingParams {
    /// Rejects out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RuntimeError::invalid(format!(
                    "temperature must be within [0, 2], got {}",
                    t
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(RuntimeError::invalid(format!(
                    "top_p must be within [0, 1], got {}",
                    p
                )));
            }
        }
        if self.top_k == Some(0) {
            return Err(RuntimeError::invalid("top_k must be at least 1"));
        }
        if let Some(r) = self.repeat_penalty {
            if !r.is_finite() || r < 0.0 {
                return Err(RuntimeError::invalid(format!(
                    "repeat_penalty must be non-negative, got {}",
                    r
                )));
            }
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if let Some(v) = value {
                if !(-2.0..=2.0).contains(&v) {
                    return Err(RuntimeError::invalid(format!(
                        "{} must be within [-2, 2], got {}",
                        name, v
                    )));
                }
            }
        }
        if self.stop.iter().any(|s| s.is_empty()) {
            return Err(RuntimeError::invalid("stop sequences must not be empty"));
        }
        if self.grammar.is_some() && self.json_schema.is_some() {
            return Err(RuntimeError::invalid(
                "grammar and json_schema constraints are mutually exclusive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Target model. `None` routes to the active model.
    pub model_id: Option<String>,
    pub input: PromptInput,
    #[serde(default)]
    pub sampling: SamplingParams,
    pub max_tokens: Option<u32>,
    #[serde(default, with = "duration_secs")]
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            model_id: None,
            input: PromptInput::Prompt(text.into()),
            sampling: SamplingParams::default(),
            max_tokens: None,
            timeout: None,
        }
    }

    pub fn chat(messages: Vec<ChatMessage>) -> Self {
        Self {
            input: PromptInput::Chat(messages),
            ..Self::prompt("")
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(RuntimeError::invalid("prompt must not be empty"));
        }
        if self.max_tokens == Some(0) {
            return Err(RuntimeError::invalid("max_tokens must be at least 1"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(RuntimeError::invalid("timeout must be greater than zero"));
        }
        self.sampling.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model emitted an end-of-sequence token.
    Stop,
    /// The completion budget ran out.
    Length,
    /// A stop sequence matched.
    StopSequence,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub time_to_first_token_ms: Option<u64>,
    pub generation_time_ms: u64,
    pub total_time_ms: u64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: String,
    pub model_id: String,
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub metrics: GenerationMetrics,
}

/// One incremental unit of a streamed generation.
///
/// Only the terminal chunk carries `finish_reason`, `usage`, and `metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub request_id: String,
    pub text: String,
    pub token_index: u32,
    pub done: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
    pub metrics: Option<GenerationMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model_id: Option<String>,
    pub inputs: Vec<String>,
    #[serde(default)]
    pub normalize: bool,
    #[serde(default, with = "duration_secs")]
    pub timeout: Option<Duration>,
}

impl EmbeddingRequest {
    pub fn new(inputs: Vec<String>) -> Self {
        Self {
            model_id: None,
            inputs,
            normalize: false,
            timeout: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(RuntimeError::invalid("at least one input text is required"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(RuntimeError::invalid("timeout must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub model_id: String,
    pub embeddings: Vec<Vec<f32>>,
    pub dimensions: usize,
    pub prompt_tokens: u32,
    pub total_time_ms: u64,
}

/// Scales a vector to unit length. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!(
                "invalid timeout seconds: {}",
                s
            ))),
            None => Ok(None),
        }
    }
}
