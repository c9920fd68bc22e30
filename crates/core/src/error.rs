use crate::model::ModelStatus;
use crate::resources::ResourceIssue;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque failure reported by a backend, model store, or hardware source.
///
/// The runtime never reinterprets these; they travel to the caller inside
/// [`RuntimeError::Backend`] with their message intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendError {
    ApiError {
        message: String,
        status_code: Option<u16>,
    },
    TimeoutError {
        seconds: u64,
    },
    NetworkError {
        message: String,
    },
    InvalidResponse {
        message: String,
        raw_response: Option<String>,
    },
    ConfigurationError {
        message: String,
    },
    /// The backend observed the cancellation signal and stopped early.
    Cancelled,
    Other {
        message: String,
    },
}

impl BackendError {
    pub fn other(message: impl Into<String>) -> Self {
        BackendError::Other {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::ApiError {
                message,
                status_code,
            } => {
                if let Some(code) = status_code {
                    write!(f, "API error ({}): {}", code, message)
                } else {
                    write!(f, "API error: {}", message)
                }
            }
            BackendError::TimeoutError { seconds } => {
                write!(f, "Request timed out after {} seconds", seconds)
            }
            BackendError::NetworkError { message } => {
                write!(f, "Network error: {}", message)
            }
            BackendError::InvalidResponse { message, .. } => {
                write!(f, "Invalid response from backend: {}", message)
            }
            BackendError::ConfigurationError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            BackendError::Cancelled => write!(f, "Backend call cancelled"),
            BackendError::Other { message } => {
                write!(f, "Error: {}", message)
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Why a request stopped before the backend finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled or dropped the stream.
    Caller,
    /// The caller-supplied timeout expired.
    Timeout,
    /// The target model is being unloaded.
    Unload,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "timeout expired"),
            CancelReason::Unload => write!(f, "model unloading"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Model not found: {model_id}")]
    NotFound { model_id: String },

    #[error("Insufficient resources: {}", format_issues(.issues))]
    InsufficientResources { issues: Vec<ResourceIssue> },

    #[error("Backend failure: {0}")]
    Backend(BackendError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No model specified and no active model is set")]
    NoActiveModel,

    #[error("Prompt needs {required} tokens but the context holds at most {max}")]
    ContextTooLarge { required: u32, max: u32 },

    #[error("Snapshot format version {found} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Request cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("Model {model_id} cannot serve requests while {status}")]
    ModelUnavailable {
        model_id: String,
        status: ModelStatus,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl RuntimeError {
    pub fn not_found(model_id: impl Into<String>) -> Self {
        RuntimeError::NotFound {
            model_id: model_id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled { .. })
    }
}

impl From<BackendError> for RuntimeError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Cancelled => RuntimeError::Cancelled {
                reason: CancelReason::Caller,
            },
            other => RuntimeError::Backend(other),
        }
    }
}

fn format_issues(issues: &[ResourceIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceIssue, ResourceKind};

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::ApiError {
            message: "model crashed".to_string(),
            status_code: Some(500),
        };
        assert!(error.to_string().contains("500"));
        assert!(error.to_string().contains("model crashed"));

        let error = BackendError::ApiError {
            message: "bad request".to_string(),
            status_code: None,
        };
        assert_eq!(error.to_string(), "API error: bad request");
    }

    #[test]
    fn test_backend_message_is_preserved() {
        let error: RuntimeError = BackendError::other("CUDA out of memory").into();
        assert!(matches!(error, RuntimeError::Backend(_)));
        assert!(error.to_string().contains("CUDA out of memory"));
    }

    #[test]
    fn test_backend_cancel_maps_to_cancelled() {
        let error: RuntimeError = BackendError::Cancelled.into();
        assert!(error.is_cancelled());
    }

    #[test]
    fn test_insufficient_resources_lists_every_issue() {
        let error = RuntimeError::InsufficientResources {
            issues: vec![
                ResourceIssue::new(ResourceKind::Ram, None, 8, 4),
                ResourceIssue::new(ResourceKind::Vram, Some(0), 6, 2),
            ],
        };
        let message = error.to_string();
        assert!(message.contains("RAM"));
        assert!(message.contains("VRAM"));
    }

    #[test]
    fn test_model_unavailable_display() {
        let error = RuntimeError::ModelUnavailable {
            model_id: "llama".to_string(),
            status: ModelStatus::Unloading,
        };
        assert_eq!(
            error.to_string(),
            "Model llama cannot serve requests while unloading"
        );
    }
}
