//! Model stores backed by memory or a manifest file.

use async_trait::async_trait;
use hearth_core::{BackendError, GpuDevice, ModelDescriptor, ModelStore};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML manifest: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported manifest format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(String),

    #[error("Model '{0}' is declared more than once")]
    DuplicateModel(String),
}

/// Installed models and GPUs declared in one file.
///
/// ```toml
/// [[models]]
/// id = "llama3-8b"
/// path = "models/llama3-8b.Q4_K_M.gguf"
/// size_bytes = 4920753328
/// max_context_size = 8192
/// layer_count = 32
///
/// [[gpus]]
/// id = 0
/// name = "RTX 4090"
/// vram_total_bytes = 25757220864
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub gpus: Vec<GpuDevice>,
}

impl Manifest {
    /// Parses by extension. Relative model paths resolve against the
    /// manifest's directory.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut manifest = match extension.as_str() {
            "toml" => Self::from_toml(&text)?,
            "json" => Self::from_json(&text)?,
            other => return Err(ManifestError::UnsupportedFormat(other.to_string())),
        };

        if let Some(base) = path.parent() {
            for model in &mut manifest.models {
                if model.path.is_relative() {
                    model.path = base.join(&model.path);
                }
            }
        }
        debug!(
            path = %path.display(),
            models = manifest.models.len(),
            gpus = manifest.gpus.len(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    pub fn from_toml(text: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn into_store(self) -> Result<InMemoryModelStore, ManifestError> {
        let store = InMemoryModelStore::new();
        for model in self.models {
            if store.contains(&model.id) {
                return Err(ManifestError::DuplicateModel(model.id));
            }
            store.insert(model);
        }
        Ok(store)
    }
}

/// Thread-safe map of descriptors, listed in id order.
#[derive(Debug, Default)]
pub struct InMemoryModelStore {
    models: RwLock<BTreeMap<String, ModelDescriptor>>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let store = Self::new();
        for model in models {
            store.insert(model);
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ModelDescriptor>> {
        self.models.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ModelDescriptor>> {
        self.models.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, model: ModelDescriptor) -> Option<ModelDescriptor> {
        self.write().insert(model.id.clone(), model)
    }

    pub fn remove(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.write().remove(model_id)
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.read().contains_key(model_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn resolve(&self, model_id: &str) -> Result<Option<ModelDescriptor>, BackendError> {
        Ok(self.read().get(model_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        Ok(self.read().values().cloned().collect())
    }
}
