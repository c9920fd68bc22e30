//! Collaborators at the runtime's edge: inference backends, model stores,
//! and GPU sources.

pub mod gpu;
pub mod mock;
pub mod ollama;
pub mod store;

pub use gpu::{NoGpuSource, NvidiaSmiSource, StaticGpuSource};
pub use mock::{MockBackend, MockModel, MockRun};
pub use ollama::{OllamaBackend, OllamaClient, OllamaModelStore, DEFAULT_ENDPOINT};
pub use store::{InMemoryModelStore, Manifest, ManifestError};
