//! Model lifecycle, request routing, and conversation context for local
//! inference backends.
//!
//! [`InferenceManager`] is the entry point: it loads models through the
//! registered backends after a feasibility check, routes generation and
//! embedding requests, keeps each model's context window within bounds, and
//! publishes every lifecycle transition on a broadcast event feed.

pub mod bus;
pub mod context;
pub mod events;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod requirements;
pub mod singleflight;

pub use bus::{EventBus, EventStream, EventSubscription};
pub use context::{
    Admission, ContextManager, ContextSnapshot, ContextStatus, Truncation, SNAPSHOT_FORMAT_VERSION,
};
pub use events::{attach, EventHandler, LoggingHandler};
pub use loader::{BackendSet, LoadPlan, Placement, ALL_LAYERS};
pub use manager::{GenerationStream, InferenceManager, InferenceManagerBuilder};
pub use requirements::MemoryEstimate;
