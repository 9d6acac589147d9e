//! # Transcription Module
//!
//! Speech-to-text on top of an external SenseVoice recognizer.
//!
//! ## Key Components:
//! - **model**: backend capability traits and panic-safe call wrappers
//! - **registry**: ordered multi-hub model resolution
//! - **snapshot**: the persisted `{source, modelId, device}` record
//! - **warmup**: single-flight background loading and readiness state
//! - **engine**: per-request transcription with scoped temporary files
//! - **process**: the worker-process backend used in production
//! - **postprocess**: SenseVoice's inline tags to display text
//!
//! ## Lifecycle:
//! The recognizer is loaded lazily. The first health probe (or request)
//! starts a background attempt; requests fail fast with "warming up" until it
//! completes, then share the one loaded recognizer.

pub mod engine;
pub mod model;
pub mod postprocess;
pub mod process;
pub mod registry;
pub mod snapshot;
pub mod warmup;

#[cfg(test)]
pub mod testing;

pub use engine::{InferenceOptions, TranscribeError, TranscriptionRequest, TranscriptionService};
pub use process::ProcessBackend;
pub use registry::{RegistryResolver, ResolveError};
pub use snapshot::StateSnapshotStore;
pub use warmup::{WarmupCoordinator, WarmupState};
