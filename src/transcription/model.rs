//! # Recognition Backend Capability
//!
//! Abstractions over the speech-recognition backend. The backend itself is an
//! external, blocking capability: it is constructed once from a
//! [`BackendConfig`] (which may download several gigabytes of assets) and then
//! invoked for inference with a path to an audio file.
//!
//! ## Construction Contract:
//! - **construct**: `BackendConfig -> Result<RecognizerHandle>`, slow and blocking
//! - **infer**: `InferenceRequest -> Result<serde_json::Value>`, blocking
//! - **Opaque errors**: callers never interpret backend errors, they only
//!   carry the message verbatim
//!
//! ## Panic Safety:
//! [`construct_guarded`] and [`infer_guarded`] convert both errors and panics
//! into plain strings so a broken model or runtime can never take the
//! coordinating process down.

use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Voice-activity-detection sub-model loaded alongside the recognizer.
pub const DEFAULT_VAD_MODEL: &str = "fsmn-vad";

/// Upper bound for a single VAD segment (milliseconds).
pub const DEFAULT_MAX_SINGLE_SEGMENT_MS: u64 = 30_000;

/// Everything the backend needs to build a recognizer.
///
/// `hub`, `model_id` and `device` vary per resolution attempt; the remaining
/// fields are fixed auxiliary options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendConfig {
    /// Registry the assets are fetched from ("hf", "ms", ...)
    pub hub: String,

    /// Source-specific model identifier (already normalized for `hub`)
    pub model_id: String,

    /// Concrete execution target ("cpu", "cuda:0", ...)
    pub device: String,

    /// VAD sub-model, `None` disables segmentation
    pub vad_model: Option<String>,

    /// Maximum single-segment duration for the VAD (milliseconds)
    pub max_single_segment_ms: u64,

    /// Whether the backend may execute model code shipped with the assets
    pub trust_remote_code: bool,

    /// Local path of custom model code, only meaningful with `trust_remote_code`
    pub remote_code: Option<String>,
}

/// Fixed auxiliary options applied to every construction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructionOptions {
    pub vad_model: Option<String>,
    pub max_single_segment_ms: u64,
    pub trust_remote_code: bool,
    pub remote_code: Option<String>,
}

impl Default for ConstructionOptions {
    fn default() -> Self {
        Self {
            vad_model: Some(DEFAULT_VAD_MODEL.to_string()),
            max_single_segment_ms: DEFAULT_MAX_SINGLE_SEGMENT_MS,
            trust_remote_code: false,
            remote_code: None,
        }
    }
}

impl ConstructionOptions {
    /// Combine the fixed options with one attempt's `(hub, model_id, device)`.
    pub fn backend_config(&self, hub: &str, model_id: &str, device: &str) -> BackendConfig {
        BackendConfig {
            hub: hub.to_string(),
            model_id: model_id.to_string(),
            device: device.to_string(),
            vad_model: self.vad_model.clone(),
            max_single_segment_ms: self.max_single_segment_ms,
            trust_remote_code: self.trust_remote_code,
            remote_code: self.remote_code.clone(),
        }
    }
}

/// A single blocking inference call.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    /// Audio file handed to the backend
    pub input: PathBuf,

    /// Language hint ("auto", "zh", "en", ...)
    pub language: String,

    /// Inverse text normalization (numbers, punctuation)
    pub use_itn: bool,

    /// Dynamic batching bound in seconds of audio
    pub batch_size_s: u32,

    /// Incremental-decode cache, always empty for one-shot requests
    pub cache: serde_json::Map<String, serde_json::Value>,
}

/// A constructed recognizer. Shared read-only by every request once published.
pub trait Recognizer: Send + Sync {
    /// Run inference. The raw result is either a sequence of result records or
    /// a single value; see [`crate::transcription::engine::extract_text`].
    fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value>;
}

/// Shared handle to a constructed recognizer.
pub type RecognizerHandle = Arc<dyn Recognizer>;

/// Factory for recognizers.
pub trait ModelBackend: Send + Sync {
    /// Build a recognizer. Blocking and potentially very slow.
    fn construct(&self, config: &BackendConfig) -> Result<RecognizerHandle>;
}

/// Construct a recognizer, turning errors and panics into their message.
pub fn construct_guarded(backend: &dyn ModelBackend, config: &BackendConfig) -> Result<RecognizerHandle, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| backend.construct(config))) {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

/// Run inference, turning errors and panics into their message.
pub fn infer_guarded(recognizer: &dyn Recognizer, request: &InferenceRequest) -> Result<serde_json::Value, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| recognizer.infer(request))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

/// Best-effort rendering of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("backend panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("backend panicked: {}", msg)
    } else {
        "backend panicked".to_string()
    }
}
