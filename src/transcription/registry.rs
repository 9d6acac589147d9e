//! # Model Registry Resolution
//!
//! The model's assets can be obtained from several registries ("hubs"). The
//! resolver walks an ordered hub list, rewrites the logical model identifier
//! into each hub's naming scheme, and attempts backend construction against
//! each hub until one succeeds.
//!
//! ## Resolution Rules:
//! - **Strict order**: hubs are tried sequentially as given, never raced
//! - **Verbatim errors**: every failed attempt is kept as `(hub, message)`
//! - **Persist on success only**: a failed run leaves no state file behind
//!
//! ## Two Callers:
//! - `prepare` mode calls [`RegistryResolver::resolve`], which validates
//!   availability, drops the recognizer and persists the winning triple
//! - The warm-up coordinator calls [`RegistryResolver::acquire`] and keeps the
//!   recognizer for serving

use crate::transcription::model::{construct_guarded, ConstructionOptions, ModelBackend, RecognizerHandle};
use crate::transcription::snapshot::{ResolvedConfiguration, StateSnapshotStore};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Hugging Face hub key.
pub const HUB_HUGGINGFACE: &str = "hf";

/// ModelScope hub key.
pub const HUB_MODELSCOPE: &str = "ms";

/// Canonical default model identifier on Hugging Face.
pub const HUGGINGFACE_DEFAULT_MODEL: &str = "FunAudioLLM/SenseVoiceSmall";

/// Canonical default model identifier on ModelScope.
pub const MODELSCOPE_DEFAULT_MODEL: &str = "iic/SenseVoiceSmall";

/// Rewrite a logical model identifier for `hub`.
///
/// Only the two well-known default identifiers are rewritten, so a single
/// default works whichever hub ends up serving it. Custom identifiers and
/// unknown hubs pass through unchanged.
pub fn normalize_model_id<'a>(model_id: &'a str, hub: &str) -> &'a str {
    let is_default = model_id == HUGGINGFACE_DEFAULT_MODEL || model_id == MODELSCOPE_DEFAULT_MODEL;
    if !is_default {
        return model_id;
    }
    match hub {
        HUB_HUGGINGFACE => HUGGINGFACE_DEFAULT_MODEL,
        HUB_MODELSCOPE => MODELSCOPE_DEFAULT_MODEL,
        _ => model_id,
    }
}

/// Split a comma-separated hub list ("hf, ms") into trimmed, non-empty keys.
pub fn parse_hub_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|hub| !hub.is_empty())
        .map(str::to_string)
        .collect()
}

/// One construction attempt against one hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionCandidate {
    pub source: String,
    pub raw_model_id: String,
    pub normalized_model_id: String,
    pub device: String,
}

impl ResolutionCandidate {
    pub fn new(source: &str, raw_model_id: &str, device: &str) -> Self {
        Self {
            source: source.to_string(),
            raw_model_id: raw_model_id.to_string(),
            normalized_model_id: normalize_model_id(raw_model_id, source).to_string(),
            device: device.to_string(),
        }
    }

    fn into_resolved(self) -> ResolvedConfiguration {
        ResolvedConfiguration {
            source: self.source,
            model_id: self.normalized_model_id,
            device: self.device,
        }
    }
}

/// A failed attempt: the hub and the backend's message, verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAttempt {
    pub source: String,
    pub error: String,
}

impl fmt::Display for SourceAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.error)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every hub failed; the attempts are in the order they were tried.
    #[error("failed to load model from all hubs: {}", render_attempts(.attempts))]
    AllSourcesExhausted { attempts: Vec<SourceAttempt> },

    /// The model loaded but the state file could not be written.
    #[error("model resolved via {source_hub} but state could not be persisted: {message}")]
    Persist { source_hub: String, message: String },
}

fn render_attempts(attempts: &[SourceAttempt]) -> String {
    if attempts.is_empty() {
        return "no hubs configured".to_string();
    }
    attempts.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Walks the hub list and constructs the backend from the first hub that works.
pub struct RegistryResolver {
    backend: Arc<dyn ModelBackend>,
    options: ConstructionOptions,
    snapshot: Option<StateSnapshotStore>,
}

impl RegistryResolver {
    pub fn new(backend: Arc<dyn ModelBackend>, options: ConstructionOptions) -> Self {
        Self {
            backend,
            options,
            snapshot: None,
        }
    }

    /// Persist successful [`resolve`](Self::resolve) runs to `store`.
    pub fn with_snapshot_store(mut self, store: StateSnapshotStore) -> Self {
        self.snapshot = Some(store);
        self
    }

    /// Resolve and validate: construct, drop the recognizer, persist the winner.
    pub fn resolve(&self, model_id: &str, sources: &[String], device: &str) -> Result<ResolvedConfiguration, ResolveError> {
        let (resolved, recognizer) = self.acquire(model_id, sources, device)?;
        // Only availability is being validated here; serving builds its own.
        drop(recognizer);

        if let Some(store) = &self.snapshot {
            store.write(&resolved).map_err(|e| ResolveError::Persist {
                source_hub: resolved.source.clone(),
                message: format!("{:#}", e),
            })?;
        }
        Ok(resolved)
    }

    /// Resolve and keep the constructed recognizer.
    pub fn acquire(
        &self,
        model_id: &str,
        sources: &[String],
        device: &str,
    ) -> Result<(ResolvedConfiguration, RecognizerHandle), ResolveError> {
        let mut attempts = Vec::new();
        for source in sources {
            let candidate = ResolutionCandidate::new(source, model_id, device);
            let config = self.options.backend_config(&candidate.source, &candidate.normalized_model_id, &candidate.device);

            info!(
                hub = %candidate.source,
                model_id = %candidate.normalized_model_id,
                device = %candidate.device,
                "Trying hub"
            );
            let started = Instant::now();

            match construct_guarded(self.backend.as_ref(), &config) {
                Ok(recognizer) => {
                    info!(
                        hub = %candidate.source,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Model loaded"
                    );
                    return Ok((candidate.into_resolved(), recognizer));
                }
                Err(error) => {
                    warn!(hub = %candidate.source, "Hub failed: {}", error);
                    attempts.push(SourceAttempt {
                        source: candidate.source,
                        error,
                    });
                }
            }
        }

        Err(ResolveError::AllSourcesExhausted { attempts })
    }
}
