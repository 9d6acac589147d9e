//! # Transcription Service
//!
//! Turns one uploaded audio payload into text using the warmed-up recognizer.
//!
//! ## Request Lifecycle:
//! 1. Write the payload to a scoped temporary file (the backend reads paths)
//! 2. Ask the warm-up coordinator for the recognizer; fail fast if not ready
//! 3. Run blocking inference with fixed tuning parameters
//! 4. Extract and clean up the text
//! 5. Remove the temporary file on every exit path
//!
//! ## Error Scoping:
//! Inference failures are request-scoped and never touch the warm-up state.

use crate::transcription::model::{infer_guarded, InferenceRequest};
use crate::transcription::postprocess::rich_transcription_postprocess;
use crate::transcription::warmup::{WarmupCoordinator, WarmupError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Extension used when the upload carries no usable filename.
pub const DEFAULT_AUDIO_SUFFIX: &str = ".wav";

/// Language hint used when the client sends none.
pub const DEFAULT_LANGUAGE: &str = "auto";

/// Fixed inference tuning.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    /// Dynamic batching bound (seconds of audio per batch)
    pub batch_size_s: u32,

    /// Inverse text normalization
    pub use_itn: bool,

    /// Directory for scoped artifacts, system temp dir when `None`
    pub temp_dir: Option<PathBuf>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            batch_size_s: 60,
            use_itn: true,
            temp_dir: None,
        }
    }
}

/// One transcription call.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio_bytes: Vec<u8>,
    pub filename_hint: Option<String>,
    pub language_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscribeError {
    #[error("model is loading, please retry shortly")]
    WarmingUp,

    #[error("model load failed: {0}")]
    Unavailable(String),

    #[error("transcription failed: {0}")]
    Inference(String),
}

impl From<WarmupError> for TranscribeError {
    fn from(err: WarmupError) -> Self {
        match err {
            WarmupError::WarmingUp => TranscribeError::WarmingUp,
            WarmupError::Unavailable(message) => TranscribeError::Unavailable(message),
        }
    }
}

/// Temporary audio file owned by one request; removed when dropped.
pub struct ScopedArtifact {
    file: NamedTempFile,
}

impl ScopedArtifact {
    pub fn create(dir: Option<&Path>, suffix: &str, bytes: &[u8]) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("asr-").suffix(suffix);
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Remove the file now. Failures are logged and swallowed.
    pub fn release(self) {
        let path = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            tracing::debug!(path = %path.display(), "Temporary audio cleanup failed: {}", e);
        }
    }
}

/// Suffix for the scoped artifact: the filename's extension, or `.wav`.
pub fn artifact_suffix(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| DEFAULT_AUDIO_SUFFIX.to_string())
}

/// Pull the transcript out of a raw backend result.
///
/// A sequence yields its first record's `text` field (non-record items are
/// stringified); any other value is stringified directly.
pub fn extract_text(result: &serde_json::Value) -> String {
    use serde_json::Value;

    fn stringify(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    match result {
        Value::Array(items) => match items.first() {
            Some(Value::Object(record)) => record.get("text").map(stringify).unwrap_or_default(),
            Some(item) => stringify(item),
            None => String::new(),
        },
        other => stringify(other),
    }
}

/// Serves transcription requests against the warmed-up recognizer.
pub struct TranscriptionService {
    warmup: Arc<WarmupCoordinator>,
    options: InferenceOptions,
}

impl TranscriptionService {
    pub fn new(warmup: Arc<WarmupCoordinator>, options: InferenceOptions) -> Self {
        Self { warmup, options }
    }

    pub fn warmup(&self) -> &Arc<WarmupCoordinator> {
        &self.warmup
    }

    /// Transcribe one payload. Blocking; run it off the async executor.
    pub fn transcribe(&self, request: TranscriptionRequest) -> Result<String, TranscribeError> {
        let suffix = artifact_suffix(request.filename_hint.as_deref());
        let artifact = ScopedArtifact::create(self.options.temp_dir.as_deref(), &suffix, &request.audio_bytes)
            .map_err(|e| TranscribeError::Inference(format!("failed to stage audio: {}", e)))?;

        let result = self.run(&artifact, request.language_hint.as_deref());
        artifact.release();
        result
    }

    fn run(&self, artifact: &ScopedArtifact, language: Option<&str>) -> Result<String, TranscribeError> {
        let recognizer = self.warmup.get_runtime()?;

        let language = language
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .unwrap_or(DEFAULT_LANGUAGE)
            .to_string();
        let inference = InferenceRequest {
            input: artifact.path().to_path_buf(),
            language,
            use_itn: self.options.use_itn,
            batch_size_s: self.options.batch_size_s,
            cache: serde_json::Map::new(),
        };

        let started = Instant::now();
        let raw = infer_guarded(recognizer.as_ref(), &inference).map_err(TranscribeError::Inference)?;
        let text = rich_transcription_postprocess(&extract_text(&raw)).trim().to_string();

        tracing::info!(
            language = %inference.language,
            elapsed_ms = started.elapsed().as_millis() as u64,
            chars = text.chars().count(),
            "Transcription completed"
        );
        Ok(text)
    }
}
