//! # Configuration Management
//!
//! This module loads the server configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix (`__` separates sections)
//! - The flat SENSEVOICE_* variables understood by earlier deployments
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command-line flags (applied by the caller after loading)
//! 2. SENSEVOICE_* variables (SENSEVOICE_MODEL_ID, SENSEVOICE_PORT, ...)
//! 3. APP_* variables (APP_SERVER__PORT, APP_MODEL__HUBS, ...)
//! 4. Configuration file (config.toml)
//! 5. Default values (defined in the Default impl)

use crate::transcription::model::{ConstructionOptions, DEFAULT_MAX_SINGLE_SEGMENT_MS, DEFAULT_VAD_MODEL};
use crate::transcription::registry::{parse_hub_list, MODELSCOPE_DEFAULT_MODEL};
use crate::transcription::InferenceOptions;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Flat variables mapped onto config keys, in the order they are applied.
/// A later entry wins when two map to the same key.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SENSEVOICE_MODEL_ID", "model.model_id"),
    ("SENSEVOICE_MODEL_DIR", "model.model_dir"),
    ("SENSEVOICE_DEVICE", "model.device"),
    ("SENSEVOICE_HUB", "model.hubs"),
    ("SENSEVOICE_HUBS", "model.hubs"),
    ("SENSEVOICE_STATE_PATH", "model.state_path"),
    ("SENSEVOICE_HOST", "server.host"),
    ("SENSEVOICE_PORT", "server.port"),
];

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub backend: BackendCommandConfig,
    pub inference: InferenceConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: address to bind; the default only accepts local connections
/// - `port`: TCP port
/// - `eager_warmup`: start loading the model at boot instead of on the first probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub eager_warmup: bool,
}

/// Which model to load, from where, and onto what device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier, normalized per hub at resolution time
    pub model_id: String,

    /// Cache root; per-hub caches live underneath it
    pub model_dir: PathBuf,

    /// Device preference: "auto" or an explicit target such as "cpu"
    pub device: String,

    /// Comma-separated, ordered hub list ("hf,ms")
    pub hubs: String,

    /// Where `prepare` records the winning configuration
    pub state_path: PathBuf,

    pub vad_model: Option<String>,
    pub max_single_segment_ms: u64,
    pub trust_remote_code: bool,
    pub remote_code: Option<String>,
}

/// Recognizer worker command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCommandConfig {
    pub command: String,
    pub args: Vec<String>,
}

/// Per-request inference tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub batch_size_s: u32,
    pub use_itn: bool,
    /// Directory for temporary audio files, system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Upload size limit in megabytes
    pub max_upload_mb: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
                eager_warmup: false,
            },
            model: ModelConfig {
                model_id: MODELSCOPE_DEFAULT_MODEL.to_string(),
                model_dir: PathBuf::from("models"),
                device: "auto".to_string(),
                hubs: "hf,ms".to_string(),
                state_path: PathBuf::from("models/state.json"),
                vad_model: Some(DEFAULT_VAD_MODEL.to_string()),
                max_single_segment_ms: DEFAULT_MAX_SINGLE_SEGMENT_MS,
                trust_remote_code: false,
                remote_code: None,
            },
            backend: BackendCommandConfig {
                command: "python3".to_string(),
                args: vec!["scripts/funasr_bridge.py".to_string()],
            },
            inference: InferenceConfig {
                batch_size_s: 60,
                use_itn: true,
                temp_dir: None,
                max_upload_mb: 50,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from `config.toml` and the process environment.
    pub fn load() -> Result<Self> {
        Self::load_from("config", env::vars().collect())
    }

    /// Load configuration from the named file (extension optional) and the
    /// given environment snapshot.
    ///
    /// ## Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with the config file (if it exists)
    /// 3. Override with APP_ variables
    /// 4. Override with the flat SENSEVOICE_ variables
    pub fn load_from(config_name: &str, vars: HashMap<String, String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name(config_name).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(vars.clone())),
            );

        for (var, key) in LEGACY_ENV_OVERRIDES {
            if let Some(value) = vars.get(*var).filter(|v| !v.trim().is_empty()) {
                settings = settings.set_override(*key, value.trim())?;
            }
        }

        let config: AppConfig = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.model.model_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Model id cannot be empty"));
        }

        if self.hub_list().is_empty() {
            return Err(anyhow::anyhow!("At least one model hub must be configured"));
        }

        if self.backend.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend command cannot be empty"));
        }

        if self.inference.batch_size_s == 0 {
            return Err(anyhow::anyhow!("Inference batch size must be greater than 0"));
        }

        if self.inference.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("Upload size limit must be greater than 0"));
        }

        Ok(())
    }

    /// Ordered hubs to try.
    pub fn hub_list(&self) -> Vec<String> {
        parse_hub_list(&self.model.hubs)
    }

    pub fn construction_options(&self) -> ConstructionOptions {
        ConstructionOptions {
            vad_model: self.model.vad_model.clone().filter(|m| !m.trim().is_empty()),
            max_single_segment_ms: self.model.max_single_segment_ms,
            trust_remote_code: self.model.trust_remote_code,
            remote_code: self.model.remote_code.clone(),
        }
    }

    pub fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            batch_size_s: self.inference.batch_size_s,
            use_itn: self.inference.use_itn,
            temp_dir: self.inference.temp_dir.clone(),
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.inference.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
