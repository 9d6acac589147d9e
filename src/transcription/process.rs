//! # Process Bridge Backend
//!
//! Production [`ModelBackend`]: each recognizer is a long-lived worker process
//! (by default `python3 scripts/funasr_bridge.py`) driven over newline-delimited
//! JSON on stdin/stdout. Worker stderr is inherited so its download progress and
//! tracebacks land in the server log.
//!
//! ## Protocol:
//! - `{"op":"load", ...}` once, answered by `{"ok":true}` or `{"ok":false,"error":...}`
//! - `{"op":"generate", ...}` per request, answered by `{"ok":true,"result":...}`
//! - `{"op":"devices"}` on a short-lived worker, answered by `{"ok":true,"result":{"cuda":bool}}`
//!
//! The hub caches are passed to each worker through `HF_HOME` and
//! `MODELSCOPE_CACHE` on its own environment; the server's environment is
//! never modified.

use crate::device::AcceleratorProbe;
use crate::transcription::model::{BackendConfig, InferenceRequest, ModelBackend, Recognizer, RecognizerHandle};
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hugging Face cache variable, relative to the cache root.
const HF_CACHE: (&str, &str) = ("HF_HOME", "hf_home");

/// ModelScope cache variable, relative to the cache root.
const MODELSCOPE_CACHE: (&str, &str) = ("MODELSCOPE_CACHE", "ms_cache");

#[derive(Debug, Serialize)]
struct VadKwargs {
    max_single_segment_time: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeMessage<'a> {
    Load {
        hub: &'a str,
        model_id: &'a str,
        device: &'a str,
        vad_model: Option<&'a str>,
        vad_kwargs: VadKwargs,
        trust_remote_code: bool,
        remote_code: Option<&'a str>,
    },
    Generate {
        input: &'a Path,
        language: &'a str,
        use_itn: bool,
        batch_size_s: u32,
        cache: &'a serde_json::Map<String, serde_json::Value>,
    },
    Devices,
}

impl<'a> BridgeMessage<'a> {
    fn load(config: &'a BackendConfig) -> Self {
        BridgeMessage::Load {
            hub: &config.hub,
            model_id: &config.model_id,
            device: &config.device,
            vad_model: config.vad_model.as_deref(),
            vad_kwargs: VadKwargs {
                max_single_segment_time: config.max_single_segment_ms,
            },
            trust_remote_code: config.trust_remote_code,
            remote_code: config.remote_code.as_deref(),
        }
    }

    fn generate(request: &'a InferenceRequest) -> Self {
        BridgeMessage::Generate {
            input: &request.input,
            language: &request.language,
            use_itn: request.use_itn,
            batch_size_s: request.batch_size_s,
            cache: &request.cache,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

impl BridgeReply {
    fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).with_context(|| format!("malformed reply from worker: {}", line.trim()))
    }

    fn into_result(self) -> Result<serde_json::Value> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(anyhow!(self.error.unwrap_or_else(|| "worker reported an unspecified error".to_string())))
        }
    }
}

/// Spawns one worker process per constructed recognizer.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    command: String,
    args: Vec<String>,
    envs: Vec<(String, PathBuf)>,
}

impl ProcessBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            envs: Vec::new(),
        }
    }

    /// Share one cache root between all hubs. The root is created and made
    /// absolute here, so workers started from any directory agree on it.
    pub fn with_cache_root(mut self, root: &Path) -> std::io::Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        std::fs::create_dir_all(&root)?;

        self.envs = [HF_CACHE, MODELSCOPE_CACHE]
            .into_iter()
            .map(|(var, dir)| (var.to_string(), root.join(dir)))
            .collect();
        Ok(self)
    }

    fn spawn(&self) -> Result<WorkerChannel> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(self.envs.iter().map(|(var, value)| (var, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start worker `{}`", self.command))?;

        let pipes = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, BufReader::new(stdout))),
            _ => None,
        };
        let Some((stdin, stdout)) = pipes else {
            terminate(&mut child);
            bail!("worker `{}` started without stdio pipes", self.command);
        };

        Ok(WorkerChannel { child, stdin, stdout })
    }
}

impl ModelBackend for ProcessBackend {
    fn construct(&self, config: &BackendConfig) -> Result<RecognizerHandle> {
        info!(
            command = %self.command,
            hub = %config.hub,
            model_id = %config.model_id,
            device = %config.device,
            "Starting recognizer worker"
        );

        let mut channel = self.spawn()?;
        if let Err(e) = channel.call(&BridgeMessage::load(config)) {
            terminate(&mut channel.child);
            return Err(e);
        }

        debug!(pid = channel.child.id(), "Recognizer worker loaded model");
        let handle: RecognizerHandle = Arc::new(ProcessRecognizer {
            channel: Mutex::new(channel),
        });
        Ok(handle)
    }
}

/// Asks the worker's own runtime, since that is what will run the model.
impl AcceleratorProbe for ProcessBackend {
    fn cuda_available(&self) -> Result<bool> {
        let mut channel = self.spawn()?;
        let reply = channel.call(&BridgeMessage::Devices);
        terminate(&mut channel.child);

        let devices = reply?;
        devices
            .get("cuda")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| anyhow!("worker did not report CUDA availability: {}", devices))
    }
}

struct WorkerChannel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerChannel {
    fn call(&mut self, message: &BridgeMessage<'_>) -> Result<serde_json::Value> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .context("worker closed its input")?;

        let mut reply = String::new();
        if self.stdout.read_line(&mut reply)? == 0 {
            let status = self
                .child
                .try_wait()
                .ok()
                .flatten()
                .map(|status| status.to_string())
                .unwrap_or_else(|| "still running".to_string());
            bail!("worker exited before replying ({})", status);
        }
        BridgeReply::parse(&reply)?.into_result()
    }
}

/// Recognizer backed by a worker process. Calls are serialized per handle.
pub struct ProcessRecognizer {
    channel: Mutex<WorkerChannel>,
}

impl Recognizer for ProcessRecognizer {
    fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value> {
        self.channel.lock().call(&BridgeMessage::generate(request))
    }
}

impl Drop for ProcessRecognizer {
    fn drop(&mut self) {
        terminate(&mut self.channel.get_mut().child);
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(pid = child.id(), "Failed to kill recognizer worker: {}", e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::model::ConstructionOptions;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_load_message_layout() {
        let config = ConstructionOptions::default().backend_config("hf", "FunAudioLLM/SenseVoiceSmall", "cuda:0");
        let value = serde_json::to_value(BridgeMessage::load(&config)).unwrap();

        assert_eq!(
            value,
            json!({
                "op": "load",
                "hub": "hf",
                "model_id": "FunAudioLLM/SenseVoiceSmall",
                "device": "cuda:0",
                "vad_model": "fsmn-vad",
                "vad_kwargs": { "max_single_segment_time": 30000 },
                "trust_remote_code": false,
                "remote_code": null
            })
        );
    }

    #[test]
    fn test_generate_message_layout() {
        let request = InferenceRequest {
            input: PathBuf::from("/tmp/asr-1.wav"),
            language: "auto".to_string(),
            use_itn: true,
            batch_size_s: 60,
            cache: serde_json::Map::new(),
        };
        let value = serde_json::to_value(BridgeMessage::generate(&request)).unwrap();

        assert_eq!(value["op"], "generate");
        assert_eq!(value["input"], "/tmp/asr-1.wav");
        assert_eq!(value["batch_size_s"], 60);
        assert_eq!(value["cache"], json!({}));
    }

    #[test]
    fn test_reply_parsing() {
        let ok = BridgeReply::parse("{\"ok\": true, \"result\": [{\"text\": \"hi\"}]}\n").unwrap();
        assert_eq!(ok.into_result().unwrap(), json!([{ "text": "hi" }]));

        let loaded = BridgeReply::parse(r#"{"ok": true}"#).unwrap();
        assert_eq!(loaded.into_result().unwrap(), serde_json::Value::Null);

        let failed = BridgeReply::parse(r#"{"ok": false, "error": "No module named 'funasr'"}"#).unwrap();
        assert_eq!(failed.into_result().unwrap_err().to_string(), "No module named 'funasr'");

        assert!(BridgeReply::parse("Downloading model...").is_err());
    }

    #[test]
    fn test_missing_command_is_construction_error() {
        let backend = ProcessBackend::new("definitely-not-a-real-worker-binary", Vec::new());
        let config = ConstructionOptions::default().backend_config("ms", "iic/SenseVoiceSmall", "cpu");

        let err = backend.construct(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("failed to start worker"));
    }

    /// A worker that answers every request with `reply`, after shell expansion.
    #[cfg(unix)]
    fn scripted_worker(reply: &str) -> ProcessBackend {
        let script = format!("while read -r line; do printf '%s\\n' \"{}\"; done", reply);
        ProcessBackend::new("sh", vec!["-c".to_string(), script])
    }

    #[test]
    fn test_devices_message_layout() {
        let value = serde_json::to_value(BridgeMessage::Devices).unwrap();
        assert_eq!(value, json!({ "op": "devices" }));
    }

    #[cfg(unix)]
    #[test]
    fn test_cuda_answer_comes_from_worker() {
        let gpu = scripted_worker(r#"{\"ok\": true, \"result\": {\"cuda\": true}}"#);
        assert!(gpu.cuda_available().unwrap());

        let no_gpu = scripted_worker(r#"{\"ok\": true, \"result\": {\"cuda\": false}}"#);
        assert!(!no_gpu.cuda_available().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_cuda_check_failures_are_errors_not_false() {
        let no_torch = scripted_worker(r#"{\"ok\": false, \"error\": \"ModuleNotFoundError: No module named 'torch'\"}"#);
        let err = no_torch.cuda_available().unwrap_err();
        assert_eq!(err.to_string(), "ModuleNotFoundError: No module named 'torch'");

        let silent = scripted_worker(r#"{\"ok\": true, \"result\": {}}"#);
        assert!(silent.cuda_available().is_err());

        let missing = ProcessBackend::new("definitely-not-a-real-worker-binary", Vec::new());
        assert!(missing.cuda_available().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_root_is_passed_to_worker_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("models");
        let backend = scripted_worker(r#"{\"ok\": false, \"error\": \"$HF_HOME|$MODELSCOPE_CACHE\"}"#)
            .with_cache_root(&root)
            .unwrap();
        assert!(root.is_dir());

        let config = ConstructionOptions::default().backend_config("ms", "iic/SenseVoiceSmall", "cpu");
        let err = backend.construct(&config).err().unwrap();
        assert_eq!(
            err.to_string(),
            format!("{}|{}", root.join("hf_home").display(), root.join("ms_cache").display())
        );
        assert_ne!(std::env::var_os("HF_HOME"), Some(root.join("hf_home").into_os_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_error_text_is_kept_verbatim() {
        let backend = scripted_worker(r#"{\"ok\": false, \"error\": \"KeyError: 'model_conf'\"}"#);
        let config = ConstructionOptions::default().backend_config("hf", "FunAudioLLM/SenseVoiceSmall", "cpu");

        let err = backend.construct(&config).err().unwrap();
        assert_eq!(err.to_string(), "KeyError: 'model_conf'");
    }
}
