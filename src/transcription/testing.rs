//! Stub backend and recognizer shared by the unit tests.

use crate::transcription::model::{BackendConfig, InferenceRequest, ModelBackend, Recognizer, RecognizerHandle};
use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A latch that holds construction until a test opens it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

pub enum Reply {
    Value(serde_json::Value),
    Fail(String),
    Panic,
}

pub struct StubRecognizer {
    reply: Reply,
    calls: Mutex<Vec<(InferenceRequest, bool)>>,
}

impl StubRecognizer {
    pub fn replying(value: serde_json::Value) -> Self {
        Self { reply: Reply::Value(value), calls: Mutex::new(Vec::new()) }
    }

    pub fn failing(message: &str) -> Self {
        Self { reply: Reply::Fail(message.to_string()), calls: Mutex::new(Vec::new()) }
    }

    pub fn panicking() -> Self {
        Self { reply: Reply::Panic, calls: Mutex::new(Vec::new()) }
    }

    /// Every request seen so far, with whether its input file existed at call time.
    pub fn calls(&self) -> Vec<(InferenceRequest, bool)> {
        self.calls.lock().clone()
    }

    pub fn inputs(&self) -> Vec<PathBuf> {
        self.calls.lock().iter().map(|(req, _)| req.input.clone()).collect()
    }
}

impl Recognizer for StubRecognizer {
    fn infer(&self, request: &InferenceRequest) -> Result<serde_json::Value> {
        self.calls.lock().push((request.clone(), request.input.exists()));
        match &self.reply {
            Reply::Value(value) => Ok(value.clone()),
            Reply::Fail(message) => Err(anyhow!("{}", message)),
            Reply::Panic => panic!("recognizer exploded"),
        }
    }
}

/// Backend whose outcome is scripted per hub.
pub struct StubBackend {
    failing: HashMap<String, String>,
    panicking: HashSet<String>,
    fail_first: AtomicUsize,
    gate: Option<Arc<Gate>>,
    recognizer: Arc<StubRecognizer>,
    constructions: AtomicUsize,
    seen: Mutex<Vec<BackendConfig>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            failing: HashMap::new(),
            panicking: HashSet::new(),
            fail_first: AtomicUsize::new(0),
            gate: None,
            recognizer: Arc::new(StubRecognizer::replying(serde_json::json!([{ "key": "tmp", "text": "hello" }]))),
            constructions: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_hub(mut self, hub: &str, message: &str) -> Self {
        self.failing.insert(hub.to_string(), message.to_string());
        self
    }

    pub fn panicking_hub(mut self, hub: &str) -> Self {
        self.panicking.insert(hub.to_string());
        self
    }

    /// Fail the first `count` constructions regardless of hub.
    pub fn failing_first(self, count: usize) -> Self {
        self.fail_first.store(count, Ordering::SeqCst);
        self
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_recognizer(mut self, recognizer: StubRecognizer) -> Self {
        self.recognizer = Arc::new(recognizer);
        self
    }

    pub fn recognizer(&self) -> Arc<StubRecognizer> {
        self.recognizer.clone()
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<BackendConfig> {
        self.seen.lock().clone()
    }
}

impl ModelBackend for StubBackend {
    fn construct(&self, config: &BackendConfig) -> Result<RecognizerHandle> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(config.clone());

        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.panicking.contains(&config.hub) {
            panic!("native runtime aborted while loading {}", config.model_id);
        }
        if let Some(message) = self.failing.get(&config.hub) {
            return Err(anyhow!("{}", message));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("transient failure #{}", remaining));
        }

        let handle: RecognizerHandle = self.recognizer.clone();
        Ok(handle)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
