//! # Warm-up Coordination
//!
//! Constructing the recognizer can take minutes (asset download plus model
//! load), so it happens on a background thread while the HTTP surface keeps
//! answering. The coordinator owns the only copy of the warm-up state and
//! serializes every transition through one mutex.
//!
//! ## State Machine:
//! ```text
//! Idle ──ensure_loading──▶ Loading ──ok──▶ Ready(handle)      (final)
//!                            │  ▲
//!                          err  └──ensure_loading── Failed(message)
//!                            ▼
//!                      Failed(message)
//! ```
//!
//! ## Guarantees:
//! - **Single-flight**: at most one construction attempt runs at any time,
//!   no matter how many callers race on [`WarmupCoordinator::ensure_loading`]
//! - **Never blocks**: callers get a handle or a typed error immediately
//! - **Unlimited re-arm**: the probe after a failure starts a fresh attempt
//! - **Single publication point**: the handle becomes visible only when the
//!   worker stores it into `Ready`
//!
//! ## Readiness Contract:
//! The readiness endpoint calls [`WarmupCoordinator::probe`], which triggers
//! loading before reporting. The first health check therefore doubles as the
//! load trigger; no separate "start" call exists.

use crate::transcription::model::{panic_message, RecognizerHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};

/// Body of one warm-up attempt. Runs on the warm-up thread.
pub type LoadFn = dyn Fn() -> anyhow::Result<RecognizerHandle> + Send + Sync;

/// Warm-up state. Exactly one variant holds at any instant.
#[derive(Clone)]
pub enum WarmupState {
    Idle,

    /// An attempt is in flight. `previous_error` keeps the message of the
    /// failed attempt this one replaces, until the new attempt completes.
    Loading { previous_error: Option<String> },

    Ready(RecognizerHandle),

    Failed(String),
}

impl WarmupState {
    pub fn name(&self) -> &'static str {
        match self {
            WarmupState::Idle => "idle",
            WarmupState::Loading { .. } => "loading",
            WarmupState::Ready(_) => "ready",
            WarmupState::Failed(_) => "failed",
        }
    }

    /// Message of the most recent failed attempt, if it has not been superseded.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            WarmupState::Failed(message) => Some(message),
            WarmupState::Loading { previous_error } => previous_error.as_deref(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for WarmupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarmupState::Idle => write!(f, "Idle"),
            WarmupState::Loading { previous_error } => f.debug_struct("Loading").field("previous_error", previous_error).finish(),
            WarmupState::Ready(_) => write!(f, "Ready(..)"),
            WarmupState::Failed(message) => f.debug_tuple("Failed").field(message).finish(),
        }
    }
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmupStatus {
    pub ready: bool,
    pub loading: bool,
    pub error: Option<String>,
}

/// Why no recognizer could be handed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarmupError {
    /// The first attempt has not finished yet. Poll again.
    #[error("model is loading, please retry shortly")]
    WarmingUp,

    /// The last completed attempt failed. Loading has been re-armed.
    #[error("model load failed: {0}")]
    Unavailable(String),
}

struct Inner {
    state: WarmupState,
    attempts: u64,
}

/// Single-flight background initializer for the recognizer.
pub struct WarmupCoordinator {
    inner: Arc<Mutex<Inner>>,
    load: Arc<LoadFn>,
}

impl WarmupCoordinator {
    pub fn new(load: Arc<LoadFn>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: WarmupState::Idle,
                attempts: 0,
            })),
            load,
        }
    }

    /// Start an attempt unless one is running or the recognizer is ready.
    ///
    /// Idempotent and non-blocking: the decision and the `Loading` transition
    /// happen under the mutex, the construction itself on a new thread.
    pub fn ensure_loading(&self) {
        let attempt = {
            let mut inner = self.inner.lock();
            let previous_error = match &inner.state {
                WarmupState::Ready(_) | WarmupState::Loading { .. } => return,
                WarmupState::Idle => None,
                WarmupState::Failed(message) => Some(message.clone()),
            };
            inner.state = WarmupState::Loading { previous_error };
            inner.attempts += 1;
            inner.attempts
        };

        let state = self.inner.clone();
        let load = self.load.clone();
        let spawned = thread::Builder::new()
            .name(format!("warmup-{}", attempt))
            .spawn(move || run_attempt(state, load, attempt));

        if let Err(e) = spawned {
            error!(attempt, "Failed to spawn warm-up thread: {}", e);
            self.inner.lock().state = WarmupState::Failed(format!("failed to start warm-up: {}", e));
        }
    }

    /// Hand out the recognizer, or explain why not. Triggers loading.
    pub fn get_runtime(&self) -> Result<RecognizerHandle, WarmupError> {
        self.ensure_loading();

        let inner = self.inner.lock();
        match &inner.state {
            WarmupState::Ready(handle) => Ok(handle.clone()),
            state => match state.last_error() {
                Some(message) => Err(WarmupError::Unavailable(message.to_string())),
                None => Err(WarmupError::WarmingUp),
            },
        }
    }

    /// Pure read of the current status. Does not trigger loading.
    pub fn probe_status(&self) -> WarmupStatus {
        let inner = self.inner.lock();
        WarmupStatus {
            ready: matches!(inner.state, WarmupState::Ready(_)),
            loading: matches!(inner.state, WarmupState::Loading { .. }),
            error: inner.state.last_error().map(str::to_string),
        }
    }

    /// Readiness probe: trigger loading, then report.
    pub fn probe(&self) -> WarmupStatus {
        self.ensure_loading();
        self.probe_status()
    }

    /// Number of construction attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.lock().attempts
    }

    pub fn state(&self) -> WarmupState {
        self.inner.lock().state.clone()
    }
}

fn run_attempt(state: Arc<Mutex<Inner>>, load: Arc<LoadFn>, attempt: u64) {
    info!(attempt, "Warm-up started");
    let started = Instant::now();

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| load())) {
        Ok(Ok(handle)) => Ok(handle),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload.as_ref())),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut inner = state.lock();
    match outcome {
        Ok(handle) => {
            info!(attempt, elapsed_ms, "Warm-up finished, model ready");
            inner.state = WarmupState::Ready(handle);
        }
        Err(message) => {
            error!(attempt, elapsed_ms, "Warm-up failed: {}", message);
            inner.state = WarmupState::Failed(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::model::{ConstructionOptions, ModelBackend};
    use crate::transcription::testing::{wait_for, Gate, StubBackend};
    use std::time::Duration;

    const SETTLE: Duration = Duration::from_secs(5);

    fn coordinator(backend: &Arc<StubBackend>) -> WarmupCoordinator {
        let backend = backend.clone();
        let options = ConstructionOptions::default();
        WarmupCoordinator::new(Arc::new(move || {
            let config = options.backend_config("ms", "iic/SenseVoiceSmall", "cpu");
            backend.construct(&config)
        }))
    }

    fn settled(coordinator: &WarmupCoordinator) -> bool {
        !matches!(coordinator.state(), WarmupState::Loading { .. } | WarmupState::Idle)
    }

    #[test]
    fn test_starts_idle() {
        let backend = Arc::new(StubBackend::new());
        let coordinator = coordinator(&backend);

        assert_eq!(
            coordinator.probe_status(),
            WarmupStatus { ready: false, loading: false, error: None }
        );
        // Pure read does not trigger anything
        assert_eq!(coordinator.attempts(), 0);
        assert_eq!(backend.constructions(), 0);
    }

    #[test]
    fn test_single_flight_under_concurrent_callers() {
        let gate = Gate::new();
        let backend = Arc::new(StubBackend::new().gated(gate.clone()));
        let coordinator = Arc::new(coordinator(&backend));

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                std::thread::spawn(move || coordinator.ensure_loading())
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        assert!(coordinator.probe_status().loading);
        gate.open();
        assert!(wait_for(SETTLE, || coordinator.probe_status().ready));

        assert_eq!(coordinator.attempts(), 1);
        assert_eq!(backend.constructions(), 1);
    }

    #[test]
    fn test_fail_fast_while_loading() {
        let gate = Gate::new();
        let backend = Arc::new(StubBackend::new().gated(gate.clone()));
        let coordinator = coordinator(&backend);

        let started = Instant::now();
        let result = coordinator.get_runtime();

        assert_eq!(result.err(), Some(WarmupError::WarmingUp));
        assert!(started.elapsed() < Duration::from_secs(1));
        gate.open();
    }

    #[test]
    fn test_ready_hands_out_shared_handle() {
        let backend = Arc::new(StubBackend::new());
        let coordinator = coordinator(&backend);

        coordinator.ensure_loading();
        assert!(wait_for(SETTLE, || coordinator.probe_status().ready));

        let first = coordinator.get_runtime().unwrap();
        let second = coordinator.get_runtime().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_no_rearm_after_success() {
        let backend = Arc::new(StubBackend::new());
        let coordinator = coordinator(&backend);

        coordinator.ensure_loading();
        assert!(wait_for(SETTLE, || coordinator.probe_status().ready));

        for _ in 0..50 {
            coordinator.ensure_loading();
            coordinator.probe();
            assert!(coordinator.get_runtime().is_ok());
        }
        assert_eq!(backend.constructions(), 1);
    }

    #[test]
    fn test_failure_is_reported_and_rearmed() {
        let backend = Arc::new(StubBackend::new().failing_first(1));
        let coordinator = coordinator(&backend);

        coordinator.ensure_loading();
        assert!(wait_for(SETTLE, || settled(&coordinator)));

        let status = coordinator.probe_status();
        assert!(!status.ready);
        assert!(!status.loading);
        assert_eq!(status.error.as_deref(), Some("transient failure #1"));

        // The next call re-arms exactly one attempt and still reports the old error
        let result = coordinator.get_runtime();
        assert_eq!(result.err(), Some(WarmupError::Unavailable("transient failure #1".to_string())));
        assert!(wait_for(SETTLE, || coordinator.probe_status().ready));

        assert_eq!(coordinator.attempts(), 2);
        assert_eq!(backend.constructions(), 2);
        assert_eq!(coordinator.probe_status().error, None);
    }

    #[test]
    fn test_rearm_is_single_flight() {
        let gate = Gate::new();
        let backend = Arc::new(StubBackend::new().failing_first(1).gated(gate.clone()));
        let coordinator = coordinator(&backend);

        gate.open();
        coordinator.ensure_loading();
        assert!(wait_for(SETTLE, || settled(&coordinator)));

        for _ in 0..10 {
            coordinator.ensure_loading();
        }
        assert!(wait_for(SETTLE, || coordinator.probe_status().ready));
        assert_eq!(backend.constructions(), 2);
    }

    #[test]
    fn test_panicking_loader_becomes_failed() {
        let coordinator = WarmupCoordinator::new(Arc::new(|| -> anyhow::Result<RecognizerHandle> {
            panic!("CUDA error: illegal memory access")
        }));

        coordinator.ensure_loading();
        assert!(wait_for(SETTLE, || settled(&coordinator)));

        match coordinator.state() {
            WarmupState::Failed(message) => assert!(message.contains("illegal memory access")),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn test_probe_triggers_loading() {
        let backend = Arc::new(StubBackend::new());
        let coordinator = coordinator(&backend);

        let first = coordinator.probe();
        assert!(first.loading || first.ready);
        assert!(wait_for(SETTLE, || coordinator.probe().ready));
        assert_eq!(backend.constructions(), 1);
    }
}
