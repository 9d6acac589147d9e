//! # Device Selection
//!
//! Resolves the user's device preference into the concrete execution target
//! string handed to the recognition backend. An explicit preference always
//! wins; `"auto"` asks the recognition runtime whether CUDA is usable and
//! falls back to the CPU.

use std::sync::OnceLock;
use tracing::{info, warn};

/// Preference value that asks for hardware detection.
pub const AUTO_DEVICE: &str = "auto";

/// Software execution target used when no accelerator is available.
pub const DEFAULT_DEVICE: &str = "cpu";

/// Target reported when a CUDA GPU is present.
pub const ACCELERATED_DEVICE: &str = "cuda:0";

/// Hardware capability check.
pub trait AcceleratorProbe: Send + Sync {
    /// `Ok(false)` is a definite "no GPU"; an error means the answer is unknown.
    fn cuda_available(&self) -> anyhow::Result<bool>;
}

/// Outcome of one capability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Accelerated,
    CpuOnly,
    /// The check itself failed. Runs on the CPU, but is not remembered.
    Unknown(String),
}

impl Detection {
    pub fn device(&self) -> &'static str {
        match self {
            Detection::Accelerated => ACCELERATED_DEVICE,
            Detection::CpuOnly | Detection::Unknown(_) => DEFAULT_DEVICE,
        }
    }
}

/// Run `probe` once and classify the answer.
pub fn detect(probe: &dyn AcceleratorProbe) -> Detection {
    info!("Detecting best available compute device...");
    match probe.cuda_available() {
        Ok(true) => {
            info!("Selected {} for inference", ACCELERATED_DEVICE);
            Detection::Accelerated
        }
        Ok(false) => {
            info!("Using CPU for inference (no GPU acceleration available)");
            Detection::CpuOnly
        }
        Err(e) => {
            warn!("Could not determine CUDA availability, using CPU: {:#}", e);
            Detection::Unknown(format!("{:#}", e))
        }
    }
}

/// Resolves device preferences, caching definite detection results.
pub struct DeviceSelector {
    probe: Box<dyn AcceleratorProbe>,
    detected: OnceLock<Detection>,
}

impl DeviceSelector {
    pub fn new(probe: Box<dyn AcceleratorProbe>) -> Self {
        Self {
            probe,
            detected: OnceLock::new(),
        }
    }

    /// Resolve `requested` to a concrete device. Never fails.
    pub fn resolve(&self, requested: &str) -> String {
        let requested = requested.trim();
        if requested != AUTO_DEVICE {
            return requested.to_string();
        }
        if let Some(detection) = self.detected.get() {
            return detection.device().to_string();
        }

        let detection = detect(self.probe.as_ref());
        let device = detection.device().to_string();
        if !matches!(detection, Detection::Unknown(_)) {
            let _ = self.detected.set(detection);
        }
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedAnswer {
        answer: Option<bool>,
        calls: Arc<AtomicUsize>,
    }

    impl AcceleratorProbe for FixedAnswer {
        fn cuda_available(&self) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.ok_or_else(|| anyhow::anyhow!("No module named 'torch'"))
        }
    }

    fn fixed(answer: Option<bool>) -> (FixedAnswer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (FixedAnswer { answer, calls: calls.clone() }, calls)
    }

    fn selector(answer: Option<bool>) -> (DeviceSelector, Arc<AtomicUsize>) {
        let (check, calls) = fixed(answer);
        (DeviceSelector::new(Box::new(check)), calls)
    }

    #[test]
    fn test_explicit_device_wins() {
        let (selector, calls) = selector(Some(true));
        assert_eq!(selector.resolve("cpu"), "cpu");
        assert_eq!(selector.resolve("cuda:1"), "cuda:1");
        // Explicit preferences never run detection
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_auto_without_accelerator_is_cpu() {
        let (selector, _) = selector(Some(false));
        assert_eq!(selector.resolve("auto"), DEFAULT_DEVICE);
    }

    #[test]
    fn test_auto_with_accelerator() {
        let (selector, _) = selector(Some(true));
        assert_eq!(selector.resolve(" auto "), ACCELERATED_DEVICE);
    }

    #[test]
    fn test_failed_check_is_unknown_not_cpu_only() {
        let (failing, _) = fixed(None);
        assert_eq!(detect(&failing), Detection::Unknown("No module named 'torch'".to_string()));

        let (no_gpu, _) = fixed(Some(false));
        assert_eq!(detect(&no_gpu), Detection::CpuOnly);

        // Both still run on the CPU
        assert_eq!(Detection::Unknown(String::new()).device(), DEFAULT_DEVICE);
    }

    #[test]
    fn test_definite_answer_is_cached() {
        let (selector, calls) = selector(Some(false));
        selector.resolve("auto");
        selector.resolve("auto");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_answer_is_retried() {
        let (selector, calls) = selector(None);
        assert_eq!(selector.resolve("auto"), DEFAULT_DEVICE);
        assert_eq!(selector.resolve("auto"), DEFAULT_DEVICE);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
