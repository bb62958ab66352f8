//! Best-effort failure sink
//!
//! Sensory output is an enhancement; a failed primitive must never abort a
//! schedule or surface as an error to the host. Every engine routes swallowed
//! backend errors through one [`FailureLog`] so they stay visible in logs and
//! countable in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::error::BackendError;

/// Which subsystem a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    Haptics,
    Audio,
}

impl FailureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureSource::Haptics => "haptics",
            FailureSource::Audio => "audio",
        }
    }
}

#[derive(Debug, Default)]
pub struct FailureLog {
    haptics: AtomicU64,
    audio: AtomicU64,
    last: Mutex<Option<String>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and count a swallowed backend error.
    pub fn record(&self, source: FailureSource, operation: &str, err: &BackendError) {
        warn!(
            source = source.as_str(),
            operation,
            error = %err,
            "sensory backend call failed"
        );
        let counter = match source {
            FailureSource::Haptics => &self.haptics,
            FailureSource::Audio => &self.audio,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(format!("{}.{}: {}", source.as_str(), operation, err));
        }
    }

    /// Run `f` and record its error, if any. Returns whether it succeeded.
    pub fn guard<F>(&self, source: FailureSource, operation: &str, f: F) -> bool
    where
        F: FnOnce() -> Result<(), BackendError>,
    {
        match f() {
            Ok(()) => true,
            Err(e) => {
                self.record(source, operation, &e);
                false
            }
        }
    }

    pub fn count(&self, source: FailureSource) -> u64 {
        match source {
            FailureSource::Haptics => self.haptics.load(Ordering::Relaxed),
            FailureSource::Audio => self.audio.load(Ordering::Relaxed),
        }
    }

    pub fn total(&self) -> u64 {
        self.count(FailureSource::Haptics) + self.count(FailureSource::Audio)
    }

    pub fn last_message(&self) -> Option<String> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}
