//! Plan-driven haptic playback
//!
//! `schedule` fixes a start reference `t0` and arms every command for
//! `t0 + tMs`. Each armed batch is stamped with the engine generation at arm
//! time; `stop_all` bumps the generation and aborts the batch tasks, so nothing
//! armed before a stop can reach the backend afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::backend::HapticBackend;
use crate::error::BackendError;
use crate::failure::{FailureLog, FailureSource};
use crate::timebase::clamp01;
use crate::types::{EngineCapabilities, HapticCommand, ImpactStyle};

pub struct HapticsEngine {
    backend: Arc<dyn HapticBackend>,
    failures: Arc<FailureLog>,
    generation: Arc<AtomicU64>,
    intensity_scale: Mutex<f64>,
    batches: Mutex<Vec<JoinHandle<()>>>,
    ready: Mutex<Arc<OnceCell<()>>>,
}

impl HapticsEngine {
    pub fn new(backend: Arc<dyn HapticBackend>, failures: Arc<FailureLog>) -> Self {
        Self {
            backend,
            failures,
            generation: Arc::new(AtomicU64::new(0)),
            intensity_scale: Mutex::new(1.0),
            batches: Mutex::new(Vec::new()),
            ready: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// Prepare the backend once. Concurrent callers all wait for the same
    /// prepare. Failure leaves the engine usable; primitives will simply fail
    /// and be logged.
    pub async fn init(&self) {
        let Some(ready) = self.ready.lock().ok().map(|r| Arc::clone(&*r)) else {
            return;
        };
        ready
            .get_or_init(|| async {
                if let Err(e) = self.backend.prepare().await {
                    self.failures.record(FailureSource::Haptics, "prepare", &e);
                }
            })
            .await;
    }

    pub fn is_initialized(&self) -> bool {
        self.ready
            .lock()
            .map(|r| r.initialized())
            .unwrap_or(false)
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.backend.capabilities()
    }

    /// Scale applied to impacts armed from now on.
    pub fn set_intensity(&self, v01: f64) {
        if let Ok(mut scale) = self.intensity_scale.lock() {
            *scale = clamp01(v01);
        }
    }

    pub fn intensity(&self) -> f64 {
        self.intensity_scale.lock().map(|s| *s).unwrap_or(1.0)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Arm `commands` relative to now. Must be called inside a tokio runtime.
    pub fn schedule(&self, commands: &[HapticCommand]) {
        let caps = self.capabilities();
        let mut armed: Vec<HapticCommand> = commands
            .iter()
            .filter(|cmd| is_playable(cmd, &caps))
            .cloned()
            .collect();
        let ignored = commands.len() - armed.len();
        if ignored > 0 {
            debug!(ignored, "skipping haptic commands the backend cannot play");
        }
        if armed.is_empty() {
            return;
        }
        armed.sort_by_key(HapticCommand::t_ms);

        let t0 = Instant::now();
        let stamp = self.generation.load(Ordering::SeqCst);
        let scale = self.intensity();
        let generation = Arc::clone(&self.generation);
        let backend = Arc::clone(&self.backend);
        let failures = Arc::clone(&self.failures);

        debug!(commands = armed.len(), generation = stamp, "arming haptic batch");

        let handle = tokio::spawn(async move {
            for cmd in armed {
                sleep_until(t0 + Duration::from_millis(cmd.t_ms())).await;
                if generation.load(Ordering::SeqCst) != stamp {
                    return;
                }
                dispatch(backend.as_ref(), &failures, &cmd, scale);
            }
        });

        if let Ok(mut batches) = self.batches.lock() {
            batches.retain(|h| !h.is_finished());
            batches.push(handle);
        }
    }

    /// Fire a single command right away, outside any batch.
    pub fn fire(&self, cmd: &HapticCommand) {
        if is_playable(cmd, &self.capabilities()) {
            dispatch(self.backend.as_ref(), &self.failures, cmd, self.intensity());
        }
    }

    /// Cancel everything armed so far. Safe from any state, repeatable.
    pub fn stop_all(&self) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut batches) = self.batches.lock() {
            for handle in batches.drain(..) {
                handle.abort();
            }
        }
        debug!(generation = gen, "haptic batches cancelled");
    }

    pub fn dispose(&self) {
        self.stop_all();
        let previous = self
            .ready
            .lock()
            .map(|mut r| std::mem::replace(&mut *r, Arc::new(OnceCell::new())));
        if previous.map_or(false, |r| r.initialized()) {
            info!("haptics engine disposed");
        }
    }

    /// Batches still waiting on a timer.
    pub fn pending_batches(&self) -> usize {
        self.batches
            .lock()
            .map(|b| b.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

impl Drop for HapticsEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn is_playable(cmd: &HapticCommand, caps: &EngineCapabilities) -> bool {
    match cmd {
        HapticCommand::Impact { .. } | HapticCommand::Notification { .. } => true,
        HapticCommand::Pause { .. } => false,
        HapticCommand::Continuous { .. } => caps.continuous_haptics,
        HapticCommand::Curve { .. } => caps.param_curves,
    }
}

/// Invoke the backend primitive for `cmd`. Impact style follows the scaled intensity.
fn dispatch(backend: &dyn HapticBackend, failures: &FailureLog, cmd: &HapticCommand, scale: f64) {
    let result = match cmd {
        HapticCommand::Impact { intensity01, .. } => {
            let v = clamp01(intensity01 * scale);
            backend.impact(ImpactStyle::from_intensity(v), v)
        }
        HapticCommand::Notification { kind, .. } => backend.notification(*kind),
        HapticCommand::Continuous {
            duration_ms,
            intensity01,
            sharpness01,
            ..
        } => backend.continuous(*duration_ms, clamp01(intensity01 * scale), clamp01(*sharpness01)),
        HapticCommand::Curve { param, points, .. } => backend.curve(*param, points),
        HapticCommand::Pause { .. } => Ok(()),
    };
    match result {
        Ok(()) => {}
        // Advertised but not implemented by the backend: skip like audio does.
        Err(BackendError::Unsupported(what)) => {
            debug!(operation = cmd.kind_name(), unsupported = what, "haptic primitive not available");
        }
        Err(e) => failures.record(FailureSource::Haptics, cmd.kind_name(), &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HapticEvent, RecordingHaptics};
    use crate::types::{CurveParam, NotificationKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use pretty_assertions::assert_eq;

    fn engine() -> (HapticsEngine, Arc<RecordingHaptics>, Arc<FailureLog>) {
        let backend = Arc::new(RecordingHaptics::new());
        let failures = Arc::new(FailureLog::new());
        let engine = HapticsEngine::new(backend.clone(), failures.clone());
        (engine, backend, failures)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_before_first_fire_cancels_everything() {
        let (engine, backend, _) = engine();
        engine.init().await;
        engine.schedule(&[
            HapticCommand::impact(0, 0.5),
            HapticCommand::impact(40, 0.9),
            HapticCommand::impact(400, 0.2),
        ]);
        engine.stop_all();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.count(), 0);
        assert_eq!(engine.pending_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_never_fire_early() {
        let (engine, backend, _) = engine();
        let t0 = Instant::now();
        // Deliberately unsorted.
        engine.schedule(&[
            HapticCommand::impact(500, 0.9),
            HapticCommand::impact(120, 0.3),
            HapticCommand::Notification {
                t_ms: 250,
                kind: NotificationKind::Success,
            },
        ]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let timeline = backend.timeline();
        assert_eq!(timeline.len(), 3);
        let offsets: Vec<u64> = timeline
            .iter()
            .map(|(at, _)| at.duration_since(t0).as_millis() as u64)
            .collect();
        assert_eq!(offsets, vec![120, 250, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_batch_drops_the_rest() {
        let (engine, backend, _) = engine();
        engine.schedule(&[HapticCommand::impact(10, 0.5), HapticCommand::impact(1000, 0.5)]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(backend.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intensity_scale_drives_style() {
        let (engine, backend, _) = engine();
        engine.set_intensity(0.5);
        engine.schedule(&[HapticCommand::impact(0, 1.0)]);
        // Captured at arm time; later changes do not touch the armed batch.
        engine.set_intensity(1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            backend.events(),
            vec![HapticEvent::Impact {
                style: ImpactStyle::Medium,
                intensity01: 0.5
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_commands_are_ignored() {
        let (engine, backend, failures) = engine();
        engine.schedule(&[
            HapticCommand::Pause {
                t_ms: 0,
                duration_ms: 50,
            },
            HapticCommand::Continuous {
                t_ms: 0,
                duration_ms: 200,
                intensity01: 0.5,
                sharpness01: 0.5,
            },
            HapticCommand::Curve {
                t_ms: 0,
                param: CurveParam::Sharpness,
                points: vec![],
            },
            HapticCommand::impact(5, 0.3),
        ]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.count(), 1);
        assert_eq!(failures.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_does_not_abort_batch() {
        let (engine, backend, failures) = engine();
        backend.set_failing(true);
        engine.schedule(&[HapticCommand::impact(0, 0.5), HapticCommand::impact(30, 0.5)]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.set_failing(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(failures.count(FailureSource::Haptics), 1);
        assert_eq!(backend.count(), 1);
    }

    #[tokio::test]
    async fn test_stop_and_dispose_are_repeatable() {
        let (engine, backend, _) = engine();
        engine.stop_all();
        engine.dispose();
        engine.init().await;
        engine.init().await;
        assert_eq!(backend.prepare_calls(), 1);
        assert!(engine.is_initialized());
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.generation(), 4);
        assert!(!engine.is_initialized());

        engine.init().await;
        assert_eq!(backend.prepare_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertised_but_unimplemented_primitive_is_not_a_failure() {
        let backend = Arc::new(RecordingHaptics::with_capabilities(EngineCapabilities {
            continuous_haptics: true,
            param_curves: true,
            ..EngineCapabilities::default()
        }));
        let failures = Arc::new(FailureLog::new());
        let engine = HapticsEngine::new(backend.clone(), failures.clone());
        engine.schedule(&[
            HapticCommand::Curve {
                t_ms: 0,
                param: CurveParam::Intensity,
                points: vec![],
            },
            HapticCommand::impact(5, 0.3),
        ]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.count(), 1);
        assert_eq!(failures.count(FailureSource::Haptics), 0);
    }

    struct SlowPrepare {
        inner: RecordingHaptics,
        prepared: AtomicBool,
    }

    #[async_trait]
    impl HapticBackend for SlowPrepare {
        async fn prepare(&self) -> Result<(), BackendError> {
            self.inner.prepare().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.prepared.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn impact(&self, style: ImpactStyle, v: f64) -> Result<(), BackendError> {
            self.inner.impact(style, v)
        }

        fn notification(&self, kind: NotificationKind) -> Result<(), BackendError> {
            self.inner.notification(kind)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_init_waits_for_prepare() {
        let backend = Arc::new(SlowPrepare {
            inner: RecordingHaptics::new(),
            prepared: AtomicBool::new(false),
        });
        let engine = HapticsEngine::new(backend.clone(), Arc::new(FailureLog::new()));
        let t0 = Instant::now();
        let second = async {
            tokio::task::yield_now().await;
            engine.init().await;
            backend.prepared.load(Ordering::SeqCst)
        };
        let ((), prepared_when_second_returned) = tokio::join!(engine.init(), second);
        assert!(prepared_when_second_returned);
        assert!(t0.elapsed() >= Duration::from_millis(50));
        assert_eq!(backend.inner.prepare_calls(), 1);
    }
}
