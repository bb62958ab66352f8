//! Session orchestration
//!
//! [`SensorySession`] is the host-facing entry point. It owns one instance of
//! each engine (no globals), builds a fresh plan per `start`, drives the phase
//! clock and emits a [`SessionRecord`] when the session ends.
//!
//! Lifecycle:
//! 1. `start(config)` stops any previous run, then awaits engine init
//! 2. planned haptics (or the live generator) and audio are armed
//! 3. the phase clock advances live mode and ends the session at `durationSec`
//! 4. `stop()` or natural completion cancels everything and emits the record
//!
//! Every start/stop bumps the session run id. A start that is superseded while
//! awaiting init abandons itself instead of arming anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audio::AudioEngine;
use crate::backend::{AudioBackend, Cue, HapticBackend};
use crate::config::{SchedulerSettings, SessionConfig, SessionMode};
use crate::failure::FailureLog;
use crate::haptics::{HapticsEngine, LiveHaptics, LiveSettings};
use crate::plan::build_session_plan;
use crate::types::{
    EngineCapabilities, HapticCommand, HapticPattern, NotificationKind, SessionPhase, SessionPlan,
    SessionRecord,
};
use crate::visual::{carrier_density, sprite_intensity, VisualInputs};

#[derive(Debug, Clone)]
struct ActiveSession {
    run_id: u64,
    config: SessionConfig,
    plan: Arc<SessionPlan>,
    started_at: DateTime<Utc>,
    started: Instant,
    phase: SessionPhase,
}

impl ActiveSession {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

struct Core {
    settings: SchedulerSettings,
    failures: Arc<FailureLog>,
    haptics: HapticsEngine,
    live: LiveHaptics,
    audio: AudioEngine,
    run_id: AtomicU64,
    active: Mutex<Option<ActiveSession>>,
    records: Mutex<Option<mpsc::UnboundedSender<SessionRecord>>>,
}

impl Core {
    fn is_current(&self, id: u64) -> bool {
        self.run_id.load(Ordering::SeqCst) == id
    }

    fn active(&self) -> Option<ActiveSession> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    fn set_phase(&self, id: u64, phase: SessionPhase) -> Option<SessionConfig> {
        let mut active = self.active.lock().ok()?;
        let session = active.as_mut().filter(|s| s.run_id == id)?;
        session.phase = phase;
        Some(session.config.clone())
    }

    fn apply_phase(&self, id: u64, phase: SessionPhase) {
        if let Some(config) = self.set_phase(id, phase) {
            if matches!(config.mode, SessionMode::Live { .. }) {
                self.live.update_phase(phase);
            }
            debug!(run_id = id, phase = phase.as_str(), "session phase");
        }
    }

    /// End the active session if it belongs to `id` (or any, when `id` is None).
    async fn finish(&self, id: Option<u64>, completed: bool) {
        let ended = match self.active.lock() {
            Ok(mut active) => {
                let owned = active
                    .as_ref()
                    .map_or(false, |s| id.map_or(true, |id| s.run_id == id));
                if owned {
                    active.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        self.run_id.fetch_add(1, Ordering::SeqCst);
        self.haptics.stop_all();
        self.live.stop_all();
        self.audio.stop_all().await;

        let Some(session) = ended else {
            return;
        };
        let duration_sec = session.plan.duration_sec;
        let elapsed_sec = (session.started.elapsed().as_secs_f64()).min(f64::from(duration_sec));
        let record = SessionRecord {
            id: Uuid::new_v4(),
            site: session.config.site,
            pattern: session.config.pattern(),
            peak_style: session.config.peak_style,
            duration_sec,
            duration_elapsed_sec: elapsed_sec,
            started_at: session.started_at,
            ended_at: Utc::now(),
            completed,
        };
        info!(
            record_id = %record.id,
            completed,
            elapsed_sec,
            site = record.site.as_str(),
            "session ended"
        );
        if let Ok(records) = self.records.lock() {
            if let Some(tx) = records.as_ref() {
                let _ = tx.send(record);
            }
        }
    }
}

pub struct SensorySession {
    core: Arc<Core>,
    clock: Mutex<Option<JoinHandle<()>>>,
}

impl SensorySession {
    pub fn new(
        haptic_backend: Arc<dyn HapticBackend>,
        audio_backend: Arc<dyn AudioBackend>,
        settings: SchedulerSettings,
    ) -> Self {
        let failures = Arc::new(FailureLog::new());
        let haptics = HapticsEngine::new(Arc::clone(&haptic_backend), Arc::clone(&failures));
        let live = LiveHaptics::new(haptic_backend, Arc::clone(&failures), settings.live_max_run_ms);
        let audio = AudioEngine::new(audio_backend, Arc::clone(&failures), &settings);
        Self {
            core: Arc::new(Core {
                settings,
                failures,
                haptics,
                live,
                audio,
                run_id: AtomicU64::new(0),
                active: Mutex::new(None),
                records: Mutex::new(None),
            }),
            clock: Mutex::new(None),
        }
    }

    /// Receive a record for every session that ends. Replaces any earlier receiver.
    pub fn subscribe_records(&self) -> mpsc::UnboundedReceiver<SessionRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut records) = self.core.records.lock() {
            *records = Some(tx);
        }
        rx
    }

    pub fn failures(&self) -> Arc<FailureLog> {
        Arc::clone(&self.core.failures)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.core.settings
    }

    /// Start a session. Any running session is stopped first.
    ///
    /// Returns the plan being played, or `None` when another `start`/`stop`
    /// superseded this call while engines were initializing.
    pub async fn start(&self, config: SessionConfig) -> Option<Arc<SessionPlan>> {
        let config = config.normalized();
        self.stop().await;
        let id = self.core.run_id.fetch_add(1, Ordering::SeqCst) + 1;

        let plan = Arc::new(build_session_plan(
            config.site,
            config.age_group,
            config.duration_sec(),
            &config.plan_options(),
        ));

        self.core.haptics.init().await;
        self.core.audio.init().await;
        if !self.core.is_current(id) {
            debug!(run_id = id, "session start superseded during init");
            return None;
        }

        match config.mode {
            SessionMode::Planned => self.core.haptics.schedule(&plan.haptics),
            SessionMode::Live { pattern } => self.core.live.start(
                pattern,
                SessionPhase::Settle,
                LiveSettings {
                    intensity01: config.haptics_intensity01,
                    peak_style: config.peak_style,
                    snap_density01: config.snap_density01,
                },
            ),
        }
        self.core.audio.schedule(&plan.audio);

        let started = Instant::now();
        if let Ok(mut active) = self.core.active.lock() {
            *active = Some(ActiveSession {
                run_id: id,
                config: config.clone(),
                plan: Arc::clone(&plan),
                started_at: Utc::now(),
                started,
                phase: SessionPhase::Settle,
            });
        }
        self.spawn_clock(id, started, Arc::clone(&plan));

        info!(
            run_id = id,
            site = config.site.as_str(),
            duration_sec = plan.duration_sec,
            haptics = plan.haptics.len(),
            "session started"
        );
        Some(plan)
    }

    /// Host-driven phase change. `Complete` ends the session; `Idle` is ignored.
    pub async fn update_phase(&self, phase: SessionPhase) {
        let Some(active) = self.core.active() else {
            return;
        };
        match phase {
            SessionPhase::Idle => {}
            SessionPhase::Complete => {
                self.abort_clock();
                self.core.finish(Some(active.run_id), true).await;
            }
            _ => self.core.apply_phase(active.run_id, phase),
        }
    }

    /// Stop the current session, if any, and emit its record. Repeatable.
    pub async fn stop(&self) {
        self.abort_clock();
        self.core.finish(None, false).await;
    }

    /// Tear down engines and release audio resources.
    pub async fn dispose(&self) {
        self.stop().await;
        self.core.haptics.dispose();
        self.core.live.dispose();
        self.core.audio.dispose().await;
    }

    pub fn set_haptics_intensity(&self, v01: f64) {
        self.core.haptics.set_intensity(v01);
        self.core.live.set_intensity(v01);
    }

    pub async fn set_master_volume(&self, v01: f64) {
        self.core.audio.set_master_volume(v01).await;
    }

    pub fn play_start_sound(&self) {
        self.core.haptics.fire(&HapticCommand::Notification {
            t_ms: 0,
            kind: NotificationKind::Success,
        });
        self.core.audio.play_cue(Cue::Start);
    }

    /// Two success pulses a short gap apart, plus the completion cue.
    pub async fn play_complete_sound(&self) {
        let success = HapticCommand::Notification {
            t_ms: 0,
            kind: NotificationKind::Success,
        };
        self.core.haptics.fire(&success);
        self.core.audio.play_cue(Cue::Complete);
        sleep(Duration::from_millis(self.core.settings.complete_cue_gap_ms)).await;
        self.core.haptics.fire(&success);
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::combine(self.core.haptics.capabilities(), self.core.audio.capabilities())
    }

    pub fn is_active(&self) -> bool {
        self.core.active().is_some()
    }

    pub fn current_phase(&self) -> SessionPhase {
        self.core
            .active()
            .map(|s| s.phase)
            .unwrap_or(SessionPhase::Idle)
    }

    pub fn elapsed_ms(&self) -> Option<u64> {
        self.core.active().map(|s| s.elapsed_ms())
    }

    /// Inputs for the visual loop matching the current session state.
    pub fn visual_inputs(&self) -> VisualInputs {
        let Some(session) = self.core.active() else {
            return VisualInputs::default();
        };
        let elapsed = session.elapsed_ms();
        let beat_period = self.core.settings.beat_period_ms();
        let beat_phase = (elapsed as f64 % beat_period) / beat_period;
        let pattern = session.config.pattern().unwrap_or(HapticPattern::Standard);
        VisualInputs {
            phase: session.phase,
            intensity01: sprite_intensity(
                session.phase,
                session.plan.phase_progress(elapsed),
                session.config.haptics_intensity01,
                beat_phase,
            ),
            carrier_density: carrier_density(
                pattern,
                session.phase,
                session.config.snap_density01,
                session.config.haptics_intensity01,
            ),
            music_position_ms: None,
        }
    }

    fn abort_clock(&self) {
        if let Ok(mut clock) = self.clock.lock() {
            if let Some(handle) = clock.take() {
                handle.abort();
            }
        }
    }

    /// Advance phases at their boundaries and end the session at the plan's end.
    fn spawn_clock(&self, id: u64, started: Instant, plan: Arc<SessionPlan>) {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            for window in plan.phases.iter().skip(1) {
                sleep_until(started + Duration::from_millis(window.start_ms)).await;
                if !core.is_current(id) {
                    return;
                }
                core.apply_phase(id, window.name.into());
            }
            sleep_until(started + Duration::from_millis(plan.total_ms())).await;
            if core.is_current(id) {
                core.finish(Some(id), true).await;
            }
        });
        if let Ok(mut clock) = self.clock.lock() {
            if let Some(old) = clock.replace(handle) {
                old.abort();
            }
        }
    }
}

impl Drop for SensorySession {
    fn drop(&mut self) {
        self.abort_clock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AudioEvent, HapticEvent, RecordingAudio, RecordingHaptics};
    use crate::error::BackendError;
    use crate::types::{Site, TrackId};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    fn session() -> (SensorySession, Arc<RecordingHaptics>, Arc<RecordingAudio>) {
        let haptics = Arc::new(RecordingHaptics::new());
        let audio = Arc::new(RecordingAudio::new());
        let session =
            SensorySession::new(haptics.clone(), audio.clone(), SchedulerSettings::default());
        (session, haptics, audio)
    }

    fn config(duration_sec: u32) -> SessionConfig {
        SessionConfig {
            site: Site::Fingerstick,
            duration_sec: Some(duration_sec),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_planned_session_runs_to_completion() {
        let (session, haptics, audio) = session();
        let mut records = session.subscribe_records();
        let plan = session.start(config(18)).await.expect("session started");
        assert_eq!(session.current_phase(), SessionPhase::Settle);

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(session.current_phase(), SessionPhase::Peak);
        sleep(Duration::from_millis(9_000)).await;

        assert!(!session.is_active());
        let record = records.try_recv().expect("record emitted");
        assert!(record.completed);
        assert_eq!(record.duration_sec, 18);
        assert!((record.duration_elapsed_sec - 18.0).abs() < 1e-6);
        assert_eq!(record.pattern, None);

        let impacts = haptics
            .events()
            .iter()
            .filter(|e| matches!(e, HapticEvent::Impact { .. }))
            .count();
        assert_eq!(impacts, plan.haptics.len());
        assert!(audio.events().contains(&AudioEvent::Stop { track: TrackId::Lofi }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_stop_then_start() {
        let (session, _, _) = session();
        let mut records = session.subscribe_records();
        session.start(config(24)).await.expect("first start");
        sleep(Duration::from_millis(2_000)).await;
        session.start(config(30)).await.expect("second start");

        let first = records.try_recv().expect("first session record");
        assert!(!first.completed);
        assert!((first.duration_elapsed_sec - 2.0).abs() < 1e-6);
        assert!(records.try_recv().is_err());

        sleep(Duration::from_secs(31)).await;
        let second = records.try_recv().expect("second session record");
        assert!(second.completed);
        assert_eq!(second.duration_sec, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_silences_everything() {
        let (session, haptics, audio) = session();
        let mut records = session.subscribe_records();
        session.start(config(24)).await.expect("session started");
        sleep(Duration::from_millis(500)).await;
        session.stop().await;
        let fired = haptics.count();
        assert!(!audio.track(TrackId::Lofi).unwrap().playing);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(haptics.count(), fired);
        assert_eq!(records.try_recv().map(|r| r.completed).ok(), Some(false));
        assert!(records.try_recv().is_err());

        session.stop().await;
        assert!(records.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_mode_follows_phase_clock() {
        let (session, _, _) = session();
        let live = SessionConfig {
            mode: SessionMode::Live {
                pattern: HapticPattern::GentleWave,
            },
            ..config(18)
        };
        session.start(live).await.expect("session started");
        assert!(session.core.live.is_running());

        sleep(Duration::from_millis(9_500)).await;
        assert_eq!(session.core.live.phase(), Some(SessionPhase::Peak));

        session.update_phase(SessionPhase::Cooldown).await;
        assert_eq!(session.core.live.phase(), Some(SessionPhase::Cooldown));
        assert_eq!(session.current_phase(), SessionPhase::Cooldown);

        session.update_phase(SessionPhase::Complete).await;
        assert!(!session.is_active());
        assert!(!session.core.live.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cues() {
        let (session, haptics, audio) = session();
        session.play_start_sound();
        session.play_complete_sound().await;
        let success = HapticEvent::Notification {
            kind: NotificationKind::Success,
        };
        assert_eq!(haptics.events(), vec![success.clone(), success.clone(), success]);
        let timeline = haptics.timeline();
        assert_eq!(timeline[2].0.duration_since(timeline[1].0), Duration::from_millis(150));
        let cues: Vec<Cue> = audio
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AudioEvent::Cue { cue, .. } => Some(cue),
                _ => None,
            })
            .collect();
        assert_eq!(cues, vec![Cue::Start, Cue::Complete]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_survives_broken_backends() {
        let (session, haptics, audio) = session();
        haptics.set_failing(true);
        audio.mark_missing(TrackId::Lofi);
        let mut records = session.subscribe_records();
        session.start(config(18)).await.expect("session started");
        sleep(Duration::from_secs(19)).await;
        assert!(records.try_recv().expect("record emitted").completed);
        assert!(session.failures().total() > 0);
    }

    /// Takes 50 ms to prepare and counts primitives that arrive before then.
    #[derive(Default)]
    struct SlowHaptics {
        inner: RecordingHaptics,
        prepared: AtomicBool,
        early: AtomicU64,
    }

    impl SlowHaptics {
        fn note(&self) {
            if !self.prepared.load(Ordering::SeqCst) {
                self.early.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl HapticBackend for SlowHaptics {
        async fn prepare(&self) -> Result<(), BackendError> {
            sleep(Duration::from_millis(50)).await;
            self.prepared.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn impact(&self, style: crate::types::ImpactStyle, v: f64) -> Result<(), BackendError> {
            self.note();
            self.inner.impact(style, v)
        }

        fn notification(&self, kind: NotificationKind) -> Result<(), BackendError> {
            self.note();
            self.inner.notification(kind)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_superseded_during_init() {
        let session = SensorySession::new(
            Arc::new(SlowHaptics::default()),
            Arc::new(RecordingAudio::new()),
            SchedulerSettings::default(),
        );
        let (first, second) = tokio::join!(session.start(config(18)), session.start(config(24)));
        assert!(first.is_none());
        assert_eq!(second.map(|p| p.duration_sec), Some(24));
        assert!(session.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_arms_only_after_prepare() {
        let haptics = Arc::new(SlowHaptics::default());
        let session = SensorySession::new(
            haptics.clone(),
            Arc::new(RecordingAudio::new()),
            SchedulerSettings::default(),
        );
        let second = async {
            let plan = session.start(config(18)).await;
            (plan, haptics.prepared.load(Ordering::SeqCst))
        };
        let (first, (second, prepared_at_return)) =
            tokio::join!(session.start(config(18)), second);
        assert!(first.is_none());
        assert!(second.is_some());
        assert!(prepared_at_return);

        sleep(Duration::from_secs(19)).await;
        assert!(haptics.inner.count() > 0);
        assert_eq!(haptics.early.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visual_inputs_track_phase() {
        let (session, _, _) = session();
        assert_eq!(session.visual_inputs().phase, SessionPhase::Idle);
        session.start(config(18)).await.expect("session started");
        sleep(Duration::from_millis(9_100)).await;
        let inputs = session.visual_inputs();
        assert_eq!(inputs.phase, SessionPhase::Peak);
        assert!(inputs.carrier_density > 26.0);
        assert!(inputs.intensity01 > 0.5);
    }

    #[tokio::test]
    async fn test_capabilities_never_fail() {
        let (session, _, _) = session();
        assert_eq!(session.capabilities(), EngineCapabilities::default());
    }
}
