//! Live bed/envelope haptics
//!
//! Interactive sessions follow the host's phase updates instead of a pre-built
//! plan. Two self-rescheduling loops run per start:
//!
//! - **bed**: frequent low-salience ticks whose interval depends on pattern,
//!   phase and intensity
//! - **envelope**: periodic bursts of stronger hits layered on top
//!
//! Both loops carry the run id they were spawned with and re-check it before
//! every sleep and every hit. `start`, `update_phase` and `stop_all` bump the
//! run id, which is the only cancellation mechanism: a loop that wakes up with
//! a stale id exits without touching the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::backend::HapticBackend;
use crate::failure::{FailureLog, FailureSource};
use crate::timebase::{clamp, clamp01, lerp, rand_factor};
use crate::types::{HapticPattern, ImpactStyle, PeakStyle, SessionPhase};

const BED_MIN_MS: f64 = 85.0;
const BED_MAX_MS: f64 = 320.0;
const BED_JITTER: (f64, f64) = (0.88, 1.12);
const ENVELOPE_JITTER: (f64, f64) = (0.85, 1.15);

/// User-tunable inputs of a live run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveSettings {
    pub intensity01: f64,
    pub peak_style: PeakStyle,
    pub snap_density01: f64,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            intensity01: 1.0,
            peak_style: PeakStyle::Max,
            snap_density01: 0.5,
        }
    }
}

/// Primitive used for one bed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedTick {
    Selection,
    Impact(ImpactStyle),
}

/// Shape of one envelope burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Burst {
    pub hits: u32,
    pub gap_ms: u64,
    pub style: ImpactStyle,
}

/// Bed interval before per-tick jitter, clamped to [85, 320] ms.
pub fn bed_interval_ms(pattern: HapticPattern, phase: SessionPhase, intensity01: f64) -> f64 {
    let base = match pattern {
        HapticPattern::Standard => 165.0,
        HapticPattern::GentleWave => 210.0,
        HapticPattern::SoftPulse => 185.0,
    };
    let phase_mul = match phase {
        SessionPhase::Peak => 0.78,
        SessionPhase::Cooldown => 1.15,
        _ => 1.0,
    };
    let intensity_mul = lerp(1.22, 0.82, clamp01(intensity01));
    clamp(base * phase_mul * intensity_mul, BED_MIN_MS, BED_MAX_MS)
}

pub fn bed_tick(pattern: HapticPattern, phase: SessionPhase, intensity01: f64) -> BedTick {
    if intensity01 < 0.3 {
        return BedTick::Selection;
    }
    let style = match phase {
        SessionPhase::Peak if intensity01 < 0.55 => ImpactStyle::Medium,
        SessionPhase::Peak => ImpactStyle::Heavy,
        SessionPhase::Settle if pattern == HapticPattern::Standard => ImpactStyle::Medium,
        _ => ImpactStyle::Light,
    };
    BedTick::Impact(style)
}

/// Envelope period before jitter.
pub fn envelope_period_ms(phase: SessionPhase, settings: &LiveSettings) -> u64 {
    let lvl = clamp01(settings.intensity01);
    let ms = match (phase, settings.peak_style) {
        (SessionPhase::Peak, PeakStyle::Snap) => {
            let snaps_per_sec = 1.5 + 4.5 * clamp01(settings.snap_density01);
            clamp(1000.0 / snaps_per_sec, 150.0, 700.0)
        }
        (SessionPhase::Peak, PeakStyle::Max) => clamp(260.0 - (lvl * 80.0).round(), 140.0, 320.0),
        (SessionPhase::Settle, _) => clamp(520.0 - (lvl * 120.0).round(), 260.0, 650.0),
        _ => clamp(780.0 - (lvl * 120.0).round(), 420.0, 900.0),
    };
    ms.round() as u64
}

pub fn burst_shape(phase: SessionPhase, settings: &LiveSettings) -> Burst {
    let lvl = clamp01(settings.intensity01);
    let peak = phase == SessionPhase::Peak;
    let hits = match (peak, settings.peak_style) {
        (true, PeakStyle::Max) if lvl > 0.7 => 4,
        (true, _) => 3,
        (false, _) => 2,
    };
    let style = match phase {
        SessionPhase::Peak => ImpactStyle::Heavy,
        _ if lvl < 0.45 => ImpactStyle::Light,
        SessionPhase::Settle => ImpactStyle::Medium,
        _ => ImpactStyle::Light,
    };
    Burst {
        hits,
        gap_ms: if peak { 45 } else { 60 },
        style,
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveState {
    /// Run this state belongs to; loops of any other run must not use it.
    run_id: u64,
    pattern: HapticPattern,
    phase: SessionPhase,
    settings: LiveSettings,
    deadline: Instant,
}

struct Shared {
    backend: Arc<dyn HapticBackend>,
    failures: Arc<FailureLog>,
    run_id: AtomicU64,
    state: Mutex<Option<LiveState>>,
}

impl Shared {
    fn is_current(&self, id: u64) -> bool {
        self.run_id.load(Ordering::SeqCst) == id
    }

    fn snapshot(&self) -> Option<LiveState> {
        self.state.lock().ok().and_then(|s| *s)
    }

    /// State for run `id`, read under one lock so a concurrent restart can't leak in.
    fn current(&self, id: u64) -> Option<LiveState> {
        self.snapshot().filter(|s| s.run_id == id)
    }

    /// Self-terminate when the safety cap is reached. Only the current run may expire.
    fn expire_if_due(&self, id: u64, deadline: Instant) -> bool {
        if Instant::now() < deadline {
            return false;
        }
        if self
            .run_id
            .compare_exchange(id, id + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut state) = self.state.lock() {
                *state = None;
            }
            info!(run_id = id, "live haptics reached max run time, stopping");
        }
        true
    }

    fn impact(&self, style: ImpactStyle, intensity01: f64) {
        self.failures.guard(FailureSource::Haptics, "impact", || {
            self.backend.impact(style, intensity01)
        });
    }
}

pub struct LiveHaptics {
    shared: Arc<Shared>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    max_run: Duration,
}

impl LiveHaptics {
    pub fn new(
        backend: Arc<dyn HapticBackend>,
        failures: Arc<FailureLog>,
        max_run_ms: u64,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                failures,
                run_id: AtomicU64::new(0),
                state: Mutex::new(None),
            }),
            loops: Mutex::new(Vec::new()),
            max_run: Duration::from_millis(max_run_ms),
        }
    }

    /// Stop whatever is running and start fresh bed/envelope loops.
    pub fn start(&self, pattern: HapticPattern, phase: SessionPhase, settings: LiveSettings) {
        self.stop_all();
        let id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = LiveState {
            run_id: id,
            pattern,
            phase,
            settings,
            deadline: Instant::now() + self.max_run,
        };
        if let Ok(mut slot) = self.shared.state.lock() {
            *slot = Some(state);
        }
        info!(
            run_id = id,
            pattern = pattern.as_str(),
            phase = phase.as_str(),
            "live haptics started"
        );
        if phase.is_active() {
            self.spawn_loops(id);
        }
    }

    /// Move a running session to `phase`. No-op when idle or already there.
    pub fn update_phase(&self, phase: SessionPhase) {
        let Some(mut state) = self.shared.snapshot() else {
            return;
        };
        if state.phase == phase {
            return;
        }
        if !phase.is_active() {
            self.stop_all();
            return;
        }
        let id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        state.phase = phase;
        state.run_id = id;
        if let Ok(mut slot) = self.shared.state.lock() {
            *slot = Some(state);
        }
        debug!(run_id = id, phase = phase.as_str(), "live haptics phase change");
        self.spawn_loops(id);
    }

    /// New intensity is picked up by the loops on their next tick.
    pub fn set_intensity(&self, v01: f64) {
        if let Ok(mut slot) = self.shared.state.lock() {
            if let Some(state) = slot.as_mut() {
                state.settings.intensity01 = clamp01(v01);
            }
        }
    }

    pub fn stop_all(&self) {
        let id = self.shared.run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let was_running = self
            .shared
            .state
            .lock()
            .map(|mut s| s.take().is_some())
            .unwrap_or(false);
        if let Ok(mut loops) = self.loops.lock() {
            loops.retain(|h| !h.is_finished());
        }
        if was_running {
            debug!(run_id = id, "live haptics stopped");
        }
    }

    pub fn dispose(&self) {
        self.stop_all();
        if let Ok(mut loops) = self.loops.lock() {
            for handle in loops.drain(..) {
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.snapshot().is_some()
    }

    pub fn phase(&self) -> Option<SessionPhase> {
        self.shared.snapshot().map(|s| s.phase)
    }

    pub fn run_id(&self) -> u64 {
        self.shared.run_id.load(Ordering::SeqCst)
    }

    /// Loop tasks that have not exited yet.
    pub fn active_loops(&self) -> usize {
        self.loops
            .lock()
            .map(|l| l.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    fn spawn_loops(&self, id: u64) {
        let bed = tokio::spawn(bed_loop(Arc::clone(&self.shared), id));
        let envelope = tokio::spawn(envelope_loop(Arc::clone(&self.shared), id));
        if let Ok(mut loops) = self.loops.lock() {
            loops.retain(|h| !h.is_finished());
            loops.push(bed);
            loops.push(envelope);
        }
    }
}

impl Drop for LiveHaptics {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn bed_loop(shared: Arc<Shared>, id: u64) {
    let mut rng = StdRng::from_entropy();
    loop {
        let Some(state) = shared.current(id) else {
            return;
        };
        if shared.expire_if_due(id, state.deadline) {
            return;
        }
        let lvl = clamp01(state.settings.intensity01);
        match bed_tick(state.pattern, state.phase, lvl) {
            BedTick::Selection => {
                shared.failures.guard(FailureSource::Haptics, "selection", || {
                    shared.backend.selection()
                });
            }
            BedTick::Impact(style) => shared.impact(style, lvl),
        }
        let interval = bed_interval_ms(state.pattern, state.phase, lvl)
            * rand_factor(&mut rng, BED_JITTER.0, BED_JITTER.1);
        sleep(Duration::from_millis(interval.round() as u64)).await;
    }
}

async fn envelope_loop(shared: Arc<Shared>, id: u64) {
    let mut rng = StdRng::from_entropy();
    loop {
        let Some(state) = shared.current(id) else {
            return;
        };
        if shared.expire_if_due(id, state.deadline) {
            return;
        }
        let period = envelope_period_ms(state.phase, &state.settings) as f64
            * rand_factor(&mut rng, ENVELOPE_JITTER.0, ENVELOPE_JITTER.1);
        sleep(Duration::from_millis(period.round() as u64)).await;

        let Some(state) = shared.current(id) else {
            return;
        };
        let burst = burst_shape(state.phase, &state.settings);
        let lvl = clamp01(state.settings.intensity01);
        for hit in 0..burst.hits {
            if !shared.is_current(id) {
                return;
            }
            shared.impact(burst.style, lvl);
            if hit + 1 < burst.hits {
                sleep(Duration::from_millis(burst.gap_ms)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HapticEvent, RecordingHaptics};
    use pretty_assertions::assert_eq;

    fn live(max_run_ms: u64) -> (LiveHaptics, Arc<RecordingHaptics>) {
        let backend = Arc::new(RecordingHaptics::new());
        let live = LiveHaptics::new(backend.clone(), Arc::new(FailureLog::new()), max_run_ms);
        (live, backend)
    }

    #[test]
    fn test_bed_interval_shape() {
        let p = HapticPattern::Standard;
        // 165 * 1.0 * 1.02
        assert!((bed_interval_ms(p, SessionPhase::Settle, 0.5) - 168.3).abs() < 1e-9);
        assert!(
            bed_interval_ms(p, SessionPhase::Peak, 0.5) < bed_interval_ms(p, SessionPhase::Settle, 0.5)
        );
        assert!(
            bed_interval_ms(p, SessionPhase::Cooldown, 0.5)
                > bed_interval_ms(p, SessionPhase::Settle, 0.5)
        );
        assert!(bed_interval_ms(p, SessionPhase::Settle, 1.0) < bed_interval_ms(p, SessionPhase::Settle, 0.0));
        assert!((bed_interval_ms(HapticPattern::GentleWave, SessionPhase::Cooldown, 0.0) - 294.63).abs() < 1e-9);
        assert!((bed_interval_ms(HapticPattern::Standard, SessionPhase::Peak, 5.0) - 105.534).abs() < 1e-9);
    }

    #[test]
    fn test_bed_interval_clamps() {
        for pattern in [HapticPattern::Standard, HapticPattern::GentleWave, HapticPattern::SoftPulse] {
            for phase in [SessionPhase::Settle, SessionPhase::Peak, SessionPhase::Cooldown] {
                for lvl in [0.0, 0.25, 0.5, 0.75, 1.0] {
                    let ms = bed_interval_ms(pattern, phase, lvl);
                    assert!((85.0..=320.0).contains(&ms));
                }
            }
        }
    }

    #[test]
    fn test_envelope_periods() {
        let snap = LiveSettings {
            peak_style: PeakStyle::Snap,
            snap_density01: 1.0,
            ..Default::default()
        };
        assert_eq!(envelope_period_ms(SessionPhase::Peak, &snap), 167);
        let slow_snap = LiveSettings {
            snap_density01: 0.0,
            ..snap
        };
        assert_eq!(envelope_period_ms(SessionPhase::Peak, &slow_snap), 667);

        let max = LiveSettings::default();
        assert_eq!(envelope_period_ms(SessionPhase::Peak, &max), 180);
        assert_eq!(envelope_period_ms(SessionPhase::Settle, &max), 400);
        assert_eq!(envelope_period_ms(SessionPhase::Cooldown, &max), 660);
    }

    #[test]
    fn test_burst_shapes() {
        let strong = LiveSettings::default();
        assert_eq!(
            burst_shape(SessionPhase::Peak, &strong),
            Burst { hits: 4, gap_ms: 45, style: ImpactStyle::Heavy }
        );
        let soft = LiveSettings {
            intensity01: 0.4,
            ..Default::default()
        };
        assert_eq!(burst_shape(SessionPhase::Peak, &soft).hits, 3);
        assert_eq!(
            burst_shape(SessionPhase::Settle, &soft),
            Burst { hits: 2, gap_ms: 60, style: ImpactStyle::Light }
        );
        assert_eq!(burst_shape(SessionPhase::Settle, &strong).style, ImpactStyle::Medium);
        assert_eq!(burst_shape(SessionPhase::Cooldown, &strong).style, ImpactStyle::Light);
    }

    #[test]
    fn test_bed_tick_selection() {
        assert_eq!(bed_tick(HapticPattern::Standard, SessionPhase::Peak, 0.2), BedTick::Selection);
        assert_eq!(
            bed_tick(HapticPattern::Standard, SessionPhase::Peak, 0.5),
            BedTick::Impact(ImpactStyle::Medium)
        );
        assert_eq!(
            bed_tick(HapticPattern::SoftPulse, SessionPhase::Settle, 0.9),
            BedTick::Impact(ImpactStyle::Light)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_keeps_one_pair_of_loops() {
        let (live, backend) = live(30_000);
        live.start(HapticPattern::Standard, SessionPhase::Settle, LiveSettings::default());
        live.start(HapticPattern::SoftPulse, SessionPhase::Peak, LiveSettings::default());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(live.active_loops(), 2);
        assert_eq!(live.phase(), Some(SessionPhase::Peak));
        assert!(backend.count() > 0);
        // Every bed tick in peak at full intensity is heavy.
        assert!(backend
            .events()
            .iter()
            .all(|e| matches!(e, HapticEvent::Impact { style: ImpactStyle::Heavy, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_silences_sleeping_loops() {
        let (live, backend) = live(30_000);
        live.start(HapticPattern::Standard, SessionPhase::Peak, LiveSettings::default());
        tokio::time::sleep(Duration::from_millis(700)).await;
        live.stop_all();
        let fired = backend.count();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.count(), fired);
        assert_eq!(live.active_loops(), 0);
        assert!(!live.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_phase_restarts_loops() {
        let (live, _) = live(30_000);
        live.update_phase(SessionPhase::Peak);
        assert!(!live.is_running());

        live.start(HapticPattern::GentleWave, SessionPhase::Settle, LiveSettings::default());
        let id = live.run_id();
        live.update_phase(SessionPhase::Settle);
        assert_eq!(live.run_id(), id);
        live.update_phase(SessionPhase::Cooldown);
        assert_eq!(live.run_id(), id + 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(live.active_loops(), 2);

        live.update_phase(SessionPhase::Complete);
        assert!(!live.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_never_reads_state_of_another_run() {
        let (live, _) = live(30_000);
        live.start(HapticPattern::Standard, SessionPhase::Settle, LiveSettings::default());
        let id = live.run_id();
        assert!(live.shared.current(id).is_some());

        // A restart that has published its state before the old loop re-checks.
        if let Ok(mut slot) = live.shared.state.lock() {
            if let Some(state) = slot.as_mut() {
                state.run_id = id + 1;
                state.phase = SessionPhase::Peak;
            }
        }
        assert!(live.shared.is_current(id));
        assert!(live.shared.current(id).is_none());
        assert_eq!(live.shared.current(id + 1).map(|s| s.phase), Some(SessionPhase::Peak));
        live.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_run_self_terminates() {
        let (live, backend) = live(2_000);
        live.start(HapticPattern::Standard, SessionPhase::Settle, LiveSettings::default());
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(!live.is_running());
        let fired = backend.count();
        assert!(fired > 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.count(), fired);
        assert_eq!(live.active_loops(), 0);
    }
}
