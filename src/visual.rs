//! Visual synchronizer
//!
//! Derives per-frame animation parameters for the session companion sprite
//! from the current phase, intensity and carrier density. The visual loop is
//! deliberately decoupled from the plan: it follows phase and elapsed time
//! (or an external music clock) and only needs to stay in loose sync.
//!
//! [`frame`] is a pure function; [`VisualLoop`] runs it on a tokio interval and
//! publishes frames through a `watch` channel.

use std::f64::consts::{FRAC_PI_4, TAU};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::SchedulerSettings;
use crate::timebase::{clamp, clamp01, lerp};
use crate::types::{HapticPattern, SessionPhase};

/// Inputs the host feeds the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualInputs {
    pub phase: SessionPhase,
    pub intensity01: f64,
    pub carrier_density: f64,
    /// External clock for tighter sync with the audio bed.
    #[serde(default)]
    pub music_position_ms: Option<f64>,
}

impl Default for VisualInputs {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            intensity01: 0.15,
            carrier_density: 16.0,
            music_position_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pose {
    Hover,
    Glide,
    Dart,
    FlyDown,
    TopDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualFrame {
    pub elapsed_ms: f64,
    pub beat_index: u64,
    pub beat_phase: f64,
    pub pose: Pose,
    pub bob_px: f64,
    pub jitter_px: f64,
    pub drift_px: f64,
    pub scale: f64,
    pub tilt_deg: f64,
    pub travel_ms: f64,
}

/// Pose cycle per phase, keyed on the beat index.
pub fn pose_for(phase: SessionPhase, beat_index: u64) -> Pose {
    match phase {
        SessionPhase::Peak if beat_index % 5 == 0 => Pose::TopDown,
        SessionPhase::Peak if beat_index % 2 == 0 => Pose::Dart,
        SessionPhase::Peak => Pose::FlyDown,
        SessionPhase::Settle if beat_index % 3 == 0 => Pose::Glide,
        _ => Pose::Hover,
    }
}

/// Time for one pass across the screen; faster in peak and at high intensity.
pub fn travel_duration_ms(phase: SessionPhase, intensity01: f64) -> f64 {
    let base = match phase {
        SessionPhase::Peak => 2600.0,
        SessionPhase::Settle => 4200.0,
        _ => 5200.0,
    };
    clamp(base - clamp01(intensity01) * 1400.0, 1800.0, 6500.0)
}

/// Proxy for how buzzy the haptics currently feel.
pub fn carrier_density(
    pattern: HapticPattern,
    phase: SessionPhase,
    snap_density01: f64,
    intensity01: f64,
) -> f64 {
    let base = match pattern {
        HapticPattern::Standard => 26.0,
        HapticPattern::GentleWave => 18.0,
        HapticPattern::SoftPulse => 22.0,
    };
    let phase_mul = match phase {
        SessionPhase::Peak => 1.25,
        SessionPhase::Settle => 1.0,
        SessionPhase::Cooldown => 0.85,
        _ => 0.8,
    };
    base * phase_mul
        * (0.85 + 0.55 * clamp01(snap_density01))
        * (0.75 + 0.55 * clamp01(intensity01))
}

/// Sprite intensity shaped by phase progress and the user's intensity setting.
pub fn sprite_intensity(
    phase: SessionPhase,
    phase_progress01: f64,
    user_intensity01: f64,
    beat_phase: f64,
) -> f64 {
    let u = clamp01(user_intensity01);
    let p = clamp01(phase_progress01);
    let v = match phase {
        SessionPhase::Settle => lerp(0.35, 0.75, p) * (0.75 + 0.35 * u),
        SessionPhase::Peak => (0.92 + 0.06 * (TAU * beat_phase).sin()) * (0.8 + 0.3 * u),
        SessionPhase::Cooldown => lerp(0.7, 0.3, p) * (0.85 + 0.25 * u),
        SessionPhase::Complete => 0.2,
        SessionPhase::Idle => 0.15,
    };
    clamp01(v)
}

/// Compute one frame at `elapsed_ms` since the loop started.
pub fn frame(inputs: &VisualInputs, elapsed_ms: f64, beat_period_ms: f64) -> VisualFrame {
    let position = inputs.music_position_ms.unwrap_or(elapsed_ms).max(0.0);
    let period = beat_period_ms.max(1.0);
    let beat_index = (position / period).floor() as u64;
    let beat_phase = (position % period) / period;
    let t = position / 1000.0;
    let i = clamp01(inputs.intensity01);
    let peak = inputs.phase == SessionPhase::Peak;

    let liveliness_hz = clamp(inputs.carrier_density * 0.08, 0.8, 3.2);
    let jitter_hz = clamp(inputs.carrier_density * 0.25, 2.0, 10.0);

    let beat_wave = (TAU * beat_phase).sin();
    let base_scale = 0.95 + 0.25 * i;
    let (jitter_amp, tilt_amp) = if peak { (6.0, 10.0) } else { (3.5, 6.0) };

    VisualFrame {
        elapsed_ms,
        beat_index,
        beat_phase,
        pose: pose_for(inputs.phase, beat_index),
        bob_px: beat_wave * (10.0 + 26.0 * i),
        jitter_px: (TAU * t * jitter_hz).sin() * jitter_amp,
        drift_px: (TAU * t * liveliness_hz * 0.25).sin() * (6.0 + 10.0 * i),
        scale: base_scale * (1.0 + 0.06 * beat_wave + 0.03 * (TAU * t * 1.7).sin()),
        tilt_deg: tilt_amp * (TAU * beat_phase + FRAC_PI_4).sin(),
        travel_ms: travel_duration_ms(inputs.phase, i),
    }
}

/// Cancellable frame loop. Dropping it stops the task.
pub struct VisualLoop {
    beat_period_ms: f64,
    frame_every: Duration,
    generation: Arc<AtomicU64>,
    tx: Arc<watch::Sender<Option<VisualFrame>>>,
    inputs: Mutex<Option<VisualInputs>>,
    origin: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VisualLoop {
    pub fn new(settings: &SchedulerSettings) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            beat_period_ms: settings.beat_period_ms(),
            frame_every: Duration::from_millis(settings.visual_frame_ms.max(1)),
            generation: Arc::new(AtomicU64::new(0)),
            tx: Arc::new(tx),
            inputs: Mutex::new(None),
            origin: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<VisualFrame>> {
        self.tx.subscribe()
    }

    /// Start, or restart when the inputs changed. The beat clock keeps its origin.
    pub fn set_inputs(&self, inputs: VisualInputs) {
        let unchanged = self
            .inputs
            .lock()
            .map(|cur| *cur == Some(inputs))
            .unwrap_or(false);
        if unchanged && self.is_running() {
            return;
        }
        if let Ok(mut cur) = self.inputs.lock() {
            *cur = Some(inputs);
        }
        self.restart(inputs);
    }

    pub fn inputs(&self) -> Option<VisualInputs> {
        self.inputs.lock().ok().and_then(|i| *i)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Stop publishing and reset the beat clock.
    pub fn stop(&self) {
        self.cancel();
        if let Ok(mut origin) = self.origin.lock() {
            *origin = None;
        }
    }

    fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    fn restart(&self, inputs: VisualInputs) {
        self.cancel();
        let stamp = self.generation.load(Ordering::SeqCst);
        let origin = match self.origin.lock() {
            Ok(mut o) => *o.get_or_insert_with(Instant::now),
            Err(_) => Instant::now(),
        };
        let generation = Arc::clone(&self.generation);
        let tx = Arc::clone(&self.tx);
        let beat_period_ms = self.beat_period_ms;
        let every = self.frame_every;

        debug!(
            phase = inputs.phase.as_str(),
            intensity = inputs.intensity01,
            generation = stamp,
            "visual loop (re)started"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if generation.load(Ordering::SeqCst) != stamp {
                    return;
                }
                let elapsed_ms = origin.elapsed().as_secs_f64() * 1000.0;
                tx.send_replace(Some(frame(&inputs, elapsed_ms, beat_period_ms)));
            }
        });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }
}

impl Drop for VisualLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}
