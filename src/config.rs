//! Session configuration and scheduler tuning
//!
//! [`SessionConfig`] is what the host's preferences layer hands us at session
//! start. [`SchedulerSettings`] carries the engine constants that are tunable
//! rather than contractual.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SensoryError;
use crate::plan::{PlanOptions, DEFAULT_DURATION_SEC};
use crate::timebase::clamp01;
use crate::types::{AgeGroup, HapticPattern, PeakStyle, Site};

/// How haptics are driven during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionMode {
    /// Fire the pre-built plan's haptic commands.
    #[default]
    Planned,
    /// Run the bed/envelope generator, following phase updates from the host.
    Live { pattern: HapticPattern },
}

/// Configuration received from the host at `start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub site: Site,
    pub age_group: AgeGroup,
    /// Missing or unsupported values fall back to 24.
    #[serde(deserialize_with = "lenient_duration")]
    pub duration_sec: Option<u32>,
    pub haptics_intensity01: f64,
    pub audio_volume01: f64,
    pub peak_style: PeakStyle,
    pub snap_density01: f64,
    pub mode: SessionMode,
}

/// Accept any JSON for `durationSec`; anything but a positive integer becomes `None`.
fn lenient_duration<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_u64()
            .filter(|&secs| secs > 0)
            .and_then(|secs| u32::try_from(secs).ok()),
        _ => None,
    };
    if parsed.is_none() {
        warn!(value = %value, "invalid session duration, ignoring");
    }
    Ok(parsed)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            site: Site::Fingerstick,
            age_group: AgeGroup::Adult,
            duration_sec: Some(DEFAULT_DURATION_SEC),
            haptics_intensity01: 1.0,
            audio_volume01: 0.7,
            peak_style: PeakStyle::Max,
            snap_density01: 0.5,
            mode: SessionMode::Planned,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, SensoryError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    pub fn to_json(&self) -> Result<String, SensoryError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Clamp every unit-interval field and resolve the duration.
    pub fn normalized(mut self) -> Self {
        self.haptics_intensity01 = clamp01(self.haptics_intensity01);
        self.audio_volume01 = clamp01(self.audio_volume01);
        self.snap_density01 = clamp01(self.snap_density01);
        if self.duration_sec.is_none() {
            warn!(
                fallback = DEFAULT_DURATION_SEC,
                "session duration missing, using default"
            );
            self.duration_sec = Some(DEFAULT_DURATION_SEC);
        }
        self
    }

    pub fn duration_sec(&self) -> u32 {
        self.duration_sec.unwrap_or(DEFAULT_DURATION_SEC)
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            peak_style: self.peak_style,
            snap_density01: self.snap_density01,
            haptics_intensity01: self.haptics_intensity01,
            audio_volume01: self.audio_volume01,
        }
    }

    pub fn pattern(&self) -> Option<HapticPattern> {
        match self.mode {
            SessionMode::Planned => None,
            SessionMode::Live { pattern } => Some(pattern),
        }
    }
}

/// Tunable engine constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Hard cap on a live bed/envelope run.
    pub live_max_run_ms: u64,
    /// Tempo driving the visual bob and pose cycling.
    pub visual_beat_bpm: f64,
    /// Frame interval of the visual loop.
    pub visual_frame_ms: u64,
    pub default_master_volume: f64,
    /// Cue volume relative to master.
    pub cue_volume_scale: f64,
    /// Fade-in length for track starts; 0 disables fading.
    pub fade_in_ms: u64,
    pub fade_in_steps: u32,
    /// Gap between the two success pulses of the completion cue.
    pub complete_cue_gap_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            live_max_run_ms: 30_000,
            visual_beat_bpm: 80.0,
            visual_frame_ms: 16,
            default_master_volume: 0.6,
            cue_volume_scale: 0.7,
            fade_in_ms: 0,
            fade_in_steps: 20,
            complete_cue_gap_ms: 150,
        }
    }
}

impl SchedulerSettings {
    pub fn from_json(json: &str) -> Result<Self, SensoryError> {
        let settings: SchedulerSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String, SensoryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), SensoryError> {
        if !(self.visual_beat_bpm.is_finite() && self.visual_beat_bpm > 0.0) {
            return Err(SensoryError::InvalidConfig(format!(
                "visualBeatBpm must be positive, got {}",
                self.visual_beat_bpm
            )));
        }
        if self.visual_frame_ms == 0 {
            return Err(SensoryError::InvalidConfig(
                "visualFrameMs must be at least 1".to_string(),
            ));
        }
        if self.live_max_run_ms == 0 {
            return Err(SensoryError::InvalidConfig(
                "liveMaxRunMs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Beat period of the visual loop in milliseconds.
    pub fn beat_period_ms(&self) -> f64 {
        60_000.0 / self.visual_beat_bpm
    }
}
