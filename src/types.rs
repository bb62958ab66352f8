//! Core types for the sensory session scheduler
//!
//! This module defines the data that flows from configuration through the plan
//! builder into the playback engines: sites, phases, haptic and audio commands,
//! the immutable session plan, and the completion record handed back to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SensoryError;

/// Procedure site the session is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
    Fingerstick,
    SubqAbdomen,
    SubqThigh,
    SubqDeltoid,
    ImDeltoid,
    ImVastusLateralis,
    ImVentrogluteal,
    ImDorsogluteal,
    /// Any site the resolver has no dedicated row for.
    #[serde(other)]
    Other,
}

impl Site {
    pub const ALL: [Site; 8] = [
        Site::Fingerstick,
        Site::SubqAbdomen,
        Site::SubqThigh,
        Site::SubqDeltoid,
        Site::ImDeltoid,
        Site::ImVastusLateralis,
        Site::ImVentrogluteal,
        Site::ImDorsogluteal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Fingerstick => "fingerstick",
            Site::SubqAbdomen => "subq_abdomen",
            Site::SubqThigh => "subq_thigh",
            Site::SubqDeltoid => "subq_deltoid",
            Site::ImDeltoid => "im_deltoid",
            Site::ImVastusLateralis => "im_vastus_lateralis",
            Site::ImVentrogluteal => "im_ventrogluteal",
            Site::ImDorsogluteal => "im_dorsogluteal",
            Site::Other => "other",
        }
    }
}

/// Unknown names map to [`Site::Other`]; site lookup never fails.
impl FromStr for Site {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(Site::ALL
            .into_iter()
            .find(|site| site.as_str() == normalized)
            .unwrap_or(Site::Other))
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Age group of the person receiving the procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    Infant,
    Toddler,
    Child,
    Teen,
    #[default]
    Adult,
    OlderAdult,
    ObeseAdult,
    #[serde(other)]
    Unspecified,
}

impl AgeGroup {
    pub const ALL: [AgeGroup; 7] = [
        AgeGroup::Infant,
        AgeGroup::Toddler,
        AgeGroup::Child,
        AgeGroup::Teen,
        AgeGroup::Adult,
        AgeGroup::OlderAdult,
        AgeGroup::ObeseAdult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeGroup::Infant => "infant",
            AgeGroup::Toddler => "toddler",
            AgeGroup::Child => "child",
            AgeGroup::Teen => "teen",
            AgeGroup::Adult => "adult",
            AgeGroup::OlderAdult => "older_adult",
            AgeGroup::ObeseAdult => "obese_adult",
            AgeGroup::Unspecified => "unspecified",
        }
    }
}

impl FromStr for AgeGroup {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Ok(AgeGroup::ALL
            .into_iter()
            .find(|g| g.as_str() == normalized)
            .unwrap_or(AgeGroup::Unspecified))
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peak generation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakStyle {
    /// Baseline buzz punctuated by snap clusters.
    Snap,
    /// Sustained near-maximum density with periodic 3-hit spikes. Also
    /// absorbs unknown values.
    #[default]
    #[serde(other)]
    Max,
}

impl PeakStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeakStyle::Max => "max",
            PeakStyle::Snap => "snap",
        }
    }
}

impl FromStr for PeakStyle {
    type Err = SensoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(PeakStyle::Max),
            "snap" => Ok(PeakStyle::Snap),
            other => Err(SensoryError::UnknownValue {
                field: "peak_style",
                value: other.to_string(),
            }),
        }
    }
}

/// The three planned phase windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Settle,
    Peak,
    Cooldown,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Settle => "settle",
            PhaseName::Peak => "peak",
            PhaseName::Cooldown => "cooldown",
        }
    }
}

/// Phase as seen by the live engine and the visual loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Settle,
    Peak,
    #[serde(alias = "cool", alias = "coolDown")]
    Cooldown,
    Complete,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Settle => "settle",
            SessionPhase::Peak => "peak",
            SessionPhase::Cooldown => "cooldown",
            SessionPhase::Complete => "complete",
        }
    }

    /// Whether haptics should be running in this phase.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionPhase::Settle | SessionPhase::Peak | SessionPhase::Cooldown
        )
    }
}

impl From<PhaseName> for SessionPhase {
    fn from(name: PhaseName) -> Self {
        match name {
            PhaseName::Settle => SessionPhase::Settle,
            PhaseName::Peak => SessionPhase::Peak,
            PhaseName::Cooldown => SessionPhase::Cooldown,
        }
    }
}

impl FromStr for SessionPhase {
    type Err = SensoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "idle" => Ok(SessionPhase::Idle),
            "settle" => Ok(SessionPhase::Settle),
            "peak" => Ok(SessionPhase::Peak),
            "cooldown" | "cool" | "coolDown" => Ok(SessionPhase::Cooldown),
            "complete" => Ok(SessionPhase::Complete),
            other => Err(SensoryError::UnknownValue {
                field: "phase",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live haptic pattern family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HapticPattern {
    #[default]
    Standard,
    GentleWave,
    SoftPulse,
}

impl HapticPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            HapticPattern::Standard => "standard",
            HapticPattern::GentleWave => "gentle-wave",
            HapticPattern::SoftPulse => "soft-pulse",
        }
    }
}

impl FromStr for HapticPattern {
    type Err = SensoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(HapticPattern::Standard),
            "gentle-wave" | "gentle_wave" => Ok(HapticPattern::GentleWave),
            "soft-pulse" | "soft_pulse" => Ok(HapticPattern::SoftPulse),
            other => Err(SensoryError::UnknownValue {
                field: "pattern",
                value: other.to_string(),
            }),
        }
    }
}

/// Discrete impact strength understood by every haptic backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactStyle {
    Light,
    Medium,
    Heavy,
}

impl ImpactStyle {
    /// Style contract: > 0.8 heavy, > 0.45 medium, otherwise light.
    pub fn from_intensity(intensity01: f64) -> Self {
        if intensity01 > 0.8 {
            ImpactStyle::Heavy
        } else if intensity01 > 0.45 {
            ImpactStyle::Medium
        } else {
            ImpactStyle::Light
        }
    }
}

/// Semantic notification cue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
}

/// Parameter animated by a `curve` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveParam {
    Intensity,
    Sharpness,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurvePoint {
    pub dt_ms: u64,
    pub v01: f64,
}

/// One timestamped haptic instruction. `t_ms` is relative to session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum HapticCommand {
    Impact {
        t_ms: u64,
        style: ImpactStyle,
        intensity01: f64,
    },
    Notification {
        t_ms: u64,
        kind: NotificationKind,
    },
    Pause {
        t_ms: u64,
        duration_ms: u64,
    },
    Continuous {
        t_ms: u64,
        duration_ms: u64,
        intensity01: f64,
        sharpness01: f64,
    },
    Curve {
        t_ms: u64,
        param: CurveParam,
        points: Vec<CurvePoint>,
    },
}

impl HapticCommand {
    /// Build an impact whose style follows its own intensity.
    pub fn impact(t_ms: u64, intensity01: f64) -> Self {
        let intensity01 = crate::timebase::clamp01(intensity01);
        HapticCommand::Impact {
            t_ms,
            style: ImpactStyle::from_intensity(intensity01),
            intensity01,
        }
    }

    pub fn t_ms(&self) -> u64 {
        match self {
            HapticCommand::Impact { t_ms, .. }
            | HapticCommand::Notification { t_ms, .. }
            | HapticCommand::Pause { t_ms, .. }
            | HapticCommand::Continuous { t_ms, .. }
            | HapticCommand::Curve { t_ms, .. } => *t_ms,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HapticCommand::Impact { .. } => "impact",
            HapticCommand::Notification { .. } => "notification",
            HapticCommand::Pause { .. } => "pause",
            HapticCommand::Continuous { .. } => "continuous",
            HapticCommand::Curve { .. } => "curve",
        }
    }
}

/// Named ambient tracks bundled with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackId {
    Lofi,
    Noise,
    Rumble,
}

impl TrackId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackId::Lofi => "lofi",
            TrackId::Noise => "noise",
            TrackId::Rumble => "rumble",
        }
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackAction {
    Start,
    Stop,
}

/// One timestamped audio instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum AudioCommand {
    Tone {
        t_ms: u64,
        freq_hz: f64,
        gain01: f64,
        duration_ms: u64,
    },
    Track {
        t_ms: u64,
        id: TrackId,
        gain01: f64,
        action: TrackAction,
    },
    Volume {
        t_ms: u64,
        gain01: f64,
    },
}

impl AudioCommand {
    pub fn t_ms(&self) -> u64 {
        match self {
            AudioCommand::Tone { t_ms, .. }
            | AudioCommand::Track { t_ms, .. }
            | AudioCommand::Volume { t_ms, .. } => *t_ms,
        }
    }

    pub fn gain01(&self) -> f64 {
        match self {
            AudioCommand::Tone { gain01, .. }
            | AudioCommand::Track { gain01, .. }
            | AudioCommand::Volume { gain01, .. } => *gain01,
        }
    }
}

/// Half-open time window `[start_ms, end_ms)` of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseWindow {
    pub name: PhaseName,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl PhaseWindow {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn contains(&self, t_ms: u64) -> bool {
        t_ms >= self.start_ms && t_ms < self.end_ms
    }
}

/// Immutable timeline for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPlan {
    pub site: Site,
    pub age_group: AgeGroup,
    pub duration_sec: u32,
    pub phases: Vec<PhaseWindow>,
    pub haptics: Vec<HapticCommand>,
    pub audio: Vec<AudioCommand>,
}

impl SessionPlan {
    pub fn total_ms(&self) -> u64 {
        u64::from(self.duration_sec) * 1000
    }

    pub fn phase(&self, name: PhaseName) -> Option<&PhaseWindow> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phase active at `elapsed_ms`; `Complete` once the plan has run out.
    pub fn phase_at(&self, elapsed_ms: u64) -> SessionPhase {
        self.phases
            .iter()
            .find(|p| p.contains(elapsed_ms))
            .map(|p| SessionPhase::from(p.name))
            .unwrap_or(SessionPhase::Complete)
    }

    /// Progress through the current phase in `[0, 1]`.
    pub fn phase_progress(&self, elapsed_ms: u64) -> f64 {
        match self.phases.iter().find(|p| p.contains(elapsed_ms)) {
            Some(p) if p.duration_ms() > 0 => {
                (elapsed_ms - p.start_ms) as f64 / p.duration_ms() as f64
            }
            Some(_) => 0.0,
            None => 1.0,
        }
    }

    pub fn to_json(&self) -> Result<String, SensoryError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Feature flags of the concrete haptic and audio backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCapabilities {
    pub continuous_haptics: bool,
    pub param_curves: bool,
    pub audio_mixing: bool,
    pub low_latency_scheduling: bool,
}

impl EngineCapabilities {
    /// Haptic flags come from the haptic backend, mixing from the audio backend.
    pub fn combine(haptic: EngineCapabilities, audio: EngineCapabilities) -> Self {
        EngineCapabilities {
            continuous_haptics: haptic.continuous_haptics,
            param_curves: haptic.param_curves,
            audio_mixing: audio.audio_mixing,
            low_latency_scheduling: haptic.low_latency_scheduling
                && audio.low_latency_scheduling,
        }
    }
}

/// Emitted to the host when a session ends; the host persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub site: Site,
    pub pattern: Option<HapticPattern>,
    pub peak_style: PeakStyle,
    pub duration_sec: u32,
    pub duration_elapsed_sec: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// True only when the session ran to its planned end.
    pub completed: bool,
}
