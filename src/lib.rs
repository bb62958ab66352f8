//! Alivio Sensory - multi-sensory comfort scheduler for needle-procedure sessions
//!
//! A session runs three timed phases (settle, peak, cooldown). For each one
//! the crate builds a deterministic-shape plan of haptic and audio commands,
//! then plays it back through host-provided backends:
//! plan building → profile resolution → timed playback → visual sync.
//!
//! ## Modules
//!
//! - **Planning**: [`plan`] and [`profile`] turn a site, age group and duration into a [`SessionPlan`]
//! - **Playback**: [`haptics`] and [`audio`] fire commands at their offsets and cancel cleanly
//! - **Visuals**: [`visual`] derives sprite frames loosely synced to phase and beat
//! - **Orchestration**: [`session`] wires the engines together behind one lifecycle

pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod failure;
pub mod haptics;
pub mod plan;
pub mod profile;
pub mod session;
pub mod timebase;
pub mod types;
pub mod visual;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use audio::AudioEngine;
pub use backend::{AudioBackend, Cue, HapticBackend, RecordingAudio, RecordingHaptics};
pub use config::{SchedulerSettings, SessionConfig, SessionMode};
pub use error::{BackendError, SensoryError};
pub use failure::{FailureLog, FailureSource};
pub use haptics::{HapticsEngine, LiveHaptics, LiveSettings};
pub use plan::{build_session_plan, build_session_plan_with_rng, PlanOptions};
pub use profile::SiteProfile;
pub use session::SensorySession;
pub use types::{
    AgeGroup, AudioCommand, EngineCapabilities, HapticCommand, HapticPattern, PeakStyle,
    PhaseWindow, SessionPhase, SessionPlan, SessionRecord, Site,
};
pub use visual::{VisualFrame, VisualInputs, VisualLoop};

/// Crate version reported by the CLI and FFI
pub const SENSORY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for diagnostic reports
pub const PRODUCER_NAME: &str = "alivio-sensory";
