//! Haptic playback
//!
//! Two engines share one backend:
//! - [`HapticsEngine`] fires a pre-built plan's commands at their offsets
//! - [`LiveHaptics`] generates bed and envelope pulses from the current phase

pub mod live;
pub mod scheduler;

pub use live::{LiveHaptics, LiveSettings};
pub use scheduler::HapticsEngine;
