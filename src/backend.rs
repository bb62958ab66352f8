//! Platform backends
//!
//! The engines never talk to a platform API directly. Hosts implement
//! [`HapticBackend`] and [`AudioBackend`] over their native primitives and
//! advertise what they support through [`EngineCapabilities`]. Advanced
//! primitives default to [`BackendError::Unsupported`], so a minimal backend
//! only implements the discrete calls.
//!
//! [`RecordingHaptics`] and [`RecordingAudio`] keep every call in memory with
//! its (tokio) timestamp. They back the CLI simulator and the test-suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::BackendError;
use crate::types::{CurveParam, CurvePoint, EngineCapabilities, ImpactStyle, NotificationKind, TrackId};

/// Short UI feedback sounds, independent of the session bed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cue {
    Start,
    Complete,
}

#[async_trait]
pub trait HapticBackend: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    /// Acquire the haptic engine. Called once per `init`.
    async fn prepare(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn impact(&self, style: ImpactStyle, intensity01: f64) -> Result<(), BackendError>;

    fn notification(&self, kind: NotificationKind) -> Result<(), BackendError>;

    /// Lightest available tick.
    fn selection(&self) -> Result<(), BackendError> {
        self.impact(ImpactStyle::Light, 0.2)
    }

    fn continuous(
        &self,
        _duration_ms: u64,
        _intensity01: f64,
        _sharpness01: f64,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("continuous"))
    }

    fn curve(&self, _param: CurveParam, _points: &[CurvePoint]) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("curve"))
    }
}

#[async_trait]
pub trait AudioBackend: Send + Sync {
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    /// Acquire the audio session (mixing mode, silent switch, etc).
    async fn activate(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn load(&self, track: TrackId) -> Result<(), BackendError>;

    fn play(&self, track: TrackId) -> Result<(), BackendError>;

    fn stop(&self, track: TrackId) -> Result<(), BackendError>;

    fn set_volume(&self, track: TrackId, volume01: f64) -> Result<(), BackendError>;

    fn set_looping(&self, track: TrackId, looping: bool) -> Result<(), BackendError>;

    fn unload(&self, track: TrackId) -> Result<(), BackendError>;

    fn play_cue(&self, cue: Cue, volume01: f64) -> Result<(), BackendError>;

    fn tone(&self, _freq_hz: f64, _gain01: f64, _duration_ms: u64) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("tone"))
    }
}

// ============================================================================
// Recording haptics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HapticEvent {
    Impact { style: ImpactStyle, intensity01: f64 },
    Notification { kind: NotificationKind },
    Selection,
    Continuous { duration_ms: u64, intensity01: f64 },
}

#[derive(Debug, Default)]
pub struct RecordingHaptics {
    capabilities: EngineCapabilities,
    events: Mutex<Vec<(Instant, HapticEvent)>>,
    failing: AtomicBool,
    prepare_calls: AtomicU64,
}

impl RecordingHaptics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: EngineCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Make every primitive fail with [`BackendError::Primitive`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<HapticEvent> {
        self.timeline().into_iter().map(|(_, e)| e).collect()
    }

    pub fn timeline(&self) -> Vec<(Instant, HapticEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn prepare_calls(&self) -> u64 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    fn push(&self, event: HapticEvent) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Primitive("recording backend set to fail".into()));
        }
        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event));
        }
        Ok(())
    }
}

#[async_trait]
impl HapticBackend for RecordingHaptics {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn prepare(&self) -> Result<(), BackendError> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn impact(&self, style: ImpactStyle, intensity01: f64) -> Result<(), BackendError> {
        self.push(HapticEvent::Impact { style, intensity01 })
    }

    fn notification(&self, kind: NotificationKind) -> Result<(), BackendError> {
        self.push(HapticEvent::Notification { kind })
    }

    fn selection(&self) -> Result<(), BackendError> {
        self.push(HapticEvent::Selection)
    }

    fn continuous(
        &self,
        duration_ms: u64,
        intensity01: f64,
        _sharpness01: f64,
    ) -> Result<(), BackendError> {
        if !self.capabilities.continuous_haptics {
            return Err(BackendError::Unsupported("continuous"));
        }
        self.push(HapticEvent::Continuous {
            duration_ms,
            intensity01,
        })
    }
}

// ============================================================================
// Recording audio
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AudioEvent {
    Load { track: TrackId },
    Play { track: TrackId },
    Stop { track: TrackId },
    Volume { track: TrackId, volume01: f64 },
    Looping { track: TrackId, looping: bool },
    Unload { track: TrackId },
    Cue { cue: Cue, volume01: f64 },
}

/// Playback state of one recorded track.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackState {
    pub loaded: bool,
    pub playing: bool,
    pub looping: bool,
    pub volume01: f64,
}

#[derive(Debug, Default)]
pub struct RecordingAudio {
    capabilities: EngineCapabilities,
    events: Mutex<Vec<(Instant, AudioEvent)>>,
    tracks: Mutex<HashMap<TrackId, TrackState>>,
    missing_assets: Mutex<HashSet<TrackId>>,
}

impl RecordingAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: EngineCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Make `load(track)` fail as if the asset were missing.
    pub fn mark_missing(&self, track: TrackId) {
        if let Ok(mut missing) = self.missing_assets.lock() {
            missing.insert(track);
        }
    }

    pub fn events(&self) -> Vec<AudioEvent> {
        self.events
            .lock()
            .map(|e| e.iter().map(|(_, ev)| ev.clone()).collect())
            .unwrap_or_default()
    }

    pub fn timeline(&self) -> Vec<(Instant, AudioEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn track(&self, track: TrackId) -> Option<TrackState> {
        self.tracks.lock().ok().and_then(|t| t.get(&track).copied())
    }

    pub fn load_count(&self, track: TrackId) -> usize {
        self.count_where(|e| matches!(e, AudioEvent::Load { track: t } if *t == track))
    }

    pub fn unload_count(&self, track: TrackId) -> usize {
        self.count_where(|e| matches!(e, AudioEvent::Unload { track: t } if *t == track))
    }

    fn count_where(&self, pred: impl Fn(&AudioEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|(_, ev)| pred(ev)).count())
            .unwrap_or(0)
    }

    fn push(&self, event: AudioEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event));
        }
    }

    fn update<F>(&self, track: TrackId, f: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut TrackState),
    {
        let mut tracks = self
            .tracks
            .lock()
            .map_err(|_| BackendError::Unavailable("track table poisoned".into()))?;
        match tracks.get_mut(&track) {
            Some(state) if state.loaded => {
                f(state);
                Ok(())
            }
            _ => Err(BackendError::Primitive(format!("track {} not loaded", track))),
        }
    }
}

#[async_trait]
impl AudioBackend for RecordingAudio {
    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn load(&self, track: TrackId) -> Result<(), BackendError> {
        let missing = self
            .missing_assets
            .lock()
            .map(|m| m.contains(&track))
            .unwrap_or(false);
        if missing {
            return Err(BackendError::Asset {
                track: track.to_string(),
                reason: "asset not bundled".into(),
            });
        }
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.insert(
                track,
                TrackState {
                    loaded: true,
                    ..TrackState::default()
                },
            );
        }
        self.push(AudioEvent::Load { track });
        Ok(())
    }

    fn play(&self, track: TrackId) -> Result<(), BackendError> {
        self.update(track, |s| s.playing = true)?;
        self.push(AudioEvent::Play { track });
        Ok(())
    }

    fn stop(&self, track: TrackId) -> Result<(), BackendError> {
        self.update(track, |s| s.playing = false)?;
        self.push(AudioEvent::Stop { track });
        Ok(())
    }

    fn set_volume(&self, track: TrackId, volume01: f64) -> Result<(), BackendError> {
        self.update(track, |s| s.volume01 = volume01)?;
        self.push(AudioEvent::Volume { track, volume01 });
        Ok(())
    }

    fn set_looping(&self, track: TrackId, looping: bool) -> Result<(), BackendError> {
        self.update(track, |s| s.looping = looping)?;
        self.push(AudioEvent::Looping { track, looping });
        Ok(())
    }

    fn unload(&self, track: TrackId) -> Result<(), BackendError> {
        if let Ok(mut tracks) = self.tracks.lock() {
            tracks.remove(&track);
        }
        self.push(AudioEvent::Unload { track });
        Ok(())
    }

    fn play_cue(&self, cue: Cue, volume01: f64) -> Result<(), BackendError> {
        self.push(AudioEvent::Cue { cue, volume01 });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_advanced_primitives_are_unsupported() {
        let haptics = RecordingHaptics::new();
        assert_eq!(
            haptics.continuous(100, 0.5, 0.5),
            Err(BackendError::Unsupported("continuous"))
        );
        assert_eq!(
            haptics.curve(CurveParam::Intensity, &[]),
            Err(BackendError::Unsupported("curve"))
        );
        assert_eq!(haptics.count(), 0);
    }

    #[test]
    fn test_failing_haptics_record_nothing() {
        let haptics = RecordingHaptics::new();
        haptics.set_failing(true);
        assert!(haptics.impact(ImpactStyle::Heavy, 1.0).is_err());
        haptics.set_failing(false);
        assert!(haptics.selection().is_ok());
        assert_eq!(haptics.events(), vec![HapticEvent::Selection]);
    }

    #[tokio::test]
    async fn test_audio_requires_load_before_play() {
        let audio = RecordingAudio::new();
        assert!(audio.play(TrackId::Noise).is_err());
        audio.load(TrackId::Noise).await.unwrap();
        audio.play(TrackId::Noise).unwrap();
        assert!(audio.track(TrackId::Noise).unwrap().playing);

        audio.mark_missing(TrackId::Rumble);
        assert!(matches!(
            audio.load(TrackId::Rumble).await,
            Err(BackendError::Asset { .. })
        ));
    }
}
