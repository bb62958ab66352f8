//! Plan-driven audio playback
//!
//! Mirrors the haptic scheduler's arming model for [`AudioCommand`]s and owns
//! the loaded track handles. Tracks load lazily on their first `start`; later
//! starts only re-apply looping and volume and resume playback. The volume the
//! backend sees is always `master × track gain`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::backend::{AudioBackend, Cue};
use crate::config::SchedulerSettings;
use crate::error::BackendError;
use crate::failure::{FailureLog, FailureSource};
use crate::timebase::clamp01;
use crate::types::{AudioCommand, EngineCapabilities, TrackAction, TrackId};

#[derive(Debug, Clone, Copy)]
struct TrackSlot {
    playing: bool,
    gain01: f64,
}

struct Inner {
    backend: Arc<dyn AudioBackend>,
    failures: Arc<FailureLog>,
    generation: AtomicU64,
    master: Mutex<f64>,
    tracks: AsyncMutex<HashMap<TrackId, TrackSlot>>,
    cue_volume_scale: f64,
    fade_in_ms: u64,
    fade_in_steps: u32,
}

impl Inner {
    fn master(&self) -> f64 {
        self.master.lock().map(|m| *m).unwrap_or(0.0)
    }

    fn is_current(&self, stamp: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == stamp
    }

    fn call(&self, operation: &str, result: Result<(), BackendError>) -> bool {
        match result {
            Ok(()) => true,
            Err(BackendError::Unsupported(what)) => {
                debug!(operation, unsupported = what, "audio primitive not available");
                false
            }
            Err(e) => {
                self.failures.record(FailureSource::Audio, operation, &e);
                false
            }
        }
    }

    async fn apply(self: &Arc<Self>, cmd: &AudioCommand, stamp: u64) {
        match *cmd {
            AudioCommand::Track {
                id,
                gain01,
                action: TrackAction::Start,
                ..
            } => self.start_track(id, clamp01(gain01), stamp).await,
            AudioCommand::Track {
                id,
                action: TrackAction::Stop,
                ..
            } => self.stop_track(id).await,
            AudioCommand::Volume { gain01, .. } => self.set_track_gains(clamp01(gain01)).await,
            AudioCommand::Tone {
                freq_hz,
                gain01,
                duration_ms,
                ..
            } => {
                let gain = self.master() * clamp01(gain01);
                self.call("tone", self.backend.tone(freq_hz, gain, duration_ms));
            }
        }
    }

    async fn start_track(self: &Arc<Self>, id: TrackId, gain01: f64, stamp: u64) {
        let mut tracks = self.tracks.lock().await;
        if !tracks.contains_key(&id) {
            let loaded = self.backend.load(id).await;
            if !self.call("load", loaded) {
                return;
            }
            debug!(track = id.as_str(), "track loaded");
            tracks.insert(
                id,
                TrackSlot {
                    playing: false,
                    gain01,
                },
            );
        }
        // A stop may have landed while the asset was loading.
        if !self.is_current(stamp) {
            return;
        }
        let fading = self.fade_in_ms > 0 && self.fade_in_steps > 0;
        let target = self.master() * gain01;
        self.call("set_looping", self.backend.set_looping(id, true));
        self.call(
            "set_volume",
            self.backend.set_volume(id, if fading { 0.0 } else { target }),
        );
        self.call("play", self.backend.play(id));
        tracks.insert(
            id,
            TrackSlot {
                playing: true,
                gain01,
            },
        );
        drop(tracks);

        if fading {
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.fade_in(id, stamp).await });
        }
    }

    async fn fade_in(&self, id: TrackId, stamp: u64) {
        let steps = self.fade_in_steps;
        let step = Duration::from_millis(self.fade_in_ms / u64::from(steps));
        for i in 1..=steps {
            sleep(step).await;
            if !self.is_current(stamp) {
                return;
            }
            let tracks = self.tracks.lock().await;
            let Some(slot) = tracks.get(&id).copied().filter(|s| s.playing) else {
                return;
            };
            let v = self.master() * slot.gain01 * f64::from(i) / f64::from(steps);
            self.call("set_volume", self.backend.set_volume(id, v));
        }
    }

    async fn stop_track(&self, id: TrackId) {
        let mut tracks = self.tracks.lock().await;
        if let Some(slot) = tracks.get_mut(&id) {
            if slot.playing {
                self.call("stop", self.backend.stop(id));
                slot.playing = false;
            }
        }
    }

    async fn set_track_gains(&self, gain01: f64) {
        let master = self.master();
        let mut tracks = self.tracks.lock().await;
        for (id, slot) in tracks.iter_mut().filter(|(_, s)| s.playing) {
            slot.gain01 = gain01;
            self.call("set_volume", self.backend.set_volume(*id, master * gain01));
        }
    }
}

pub struct AudioEngine {
    inner: Arc<Inner>,
    batches: Mutex<Vec<JoinHandle<()>>>,
    ready: Mutex<Arc<OnceCell<()>>>,
}

impl AudioEngine {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        failures: Arc<FailureLog>,
        settings: &SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                failures,
                generation: AtomicU64::new(0),
                master: Mutex::new(clamp01(settings.default_master_volume)),
                tracks: AsyncMutex::new(HashMap::new()),
                cue_volume_scale: clamp01(settings.cue_volume_scale),
                fade_in_ms: settings.fade_in_ms,
                fade_in_steps: settings.fade_in_steps,
            }),
            batches: Mutex::new(Vec::new()),
            ready: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// Activate the audio session once. Concurrent callers wait for the
    /// same activation.
    pub async fn init(&self) {
        let Some(ready) = self.ready.lock().ok().map(|r| Arc::clone(&*r)) else {
            return;
        };
        ready
            .get_or_init(|| async {
                let activated = self.inner.backend.activate().await;
                self.inner.call("activate", activated);
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
        self.inner.backend.capabilities()
    }

    pub fn master_volume(&self) -> f64 {
        self.inner.master()
    }

    /// Set master volume and re-apply it to every playing track.
    pub async fn set_master_volume(&self, v01: f64) {
        let master = clamp01(v01);
        if let Ok(mut m) = self.inner.master.lock() {
            *m = master;
        }
        let tracks = self.inner.tracks.lock().await;
        for (id, slot) in tracks.iter().filter(|(_, s)| s.playing) {
            self.inner.call(
                "set_volume",
                self.inner.backend.set_volume(*id, master * slot.gain01),
            );
        }
    }

    /// Arm `commands` relative to now. Must be called inside a tokio runtime.
    pub fn schedule(&self, commands: &[AudioCommand]) {
        if commands.is_empty() {
            return;
        }
        let mut armed = commands.to_vec();
        armed.sort_by_key(AudioCommand::t_ms);

        let t0 = Instant::now();
        let stamp = self.inner.generation.load(Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        debug!(commands = armed.len(), generation = stamp, "arming audio batch");

        let handle = tokio::spawn(async move {
            for cmd in armed {
                sleep_until(t0 + Duration::from_millis(cmd.t_ms())).await;
                if !inner.is_current(stamp) {
                    return;
                }
                inner.apply(&cmd, stamp).await;
            }
        });

        if let Ok(mut batches) = self.batches.lock() {
            batches.retain(|h| !h.is_finished());
            batches.push(handle);
        }
    }

    /// One-shot UI cue at `master × cue scale`, independent of the bed.
    pub fn play_cue(&self, cue: Cue) {
        let volume = self.inner.master() * self.inner.cue_volume_scale;
        self.inner
            .call("play_cue", self.inner.backend.play_cue(cue, volume));
    }

    /// Cancel armed commands and fades, and stop every playing track.
    pub async fn stop_all(&self) {
        self.cancel_batches();
        let mut tracks = self.inner.tracks.lock().await;
        for (id, slot) in tracks.iter_mut().filter(|(_, s)| s.playing) {
            self.inner.call("stop", self.inner.backend.stop(*id));
            slot.playing = false;
        }
    }

    /// Release every loaded track exactly once. Repeatable.
    pub async fn dispose(&self) {
        self.stop_all().await;
        let mut tracks = self.inner.tracks.lock().await;
        for (id, _) in tracks.drain() {
            self.inner.call("unload", self.inner.backend.unload(id));
        }
        drop(tracks);
        let previous = self
            .ready
            .lock()
            .map(|mut r| std::mem::replace(&mut *r, Arc::new(OnceCell::new())));
        if previous.map_or(false, |r| r.initialized()) {
            info!("audio engine disposed");
        }
    }

    pub async fn is_playing(&self, id: TrackId) -> bool {
        self.inner
            .tracks
            .lock()
            .await
            .get(&id)
            .map(|s| s.playing)
            .unwrap_or(false)
    }

    fn cancel_batches(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut batches) = self.batches.lock() {
            for handle in batches.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.cancel_batches();
    }
}
