//! Session plan builder
//!
//! Turns `(site, age_group, duration, options)` into an immutable
//! [`SessionPlan`]: three contiguous phase windows, a time-ordered list of
//! haptic impacts and the ambient audio bed. The only non-determinism is the
//! per-tick cadence jitter, which never moves phase boundaries or audio.
//!
//! Generation per phase:
//! 1. Settle - carrier burst ramping 0.35 → 0.75
//! 2. Peak - `max` spikes or `snap` clusters, see [`PeakStyle`]
//! 3. Cooldown - carrier burst ramping 0.65 → 0.20 with tighter jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::profile::{self, SiteProfile};
use crate::timebase::{clamp01, lerp, rand_int};
use crate::types::{
    AgeGroup, AudioCommand, HapticCommand, PeakStyle, PhaseName, PhaseWindow, SessionPlan, Site,
    TrackAction, TrackId,
};

/// Floor for any inter-tick gap.
pub const MIN_TICK_MS: u64 = 18;

/// Duration used when the requested one has no phase split.
pub const DEFAULT_DURATION_SEC: u32 = 24;

/// The ambient bed stops this long before the session ends.
pub const AUDIO_TAIL_MS: u64 = 300;

const SETTLE_RAMP: (f64, f64) = (0.35, 0.75);
const COOLDOWN_RAMP: (f64, f64) = (0.65, 0.20);
const COOLDOWN_JITTER_SCALE: f64 = 0.6;

const MAX_SPIKE_PERIOD_MS: u64 = 260;
const MAX_SPIKE_SKIP_MS: u64 = 120;
const MAX_SPIKE_HITS: [(u64, f64); 3] = [(0, 1.0), (28, 0.95), (56, 0.85)];
const MAX_BASELINE: f64 = 0.9;

const SNAP_PERIOD_SLOW_MS: f64 = 650.0;
const SNAP_PERIOD_FAST_MS: f64 = 200.0;
const SNAP_SKIP_MS: u64 = 110;
const SNAP_HITS: [(u64, f64); 2] = [(0, 1.0), (36, 0.85)];
const SNAP_BASELINE: f64 = 0.75;

/// User-tuned inputs to the builder. Values are clamped on use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanOptions {
    pub peak_style: PeakStyle,
    pub snap_density01: f64,
    pub haptics_intensity01: f64,
    pub audio_volume01: f64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            peak_style: PeakStyle::Max,
            snap_density01: 0.5,
            haptics_intensity01: 1.0,
            audio_volume01: 0.7,
        }
    }
}

/// Phase lengths in seconds for a supported duration.
///
/// Returns the duration actually used together with its split; unsupported
/// durations resolve to the 24 second split.
pub fn phase_split(duration_sec: u32) -> (u32, [u32; 3]) {
    match duration_sec {
        18 => (18, [9, 4, 5]),
        24 => (24, [12, 6, 6]),
        30 => (30, [15, 7, 8]),
        other => {
            warn!(
                requested = other,
                fallback = DEFAULT_DURATION_SEC,
                "unsupported session duration, using default split"
            );
            (DEFAULT_DURATION_SEC, [12, 6, 6])
        }
    }
}

/// Snap cluster period: 650ms at density 0 down to 200ms at density 1.
pub fn snap_period_ms(snap_density01: f64) -> u64 {
    lerp(SNAP_PERIOD_SLOW_MS, SNAP_PERIOD_FAST_MS, clamp01(snap_density01)).round() as u64
}

/// Build a plan using the thread-local RNG for cadence jitter.
pub fn build_session_plan(
    site: Site,
    age_group: AgeGroup,
    duration_sec: u32,
    opts: &PlanOptions,
) -> SessionPlan {
    build_session_plan_with_rng(site, age_group, duration_sec, opts, &mut rand::thread_rng())
}

/// Build a plan with a caller-provided RNG. A seeded RNG gives identical plans.
pub fn build_session_plan_with_rng<R: Rng + ?Sized>(
    site: Site,
    age_group: AgeGroup,
    duration_sec: u32,
    opts: &PlanOptions,
    rng: &mut R,
) -> SessionPlan {
    let (duration_sec, split) = phase_split(duration_sec);
    let profile = profile::resolve(site, age_group);
    let global = clamp01(opts.haptics_intensity01);

    let phases = phase_windows(split);
    let mut haptics = Vec::new();

    for window in &phases {
        match window.name {
            PhaseName::Settle => add_carrier_burst(
                &mut haptics,
                rng,
                window,
                u64::from(profile.settle_interval_ms),
                i64::from(profile.jitter_ms),
                SETTLE_RAMP,
                global,
            ),
            PhaseName::Peak => match opts.peak_style {
                PeakStyle::Max => add_peak_max(&mut haptics, rng, window, &profile, global),
                PeakStyle::Snap => add_peak_snap(
                    &mut haptics,
                    rng,
                    window,
                    &profile,
                    global,
                    opts.snap_density01,
                ),
            },
            PhaseName::Cooldown => {
                let jitter =
                    ((f64::from(profile.jitter_ms) * COOLDOWN_JITTER_SCALE).round() as i64).max(1);
                add_carrier_burst(
                    &mut haptics,
                    rng,
                    window,
                    u64::from(profile.cool_interval_ms),
                    jitter,
                    COOLDOWN_RAMP,
                    global,
                )
            }
        }
    }

    haptics.sort_by_key(HapticCommand::t_ms);

    let total_ms = u64::from(duration_sec) * 1000;
    let audio = ambient_bed(total_ms, opts.audio_volume01);

    debug!(
        site = site.as_str(),
        duration_sec,
        haptics = haptics.len(),
        peak_style = opts.peak_style.as_str(),
        "built session plan"
    );

    SessionPlan {
        site,
        age_group,
        duration_sec,
        phases,
        haptics,
        audio,
    }
}

fn phase_windows(split: [u32; 3]) -> Vec<PhaseWindow> {
    let names = [PhaseName::Settle, PhaseName::Peak, PhaseName::Cooldown];
    let mut start_ms = 0u64;
    names
        .into_iter()
        .zip(split)
        .map(|(name, secs)| {
            let end_ms = start_ms + u64::from(secs) * 1000;
            let window = PhaseWindow {
                name,
                start_ms,
                end_ms,
            };
            start_ms = end_ms;
            window
        })
        .collect()
}

fn ambient_bed(total_ms: u64, audio_volume01: f64) -> Vec<AudioCommand> {
    let gain01 = clamp01(audio_volume01);
    vec![
        AudioCommand::Track {
            t_ms: 0,
            id: TrackId::Lofi,
            gain01,
            action: TrackAction::Start,
        },
        AudioCommand::Track {
            t_ms: total_ms.saturating_sub(AUDIO_TAIL_MS),
            id: TrackId::Lofi,
            gain01,
            action: TrackAction::Stop,
        },
    ]
}

fn jittered_step<R: Rng + ?Sized>(rng: &mut R, base_ms: u64, jitter_ms: i64) -> u64 {
    let step = base_ms as i64 + rand_int(rng, -jitter_ms, jitter_ms);
    (step.max(MIN_TICK_MS as i64)) as u64
}

/// Carrier burst: one impact per tick across `window`, intensity ramped
/// linearly from `ramp.0` to `ramp.1` and scaled by `global`.
pub fn add_carrier_burst<R: Rng + ?Sized>(
    out: &mut Vec<HapticCommand>,
    rng: &mut R,
    window: &PhaseWindow,
    base_interval_ms: u64,
    jitter_ms: i64,
    ramp: (f64, f64),
    global: f64,
) {
    let dur = window.duration_ms();
    if dur == 0 {
        return;
    }
    let mut t = window.start_ms;
    while t < window.end_ms {
        let p = (t - window.start_ms) as f64 / dur as f64;
        out.push(HapticCommand::impact(t, lerp(ramp.0, ramp.1, p) * global));
        t += jittered_step(rng, base_interval_ms, jitter_ms);
    }
}

/// Cluster of hits at `t + offset`, dropping any that would cross the phase end.
fn push_cluster(
    out: &mut Vec<HapticCommand>,
    window: &PhaseWindow,
    t: u64,
    hits: &[(u64, f64)],
    global: f64,
) {
    for &(offset, level) in hits {
        let at = t + offset;
        if at < window.end_ms {
            out.push(HapticCommand::impact(at, level * global));
        }
    }
}

/// Peak `max`: dense ticks with a 3-hit spike every ~260ms.
pub fn add_peak_max<R: Rng + ?Sized>(
    out: &mut Vec<HapticCommand>,
    rng: &mut R,
    window: &PhaseWindow,
    profile: &SiteProfile,
    global: f64,
) {
    let base = u64::from(profile.peak_interval_ms);
    let jitter = i64::from(profile.jitter_ms);
    let mut t = window.start_ms;
    while t < window.end_ms {
        let interval = jittered_step(rng, base, jitter);
        if (t - window.start_ms) % MAX_SPIKE_PERIOD_MS < interval {
            push_cluster(out, window, t, &MAX_SPIKE_HITS, global);
            t += MAX_SPIKE_SKIP_MS;
        } else {
            out.push(HapticCommand::impact(t, MAX_BASELINE * global));
            t += interval;
        }
    }
}

/// Peak `snap`: baseline buzz with a 2-hit snap every [`snap_period_ms`].
pub fn add_peak_snap<R: Rng + ?Sized>(
    out: &mut Vec<HapticCommand>,
    rng: &mut R,
    window: &PhaseWindow,
    profile: &SiteProfile,
    global: f64,
    snap_density01: f64,
) {
    let period = snap_period_ms(snap_density01);
    let base = u64::from(profile.peak_interval_ms);
    let jitter = i64::from(profile.jitter_ms);
    let mut t = window.start_ms;
    while t < window.end_ms {
        let interval = jittered_step(rng, base, jitter);
        if (t - window.start_ms) % period < interval {
            push_cluster(out, window, t, &SNAP_HITS, global);
            t += SNAP_SKIP_MS;
        } else {
            out.push(HapticCommand::impact(t, SNAP_BASELINE * global));
            t += interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImpactStyle;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn impact_times(cmds: &[HapticCommand]) -> Vec<u64> {
        cmds.iter().map(HapticCommand::t_ms).collect()
    }

    #[test]
    fn test_phases_partition_every_supported_duration() {
        for duration in [18, 24, 30] {
            let plan =
                build_session_plan(Site::Fingerstick, AgeGroup::Adult, duration, &PlanOptions::default());
            let names: Vec<PhaseName> = plan.phases.iter().map(|p| p.name).collect();
            assert_eq!(names, vec![PhaseName::Settle, PhaseName::Peak, PhaseName::Cooldown]);
            assert_eq!(plan.phases[0].start_ms, 0);
            for pair in plan.phases.windows(2) {
                assert_eq!(pair[0].end_ms, pair[1].start_ms);
                assert!(pair[0].start_ms < pair[0].end_ms);
            }
            assert_eq!(plan.phases[2].end_ms, u64::from(duration) * 1000);
        }
    }

    #[test]
    fn test_unknown_duration_uses_default_split() {
        let plan = build_session_plan(Site::Other, AgeGroup::Adult, 45, &PlanOptions::default());
        assert_eq!(plan.duration_sec, 24);
        assert_eq!(plan.phases[0].end_ms, 12_000);
        assert_eq!(plan.phases[1].end_ms, 18_000);
        assert_eq!(plan.phases[2].end_ms, 24_000);
    }

    #[test]
    fn test_every_impact_style_matches_intensity() {
        for style in [PeakStyle::Max, PeakStyle::Snap] {
            for intensity in [0.0, 0.3, 0.6, 1.0] {
                let opts = PlanOptions {
                    peak_style: style,
                    haptics_intensity01: intensity,
                    ..Default::default()
                };
                let plan = build_session_plan(Site::SubqAbdomen, AgeGroup::Adult, 30, &opts);
                for cmd in &plan.haptics {
                    if let HapticCommand::Impact { style, intensity01, .. } = cmd {
                        assert_eq!(*style, ImpactStyle::from_intensity(*intensity01));
                        assert!((0.0..=1.0).contains(intensity01));
                    }
                }
            }
        }
    }

    #[test]
    fn test_carrier_burst_window_and_gaps() {
        let mut rng = StdRng::seed_from_u64(42);
        let window = PhaseWindow {
            name: PhaseName::Settle,
            start_ms: 0,
            end_ms: 12_000,
        };
        let mut out = Vec::new();
        // Jitter wider than the base interval forces the floor to engage.
        add_carrier_burst(&mut out, &mut rng, &window, 20, 15, (0.35, 0.75), 1.0);
        assert!(!out.is_empty());
        let times = impact_times(&out);
        assert!(times.iter().all(|t| (0..12_000).contains(t)));
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_TICK_MS);
        }
        if let HapticCommand::Impact { intensity01, .. } = out[0] {
            assert!((intensity01 - 0.35).abs() < 1e-9);
        }
    }

    #[test]
    fn test_carrier_burst_ramps_up() {
        let mut rng = StdRng::seed_from_u64(3);
        let window = PhaseWindow {
            name: PhaseName::Settle,
            start_ms: 1000,
            end_ms: 5000,
        };
        let mut out = Vec::new();
        add_carrier_burst(&mut out, &mut rng, &window, 52, 8, SETTLE_RAMP, 1.0);
        let levels: Vec<f64> = out
            .iter()
            .filter_map(|c| match c {
                HapticCommand::Impact { intensity01, .. } => Some(*intensity01),
                _ => None,
            })
            .collect();
        assert!(levels.windows(2).all(|w| w[1] >= w[0]));
        assert!(*levels.last().unwrap() < 0.75);
    }

    #[test]
    fn test_snap_period_interpolates() {
        assert_eq!(snap_period_ms(0.0), 650);
        assert_eq!(snap_period_ms(1.0), 200);
        assert_eq!(snap_period_ms(0.5), 425);
        assert_eq!(snap_period_ms(-3.0), 650);
        assert_eq!(snap_period_ms(4.0), 200);
    }

    #[test]
    fn test_peak_clusters_stay_inside_phase() {
        let mut rng = StdRng::seed_from_u64(9);
        let window = PhaseWindow {
            name: PhaseName::Peak,
            start_ms: 9000,
            end_ms: 13_000,
        };
        let profile = profile::resolve(Site::Fingerstick, AgeGroup::Adult);
        let mut out = Vec::new();
        add_peak_max(&mut out, &mut rng, &window, &profile, 1.0);
        add_peak_snap(&mut out, &mut rng, &window, &profile, 1.0, 1.0);
        assert!(out.iter().all(|c| window.contains(c.t_ms())));
        let heavy = out
            .iter()
            .filter(|c| matches!(c, HapticCommand::Impact { style: ImpactStyle::Heavy, .. }))
            .count();
        assert!(heavy > 0);
    }

    #[test]
    fn test_fingerstick_eighteen_second_scenario() {
        let opts = PlanOptions {
            peak_style: PeakStyle::Max,
            snap_density01: 0.5,
            haptics_intensity01: 1.0,
            audio_volume01: 0.7,
        };
        let plan = build_session_plan(Site::Fingerstick, AgeGroup::Adult, 18, &opts);

        assert_eq!(
            plan.phases,
            vec![
                PhaseWindow { name: PhaseName::Settle, start_ms: 0, end_ms: 9000 },
                PhaseWindow { name: PhaseName::Peak, start_ms: 9000, end_ms: 13_000 },
                PhaseWindow { name: PhaseName::Cooldown, start_ms: 13_000, end_ms: 18_000 },
            ]
        );
        assert_eq!(
            plan.audio,
            vec![
                AudioCommand::Track {
                    t_ms: 0,
                    id: TrackId::Lofi,
                    gain01: 0.7,
                    action: TrackAction::Start
                },
                AudioCommand::Track {
                    t_ms: 17_700,
                    id: TrackId::Lofi,
                    gain01: 0.7,
                    action: TrackAction::Stop
                },
            ]
        );
        assert!(!plan.haptics.is_empty());
        assert!(plan.haptics.last().unwrap().t_ms() < 18_000);
    }

    #[test]
    fn test_repeated_builds_share_phases_and_audio() {
        let opts = PlanOptions::default();
        let a = build_session_plan(Site::ImDeltoid, AgeGroup::Child, 30, &opts);
        let b = build_session_plan(Site::ImDeltoid, AgeGroup::Child, 30, &opts);
        assert_eq!(a.phases, b.phases);
        assert_eq!(a.audio, b.audio);
    }

    #[test]
    fn test_seeded_builds_are_identical() {
        let opts = PlanOptions {
            peak_style: PeakStyle::Snap,
            snap_density01: 0.8,
            ..Default::default()
        };
        let a = build_session_plan_with_rng(
            Site::SubqThigh,
            AgeGroup::Adult,
            24,
            &opts,
            &mut StdRng::seed_from_u64(1234),
        );
        let b = build_session_plan_with_rng(
            Site::SubqThigh,
            AgeGroup::Adult,
            24,
            &opts,
            &mut StdRng::seed_from_u64(1234),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_haptics_sorted_and_bounded() {
        let plan = build_session_plan(Site::SubqAbdomen, AgeGroup::Adult, 24, &PlanOptions::default());
        let times = impact_times(&plan.haptics);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times.iter().all(|t| *t < plan.total_ms()));
    }

    #[test]
    fn test_audio_gain_is_clamped() {
        let opts = PlanOptions {
            audio_volume01: 1.7,
            ..Default::default()
        };
        let plan = build_session_plan(Site::Fingerstick, AgeGroup::Adult, 24, &opts);
        assert!(plan.audio.iter().all(|c| c.gain01() == 1.0));
    }
}
