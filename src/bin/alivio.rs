//! Alivio CLI - Command-line interface for Alivio Sensory
//!
//! Commands:
//! - plan: Build a session plan and print it as JSON
//! - profile: Show the cadence profile for one or all sites
//! - simulate: Run a full session against recording backends on a virtual clock
//! - doctor: Diagnose scheduler settings and planner health

use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use alivio_sensory::backend::{AudioEvent, HapticEvent};
use alivio_sensory::config::{SchedulerSettings, SessionConfig, SessionMode};
use alivio_sensory::plan::{build_session_plan, build_session_plan_with_rng};
use alivio_sensory::profile::{self, SiteProfile};
use alivio_sensory::types::{AgeGroup, HapticPattern, PeakStyle, SessionPlan, SessionRecord, Site};
use alivio_sensory::{
    RecordingAudio, RecordingHaptics, SensoryError, SensorySession, PRODUCER_NAME, SENSORY_VERSION,
};

/// Alivio - phased haptic, audio and visual comfort sessions
#[derive(Parser)]
#[command(name = "alivio")]
#[command(author = "Alivio Health")]
#[command(version = SENSORY_VERSION)]
#[command(about = "Build and simulate sensory comfort sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Procedure site (e.g. fingerstick, subq_abdomen, im_deltoid)
    #[arg(long, default_value = "fingerstick")]
    site: String,

    /// Age group (e.g. adult, child, older_adult)
    #[arg(long, default_value = "adult")]
    age_group: String,

    /// Session length in seconds (18, 24 or 30)
    #[arg(short, long, default_value = "24")]
    duration: u32,

    /// Peak phase style
    #[arg(long, default_value = "max")]
    peak_style: PeakStyleArg,

    /// Snap density in [0, 1]; only used with --peak-style snap
    #[arg(long, default_value = "0.5")]
    snap_density: f64,

    /// Haptic intensity in [0, 1]
    #[arg(long, default_value = "1.0")]
    intensity: f64,

    /// Ambient audio volume in [0, 1]
    #[arg(long, default_value = "0.7")]
    volume: f64,
}

impl SessionArgs {
    fn to_config(&self, mode: SessionMode) -> SessionConfig {
        SessionConfig {
            site: parse_site(&self.site),
            age_group: parse_age_group(&self.age_group),
            duration_sec: Some(self.duration),
            haptics_intensity01: self.intensity,
            audio_volume01: self.volume,
            peak_style: self.peak_style.into(),
            snap_density01: self.snap_density,
            mode,
        }
        .normalized()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a session plan and print it as JSON
    Plan {
        #[command(flatten)]
        session: SessionArgs,

        /// Seed the jitter RNG for a reproducible plan
        #[arg(long)]
        seed: Option<u64>,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Show the cadence profile for a site, or every site
    Profile {
        /// Site to resolve; omit to list all
        #[arg(long)]
        site: Option<String>,

        /// Age group
        #[arg(long, default_value = "adult")]
        age_group: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a session against recording backends on a virtual clock
    Simulate {
        #[command(flatten)]
        session: SessionArgs,

        /// Drive haptics with the live generator instead of the plan
        #[arg(long)]
        live: Option<PatternArg>,

        /// Stop the session early after this many milliseconds
        #[arg(long)]
        stop_after_ms: Option<u64>,

        /// Scheduler settings file (JSON)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Print every backend event as NDJSON before the summary
        #[arg(long)]
        timeline: bool,
    },

    /// Diagnose scheduler settings and planner health
    Doctor {
        /// Check a scheduler settings file
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeakStyleArg {
    /// Sustained strong carrier with clustered hits
    Max,
    /// Rhythmic double-tap snaps over a lighter bed
    Snap,
}

impl From<PeakStyleArg> for PeakStyle {
    fn from(arg: PeakStyleArg) -> Self {
        match arg {
            PeakStyleArg::Max => PeakStyle::Max,
            PeakStyleArg::Snap => PeakStyle::Snap,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PatternArg {
    Standard,
    GentleWave,
    SoftPulse,
}

impl From<PatternArg> for HapticPattern {
    fn from(arg: PatternArg) -> Self {
        match arg {
            PatternArg::Standard => HapticPattern::Standard,
            PatternArg::GentleWave => HapticPattern::GentleWave,
            PatternArg::SoftPulse => HapticPattern::SoftPulse,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), AlivioCliError> {
    match cli.command {
        Commands::Plan {
            session,
            seed,
            pretty,
        } => cmd_plan(&session, seed, pretty),

        Commands::Profile {
            site,
            age_group,
            json,
        } => cmd_profile(site.as_deref(), &age_group, json),

        Commands::Simulate {
            session,
            live,
            stop_after_ms,
            settings,
            timeline,
        } => {
            let mode = match live {
                Some(pattern) => SessionMode::Live {
                    pattern: pattern.into(),
                },
                None => SessionMode::Planned,
            };
            cmd_simulate(
                session.to_config(mode),
                stop_after_ms,
                settings.as_deref(),
                timeline,
            )
        }

        Commands::Doctor { settings, json } => cmd_doctor(settings.as_deref(), json),
    }
}

fn cmd_plan(session: &SessionArgs, seed: Option<u64>, pretty: bool) -> Result<(), AlivioCliError> {
    let config = session.to_config(SessionMode::Planned);
    let opts = config.plan_options();

    let plan = match seed {
        Some(seed) => build_session_plan_with_rng(
            config.site,
            config.age_group,
            config.duration_sec(),
            &opts,
            &mut StdRng::seed_from_u64(seed),
        ),
        None => build_session_plan(config.site, config.age_group, config.duration_sec(), &opts),
    };

    if pretty {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        println!("{}", plan.to_json()?);
    }
    Ok(())
}

fn cmd_profile(site: Option<&str>, age_group: &str, json: bool) -> Result<(), AlivioCliError> {
    let age_group = parse_age_group(age_group);
    let rows: Vec<ProfileRow> = match site {
        Some(name) => {
            let site = parse_site(name);
            vec![ProfileRow {
                site,
                profile: profile::resolve(site, age_group),
            }]
        }
        None => Site::ALL
            .into_iter()
            .map(|site| ProfileRow {
                site,
                profile: profile::resolve(site, age_group),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("Cadence profiles ({})", age_group.as_str());
        println!("{:<22} {:>7} {:>6} {:>6} {:>7}", "site", "settle", "peak", "cool", "jitter");
        for row in &rows {
            println!(
                "{:<22} {:>7} {:>6} {:>6} {:>7}",
                row.site.as_str(),
                row.profile.settle_interval_ms,
                row.profile.peak_interval_ms,
                row.profile.cool_interval_ms,
                row.profile.jitter_ms
            );
        }
    }
    Ok(())
}

fn cmd_simulate(
    config: SessionConfig,
    stop_after_ms: Option<u64>,
    settings_path: Option<&Path>,
    timeline: bool,
) -> Result<(), AlivioCliError> {
    let settings = match settings_path {
        Some(path) => SchedulerSettings::from_json(&fs::read_to_string(path)?)?,
        None => SchedulerSettings::default(),
    };

    // Paused clock: the runtime jumps to the next timer whenever it is idle.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()?;
    let (report, events) = runtime.block_on(simulate(config, settings, stop_after_ms))?;

    if timeline {
        for entry in &events {
            println!("{}", serde_json::to_string(entry)?);
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn simulate(
    config: SessionConfig,
    settings: SchedulerSettings,
    stop_after_ms: Option<u64>,
) -> Result<(SimulationReport, Vec<TimelineEntry>), AlivioCliError> {
    let haptics = Arc::new(RecordingHaptics::new());
    let audio = Arc::new(RecordingAudio::new());
    let session = SensorySession::new(haptics.clone(), audio.clone(), settings);
    let mut records = session.subscribe_records();

    let t0 = Instant::now();
    session.play_start_sound();
    let plan = session.start(config).await.ok_or(AlivioCliError::Superseded)?;

    if let Some(ms) = stop_after_ms {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        session.stop().await;
    }
    let record = records.recv().await.ok_or(AlivioCliError::NoRecord)?;
    if record.completed {
        session.play_complete_sound().await;
    }
    let failures = session.failures().total();
    session.dispose().await;

    let mut events: Vec<TimelineEntry> = haptics
        .timeline()
        .into_iter()
        .map(|(at, event)| TimelineEntry {
            t_ms: at.saturating_duration_since(t0).as_millis() as u64,
            event: TimelineEvent::Haptic(event),
        })
        .chain(audio.timeline().into_iter().map(|(at, event)| TimelineEntry {
            t_ms: at.saturating_duration_since(t0).as_millis() as u64,
            event: TimelineEvent::Audio(event),
        }))
        .collect();
    events.sort_by_key(|e| e.t_ms);

    let report = SimulationReport::new(&plan, &events, failures, record);
    Ok((report, events))
}

fn cmd_doctor(settings_path: Option<&Path>, json: bool) -> Result<(), AlivioCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "sensory_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Alivio Sensory version {}", SENSORY_VERSION),
    });

    // Check settings file if provided
    let settings = match settings_path {
        Some(path) if path.exists() => match fs::read_to_string(path) {
            Ok(content) => match SchedulerSettings::from_json(&content) {
                Ok(settings) => {
                    checks.push(DoctorCheck {
                        name: "settings".to_string(),
                        status: CheckStatus::Ok,
                        message: format!(
                            "Settings valid ({} bpm, {} ms frames)",
                            settings.visual_beat_bpm, settings.visual_frame_ms
                        ),
                    });
                    settings
                }
                Err(e) => {
                    checks.push(DoctorCheck {
                        name: "settings".to_string(),
                        status: CheckStatus::Error,
                        message: e.to_string(),
                    });
                    SchedulerSettings::default()
                }
            },
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "settings".to_string(),
                    status: CheckStatus::Error,
                    message: format!("Cannot read settings file: {}", e),
                });
                SchedulerSettings::default()
            }
        },
        Some(_) => {
            checks.push(DoctorCheck {
                name: "settings".to_string(),
                status: CheckStatus::Warning,
                message: "Settings file does not exist, using defaults".to_string(),
            });
            SchedulerSettings::default()
        }
        None => SchedulerSettings::default(),
    };

    if settings.fade_in_ms > 0 && settings.fade_in_steps == 0 {
        checks.push(DoctorCheck {
            name: "fade_in".to_string(),
            status: CheckStatus::Warning,
            message: "fadeInMs is set but fadeInSteps is 0; tracks start at full volume".to_string(),
        });
    }

    // Every site must resolve to usable intervals
    let degenerate: Vec<&str> = Site::ALL
        .into_iter()
        .filter(|&site| !profile_is_usable(&profile::resolve(site, AgeGroup::Adult)))
        .map(|site| site.as_str())
        .collect();
    checks.push(if degenerate.is_empty() {
        DoctorCheck {
            name: "profiles".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} site profiles resolve", Site::ALL.len()),
        }
    } else {
        DoctorCheck {
            name: "profiles".to_string(),
            status: CheckStatus::Error,
            message: format!("Degenerate profiles: {}", degenerate.join(", ")),
        }
    });

    // Sample plan for every supported duration
    let problems: Vec<String> = [18, 24, 30]
        .into_iter()
        .filter_map(|secs| {
            let config = SessionConfig {
                duration_sec: Some(secs),
                ..SessionConfig::default()
            };
            let plan = build_session_plan(
                config.site,
                config.age_group,
                config.duration_sec(),
                &config.plan_options(),
            );
            plan_problem(&plan).map(|p| format!("{}s: {}", secs, p))
        })
        .collect();
    checks.push(if problems.is_empty() {
        DoctorCheck {
            name: "planner".to_string(),
            status: CheckStatus::Ok,
            message: "Phases contiguous and haptics inside the session".to_string(),
        }
    } else {
        DoctorCheck {
            name: "planner".to_string(),
            status: CheckStatus::Error,
            message: problems.join("; "),
        }
    });

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: SENSORY_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Alivio Doctor Report");
        println!("====================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(AlivioCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn parse_site(name: &str) -> Site {
    name.parse().unwrap_or(Site::Other)
}

fn parse_age_group(name: &str) -> AgeGroup {
    name.parse().unwrap_or_default()
}

fn profile_is_usable(p: &SiteProfile) -> bool {
    p.settle_interval_ms > p.jitter_ms && p.peak_interval_ms > p.jitter_ms && p.cool_interval_ms > p.jitter_ms
}

fn plan_problem(plan: &SessionPlan) -> Option<String> {
    let mut cursor = 0;
    for window in &plan.phases {
        if window.start_ms != cursor || window.end_ms <= window.start_ms {
            return Some(format!("phase {} is not contiguous", window.name.as_str()));
        }
        cursor = window.end_ms;
    }
    if cursor != plan.total_ms() {
        return Some("phases do not cover the session".to_string());
    }
    match plan.haptics.last() {
        None => Some("no haptic commands".to_string()),
        Some(last) if last.t_ms() >= plan.total_ms() => Some("haptics run past the end".to_string()),
        Some(_) => None,
    }
}

#[derive(Serialize)]
struct ProfileRow {
    site: Site,
    #[serde(flatten)]
    profile: SiteProfile,
}

#[derive(Serialize)]
#[serde(tag = "source", content = "event", rename_all = "lowercase")]
enum TimelineEvent {
    Haptic(HapticEvent),
    Audio(AudioEvent),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineEntry {
    t_ms: u64,
    #[serde(flatten)]
    event: TimelineEvent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulationReport {
    planned_haptics: usize,
    planned_audio: usize,
    fired_haptics: usize,
    audio_events: usize,
    failures: u64,
    record: SessionRecord,
}

impl SimulationReport {
    fn new(plan: &SessionPlan, events: &[TimelineEntry], failures: u64, record: SessionRecord) -> Self {
        let fired_haptics = events
            .iter()
            .filter(|e| matches!(e.event, TimelineEvent::Haptic(_)))
            .count();
        Self {
            planned_haptics: plan.haptics.len(),
            planned_audio: plan.audio.len(),
            fired_haptics,
            audio_events: events.len() - fired_haptics,
            failures,
            record,
        }
    }
}

// Error handling

#[derive(Debug)]
enum AlivioCliError {
    Io(io::Error),
    Sensory(SensoryError),
    Json(serde_json::Error),
    Superseded,
    NoRecord,
    DoctorFailed,
}

impl From<io::Error> for AlivioCliError {
    fn from(e: io::Error) -> Self {
        AlivioCliError::Io(e)
    }
}

impl From<SensoryError> for AlivioCliError {
    fn from(e: SensoryError) -> Self {
        AlivioCliError::Sensory(e)
    }
}

impl From<serde_json::Error> for AlivioCliError {
    fn from(e: serde_json::Error) -> Self {
        AlivioCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<AlivioCliError> for CliError {
    fn from(e: AlivioCliError) -> Self {
        match e {
            AlivioCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            AlivioCliError::Sensory(e) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'alivio doctor --settings <file>' for details".to_string()),
            },
            AlivioCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            AlivioCliError::Superseded => CliError {
                code: "SUPERSEDED".to_string(),
                message: "Session start was superseded before it armed".to_string(),
                hint: None,
            },
            AlivioCliError::NoRecord => CliError {
                code: "NO_RECORD".to_string(),
                message: "Session ended without emitting a record".to_string(),
                hint: None,
            },
            AlivioCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
