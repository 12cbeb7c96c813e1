use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use zonecoach::executor::{AttemptStatus, CheckpointStore};
use zonecoach::logging::{init_logging, log_error};
use zonecoach::{
    AppConfig, CoachService, LogLevel, LogNotifier, PlanTemplates, SessionSnapshot,
    SessionSummary, SimulatedSensor, SimulatedTransport, TrainingPlan, Zone,
};

/// ZoneCoach - Heart rate zone training coach
///
/// Streams a heart rate sensor through a smoothing filter and walks a
/// training plan phase by phase, telling the athlete when to speed up or
/// slow down.
#[derive(Parser)]
#[command(name = "zonecoach")]
#[command(author = "ZoneCoach Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Heart rate zone training coach", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a training plan against the simulated sensor
    Run {
        /// Plan file (JSON)
        #[arg(short, long, conflicts_with = "template")]
        plan: Option<PathBuf>,

        /// Built-in plan: tempo, endurance, vo2, ramp
        #[arg(short, long)]
        template: Option<String>,

        /// Hold the simulated heart rate at this value
        #[arg(short, long)]
        bpm: Option<u16>,

        /// Wait for this cron expression to fire before starting
        #[arg(short, long)]
        schedule: Option<String>,
    },

    /// Check a plan file and print its phases
    Validate {
        /// Plan file (JSON)
        file: PathBuf,
    },

    /// Inspect the recovery checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Configure application settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the saved checkpoint and the last session summary
    Show,
    /// Delete the saved checkpoint
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[derive(Tabled)]
struct PhaseRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Phase")]
    name: String,
    #[tabled(rename = "Target")]
    zone: String,
    #[tabled(rename = "BPM")]
    range: String,
    #[tabled(rename = "Ends")]
    ends: String,
}

#[derive(Tabled)]
struct ZoneRow {
    #[tabled(rename = "Zone")]
    zone: String,
    #[tabled(rename = "Time")]
    time: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
    let mut config = AppConfig::load_or_default(&config_path)?;

    // Verbosity flags override the configured level
    if let Some(level) = LogLevel::from_verbosity(cli.verbose) {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run {
            plan,
            template,
            bpm,
            schedule,
        } => {
            let plan = resolve_plan(&config, plan, template)?;
            run(config, plan, bpm, schedule).await?;
        }

        Commands::Validate { file } => {
            let plan = TrainingPlan::load_from_file(&file)?;
            match plan.validate() {
                Ok(()) => {
                    println!("{}", format!("✓ {} is valid", plan.name).green().bold());
                    print_plan(&plan);
                }
                Err(e) => bail!("{}", e),
            }
        }

        Commands::Checkpoint { action } => {
            let store = CheckpointStore::from_config(&config.storage);
            match action {
                CheckpointAction::Show => show_checkpoint(&store)?,
                CheckpointAction::Clear => {
                    store.clear()?;
                    println!("{}", "✓ Checkpoint cleared".green());
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    bail!(
                        "{} already exists, use --force to overwrite",
                        config_path.display()
                    );
                }
                let mut fresh = AppConfig::default();
                fresh.save_to_file(&config_path)?;
                println!(
                    "{}",
                    format!("✓ Configuration written to {}", config_path.display()).green()
                );
            }
            ConfigAction::Show => {
                println!("{}", format!("# {}", config_path.display()).dimmed());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

fn resolve_plan(
    config: &AppConfig,
    file: Option<PathBuf>,
    template: Option<String>,
) -> Result<TrainingPlan> {
    let max_hr = config.athlete.effective_max_hr();
    match (file, template) {
        (Some(file), _) => TrainingPlan::load_from_file(&file),
        (None, Some(name)) => PlanTemplates::from_name(&name, max_hr)
            .with_context(|| format!("Unknown template '{}'", name)),
        (None, None) => Ok(PlanTemplates::tempo_run(max_hr)),
    }
}

async fn run(
    config: AppConfig,
    plan: TrainingPlan,
    bpm: Option<u16>,
    schedule: Option<String>,
) -> Result<()> {
    plan.validate()?;

    let sensor = match bpm {
        Some(bpm) => SimulatedSensor::steady(bpm),
        None => SimulatedSensor::default(),
    };
    let transport = Arc::new(SimulatedTransport::new(sensor));
    let service = CoachService::start(config, transport, Arc::new(LogNotifier))?;

    let result = drive(&service, plan, schedule).await;
    if let Err(e) = &result {
        if let Some(coach) = e.downcast_ref::<zonecoach::CoachError>() {
            log_error("Session aborted", coach);
        }
    }
    service.shutdown().await;
    result
}

async fn drive(service: &CoachService, plan: TrainingPlan, schedule: Option<String>) -> Result<()> {
    println!("{}", "Scanning for sensors...".cyan().bold());
    let devices = service.scan_devices().await?;
    let device = devices.first().context("No sensor found")?;
    println!(
        "  Found {} ({} dBm)",
        device.name.as_deref().unwrap_or(&device.id),
        device.rssi
    );
    service.connect_device(&device.id).await?;
    println!("{}", "✓ Connected".green());

    let restored = service.session_snapshot().await?;
    if restored.state == "in_progress" || restored.state == "paused" {
        println!(
            "{}",
            format!(
                "Resuming {} at phase {}",
                restored.plan_name.as_deref().unwrap_or("session"),
                restored.phase_index.map_or(0, |i| i + 1)
            )
            .yellow()
            .bold()
        );
        if restored.state == "paused" {
            service.resume_session().await?;
        }
    } else {
        if let Some(expression) = schedule {
            wait_for_schedule(service, &plan, &expression).await?;
        }
        print_plan(&plan);
        service.start_session(plan).await?;
    }

    let summary = follow(service).await?;
    print_summary(&summary);
    Ok(())
}

async fn wait_for_schedule(
    service: &CoachService,
    plan: &TrainingPlan,
    expression: &str,
) -> Result<()> {
    let id = service.schedule_session(plan.clone(), expression).await?;
    let next = service
        .scheduled_sessions()
        .await?
        .into_iter()
        .find(|s| s.id == id)
        .and_then(|s| s.next_fire);
    if let Some(next) = next {
        println!("{}", format!("Waiting for {} (next at {})", plan.name, next).cyan());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => bail!("Cancelled while waiting for the schedule"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let pending = service
            .scheduled_sessions()
            .await?
            .into_iter()
            .filter(|s| s.id == id)
            .any(|s| matches!(s.last_attempt, Some(a) if a.status == AttemptStatus::Pending));
        if pending {
            return Ok(());
        }
    }
}

/// Print progress until the session completes or the user interrupts
async fn follow(service: &CoachService) -> Result<SessionSummary> {
    let mut status = service.subscribe_connection_status();
    let mut progress = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "\nStopping...".yellow());
                return Ok(service.stop_session().await?);
            }
            Some(update) = status.recv() => {
                println!("{}", format!("  sensor: {:?}", update).dimmed());
            }
            _ = progress.tick() => {
                let snapshot = service.session_snapshot().await?;
                if snapshot.state == "completed" {
                    let summary = CheckpointStore::from_config(&service.config().storage)
                        .load_summary()?
                        .context("Session finished without a summary")?;
                    return Ok(summary);
                }
                print_progress(&snapshot);
            }
        }
    }
}

fn print_progress(snapshot: &SessionSnapshot) {
    let bpm = snapshot
        .current_bpm
        .map_or_else(|| "--".to_string(), |b| b.to_string());
    let zone = match (snapshot.current_zone, snapshot.target_zone) {
        (Some(current), Some(target)) if current == target => format!("{}", current).green(),
        (Some(current), Some(_)) => format!("{}", current).yellow(),
        _ => "no zone".normal(),
    };

    println!(
        "  [{}] {} {}/{} | {}s left | {} bpm | {}",
        snapshot.state,
        snapshot.phase_name.as_deref().unwrap_or("-"),
        snapshot.phase_index.map_or(0, |i| i + 1),
        snapshot.phase_count,
        snapshot.phase_remaining_secs.unwrap_or(0),
        bpm,
        zone
    );
}

fn print_plan(plan: &TrainingPlan) {
    use zonecoach::{TransitionCondition, ZoneCalculator};

    let rows: Vec<PhaseRow> = plan
        .phases
        .iter()
        .enumerate()
        .map(|(i, phase)| {
            let range = ZoneCalculator::bounds(phase.target_zone, plan.max_hr)
                .map(|(low, high)| format!("{}-{}", low, high))
                .unwrap_or_else(|_| "?".to_string());
            let ends = match &phase.transition {
                TransitionCondition::TimeElapsed => format_secs(phase.duration_secs),
                TransitionCondition::HeartRateReached {
                    target_bpm,
                    hold_secs,
                } => format!("≥{} bpm for {}s", target_bpm, hold_secs),
            };
            PhaseRow {
                index: i + 1,
                name: phase.name.clone(),
                zone: phase.target_zone.to_string(),
                range,
                ends,
            }
        })
        .collect();

    println!(
        "{}",
        format!(
            "{} ({}, max HR {})",
            plan.name,
            format_secs(plan.total_duration_secs() as u32),
            plan.max_hr
        )
        .bold()
    );
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn print_summary(summary: &SessionSummary) {
    let title = if summary.stopped_early {
        format!("Stopped {}", summary.plan_name).yellow().bold()
    } else {
        format!("✓ Completed {}", summary.plan_name).green().bold()
    };
    println!("\n{}", title);
    println!(
        "  Time: {}  Phases: {}  Avg: {}  Max: {}",
        format_secs(summary.total_elapsed_secs),
        summary.phases_completed,
        summary.avg_bpm.map_or_else(|| "--".to_string(), |b| format!("{} bpm", b)),
        summary.max_bpm.map_or_else(|| "--".to_string(), |b| format!("{} bpm", b)),
    );

    let mut rows = vec![ZoneRow {
        zone: "Below Zone 1".to_string(),
        time: format_secs(summary.time_below_zones),
    }];
    rows.extend(Zone::ALL.iter().map(|zone| ZoneRow {
        zone: zone.to_string(),
        time: format_secs(summary.time_in_zone[zone.index()]),
    }));
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn show_checkpoint(store: &CheckpointStore) -> Result<()> {
    match store.load()? {
        Some(checkpoint) => {
            println!("{}", "Checkpoint".bold());
            println!("  Plan:    {}", checkpoint.plan.name);
            println!("  State:   {}", checkpoint.state);
            println!(
                "  Phase:   {} of {}",
                checkpoint.phase_index + 1,
                checkpoint.plan.phases.len()
            );
            println!("  Elapsed: {}", format_secs(checkpoint.elapsed_secs));
            println!("  Written: {}", checkpoint.last_checkpoint);
        }
        None => println!("{}", "No checkpoint".dimmed()),
    }

    if let Some(summary) = store.load_summary()? {
        print_summary(&summary);
    }
    Ok(())
}

fn format_secs(secs: u32) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else {
        format!("{}m{:02}s", m, s)
    }
}
