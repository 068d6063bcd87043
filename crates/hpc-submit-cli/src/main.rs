//! hpc-submit CLI - batch job submission to a remote HPC platform.

use clap::{Parser, Subcommand};
use hpc_submit::remote::DryRunPlatform;
use hpc_submit::{
    Config, Event, EventBus, JobSpec, Outcome, PipelineEngine, ScanRequest, SecondaryPattern,
    SubmitError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "hpc-submit")]
#[command(about = "Batch job submission and transfer orchestration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress events to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory tree and report job matches
    Scan {
        /// Root directory to scan
        root: PathBuf,

        /// Primary glob pattern, relative to the root
        primary: String,

        /// Required secondary patterns (missing file skips the match)
        #[arg(long = "require")]
        required: Vec<String>,

        /// Optional secondary patterns (missing file only warns)
        #[arg(long = "optional")]
        optional: Vec<String>,
    },

    /// Scan and run the full submission pipeline
    Run {
        /// Job template file (YAML JobSpec)
        #[arg(long)]
        template: PathBuf,

        /// Root directory to scan
        root: PathBuf,

        /// Primary glob pattern, relative to the root
        primary: String,

        /// Required secondary patterns
        #[arg(long = "require")]
        required: Vec<String>,

        /// Optional secondary patterns
        #[arg(long = "optional")]
        optional: Vec<String>,

        /// Simulate the platform locally: no network, synthetic job ids
        #[arg(long)]
        dry_run: bool,
    },

    /// Report progress recorded in a previous run's state file
    Resume,

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit codes: 0 ok, 1 failed jobs, 2 config/scan errors, 130 cancelled.
fn exit_code(error: &SubmitError) -> u8 {
    match error {
        SubmitError::Cancelled => 130,
        _ => 2,
    }
}

async fn run() -> Result<ExitCode, SubmitError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Scan {
            root,
            primary,
            required,
            optional,
        } => {
            let request = scan_request(root, primary, &required, &optional);
            let outcome = hpc_submit::scanner::scan(&request)?;

            if cli.output_json {
                let summary = serde_json::json!({
                    "files_found": outcome.files_found,
                    "matched": outcome.matched(),
                    "skipped": outcome.skipped.iter().map(|s| &s.reason).collect::<Vec<_>>(),
                    "warnings": outcome.warnings,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Found {} primary files: {} matched, {} skipped",
                    outcome.files_found,
                    outcome.matched(),
                    outcome.skipped.len()
                );
                for m in &outcome.matches {
                    println!("  {} ({} files)", m.primary_path.display(), m.input_files.len());
                }
                for s in &outcome.skipped {
                    println!("  skipped: {}", s.reason);
                }
                for w in &outcome.warnings {
                    println!("  warning: {}", w);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            template,
            root,
            primary,
            required,
            optional,
            dry_run,
        } => {
            if !dry_run {
                return Err(SubmitError::Config(
                    "no remote client is configured in this build; pass --dry-run \
                     or drive the pipeline through the library with a PlatformApi"
                        .into(),
                ));
            }

            let template_yaml = std::fs::read_to_string(&template)?;
            let template: JobSpec = serde_yaml::from_str(&template_yaml)?;

            let bus = Arc::new(EventBus::new());
            if cli.progress {
                spawn_progress_printer(&bus);
            }

            let engine = PipelineEngine::new(
                Arc::new(DryRunPlatform::new()),
                config,
                bus.clone(),
            );

            let request = scan_request(root, primary, &required, &optional);
            let (specs, outcome) = engine.scan_to_specs(&template, request).await?;
            info!(
                "scan: {} matched, {} skipped",
                outcome.matched(),
                outcome.skipped.len()
            );

            let run_id = new_run_id();
            let state_file = cli
                .state_file
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{}.state", run_id)));

            let ctx = engine.start_run(&run_id, state_file, specs.len())?;
            wire_signals(ctx.cancel_token());

            let result = engine.run_from_specs(specs).await?;
            engine.end_run();

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nRun {}: {:?}", result.run_id, result.outcome);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Jobs: {} completed, {} failed, {} cancelled, {} pending",
                    result.stats.completed,
                    result.stats.failed,
                    result.stats.cancelled,
                    result.stats.pending
                );
                if !result.failed_jobs.is_empty() {
                    println!("  Failed jobs: {:?}", result.failed_jobs);
                }
            }

            Ok(match result.outcome {
                Outcome::Completed => ExitCode::SUCCESS,
                Outcome::Failed => ExitCode::from(1),
                Outcome::Cancelled => ExitCode::from(130),
            })
        }

        Commands::Resume => {
            let state_file = cli.state_file.ok_or_else(|| {
                SubmitError::Config("--state-file is required for resume".to_string())
            })?;
            if !state_file.exists() {
                return Err(SubmitError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }

            let history = PipelineEngine::load_history(&state_file)?;
            history.validate_config(&config.hash())?;
            let stats = history.stats();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                if let Some(header) = &history.header {
                    println!("Run {} started {}", header.run_id, header.started_at);
                }
                println!(
                    "  Jobs: {} total, {} completed, {} failed, {} cancelled, {} pending",
                    stats.total, stats.completed, stats.failed, stats.cancelled, stats.pending
                );
                if history.malformed_rows > 0 {
                    println!("  ({} malformed rows skipped)", history.malformed_rows);
                }
                for job in &history.jobs {
                    println!(
                        "  [{}] {} tar={:?} upload={:?} submit={:?}{}",
                        job.index,
                        job.name,
                        job.tar_status,
                        job.upload_status,
                        job.submit_status,
                        job.error
                            .as_deref()
                            .map(|e| format!(" error: {}", e))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate => {
            println!("Configuration OK (hash {})", &config.hash()[..12]);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn scan_request(
    root: PathBuf,
    primary: String,
    required: &[String],
    optional: &[String],
) -> ScanRequest {
    let mut secondary: Vec<SecondaryPattern> = required
        .iter()
        .map(SecondaryPattern::required)
        .collect();
    secondary.extend(optional.iter().map(SecondaryPattern::optional));
    ScanRequest {
        root,
        primary,
        secondary,
        ..Default::default()
    }
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn spawn_progress_printer(bus: &Arc<EventBus>) {
    let mut sub = bus.subscribe_all();
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match event {
                Event::Progress { key, fraction, .. } => {
                    eprintln!("progress {} {:.0}%", key, fraction * 100.0);
                }
                Event::StateChange { job, stage, status, .. } => {
                    eprintln!("{}: {} -> {:?}", job, stage, status);
                }
                Event::Error { source, message, .. } => {
                    eprintln!("error [{}]: {}", source, message);
                }
                Event::Complete { run_id, outcome, .. } => {
                    eprintln!("run {} finished: {:?}", run_id, outcome);
                }
                _ => {}
            }
        }
    });
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// SIGINT/SIGTERM cancel the run token; work stops at the next
/// checkpoint.
#[cfg(unix)]
fn wire_signals(cancel: CancellationToken) {
    let token_int = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping at the next checkpoint...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping at the next checkpoint...");
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn wire_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Stopping at the next checkpoint...");
        cancel.cancel();
    });
}
