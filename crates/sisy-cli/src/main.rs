use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use sisy_runner::cif::parse_report;
use sisy_runner::{
    run_batch, BatchReport, BenchmarkFile, BenchmarkSource, BridgeSession, JobContext,
    JobDisposition, JobSelection, MetricDistanceCalculator, Settings,
};

#[derive(Parser)]
#[command(name = "sisyphos", version = "0.3.0", about = "Crystal refinement benchmark runner")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one benchmark job or the whole batch through an engine bridge.
    Run {
        #[arg(long, env = "SISYPHOS_work_path")]
        work_path: PathBuf,
        #[arg(long, env = "SISYPHOS_base_path")]
        base_path: Option<PathBuf>,
        /// Job index; -1 or absent runs every job.
        #[arg(long, env = "SISYPHOS_job_idx", allow_negative_numbers = true)]
        job_idx: Option<i64>,
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        /// Bridge command, given after `--`.
        #[arg(last = true, required = true)]
        bridge: Vec<String>,
    },
    /// List benchmark jobs and whether they are done.
    Status {
        #[arg(long, env = "SISYPHOS_work_path")]
        work_path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Extract report statistics from a CIF file.
    ParseCif {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

/// Orchestration settings resolved from flags and the environment.
struct RunnerConfig {
    work_path: PathBuf,
    base_path: Option<PathBuf>,
    selection: JobSelection,
    settings: Settings,
    bridge: Vec<String>,
}

impl RunnerConfig {
    fn check_base_path(&self) {
        let Some(base) = &self.base_path else {
            return;
        };
        let data_dir = self.work_path.parent().unwrap_or(Path::new("."));
        if base != data_dir {
            warn!(
                base_path = %base.display(),
                data_dir = %data_dir.display(),
                "base path differs from the data directory next to the work path; inputs are read from the latter"
            );
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else {
        let default_level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {}", e))
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            work_path,
            base_path,
            job_idx,
            settings,
            json,
            bridge,
        } => {
            let config = RunnerConfig {
                work_path,
                base_path,
                selection: JobSelection::from_index(job_idx),
                settings: match settings {
                    Some(path) => Settings::load(&path)?,
                    None => Settings::default(),
                },
                bridge,
            };
            let report = run(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_report(&report);
            Ok(None)
        }
        Commands::Status { work_path, json } => {
            let bench = BenchmarkFile::open(&work_path)?;
            let jobs: Vec<Value> = (0..bench.len())
                .map(|i| {
                    json!({
                        "id": i,
                        "iam": bench.get(i).map(|j| j.is_iam()).unwrap_or(false),
                        "done": bench.is_finished(i),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "work_path": work_path,
                    "jobs": jobs,
                })));
            }
            for job in &jobs {
                println!(
                    "job_{}: {}{}",
                    job["id"],
                    if job["done"] == true { "done" } else { "pending" },
                    if job["iam"] == true { " (IAM)" } else { "" }
                );
            }
            Ok(None)
        }
        Commands::ParseCif { file, json } => {
            let outcome = parse_report(&file)?;
            let failures: Vec<String> = [outcome.fields.failure(), outcome.displacements.failure()]
                .into_iter()
                .flatten()
                .map(str::to_string)
                .collect();
            for reason in &failures {
                warn!(file = %file.display(), "{}", reason);
            }
            let stats = outcome.into_stats();
            if json {
                let fields: Map<String, Value> = stats
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();
                let atoms: Map<String, Value> = stats
                    .displacements
                    .iter()
                    .map(|(k, d)| (k.clone(), json!({ "value": d.value, "esd": d.esd })))
                    .collect();
                return Ok(Some(json!({
                    "ok": failures.is_empty(),
                    "command": "parse-cif",
                    "fields": fields,
                    "displacements": atoms,
                    "failures": failures,
                })));
            }
            for (key, value) in &stats.fields {
                println!("{}: {}", key, value);
            }
            for (key, d) in &stats.displacements {
                println!("{}: {}({})", key, d.value, d.esd);
            }
            Ok(None)
        }
    }
}

fn run(config: &RunnerConfig) -> Result<BatchReport> {
    config.check_base_path();
    let bench = BenchmarkFile::open(&config.work_path)?;
    info!(jobs = bench.len(), "loaded benchmark");
    let (mut engine, mut library) = BridgeSession::spawn(&config.bridge)?.split();
    let mut ctx = JobContext {
        engine: &mut engine,
        library: &mut library,
        calculator: &MetricDistanceCalculator,
        settings: &config.settings,
    };
    run_batch(&config.work_path, &bench, config.selection, &mut ctx)
}

fn print_report(report: &BatchReport) {
    for job in &report.jobs {
        let status = match &job.disposition {
            JobDisposition::Skipped => "skipped (done marker present)".to_string(),
            JobDisposition::SetupFailed { reason } => format!("setup failed: {}", reason),
            JobDisposition::Done => "done".to_string(),
            JobDisposition::NotDone => "not done".to_string(),
        };
        println!("job_{}: {}", job.id, status);
    }
    let elapsed = report.finished_at - report.started_at;
    println!(
        "done: {}/{} in {}s",
        report.count(|d| *d == JobDisposition::Done),
        report.jobs.len(),
        elapsed.num_seconds()
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json, .. }
        | Commands::ParseCif { json, .. } => *json,
    }
}
