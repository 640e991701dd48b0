use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use regress_runner::config::RegressConfig;
use regress_runner::coverage::ReportKind;
use regress_runner::dispatch::{
    dispatch_all, dispatched_jobs, runner_command, scheduler_for, write_dispatch_record,
    SubmissionRecord,
};
use regress_runner::fixture::{discover_fixtures, prepare_all, PreparationReport};
use regress_runner::markers::read_outcomes;
use regress_runner::orchestrate::{describe_run, run_status, RunDescription, StatusReport};
use regress_runner::stages::write_abort_marker;
use regress_runner::{
    load_config, normalize_text_report, CoverageCli, FsMarkerSource, ProcessRunner, RunServices,
    RunStatus, RunSummary, SleepPacer, CONFIG_TEMPLATE, DEFAULT_MARKER_NAME,
};
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};

mod logging;

#[derive(Parser)]
#[command(name = "regress", version = "0.3.0", about = "Coverage regression orchestrator")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    #[value(name = "partial")]
    Partial,
    #[value(name = "final")]
    Final,
}

impl From<KindArg> for ReportKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Partial => ReportKind::Partial,
            KindArg::Final => ReportKind::Final,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare, dispatch, wait and aggregate in one go.
    Run {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Prepare {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Submit one job per prepared fixture under the run root.
    Dispatch {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Execute the stage pipeline of one fixture (what a dispatched job runs).
    RunJob {
        #[arg(long)]
        workdir: PathBuf,
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
    },
    /// Resume polling a dispatched run and aggregate at both thresholds.
    Wait {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Aggregate {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long, value_enum, default_value = "final")]
        kind: KindArg,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a coverage text report on stdin to package-relative paths.
    FormatReport {
        #[arg(long, default_value = "everyvoice")]
        package: String,
    },
    Describe {
        #[arg(long, default_value = "regress.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long, default_value = "regress.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<regress_runner::RegressError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let config = load_config(&config)?;
            let summary = with_services(&config, regress_runner::run_regression)?;
            if json {
                return Ok(Some(json!({
                    "ok": summary.is_success(),
                    "command": "run",
                    "run": summary,
                })));
            }
            print_run_summary(&summary);
            if !summary.is_success() {
                return Err(anyhow!(
                    "run did not finish cleanly ({} fixture(s) failed to prepare, status: {})",
                    summary.preparation_failures.len(),
                    status_text(&summary.status)
                ));
            }
        }
        Commands::Prepare { config, json } => {
            let config = load_config(&config)?;
            let report = prepare_all(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.is_clean(),
                    "command": "prepare",
                    "prepared": report.prepared,
                    "failures": report.failures,
                })));
            }
            print_preparation(&report);
            if !report.is_clean() {
                return Err(anyhow!(
                    "{} fixture(s) failed to prepare",
                    report.failures.len()
                ));
            }
        }
        Commands::Dispatch { config, json } => {
            let config = load_config(&config)?;
            let fixtures = discover_fixtures(&config.run_root)?;
            if fixtures.is_empty() {
                return Err(anyhow!(
                    "no prepared fixtures under {} (run `regress prepare` first)",
                    config.run_root.display()
                ));
            }
            let scheduler = scheduler_for(&config.scheduler);
            let records = dispatch_all(&fixtures, scheduler.as_ref(), &|fixture| {
                runner_command(&config, &fixture.workdir)
            });
            write_dispatch_record(&config.run_root, &records)?;
            let accepted = dispatched_jobs(&records).len();
            if json {
                return Ok(Some(json!({
                    "ok": accepted > 0,
                    "command": "dispatch",
                    "submissions": records,
                })));
            }
            print_submissions(&records);
            if accepted == 0 {
                return Err(anyhow!("the scheduler accepted no submissions"));
            }
        }
        Commands::RunJob { workdir, config } => {
            let config = match load_config(&config) {
                Ok(config) => config,
                Err(err) => {
                    write_abort_marker(&workdir, DEFAULT_MARKER_NAME, &err.to_string());
                    return Err(err.into());
                }
            };
            let report = regress_runner::run_job(&workdir, &config, &ProcessRunner)?;
            println!("job: {}", workdir.display());
            println!("stages_run: {}", report.records.len());
            println!("marker: {}", report.marker.display());
        }
        Commands::Wait { config, json } => {
            let config = load_config(&config)?;
            let summary = with_services(&config, regress_runner::resume_wait)?;
            if json {
                return Ok(Some(json!({
                    "ok": summary.is_success(),
                    "command": "wait",
                    "run": summary,
                })));
            }
            print_run_summary(&summary);
        }
        Commands::Status { config, json } => {
            let config = load_config(&config)?;
            let markers = FsMarkerSource::new(&config.run_root, &config.marker_name);
            let report = run_status(&config, &markers)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": report,
                })));
            }
            print_status(&report);
        }
        Commands::Aggregate { config, kind, json } => {
            let config = load_config(&config)?;
            let jobs = match regress_runner::dispatch::load_dispatch_record(&config.run_root) {
                Ok(records) => dispatched_jobs(&records),
                Err(_) => Default::default(),
            };
            let outcomes = read_outcomes(&config.run_root, &config.marker_name, &jobs);
            let tool = CoverageCli::new(&config.coverage.tool, &config.run_root);
            let report = regress_runner::aggregate(
                &config.run_root,
                &config.coverage,
                &tool,
                kind.into(),
                &outcomes,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "report": report,
                })));
            }
            println!("kind: {}", report.kind.as_str());
            println!("fragments: {}", report.fragments);
            println!("text_report: {}", report.text_report.display());
            println!("text_sha256: {}", report.text_sha256);
        }
        Commands::FormatReport { package } => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            print!("{}", normalize_text_report(&raw, &package));
        }
        Commands::Describe { config, json } => {
            let config = load_config(&config)?;
            let description = describe_run(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "description": description,
                })));
            }
            print_description(&description);
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "config already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: fill in the fields marked REQUIRED");
            println!("next: regress describe --config {}", path.display());
        }
    }
    Ok(None)
}

/// Wires the production collaborators around `f`.
fn with_services<T>(
    config: &RegressConfig,
    f: impl FnOnce(&RegressConfig, RunServices<'_>) -> regress_runner::RegressResult<T>,
) -> Result<T> {
    let scheduler = scheduler_for(&config.scheduler);
    let markers = FsMarkerSource::new(&config.run_root, &config.marker_name);
    let coverage = CoverageCli::new(&config.coverage.tool, &config.run_root);
    let mut pacer = SleepPacer;
    let services = RunServices {
        scheduler: scheduler.as_ref(),
        markers: &markers,
        coverage: &coverage,
        local: &ProcessRunner,
        pacer: &mut pacer,
    };
    Ok(f(config, services)?)
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
        | Commands::Prepare { json, .. }
        | Commands::Dispatch { json, .. }
        | Commands::Wait { json, .. }
        | Commands::Status { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn status_text(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed => "completed".to_string(),
        RunStatus::Interrupted {
            waiting_for,
            done,
            total,
        } => format!("interrupted waiting for {} ({}/{})", waiting_for, done, total),
    }
}

fn show(path: &Path) -> String {
    path.display().to_string()
}

fn print_preparation(report: &PreparationReport) {
    for fixture in &report.prepared {
        println!(
            "prepared: {} ({} records) {}",
            fixture.name(),
            fixture.records,
            show(&fixture.workdir)
        );
    }
    for failure in &report.failures {
        println!(
            "failed: {}/{} [{}] {}",
            failure.corpus, failure.slice, failure.code, failure.message
        );
    }
}

fn print_submissions(records: &[SubmissionRecord]) {
    for record in records {
        match (&record.job_id, &record.error) {
            (Some(id), _) => println!("submitted: {} job_id={}", record.fixture, id),
            (None, Some(err)) => println!("rejected: {} {}", record.fixture, err),
            (None, None) => println!("rejected: {}", record.fixture),
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("run_root: {}", show(&summary.run_root));
    for failure in &summary.preparation_failures {
        println!(
            "preparation_failed: {}/{} [{}] {}",
            failure.corpus, failure.slice, failure.code, failure.message
        );
    }
    print_submissions(&summary.submissions);
    println!("jobs: {}", summary.jobs);
    if let Some(local) = &summary.local_run {
        println!("local_run: {} (exit {})", local.command, local.exit_status);
    }
    if let Some(report) = &summary.partial {
        println!("partial_report: {}", show(&report.text_report));
    }
    if let Some(report) = &summary.final_report {
        println!("final_report: {}", show(&report.text_report));
    }
    println!("status: {}", status_text(&summary.status));
}

fn print_status(report: &StatusReport) {
    println!("{} {}/{} jobs done", report.at, report.done, report.total);
    for job in &report.jobs {
        let state = match (&job.outcome, job.done) {
            (Some(outcome), _) => serde_json::to_value(outcome)
                .ok()
                .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_else(|| "done".to_string()),
            (None, true) => "done".to_string(),
            (None, false) => "pending".to_string(),
        };
        println!(
            "  {} [{}] {}",
            job.job,
            job.job_id.as_deref().unwrap_or("-"),
            state
        );
    }
    println!("partial_reached: {}", report.partial_reached);
    println!("final_reached: {}", report.final_reached);
}

fn print_description(description: &RunDescription) {
    println!("run_root: {}", show(&description.run_root));
    println!("scheduler: {}", description.scheduler);
    println!("marker: {}", description.marker_name);
    println!("poll_interval_seconds: {}", description.poll_interval_seconds);
    println!("jobs: {}", description.jobs.len());
    println!("partial_after: {}", description.partial_after);
    if let Some(local) = &description.local_run {
        println!("local_run: {}", local);
    }
    for job in &description.jobs {
        println!("job: {}", job.name);
        match (&job.dataset, &job.dataset_error) {
            (Some(path), _) => println!("  dataset: {}", show(path)),
            (None, Some(err)) => println!("  dataset: unresolved ({})", err),
            (None, None) => {}
        }
        for stage in &job.stages {
            println!("  stage: {}", stage);
        }
        println!("  submit: {}", job.submission);
    }
}
