use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regress_core::{atomic_write_json_pretty, ensure_dir, shell_join};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{RegressConfig, Slice};
use crate::coverage::{aggregate, AggregatedReport, CoverageTool, ReportKind};
use crate::dispatch::{
    dispatch_all, dispatched_jobs, load_dispatch_record, runner_command, scheduler_for,
    write_dispatch_record, JobRequest, Scheduler, SubmissionRecord,
};
use crate::error::{status_label, RegressError, RegressResult};
use crate::fixture::{fixture_dir_name, prepare_all, PreparationFailure};
use crate::markers::{count_completed, read_outcomes, JobOutcome, MarkerSource};
use crate::poll::{Pacer, PollOutcome, PollProgress, Poller, Threshold, PARTIAL_SLACK};
use crate::stages::{plan_stages, CommandRunner};

pub const RUN_CONTROL_FILE: &str = "run_control.json";
pub const RESOLVED_CONFIG_FILE: &str = "resolved_config.json";

/// The collaborators a run talks to. Production wiring lives in the CLI.
pub struct RunServices<'a> {
    pub scheduler: &'a dyn Scheduler,
    pub markers: &'a dyn MarkerSource,
    pub coverage: &'a dyn CoverageTool,
    /// Executes the supplementary local instrumented run.
    pub local: &'a dyn CommandRunner,
    pub pacer: &'a mut dyn Pacer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The pacer ended the wait before `waiting_for` was reached.
    Interrupted {
        waiting_for: String,
        done: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalRunRecord {
    pub command: String,
    pub exit_status: String,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_root: PathBuf,
    pub preparation_failures: Vec<PreparationFailure>,
    pub submissions: Vec<SubmissionRecord>,
    pub jobs: usize,
    pub local_run: Option<LocalRunRecord>,
    pub partial: Option<AggregatedReport>,
    #[serde(rename = "final")]
    pub final_report: Option<AggregatedReport>,
    pub status: RunStatus,
}

impl RunSummary {
    /// Whether the orchestrator should exit zero. Failed jobs do not count;
    /// a fixture that could not be prepared does.
    pub fn is_success(&self) -> bool {
        self.preparation_failures.is_empty()
            && self.status == RunStatus::Completed
            && self.final_report.is_some()
    }
}

fn write_run_control(
    run_root: &Path,
    phase: &str,
    progress: Option<&PollProgress>,
) -> RegressResult<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "status": phase,
        "progress": progress.map(|p| json!({
            "at": p.at.to_rfc3339(),
            "cycle": p.cycle,
            "done": p.done,
            "total": p.total,
            "waiting_for": p.threshold.as_str(),
        })),
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_root.join(RUN_CONTROL_FILE), &payload)?;
    Ok(())
}

/// Marks the run `failed` on drop unless `complete` recorded a final phase.
struct RunControlGuard {
    run_root: PathBuf,
    done: bool,
}

impl RunControlGuard {
    fn new(run_root: &Path) -> Self {
        Self {
            run_root: run_root.to_path_buf(),
            done: false,
        }
    }

    fn phase(&self, phase: &str) -> RegressResult<()> {
        write_run_control(&self.run_root, phase, None)
    }

    fn complete(&mut self, phase: &str) -> RegressResult<()> {
        write_run_control(&self.run_root, phase, None)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_control(&self.run_root, "failed", None);
        }
    }
}

/// Prepare, dispatch, run the local supplementary run, then wait for the
/// partial and final thresholds, aggregating at each.
pub fn run_regression(config: &RegressConfig, services: RunServices<'_>) -> RegressResult<RunSummary> {
    let run_root = config.run_root.clone();
    ensure_dir(&run_root)?;
    let mut guard = RunControlGuard::new(&run_root);
    guard.phase("preparing")?;
    atomic_write_json_pretty(
        &run_root.join(RESOLVED_CONFIG_FILE),
        &serde_json::to_value(config)?,
    )?;

    let preparation = prepare_all(config)?;
    if preparation.prepared.is_empty() {
        return Err(RegressError::Config(format!(
            "no fixture could be prepared ({} failed)",
            preparation.failures.len()
        )));
    }

    guard.phase("dispatching")?;
    let submissions = dispatch_all(&preparation.prepared, services.scheduler, &|fixture| {
        runner_command(config, &fixture.workdir)
    });
    write_dispatch_record(&run_root, &submissions)?;
    let jobs = dispatched_jobs(&submissions);
    if jobs.is_empty() {
        return Err(RegressError::Dispatch {
            fixture: "*".to_string(),
            reason: "the scheduler accepted no submissions".to_string(),
        });
    }
    info!(jobs = jobs.len(), rejected = submissions.len() - jobs.len(), "dispatch finished");

    let local_run = match config.coverage.local_run.as_deref() {
        Some(argv) => {
            guard.phase("local_run")?;
            Some(run_local(argv, &run_root, services.local))
        }
        None => None,
    };

    let mut summary = RunSummary {
        run_root,
        preparation_failures: preparation.failures,
        submissions,
        jobs: jobs.len(),
        local_run,
        partial: None,
        final_report: None,
        status: RunStatus::Completed,
    };
    wait_and_aggregate(config, services, &jobs, &mut guard, &mut summary)?;
    Ok(summary)
}

/// Picks a run back up after the orchestrator was killed: reloads the
/// dispatch record and rescans markers from scratch.
pub fn resume_wait(config: &RegressConfig, services: RunServices<'_>) -> RegressResult<RunSummary> {
    let run_root = config.run_root.clone();
    let submissions = load_dispatch_record(&run_root)?;
    let jobs = dispatched_jobs(&submissions);
    if jobs.is_empty() {
        return Err(RegressError::Dispatch {
            fixture: "*".to_string(),
            reason: "the dispatch record lists no accepted submissions".to_string(),
        });
    }
    info!(jobs = jobs.len(), run_root = %run_root.display(), "resuming wait");
    let mut guard = RunControlGuard::new(&run_root);
    let mut summary = RunSummary {
        run_root,
        preparation_failures: Vec::new(),
        submissions,
        jobs: jobs.len(),
        local_run: None,
        partial: None,
        final_report: None,
        status: RunStatus::Completed,
    };
    wait_and_aggregate(config, services, &jobs, &mut guard, &mut summary)?;
    Ok(summary)
}

fn run_local(argv: &[String], run_root: &Path, runner: &dyn CommandRunner) -> LocalRunRecord {
    let command = shell_join(argv);
    info!(cwd = %run_root.display(), "+ {}", command);
    let (exit_status, succeeded) = match runner.run(argv, run_root) {
        Ok(code) => (status_label(code), code == Some(0)),
        Err(err) => {
            error!(error = %err, "local run could not start");
            ("spawn_error".to_string(), false)
        }
    };
    if succeeded {
        info!(exit_status = %exit_status, "local run finished");
    } else {
        warn!(exit_status = %exit_status, "local run failed; continuing with job coverage only");
    }
    LocalRunRecord {
        command,
        exit_status,
        succeeded,
    }
}

fn wait_and_aggregate(
    config: &RegressConfig,
    mut services: RunServices<'_>,
    jobs: &BTreeSet<String>,
    guard: &mut RunControlGuard,
    summary: &mut RunSummary,
) -> RegressResult<()> {
    let run_root = summary.run_root.clone();
    let mut poller = Poller::new(services.markers, jobs.clone(), config.poll_interval());
    let phases = [
        (Threshold::Partial, ReportKind::Partial, "waiting_partial"),
        (Threshold::Final, ReportKind::Final, "waiting_final"),
    ];
    for (threshold, kind, phase) in phases {
        guard.phase(phase)?;
        let outcome = poller.wait_for(threshold, &mut *services.pacer, &mut |progress| {
            if let Err(err) = write_run_control(&run_root, phase, Some(progress)) {
                warn!(error = %err, "could not update run control");
            }
        })?;
        if let PollOutcome::Interrupted { done, total, .. } = outcome {
            warn!(waiting_for = threshold.as_str(), done, total, "wait interrupted");
            summary.status = RunStatus::Interrupted {
                waiting_for: threshold.as_str().to_string(),
                done,
                total,
            };
            guard.complete("interrupted")?;
            return Ok(());
        }

        guard.phase(&format!("aggregating_{}", kind.as_str()))?;
        let outcomes = read_outcomes(&run_root, &config.marker_name, jobs);
        let report = aggregate(&run_root, &config.coverage, services.coverage, kind, &outcomes)?;
        match kind {
            ReportKind::Partial => summary.partial = Some(report),
            ReportKind::Final => summary.final_report = Some(report),
        }
    }
    summary.status = RunStatus::Completed;
    guard.complete("completed")?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub corpus: String,
    pub slice: Slice,
    pub workdir: PathBuf,
    pub dataset: Option<PathBuf>,
    pub dataset_error: Option<String>,
    pub stages: Vec<String>,
    pub submission: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDescription {
    pub run_root: PathBuf,
    pub scheduler: &'static str,
    pub marker_name: String,
    pub poll_interval_seconds: u64,
    /// Completed jobs needed before the partial report is produced.
    pub partial_after: usize,
    pub local_run: Option<String>,
    pub jobs: Vec<PlannedJob>,
}

/// What a run would do, without touching the run root or the scheduler.
pub fn describe_run(config: &RegressConfig) -> RegressResult<RunDescription> {
    let scheduler = scheduler_for(&config.scheduler);
    let mut jobs = Vec::new();
    for corpus in &config.corpora {
        let (dataset, dataset_error) = match corpus.dataset_root() {
            Ok(path) => (Some(path), None),
            Err(err) => (None, Some(err.to_string())),
        };
        for slice in &corpus.slices {
            let name = fixture_dir_name(&corpus.id, *slice);
            let workdir = config.run_root.join(&name);
            let stages = plan_stages(&config.pipeline, &workdir, &corpus.id, *slice)
                .iter()
                .map(|c| c.command_line())
                .collect();
            let request = JobRequest {
                name: name.clone(),
                command: runner_command(config, &workdir)?,
                workdir: workdir.clone(),
            };
            jobs.push(PlannedJob {
                name,
                corpus: corpus.id.clone(),
                slice: *slice,
                workdir,
                dataset: dataset.clone(),
                dataset_error: dataset_error.clone(),
                stages,
                submission: shell_join(&scheduler.submission_argv(&request)),
            });
        }
    }
    Ok(RunDescription {
        run_root: config.run_root.clone(),
        scheduler: config.scheduler.kind.as_str(),
        marker_name: config.marker_name.clone(),
        poll_interval_seconds: config.poll.interval_seconds,
        partial_after: jobs.len().saturating_sub(PARTIAL_SLACK),
        local_run: config.coverage.local_run.as_deref().map(shell_join),
        jobs,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: String,
    pub job_id: Option<String>,
    pub done: bool,
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub at: String,
    pub done: usize,
    pub total: usize,
    pub partial_reached: bool,
    pub final_reached: bool,
    pub jobs: Vec<JobStatus>,
}

/// One marker scan over the dispatched jobs of a run.
pub fn run_status(config: &RegressConfig, markers: &dyn MarkerSource) -> RegressResult<StatusReport> {
    let submissions = load_dispatch_record(&config.run_root)?;
    let jobs = dispatched_jobs(&submissions);
    let found = markers.enumerate()?;
    let finished: BTreeSet<&str> = found
        .iter()
        .filter(|m| jobs.contains(&m.job))
        .map(|m| m.job.as_str())
        .collect();
    let done = count_completed(&found, &jobs);
    let mut outcomes = read_outcomes(&config.run_root, &config.marker_name, &jobs);
    let statuses = submissions
        .iter()
        .filter(|s| s.accepted())
        .map(|s| JobStatus {
            job: s.fixture.clone(),
            job_id: s.job_id.clone(),
            done: finished.contains(s.fixture.as_str()),
            outcome: outcomes.remove(&s.fixture).flatten(),
        })
        .collect();
    Ok(StatusReport {
        at: Utc::now().to_rfc3339(),
        done,
        total: jobs.len(),
        partial_reached: Threshold::Partial.reached(done, jobs.len()),
        final_reached: Threshold::Final.reached(done, jobs.len()),
        jobs: statuses,
    })
}
