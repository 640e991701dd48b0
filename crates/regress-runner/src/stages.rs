use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use regress_core::shell_join;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{expand_placeholders, PipelineConfig, RegressConfig, Slice, StageConfig};
use crate::error::{status_label, RegressError, RegressResult};
use crate::fixture::{load_fixture, Fixture};
use crate::markers::{write_marker, JobOutcome};

pub const STAGE_LOG: &str = "stages.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Init,
    Preprocess,
    TrainPrimary,
    TrainSecondary,
    Synthesize,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Init,
        Stage::Preprocess,
        Stage::TrainPrimary,
        Stage::TrainSecondary,
        Stage::Synthesize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Preprocess => "preprocess",
            Stage::TrainPrimary => "train-primary",
            Stage::TrainSecondary => "train-secondary",
            Stage::Synthesize => "synthesize",
        }
    }

    fn config(self, pipeline: &PipelineConfig) -> &StageConfig {
        let stages = &pipeline.stages;
        match self {
            Stage::Init => &stages.init,
            Stage::Preprocess => &stages.preprocess,
            Stage::TrainPrimary => &stages.train_primary,
            Stage::TrainSecondary => &stages.train_secondary,
            Stage::Synthesize => &stages.synthesize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub stage: Stage,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
}

impl StageCommand {
    pub fn command_line(&self) -> String {
        shell_join(&self.argv)
    }
}

/// Runs one external command to completion. `Ok(None)` means the process
/// was terminated by a signal.
pub trait CommandRunner {
    fn run(&self, argv: &[String], cwd: &Path) -> std::io::Result<Option<i32>>;
}

/// Spawns real processes with inherited stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, argv: &[String], cwd: &Path) -> std::io::Result<Option<i32>> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;
        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .status()?;
        Ok(status.code())
    }
}

/// Builds the fixed five-stage plan for one fixture.
pub fn build_stage_plan(pipeline: &PipelineConfig, fixture: &Fixture) -> Vec<StageCommand> {
    plan_stages(pipeline, &fixture.workdir, &fixture.corpus, fixture.slice)
}

/// The stage plan for a fixture directory that may not exist yet.
pub fn plan_stages(
    pipeline: &PipelineConfig,
    workdir: &Path,
    corpus: &str,
    slice: Slice,
) -> Vec<StageCommand> {
    let workdir_str = workdir.to_string_lossy().to_string();
    let slice = slice.label();
    let vars = [
        ("workdir", workdir_str.as_str()),
        ("corpus", corpus),
        ("slice", slice.as_str()),
    ];
    Stage::ORDER
        .iter()
        .map(|stage| {
            let config = stage.config(pipeline);
            let argv = pipeline
                .launcher
                .iter()
                .chain(config.args.iter())
                .map(|part| expand_placeholders(part, &vars))
                .collect();
            let cwd = match config.cwd.as_deref() {
                Some(rel) => workdir.join(expand_placeholders(rel, &vars)),
                None => workdir.to_path_buf(),
            };
            StageCommand {
                stage: *stage,
                argv,
                cwd,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub command: String,
    pub cwd: String,
    pub exit_status: String,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub records: Vec<StageRecord>,
    pub outcome: JobOutcome,
    pub marker: PathBuf,
}

impl PipelineReport {
    /// Maps a failed stage to `StageFailure` so the runner process exits non-zero.
    pub fn into_result(self) -> RegressResult<PipelineReport> {
        match &self.outcome {
            JobOutcome::Succeeded => Ok(self),
            JobOutcome::StageFailed { stage, exit_status } => Err(RegressError::StageFailure {
                stage: stage.clone(),
                status: exit_status.clone(),
            }),
            JobOutcome::Aborted { reason } => Err(RegressError::StageFailure {
                stage: "runner".to_string(),
                status: reason.clone(),
            }),
        }
    }
}

/// Writes the completion marker when dropped unless `complete` already did,
/// so a runner that unwinds early still releases the poller.
struct MarkerGuard {
    workdir: PathBuf,
    marker_name: String,
    stages_run: usize,
    done: bool,
}

impl MarkerGuard {
    fn new(workdir: &Path, marker_name: &str) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            marker_name: marker_name.to_string(),
            stages_run: 0,
            done: false,
        }
    }

    fn complete(&mut self, outcome: &JobOutcome) -> RegressResult<PathBuf> {
        let path = write_marker(&self.workdir, &self.marker_name, outcome, self.stages_run)?;
        self.done = true;
        Ok(path)
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if !self.done {
            let outcome = JobOutcome::Aborted {
                reason: "runner exited before finishing the stage sequence".to_string(),
            };
            if let Err(err) =
                write_marker(&self.workdir, &self.marker_name, &outcome, self.stages_run)
            {
                error!(workdir = %self.workdir.display(), error = %err, "could not write completion marker");
            }
        }
    }
}

/// Runs `plan` in order, stopping at the first failing stage. Writing the
/// completion marker is always the last thing this does.
pub fn run_pipeline(
    workdir: &Path,
    plan: &[StageCommand],
    runner: &dyn CommandRunner,
    marker_name: &str,
) -> RegressResult<PipelineReport> {
    let mut guard = MarkerGuard::new(workdir, marker_name);
    let mut records = Vec::new();
    let mut outcome = JobOutcome::Succeeded;

    for command in plan {
        let line = command.command_line();
        info!(stage = command.stage.as_str(), cwd = %command.cwd.display(), "+ {}", line);
        let started_at = Utc::now().to_rfc3339();
        let (exit_status, succeeded, spawn_error) = match runner.run(&command.argv, &command.cwd) {
            Ok(code) => (status_label(code), code == Some(0), None),
            Err(err) => ("spawn_error".to_string(), false, Some(err.to_string())),
        };
        guard.stages_run += 1;
        let record = StageRecord {
            stage: command.stage,
            command: line,
            cwd: command.cwd.to_string_lossy().to_string(),
            exit_status: exit_status.clone(),
            succeeded,
            error: spawn_error,
            started_at,
            finished_at: Utc::now().to_rfc3339(),
        };
        append_stage_log(workdir, &record)?;
        records.push(record);

        if succeeded {
            info!(stage = command.stage.as_str(), exit_status = %exit_status, "stage finished");
        } else {
            error!(stage = command.stage.as_str(), exit_status = %exit_status, "stage failed; skipping remaining stages");
            outcome = JobOutcome::StageFailed {
                stage: command.stage.as_str().to_string(),
                exit_status,
            };
            break;
        }
    }

    let marker = guard.complete(&outcome)?;
    Ok(PipelineReport {
        records,
        outcome,
        marker,
    })
}

/// Entry point executed on the compute node for one job directory.
pub fn run_job(
    workdir: &Path,
    config: &RegressConfig,
    runner: &dyn CommandRunner,
) -> RegressResult<PipelineReport> {
    let fixture = match load_fixture(workdir) {
        Ok(fixture) => fixture,
        Err(err) => {
            write_abort_marker(workdir, &config.marker_name, &err.to_string());
            return Err(err);
        }
    };
    let plan = build_stage_plan(&config.pipeline, &fixture);
    info!(job = %fixture.name(), stages = plan.len(), "running pipeline");
    run_pipeline(workdir, &plan, runner, &config.marker_name)?.into_result()
}

/// Best-effort marker for runners that fail before any stage is planned.
pub fn write_abort_marker(workdir: &Path, marker_name: &str, reason: &str) {
    let outcome = JobOutcome::Aborted {
        reason: reason.to_string(),
    };
    if let Err(err) = write_marker(workdir, marker_name, &outcome, 0) {
        warn!(workdir = %workdir.display(), error = %err, "could not write abort marker");
    }
}

fn append_stage_log(workdir: &Path, record: &StageRecord) -> RegressResult<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(workdir.join(STAGE_LOG))?;
    file.write_all(&line)?;
    Ok(())
}

pub fn read_stage_log(workdir: &Path) -> RegressResult<Vec<StageRecord>> {
    let path = workdir.join(STAGE_LOG);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Slice;
    use crate::markers::read_marker;
    use regress_core::ensure_dir;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn temp_root(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "regress_stages_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    /// Exit codes per stage; unlisted stages exit 0.
    struct ScriptedRunner {
        exit_codes: BTreeMap<Stage, Option<i32>>,
        calls: RefCell<Vec<Vec<String>>>,
        plan: Vec<StageCommand>,
    }

    impl ScriptedRunner {
        fn new(plan: &[StageCommand]) -> Self {
            Self {
                exit_codes: BTreeMap::new(),
                calls: RefCell::new(Vec::new()),
                plan: plan.to_vec(),
            }
        }

        fn stage_of(&self, argv: &[String]) -> Stage {
            self.plan
                .iter()
                .find(|c| c.argv == argv)
                .map(|c| c.stage)
                .expect("argv from plan")
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, argv: &[String], _cwd: &Path) -> std::io::Result<Option<i32>> {
            self.calls.borrow_mut().push(argv.to_vec());
            let stage = self.stage_of(argv);
            Ok(self.exit_codes.get(&stage).copied().unwrap_or(Some(0)))
        }
    }

    fn fixture(workdir: &Path) -> Fixture {
        Fixture {
            corpus: "lj".to_string(),
            slice: Slice::Records(150),
            workdir: workdir.to_path_buf(),
            manifest: workdir.join("metadata.csv"),
            media_link: workdir.join("wavs"),
            records: 150,
            manifest_sha256: "sha256:00".to_string(),
            source_manifest: PathBuf::from("/data/lj/metadata.csv"),
            source_media: PathBuf::from("/data/lj/wavs"),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn plan_follows_fixed_stage_order_with_launcher_prefix() {
        let workdir = PathBuf::from("/runs/regress-lj-150");
        let plan = build_stage_plan(&PipelineConfig::default(), &fixture(&workdir));
        let stages: Vec<Stage> = plan.iter().map(|c| c.stage).collect();
        assert_eq!(stages, Stage::ORDER.to_vec());
        assert_eq!(
            plan[0].command_line(),
            "coverage run -p -m everyvoice new-project --resume-from /runs/regress-lj-150/wizard-answers.yaml"
        );
        assert_eq!(plan[0].cwd, workdir);
        assert_eq!(plan[1].cwd, workdir.join("regress"));
        assert!(plan[4]
            .argv
            .contains(&"/runs/regress-lj-150/filelist.txt".to_string()));
    }

    #[test]
    fn all_stages_succeed_and_marker_records_success() {
        let root = temp_root("ok");
        let plan = build_stage_plan(&PipelineConfig::default(), &fixture(&root));
        let runner = ScriptedRunner::new(&plan);
        let report = run_pipeline(&root, &plan, &runner, "DONE").expect("pipeline");
        assert_eq!(report.outcome, JobOutcome::Succeeded);
        assert_eq!(runner.calls.borrow().len(), 5);
        assert_eq!(read_stage_log(&root).expect("log").len(), 5);
        let payload = read_marker(&root.join("DONE")).expect("marker");
        assert!(payload.outcome.is_success());
        assert_eq!(payload.stages_run, 5);
        assert!(report.into_result().is_ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failing_train_secondary_skips_synthesize_but_writes_marker() {
        let root = temp_root("fail");
        let plan = build_stage_plan(&PipelineConfig::default(), &fixture(&root));
        let mut runner = ScriptedRunner::new(&plan);
        runner.exit_codes.insert(Stage::TrainSecondary, Some(1));

        let report = run_pipeline(&root, &plan, &runner, "DONE").expect("pipeline");
        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 4, "synthesize must not run");
        assert!(!calls.iter().any(|argv| argv.contains(&"synthesize".to_string())));

        let expected = JobOutcome::StageFailed {
            stage: "train-secondary".to_string(),
            exit_status: "1".to_string(),
        };
        assert_eq!(report.outcome, expected);
        let payload = read_marker(&root.join("DONE")).expect("marker written");
        assert_eq!(payload.outcome, expected);

        let log = read_stage_log(&root).expect("log");
        assert_eq!(log.last().map(|r| r.exit_status.as_str()), Some("1"));
        assert!(!log.last().expect("record").succeeded);

        let err = report.into_result().expect_err("non-zero exit");
        assert!(matches!(err, RegressError::StageFailure { ref stage, .. } if stage == "train-secondary"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn signal_and_spawn_errors_are_stage_failures() {
        struct Broken;
        impl CommandRunner for Broken {
            fn run(&self, _argv: &[String], _cwd: &Path) -> std::io::Result<Option<i32>> {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"))
            }
        }
        let root = temp_root("spawn");
        let plan = build_stage_plan(&PipelineConfig::default(), &fixture(&root));
        let report = run_pipeline(&root, &plan, &Broken, "DONE").expect("pipeline");
        assert_eq!(
            report.outcome,
            JobOutcome::StageFailed {
                stage: "init".to_string(),
                exit_status: "spawn_error".to_string()
            }
        );
        let log = read_stage_log(&root).expect("log");
        assert_eq!(log.len(), 1);
        assert!(log[0].error.as_deref().unwrap_or("").contains("no such program"));

        let signal_root = temp_root("signal");
        let mut runner = ScriptedRunner::new(&plan);
        runner.exit_codes.insert(Stage::Preprocess, None);
        let report = run_pipeline(&signal_root, &plan, &runner, "DONE").expect("pipeline");
        assert_eq!(
            report.outcome,
            JobOutcome::StageFailed {
                stage: "preprocess".to_string(),
                exit_status: "signal".to_string()
            }
        );
        let _ = fs::remove_dir_all(root);
        let _ = fs::remove_dir_all(signal_root);
    }

    #[test]
    fn guard_writes_aborted_marker_when_pipeline_unwinds() {
        let root = temp_root("guard");
        {
            let mut guard = MarkerGuard::new(&root, "DONE");
            guard.stages_run = 2;
        }
        let payload = read_marker(&root.join("DONE")).expect("marker");
        assert!(matches!(payload.outcome, JobOutcome::Aborted { .. }));
        assert_eq!(payload.stages_run, 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn run_job_without_fixture_still_marks_done() {
        let root = temp_root("nofixture");
        let config = crate::config::parse_config(
            "run_root: r\ncorpora:\n  - id: lj\n    dataset: /d\n    slices: [full]\n",
        )
        .expect("config");
        let err = run_job(&root, &config, &ProcessRunner).expect_err("no fixture");
        assert!(matches!(err, RegressError::Config(_)), "{}", err);
        let payload = read_marker(&root.join("DONE")).expect("marker");
        assert!(matches!(payload.outcome, JobOutcome::Aborted { .. }));
        let _ = fs::remove_dir_all(root);
    }
}
