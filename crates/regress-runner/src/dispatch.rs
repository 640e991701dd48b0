use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use regress_core::{atomic_write_json_pretty, shell_join};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::config::{RegressConfig, SchedulerConfig, SchedulerKind};
use crate::error::{status_label, RegressError, RegressResult};
use crate::fixture::Fixture;

pub const DISPATCH_FILE: &str = "dispatch.json";
const DISPATCH_SCHEMA: &str = "dispatch_v1";

/// What to run for one job and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub workdir: PathBuf,
    pub command: Vec<String>,
}

/// Submit-only view of a batch scheduler. Implementations return the
/// scheduler's opaque job id; completion is never learned from it.
pub trait Scheduler {
    fn submit(&self, request: &JobRequest) -> RegressResult<String>;

    /// The submission command line, for `describe` output and logs.
    fn submission_argv(&self, request: &JobRequest) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    config: SchedulerConfig,
}

impl SlurmScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, request: &JobRequest) -> RegressResult<String> {
        let argv = self.submission_argv(request);
        info!(job = %request.name, "+ {}", shell_join(&argv));
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| RegressError::Dispatch {
                fixture: request.name.clone(),
                reason: format!("cannot run {}: {}", argv[0], e),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RegressError::Dispatch {
                fixture: request.name.clone(),
                reason: format!(
                    "{} exited with {}: {}",
                    argv[0],
                    status_label(output.status.code()),
                    stderr.trim()
                ),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_sbatch_job_id(&stdout).ok_or_else(|| RegressError::Dispatch {
            fixture: request.name.clone(),
            reason: format!("unrecognized sbatch output: {}", stdout.trim()),
        })
    }

    fn submission_argv(&self, request: &JobRequest) -> Vec<String> {
        let c = &self.config;
        let workdir = request.workdir.to_string_lossy();
        let mut argv = vec![
            c.program.clone(),
            "--parsable".to_string(),
            format!("--job-name={}-{}", c.job_name_prefix, request.name),
            format!("--chdir={}", workdir),
            format!("--output={}/slurm-%j.out", workdir),
            format!("--nodes={}", c.nodes),
        ];
        if let Some(gpus) = c.gpus {
            argv.push(format!("--gres=gpu:{}", gpus));
        }
        if let Some(mem) = &c.mem {
            argv.push(format!("--mem={}", mem));
        }
        if let Some(time) = &c.time {
            argv.push(format!("--time={}", time));
        }
        for (flag, value) in [
            ("partition", &c.partition),
            ("account", &c.account),
            ("qos", &c.qos),
        ] {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                argv.push(format!("--{}={}", flag, v));
            }
        }
        argv.extend(c.extra_args.iter().cloned());
        argv.push("--wrap".to_string());
        argv.push(shell_join(&request.command));
        argv
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
pub fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(id.to_string())
    } else {
        None
    }
}

/// Runs each job as a detached background process on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalScheduler;

pub const LOCAL_JOB_LOG: &str = "local-job.log";

fn local_job_id(pid: u32) -> String {
    format!("local-{}", pid)
}

impl Scheduler for LocalScheduler {
    fn submit(&self, request: &JobRequest) -> RegressResult<String> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| RegressError::Dispatch {
                fixture: request.name.clone(),
                reason: "empty job command".to_string(),
            })?;
        info!(job = %request.name, "+ {}", shell_join(&request.command));
        let log = fs::File::create(request.workdir.join(LOCAL_JOB_LOG))?;
        let log_err = log.try_clone()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        // A signal aimed at the orchestrator's group must not reach the jobs.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|e| RegressError::Dispatch {
            fixture: request.name.clone(),
            reason: format!("cannot spawn {}: {}", program, e),
        })?;
        let pid = child.id();
        let job = request.name.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => info!(job = %job, pid, status = %status_label(status.code()), "local job exited"),
            Err(e) => error!(job = %job, pid, error = %e, "cannot reap local job"),
        });
        Ok(local_job_id(pid))
    }

    fn submission_argv(&self, request: &JobRequest) -> Vec<String> {
        request.command.clone()
    }
}

pub fn scheduler_for(config: &SchedulerConfig) -> Box<dyn Scheduler> {
    match config.kind {
        SchedulerKind::Slurm => Box::new(SlurmScheduler::new(config)),
        SchedulerKind::Local => Box::new(LocalScheduler),
    }
}

/// The `regress run-job` invocation a job executes on its compute node.
pub fn runner_command(config: &RegressConfig, workdir: &Path) -> RegressResult<Vec<String>> {
    let program = match &config.scheduler.runner_program {
        Some(p) => p.clone(),
        None => std::env::current_exe()?,
    };
    let config_path = config.source.as_ref().ok_or_else(|| {
        RegressError::Config("config must be loaded from a file to dispatch jobs".to_string())
    })?;
    Ok(vec![
        program.to_string_lossy().to_string(),
        "run-job".to_string(),
        "--workdir".to_string(),
        workdir.to_string_lossy().to_string(),
        "--config".to_string(),
        config_path.to_string_lossy().to_string(),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub fixture: String,
    pub workdir: PathBuf,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub submitted_at: String,
}

impl SubmissionRecord {
    pub fn accepted(&self) -> bool {
        self.job_id.is_some()
    }
}

/// Submits one job per fixture. A rejected submission is recorded and
/// logged; the remaining fixtures are still submitted.
pub fn dispatch_all(
    fixtures: &[Fixture],
    scheduler: &dyn Scheduler,
    command_for: &dyn Fn(&Fixture) -> RegressResult<Vec<String>>,
) -> Vec<SubmissionRecord> {
    let mut records = Vec::with_capacity(fixtures.len());
    for fixture in fixtures {
        let name = fixture.name();
        let result = command_for(fixture).and_then(|command| {
            scheduler.submit(&JobRequest {
                name: name.clone(),
                workdir: fixture.workdir.clone(),
                command,
            })
        });
        let (job_id, error) = match result {
            Ok(id) => {
                info!(fixture = %name, job_id = %id, "job submitted");
                (Some(id), None)
            }
            Err(err) => {
                error!(fixture = %name, error = %err, "job submission failed; skipping fixture");
                (None, Some(err.to_string()))
            }
        };
        records.push(SubmissionRecord {
            fixture: name,
            workdir: fixture.workdir.clone(),
            job_id,
            error,
            submitted_at: Utc::now().to_rfc3339(),
        });
    }
    records
}

/// Names of the jobs the scheduler accepted: the set the poller waits on.
pub fn dispatched_jobs(records: &[SubmissionRecord]) -> BTreeSet<String> {
    records
        .iter()
        .filter(|r| r.accepted())
        .map(|r| r.fixture.clone())
        .collect()
}

pub fn write_dispatch_record(run_root: &Path, records: &[SubmissionRecord]) -> RegressResult<()> {
    let payload = json!({
        "schema_version": DISPATCH_SCHEMA,
        "written_at": Utc::now().to_rfc3339(),
        "submissions": records,
    });
    atomic_write_json_pretty(&run_root.join(DISPATCH_FILE), &payload)?;
    Ok(())
}

pub fn load_dispatch_record(run_root: &Path) -> RegressResult<Vec<SubmissionRecord>> {
    let path = run_root.join(DISPATCH_FILE);
    let bytes = fs::read(&path).map_err(|e| {
        RegressError::Config(format!(
            "no dispatch record at {} (dispatch first): {}",
            path.display(),
            e
        ))
    })?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    let submissions = value
        .get("submissions")
        .cloned()
        .ok_or_else(|| RegressError::Config(format!("{}: missing submissions", path.display())))?;
    Ok(serde_json::from_value(submissions)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Slice;
    use regress_core::ensure_dir;
    use std::cell::RefCell;

    fn fixture(name_slice: usize) -> Fixture {
        let workdir = PathBuf::from(format!("/runs/regress-lj-{}", name_slice));
        Fixture {
            corpus: "lj".to_string(),
            slice: Slice::Records(name_slice),
            manifest: workdir.join("metadata.csv"),
            media_link: workdir.join("wavs"),
            workdir,
            records: name_slice,
            manifest_sha256: "sha256:00".to_string(),
            source_manifest: PathBuf::from("/data/metadata.csv"),
            source_media: PathBuf::from("/data/wavs"),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    struct FakeScheduler {
        reject: &'static str,
        submitted: RefCell<Vec<JobRequest>>,
    }

    impl Scheduler for FakeScheduler {
        fn submit(&self, request: &JobRequest) -> RegressResult<String> {
            self.submitted.borrow_mut().push(request.clone());
            if request.name == self.reject {
                return Err(RegressError::Dispatch {
                    fixture: request.name.clone(),
                    reason: "QOSMaxSubmitJobPerUserLimit".to_string(),
                });
            }
            Ok(format!("{}", 1000 + self.submitted.borrow().len()))
        }

        fn submission_argv(&self, request: &JobRequest) -> Vec<String> {
            request.command.clone()
        }
    }

    fn command_for(f: &Fixture) -> RegressResult<Vec<String>> {
        Ok(vec![
            "regress".to_string(),
            "run-job".to_string(),
            "--workdir".to_string(),
            f.workdir.to_string_lossy().to_string(),
        ])
    }

    #[test]
    fn rejected_submission_does_not_block_others() {
        let fixtures = vec![fixture(150), fixture(600), fixture(1600)];
        let scheduler = FakeScheduler {
            reject: "regress-lj-600",
            submitted: RefCell::new(Vec::new()),
        };
        let records = dispatch_all(&fixtures, &scheduler, &command_for);
        assert_eq!(scheduler.submitted.borrow().len(), 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].job_id.as_deref(), Some("1001"));
        assert!(records[1].job_id.is_none());
        assert!(records[1]
            .error
            .as_deref()
            .unwrap_or("")
            .contains("QOSMaxSubmitJobPerUserLimit"));
        assert_eq!(records[2].job_id.as_deref(), Some("1003"));

        let jobs: Vec<String> = dispatched_jobs(&records).into_iter().collect();
        assert_eq!(jobs, vec!["regress-lj-150", "regress-lj-1600"]);
    }

    #[test]
    fn sbatch_argv_carries_resources_and_wrapped_command() {
        let config = SchedulerConfig {
            partition: Some("gpu_a100".to_string()),
            account: Some("nrc_ict".to_string()),
            qos: Some(String::new()),
            gpus: Some(1),
            mem: Some("16G".to_string()),
            time: Some("180".to_string()),
            extra_args: vec!["--cpus-per-task=4".to_string()],
            ..SchedulerConfig::default()
        };
        let request = JobRequest {
            name: "regress-lj-150".to_string(),
            workdir: PathBuf::from("/runs/regress-lj-150"),
            command: vec![
                "/opt/bin/regress".to_string(),
                "run-job".to_string(),
                "--workdir".to_string(),
                "/runs/regress-lj-150".to_string(),
            ],
        };
        let argv = SlurmScheduler::new(&config).submission_argv(&request);
        assert_eq!(argv[0], "sbatch");
        assert!(argv.contains(&"--parsable".to_string()));
        assert!(argv.contains(&"--job-name=regress-regress-lj-150".to_string()));
        assert!(argv.contains(&"--chdir=/runs/regress-lj-150".to_string()));
        assert!(argv.contains(&"--gres=gpu:1".to_string()));
        assert!(argv.contains(&"--mem=16G".to_string()));
        assert!(argv.contains(&"--time=180".to_string()));
        assert!(argv.contains(&"--partition=gpu_a100".to_string()));
        assert!(argv.contains(&"--account=nrc_ict".to_string()));
        assert!(!argv.iter().any(|a| a.starts_with("--qos")));
        assert!(argv.contains(&"--cpus-per-task=4".to_string()));
        let n = argv.len();
        assert_eq!(argv[n - 2], "--wrap");
        assert_eq!(
            argv[n - 1],
            "/opt/bin/regress run-job --workdir /runs/regress-lj-150"
        );
    }

    #[test]
    fn parses_parsable_sbatch_output() {
        assert_eq!(parse_sbatch_job_id("123456\n").as_deref(), Some("123456"));
        assert_eq!(
            parse_sbatch_job_id("\n123456;gpsc7\n").as_deref(),
            Some("123456")
        );
        assert_eq!(parse_sbatch_job_id("Submitted batch job 1"), None);
        assert_eq!(parse_sbatch_job_id(""), None);
    }

    #[test]
    fn dispatch_record_round_trips() {
        let root = std::env::temp_dir().join(format!(
            "regress_dispatch_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        let fixtures = vec![fixture(150), fixture(600)];
        let scheduler = FakeScheduler {
            reject: "regress-lj-600",
            submitted: RefCell::new(Vec::new()),
        };
        let records = dispatch_all(&fixtures, &scheduler, &command_for);
        write_dispatch_record(&root, &records).expect("write");
        let loaded = load_dispatch_record(&root).expect("load");
        assert_eq!(loaded, records);
        let _ = fs::remove_dir_all(root);
    }

    /// Field 5 of `/proc/<pid>/stat`: the process group id.
    #[cfg(target_os = "linux")]
    fn process_group_of(pid: &str) -> String {
        let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).expect("stat");
        let after_comm = &stat[stat.rfind(')').expect("comm") + 1..];
        after_comm
            .split_whitespace()
            .nth(2)
            .expect("pgrp")
            .to_string()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_jobs_leave_the_orchestrator_process_group() {
        let root = std::env::temp_dir().join(format!(
            "regress_local_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        let request = JobRequest {
            name: "regress-lj-150".to_string(),
            workdir: root.clone(),
            command: vec!["sleep".to_string(), "5".to_string()],
        };
        let id = LocalScheduler.submit(&request).expect("spawn");
        let pid = id.strip_prefix("local-").expect("local id").to_string();
        let child_group = process_group_of(&pid);
        let own_group = process_group_of("self");
        let _ = Command::new("kill").arg(&pid).status();
        assert_ne!(child_group, own_group);
        assert_eq!(child_group, pid, "job leads its own group");
        assert!(root.join(LOCAL_JOB_LOG).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn command_errors_count_as_dispatch_failures() {
        let fixtures = vec![fixture(150)];
        let scheduler = FakeScheduler {
            reject: "",
            submitted: RefCell::new(Vec::new()),
        };
        let failing = |_: &Fixture| -> RegressResult<Vec<String>> {
            Err(RegressError::Config("no config source".to_string()))
        };
        let records = dispatch_all(&fixtures, &scheduler, &failing);
        assert!(scheduler.submitted.borrow().is_empty());
        assert!(!records[0].accepted());
    }
}
