//! Completion markers: the only signal a remote job gives the orchestrator.
//!
//! A job's runner writes one marker file, with a fixed name, directly inside
//! its working directory as its final action. Presence means "terminal";
//! the JSON payload only says how the job ended and is never needed to
//! count completions.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use regress_core::atomic_write_json_pretty;
use serde::{Deserialize, Serialize};

use crate::error::RegressResult;

pub const MARKER_SCHEMA: &str = "job_marker_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    StageFailed { stage: String, exit_status: String },
    Aborted { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub schema_version: String,
    pub job: String,
    pub outcome: JobOutcome,
    pub stages_run: usize,
    pub written_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompletionMarker {
    /// Name of the job directory holding the marker.
    pub job: String,
    pub path: PathBuf,
}

/// Enumerates completion markers under a run root.
pub trait MarkerSource {
    fn enumerate(&self) -> RegressResult<Vec<CompletionMarker>>;
}

/// Scans the immediate subdirectories of `root` for `marker_name`.
#[derive(Debug, Clone)]
pub struct FsMarkerSource {
    root: PathBuf,
    marker_name: String,
}

impl FsMarkerSource {
    pub fn new(root: &Path, marker_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            marker_name: marker_name.to_string(),
        }
    }
}

impl MarkerSource for FsMarkerSource {
    fn enumerate(&self) -> RegressResult<Vec<CompletionMarker>> {
        let mut markers = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join(&self.marker_name);
            if path.is_file() {
                markers.push(CompletionMarker {
                    job: entry.file_name().to_string_lossy().to_string(),
                    path,
                });
            }
        }
        markers.sort();
        Ok(markers)
    }
}

/// Number of distinct known jobs that have a marker.
pub fn count_completed(markers: &[CompletionMarker], jobs: &BTreeSet<String>) -> usize {
    markers
        .iter()
        .filter(|m| jobs.contains(&m.job))
        .map(|m| m.job.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

pub fn write_marker(
    workdir: &Path,
    marker_name: &str,
    outcome: &JobOutcome,
    stages_run: usize,
) -> RegressResult<PathBuf> {
    let job = workdir
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let payload = MarkerPayload {
        schema_version: MARKER_SCHEMA.to_string(),
        job,
        outcome: outcome.clone(),
        stages_run,
        written_at: Utc::now().to_rfc3339(),
    };
    let path = workdir.join(marker_name);
    atomic_write_json_pretty(&path, &serde_json::to_value(&payload)?)?;
    Ok(path)
}

/// Reads a marker payload; `None` for markers that carry no parseable status.
pub fn read_marker(path: &Path) -> Option<MarkerPayload> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Outcome per known job: `None` while the job has no marker or its marker
/// has no status payload.
pub fn read_outcomes(
    root: &Path,
    marker_name: &str,
    jobs: &BTreeSet<String>,
) -> BTreeMap<String, Option<JobOutcome>> {
    jobs.iter()
        .map(|job| {
            let outcome = read_marker(&root.join(job).join(marker_name)).map(|p| p.outcome);
            (job.clone(), outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regress_core::ensure_dir;

    fn temp_root(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "regress_markers_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    fn jobs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn marker(job: &str) -> CompletionMarker {
        CompletionMarker {
            job: job.to_string(),
            path: PathBuf::from(job).join("DONE"),
        }
    }

    #[test]
    fn count_ignores_unknown_and_duplicate_markers() {
        let known = jobs(&["regress-lj-150", "regress-lj-600", "regress-lj-full"]);
        let markers = vec![
            marker("regress-lj-150"),
            marker("regress-lj-150"),
            marker("regress-stale-run"),
            marker("regress-lj-full"),
        ];
        assert_eq!(count_completed(&markers, &known), 2);
        assert_eq!(count_completed(&[], &known), 0);
    }

    #[test]
    fn fs_source_finds_markers_only_in_job_directories() {
        let root = temp_root("scan");
        for name in ["regress-lj-150", "regress-lj-600", "regress-lj-full"] {
            ensure_dir(&root.join(name)).expect("job dir");
        }
        write_marker(&root.join("regress-lj-600"), "DONE", &JobOutcome::Succeeded, 5)
            .expect("marker");
        fs::write(root.join("DONE"), b"").expect("stray marker at root");
        ensure_dir(&root.join("regress-lj-full").join("DONE")).expect("directory named DONE");

        let found = FsMarkerSource::new(&root, "DONE").enumerate().expect("scan");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job, "regress-lj-600");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn marker_payload_round_trips_outcome() {
        let root = temp_root("payload");
        let workdir = root.join("regress-lj-150");
        ensure_dir(&workdir).expect("job dir");
        let outcome = JobOutcome::StageFailed {
            stage: "train-secondary".to_string(),
            exit_status: "1".to_string(),
        };
        let path = write_marker(&workdir, "DONE", &outcome, 4).expect("marker");
        let payload = read_marker(&path).expect("payload");
        assert_eq!(payload.schema_version, MARKER_SCHEMA);
        assert_eq!(payload.job, "regress-lj-150");
        assert_eq!(payload.outcome, outcome);
        assert_eq!(payload.stages_run, 4);

        let outcomes = read_outcomes(&root, "DONE", &jobs(&["regress-lj-150", "regress-lj-600"]));
        assert_eq!(outcomes["regress-lj-150"], Some(outcome));
        assert_eq!(outcomes["regress-lj-600"], None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_marker_still_counts_but_has_no_outcome() {
        let root = temp_root("empty");
        let workdir = root.join("regress-lj-150");
        ensure_dir(&workdir).expect("job dir");
        fs::write(workdir.join("DONE"), b"").expect("touch");
        let found = FsMarkerSource::new(&root, "DONE").enumerate().expect("scan");
        assert_eq!(count_completed(&found, &jobs(&["regress-lj-150"])), 1);
        assert!(read_marker(&workdir.join("DONE")).is_none());
        let _ = fs::remove_dir_all(root);
    }
}
