//! Regression orchestration: fixture preparation, per-fixture pipeline jobs,
//! completion polling and two-pass coverage aggregation.

pub mod config;
pub mod coverage;
pub mod dispatch;
pub mod error;
pub mod fixture;
pub mod markers;
pub mod orchestrate;
pub mod poll;
pub mod stages;

pub use config::{load_config, parse_config, RegressConfig, Slice, CONFIG_TEMPLATE, DEFAULT_MARKER_NAME};
pub use coverage::{aggregate, normalize_text_report, AggregatedReport, CoverageCli, ReportKind};
pub use dispatch::{scheduler_for, Scheduler, SubmissionRecord};
pub use error::{RegressError, RegressResult};
pub use fixture::{prepare_all, Fixture, PreparationReport};
pub use markers::{FsMarkerSource, JobOutcome, MarkerSource};
pub use orchestrate::{resume_wait, run_regression, RunServices, RunStatus, RunSummary};
pub use poll::{Pacer, Poller, SleepPacer, Threshold};
pub use stages::{run_job, CommandRunner, ProcessRunner};
