use std::path::PathBuf;

use thiserror::Error;

pub type RegressResult<T> = Result<T, RegressError>;

#[derive(Debug, Error)]
pub enum RegressError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml failure: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("dataset not found for corpus `{corpus}`: {}", path.display())]
    DatasetNotFound { corpus: String, path: PathBuf },

    #[error("fixture already exists (remove it or pick a new run_root): {}", path.display())]
    FixtureExists { path: PathBuf },

    #[error("submission rejected for `{fixture}`: {reason}")]
    Dispatch { fixture: String, reason: String },

    #[error("stage `{stage}` failed (status: {status})")]
    StageFailure { stage: String, status: String },

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: String,
        stderr_suffix: String,
    },
}

impl RegressError {
    #[must_use]
    pub fn from_command_failure(command: String, status: String, stderr: &[u8]) -> Self {
        let stderr = String::from_utf8_lossy(stderr);
        let trimmed = stderr.trim();
        let stderr_suffix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("; stderr: {trimmed}")
        };
        Self::CommandFailed {
            command,
            status,
            stderr_suffix,
        }
    }

    /// Stable machine-readable code used in the CLI's JSON error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Config(_) => "config_error",
            Self::DatasetNotFound { .. } => "dataset_not_found",
            Self::FixtureExists { .. } => "fixture_exists",
            Self::Dispatch { .. } => "dispatch_error",
            Self::StageFailure { .. } => "stage_failure",
            Self::Aggregation(_) => "aggregation_error",
            Self::CommandFailed { .. } => "command_failed",
        }
    }
}

/// Renders a process exit status the way the stage log and markers record it.
#[must_use]
pub fn status_label(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
