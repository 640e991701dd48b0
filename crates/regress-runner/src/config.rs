use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RegressError, RegressResult};

pub const DEFAULT_MARKER_NAME: &str = "DONE";

/// Size of a fixture: the first `n` manifest records, or every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SliceRepr", into = "SliceRepr")]
pub enum Slice {
    Records(usize),
    Full,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SliceRepr {
    Count(u64),
    Label(String),
}

impl Slice {
    pub fn limit(self) -> Option<usize> {
        match self {
            Slice::Records(n) => Some(n),
            Slice::Full => None,
        }
    }

    pub fn label(self) -> String {
        match self {
            Slice::Records(n) => n.to_string(),
            Slice::Full => "full".to_string(),
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for Slice {
    type Err = RegressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("full") || trimmed.eq_ignore_ascii_case("all") {
            return Ok(Slice::Full);
        }
        match trimmed.parse::<usize>() {
            Ok(0) => Err(RegressError::Config(
                "slice size must be positive (use `full` for every record)".to_string(),
            )),
            Ok(n) => Ok(Slice::Records(n)),
            Err(_) => Err(RegressError::Config(format!(
                "invalid slice '{}': expected a record count or `full`",
                s
            ))),
        }
    }
}

impl TryFrom<SliceRepr> for Slice {
    type Error = RegressError;

    fn try_from(value: SliceRepr) -> Result<Self, Self::Error> {
        match value {
            SliceRepr::Count(n) => Slice::from_str(&n.to_string()),
            SliceRepr::Label(s) => Slice::from_str(&s),
        }
    }
}

impl From<Slice> for SliceRepr {
    fn from(value: Slice) -> Self {
        match value {
            Slice::Records(n) => SliceRepr::Count(n as u64),
            Slice::Full => SliceRepr::Label("full".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegressConfig {
    pub run_root: PathBuf,
    pub corpora: Vec<CorpusConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default = "default_marker_name")]
    pub marker_name: String,
    /// Absolute path of the file this config was loaded from.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    pub id: String,
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    /// Environment variable that, when set, overrides `dataset`.
    #[serde(default)]
    pub dataset_env: Option<String>,
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default = "default_media")]
    pub media: String,
    #[serde(default)]
    pub header: bool,
    pub slices: Vec<Slice>,
    /// Files copied into each fixture (destination name -> source), with
    /// `{workdir}`, `{corpus}`, `{slice}`, `{manifest}` and `{media}` expanded.
    #[serde(default)]
    pub templates: BTreeMap<String, PathBuf>,
}

impl CorpusConfig {
    pub fn dataset_root(&self) -> RegressResult<PathBuf> {
        if let Some(var) = self.dataset_env.as_deref() {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    return Ok(PathBuf::from(value));
                }
            }
        }
        self.dataset.clone().ok_or_else(|| {
            RegressError::Config(format!(
                "corpus `{}` has no dataset path (set `dataset` or `dataset_env`)",
                self.id
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_launcher")]
    pub launcher: Vec<String>,
    #[serde(default)]
    pub stages: StageTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            launcher: default_launcher(),
            stages: StageTable::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub args: Vec<String>,
    /// Working directory relative to the job directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl StageConfig {
    fn new(args: &[&str], cwd: Option<&str>) -> Self {
        Self {
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StageTable {
    #[serde(default = "default_init_stage")]
    pub init: StageConfig,
    #[serde(default = "default_preprocess_stage")]
    pub preprocess: StageConfig,
    #[serde(default = "default_train_primary_stage")]
    pub train_primary: StageConfig,
    #[serde(default = "default_train_secondary_stage")]
    pub train_secondary: StageConfig,
    #[serde(default = "default_synthesize_stage")]
    pub synthesize: StageConfig,
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            init: default_init_stage(),
            preprocess: default_preprocess_stage(),
            train_primary: default_train_primary_stage(),
            train_secondary: default_train_secondary_stage(),
            synthesize: default_synthesize_stage(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Slurm,
    Local,
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "slurm",
            SchedulerKind::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_kind")]
    pub kind: SchedulerKind,
    #[serde(default = "default_sbatch")]
    pub program: String,
    #[serde(default = "default_job_name_prefix")]
    pub job_name_prefix: String,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default)]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub mem: Option<String>,
    /// Wall-clock limit in any format `sbatch --time` accepts.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Program the job runs; defaults to the current `regress` executable.
    #[serde(default)]
    pub runner_program: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: default_scheduler_kind(),
            program: default_sbatch(),
            job_name_prefix: default_job_name_prefix(),
            partition: None,
            account: None,
            qos: None,
            nodes: default_nodes(),
            gpus: None,
            mem: None,
            time: None,
            extra_args: Vec::new(),
            runner_program: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default = "default_coverage_tool")]
    pub tool: Vec<String>,
    #[serde(default = "default_fragment_prefix")]
    pub fragment_prefix: String,
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default = "default_include")]
    pub include: String,
    /// Package directory that report paths are rewritten relative to.
    #[serde(default = "default_package")]
    pub package: String,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    /// Supplementary instrumented command run from the run root after dispatch.
    #[serde(default)]
    pub local_run: Option<Vec<String>>,
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            tool: default_coverage_tool(),
            fragment_prefix: default_fragment_prefix(),
            data_file: default_data_file(),
            include: default_include(),
            package: default_package(),
            reports_dir: default_reports_dir(),
            local_run: None,
        }
    }
}

fn default_marker_name() -> String {
    DEFAULT_MARKER_NAME.to_string()
}

fn default_manifest() -> String {
    "metadata.csv".to_string()
}

fn default_media() -> String {
    "wavs".to_string()
}

fn default_launcher() -> Vec<String> {
    ["coverage", "run", "-p", "-m", "everyvoice"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_init_stage() -> StageConfig {
    StageConfig::new(&["new-project", "--resume-from", "{workdir}/wizard-answers.yaml"], None)
}

fn default_preprocess_stage() -> StageConfig {
    StageConfig::new(
        &["preprocess", "config/everyvoice-text-to-spec.yaml"],
        Some("regress"),
    )
}

fn default_train_primary_stage() -> StageConfig {
    StageConfig::new(
        &[
            "train",
            "text-to-spec",
            "config/everyvoice-text-to-spec.yaml",
            "--config-args",
            "training.max_epochs=1",
        ],
        Some("regress"),
    )
}

fn default_train_secondary_stage() -> StageConfig {
    StageConfig::new(
        &[
            "train",
            "spec-to-wav",
            "config/everyvoice-spec-to-wav.yaml",
            "--config-args",
            "training.max_epochs=1",
        ],
        Some("regress"),
    )
}

fn default_synthesize_stage() -> StageConfig {
    StageConfig::new(
        &[
            "synthesize",
            "from-text",
            "--output-type",
            "wav",
            "--output-type",
            "spec",
            "--output-type",
            "textgrid",
            "--filelist",
            "{workdir}/filelist.txt",
            "--vocoder-path",
            "logs_and_checkpoints/VocoderExperiment/base/checkpoints/last.ckpt",
            "logs_and_checkpoints/FeaturePredictionExperiment/base/checkpoints/last.ckpt",
        ],
        Some("regress"),
    )
}

fn default_scheduler_kind() -> SchedulerKind {
    SchedulerKind::Slurm
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_job_name_prefix() -> String {
    "regress".to_string()
}

fn default_nodes() -> u32 {
    1
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_coverage_tool() -> Vec<String> {
    vec!["coverage".to_string()]
}

fn default_fragment_prefix() -> String {
    ".coverage.".to_string()
}

fn default_data_file() -> String {
    ".coverage".to_string()
}

fn default_include() -> String {
    "*/everyvoice/*".to_string()
}

fn default_package() -> String {
    "everyvoice".to_string()
}

fn default_reports_dir() -> String {
    "coverage".to_string()
}

/// Loads a YAML config, resolving relative paths against the file's directory.
pub fn load_config(path: &Path) -> RegressResult<RegressConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        RegressError::Config(format!("cannot read config {}: {}", path.display(), e))
    })?;
    let mut config = parse_config(&raw)?;
    let source = path.canonicalize()?;
    let base = source
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.resolve_relative_to(&base);
    config.source = Some(source);
    Ok(config)
}

pub fn parse_config(raw: &str) -> RegressResult<RegressConfig> {
    let config: RegressConfig = serde_yaml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

impl RegressConfig {
    pub fn validate(&self) -> RegressResult<()> {
        let mut problems = Vec::new();
        if self.corpora.is_empty() {
            problems.push("corpora: at least one corpus is required".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for corpus in &self.corpora {
            if corpus.id.trim().is_empty()
                || corpus.id.contains(['/', '\\'])
                || corpus.id.chars().any(char::is_whitespace)
            {
                problems.push(format!(
                    "corpora: invalid id '{}' (no whitespace or path separators)",
                    corpus.id
                ));
            }
            if !seen.insert(corpus.id.as_str()) {
                problems.push(format!("corpora: duplicate id '{}'", corpus.id));
            }
            if corpus.slices.is_empty() {
                problems.push(format!("corpora.{}: slices must not be empty", corpus.id));
            }
            if corpus.dataset.is_none() && corpus.dataset_env.is_none() {
                problems.push(format!(
                    "corpora.{}: set `dataset` or `dataset_env`",
                    corpus.id
                ));
            }
            if corpus
                .dataset
                .as_ref()
                .is_some_and(|d| d.as_os_str().to_string_lossy().trim().is_empty())
            {
                problems.push(format!("corpora.{}: `dataset` must not be empty", corpus.id));
            }
        }
        if self.poll.interval_seconds == 0 {
            problems.push("poll.interval_seconds must be positive".to_string());
        }
        if self.marker_name.trim().is_empty() || self.marker_name.contains(['/', '\\']) {
            problems.push(format!("marker_name: invalid '{}'", self.marker_name));
        }
        if self.coverage.tool.is_empty() {
            problems.push("coverage.tool must not be empty".to_string());
        }
        if self.coverage.fragment_prefix.is_empty() {
            problems.push("coverage.fragment_prefix must not be empty".to_string());
        }
        if self.coverage.fragment_prefix == self.coverage.data_file {
            problems.push("coverage.fragment_prefix must differ from data_file".to_string());
        }
        for (name, stage) in self.pipeline.stages.named() {
            if stage.args.is_empty() {
                problems.push(format!("pipeline.stages.{}: args must not be empty", name));
            }
        }
        if self.pipeline.launcher.is_empty() {
            problems.push("pipeline.launcher must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RegressError::Config(problems.join("; ")))
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.run_root.is_relative() {
            self.run_root = base.join(&self.run_root);
        }
        for corpus in &mut self.corpora {
            if let Some(dataset) = corpus.dataset.as_mut() {
                if dataset.is_relative() {
                    *dataset = base.join(&*dataset);
                }
            }
            for source in corpus.templates.values_mut() {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
        }
        if let Some(program) = self.scheduler.runner_program.as_mut() {
            if program.is_relative() && program.components().count() > 1 {
                *program = base.join(&*program);
            }
        }
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll.interval_seconds)
    }
}

impl StageTable {
    pub fn named(&self) -> [(&'static str, &StageConfig); 5] {
        [
            ("init", &self.init),
            ("preprocess", &self.preprocess),
            ("train-primary", &self.train_primary),
            ("train-secondary", &self.train_secondary),
            ("synthesize", &self.synthesize),
        ]
    }
}

/// Replaces `{key}` occurrences with their values; unknown keys are left as-is.
pub fn expand_placeholders(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

pub const CONFIG_TEMPLATE: &str = "\
# Where fixtures, job directories, markers and reports live.
run_root: ./regress-run
marker_name: DONE
corpora:
  - id: lj
    # dataset: /data/LJSpeech-1.1     # REQUIRED unless dataset_env is set
    dataset_env: LJ_SPEECH_DATASET
    manifest: metadata.csv
    media: wavs
    header: false
    slices: [16, 160, 1600, full]
    templates:
      wizard-answers.yaml: ./wizard-resume-lj
      filelist.txt: ./test-sentences.txt
pipeline:
  launcher: [coverage, run, -p, -m, everyvoice]
scheduler:
  kind: slurm                         # slurm | local
  partition: ''                       # REQUIRED for slurm
  account: ''
  nodes: 1
  gpus: 1
  mem: 16G
  time: '180'
poll:
  interval_seconds: 300
coverage:
  include: '*/everyvoice/*'
  package: everyvoice
  local_run: [coverage, run, -p, -m, everyvoice.run_tests, dev]
";

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
run_root: runs/current
corpora:
  - id: lj
    dataset: /data/LJSpeech-1.1
    slices: [150, 600, full]
";

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse_config(MINIMAL).expect("parse");
        assert_eq!(config.marker_name, "DONE");
        assert_eq!(config.poll.interval_seconds, 300);
        assert_eq!(config.scheduler.kind, SchedulerKind::Slurm);
        assert_eq!(config.coverage.fragment_prefix, ".coverage.");
        assert_eq!(
            config.corpora[0].slices,
            vec![Slice::Records(150), Slice::Records(600), Slice::Full]
        );
        assert_eq!(config.pipeline.stages.preprocess.cwd.as_deref(), Some("regress"));
        assert_eq!(config.pipeline.launcher[0], "coverage");
    }

    #[test]
    fn slice_parsing_rejects_zero_and_garbage() {
        assert_eq!("full".parse::<Slice>().expect("full"), Slice::Full);
        assert_eq!("ALL".parse::<Slice>().expect("all"), Slice::Full);
        assert_eq!("42".parse::<Slice>().expect("n"), Slice::Records(42));
        assert!("0".parse::<Slice>().is_err());
        assert!("ten".parse::<Slice>().is_err());
        let err = parse_config(
            "run_root: r\ncorpora:\n  - id: lj\n    dataset: /d\n    slices: [0]\n",
        )
        .expect_err("zero slice");
        assert!(err.to_string().contains("positive"), "{}", err);
    }

    #[test]
    fn validation_reports_every_problem() {
        let raw = "
run_root: r
corpora:
  - id: 'bad id'
    slices: []
  - id: lj
    dataset: /d
    slices: [full]
  - id: lj
    dataset: /d
    slices: [full]
poll:
  interval_seconds: 0
";
        let err = parse_config(raw).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("invalid id 'bad id'"), "{}", msg);
        assert!(msg.contains("slices must not be empty"), "{}", msg);
        assert!(msg.contains("set `dataset` or `dataset_env`"), "{}", msg);
        assert!(msg.contains("duplicate id 'lj'"), "{}", msg);
        assert!(msg.contains("interval_seconds"), "{}", msg);
    }

    #[test]
    fn empty_dataset_path_is_rejected() {
        for dataset in ["''", "' '"] {
            let raw = format!(
                "run_root: r\ncorpora:\n  - id: lj\n    dataset: {}\n    dataset_env: LJ_SPEECH_DATASET\n    slices: [full]\n",
                dataset
            );
            let err = parse_config(&raw).expect_err("empty dataset");
            assert!(err.to_string().contains("`dataset` must not be empty"), "{}", err);
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{}surprise: true\n", MINIMAL);
        let err = parse_config(&raw).expect_err("unknown key");
        assert!(err.to_string().contains("surprise"), "{}", err);
    }

    #[test]
    fn dataset_env_overrides_configured_path() {
        let var = format!("REGRESS_TEST_DATASET_{}", std::process::id());
        let corpus = CorpusConfig {
            id: "lj".to_string(),
            dataset: Some(PathBuf::from("/configured")),
            dataset_env: Some(var.clone()),
            manifest: default_manifest(),
            media: default_media(),
            header: false,
            slices: vec![Slice::Full],
            templates: BTreeMap::new(),
        };
        assert_eq!(corpus.dataset_root().expect("root"), PathBuf::from("/configured"));
        std::env::set_var(&var, "/from-env");
        assert_eq!(corpus.dataset_root().expect("root"), PathBuf::from("/from-env"));
        std::env::remove_var(&var);
    }

    #[test]
    fn expand_placeholders_replaces_known_keys_only() {
        let out = expand_placeholders(
            "{workdir}/filelist.txt {unknown} {corpus}",
            &[("workdir", "/runs/regress-lj-150"), ("corpus", "lj")],
        );
        assert_eq!(out, "/runs/regress-lj-150/filelist.txt {unknown} lj");
    }

    #[test]
    fn config_template_parses_once_required_fields_are_filled() {
        let config = parse_config(CONFIG_TEMPLATE).expect("template parses as written");
        assert!(config.corpora[0].dataset.is_none());
        assert_eq!(config.corpora[0].dataset_env.as_deref(), Some("LJ_SPEECH_DATASET"));

        let filled = CONFIG_TEMPLATE.replace("# dataset: /data/LJSpeech-1.1", "dataset: /data/lj");
        let config = parse_config(&filled).expect("template parses");
        assert_eq!(config.corpora[0].dataset.as_deref(), Some(Path::new("/data/lj")));
        assert_eq!(config.corpora[0].slices.len(), 4);
        assert_eq!(
            config.coverage.local_run.as_deref().map(|v| v.len()),
            Some(6)
        );
    }
}
