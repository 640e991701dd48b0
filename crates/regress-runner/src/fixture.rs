use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use regress_core::{atomic_write_json_pretty, ensure_dir, sha256_file};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{expand_placeholders, CorpusConfig, RegressConfig, Slice};
use crate::error::{RegressError, RegressResult};

pub const FIXTURE_FILE: &str = "fixture.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    pub corpus: String,
    pub slice: Slice,
    pub workdir: PathBuf,
    pub manifest: PathBuf,
    pub media_link: PathBuf,
    pub records: usize,
    pub manifest_sha256: String,
    pub source_manifest: PathBuf,
    pub source_media: PathBuf,
    pub created_at: String,
}

impl Fixture {
    /// Directory name, which doubles as the job name.
    pub fn name(&self) -> String {
        fixture_dir_name(&self.corpus, self.slice)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreparationFailure {
    pub corpus: String,
    pub slice: Slice,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct PreparationReport {
    pub prepared: Vec<Fixture>,
    pub failures: Vec<PreparationFailure>,
}

impl PreparationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn fixture_dir_name(corpus: &str, slice: Slice) -> String {
    format!("regress-{}-{}", corpus, slice.label())
}

/// Prepares every configured (corpus, slice). Failures are collected per
/// fixture; only a run root that cannot be created aborts the batch.
pub fn prepare_all(config: &RegressConfig) -> RegressResult<PreparationReport> {
    ensure_dir(&config.run_root)?;
    let mut report = PreparationReport::default();
    for corpus in &config.corpora {
        for slice in &corpus.slices {
            match prepare_fixture(&config.run_root, corpus, *slice) {
                Ok(fixture) => {
                    info!(
                        fixture = %fixture.name(),
                        records = fixture.records,
                        "fixture prepared"
                    );
                    report.prepared.push(fixture);
                }
                Err(err) => {
                    error!(corpus = %corpus.id, slice = %slice, error = %err, "fixture preparation failed");
                    report.failures.push(PreparationFailure {
                        corpus: corpus.id.clone(),
                        slice: *slice,
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
    Ok(report)
}

pub fn prepare_fixture(run_root: &Path, corpus: &CorpusConfig, slice: Slice) -> RegressResult<Fixture> {
    let dataset = corpus.dataset_root()?;
    let source_manifest = dataset.join(&corpus.manifest);
    let source_media = dataset.join(&corpus.media);
    for path in [&dataset, &source_manifest, &source_media] {
        if !path.exists() {
            return Err(RegressError::DatasetNotFound {
                corpus: corpus.id.clone(),
                path: path.clone(),
            });
        }
    }
    let source_media = source_media.canonicalize()?;

    let workdir = run_root.join(fixture_dir_name(&corpus.id, slice));
    match fs::create_dir(&workdir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(RegressError::FixtureExists { path: workdir });
        }
        Err(e) => return Err(e.into()),
    }

    // A directory without fixture.json is not a fixture; drop it so the
    // next attempt is not rejected as a duplicate.
    match populate(&workdir, corpus, slice, &source_manifest, &source_media) {
        Ok(fixture) => Ok(fixture),
        Err(err) => {
            let _ = fs::remove_dir_all(&workdir);
            Err(err)
        }
    }
}

fn populate(
    workdir: &Path,
    corpus: &CorpusConfig,
    slice: Slice,
    source_manifest: &Path,
    source_media: &Path,
) -> RegressResult<Fixture> {
    let manifest_name = source_manifest
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("metadata.csv"));
    let manifest = workdir.join(manifest_name);
    let records = truncate_manifest(source_manifest, &manifest, slice.limit(), corpus.header)?;

    let media_link = workdir.join(&corpus.media);
    if let Some(parent) = media_link.parent() {
        ensure_dir(parent)?;
    }
    link_media(source_media, &media_link)?;

    let workdir_str = workdir.to_string_lossy().to_string();
    let manifest_str = manifest.to_string_lossy().to_string();
    let media_str = media_link.to_string_lossy().to_string();
    let slice_label = slice.label();
    let vars = [
        ("workdir", workdir_str.as_str()),
        ("corpus", corpus.id.as_str()),
        ("slice", slice_label.as_str()),
        ("manifest", manifest_str.as_str()),
        ("media", media_str.as_str()),
    ];
    for (dest, source) in &corpus.templates {
        let raw = fs::read_to_string(source).map_err(|_| RegressError::DatasetNotFound {
            corpus: corpus.id.clone(),
            path: source.clone(),
        })?;
        fs::write(workdir.join(dest), expand_placeholders(&raw, &vars))?;
    }

    let fixture = Fixture {
        corpus: corpus.id.clone(),
        slice,
        workdir: workdir.to_path_buf(),
        manifest_sha256: sha256_file(&manifest)?,
        manifest,
        media_link,
        records,
        source_manifest: source_manifest.to_path_buf(),
        source_media: source_media.to_path_buf(),
        created_at: Utc::now().to_rfc3339(),
    };
    atomic_write_json_pretty(&workdir.join(FIXTURE_FILE), &serde_json::to_value(&fixture)?)?;
    Ok(fixture)
}

/// Copies at most `limit` non-blank records from the head of `source`,
/// preserving an optional header line that does not count as a record.
pub fn truncate_manifest(
    source: &Path,
    dest: &Path,
    limit: Option<usize>,
    header: bool,
) -> RegressResult<usize> {
    let reader = BufReader::new(fs::File::open(source)?);
    let mut writer = BufWriter::new(fs::File::create(dest)?);
    let mut records = 0usize;
    let mut header_pending = header;
    for line in reader.lines() {
        let line = line?;
        if header_pending {
            writeln!(writer, "{}", line)?;
            header_pending = false;
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        if limit.is_some_and(|max| records >= max) {
            break;
        }
        writeln!(writer, "{}", line)?;
        records += 1;
    }
    writer.flush()?;
    Ok(records)
}

#[cfg(unix)]
fn link_media(source: &Path, link: &Path) -> RegressResult<()> {
    std::os::unix::fs::symlink(source, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn link_media(_source: &Path, _link: &Path) -> RegressResult<()> {
    Err(RegressError::Config(
        "media linking requires symlink support (unix only)".to_string(),
    ))
}

pub fn load_fixture(workdir: &Path) -> RegressResult<Fixture> {
    let path = workdir.join(FIXTURE_FILE);
    let bytes = fs::read(&path).map_err(|e| {
        RegressError::Config(format!("not a fixture directory ({}): {}", path.display(), e))
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Lists the fixtures already prepared under `run_root`, sorted by name.
pub fn discover_fixtures(run_root: &Path) -> RegressResult<Vec<Fixture>> {
    let mut fixtures = Vec::new();
    for entry in fs::read_dir(run_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.path().join(FIXTURE_FILE).is_file() {
            fixtures.push(load_fixture(&entry.path())?);
        }
    }
    fixtures.sort_by_key(|f| f.name());
    Ok(fixtures)
}
