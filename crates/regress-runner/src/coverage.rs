use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::Utc;
use regress_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_bytes, shell_join};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::CoverageSettings;
use crate::error::{status_label, RegressError, RegressResult};
use crate::markers::JobOutcome;

pub const TEXT_REPORT: &str = "report.txt";
pub const XML_REPORT: &str = "coverage.xml";
pub const HTML_DIR: &str = "html";
pub const SUMMARY_FILE: &str = "summary.json";

const NO_DATA: &str = "No data to report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Partial,
    Final,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Partial => "partial",
            ReportKind::Final => "final",
        }
    }
}

/// Operations of the external coverage tool.
pub trait CoverageTool {
    /// Merges `fragments` into `data_file`, leaving the fragments in place.
    fn combine(&self, data_file: &Path, fragments: &[PathBuf]) -> RegressResult<()>;
    fn text_report(&self, data_file: &Path, include: &str) -> RegressResult<String>;
    /// `Ok(false)` when the filter matched nothing and no export was written.
    fn html_report(&self, data_file: &Path, include: &str, out_dir: &Path) -> RegressResult<bool>;
    fn xml_report(&self, data_file: &Path, include: &str, out_file: &Path) -> RegressResult<bool>;
}

/// Drives the `coverage` command-line tool.
#[derive(Debug, Clone)]
pub struct CoverageCli {
    program: Vec<String>,
    cwd: PathBuf,
}

impl CoverageCli {
    pub fn new(program: &[String], cwd: &Path) -> Self {
        Self {
            program: program.to_vec(),
            cwd: cwd.to_path_buf(),
        }
    }

    fn run(&self, args: Vec<String>) -> RegressResult<Output> {
        let mut argv = self.program.clone();
        argv.extend(args);
        let line = shell_join(&argv);
        info!("+ {}", line);
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| RegressError::Config("coverage.tool must not be empty".to_string()))?;
        let output = Command::new(program)
            .args(rest)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .output()?;
        info!(status = %status_label(output.status.code()), "coverage tool finished");
        if output.status.success() || mentions_no_data(&output) {
            Ok(output)
        } else {
            Err(RegressError::from_command_failure(
                line,
                status_label(output.status.code()),
                &output.stderr,
            ))
        }
    }
}

fn mentions_no_data(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stdout).contains(NO_DATA)
        || String::from_utf8_lossy(&output.stderr).contains(NO_DATA)
}

fn data_file_arg(data_file: &Path) -> String {
    format!("--data-file={}", data_file.display())
}

impl CoverageTool for CoverageCli {
    fn combine(&self, data_file: &Path, fragments: &[PathBuf]) -> RegressResult<()> {
        let mut args = vec![
            "combine".to_string(),
            "--keep".to_string(),
            data_file_arg(data_file),
        ];
        args.extend(fragments.iter().map(|p| p.to_string_lossy().to_string()));
        self.run(args)?;
        Ok(())
    }

    fn text_report(&self, data_file: &Path, include: &str) -> RegressResult<String> {
        let output = self.run(vec![
            "report".to_string(),
            data_file_arg(data_file),
            format!("--include={}", include),
        ])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn html_report(&self, data_file: &Path, include: &str, out_dir: &Path) -> RegressResult<bool> {
        let output = self.run(vec![
            "html".to_string(),
            data_file_arg(data_file),
            format!("--include={}", include),
            "-d".to_string(),
            out_dir.to_string_lossy().to_string(),
        ])?;
        Ok(output.status.success())
    }

    fn xml_report(&self, data_file: &Path, include: &str, out_file: &Path) -> RegressResult<bool> {
        let output = self.run(vec![
            "xml".to_string(),
            data_file_arg(data_file),
            format!("--include={}", include),
            "-o".to_string(),
            out_file.to_string_lossy().to_string(),
        ])?;
        Ok(output.status.success())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedReport {
    pub kind: ReportKind,
    pub fragments: usize,
    pub data_file: PathBuf,
    pub text_report: PathBuf,
    pub text_sha256: String,
    pub html_dir: Option<PathBuf>,
    pub xml_report: Option<PathBuf>,
    pub summary: PathBuf,
}

/// Every coverage fragment under `root`, sorted. Symlinks are not followed,
/// so linked media trees are never walked.
pub fn discover_fragments(root: &Path, settings: &CoverageSettings) -> RegressResult<Vec<PathBuf>> {
    collect_fragments(root, settings, fragment_walk(root, settings))
}

fn fragment_walk(
    root: &Path,
    settings: &CoverageSettings,
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> {
    let reports_dir = root.join(&settings.reports_dir);
    walkdir::WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| e.path() != reports_dir)
}

/// Only an unreadable root is fatal. Jobs still running may remove or
/// restrict directories under it while the partial pass walks.
fn collect_fragments(
    root: &Path,
    settings: &CoverageSettings,
    entries: impl Iterator<Item = walkdir::Result<walkdir::DirEntry>>,
) -> RegressResult<Vec<PathBuf>> {
    let mut fragments = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() > 0 => {
                warn!(
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "skipping unreadable path during fragment discovery"
                );
                continue;
            }
            Err(e) => {
                return Err(RegressError::Aggregation(format!(
                    "walking {}: {}",
                    root.display(),
                    e
                )));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with(&settings.fragment_prefix) && name != settings.data_file.as_str() {
            fragments.push(entry.path().to_path_buf());
        }
    }
    fragments.sort();
    Ok(fragments)
}

/// Combines every fragment under `root` into a fresh database and renders the
/// filtered text, HTML and XML reports for `kind`.
pub fn aggregate(
    root: &Path,
    settings: &CoverageSettings,
    tool: &dyn CoverageTool,
    kind: ReportKind,
    job_outcomes: &BTreeMap<String, Option<JobOutcome>>,
) -> RegressResult<AggregatedReport> {
    let fragments = discover_fragments(root, settings)?;
    if fragments.is_empty() {
        return Err(RegressError::Aggregation(format!(
            "no coverage fragments ({}*) found under {}",
            settings.fragment_prefix,
            root.display()
        )));
    }
    info!(kind = kind.as_str(), fragments = fragments.len(), "combining coverage");

    // Each pass starts from the raw fragments, never from an earlier combine.
    let data_file = root.join(&settings.data_file);
    if data_file.exists() {
        fs::remove_file(&data_file)?;
    }
    tool.combine(&data_file, &fragments)?;

    let out_dir = root.join(&settings.reports_dir).join(kind.as_str());
    ensure_dir(&out_dir)?;

    let raw = tool.text_report(&data_file, &settings.include)?;
    let text = normalize_text_report(&raw, &settings.package);
    let text_report = out_dir.join(TEXT_REPORT);
    atomic_write_bytes(&text_report, text.as_bytes())?;
    let text_sha256 = sha256_bytes(text.as_bytes());

    let html_dir = out_dir.join(HTML_DIR);
    if html_dir.exists() {
        fs::remove_dir_all(&html_dir)?;
    }
    let html_dir = if tool.html_report(&data_file, &settings.include, &html_dir)? {
        Some(html_dir)
    } else {
        warn!(kind = kind.as_str(), "html export skipped: nothing matched the include filter");
        None
    };

    let xml_path = out_dir.join(XML_REPORT);
    let xml_report = if tool.xml_report(&data_file, &settings.include, &xml_path)? {
        let xml = fs::read_to_string(&xml_path)?;
        atomic_write_bytes(&xml_path, normalize_machine_paths(&xml, &settings.package).as_bytes())?;
        Some(xml_path)
    } else {
        warn!(kind = kind.as_str(), "xml export skipped: nothing matched the include filter");
        None
    };

    let summary = out_dir.join(SUMMARY_FILE);
    let failed_jobs: Vec<&String> = job_outcomes
        .iter()
        .filter(|(_, o)| o.as_ref().is_some_and(|o| !o.is_success()))
        .map(|(job, _)| job)
        .collect();
    atomic_write_json_pretty(
        &summary,
        &json!({
            "schema_version": "coverage_summary_v1",
            "kind": kind.as_str(),
            "generated_at": Utc::now().to_rfc3339(),
            "fragments": fragments.len(),
            "include": settings.include,
            "text_report": TEXT_REPORT,
            "text_sha256": text_sha256,
            "jobs": job_outcomes,
            "failed_jobs": failed_jobs,
        }),
    )?;
    info!(kind = kind.as_str(), report = %text_report.display(), "coverage report written");

    Ok(AggregatedReport {
        kind,
        fragments: fragments.len(),
        data_file,
        text_report,
        text_sha256,
        html_dir,
        xml_report,
        summary,
    })
}

/// Index of `package` inside `token` when it is preceded by a path separator
/// and followed by a separator or the end of the token.
/// The last such match wins, so a checkout directory that happens to carry
/// the package name is stripped along with the rest of the prefix.
fn package_offset(token: &str, package: &str) -> Option<usize> {
    if package.is_empty() {
        return None;
    }
    token.rmatch_indices(package).map(|(idx, _)| idx).find(|&idx| {
        let before = token[..idx].chars().next_back();
        let after = token[idx + package.len()..].chars().next();
        idx > 0
            && matches!(before, Some('/') | Some('\\'))
            && matches!(after, None | Some('/') | Some('\\'))
    })
}

/// Rewrites `/any/prefix/<package>/x.py` to `<package>/x.py`.
pub fn strip_to_package(token: &str, package: &str) -> String {
    match package_offset(token, package) {
        Some(idx) => token[idx..].to_string(),
        None => token.to_string(),
    }
}

/// Makes a `coverage report` table machine-independent: the file column is
/// rewritten to package-relative paths and the header, rule and total lines
/// are narrowed by the same amount the file column shrank.
pub fn normalize_text_report(report: &str, package: &str) -> String {
    let lines: Vec<&str> = report.split_inclusive('\n').collect();
    let mut out: Vec<String> = lines
        .iter()
        .map(|line| {
            let (path, rest) = line.split_at(name_column_end(line));
            format!("{}{}", strip_to_package(path, package), rest)
        })
        .collect();
    if lines.len() < 4 {
        return out.concat();
    }
    let shrink = lines[2]
        .chars()
        .count()
        .saturating_sub(out[2].chars().count());
    if shrink > 0 {
        let n = out.len();
        for idx in [0, 1, n - 2, n - 1] {
            out[idx] = remove_padding(&out[idx], 5, shrink);
        }
    }
    out.concat()
}

/// End of the file-name column: everything before the trailing run of
/// numeric columns (`Stmts`, `Miss`, `Cover`, `Missing` ranges). File names
/// may contain spaces, so the line is split from the right.
fn name_column_end(line: &str) -> usize {
    let mut end = line.trim_end().len();
    while end > 0 {
        let head = &line[..end];
        let start = head
            .rfind(char::is_whitespace)
            .map(|i| i + head[i..].chars().next().map_or(1, char::len_utf8))
            .unwrap_or(0);
        if !is_numeric_column(&head[start..]) {
            break;
        }
        end = head[..start].trim_end().len();
    }
    end
}

fn is_numeric_column(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '%' | '.' | ',' | '-' | '>'))
}

/// Drops up to `count` padding characters (spaces or rule dashes) starting at
/// column `start`.
fn remove_padding(line: &str, start: usize, count: usize) -> String {
    let chars: Vec<char> = line.chars().collect();
    if chars.len() <= start {
        return line.to_string();
    }
    let mut end = start;
    while end < chars.len() && end - start < count && matches!(chars[end], ' ' | '-') {
        end += 1;
    }
    chars[..start].iter().chain(chars[end..].iter()).collect()
}

#[derive(Clone, Copy)]
enum XmlState {
    Text,
    Tag,
    Quoted(char),
}

/// Rewrites every attribute value and element body of a machine-readable
/// export to be package-relative. Values are taken whole, so paths with
/// spaces survive. `<source>` entries that remain absolute are replaced by
/// `.` since they only anchor the (already relative) file names.
pub fn normalize_machine_paths(doc: &str, package: &str) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut value = String::new();
    let mut state = XmlState::Text;
    for c in doc.chars() {
        match state {
            XmlState::Text if c == '<' => {
                out.push_str(&strip_value(&value, package));
                value.clear();
                out.push(c);
                state = XmlState::Tag;
            }
            XmlState::Quoted(q) if c == q => {
                out.push_str(&strip_value(&value, package));
                value.clear();
                out.push(c);
                state = XmlState::Tag;
            }
            XmlState::Text | XmlState::Quoted(_) => value.push(c),
            XmlState::Tag => {
                out.push(c);
                match c {
                    '"' | '\'' => state = XmlState::Quoted(c),
                    '>' => state = XmlState::Text,
                    _ => {}
                }
            }
        }
    }
    out.push_str(&strip_value(&value, package));
    anonymize_sources(&out)
}

/// Leading whitespace of an element body is layout, not part of the path.
fn strip_value(value: &str, package: &str) -> String {
    let body = value.trim_start();
    let indent = &value[..value.len() - body.len()];
    format!("{}{}", indent, strip_to_package(body, package))
}

fn anonymize_sources(doc: &str) -> String {
    const OPEN: &str = "<source>";
    const CLOSE: &str = "</source>";
    let mut out = String::with_capacity(doc.len());
    let mut rest = doc;
    while let Some(start) = rest.find(OPEN) {
        let body_start = start + OPEN.len();
        let Some(body_len) = rest[body_start..].find(CLOSE) else {
            break;
        };
        let body = &rest[body_start..body_start + body_len];
        out.push_str(&rest[..body_start]);
        if looks_absolute(body.trim()) {
            out.push('.');
        } else {
            out.push_str(body);
        }
        rest = &rest[body_start + body_len..];
    }
    out.push_str(rest);
    out
}

fn looks_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && matches!(bytes[2], b'/' | b'\\'))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Stands in for the coverage tool: the combined database lists the
    /// fragments it was built from, and reports are derived from that list.
    pub struct FakeCoverage {
        pub checkout: String,
    }

    impl FakeCoverage {
        pub fn new(checkout: &str) -> Self {
            Self {
                checkout: checkout.to_string(),
            }
        }
    }

    impl CoverageTool for FakeCoverage {
        fn combine(&self, data_file: &Path, fragments: &[PathBuf]) -> RegressResult<()> {
            if data_file.exists() {
                return Err(RegressError::Aggregation("stale combined database".to_string()));
            }
            let names: Vec<String> = fragments
                .iter()
                .map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default())
                .collect();
            fs::write(data_file, names.join("\n"))?;
            Ok(())
        }

        fn text_report(&self, data_file: &Path, _include: &str) -> RegressResult<String> {
            let count = fs::read_to_string(data_file)?.lines().count();
            let a = format!("{}/everyvoice/cli.py", self.checkout);
            let b = format!("{}/everyvoice/model/vocoder/hifigan.py", self.checkout);
            let width = b.len();
            let rule = "-".repeat(width + 25);
            Ok(format!(
                "{:<w$}   Stmts   Miss  Cover\n{}\n{:<w$}   {:>5}   {:>4}   {:>3}%\n{:<w$}   {:>5}   {:>4}   {:>3}%\n{}\n{:<w$}   {:>5}   {:>4}   {:>3}%\n",
                "Name",
                rule,
                a,
                100,
                100 - count.min(100),
                count.min(100),
                b,
                50,
                25,
                50,
                rule,
                "TOTAL",
                150,
                125 - count.min(100),
                17,
                w = width
            ))
        }

        fn html_report(&self, _data_file: &Path, _include: &str, out_dir: &Path) -> RegressResult<bool> {
            ensure_dir(out_dir)?;
            fs::write(out_dir.join("index.html"), "<html></html>")?;
            Ok(true)
        }

        fn xml_report(&self, _data_file: &Path, _include: &str, out_file: &Path) -> RegressResult<bool> {
            let xml = format!(
                "<?xml version=\"1.0\" ?>\n<coverage version=\"7.4.0\">\n\t<sources>\n\t\t<source>{c}/everyvoice</source>\n\t\t<source>{c}</source>\n\t</sources>\n\t<packages>\n\t\t<package name=\".\">\n\t\t\t<class name=\"cli.py\" filename=\"{c}/everyvoice/cli.py\" line-rate=\"0.9\"/>\n\t\t</package>\n\t</packages>\n</coverage>\n",
                c = self.checkout
            );
            fs::write(out_file, xml)?;
            Ok(true)
        }
    }
}
