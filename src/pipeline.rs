//! Core data model and scan orchestration.
//!
//! One file goes through: hash -> identity check -> engine dispatch ->
//! ignored-rules filter -> per-file status. Files are distributed across a
//! bounded worker pool; results are collected in submission order via a
//! sequence tag so output is deterministic regardless of which worker
//! finishes first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::HashCache;
use crate::config::WardenConfig;
use crate::engines;
use crate::identity::{self, IdentityClient};
use crate::signatures::SignatureStore;

/// Cooperative cancellation signal shared across the worker pool and
/// passed into every engine so a long scan can be interrupted between
/// chunks (an opcode for pickle, a cell for notebooks, a read window for
/// streaming extractors) rather than only between whole files.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_uppercase().as_str() {
            "WARNING" => Some(Severity::Warning),
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Warning => "WARNING",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatKind {
    UnsafeReference,
    CodeLayer,
    Injection,
    Secret,
    Pii,
    Typosquat,
    Vulnerability,
    HashMismatch,
    UnknownFile,
    ScanError,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub file: PathBuf,
    pub line: Option<usize>,
    pub message: String,
    pub severity: Severity,
    pub kind: ThreatKind,
    pub rule: String,
}

impl Finding {
    pub fn new(
        file: impl Into<PathBuf>,
        rule: impl Into<String>,
        severity: Severity,
        kind: ThreatKind,
        message: impl Into<String>,
    ) -> Self {
        Finding {
            file: file.into(),
            line: None,
            message: message.into(),
            severity,
            kind,
            rule: rule.into(),
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentityState {
    Unchecked,
    Verified,
    Mismatch,
    UnknownInRepo,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Clean,
    Flagged,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub file: PathBuf,
    pub digest: Option<String>,
    pub identity_state: IdentityState,
    pub findings: Vec<Finding>,
    pub status: FileStatus,
    sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Blocked,
    ForcedApproval,
}

#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub results: Vec<ScanResult>,
    pub verdict: Verdict,
    pub files_scanned: usize,
}

pub struct ScanOptions<'a> {
    pub root: &'a Path,
    pub repo: Option<&'a str>,
    pub force: bool,
    pub no_cache: bool,
    pub fail_on: Severity,
    pub cancel: CancelToken,
}

/// Walks `opts.root`, dispatches every regular file across a bounded worker
/// pool, and folds the per-file results into a global verdict.
pub fn run_scan(
    opts: &ScanOptions,
    config: &WardenConfig,
    signatures: Arc<SignatureStore>,
    cache: Arc<HashCache>,
    identity_client: Option<Arc<IdentityClient>>,
) -> anyhow::Result<ScanReport> {
    let files: Vec<PathBuf> = if opts.root.is_file() {
        vec![opts.root.to_path_buf()]
    } else {
        walkdir::WalkDir::new(opts.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    };

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let (work_tx, work_rx) = crossbeam_channel::bounded::<(u64, PathBuf)>(worker_count * 4);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<ScanResult>(worker_count * 4);

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let signatures = Arc::clone(&signatures);
            let cache = Arc::clone(&cache);
            let identity_client = identity_client.clone();
            let config = config;
            let repo = opts.repo;
            let fail_on = opts.fail_on;
            let cancel = opts.cancel.clone();

            scope.spawn(move || {
                for (sequence, path) in work_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let result = scan_one_file(
                        &path,
                        sequence,
                        repo,
                        config,
                        &signatures,
                        &cache,
                        identity_client.as_deref(),
                        fail_on,
                        &cancel,
                    );
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for (i, path) in files.iter().enumerate() {
            if opts.cancel.is_cancelled() || work_tx.send((i as u64, path.clone())).is_err() {
                break;
            }
        }
        drop(work_tx);

        let mut results: Vec<ScanResult> = result_rx.iter().collect();
        results.sort_by_key(|r| r.sequence);

        let filtered: Vec<ScanResult> = results
            .into_iter()
            .map(|mut r| {
                r.findings
                    .retain(|f| !config.ignored_rules.contains(&f.rule));
                r.status = status_for(&r.findings, opts.fail_on, r.identity_state);
                r
            })
            .collect();

        let verdict = determine_verdict(&filtered, opts.fail_on, opts.force);

        Ok(ScanReport {
            files_scanned: files.len(),
            results: filtered,
            verdict,
        })
    })
}

/// PASS (`Clean`) iff no finding reaches `fail_on` and identity isn't a
/// known mismatch; a scan error on the file always wins over either.
fn status_for(findings: &[Finding], fail_on: Severity, identity_state: IdentityState) -> FileStatus {
    if findings.iter().any(|f| f.kind == ThreatKind::ScanError) {
        FileStatus::Error
    } else if identity_state == IdentityState::Mismatch
        || findings.iter().any(|f| f.severity >= fail_on)
    {
        FileStatus::Flagged
    } else {
        FileStatus::Clean
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_one_file(
    path: &Path,
    sequence: u64,
    repo: Option<&str>,
    config: &WardenConfig,
    signatures: &SignatureStore,
    cache: &HashCache,
    identity_client: Option<&IdentityClient>,
    fail_on: Severity,
    cancel: &CancelToken,
) -> ScanResult {
    let span = tracing::info_span!("scan_file", file = %path.display());
    let _enter = span.enter();

    let digest = match cache.digest_of(path) {
        Ok(d) => Some(d),
        Err(e) => {
            return ScanResult {
                file: path.to_path_buf(),
                digest: None,
                identity_state: IdentityState::Error,
                findings: vec![Finding::new(
                    path,
                    "hash-error",
                    Severity::High,
                    ThreatKind::ScanError,
                    format!("failed to hash file: {e}"),
                )],
                status: FileStatus::Error,
                sequence,
            };
        }
    };

    let mut findings = Vec::new();
    let mut identity_state = IdentityState::Unchecked;

    if let (Some(client), Some(repo), Some(digest)) = (identity_client, repo, digest.as_ref()) {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        match client.verify(repo, file_name, digest) {
            Ok(identity::IdentityResult::Verified) => identity_state = IdentityState::Verified,
            Ok(identity::IdentityResult::Mismatch { expected }) => {
                identity_state = IdentityState::Mismatch;
                findings.push(Finding::new(
                    path,
                    "identity-mismatch",
                    Severity::Critical,
                    ThreatKind::HashMismatch,
                    format!("digest does not match registry record (expected {expected})"),
                ));
            }
            Ok(identity::IdentityResult::UnknownInRepo) => {
                identity_state = IdentityState::UnknownInRepo;
            }
            Err(e) => {
                identity_state = IdentityState::Error;
                tracing::warn!(error = %e, "identity check failed, continuing");
                findings.push(Finding::new(
                    path,
                    "identity-transport-error",
                    Severity::Warning,
                    ThreatKind::ScanError,
                    format!("identity verification request failed: {e}"),
                ));
            }
        }
    }

    findings.extend(engines::dispatch(path, config, signatures, cancel));

    ScanResult {
        file: path.to_path_buf(),
        digest,
        identity_state,
        status: status_for(&findings, fail_on, identity_state),
        findings,
        sequence,
    }
}

fn determine_verdict(results: &[ScanResult], fail_on: Severity, force: bool) -> Verdict {
    let blocking = results
        .iter()
        .flat_map(|r| &r.findings)
        .any(|f| f.severity >= fail_on)
        || results
            .iter()
            .any(|r| r.identity_state == IdentityState::Mismatch);

    if !blocking {
        Verdict::Pass
    } else if force {
        Verdict::ForcedApproval
    } else {
        Verdict::Blocked
    }
}
