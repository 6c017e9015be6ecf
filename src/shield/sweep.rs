//! Sweep orchestrator: walk a root, protect, inspect, classify, rescue, purge.
//!
//! Per-archive state machine:
//!
//! ```text
//! Discovered ─┬─> Protected                      (marker or protected glob)
//!             └─> Inspecting ─┬─> InspectFailed  (listing failed)
//!                             ├─> Safe           (no garbage, or a safe tool)
//!                             └─> rescue ─> ledger ─> delete | isolate
//! ```
//!
//! Deletion happens only after every keep extension was attempted and the
//! ledger append returned. Archives share nothing but the ledger and the
//! filesystem, so `parallelism > 1` fans them out over scoped worker threads.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::core::errors::{Result, SspError};
use crate::core::paths::{ensure_safe_sweep_root, resolve_absolute_path};
use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle};
use crate::shield::engine::{ArchiveEngine, ExtractionOutcome};
use crate::shield::extractor::{RescueReport, SelectiveExtractor};
use crate::shield::ledger::{ExclusionLedger, LedgerWrite};
use crate::shield::protection::{ProtectionReason, ProtectionRules};
use crate::shield::rules::{ContentClassifier, KeepExtensionSet, RuleSet};
use crate::shield::walker::{ArchiveFile, ArchiveWalker, WalkerConfig};

/// Directory under the sweep root that receives isolated archives.
pub const ISOLATION_DIR: &str = "_risk_tools";

// ──────────────────── policy ────────────────────

/// What happens to a garbage archive after its rescue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPolicy {
    /// Delete the original.
    #[default]
    Purge,
    /// Move the original into `<root>/_risk_tools/`.
    Isolate,
}

impl SweepPolicy {
    /// Config and CLI spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Purge => "purge",
            Self::Isolate => "isolate",
        }
    }
}

impl fmt::Display for SweepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "purge" | "delete" => Ok(Self::Purge),
            "isolate" | "quarantine" => Ok(Self::Isolate),
            other => Err(format!("unknown sweep policy {other:?} (expected purge or isolate)")),
        }
    }
}

// ──────────────────── configuration ────────────────────

/// Everything one sweep needs besides the engine and the ledger.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Delete or isolate garbage originals.
    pub policy: SweepPolicy,
    /// Classify only; touch nothing.
    pub dry_run: bool,
    /// Worker threads; clamped to at least one.
    pub parallelism: usize,
    /// Keep the original when any keep-extension extraction fails.
    pub abort_on_extract_error: bool,
    /// Create a missing ledger file before the first append.
    pub create_ledger: bool,
    /// Archive discovery settings.
    pub walker: WalkerConfig,
    /// Markers and globs that exempt archives.
    pub protection: ProtectionRules,
    /// Classification patterns and keep extensions.
    pub rules: RuleSet,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            policy: SweepPolicy::Purge,
            dry_run: false,
            parallelism: 1,
            abort_on_extract_error: false,
            create_ledger: false,
            walker: WalkerConfig::default(),
            protection: ProtectionRules::default(),
            rules: RuleSet::default(),
        }
    }
}

impl SweepConfig {
    /// Derive sweep settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let shield = &config.shield;
        Ok(Self {
            policy: shield.policy,
            dry_run: false,
            parallelism: shield.parallelism.max(1),
            abort_on_extract_error: shield.abort_on_extract_error,
            create_ledger: shield.create_ledger,
            walker: WalkerConfig::new(&shield.archive_extensions, &shield.excluded_dirs),
            protection: ProtectionRules::new(&shield.protect_markers, &shield.protected_paths)?,
            rules: config.rules.clone(),
        })
    }
}

// ──────────────────── outcomes ────────────────────

/// Final disposition of a garbage archive's original file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Disposal {
    /// Original removed.
    Deleted,
    /// Original moved under `_risk_tools/`.
    Isolated {
        /// New location of the original.
        destination: PathBuf,
    },
    /// Original still on disk next to its rescued siblings.
    Failed {
        /// `SSP-NNNN` code of the failure.
        error_code: String,
        /// Failure description.
        message: String,
        /// Transient failure; the next sweep will try again.
        retryable: bool,
    },
}

/// Terminal state of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    /// Skipped before listing.
    Protected {
        /// Marker or glob that matched.
        reason: ProtectionReason,
    },
    /// Listed and left alone.
    Safe {
        /// Classifier label, `clean` or `safe-tool`.
        verdict: String,
        /// Safe pattern that vetoed the purge.
        #[serde(skip_serializing_if = "Option::is_none")]
        safe_hit: Option<String>,
    },
    /// Listing failed; the archive is untouched.
    InspectFailed {
        /// `SSP-NNNN` code of the failure.
        error_code: String,
        /// Failure description.
        message: String,
        /// Transient failure; the next sweep will try again.
        retryable: bool,
    },
    /// Garbage handled: siblings rescued, ledger written, original disposed of.
    GarbagePurged {
        /// Garbage pattern that matched.
        rule: Option<String>,
        /// Per-extension extraction results.
        rescue: RescueReport,
        /// Ledger append result.
        ledger: LedgerWrite,
        /// What happened to the original.
        disposal: Disposal,
    },
    /// Garbage, but a keep-extension extraction failed and the policy keeps it.
    RescueIncomplete {
        /// Garbage pattern that matched.
        rule: Option<String>,
        /// Per-extension extraction results.
        rescue: RescueReport,
    },
    /// Garbage, but the ledger append failed; the original is kept.
    LedgerFailed {
        /// Garbage pattern that matched.
        rule: Option<String>,
        /// Per-extension extraction results.
        rescue: RescueReport,
        /// `SSP-NNNN` code of the failure.
        error_code: String,
        /// Failure description.
        message: String,
    },
    /// Dry run: garbage detected, nothing touched.
    WouldPurge {
        /// Garbage pattern that matched.
        rule: Option<String>,
        /// Policy a real run would apply.
        policy: SweepPolicy,
    },
}

impl ArchiveOutcome {
    /// Short label used for log tags and report summaries.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Protected { .. } => "protected",
            Self::Safe { .. } => "safe",
            Self::InspectFailed { .. } => "inspect_failed",
            Self::GarbagePurged {
                disposal: Disposal::Deleted,
                ..
            } => "purged",
            Self::GarbagePurged {
                disposal: Disposal::Isolated { .. },
                ..
            } => "isolated",
            Self::GarbagePurged {
                disposal: Disposal::Failed { .. },
                ..
            } => "deletion_failed",
            Self::RescueIncomplete { .. } => "rescue_incomplete",
            Self::LedgerFailed { .. } => "ledger_failed",
            Self::WouldPurge { .. } => "would_purge",
        }
    }

    /// True when the archive was classified as garbage (whatever happened next).
    pub const fn is_flagged(&self) -> bool {
        matches!(
            self,
            Self::GarbagePurged { .. }
                | Self::RescueIncomplete { .. }
                | Self::LedgerFailed { .. }
                | Self::WouldPurge { .. }
        )
    }

    /// Extraction results, when a rescue ran.
    pub const fn rescue(&self) -> Option<&RescueReport> {
        match self {
            Self::GarbagePurged { rescue, .. }
            | Self::RescueIncomplete { rescue, .. }
            | Self::LedgerFailed { rescue, .. } => Some(rescue),
            _ => None,
        }
    }
}

/// One processed archive.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    /// Archive location.
    pub archive: ArchiveFile,
    /// What the sweep did with it.
    pub outcome: ArchiveOutcome,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Canonical sweep root.
    pub root: PathBuf,
    /// Policy in effect.
    pub policy: SweepPolicy,
    /// Nothing was modified.
    pub dry_run: bool,
    /// Engine description.
    pub engine: String,
    /// Short hash of the rule set.
    pub rules_fingerprint: String,
    /// Archives found by the walker.
    pub discovered: usize,
    /// Archives that reached a terminal state.
    pub scanned: usize,
    /// Archives exempted by protection rules.
    pub protected: usize,
    /// Archives listed and left alone.
    pub safe: usize,
    /// Archives classified as garbage.
    pub flagged: usize,
    /// Garbage originals deleted.
    pub purged: usize,
    /// Garbage originals moved to `_risk_tools/`.
    pub isolated: usize,
    /// Listing failures.
    pub inspect_failures: usize,
    /// Originals that could not be deleted or moved.
    pub deletion_failures: usize,
    /// Originals kept because a rescue failed.
    pub rescue_incomplete: usize,
    /// Originals kept because the ledger append failed.
    pub ledger_failures: usize,
    /// Purges done without a ledger line because the ledger file is missing.
    pub ledger_skips: usize,
    /// Extraction calls issued.
    pub extraction_attempts: usize,
    /// Extraction calls that extracted something.
    pub extraction_successes: usize,
    /// Per-archive outcomes in completion order.
    pub records: Vec<ArchiveRecord>,
    /// Archives never processed because the sweep was interrupted.
    pub unscanned: Vec<PathBuf>,
    /// False when the sweep was interrupted.
    pub completed: bool,
    /// Wall-clock duration.
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl SweepReport {
    /// Archives whose processing hit a failure the operator should look at.
    pub fn failure_count(&self) -> usize {
        self.inspect_failures + self.deletion_failures + self.rescue_incomplete + self.ledger_failures
    }

    fn tally(&mut self) {
        for record in &self.records {
            self.scanned += 1;
            match &record.outcome {
                ArchiveOutcome::Protected { .. } => self.protected += 1,
                ArchiveOutcome::Safe { .. } => self.safe += 1,
                ArchiveOutcome::InspectFailed { .. } => self.inspect_failures += 1,
                ArchiveOutcome::GarbagePurged {
                    ledger, disposal, ..
                } => {
                    if *ledger == LedgerWrite::SkippedMissing {
                        self.ledger_skips += 1;
                    }
                    match disposal {
                        Disposal::Deleted => self.purged += 1,
                        Disposal::Isolated { .. } => self.isolated += 1,
                        Disposal::Failed { .. } => self.deletion_failures += 1,
                    }
                }
                ArchiveOutcome::RescueIncomplete { .. } => self.rescue_incomplete += 1,
                ArchiveOutcome::LedgerFailed { .. } => self.ledger_failures += 1,
                ArchiveOutcome::WouldPurge { .. } => {}
            }
            if record.outcome.is_flagged() {
                self.flagged += 1;
            }
            if let Some(rescue) = record.outcome.rescue() {
                self.extraction_attempts += rescue.attempt_count();
                self.extraction_successes += rescue.extracted_count();
            }
        }
    }
}

// ──────────────────── orchestrator ────────────────────

/// Drives one sweep. The engine is chosen once by the caller and borrowed.
pub struct SweepOrchestrator<'a> {
    engine: &'a dyn ArchiveEngine,
    ledger: &'a ExclusionLedger,
    config: SweepConfig,
    classifier: ContentClassifier,
    keep: KeepExtensionSet,
    logger: Option<ActivityLoggerHandle>,
    cancel: Arc<AtomicBool>,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl<'a> SweepOrchestrator<'a> {
    /// Compile the classifier and keep set once for the whole sweep.
    pub fn new(engine: &'a dyn ArchiveEngine, ledger: &'a ExclusionLedger, config: SweepConfig) -> Self {
        let classifier = config.rules.classifier();
        let keep = config.rules.keep_extension_set();
        Self {
            engine,
            ledger,
            config,
            classifier,
            keep,
            logger: None,
            cancel: Arc::new(AtomicBool::new(false)),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Send per-archive events to the activity log.
    #[must_use]
    pub fn with_logger(mut self, logger: Option<ActivityLoggerHandle>) -> Self {
        self.logger = logger;
        self
    }

    /// Share an interrupt flag; it is checked before each archive.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sweep every archive under `root`.
    ///
    /// Only an unsafe or unreadable root stops the sweep; per-archive failures
    /// are recorded in the report.
    pub fn run(&self, root: &Path) -> Result<SweepReport> {
        let start = Instant::now();
        ensure_safe_sweep_root(root)?;
        let root = resolve_absolute_path(root);
        let fingerprint = self.config.rules.fingerprint();

        if self.config.create_ledger && !self.config.dry_run {
            self.ledger.ensure_exists()?;
        }

        self.log(ActivityEvent::SweepStarted {
            root: root.to_string_lossy().into_owned(),
            policy: self.config.policy.to_string(),
            dry_run: self.config.dry_run,
            engine: self.engine.describe(),
            rules_fingerprint: fingerprint.clone(),
        });

        let archives = ArchiveWalker::new(self.config.walker.clone()).collect(&root)?;
        let discovered = archives.len();

        let outcomes = if self.config.parallelism > 1 && archives.len() > 1 {
            self.process_parallel(&root, &archives)
        } else {
            self.process_sequential(&root, &archives)
        };

        let mut report = SweepReport {
            root: root.clone(),
            policy: self.config.policy,
            dry_run: self.config.dry_run,
            engine: self.engine.describe(),
            rules_fingerprint: fingerprint,
            discovered,
            ..SweepReport::default()
        };
        for (archive, outcome) in archives.into_iter().zip(outcomes) {
            match outcome {
                Some(outcome) => report.records.push(ArchiveRecord { archive, outcome }),
                None => report.unscanned.push(archive.absolute),
            }
        }
        report.tally();
        report.completed = report.unscanned.is_empty();
        report.elapsed = start.elapsed();

        #[allow(clippy::cast_possible_truncation)]
        self.log(ActivityEvent::SweepCompleted {
            root: root.to_string_lossy().into_owned(),
            discovered: report.discovered,
            purged: report.purged,
            isolated: report.isolated,
            failures: report.failure_count(),
            completed: report.completed,
            duration_ms: report.elapsed.as_millis() as u64,
            rules_fingerprint: report.rules_fingerprint.clone(),
        });
        Ok(report)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn process_sequential(&self, root: &Path, archives: &[ArchiveFile]) -> Vec<Option<ArchiveOutcome>> {
        archives
            .iter()
            .map(|archive| {
                if self.is_cancelled() {
                    None
                } else {
                    self.process_claimed(root, archive)
                }
            })
            .collect()
    }

    fn process_parallel(&self, root: &Path, archives: &[ArchiveFile]) -> Vec<Option<ArchiveOutcome>> {
        let workers = self.config.parallelism.min(archives.len());
        let (work_tx, work_rx) = channel::bounded::<(usize, &ArchiveFile)>(workers * 4);
        let results: Mutex<Vec<Option<ArchiveOutcome>>> = Mutex::new(vec![None; archives.len()]);

        thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let results = &results;
                scope.spawn(move || {
                    for (idx, archive) in work_rx {
                        if self.is_cancelled() {
                            continue;
                        }
                        let outcome = self.process_claimed(root, archive);
                        results.lock()[idx] = outcome;
                    }
                });
            }
            drop(work_rx);
            for item in archives.iter().enumerate() {
                if work_tx.send(item).is_err() {
                    break;
                }
            }
            drop(work_tx);
        });

        results.into_inner()
    }

    /// Process an archive unless another worker already holds its path.
    fn process_claimed(&self, root: &Path, archive: &ArchiveFile) -> Option<ArchiveOutcome> {
        if !self.in_flight.lock().insert(archive.absolute.clone()) {
            return None;
        }
        let outcome = self.process_archive(root, archive);
        self.in_flight.lock().remove(&archive.absolute);
        Some(outcome)
    }

    /// Run one archive through the state machine.
    pub fn process_archive(&self, root: &Path, archive: &ArchiveFile) -> ArchiveOutcome {
        let path_label = archive.relative_slash();

        if let Some(reason) = self.config.protection.check(&archive.relative, &archive.absolute) {
            self.log(ActivityEvent::ArchiveProtected {
                path: path_label,
                reason: reason.to_string(),
            });
            return ArchiveOutcome::Protected { reason };
        }

        let listing = match self.engine.list_entries(&archive.absolute) {
            Ok(listing) => listing,
            Err(err) => {
                self.log(ActivityEvent::InspectFailed {
                    path: path_label,
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                });
                return ArchiveOutcome::InspectFailed {
                    error_code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                };
            }
        };

        let verdict = self.classifier.classify(listing.as_str());
        if !verdict.warrants_purge() {
            self.log(ActivityEvent::ArchiveSafe {
                path: path_label,
                verdict: verdict.label().to_string(),
                rule: verdict.safe_hit.clone(),
            });
            return ArchiveOutcome::Safe {
                verdict: verdict.label().to_string(),
                safe_hit: verdict.safe_hit,
            };
        }
        let rule = verdict.garbage_hit;

        if self.config.dry_run {
            self.log_disposal(&path_label, &rule, None, 0, 0, true);
            return ArchiveOutcome::WouldPurge {
                rule,
                policy: self.config.policy,
            };
        }

        let rescue = SelectiveExtractor::new(self.engine, &self.keep).rescue(&archive.absolute, &archive.parent);
        for failed in rescue.failures() {
            if let ExtractionOutcome::ToolError { details } = &failed.outcome {
                self.log(ActivityEvent::ExtractionAttemptFailed {
                    path: path_label.clone(),
                    extension: failed.extension.clone(),
                    details: details.clone(),
                });
            }
        }
        if self.config.abort_on_extract_error && rescue.has_tool_errors() {
            self.log(ActivityEvent::ArchiveKept {
                path: path_label,
                details: format!(
                    "{} of {} keep extensions failed to extract",
                    rescue.tool_error_count(),
                    rescue.attempt_count()
                ),
            });
            return ArchiveOutcome::RescueIncomplete { rule, rescue };
        }

        let ledger = match self.ledger.append(&path_label) {
            Ok(write) => write,
            Err(err) => {
                self.log(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                return ArchiveOutcome::LedgerFailed {
                    rule,
                    rescue,
                    error_code: err.code().to_string(),
                    message: err.to_string(),
                };
            }
        };
        if ledger == LedgerWrite::SkippedMissing {
            self.log(ActivityEvent::LedgerWriteSkipped {
                path: path_label.clone(),
                ledger: self.ledger.path().to_string_lossy().into_owned(),
            });
        }

        let disposal = match self.dispose(root, archive) {
            Ok(disposal) => disposal,
            Err(err) => {
                self.log(ActivityEvent::DeletionFailed {
                    path: path_label.clone(),
                    error_code: err.code().to_string(),
                    error_message: err.to_string(),
                });
                Disposal::Failed {
                    error_code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                }
            }
        };
        match &disposal {
            Disposal::Deleted => {
                self.log_disposal(&path_label, &rule, None, rescue.extracted_count(), rescue.attempt_count(), false);
            }
            Disposal::Isolated { destination } => {
                self.log_disposal(
                    &path_label,
                    &rule,
                    Some(destination),
                    rescue.extracted_count(),
                    rescue.attempt_count(),
                    false,
                );
            }
            Disposal::Failed { .. } => {}
        }

        ArchiveOutcome::GarbagePurged {
            rule,
            rescue,
            ledger,
            disposal,
        }
    }

    fn dispose(&self, root: &Path, archive: &ArchiveFile) -> Result<Disposal> {
        match self.config.policy {
            SweepPolicy::Purge => {
                fs::remove_file(&archive.absolute).map_err(|err| SspError::DeletionFailed {
                    path: archive.absolute.clone(),
                    details: err.to_string(),
                })?;
                if archive.absolute.exists() {
                    return Err(SspError::DeletionFailed {
                        path: archive.absolute.clone(),
                        details: "path still exists after removal".to_string(),
                    });
                }
                Ok(Disposal::Deleted)
            }
            SweepPolicy::Isolate => {
                let destination = isolate_archive(root, &archive.absolute)?;
                Ok(Disposal::Isolated { destination })
            }
        }
    }

    fn log_disposal(
        &self,
        path: &str,
        rule: &Option<String>,
        destination: Option<&Path>,
        extracted: usize,
        attempted: usize,
        dry_run: bool,
    ) {
        let event = match (self.config.policy, destination) {
            (SweepPolicy::Isolate, destination) => ActivityEvent::ArchiveIsolated {
                path: path.to_string(),
                destination: destination
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                rule: rule.clone(),
                extracted,
                attempted,
                dry_run,
            },
            (SweepPolicy::Purge, _) => ActivityEvent::ArchivePurged {
                path: path.to_string(),
                rule: rule.clone(),
                extracted,
                attempted,
                dry_run,
            },
        };
        self.log(event);
    }

    fn log(&self, event: ActivityEvent) {
        if let Some(logger) = &self.logger {
            logger.send(event);
        }
    }
}

/// Move `archive` into `<root>/_risk_tools/`, never overwriting an earlier
/// isolate of the same name, and verify the move.
fn isolate_archive(root: &Path, archive: &Path) -> Result<PathBuf> {
    let dir = root.join(ISOLATION_DIR);
    fs::create_dir_all(&dir).map_err(|source| SspError::io(&dir, source))?;

    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    let mut destination = dir.join(&name);
    let mut n = 1;
    while destination.exists() {
        destination = dir.join(format!("{n}-{name}"));
        n += 1;
    }

    fs::rename(archive, &destination).map_err(|err| SspError::DeletionFailed {
        path: archive.to_path_buf(),
        details: format!("move to {} failed: {err}", destination.display()),
    })?;
    if archive.exists() || !destination.is_file() {
        return Err(SspError::DeletionFailed {
            path: archive.to_path_buf(),
            details: format!("move to {} could not be verified", destination.display()),
        });
    }
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shield::engine::ContentListing;
    use filetime::FileTime;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Listings and entry names keyed by archive file name.
    #[derive(Default)]
    struct FakeEngine {
        entries: HashMap<String, Vec<String>>,
        broken: HashSet<String>,
        failing_ext: Option<String>,
        list_calls: AtomicUsize,
    }

    impl FakeEngine {
        fn with(mut self, archive: &str, entries: &[&str]) -> Self {
            self.entries
                .insert(archive.to_string(), entries.iter().map(|e| (*e).to_string()).collect());
            self
        }

        fn broken(mut self, archive: &str) -> Self {
            self.broken.insert(archive.to_string());
            self
        }

        fn key(path: &Path) -> String {
            path.file_name().unwrap().to_string_lossy().into_owned()
        }
    }

    impl ArchiveEngine for FakeEngine {
        fn describe(&self) -> String {
            "fake".to_string()
        }

        fn list_entries(&self, archive: &Path) -> Result<ContentListing> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let key = Self::key(archive);
            if self.broken.contains(&key) {
                return Err(SspError::ListingFailed {
                    path: archive.to_path_buf(),
                    details: "exit 2: Can not open the file as archive".to_string(),
                });
            }
            let entries = self.entries.get(&key).cloned().unwrap_or_default();
            Ok(ContentListing::new(entries.join("\n")))
        }

        fn extract_by_pattern(&self, archive: &Path, ext: &str, dest: &Path) -> ExtractionOutcome {
            if self.failing_ext.as_deref() == Some(ext) {
                return ExtractionOutcome::ToolError {
                    details: "exit 2: Data Error".to_string(),
                };
            }
            let entries = self.entries.get(&Self::key(archive)).cloned().unwrap_or_default();
            let mut hit = false;
            for entry in entries.iter().filter(|e| e.ends_with(ext)) {
                let base = Path::new(entry).file_name().unwrap();
                fs::write(dest.join(base), format!("from {entry}")).unwrap();
                hit = true;
            }
            if hit {
                ExtractionOutcome::Extracted
            } else {
                ExtractionOutcome::NotFound
            }
        }
    }

    struct Fixture {
        tmp: TempDir,
        ledger: ExclusionLedger,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("mirror")).unwrap();
            let ledger = ExclusionLedger::new(tmp.path().join("exclude.txt"));
            Self { tmp, ledger }
        }

        fn root(&self) -> PathBuf {
            resolve_absolute_path(&self.tmp.path().join("mirror"))
        }

        fn archive(&self, rel: &str) -> PathBuf {
            let path = self.root().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"PK\x03\x04").unwrap();
            path
        }

        fn sweep(&self, engine: &FakeEngine, config: SweepConfig) -> SweepReport {
            SweepOrchestrator::new(engine, &self.ledger, config)
                .run(&self.root())
                .unwrap()
        }
    }

    fn crack_engine() -> FakeEngine {
        FakeEngine::default().with(
            "tool_crack_patch.zip",
            &["crack.exe", "docs/readme.txt", "boards/board.brd"],
        )
    }

    #[test]
    fn policy_parses_and_displays() {
        assert_eq!("Purge".parse::<SweepPolicy>().unwrap(), SweepPolicy::Purge);
        assert_eq!("isolate".parse::<SweepPolicy>().unwrap(), SweepPolicy::Isolate);
        assert!("shred".parse::<SweepPolicy>().is_err());
        assert_eq!(SweepPolicy::Isolate.to_string(), "isolate");
    }

    #[test]
    fn garbage_archive_is_rescued_logged_and_deleted() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("downloads/tool_crack_patch.zip");

        let report = fx.sweep(&crack_engine(), SweepConfig::default());

        assert!(!archive.exists());
        let downloads = fx.root().join("downloads");
        assert!(downloads.join("board.brd").is_file());
        assert!(downloads.join("readme.txt").is_file());
        assert!(!downloads.join("crack.exe").exists());
        assert_eq!(
            fx.ledger.entries().unwrap(),
            vec!["downloads/tool_crack_patch.zip".to_string()]
        );
        assert_eq!(report.purged, 1);
        assert_eq!(report.flagged, 1);
        assert_eq!(report.extraction_attempts, KeepExtensionSet::default().len());
        assert_eq!(report.extraction_successes, 2);
        assert!(report.completed);
        match &report.records[0].outcome {
            ArchiveOutcome::GarbagePurged { rule, ledger, .. } => {
                assert_eq!(rule.as_deref(), Some("crack"));
                assert_eq!(*ledger, LedgerWrite::Appended);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn bios_archive_is_never_listed_or_touched() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("downloads/bios_ami_flash_update.zip");
        let before = FileTime::from_last_modification_time(&fs::metadata(&archive).unwrap());
        let engine = FakeEngine::default().with("bios_ami_flash_update.zip", &["crack.exe", "afuwin.exe"]);

        let report = fx.sweep(&engine, SweepConfig::default());

        assert!(archive.exists());
        let after = FileTime::from_last_modification_time(&fs::metadata(&archive).unwrap());
        assert_eq!(before, after);
        assert_eq!(engine.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.protected, 1);
        assert!(fx.ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn safe_tool_suppresses_purge() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("flashers/pack.zip");
        let engine = FakeEngine::default().with("pack.zip", &["keygen.exe", "AFUDOS.EXE", "image.rom"]);

        let report = fx.sweep(&engine, SweepConfig::default());

        assert!(archive.exists());
        assert!(!fx.root().join("flashers/image.rom").exists());
        assert_eq!(report.safe, 1);
        assert!(fx.ledger.entries().unwrap().is_empty());
        assert!(matches!(
            &report.records[0].outcome,
            ArchiveOutcome::Safe { verdict, .. } if verdict == "safe-tool"
        ));
    }

    #[test]
    fn clean_archive_is_left_alone() {
        let fx = Fixture::new();
        let archive = fx.archive("boards/x.7z");
        let engine = FakeEngine::default().with("x.7z", &["board.brd", "notes.txt"]);
        let report = fx.sweep(&engine, SweepConfig::default());
        assert!(archive.exists());
        assert_eq!(report.safe, 1);
        assert_eq!(report.flagged, 0);
    }

    #[test]
    fn listing_failure_skips_archive_and_continues() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let broken = fx.archive("a/broken.zip");
        let garbage = fx.archive("b/tool_crack_patch.zip");
        let engine = crack_engine().broken("broken.zip");

        let report = fx.sweep(&engine, SweepConfig::default());

        assert!(broken.exists());
        assert!(!garbage.exists());
        assert_eq!(report.inspect_failures, 1);
        assert_eq!(report.purged, 1);
        assert!(matches!(
            &report.records[0].outcome,
            ArchiveOutcome::InspectFailed { error_code, .. } if error_code == "SSP-2002"
        ));
    }

    #[test]
    fn missing_ledger_still_purges_without_record() {
        let fx = Fixture::new();
        let archive = fx.archive("downloads/tool_crack_patch.zip");

        let report = fx.sweep(&crack_engine(), SweepConfig::default());

        assert!(!archive.exists());
        assert!(!fx.ledger.exists());
        assert_eq!(report.ledger_skips, 1);
        assert_eq!(report.purged, 1);
    }

    #[test]
    fn create_ledger_records_first_purge() {
        let fx = Fixture::new();
        fx.archive("downloads/tool_crack_patch.zip");
        let config = SweepConfig {
            create_ledger: true,
            ..SweepConfig::default()
        };
        let report = fx.sweep(&crack_engine(), config);
        assert_eq!(report.ledger_skips, 0);
        assert_eq!(fx.ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("downloads/tool_crack_patch.zip");
        let config = SweepConfig {
            dry_run: true,
            create_ledger: true,
            ..SweepConfig::default()
        };

        let report = fx.sweep(&crack_engine(), config);

        assert!(archive.exists());
        assert!(!fx.root().join("downloads/board.brd").exists());
        assert!(fx.ledger.entries().unwrap().is_empty());
        assert_eq!(report.flagged, 1);
        assert_eq!(report.purged, 0);
        assert!(report.dry_run);
        assert_eq!(report.records[0].outcome.label(), "would_purge");
    }

    #[test]
    fn isolate_moves_archive_into_risk_dir() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("downloads/tool_crack_patch.zip");
        let config = SweepConfig {
            policy: SweepPolicy::Isolate,
            ..SweepConfig::default()
        };

        let report = fx.sweep(&crack_engine(), config);

        let isolated = fx.root().join(ISOLATION_DIR).join("tool_crack_patch.zip");
        assert!(!archive.exists());
        assert!(isolated.is_file());
        assert!(fx.root().join("downloads/board.brd").is_file());
        assert_eq!(report.isolated, 1);
        assert_eq!(fx.ledger.entries().unwrap().len(), 1);

        // Isolated archives are not swept again.
        let again = fx.sweep(&crack_engine(), SweepConfig::default());
        assert_eq!(again.discovered, 0);
        assert!(isolated.is_file());
    }

    #[test]
    fn isolate_never_overwrites_previous_isolate() {
        let fx = Fixture::new();
        let root = fx.root();
        let first = fx.archive("a/dup.zip");
        let second = fx.archive("b/dup.zip");
        let d1 = isolate_archive(&root, &first).unwrap();
        let d2 = isolate_archive(&root, &second).unwrap();
        assert_ne!(d1, d2);
        assert!(d1.is_file() && d2.is_file());
    }

    #[test]
    fn abort_on_extract_error_keeps_archive() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("downloads/tool_crack_patch.zip");
        let mut engine = crack_engine();
        engine.failing_ext = Some(".pdf".to_string());
        let config = SweepConfig {
            abort_on_extract_error: true,
            ..SweepConfig::default()
        };

        let report = fx.sweep(&engine, config);

        assert!(archive.exists());
        assert!(fx.ledger.entries().unwrap().is_empty());
        assert_eq!(report.rescue_incomplete, 1);
        assert_eq!(report.failure_count(), 1);
    }

    #[test]
    fn extraction_errors_do_not_block_purge_by_default() {
        let fx = Fixture::new();
        let archive = fx.archive("downloads/tool_crack_patch.zip");
        let mut engine = crack_engine();
        engine.failing_ext = Some(".brd".to_string());

        let report = fx.sweep(&engine, SweepConfig::default());

        assert!(!archive.exists());
        assert!(fx.root().join("downloads/readme.txt").is_file());
        assert_eq!(report.purged, 1);
    }

    #[cfg(unix)]
    #[test]
    fn deletion_failure_is_recorded_and_rerun_reaches_same_outcome() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let archive = fx.archive("locked/tool_crack_patch.zip");
        let dir = archive.parent().unwrap().to_path_buf();
        // Read-only directory: extraction and removal both fail.
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(dir.join("writable"), b"").is_ok() {
            // Running as root; permissions are not enforced.
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let engine = FakeEngine::default().with("tool_crack_patch.zip", &["crack.exe"]);
        let first = fx.sweep(&engine, SweepConfig::default());
        let second = fx.sweep(&engine, SweepConfig::default());
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(archive.exists());
        assert_eq!(first.deletion_failures, 1);
        assert_eq!(second.deletion_failures, 1);
        assert_eq!(first.records[0].outcome.label(), second.records[0].outcome.label());
    }

    #[test]
    fn rerun_after_partial_rescue_is_idempotent() {
        let fx = Fixture::new();
        let archive = fx.archive("downloads/tool_crack_patch.zip");
        // Siblings already rescued by an interrupted earlier run.
        fs::write(fx.root().join("downloads/board.brd"), b"old").unwrap();

        let report = fx.sweep(&crack_engine(), SweepConfig::default());

        assert!(!archive.exists());
        assert_eq!(report.purged, 1);
        assert!(fx.root().join("downloads/board.brd").is_file());
    }

    #[test]
    fn protected_glob_exempts_archive() {
        let fx = Fixture::new();
        let archive = fx.archive("vendor/keep/tool_crack_patch.zip");
        let config = SweepConfig {
            protection: ProtectionRules::new(&["bios".to_string()], &["vendor/keep/**".to_string()]).unwrap(),
            ..SweepConfig::default()
        };
        let report = fx.sweep(&crack_engine(), config);
        assert!(archive.exists());
        assert_eq!(report.protected, 1);
    }

    #[test]
    fn cancelled_sweep_lists_unscanned_archives() {
        let fx = Fixture::new();
        fx.archive("a/one.zip");
        fx.archive("b/two.zip");
        let engine = FakeEngine::default();
        let cancel = Arc::new(AtomicBool::new(true));

        let report = SweepOrchestrator::new(&engine, &fx.ledger, SweepConfig::default())
            .with_cancel_flag(Arc::clone(&cancel))
            .run(&fx.root())
            .unwrap();

        assert!(!report.completed);
        assert_eq!(report.discovered, 2);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.unscanned.len(), 2);
    }

    #[test]
    fn parallel_sweep_matches_sequential_outcomes() {
        let fx = Fixture::new();
        fx.ledger.ensure_exists().unwrap();
        let mut engine = FakeEngine::default();
        for i in 0..24 {
            let name = format!("tool_{i:02}.zip");
            fx.archive(&format!("d{}/{name}", i % 4));
            engine = if i % 3 == 0 {
                engine.with(&name, &["loader.exe", "board.brd"])
            } else {
                engine.with(&name, &["board.brd"])
            };
        }
        let config = SweepConfig {
            parallelism: 4,
            ..SweepConfig::default()
        };

        let report = fx.sweep(&engine, config);

        assert_eq!(report.discovered, 24);
        assert_eq!(report.scanned, 24);
        assert_eq!(report.purged, 8);
        assert_eq!(report.safe, 16);
        assert_eq!(engine.list_calls.load(Ordering::SeqCst), 24);
        let mut entries = fx.ledger.entries().unwrap();
        entries.sort();
        entries.dedup();
        assert_eq!(entries.len(), 8);
        // Records keep walk order regardless of worker scheduling.
        let rels: Vec<String> = report.records.iter().map(|r| r.archive.relative_slash()).collect();
        let mut sorted = rels.clone();
        sorted.sort();
        assert_eq!(rels, sorted);
    }

    #[test]
    fn unsafe_root_is_refused() {
        let fx = Fixture::new();
        let engine = FakeEngine::default();
        let err = SweepOrchestrator::new(&engine, &fx.ledger, SweepConfig::default())
            .run(Path::new("/"))
            .unwrap_err();
        assert_eq!(err.code(), "SSP-2005");
    }

    #[test]
    fn report_serializes_outcome_states() {
        let fx = Fixture::new();
        fx.archive("downloads/tool_crack_patch.zip");
        fx.archive("bios/x.zip");
        let report = fx.sweep(&crack_engine(), SweepConfig::default());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["records"][0]["outcome"]["state"], "protected");
        assert_eq!(json["records"][1]["outcome"]["state"], "garbage_purged");
        assert_eq!(json["records"][1]["outcome"]["disposal"]["status"], "deleted");
        assert!(json["elapsed_ms"].is_u64());
    }
}
