//! Background activity logger.
//!
//! Sweep workers and the sync driver hand `ActivityEvent`s to a bounded
//! channel; one `ssp-logger` thread drains it into the JSONL file and, when
//! built with `sqlite`, the history database. Senders never block: a full
//! channel drops the event and bumps a counter that the logger thread reports
//! on its next write.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::PathsConfig;
use crate::core::errors::{Result, SspError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::{ActivityRow, SqliteLogger};

const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// SQLite is abandoned for the rest of the run after this many failed inserts in a row.
#[cfg(feature = "sqlite")]
const MAX_SQLITE_STRIKES: u32 = 3;

/// Everything the CLI, the sweep, and the sync driver report.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    SweepStarted {
        root: String,
        policy: String,
        dry_run: bool,
        engine: String,
        rules_fingerprint: String,
    },
    SweepCompleted {
        root: String,
        discovered: usize,
        purged: usize,
        isolated: usize,
        failures: usize,
        completed: bool,
        duration_ms: u64,
        rules_fingerprint: String,
    },
    ArchiveProtected {
        path: String,
        reason: String,
    },
    ArchiveSafe {
        path: String,
        verdict: String,
        rule: Option<String>,
    },
    InspectFailed {
        path: String,
        error_code: String,
        error_message: String,
    },
    ExtractionAttemptFailed {
        path: String,
        extension: String,
        details: String,
    },
    ArchivePurged {
        path: String,
        rule: Option<String>,
        extracted: usize,
        attempted: usize,
        dry_run: bool,
    },
    ArchiveIsolated {
        path: String,
        destination: String,
        rule: Option<String>,
        extracted: usize,
        attempted: usize,
        dry_run: bool,
    },
    /// Garbage detected but the archive was kept because rescue was incomplete.
    ArchiveKept {
        path: String,
        details: String,
    },
    DeletionFailed {
        path: String,
        error_code: String,
        error_message: String,
    },
    LedgerWriteSkipped {
        path: String,
        ledger: String,
    },
    EngineUnavailable {
        searched: String,
    },
    SyncStarted {
        remote: String,
        local_dir: String,
    },
    SyncCompleted {
        remote: String,
        local_dir: String,
        duration_ms: u64,
    },
    SyncFailed {
        remote: String,
        error_code: String,
        error_message: String,
    },
    ScheduleInstalled {
        backend: String,
        path: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

/// Cloneable sender side of the logger.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    overflow: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Queue `event` without blocking. A full queue drops it.
    pub fn send(&self, event: ActivityEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events dropped since the logger last reported overflow.
    pub fn dropped_events(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Queue the stop sentinel. This one call does block on a full queue.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

pub struct DualLoggerConfig {
    /// `None` keeps history out of SQLite entirely.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl Default for DualLoggerConfig {
    fn default() -> Self {
        Self::from_paths(&PathsConfig::default())
    }
}

impl DualLoggerConfig {
    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            sqlite_path: Some(paths.sqlite_db.clone()),
            jsonl_config: JsonlConfig {
                path: paths.jsonl_log.clone(),
                ..JsonlConfig::default()
            },
            channel_capacity: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Start the `ssp-logger` thread. It exits after `shutdown()` or once every
/// handle is dropped.
pub fn spawn_logger(config: DualLoggerConfig) -> Result<(ActivityLoggerHandle, JoinHandle<()>)> {
    let (tx, rx) = bounded(config.channel_capacity);
    let overflow = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        overflow: Arc::clone(&overflow),
    };

    let DualLoggerConfig {
        sqlite_path,
        jsonl_config,
        ..
    } = config;
    let join = thread::Builder::new()
        .name("ssp-logger".to_string())
        .spawn(move || Backends::open(sqlite_path, jsonl_config).drain(&rx, &overflow))
        .map_err(|e| SspError::Runtime {
            details: format!("cannot start logger thread: {e}"),
        })?;

    Ok((handle, join))
}

/// Sinks owned by the logger thread.
struct Backends {
    jsonl: JsonlWriter,
    #[cfg(feature = "sqlite")]
    sqlite: Option<SqliteLogger>,
    #[cfg(feature = "sqlite")]
    sqlite_strikes: u32,
}

impl Backends {
    #[cfg_attr(not(feature = "sqlite"), allow(clippy::needless_pass_by_value))]
    fn open(sqlite_path: Option<PathBuf>, jsonl_config: JsonlConfig) -> Self {
        #[cfg(not(feature = "sqlite"))]
        let _ = sqlite_path;
        Self {
            jsonl: JsonlWriter::open(jsonl_config),
            #[cfg(feature = "sqlite")]
            sqlite: sqlite_path.and_then(|path| {
                SqliteLogger::open(&path)
                    .map_err(|e| eprintln!("[SSP-DUAL] history db {} unavailable: {e}", path.display()))
                    .ok()
            }),
            #[cfg(feature = "sqlite")]
            sqlite_strikes: 0,
        }
    }

    fn drain(mut self, rx: &Receiver<ActivityEvent>, overflow: &AtomicU64) {
        for event in rx {
            let lost = overflow.swap(0, Ordering::Relaxed);
            if lost > 0 {
                let mut note = LogEntry::new(EventType::Error, Severity::Warning);
                note.details = Some(format!("{lost} activity event(s) dropped, logger queue full"));
                self.jsonl.write_entry(&note);
            }
            if matches!(event, ActivityEvent::Shutdown) {
                break;
            }
            self.record(&event_to_log_entry(&event));
        }
        self.jsonl.fsync();
    }

    fn record(&mut self, entry: &LogEntry) {
        self.jsonl.write_entry(entry);

        #[cfg(feature = "sqlite")]
        if let Some(db) = &self.sqlite {
            if db.log_activity(&entry_to_activity_row(entry)).is_err() {
                self.sqlite_strikes += 1;
                if self.sqlite_strikes >= MAX_SQLITE_STRIKES {
                    eprintln!("[SSP-DUAL] history db rejected {MAX_SQLITE_STRIKES} writes, JSONL only from here");
                    self.sqlite = None;
                }
            } else {
                self.sqlite_strikes = 0;
            }
        }
    }
}

fn failure(event: EventType, severity: Severity, code: &str, message: &str) -> LogEntry {
    let mut e = LogEntry::new(event, severity);
    e.ok = Some(false);
    e.error_code = Some(code.to_string());
    e.error_message = Some(message.to_string());
    e
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::SweepStarted {
            root,
            policy,
            dry_run,
            engine,
            rules_fingerprint,
        } => {
            let mut e = LogEntry::new(EventType::SweepStart, Severity::Info);
            e.path = Some(root.clone());
            e.rules_fingerprint = Some(rules_fingerprint.clone());
            e.details = Some(format!("policy={policy} dry_run={dry_run} engine={engine}"));
            e
        }
        ActivityEvent::SweepCompleted {
            root,
            discovered,
            purged,
            isolated,
            failures,
            completed,
            duration_ms,
            rules_fingerprint,
        } => {
            let severity = if *completed { Severity::Info } else { Severity::Warning };
            let mut e = LogEntry::new(EventType::SweepComplete, severity);
            e.path = Some(root.clone());
            e.count = Some(*discovered as u64);
            e.duration_ms = Some(*duration_ms);
            e.rules_fingerprint = Some(rules_fingerprint.clone());
            e.ok = Some(*completed);
            e.details = Some(format!(
                "purged={purged} isolated={isolated} failures={failures} completed={completed}"
            ));
            e
        }
        ActivityEvent::ArchiveProtected { path, reason } => {
            let mut e = LogEntry::new(EventType::ArchiveProtected, Severity::Info);
            e.path = Some(path.clone());
            e.rule = Some(reason.clone());
            e
        }
        ActivityEvent::ArchiveSafe {
            path,
            verdict,
            rule,
        } => {
            let mut e = LogEntry::new(EventType::ArchiveSafe, Severity::Info);
            e.path = Some(path.clone());
            e.rule = rule.clone();
            e.details = Some(format!("verdict={verdict}"));
            e
        }
        ActivityEvent::InspectFailed {
            path,
            error_code,
            error_message,
        } => {
            let mut e = failure(EventType::InspectFailed, Severity::Warning, error_code, error_message);
            e.path = Some(path.clone());
            e
        }
        ActivityEvent::ExtractionAttemptFailed {
            path,
            extension,
            details,
        } => {
            let mut e = LogEntry::new(EventType::ExtractionFailed, Severity::Info);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e.details = Some(format!("extension={extension} {details}"));
            e
        }
        ActivityEvent::ArchivePurged {
            path,
            rule,
            extracted,
            attempted,
            dry_run,
        } => {
            let mut e = LogEntry::new(EventType::ArchivePurged, Severity::Info);
            e.path = Some(path.clone());
            e.rule = rule.clone();
            e.ok = Some(true);
            e.details = Some(format!(
                "extracted={extracted}/{attempted} dry_run={dry_run}"
            ));
            e
        }
        ActivityEvent::ArchiveIsolated {
            path,
            destination,
            rule,
            extracted,
            attempted,
            dry_run,
        } => {
            let mut e = LogEntry::new(EventType::ArchiveIsolated, Severity::Info);
            e.path = Some(path.clone());
            e.rule = rule.clone();
            e.ok = Some(true);
            e.details = Some(format!(
                "destination={destination} extracted={extracted}/{attempted} dry_run={dry_run}"
            ));
            e
        }
        ActivityEvent::ArchiveKept { path, details } => {
            let mut e = LogEntry::new(EventType::ArchiveKept, Severity::Warning);
            e.path = Some(path.clone());
            e.ok = Some(false);
            e.details = Some(details.clone());
            e
        }
        ActivityEvent::DeletionFailed {
            path,
            error_code,
            error_message,
        } => {
            let mut e = failure(EventType::DeletionFailed, Severity::Warning, error_code, error_message);
            e.path = Some(path.clone());
            e
        }
        ActivityEvent::LedgerWriteSkipped { path, ledger } => {
            let mut e = LogEntry::new(EventType::LedgerSkipped, Severity::Info);
            e.path = Some(path.clone());
            e.details = Some(format!("ledger file absent: {ledger}"));
            e
        }
        ActivityEvent::EngineUnavailable { searched } => {
            let mut e = LogEntry::new(EventType::EngineUnavailable, Severity::Warning);
            e.ok = Some(false);
            e.error_code = Some("SSP-2001".to_string());
            e.details = Some(format!("searched: {searched}"));
            e
        }
        ActivityEvent::SyncStarted { remote, local_dir } => {
            let mut e = LogEntry::new(EventType::SyncStart, Severity::Info);
            e.path = Some(local_dir.clone());
            e.details = Some(format!("remote={remote}"));
            e
        }
        ActivityEvent::SyncCompleted {
            remote,
            local_dir,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::SyncComplete, Severity::Info);
            e.path = Some(local_dir.clone());
            e.duration_ms = Some(*duration_ms);
            e.ok = Some(true);
            e.details = Some(format!("remote={remote}"));
            e
        }
        ActivityEvent::SyncFailed {
            remote,
            error_code,
            error_message,
        } => {
            let mut e = failure(EventType::SyncFailed, Severity::Critical, error_code, error_message);
            e.details = Some(format!("remote={remote}"));
            e
        }
        ActivityEvent::ScheduleInstalled { backend, path } => {
            let mut e = LogEntry::new(EventType::ScheduleInstalled, Severity::Info);
            e.path = Some(path.clone());
            e.ok = Some(true);
            e.details = Some(format!("backend={backend}"));
            e
        }
        ActivityEvent::Error { code, message } => {
            failure(EventType::Error, Severity::Critical, code, message)
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::SweepComplete, Severity::Info),
    }
}

#[cfg(feature = "sqlite")]
#[allow(clippy::cast_possible_wrap)]
fn entry_to_activity_row(entry: &LogEntry) -> ActivityRow {
    ActivityRow {
        timestamp: entry.ts.clone(),
        event_type: entry.event.as_str().to_string(),
        severity: entry.severity.as_str().to_string(),
        path: entry.path.clone(),
        rule: entry.rule.clone(),
        rules_fingerprint: entry.rules_fingerprint.clone(),
        count: entry.count.map(|c| c as i64),
        duration_ms: entry.duration_ms.map(|d| d as i64),
        success: i32::from(entry.ok.unwrap_or(true)),
        error_code: entry.error_code.clone(),
        error_message: entry.error_message.clone(),
        details: entry.details.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> DualLoggerConfig {
        DualLoggerConfig {
            sqlite_path: Some(dir.join("test.db")),
            jsonl_config: JsonlConfig {
                path: dir.join("test.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    fn purged(path: &str) -> ActivityEvent {
        ActivityEvent::ArchivePurged {
            path: path.to_string(),
            rule: Some("crack".to_string()),
            extracted: 2,
            attempted: 20,
            dry_run: false,
        }
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        handle.send(ActivityEvent::SweepStarted {
            root: "/srv/mirror".to_string(),
            policy: "purge".to_string(),
            dry_run: false,
            engine: "7-zip (/usr/bin/7z)".to_string(),
            rules_fingerprint: "abc123".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert!(contents.contains("sweep_start"));
        assert!(contents.contains("abc123"));
    }

    #[test]
    fn multiple_events_logged_to_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();

        handle.send(purged("downloads/a.zip"));
        handle.send(ActivityEvent::LedgerWriteSkipped {
            path: "downloads/a.zip".to_string(),
            ledger: "/x/schematics-exclude.txt".to_string(),
        });
        handle.send(ActivityEvent::DeletionFailed {
            path: "downloads/b.zip".to_string(),
            error_code: "SSP-2004".to_string(),
            error_message: "permission denied".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 3);

        #[cfg(feature = "sqlite")]
        {
            let db = SqliteLogger::open(&dir.path().join("test.db")).unwrap();
            let rows = db.recent_activity(10).unwrap();
            assert_eq!(rows.len(), 3);
            assert_eq!(rows[0].event_type, "deletion_failed");
            assert_eq!(rows[0].success, 0);
            assert_eq!(rows[2].event_type, "archive_purged");
            assert_eq!(rows[2].rule.as_deref(), Some("crack"));
        }
    }

    #[test]
    fn handles_cloneable_and_send() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        let h2 = handle.clone();

        let worker = std::thread::spawn(move || h2.send(purged("x/y.rar")));
        worker.join().unwrap();
        handle.send(ActivityEvent::EngineUnavailable {
            searched: "7z, 7za, rar, unrar".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn sqlite_disabled_when_path_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.sqlite_path = None;
        let (handle, join) = spawn_logger(config).unwrap();
        handle.send(ActivityEvent::Error {
            code: "SSP-9999".to_string(),
            message: "test error".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert!(contents.contains("SSP-9999"));
        assert!(!dir.path().join("test.db").exists());
    }

    #[test]
    fn incomplete_sweep_logs_warning() {
        let entry = event_to_log_entry(&ActivityEvent::SweepCompleted {
            root: "/m".to_string(),
            discovered: 10,
            purged: 1,
            isolated: 0,
            failures: 0,
            completed: false,
            duration_ms: 5,
            rules_fingerprint: "f".to_string(),
        });
        assert_eq!(entry.severity, Severity::Warning);
        assert_eq!(entry.ok, Some(false));
        assert_eq!(entry.count, Some(10));
    }

    #[test]
    fn dropped_events_counter_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.channel_capacity = 2;
        let (handle, join) = spawn_logger(config).unwrap();
        assert_eq!(handle.dropped_events(), 0);
        handle.shutdown();
        join.join().unwrap();
    }
}
