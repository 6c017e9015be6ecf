//! Activity JSONL sink.
//!
//! One JSON object per line, written with a single `write_all` so a tailing
//! reader never sees a torn record. When the primary file cannot be written
//! the writer degrades to the fallback file, then stderr, then drops lines;
//! a sweep never fails because its log did.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SspError};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Log event types matching the ssp activity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SweepStart,
    SweepComplete,
    ArchiveProtected,
    ArchiveSafe,
    InspectFailed,
    ExtractionFailed,
    ArchivePurged,
    ArchiveIsolated,
    ArchiveKept,
    DeletionFailed,
    LedgerSkipped,
    EngineUnavailable,
    SyncStart,
    SyncComplete,
    SyncFailed,
    ScheduleInstalled,
    Error,
}

impl EventType {
    /// Stable snake_case name, identical to the serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SweepStart => "sweep_start",
            Self::SweepComplete => "sweep_complete",
            Self::ArchiveProtected => "archive_protected",
            Self::ArchiveSafe => "archive_safe",
            Self::InspectFailed => "inspect_failed",
            Self::ExtractionFailed => "extraction_failed",
            Self::ArchivePurged => "archive_purged",
            Self::ArchiveIsolated => "archive_isolated",
            Self::ArchiveKept => "archive_kept",
            Self::DeletionFailed => "deletion_failed",
            Self::LedgerSkipped => "ledger_skipped",
            Self::EngineUnavailable => "engine_unavailable",
            Self::SyncStart => "sync_start",
            Self::SyncComplete => "sync_complete",
            Self::SyncFailed => "sync_failed",
            Self::ScheduleInstalled => "schedule_installed",
            Self::Error => "error",
        }
    }
}

/// One JSONL record. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    /// Event type identifier.
    pub event: EventType,
    /// Severity level.
    pub severity: Severity,
    /// Archive path relative to the sweep root, or a root/local dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Rule pattern or protection reason that drove the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Short fingerprint of the rule set in force.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_fingerprint: Option<String>,
    /// Number of archives involved (sweep summaries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Duration of the action in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Whether the action succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    /// SSP error code if action failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Freeform details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            path: None,
            rule: None,
            rules_fingerprint: None,
            count: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Used when `path` cannot be opened (read-only data dir, full disk).
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the active file would grow past this size. Default: 16 MiB.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`. Default: 5.
    pub max_rotated_files: u32,
    /// Default: 10.
    pub fsync_interval_secs: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: crate::core::paths::data_dir().join("activity.jsonl"),
            fallback_path: Some(std::env::temp_dir().join("ssp-activity.jsonl")),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

const BUFFER_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Primary,
    Fallback,
}

/// Where lines currently go. Only ever moves down the list.
enum Sink {
    File {
        tier: Tier,
        path: PathBuf,
        out: BufWriter<File>,
        size: u64,
    },
    Stderr,
    Discard,
}

/// Append-only JSONL writer with rotation and a degrading sink.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, or the first sink that works.
    pub fn open(config: JsonlConfig) -> Self {
        let sink = first_available(&config, Tier::Primary);
        Self {
            config,
            sink,
            last_sync: Instant::now(),
        }
    }

    /// Serialize `entry` and append it as one line.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[SSP-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
        }
    }

    /// Flush and `sync_data` the active file.
    pub fn fsync(&mut self) {
        if let Sink::File { out, .. } = &mut self.sink {
            let _ = out.flush();
            let _ = out.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// `normal`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &str {
        match &self.sink {
            Sink::File {
                tier: Tier::Primary,
                ..
            } => "normal",
            Sink::File {
                tier: Tier::Fallback,
                ..
            } => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        let max = self.config.max_size_bytes;
        if matches!(&self.sink, Sink::File { size, .. } if *size > 0 && *size + len > max) {
            self.rotate();
        }

        let delivered = match &mut self.sink {
            Sink::File { out, size, .. } => {
                let ok = out.write_all(line.as_bytes()).is_ok();
                if ok {
                    *size += len;
                }
                ok
            }
            Sink::Stderr => {
                let _ = write!(io::stderr(), "[SSP-JSONL] {line}");
                true
            }
            Sink::Discard => true,
        };

        if !delivered {
            self.demote();
            self.write_line(line);
            return;
        }
        if self.last_sync.elapsed() >= Duration::from_secs(self.config.fsync_interval_secs) {
            self.fsync();
        }
    }

    fn demote(&mut self) {
        self.sink = match &self.sink {
            Sink::File {
                tier: Tier::Primary,
                ..
            } => first_available(&self.config, Tier::Fallback),
            Sink::File {
                tier: Tier::Fallback,
                ..
            } => {
                let _ = writeln!(io::stderr(), "[SSP-JSONL] fallback write failed, using stderr");
                Sink::Stderr
            }
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }

    /// `<path>` becomes `<path>.1`, older generations shift up, the oldest is
    /// dropped, and a fresh file is opened at `<path>`.
    fn rotate(&mut self) {
        let Sink::File { path, out, .. } = &mut self.sink else {
            return;
        };
        let _ = out.flush();
        let base = path.clone();

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for generation in (1..keep).rev() {
            let _ = rename(rotated_name(&base, generation), rotated_name(&base, generation + 1));
        }
        let _ = rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                if let Sink::File { out, size, .. } = &mut self.sink {
                    *out = BufWriter::with_capacity(BUFFER_CAPACITY, file);
                    *size = 0;
                }
            }
            Err(_) => self.demote(),
        }
    }
}

/// First openable file at or below `from`, else stderr.
fn first_available(config: &JsonlConfig, from: Tier) -> Sink {
    let candidates = [
        (Tier::Primary, Some(&config.path)),
        (Tier::Fallback, config.fallback_path.as_ref()),
    ];
    for (tier, path) in candidates {
        let Some(path) = path.filter(|_| tier >= from) else {
            continue;
        };
        match open_append(path) {
            Ok((file, size)) => {
                if tier == Tier::Fallback {
                    let _ = writeln!(
                        io::stderr(),
                        "[SSP-JSONL] primary log unavailable, using fallback: {}",
                        path.display()
                    );
                }
                return Sink::File {
                    tier,
                    path: path.clone(),
                    out: BufWriter::with_capacity(BUFFER_CAPACITY, file),
                    size,
                };
            }
            Err(e) => {
                let _ = writeln!(io::stderr(), "[SSP-JSONL] {e}");
            }
        }
    }
    let _ = writeln!(io::stderr(), "[SSP-JSONL] no writable log file, using stderr");
    Sink::Stderr
}

/// Append handle plus the current length, creating parent dirs.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SspError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SspError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` -> `activity.jsonl.<index>`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// RFC 3339 UTC with millisecond precision.
pub(crate) fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes: 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval_secs: 60,
        }
    }

    #[test]
    fn write_entry_produces_valid_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));

        let mut entry = LogEntry::new(EventType::ArchivePurged, Severity::Info);
        entry.path = Some("downloads/tool_crack_patch.zip".to_string());
        entry.rule = Some("crack".to_string());
        writer.write_entry(&entry);
        writer.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event"], "archive_purged");
        assert_eq!(parsed["severity"], "info");
        assert_eq!(parsed["rule"], "crack");
    }

    #[test]
    fn event_names_match_serialized_form() {
        for event in [
            EventType::SweepStart,
            EventType::LedgerSkipped,
            EventType::EngineUnavailable,
            EventType::ScheduleInstalled,
        ] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.as_str()));
        }
    }

    #[test]
    fn multiple_entries_are_separate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));

        for _ in 0..5 {
            writer.write_entry(&LogEntry::new(EventType::ArchiveSafe, Severity::Info));
        }
        writer.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        for line in lines {
            let _: serde_json::Value = serde_json::from_str(line).unwrap();
        }
    }

    #[test]
    fn rotation_keeps_at_most_the_configured_generations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.jsonl");
        let mut cfg = config(path.clone());
        cfg.max_size_bytes = 100;
        cfg.max_rotated_files = 2;
        let mut writer = JsonlWriter::open(cfg);
        assert_eq!(writer.state(), "normal");

        for _ in 0..20 {
            writer.write_entry(&LogEntry::new(EventType::SweepComplete, Severity::Info));
        }
        writer.flush();

        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(rotated_name(&path, 2).exists());
        assert!(!rotated_name(&path, 3).exists());
        assert_eq!(writer.state(), "normal");
    }

    #[test]
    fn primary_without_fallback_degrades_to_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("plain-file");
        fs::write(&blocker, b"").unwrap();
        let mut writer = JsonlWriter::open(config(blocker.join("activity.jsonl")));
        assert_eq!(writer.state(), "stderr");
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Critical));
    }

    #[test]
    fn fallback_receives_lines_when_primary_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let fallback = dir.path().join("fallback.jsonl");
        let mut cfg = config(blocker.join("primary.jsonl"));
        cfg.fallback_path = Some(fallback.clone());
        let mut writer = JsonlWriter::open(cfg);

        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Warning));
        writer.fsync();

        let contents = fs::read_to_string(&fallback).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn entry_optional_fields_omitted_when_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));

        writer.write_entry(&LogEntry::new(EventType::SyncStart, Severity::Info));
        writer.flush();

        let line = fs::read_to_string(&path).unwrap();
        assert!(!line.contains("\"path\""));
        assert!(!line.contains("\"rule\""));
        assert!(!line.contains("\"count\""));
    }
}
