//! Exclusion ledger: append-only list of purged archive paths.
//!
//! One relative path per line, UTF-8, no header. The same file is handed to
//! rclone as `--exclude-from` so purged archives are not downloaded again.
//! Appends never create the file; creating it is the caller's decision.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::errors::{Result, SspError};

/// What happened to one ledger append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerWrite {
    /// Line written.
    Appended,
    /// Ledger file did not exist; nothing written.
    SkippedMissing,
    /// Dry run; nothing written.
    DryRun,
}

/// Single-writer handle to the ledger file.
///
/// Appends are serialized through an internal mutex so concurrent sweep
/// workers never interleave partial lines.
#[derive(Debug)]
pub struct ExclusionLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ExclusionLedger {
    /// Handle for the ledger at `path`. The file is never created here.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Ledger location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends only happen while this holds.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append one line. No-op (`SkippedMissing`) when the file is absent.
    pub fn append(&self, relative: &str) -> Result<LedgerWrite> {
        let line = sanitize_entry(relative);
        let _guard = self.write_lock.lock();
        let mut file = match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LedgerWrite::SkippedMissing),
            Err(source) => return Err(SspError::io(&self.path, source)),
        };
        // One write call per entry keeps the line whole under O_APPEND.
        file.write_all(format!("{line}\n").as_bytes())
            .map_err(|source| SspError::io(&self.path, source))?;
        Ok(LedgerWrite::Appended)
    }

    /// Create the file (and parent directories) if missing. Returns true when
    /// the file was created by this call.
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| SspError::io(parent, source))?;
        }
        let _guard = self.write_lock.lock();
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(SspError::io(&self.path, source)),
        }
    }

    /// Entries in file order, blank lines dropped. Missing file reads as empty.
    pub fn entries(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(SspError::io(&self.path, source)),
        }
    }

    /// Truncate to zero entries, keeping the file in place. Returns the number
    /// of entries removed.
    pub fn reset(&self) -> Result<usize> {
        let removed = self.entries()?.len();
        if !self.exists() {
            return Err(SspError::Ledger {
                path: self.path.clone(),
                details: "ledger file does not exist".to_string(),
            });
        }
        let _guard = self.write_lock.lock();
        fs::write(&self.path, b"").map_err(|source| SspError::io(&self.path, source))?;
        Ok(removed)
    }
}

/// Line breaks inside a file name would split one entry into two.
fn sanitize_entry(relative: &str) -> String {
    relative.replace(['\r', '\n'], "_")
}
