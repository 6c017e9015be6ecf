//! rclone mirror of the remote share into the local directory.
//!
//! The remote is configured on the fly through `RCLONE_CONFIG_<NAME>_*`
//! environment variables so nothing is written to the user's rclone config.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{Result, SspError};
use crate::shield::ledger::ExclusionLedger;
use crate::shield::sweep::ISOLATION_DIR;
use crate::sync::auth::{SessionHeader, normalize_url};

/// Manifest file checked on the remote before syncing.
const MANIFEST_FILE: &str = "manifest.txt";

/// Appended to the ledger path to name the derived `--exclude-from` file.
const EXCLUDE_FILE_SUFFIX: &str = ".rclone-exclude";

/// Result of the manifest check. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestCheck {
    /// Remote answered with the manifest.
    Found,
    /// Remote answered without it.
    Missing,
    /// rclone could not be run.
    Failed,
}

/// Summary of one finished rclone run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    /// `<name>:` remote spec.
    pub remote: String,
    /// Mirror directory.
    pub local_dir: PathBuf,
    /// rclone's own log.
    pub log_file: PathBuf,
    /// `sync` or `copy`.
    pub verb: &'static str,
    /// An exclude file derived from the ledger was passed.
    pub excluded_from_ledger: bool,
    /// Wall-clock duration.
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Builds and runs `rclone copy|sync <remote>: <local_dir>`.
#[derive(Debug, Clone)]
pub struct RcloneSync {
    program: PathBuf,
    strict_mirror: bool,
    remote_name: String,
    url: String,
    local_dir: PathBuf,
    log_file: PathBuf,
    ledger: Option<PathBuf>,
}

impl RcloneSync {
    /// Sync with no ledger, the `copy` verb and `rclone` resolved by the OS.
    pub fn new(
        remote_name: impl Into<String>,
        url: &str,
        local_dir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: PathBuf::from("rclone"),
            strict_mirror: false,
            remote_name: remote_name.into(),
            url: normalize_url(url),
            local_dir: local_dir.into(),
            log_file: log_file.into(),
            ledger: None,
        }
    }

    /// Sync settings from the loaded configuration, using the `rclone` found
    /// on PATH when there is one.
    pub fn from_config(config: &Config) -> Self {
        let sync = Self::new(
            config.sync.remote_name.clone(),
            &config.remote.url,
            config.paths.local_dir.clone(),
            config.paths.effective_sync_log(),
        )
        .with_ledger(&config.paths.ledger_file)
        .with_strict_mirror(config.sync.strict_mirror);
        match crate::platform::pal::which("rclone") {
            Some(found) => sync.with_program(found),
            None => sync,
        }
    }

    /// Run this rclone executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Exclude ledgered archives so purged files are not downloaded again.
    #[must_use]
    pub fn with_ledger(mut self, ledger: &Path) -> Self {
        self.ledger = Some(ledger.to_path_buf());
        self
    }

    /// Use `rclone sync`, which deletes local files absent on the remote,
    /// rescued siblings included.
    #[must_use]
    pub const fn with_strict_mirror(mut self, strict: bool) -> Self {
        self.strict_mirror = strict;
        self
    }

    /// `sync` under strict mirroring, otherwise `copy`.
    pub const fn verb(&self) -> &'static str {
        if self.strict_mirror { "sync" } else { "copy" }
    }

    /// Remote argument, e.g. `schematics:`.
    pub fn remote_spec(&self) -> String {
        format!("{}:", self.remote_name)
    }

    fn ledger_in_use(&self) -> Option<&Path> {
        self.ledger.as_deref().filter(|p| p.is_file())
    }

    /// Where the escaped exclude list for the current ledger is written.
    pub fn exclude_file(&self) -> Option<PathBuf> {
        self.ledger_in_use().map(|ledger| {
            let mut name = ledger.as_os_str().to_owned();
            name.push(EXCLUDE_FILE_SUFFIX);
            PathBuf::from(name)
        })
    }

    /// Regenerate the exclude file from the ledger. The ledger stays plain
    /// paths; rclone gets them as escaped glob patterns, deduplicated.
    pub fn write_exclude_file(&self) -> Result<Option<PathBuf>> {
        let (Some(ledger), Some(target)) = (self.ledger_in_use(), self.exclude_file()) else {
            return Ok(None);
        };
        let mut seen = HashSet::new();
        let mut body = String::new();
        for entry in ExclusionLedger::new(ledger).entries()? {
            if seen.insert(entry.clone()) {
                body.push_str(&exclude_pattern(&entry));
                body.push('\n');
            }
        }
        std::fs::write(&target, body).map_err(|source| SspError::io(&target, source))?;
        Ok(Some(target))
    }

    /// Full argument vector for the mirror run.
    pub fn build_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(self.verb()),
            OsString::from(self.remote_spec()),
            self.local_dir.as_os_str().to_owned(),
        ];
        for flag in [
            "--progress",
            "--size-only",
            "--fast-list",
            "--transfers",
            "4",
            "--checkers",
            "16",
            "--timeout",
            "15m",
            "--retries",
            "10",
            "--low-level-retries",
            "20",
        ] {
            args.push(OsString::from(flag));
        }
        args.push(OsString::from("--log-file"));
        args.push(self.log_file.as_os_str().to_owned());
        for flag in ["--log-level", "INFO", "--ignore-errors", "--links"] {
            args.push(OsString::from(flag));
        }
        // Keep isolated archives out of the mirror's delete pass.
        args.push(OsString::from("--exclude"));
        args.push(OsString::from(format!("{ISOLATION_DIR}/**")));
        if let Some(excludes) = self.exclude_file() {
            args.push(OsString::from("--exclude-from"));
            args.push(excludes.into_os_string());
        }
        args
    }

    /// Remote definition passed through the environment.
    pub fn build_env(&self, header: &SessionHeader) -> Vec<(String, String)> {
        let prefix = format!(
            "RCLONE_CONFIG_{}",
            self.remote_name.to_ascii_uppercase()
        );
        vec![
            (format!("{prefix}_TYPE"), "http".to_string()),
            (format!("{prefix}_URL"), self.url.clone()),
            (format!("{prefix}_HEADERS"), header.as_str().to_string()),
            (format!("{prefix}_PACER_MIN_SLEEP"), "0.01ms".to_string()),
        ]
    }

    fn command(&self, header: &SessionHeader) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.envs(self.build_env(header));
        cmd
    }

    /// Look for `manifest.txt` on the remote.
    pub fn check_manifest(&self, header: &SessionHeader) -> ManifestCheck {
        let output = self
            .command(header)
            .arg("cat")
            .arg(format!("{}{MANIFEST_FILE}", self.remote_spec()))
            .output();
        match output {
            Ok(o) if o.status.success() => ManifestCheck::Found,
            Ok(_) => ManifestCheck::Missing,
            Err(_) => ManifestCheck::Failed,
        }
    }

    /// Run the mirror with inherited stdio so rclone's progress is visible.
    pub fn run(&self, header: &SessionHeader) -> Result<SyncOutcome> {
        let program = self.program.to_string_lossy().into_owned();
        std::fs::create_dir_all(&self.local_dir).map_err(|source| SspError::io(&self.local_dir, source))?;
        self.write_exclude_file()?;
        let start = Instant::now();
        let status = self
            .command(header)
            .args(self.build_args())
            .status()
            .map_err(|err| SspError::CommandFailed {
                program: program.clone(),
                details: format!("could not spawn: {err}"),
            })?;
        if !status.success() {
            return Err(SspError::CommandFailed {
                program,
                details: format!(
                    "sync exited with {}; rclone resumes on the next run (details in {})",
                    status.code().unwrap_or(-1),
                    self.log_file.display()
                ),
            });
        }
        Ok(SyncOutcome {
            remote: self.remote_spec(),
            local_dir: self.local_dir.clone(),
            log_file: self.log_file.clone(),
            verb: self.verb(),
            excluded_from_ledger: self.ledger_in_use().is_some(),
            duration: start.elapsed(),
        })
    }
}

/// rclone glob matching exactly `relative`. Glob metacharacters are
/// backslash-escaped, and so is a leading `#` or `;` that would make the line a
/// comment.
pub fn exclude_pattern(relative: &str) -> String {
    let mut pattern = String::with_capacity(relative.len() + 4);
    for (i, ch) in relative.chars().enumerate() {
        let special = matches!(ch, '*' | '?' | '[' | ']' | '{' | '}' | '\\')
            || (i == 0 && matches!(ch, '#' | ';'));
        if special {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern
}
