//! Platform abstraction: host OS detection, executable lookup, and the
//! recurring-job installer contract.

#![allow(missing_docs)]

use std::env;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SspError};
use crate::platform::service::{LaunchdAgentInstaller, ScheduledTaskInstaller, SystemdTimerInstaller};

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    /// Compile-time host detection.
    #[must_use]
    pub const fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Other => "other",
        }
    }

    /// Executable suffix for binaries on this host.
    #[must_use]
    pub const fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a recurring job runs and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    /// Absolute path to the `ssp` binary.
    pub executable: PathBuf,
    /// Arguments appended after the binary (`sync` by default).
    pub args: Vec<String>,
    /// Working directory for the job.
    pub working_dir: PathBuf,
    /// Config file the job should load, if not the default one.
    pub config_file: Option<PathBuf>,
}

impl JobSpec {
    /// Weekly `ssp sync` job for the running binary.
    pub fn weekly_sync(working_dir: &Path, config_file: Option<&Path>) -> Result<Self> {
        Ok(Self {
            executable: resolve_ssp_binary()?,
            args: vec!["sync".to_string()],
            working_dir: working_dir.to_path_buf(),
            config_file: config_file.map(Path::to_path_buf),
        })
    }

    /// Full argument vector after the executable, config flag first.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        if let Some(config) = &self.config_file {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Structured result from an install or uninstall (for CLI output).
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleActionResult {
    pub action: &'static str,
    pub backend: &'static str,
    /// Unit / plist path, or the task name for schtasks.
    pub location: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One weekly-job backend (systemd timer, launchd agent, scheduled task).
pub trait RecurringJobInstaller: Send + Sync {
    /// Backend name for logs and reports.
    fn backend(&self) -> &'static str;
    /// Where the job definition lives.
    fn location(&self) -> String;
    fn install(&self, job: &JobSpec) -> Result<()>;
    fn uninstall(&self) -> Result<()>;
    fn status(&self) -> Result<String>;
}

/// Installer for `os`, or `UnsupportedPlatform`.
pub fn select_installer(os: HostOs) -> Result<Box<dyn RecurringJobInstaller>> {
    match os {
        HostOs::Linux => Ok(Box::new(SystemdTimerInstaller::from_env())),
        HostOs::MacOs => Ok(Box::new(LaunchdAgentInstaller::from_env())),
        HostOs::Windows => Ok(Box::new(ScheduledTaskInstaller::default())),
        HostOs::Other => Err(SspError::UnsupportedPlatform {
            details: format!("no recurring job backend for {}", env::consts::OS),
        }),
    }
}

/// Search `path_var` (a `PATH`-style list) for an executable named `name`.
///
/// On Windows the `.exe` suffix is appended when missing.
pub fn find_executable(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    let suffix = HostOs::detect().exe_suffix();
    let file_name = if suffix.is_empty() || name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    };
    env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(&file_name))
        .find(|candidate| is_executable(candidate))
}

/// [`find_executable`] against the process `PATH`.
pub fn which(name: &str) -> Option<PathBuf> {
    env::var_os("PATH").and_then(|path| find_executable(name, &path))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// The running `ssp` binary, falling back to `PATH`.
pub fn resolve_ssp_binary() -> Result<PathBuf> {
    if let Ok(exe) = env::current_exe()
        && exe.exists()
    {
        return Ok(exe);
    }
    which("ssp").ok_or_else(|| SspError::Runtime {
        details: "could not locate the ssp binary; install it to a PATH directory first".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_exe(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(format!("{name}{}", HostOs::detect().exe_suffix()));
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[test]
    fn finds_executable_in_first_matching_dir() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let expected = make_exe(b.path(), "rclone");
        let path_var = env::join_paths([a.path(), b.path()]).unwrap();
        assert_eq!(find_executable("rclone", &path_var), Some(expected));
        assert_eq!(find_executable("curl", &path_var), None);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("7z"), b"").unwrap();
        let path_var = env::join_paths([dir.path()]).unwrap();
        assert_eq!(find_executable("7z", &path_var), None);
    }

    #[test]
    fn job_spec_puts_config_flag_first() {
        let job = JobSpec {
            executable: PathBuf::from("/usr/local/bin/ssp"),
            args: vec!["sync".to_string()],
            working_dir: PathBuf::from("/home/u/Schematics"),
            config_file: Some(PathBuf::from("/home/u/.config/ssp/config.toml")),
        };
        assert_eq!(
            job.command_args(),
            vec!["--config", "/home/u/.config/ssp/config.toml", "sync"]
        );
    }

    #[test]
    fn host_detection_matches_target() {
        let os = HostOs::detect();
        if cfg!(target_os = "linux") {
            assert_eq!(os, HostOs::Linux);
        }
        assert_eq!(os.exe_suffix().is_empty(), !cfg!(windows));
    }

    #[test]
    fn unsupported_host_has_no_installer() {
        assert_eq!(
            select_installer(HostOs::Other).err().map(|e| e.code()),
            Some("SSP-1101")
        );
        assert_eq!(select_installer(HostOs::Linux).unwrap().backend(), "systemd");
    }
}
