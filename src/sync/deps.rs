//! Host dependency detection and the rclone install offer.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

use serde::Serialize;

use crate::core::errors::{Result, SspError};
use crate::platform::pal::{HostOs, find_executable};
use crate::shield::engine::{ArchiveDialect, CapabilityDescriptor, discover_in};

/// Official rclone install script.
pub const RCLONE_INSTALL_URL: &str = "https://rclone.org/install.sh";
/// Manual download page for hosts without the script.
pub const RCLONE_DOWNLOADS_URL: &str = "https://rclone.org/downloads/";

/// How much a missing tool matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    /// Sync cannot run without it.
    Required,
    /// Only the archive shield needs it.
    Optional,
}

/// Presence of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    /// Executable base name.
    pub name: &'static str,
    /// What the tool is used for.
    pub purpose: &'static str,
    /// Whether sync can run without it.
    pub requirement: Requirement,
    /// Resolved location, when installed.
    pub path: Option<PathBuf>,
}

impl ToolStatus {
    /// True when the tool was found.
    pub const fn is_present(&self) -> bool {
        self.path.is_some()
    }
}

/// Full doctor report.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    /// Host the report was taken on.
    pub host: HostOs,
    /// One entry per known tool.
    pub tools: Vec<ToolStatus>,
    /// Archive tool the shield would use, if any.
    pub archive_engine: Option<CapabilityDescriptor>,
}

impl DependencyReport {
    /// True when sync can run.
    pub fn all_required_present(&self) -> bool {
        self.tools
            .iter()
            .filter(|t| t.requirement == Requirement::Required)
            .all(ToolStatus::is_present)
    }

    /// Tools that were not found.
    pub fn missing(&self) -> impl Iterator<Item = &ToolStatus> {
        self.tools.iter().filter(|t| !t.is_present())
    }

    /// Status of one tool by name.
    pub fn tool(&self, name: &str) -> Option<&ToolStatus> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// What an install attempt achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InstallOutcome {
    /// Installer ran and the tool is now on `PATH`.
    Installed,
    /// No automatic installer on this host.
    ManualActionRequired {
        /// What the user has to do instead.
        instructions: String,
    },
}

/// Looks tools up on a `PATH`-style search list.
#[derive(Debug, Clone)]
pub struct DependencyChecker {
    path_var: OsString,
    host: HostOs,
}

impl Default for DependencyChecker {
    fn default() -> Self {
        Self::new(env::var_os("PATH").unwrap_or_default(), HostOs::detect())
    }
}

impl DependencyChecker {
    /// Checker over an explicit search list.
    pub fn new(path_var: OsString, host: HostOs) -> Self {
        Self { path_var, host }
    }

    /// Path to `tool` if it is installed.
    pub fn detect(&self, tool: &str) -> Option<PathBuf> {
        find_executable(tool, &self.path_var)
    }

    fn detect_any(&self, names: &[&str]) -> Option<PathBuf> {
        names.iter().find_map(|name| self.detect(name))
    }

    /// Check every tool `ssp` uses.
    pub fn doctor(&self) -> DependencyReport {
        let tools = vec![
            ToolStatus {
                name: "rclone",
                purpose: "mirrors the remote share",
                requirement: Requirement::Required,
                path: self.detect("rclone"),
            },
            ToolStatus {
                name: "curl",
                purpose: "logs in to the remote share",
                requirement: Requirement::Required,
                path: self.detect("curl"),
            },
            ToolStatus {
                name: "7z",
                purpose: "archive shield (7z, 7za)",
                requirement: Requirement::Optional,
                path: self.detect_any(ArchiveDialect::SevenZip.binaries()),
            },
            ToolStatus {
                name: "rar",
                purpose: "archive shield fallback (rar, unrar)",
                requirement: Requirement::Optional,
                path: self.detect_any(ArchiveDialect::Rar.binaries()),
            },
        ];
        DependencyReport {
            host: self.host,
            tools,
            archive_engine: discover_in(&self.path_var),
        }
    }

    /// Shell command that runs the official install script.
    pub fn rclone_install_command(&self) -> Option<String> {
        match self.host {
            HostOs::Linux | HostOs::MacOs => {
                let sudo = if running_as_root() { "" } else { "sudo " };
                Some(format!("curl -fsSL {RCLONE_INSTALL_URL} | {sudo}bash"))
            }
            HostOs::Windows | HostOs::Other => None,
        }
    }

    /// Install rclone where an automatic path exists.
    pub fn install_rclone(&self) -> Result<InstallOutcome> {
        let Some(script) = self.rclone_install_command() else {
            return Ok(InstallOutcome::ManualActionRequired {
                instructions: format!(
                    "download rclone from {RCLONE_DOWNLOADS_URL} and put it on PATH"
                ),
            });
        };
        let status = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .status()
            .map_err(|err| SspError::CommandFailed {
                program: "sh".to_string(),
                details: format!("could not run installer: {err}"),
            })?;
        if status.success() {
            Ok(InstallOutcome::Installed)
        } else {
            Err(SspError::CommandFailed {
                program: "rclone installer".to_string(),
                details: format!("{script} exited with {}", status.code().unwrap_or(-1)),
            })
        }
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
