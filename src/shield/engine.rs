//! Capability provider: discovers an external archive tool and drives it.
//!
//! Two dialects are supported, searched in priority order:
//! 1. **SevenZip** (`7z`, `7za`): recursive listing `l <archive> -r`, flat
//!    extraction `e <archive> *<ext> -o<dir> -r -y`.
//! 2. **Rar** (`rar`, `unrar`): verbose listing `v <archive>`, flat extraction
//!    `e -r -y <archive> *<ext> <dir>/`.
//!
//! Discovery produces an explicit [`CapabilityDescriptor`]; nothing is cached
//! globally. The sweep takes any [`ArchiveEngine`], so tests can substitute a
//! fake that never spawns a process.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::Serialize;

use crate::core::errors::{Result, SspError};
use crate::platform::pal::find_executable;

/// Longest stderr/stdout excerpt carried in an error.
const EXCERPT_LIMIT: usize = 240;

/// Exit code `rar`/`unrar` use when the mask matched nothing.
const RAR_NO_FILES_EXIT: i32 = 10;

/// Listing/extraction dialect of the selected tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveDialect {
    /// `7z`/`7za`.
    SevenZip,
    /// `rar`/`unrar`.
    Rar,
}

impl ArchiveDialect {
    /// Search order: the universal archiver first, the RAR-only tool second.
    pub const PRIORITY: [Self; 2] = [Self::SevenZip, Self::Rar];

    /// Executable base names, most capable first.
    pub const fn binaries(self) -> &'static [&'static str] {
        match self {
            Self::SevenZip => &["7z", "7za"],
            Self::Rar => &["rar", "unrar"],
        }
    }

    /// Human-readable tool family.
    pub const fn label(self) -> &'static str {
        match self {
            Self::SevenZip => "7-zip",
            Self::Rar => "rar",
        }
    }
}

impl fmt::Display for ArchiveDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which tool is active for this run. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityDescriptor {
    /// Argument dialect of `program`.
    pub dialect: ArchiveDialect,
    /// Resolved executable path.
    pub program: PathBuf,
}

impl CapabilityDescriptor {
    /// Pair a dialect with a resolved executable.
    pub fn new(dialect: ArchiveDialect, program: impl Into<PathBuf>) -> Self {
        Self {
            dialect,
            program: program.into(),
        }
    }
}

/// Search `PATH` for a supported archive tool.
pub fn discover() -> Option<CapabilityDescriptor> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    discover_in(&path_var)
}

/// Search an explicit `PATH`-style search list.
pub fn discover_in(path_var: &OsStr) -> Option<CapabilityDescriptor> {
    ArchiveDialect::PRIORITY.iter().find_map(|dialect| {
        dialect.binaries().iter().find_map(|name| {
            find_executable(name, path_var).map(|program| CapabilityDescriptor::new(*dialect, program))
        })
    })
}

/// Every binary name discovery looks for, for error messages.
pub fn searched_binaries() -> String {
    ArchiveDialect::PRIORITY
        .iter()
        .flat_map(|d| d.binaries().iter().copied())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Raw listing text for one archive. Consumed by the classifier, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentListing(String);

impl ContentListing {
    /// Wrap captured tool output.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Listing text as captured.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the tool printed nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of one `*<ext>` extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    /// Tool reported success and matched at least one entry.
    Extracted,
    /// Mask matched nothing in the archive.
    NotFound,
    /// Spawn failure or non-zero exit.
    ToolError {
        /// Spawn error or captured tool output.
        details: String,
    },
}

impl ExtractionOutcome {
    /// True for spawn failures and non-zero exits.
    pub const fn is_tool_error(&self) -> bool {
        matches!(self, Self::ToolError { .. })
    }

    /// Stable label used in logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::NotFound => "not_found",
            Self::ToolError { .. } => "tool_error",
        }
    }
}

/// Uniform listing/extraction contract over external archive tools.
pub trait ArchiveEngine: Send + Sync {
    /// Short description for logs and reports.
    fn describe(&self) -> String;

    /// Recursive listing; `ListingFailed` on spawn failure or non-zero exit.
    fn list_entries(&self, archive: &Path) -> Result<ContentListing>;

    /// Flat, overwriting extraction of every entry matching `*<extension>`.
    fn extract_by_pattern(
        &self,
        archive: &Path,
        extension: &str,
        destination: &Path,
    ) -> ExtractionOutcome;
}

/// [`ArchiveEngine`] that shells out to the discovered tool.
#[derive(Debug, Clone)]
pub struct ExternalArchiver {
    descriptor: CapabilityDescriptor,
}

impl ExternalArchiver {
    /// Use an already discovered tool.
    pub fn new(descriptor: CapabilityDescriptor) -> Self {
        Self { descriptor }
    }

    /// Discover a tool on `PATH` or fail with `EngineUnavailable`.
    pub fn discover() -> Result<Self> {
        discover().map(Self::new).ok_or_else(|| SspError::EngineUnavailable {
            searched: searched_binaries(),
        })
    }

    /// The tool this engine runs.
    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Arguments for the recursive listing subcommand.
    pub fn listing_args(&self, archive: &Path) -> Vec<OsString> {
        match self.descriptor.dialect {
            ArchiveDialect::SevenZip => vec![
                OsString::from("l"),
                archive.as_os_str().to_owned(),
                OsString::from("-r"),
            ],
            ArchiveDialect::Rar => vec![OsString::from("v"), archive.as_os_str().to_owned()],
        }
    }

    /// Arguments for the flat, overwriting, recursive extraction subcommand.
    pub fn extraction_args(&self, archive: &Path, extension: &str, destination: &Path) -> Vec<OsString> {
        let mask = OsString::from(format!("*{extension}"));
        match self.descriptor.dialect {
            ArchiveDialect::SevenZip => {
                let mut out_flag = OsString::from("-o");
                out_flag.push(destination.as_os_str());
                vec![
                    OsString::from("e"),
                    archive.as_os_str().to_owned(),
                    mask,
                    out_flag,
                    OsString::from("-r"),
                    OsString::from("-y"),
                ]
            }
            ArchiveDialect::Rar => {
                // rar treats a trailing separator as "destination directory".
                let mut dest = destination.as_os_str().to_owned();
                dest.push(std::path::MAIN_SEPARATOR_STR);
                vec![
                    OsString::from("e"),
                    OsString::from("-r"),
                    OsString::from("-y"),
                    archive.as_os_str().to_owned(),
                    mask,
                    dest,
                ]
            }
        }
    }

    fn run(&self, args: &[OsString]) -> std::io::Result<Output> {
        Command::new(&self.descriptor.program).args(args).output()
    }

    fn classify_extraction(&self, output: &Output) -> ExtractionOutcome {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reports_nothing = |text: &str| {
            text.contains("No files to process") || text.contains("No files to extract")
        };

        if output.status.success() {
            if reports_nothing(&stdout) || reports_nothing(&stderr) {
                return ExtractionOutcome::NotFound;
            }
            return ExtractionOutcome::Extracted;
        }

        let code = output.status.code();
        if (self.descriptor.dialect == ArchiveDialect::Rar && code == Some(RAR_NO_FILES_EXIT))
            || reports_nothing(&stdout)
            || reports_nothing(&stderr)
        {
            return ExtractionOutcome::NotFound;
        }
        ExtractionOutcome::ToolError {
            details: format!(
                "exit {}: {}",
                code.unwrap_or(-1),
                excerpt(if stderr.trim().is_empty() { &stdout } else { &stderr })
            ),
        }
    }
}

impl ArchiveEngine for ExternalArchiver {
    fn describe(&self) -> String {
        format!(
            "{} ({})",
            self.descriptor.dialect,
            self.descriptor.program.display()
        )
    }

    fn list_entries(&self, archive: &Path) -> Result<ContentListing> {
        let output = self
            .run(&self.listing_args(archive))
            .map_err(|err| SspError::ListingFailed {
                path: archive.to_path_buf(),
                details: format!("could not spawn {}: {err}", self.descriptor.program.display()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(SspError::ListingFailed {
                path: archive.to_path_buf(),
                details: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    excerpt(if stderr.trim().is_empty() { &stdout } else { &stderr })
                ),
            });
        }
        Ok(ContentListing::new(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }

    fn extract_by_pattern(
        &self,
        archive: &Path,
        extension: &str,
        destination: &Path,
    ) -> ExtractionOutcome {
        match self.run(&self.extraction_args(archive, extension, destination)) {
            Ok(output) => self.classify_extraction(&output),
            Err(err) => ExtractionOutcome::ToolError {
                details: format!("could not spawn {}: {err}", self.descriptor.program.display()),
            },
        }
    }
}

/// Trimmed single-paragraph excerpt, bounded on a char boundary.
fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= EXCERPT_LIMIT {
        return trimmed.replace('\n', " | ");
    }
    let mut end = EXCERPT_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", trimmed[..end].replace('\n', " | "))
}
