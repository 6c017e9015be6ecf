//! SSP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SspError>;

/// Top-level error type for the Schematic Sync Portal.
#[derive(Debug, Error)]
pub enum SspError {
    #[error("[SSP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SSP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SSP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SSP-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[SSP-2001] no archive tool found on this host (looked for: {searched})")]
    EngineUnavailable { searched: String },

    #[error("[SSP-2002] could not list archive {path}: {details}")]
    ListingFailed { path: PathBuf, details: String },

    #[error("[SSP-2003] extraction of {pattern} from {path} failed: {details}")]
    ExtractionFailed {
        path: PathBuf,
        pattern: String,
        details: String,
    },

    #[error("[SSP-2004] could not remove archive {path}: {details}")]
    DeletionFailed { path: PathBuf, details: String },

    #[error("[SSP-2005] refusing to sweep unsafe root {path}: {reason}")]
    UnsafeRoot { path: PathBuf, reason: String },

    #[error("[SSP-2006] ledger failure at {path}: {details}")]
    Ledger { path: PathBuf, details: String },

    #[error("[SSP-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SSP-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[SSP-2201] authentication against {url} failed: {details}")]
    AuthFailed { url: String, details: String },

    #[error("[SSP-2202] external command {program} failed: {details}")]
    CommandFailed { program: String, details: String },

    #[error("[SSP-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SSP-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl SspError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "SSP-1001",
            Self::MissingConfig { .. } => "SSP-1002",
            Self::ConfigParse { .. } => "SSP-1003",
            Self::UnsupportedPlatform { .. } => "SSP-1101",
            Self::EngineUnavailable { .. } => "SSP-2001",
            Self::ListingFailed { .. } => "SSP-2002",
            Self::ExtractionFailed { .. } => "SSP-2003",
            Self::DeletionFailed { .. } => "SSP-2004",
            Self::UnsafeRoot { .. } => "SSP-2005",
            Self::Ledger { .. } => "SSP-2006",
            Self::Serialization { .. } => "SSP-2101",
            Self::Sql { .. } => "SSP-2102",
            Self::AuthFailed { .. } => "SSP-2201",
            Self::CommandFailed { .. } => "SSP-2202",
            Self::Io { .. } => "SSP-3002",
            Self::Runtime { .. } => "SSP-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// A failed listing is retryable because a partially downloaded archive
    /// usually lists fine after the next sync completes it.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ListingFailed { .. }
                | Self::DeletionFailed { .. }
                | Self::AuthFailed { .. }
                | Self::CommandFailed { .. }
                | Self::Sql { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for SspError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for SspError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SspError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
