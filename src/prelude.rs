//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use schematic_sync_portal::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, SspError};

// Logging
pub use crate::logger::dual::{ActivityEvent, ActivityLoggerHandle, DualLoggerConfig, spawn_logger};

// Platform
pub use crate::platform::pal::{HostOs, JobSpec, RecurringJobInstaller, select_installer};
pub use crate::platform::signals::InterruptFlag;

// Shield
pub use crate::shield::engine::{
    ArchiveDialect, ArchiveEngine, CapabilityDescriptor, ContentListing, ExternalArchiver,
    ExtractionOutcome,
};
pub use crate::shield::extractor::{RescueReport, SelectiveExtractor};
pub use crate::shield::ledger::{ExclusionLedger, LedgerWrite};
pub use crate::shield::protection::{ProtectionReason, ProtectionRules};
pub use crate::shield::rules::{ClassificationResult, ContentClassifier, KeepExtensionSet, RuleSet};
pub use crate::shield::sweep::{
    ArchiveOutcome, SweepConfig, SweepOrchestrator, SweepPolicy, SweepReport,
};
pub use crate::shield::walker::{ArchiveFile, ArchiveWalker, WalkerConfig};

// Sync
pub use crate::sync::auth::{AuthProvider, CopypartyAuth, SessionHeader};
pub use crate::sync::deps::{DependencyChecker, DependencyReport};
pub use crate::sync::rclone::{RcloneSync, SyncOutcome};
