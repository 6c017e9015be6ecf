//! Selective extractor: rescue keep-extension entries before a purge.

use std::path::Path;

use serde::Serialize;

use crate::shield::engine::{ArchiveEngine, ExtractionOutcome};
use crate::shield::rules::KeepExtensionSet;

/// Outcome of one extension's extraction call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionAttempt {
    /// Keep extension including the leading dot.
    pub extension: String,
    /// What the tool reported.
    #[serde(flatten)]
    pub outcome: ExtractionOutcome,
}

/// Aggregated per-extension outcomes for one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RescueReport {
    /// One entry per keep extension, in rule order.
    pub attempts: Vec<ExtensionAttempt>,
}

impl RescueReport {
    /// Number of extraction calls issued.
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Attempts that extracted at least one entry.
    pub fn extracted_count(&self) -> usize {
        self.count(|o| matches!(o, ExtractionOutcome::Extracted))
    }

    /// Attempts whose mask matched nothing.
    pub fn not_found_count(&self) -> usize {
        self.count(|o| matches!(o, ExtractionOutcome::NotFound))
    }

    /// Attempts that failed in the tool.
    pub fn tool_error_count(&self) -> usize {
        self.count(ExtractionOutcome::is_tool_error)
    }

    /// True when the rescue may be incomplete.
    pub fn has_tool_errors(&self) -> bool {
        self.tool_error_count() > 0
    }

    /// Failed attempts only.
    pub fn failures(&self) -> impl Iterator<Item = &ExtensionAttempt> {
        self.attempts.iter().filter(|a| a.outcome.is_tool_error())
    }

    fn count(&self, pred: impl Fn(&ExtractionOutcome) -> bool) -> usize {
        self.attempts.iter().filter(|a| pred(&a.outcome)).count()
    }
}

/// Issues one flat extraction per keep extension.
pub struct SelectiveExtractor<'a> {
    engine: &'a dyn ArchiveEngine,
    keep: &'a KeepExtensionSet,
}

impl<'a> SelectiveExtractor<'a> {
    /// Borrow the engine and keep set for one sweep.
    pub fn new(engine: &'a dyn ArchiveEngine, keep: &'a KeepExtensionSet) -> Self {
        Self { engine, keep }
    }

    /// Attempt every keep extension in order. A failed extension never stops
    /// the remaining ones; entries land flattened in `destination`.
    pub fn rescue(&self, archive: &Path, destination: &Path) -> RescueReport {
        let attempts = self
            .keep
            .iter()
            .map(|ext| ExtensionAttempt {
                extension: ext.to_string(),
                outcome: self.engine.extract_by_pattern(archive, ext, destination),
            })
            .collect();
        RescueReport { attempts }
    }
}
