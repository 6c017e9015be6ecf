//! Versioned rule set and the listing classifier built from it.
//!
//! A rule set is three ordered lists of case-insensitive substrings: GARBAGE
//! signatures (cracks, loaders, bypass tools), SAFE signatures (firmware
//! flashing utilities that must survive), and KEEP extensions (board data worth
//! rescuing before a purge). Classification is pure membership: no scoring,
//! no weighting, no position sensitivity.

use std::fs;
use std::path::Path;

use memchr::memmem;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{Result, SspError};

/// Current rule-set schema version.
pub const RULESET_VERSION: u32 = 1;

const DEFAULT_GARBAGE: &[&str] = &[
    "crack",
    "patch",
    "keygen",
    "loader",
    "bypass",
    "activator",
    "lpk.dll",
    "TVW specific software",
];

const DEFAULT_SAFE: &[&str] = &[
    "flash", "afud", "insyde", "h2o", "utility", "update", "phlash", "ami", "phoenix", "dell",
    "hp", "lenovo", "bios",
];

const DEFAULT_KEEP_EXTENSIONS: &[&str] = &[
    ".tvw", ".brd", ".fz", ".cad", ".asc", ".pdf", ".bvr", ".pcb", ".sqlite3", ".obdata",
    ".obdlocal", ".obdlog", ".obdq", ".bin", ".rom", ".cap", ".fd", ".wph", ".hex", ".txt",
];

/// Externally configurable rule set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuleSet {
    /// Schema version; must not exceed [`RULESET_VERSION`].
    pub version: u32,
    /// Substrings that mark cracking tools.
    pub garbage: Vec<String>,
    /// Substrings that mark legitimate firmware utilities.
    pub safe: Vec<String>,
    /// Extensions rescued before a purge, with the leading dot.
    pub keep_extensions: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            version: RULESET_VERSION,
            garbage: to_owned(DEFAULT_GARBAGE),
            safe: to_owned(DEFAULT_SAFE),
            keep_extensions: to_owned(DEFAULT_KEEP_EXTENSIONS),
        }
    }
}

impl RuleSet {
    /// Load a standalone rule file (same keys as the `[rules]` config table).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| SspError::io(path, source))?;
        let rules: Self = toml::from_str(&raw)?;
        rules.validate()?;
        Ok(rules)
    }

    /// Reject unknown versions, empty pattern lists and dotless extensions.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(SspError::InvalidConfig {
                details: "rules.version must be >= 1".to_string(),
            });
        }
        if self.version > RULESET_VERSION {
            return Err(SspError::InvalidConfig {
                details: format!(
                    "rules.version {} is newer than supported version {RULESET_VERSION}",
                    self.version
                ),
            });
        }
        for (list, patterns) in [("garbage", &self.garbage), ("safe", &self.safe)] {
            if let Some(blank) = patterns.iter().find(|p| p.trim().is_empty()) {
                return Err(SspError::InvalidConfig {
                    details: format!("rules.{list} contains an empty pattern ({blank:?})"),
                });
            }
        }
        for pattern in &self.garbage {
            let lowered = pattern.to_lowercase();
            if self.safe.iter().any(|s| s.to_lowercase() == lowered) {
                return Err(SspError::InvalidConfig {
                    details: format!("pattern {pattern:?} appears in both rules.garbage and rules.safe"),
                });
            }
        }
        for ext in &self.keep_extensions {
            if !ext.starts_with('.') || ext.len() < 2 {
                return Err(SspError::InvalidConfig {
                    details: format!("rules.keep_extensions entry {ext:?} must look like \".ext\""),
                });
            }
            if ext.contains(['/', '\\', '*', '?']) {
                return Err(SspError::InvalidConfig {
                    details: format!("rules.keep_extensions entry {ext:?} must not contain path or glob characters"),
                });
            }
        }
        Ok(())
    }

    /// Short, stable identity of the rule contents.
    ///
    /// Patterns are lower-cased before hashing, so reordering case variants of
    /// the same needle does not change the verdicts and does not change the
    /// fingerprint either.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for (tag, list) in [
            ("garbage", &self.garbage),
            ("safe", &self.safe),
            ("keep", &self.keep_extensions),
        ] {
            hasher.update(tag.as_bytes());
            let mut normalized: Vec<String> = list.iter().map(|p| p.to_lowercase()).collect();
            normalized.sort();
            normalized.dedup();
            for item in normalized {
                hasher.update([0u8]);
                hasher.update(item.as_bytes());
            }
        }
        let digest = hasher.finalize();
        digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
    }

    /// Classifier over this rule set's patterns.
    pub fn classifier(&self) -> ContentClassifier {
        ContentClassifier::new(&self.garbage, &self.safe)
    }

    /// De-duplicated keep extensions in rule order.
    pub fn keep_extension_set(&self) -> KeepExtensionSet {
        KeepExtensionSet::new(self.keep_extensions.iter().cloned())
    }
}

fn to_owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// ──────────────────── classification ────────────────────

/// Outcome of classifying one listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ClassificationResult {
    /// A garbage pattern occurs in the listing.
    pub has_garbage: bool,
    /// A safe pattern occurs in the listing.
    pub has_safe_tool: bool,
    /// First GARBAGE pattern that matched, for reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub garbage_hit: Option<String>,
    /// First SAFE pattern that matched, for reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_hit: Option<String>,
}

impl ClassificationResult {
    /// Garbage present and no firmware tool to preserve.
    pub const fn warrants_purge(&self) -> bool {
        self.has_garbage && !self.has_safe_tool
    }

    /// `garbage`, `safe-tool` or `clean`.
    pub const fn label(&self) -> &'static str {
        match (self.has_garbage, self.has_safe_tool) {
            (true, false) => "garbage",
            (_, true) => "safe-tool",
            (false, false) => "clean",
        }
    }
}

#[derive(Debug, Clone)]
struct Needle {
    original: String,
    finder: memmem::Finder<'static>,
}

impl Needle {
    fn new(pattern: &str) -> Self {
        let lowered = pattern.to_lowercase();
        Self {
            original: pattern.to_string(),
            finder: memmem::Finder::new(lowered.as_bytes()).into_owned(),
        }
    }
}

/// Case-insensitive substring classifier over raw listing text.
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    garbage: Vec<Needle>,
    safe: Vec<Needle>,
}

impl Default for ContentClassifier {
    fn default() -> Self {
        RuleSet::default().classifier()
    }
}

impl ContentClassifier {
    /// Build needles from raw patterns. Matching ignores case.
    pub fn new(garbage: &[String], safe: &[String]) -> Self {
        Self {
            garbage: garbage.iter().map(|p| Needle::new(p)).collect(),
            safe: safe.iter().map(|p| Needle::new(p)).collect(),
        }
    }

    /// Classify listing text. The listing is lower-cased once; each needle is
    /// searched independently.
    pub fn classify(&self, listing: &str) -> ClassificationResult {
        let haystack = listing.to_lowercase();
        let garbage_hit = first_hit(&self.garbage, haystack.as_bytes());
        let safe_hit = first_hit(&self.safe, haystack.as_bytes());
        ClassificationResult {
            has_garbage: garbage_hit.is_some(),
            has_safe_tool: safe_hit.is_some(),
            garbage_hit,
            safe_hit,
        }
    }
}

fn first_hit(needles: &[Needle], haystack: &[u8]) -> Option<String> {
    needles
        .iter()
        .find(|n| n.finder.find(haystack).is_some())
        .map(|n| n.original.clone())
}

// ──────────────────── keep extensions ────────────────────

/// Ordered, de-duplicated set of extensions to rescue before a purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepExtensionSet {
    extensions: Vec<String>,
}

impl Default for KeepExtensionSet {
    fn default() -> Self {
        RuleSet::default().keep_extension_set()
    }
}

impl KeepExtensionSet {
    /// Keeps the first occurrence of each extension.
    pub fn new(extensions: impl IntoIterator<Item = String>) -> Self {
        let mut out: Vec<String> = Vec::new();
        for ext in extensions {
            if !out.contains(&ext) {
                out.push(ext);
            }
        }
        Self { extensions: out }
    }

    /// Extensions in rule order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    /// Number of distinct extensions.
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// True when nothing would be rescued.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Exact, case-sensitive membership.
    pub fn contains(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e == ext)
    }
}
