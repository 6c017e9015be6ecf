//! Archive protection: BIOS-style path markers and config-level glob patterns.
//!
//! Two sources of protection, checked before an archive is ever listed:
//! - **Markers**: case-insensitive substrings of the archive's path relative to
//!   the sweep root (default `bios`). Firmware-recovery bundles routinely ship
//!   next to flashing tools that look like cracks, so their paths are exempt.
//! - **Patterns**: shell-style globs from `shield.protected_paths`, matched
//!   against both the relative and the absolute path of the archive and of
//!   every ancestor directory.

use std::path::Path;

use regex::Regex;
use serde::Serialize;

use crate::core::errors::{Result, SspError};
use crate::core::paths::to_slash;

/// Why an archive was exempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProtectionReason {
    /// Relative path contains this marker.
    Marker(String),
    /// Path (or an ancestor) matches this configured glob.
    Pattern(String),
}

impl std::fmt::Display for ProtectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marker(marker) => write!(f, "path contains protected marker {marker:?}"),
            Self::Pattern(pattern) => write!(f, "protected by config pattern: {pattern}"),
        }
    }
}

/// Compiled glob pattern for path matching.
#[derive(Debug, Clone)]
struct GlobPattern {
    original: String,
    compiled: Regex,
}

/// Read-only protection rules shared by every sweep worker.
#[derive(Debug, Clone)]
pub struct ProtectionRules {
    markers: Vec<String>,
    patterns: Vec<GlobPattern>,
}

impl Default for ProtectionRules {
    fn default() -> Self {
        Self {
            markers: vec!["bios".to_string()],
            patterns: Vec::new(),
        }
    }
}

impl ProtectionRules {
    /// Build rules from marker substrings and glob patterns.
    ///
    /// Patterns use shell-style globs: `*` matches within a path component,
    /// `**` matches across path components, `?` matches a single character.
    pub fn new(markers: &[String], patterns: &[String]) -> Result<Self> {
        let compiled = patterns
            .iter()
            .map(|pat| {
                Ok(GlobPattern {
                    original: pat.clone(),
                    compiled: glob_to_regex(pat)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            markers: markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            patterns: compiled,
        })
    }

    /// Number of non-empty path markers.
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Number of compiled protection globs.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Reason `relative` (under the sweep root) / `absolute` is exempt, if any.
    ///
    /// Markers are checked first; they are the only rule that applies without
    /// configuration.
    pub fn check(&self, relative: &Path, absolute: &Path) -> Option<ProtectionReason> {
        let rel = to_slash(relative).to_lowercase();
        if let Some(marker) = self.markers.iter().find(|m| rel.contains(m.as_str())) {
            return Some(ProtectionReason::Marker(marker.clone()));
        }
        if self.patterns.is_empty() {
            return None;
        }
        for candidate in [relative, absolute] {
            let mut current = Some(candidate);
            while let Some(p) = current {
                if p.as_os_str().is_empty() {
                    break;
                }
                let p_str = normalize_path_for_matching(p);
                if let Some(pat) = self.patterns.iter().find(|pat| pat.compiled.is_match(&p_str)) {
                    return Some(ProtectionReason::Pattern(pat.original.clone()));
                }
                current = p.parent();
            }
        }
        None
    }

    #[cfg(test)]
    fn is_protected(&self, relative: &Path, absolute: &Path) -> bool {
        self.check(relative, absolute).is_some()
    }
}

/// Validate that a glob pattern can be compiled.
pub fn validate_glob_pattern(pattern: &str) -> Result<()> {
    glob_to_regex(pattern).map(|_| ())
}

/// Convert a shell-style glob pattern to a regex.
///
/// Supports:
/// - `**` → matches any path (including separators)
/// - `*`  → matches anything except `/`
/// - `?`  → matches a single character except `/`
///
/// Every other regex metacharacter is literal.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(SspError::InvalidConfig {
            details: "protected path pattern must not be empty".to_string(),
        });
    }
    let normalized_pattern = pattern.replace('\\', "/");
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push_str("(?i)^");

    let chars: Vec<char> = normalized_pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                if i + 2 < chars.len() && chars[i + 2] == '/' {
                    regex_str.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex_str.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex_str.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex_str.push_str("[^/]");
                i += 1;
            }
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex_str.push('\\');
                regex_str.push(chars[i]);
                i += 1;
            }
            c => {
                regex_str.push(c);
                i += 1;
            }
        }
    }

    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| SspError::InvalidConfig {
        details: format!("invalid glob pattern {pattern:?}: {err}"),
    })
}

fn normalize_path_for_matching(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
