//! Archive discovery under a sweep root.
//!
//! Depth-first, deterministic (entries sorted by name at each level), never
//! follows symlinks, skips excluded directory names, and only yields archives
//! whose path resolves inside the root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::errors::{Result, SspError};
use crate::core::paths::{relative_within, resolve_absolute_path, to_slash};

/// Hard recursion bound; mirrors of real shares are never this deep.
const MAX_DEPTH: usize = 64;

/// One archive found by the walker. Identity is the absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArchiveFile {
    /// Path used for every tool call.
    pub absolute: PathBuf,
    /// Path below the sweep root.
    pub relative: PathBuf,
    /// Directory rescued entries are extracted into.
    pub parent: PathBuf,
}

impl ArchiveFile {
    /// Build from a root and a path inside it; `None` if the path escapes.
    pub fn from_root(root: &Path, absolute: &Path) -> Option<Self> {
        let relative = relative_within(root, absolute)?;
        let parent = absolute.parent()?.to_path_buf();
        Some(Self {
            absolute: absolute.to_path_buf(),
            relative,
            parent,
        })
    }

    /// Forward-slash relative path, as written to the ledger.
    pub fn relative_slash(&self) -> String {
        to_slash(&self.relative)
    }

    /// Final path component, lossily decoded.
    pub fn file_name(&self) -> String {
        self.absolute
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Walker settings derived from `ShieldConfig`.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Lower-cased extensions without the dot.
    pub archive_extensions: Vec<String>,
    /// Directory names never descended into (exact match).
    pub excluded_dirs: Vec<String>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            archive_extensions: vec!["zip".to_string(), "7z".to_string(), "rar".to_string()],
            excluded_dirs: vec![
                "node_modules".to_string(),
                ".git".to_string(),
                crate::shield::sweep::ISOLATION_DIR.to_string(),
            ],
        }
    }
}

impl WalkerConfig {
    /// Extensions are matched without the dot and ignoring case.
    pub fn new(archive_extensions: &[String], excluded_dirs: &[String]) -> Self {
        Self {
            archive_extensions: archive_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            excluded_dirs: excluded_dirs.to_vec(),
        }
    }

    fn is_archive(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            self.archive_extensions.iter().any(|a| *a == ext)
        })
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excluded_dirs.iter().any(|d| d == name)
    }
}

/// Sequential archive walker.
#[derive(Debug, Clone)]
pub struct ArchiveWalker {
    config: WalkerConfig,
}

impl ArchiveWalker {
    /// Walker over the given settings.
    pub fn new(config: WalkerConfig) -> Self {
        Self { config }
    }

    /// Every archive under `root`, in sorted depth-first order.
    ///
    /// Unreadable subdirectories are skipped; an unreadable root is an error.
    pub fn collect(&self, root: &Path) -> Result<Vec<ArchiveFile>> {
        let root = resolve_absolute_path(root);
        let meta = fs::metadata(&root).map_err(|source| SspError::io(&root, source))?;
        if !meta.is_dir() {
            return Err(SspError::UnsafeRoot {
                path: root,
                reason: "not a directory".to_string(),
            });
        }

        let mut found = Vec::new();
        let mut stack: Vec<(PathBuf, usize)> = vec![(root.clone(), 0)];
        while let Some((dir, depth)) = stack.pop() {
            let Ok(read) = fs::read_dir(&dir) else {
                continue;
            };
            let mut entries: Vec<fs::DirEntry> = read.filter_map(std::result::Result::ok).collect();
            entries.sort_by_key(fs::DirEntry::file_name);

            let mut subdirs = Vec::new();
            for entry in entries {
                let Ok(ft) = entry.file_type() else {
                    continue;
                };
                // Symlinks are never followed, whether they point at files or dirs.
                if ft.is_symlink() {
                    continue;
                }
                let path = entry.path();
                if ft.is_dir() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if depth < MAX_DEPTH && !self.config.is_excluded(&name) {
                        subdirs.push(path);
                    }
                } else if ft.is_file()
                    && self.config.is_archive(&path)
                    && let Some(archive) = ArchiveFile::from_root(&root, &path)
                {
                    found.push(archive);
                }
            }
            // Reverse so the stack pops subdirectories in sorted order.
            for sub in subdirs.into_iter().rev() {
                stack.push((sub, depth + 1));
            }
        }
        Ok(found)
    }
}
