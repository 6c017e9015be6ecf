//! Shared path manipulation utilities.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::core::errors::{Result, SspError};

/// Directories a sweep must never run against.
const SYSTEM_PREFIXES: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/etc",
    "/var",
    "/windows",
    "/program files",
];

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the path is made absolute relative
/// to CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Path of `path` relative to `root`, or `None` when it escapes the root.
///
/// Both sides are normalized syntactically first so `root/a/../b.zip` resolves
/// to `b.zip` while `root/../other.zip` is rejected.
pub fn relative_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let root = normalize_syntactic(root);
    let path = normalize_syntactic(path);
    let rel = path.strip_prefix(&root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Forward-slash rendering of a relative path, as written to the ledger and
/// handed to rclone's `--exclude-from`.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Reject sweep roots that would put system files at risk.
pub fn ensure_safe_sweep_root(path: &Path) -> Result<()> {
    let raw = path.to_string_lossy();
    if raw.trim().is_empty() {
        return Err(SspError::UnsafeRoot {
            path: path.to_path_buf(),
            reason: "empty path".to_string(),
        });
    }

    let resolved = resolve_absolute_path(path);
    if resolved.parent().is_none() {
        return Err(SspError::UnsafeRoot {
            path: resolved,
            reason: "filesystem root".to_string(),
        });
    }

    let normalized = resolved.to_string_lossy().replace('\\', "/").to_lowercase();
    // Drop a Windows drive prefix ("c:") so "/windows" matches "C:/Windows".
    let without_drive = match normalized.split_once(':') {
        Some((drive, rest)) if drive.len() == 1 => rest.to_string(),
        _ => normalized,
    };
    if without_drive.is_empty() || without_drive == "/" {
        return Err(SspError::UnsafeRoot {
            path: resolved,
            reason: "filesystem root".to_string(),
        });
    }
    for prefix in SYSTEM_PREFIXES {
        if without_drive == *prefix || without_drive.starts_with(&format!("{prefix}/")) {
            return Err(SspError::UnsafeRoot {
                path: resolved,
                reason: format!("inside system directory {prefix}"),
            });
        }
    }
    Ok(())
}

/// Home directory from the environment (`HOME`, then `USERPROFILE`).
pub fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

/// Per-user configuration directory for ssp.
pub fn config_dir() -> PathBuf {
    env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("ssp")
}

/// Per-user data directory for ssp (activity logs).
pub fn data_dir() -> PathBuf {
    env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(|| home_dir().join(".local/share"))
        .join("ssp")
}
