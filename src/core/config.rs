//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{Result, SspError};
use crate::core::paths::{config_dir, data_dir, home_dir};
use crate::shield::rules::RuleSet;
use crate::shield::sweep::SweepPolicy;

/// Full SSP configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub paths: PathsConfig,
    pub sync: SyncConfig,
    pub shield: ShieldConfig,
    pub rules: RuleSet,
}

/// Remote share credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl RemoteConfig {
    /// True once a URL has been configured.
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Filesystem paths used by ssp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    #[serde(skip)]
    pub config_file: PathBuf,
    /// Local mirror of the remote share; also the default sweep root.
    pub local_dir: PathBuf,
    pub ledger_file: PathBuf,
    /// rclone log file; `<local_dir>/sync_portal.log` when unset.
    pub sync_log: Option<PathBuf>,
    pub jsonl_log: PathBuf,
    pub sqlite_db: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cfg = config_dir();
        let data = data_dir();
        Self {
            config_file: cfg.join("config.toml"),
            local_dir: home_dir().join("Schematics"),
            ledger_file: cfg.join("schematics-exclude.txt"),
            sync_log: None,
            jsonl_log: data.join("activity.jsonl"),
            sqlite_db: data.join("activity.sqlite3"),
        }
    }
}

impl PathsConfig {
    pub fn effective_sync_log(&self) -> PathBuf {
        self.sync_log
            .clone()
            .unwrap_or_else(|| self.local_dir.join("sync_portal.log"))
    }
}

/// Mirror run behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub remote_name: String,
    /// Run the archive shield after each successful sync.
    pub run_shield: bool,
    /// Check for `manifest.txt` on the remote before syncing.
    pub check_manifest: bool,
    /// `rclone sync` (deletes local files missing on the remote) instead of
    /// `rclone copy`. Deleting also removes files the shield rescued.
    pub strict_mirror: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_name: "portal".to_string(),
            run_shield: true,
            check_manifest: true,
            strict_mirror: false,
        }
    }
}

/// Archive shield behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShieldConfig {
    pub enabled: bool,
    pub policy: SweepPolicy,
    pub parallelism: usize,
    /// Archive extensions without the leading dot, matched case-insensitively.
    pub archive_extensions: Vec<String>,
    /// Directory names never descended into.
    pub excluded_dirs: Vec<String>,
    /// Relative-path substrings that exempt an archive from any mutation.
    pub protect_markers: Vec<String>,
    /// Glob patterns (absolute or relative to the sweep root) that also protect.
    pub protected_paths: Vec<String>,
    /// Standalone rule file; takes precedence over `[rules]`.
    pub rules_file: Option<PathBuf>,
    /// Keep the archive when any keep-extension extraction reports a tool error.
    pub abort_on_extract_error: bool,
    /// Create the ledger file before a sweep instead of skipping ledger writes.
    pub create_ledger: bool,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SweepPolicy::Purge,
            parallelism: 1,
            archive_extensions: vec!["zip".to_string(), "7z".to_string(), "rar".to_string()],
            excluded_dirs: vec![
                "node_modules".to_string(),
                ".git".to_string(),
                crate::shield::sweep::ISOLATION_DIR.to_string(),
            ],
            protect_markers: vec!["bios".to_string()],
            protected_paths: Vec::new(),
            rules_file: None,
            abort_on_extract_error: false,
            create_ledger: false,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| SspError::io(&path_buf, source))?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(SspError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.resolve_rules()?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize to TOML and write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self).map_err(|e| SspError::Serialization {
            context: "toml",
            details: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SspError::io(parent, source))?;
        }
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, rendered).map_err(|source| SspError::io(&tmp, source))?;
        fs::rename(&tmp, path).map_err(|source| SspError::io(path, source))?;
        Ok(())
    }

    /// Copy with the remote password masked, for `config show`.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if !out.remote.password.is_empty() {
            out.remote.password = "********".to_string();
        }
        out
    }

    /// Deterministic hash of the effective config for logging.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(digest.iter().take(8).map(|b| format!("{b:02x}")).collect())
    }

    /// Replace the inline rule set with `shield.rules_file` when configured.
    fn resolve_rules(&mut self) -> Result<()> {
        if let Some(path) = &self.shield.rules_file {
            if !path.exists() {
                return Err(SspError::MissingConfig { path: path.clone() });
            }
            self.rules = RuleSet::load(path)?;
        }
        Ok(())
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // remote
        if let Some(raw) = lookup("SSP_REMOTE_URL") {
            self.remote.url = raw;
        }
        if let Some(raw) = lookup("SSP_REMOTE_USERNAME") {
            self.remote.username = raw;
        }
        if let Some(raw) = lookup("SSP_REMOTE_PASSWORD") {
            self.remote.password = raw;
        }

        // paths
        if let Some(raw) = lookup("SSP_LOCAL_DIR") {
            self.paths.local_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SSP_LEDGER_FILE") {
            self.paths.ledger_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SSP_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("SSP_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }

        // sync
        if let Some(raw) = lookup("SSP_SYNC_RUN_SHIELD") {
            self.sync.run_shield = parse_env_bool("SSP_SYNC_RUN_SHIELD", &raw)?;
        }
        if let Some(raw) = lookup("SSP_SYNC_CHECK_MANIFEST") {
            self.sync.check_manifest = parse_env_bool("SSP_SYNC_CHECK_MANIFEST", &raw)?;
        }
        if let Some(raw) = lookup("SSP_SYNC_STRICT_MIRROR") {
            self.sync.strict_mirror = parse_env_bool("SSP_SYNC_STRICT_MIRROR", &raw)?;
        }

        // shield
        if let Some(raw) = lookup("SSP_SHIELD_ENABLED") {
            self.shield.enabled = parse_env_bool("SSP_SHIELD_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("SSP_SHIELD_POLICY") {
            self.shield.policy = raw.parse().map_err(|details: String| SspError::ConfigParse {
                context: "env",
                details: format!("SSP_SHIELD_POLICY={raw:?}: {details}"),
            })?;
        }
        if let Some(raw) = lookup("SSP_SHIELD_PARALLELISM") {
            self.shield.parallelism = parse_env_usize("SSP_SHIELD_PARALLELISM", &raw)?;
        }
        if let Some(raw) = lookup("SSP_SHIELD_RULES_FILE") {
            self.shield.rules_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("SSP_SHIELD_ABORT_ON_EXTRACT_ERROR") {
            self.shield.abort_on_extract_error =
                parse_env_bool("SSP_SHIELD_ABORT_ON_EXTRACT_ERROR", &raw)?;
        }
        if let Some(raw) = lookup("SSP_SHIELD_CREATE_LEDGER") {
            self.shield.create_ledger = parse_env_bool("SSP_SHIELD_CREATE_LEDGER", &raw)?;
        }

        Ok(())
    }

    fn normalize_paths(&mut self) {
        let s = self.paths.local_dir.to_string_lossy();
        if s.len() > 1
            && let Some(stripped) = s.strip_suffix('/')
        {
            self.paths.local_dir = PathBuf::from(stripped);
        }
        for ext in &mut self.shield.archive_extensions {
            *ext = ext.trim_start_matches('.').to_lowercase();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shield.parallelism == 0 {
            return Err(SspError::InvalidConfig {
                details: "shield.parallelism must be >= 1".to_string(),
            });
        }
        if self.shield.archive_extensions.is_empty() {
            return Err(SspError::InvalidConfig {
                details: "shield.archive_extensions must not be empty".to_string(),
            });
        }
        if let Some(bad) = self
            .shield
            .archive_extensions
            .iter()
            .find(|e| e.trim_start_matches('.').is_empty())
        {
            return Err(SspError::InvalidConfig {
                details: format!("shield.archive_extensions contains an empty entry ({bad:?})"),
            });
        }
        if self.shield.protect_markers.iter().any(|m| m.trim().is_empty()) {
            return Err(SspError::InvalidConfig {
                details: "shield.protect_markers must not contain empty strings".to_string(),
            });
        }
        if self.sync.remote_name.is_empty()
            || !self
                .sync
                .remote_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(SspError::InvalidConfig {
                details: format!(
                    "sync.remote_name {:?} must be non-empty and contain only [A-Za-z0-9_]",
                    self.sync.remote_name
                ),
            });
        }

        // Validate protected_paths glob patterns are compilable.
        for pattern in &self.shield.protected_paths {
            crate::shield::protection::validate_glob_pattern(pattern)?;
        }

        self.rules.validate()
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_usize(name: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|error| SspError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| SspError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}
