//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. `veritag.toml` next to the executable
//! 2. `$HOME/.config/veritag/config.toml` (or `%LOCALAPPDATA%\VeriTag\config.toml`)
//! 3. Environment variable overrides (e.g. `VERITAG_DB`)
//!
//! CLI arguments always take precedence over config file values.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VeritagConfig {
    pub paths: PathsConfig,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
}

/// Upper bounds on per-call array inputs, so a single oversized call cannot
/// exhaust the process.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum identifier count accepted by `register_batch`.
    pub max_batch_identifiers: usize,
    /// Maximum pair count accepted by `verify_batch`.
    pub max_verify_items: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file for SIEM integration.
    /// Empty string means no file logging.
    pub json_log_file: String,
    /// Whether to also output JSON to stdout (for container/SIEM pipelines).
    pub json_stdout: bool,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for VeritagConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            limits: Limits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("veritag-registry.db"),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_batch_identifiers: 4096,
            max_verify_items: 512,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl VeritagConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: VeritagConfig =
            toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Load config using the standard search order:
    /// 1. Explicit path (if given)
    /// 2. `veritag.toml` next to the running binary
    /// 3. `$HOME/.config/veritag/config.toml` / `%LOCALAPPDATA%\VeriTag\config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        // Next to executable.
        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("veritag.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        // Platform-standard config directory.
        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("VeriTag").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("veritag")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("VERITAG_DB") {
            self.paths.db = PathBuf::from(db);
        }
        if let Ok(level) = std::env::var("VERITAG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(n) = std::env::var("VERITAG_MAX_BATCH_IDENTIFIERS") {
            if let Ok(n) = n.parse() {
                self.limits.max_batch_identifiers = n;
            }
        }
        if let Ok(n) = std::env::var("VERITAG_MAX_VERIFY_ITEMS") {
            if let Ok(n) = n.parse() {
                self.limits.max_verify_items = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = VeritagConfig::default();
        assert_eq!(cfg.paths.db, PathBuf::from("veritag-registry.db"));
        assert_eq!(cfg.limits.max_batch_identifiers, 4096);
        assert_eq!(cfg.limits.max_verify_items, 512);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn load_missing_file_returns_default() {
        let cfg = VeritagConfig::load_from(Path::new("nonexistent_file_xyz.toml")).unwrap();
        assert_eq!(cfg.limits.max_verify_items, 512);
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
[limits]
max_verify_items = 64
"#;
        let cfg: VeritagConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.limits.max_verify_items, 64);
        // Other sections should be defaults.
        assert_eq!(cfg.limits.max_batch_identifiers, 4096);
        assert_eq!(cfg.paths.db, PathBuf::from("veritag-registry.db"));
    }
}
