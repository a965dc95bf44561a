//! Application configuration with defaults and environment overrides.
//!
//! Values resolve in order: built-in defaults, then environment
//! variables (`MURMUR_PORT`, `MURMUR_DB`). The data directory is
//! created on load with owner-only permissions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{MurmurError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default TCP listen port.
pub const DEFAULT_PORT: u16 = 9999;

/// Default data directory, relative to the user's home.
pub const DEFAULT_DATA_DIR: &str = "~/.murmur";

/// Default store file, relative to the user's home.
pub const DEFAULT_DB_PATH: &str = "~/.murmur/murmur.db";

/// Environment variable overriding the listen port.
pub const ENV_PORT: &str = "MURMUR_PORT";

/// Environment variable overriding the store path.
pub const ENV_DB: &str = "MURMUR_DB";

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Application-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Preferred TCP listen port. May be overridden at startup if the
    /// port is already bound.
    pub port: u16,
    /// Path to the SQLite store file.
    pub db_path: PathBuf,
    /// Directory for the store, identity key, and other node state.
    pub data_dir: PathBuf,
    /// Log level filter: `trace`, `debug`, `info`, `warn`, or `error`.
    pub log_level: String,
    /// Soft cap on simultaneous peer connections.
    pub max_peers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: expand_home(DEFAULT_DB_PATH),
            data_dir: expand_home(DEFAULT_DATA_DIR),
            log_level: "info".into(),
            max_peers: 100,
        }
    }
}

impl AppConfig {
    /// Loads the configuration: defaults merged with environment
    /// overrides, then creates the data directory.
    ///
    /// # Errors
    ///
    /// Returns [`MurmurError::Config`] if an override is malformed or
    /// the data directory cannot be created.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(port) = std::env::var(ENV_PORT) {
            cfg.port = port.parse().map_err(|_| MurmurError::Config {
                reason: format!("{ENV_PORT} must be a port number, got '{port}'"),
            })?;
        }

        if let Ok(db) = std::env::var(ENV_DB) {
            cfg.db_path = expand_home(&db);
        }

        cfg.ensure_data_dir()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Creates the data directory (owner-only on Unix) if absent.
    pub fn ensure_data_dir(&self) -> Result<()> {
        create_private_dir(&self.data_dir)
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(MurmurError::Config {
                reason: "max_peers must be greater than 0".into(),
            });
        }
        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(MurmurError::Config {
                    reason: format!("unknown log level '{other}'"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Expands a leading `~/` to the user's home directory.
///
/// Paths without the prefix are returned unchanged. If the home
/// directory cannot be determined the prefix is stripped, leaving a
/// relative path.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(rest),
        },
        None => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Creates `dir` and ancestors; on Unix the leaf is restricted to the
/// owner (0700).
pub fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| MurmurError::Config {
        reason: format!("failed to create directory {}: {e}", dir.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(dir, perms).map_err(|e| MurmurError::Config {
            reason: format!("failed to restrict {}: {e}", dir.display()),
        })?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_peers_rejected() {
        let cfg = AppConfig {
            max_peers: 0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_log_level_rejected() {
        let cfg = AppConfig {
            log_level: "loud".into(),
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn expand_home_strips_tilde() {
        let expanded = expand_home("~/.murmur/murmur.db");
        assert!(!expanded.to_string_lossy().contains('~'));
    }

    #[test]
    fn create_private_dir_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/data");
        create_private_dir(&dir).unwrap();
        create_private_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn create_private_dir_restricts_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("private");
        create_private_dir(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
