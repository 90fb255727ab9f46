//! Data directory resolution
//!
//! The player keeps its database (settings, resume positions, scan
//! cache) under a single data directory, resolved in priority order:
//!
//! 1. Command-line argument (highest priority)
//! 2. `ATTACCA_DATA_DIR` environment variable
//! 3. `data_dir` key in the TOML config file
//! 4. OS-dependent default (fallback)

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "ATTACCA_DATA_DIR";

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub device: Option<String>,
}

impl Config {
    /// Build the configuration from an optional CLI override and an
    /// optional output device name.
    pub fn resolve(data_dir_arg: Option<&Path>, device: Option<String>) -> Result<Self> {
        let data_dir = resolve_data_dir(data_dir_arg)?;
        let db_path = data_dir.join("player.db");
        Ok(Self {
            data_dir,
            db_path,
            device,
        })
    }
}

/// Resolve the data directory following the priority order above.
pub fn resolve_data_dir(cli_arg: Option<&Path>) -> Result<PathBuf> {
    // Priority 1: command-line argument
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    // Priority 2: environment variable
    if let Ok(path) = std::env::var(DATA_DIR_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    // Priority 3: TOML config file
    if let Some(config_path) = find_config_file() {
        if let Some(dir) = read_data_dir_key(&config_path)? {
            return Ok(dir);
        }
    }

    // Priority 4: OS-dependent default
    default_data_dir()
}

/// Locate the config file for the platform, if one exists.
///
/// Linux checks the per-user location first, then the system-wide one.
fn find_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("attacca").join("config.toml"));
    if let Some(path) = &user_config {
        if path.exists() {
            return user_config;
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/attacca/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

fn read_data_dir_key(config_path: &Path) -> Result<Option<PathBuf>> {
    let content = std::fs::read_to_string(config_path)?;
    let parsed: toml::Value = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Malformed {}: {}", config_path.display(), e)))?;
    Ok(parsed
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from))
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|d| d.join("attacca"))
        .ok_or_else(|| {
            Error::Config("Could not determine a data directory for this platform".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    #[serial_test::serial]
    fn cli_argument_beats_environment() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/attacca-env");
        let resolved = resolve_data_dir(Some(Path::new("/tmp/attacca-cli"))).unwrap();
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(resolved, PathBuf::from("/tmp/attacca-cli"));
    }

    #[test]
    #[serial_test::serial]
    fn environment_variable_is_used_when_no_cli_arg() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/attacca-env");
        let resolved = resolve_data_dir(None).unwrap();
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(resolved, PathBuf::from("/tmp/attacca-env"));
    }

    #[test]
    #[serial_test::serial]
    fn empty_environment_variable_is_ignored() {
        std::env::set_var(DATA_DIR_ENV, "");
        let resolved = resolve_data_dir(None).unwrap();
        std::env::remove_var(DATA_DIR_ENV);
        assert_ne!(resolved, PathBuf::from(""));
    }

    #[test]
    fn config_file_key_is_parsed() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "data_dir = \"/srv/music-data\"\n").unwrap();

        let parsed = read_data_dir_key(&config_path).unwrap();
        assert_eq!(parsed, Some(PathBuf::from("/srv/music-data")));
    }

    #[test]
    fn config_file_without_key_yields_none() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "volume = 0.5\n").unwrap();

        assert_eq!(read_data_dir_key(&config_path).unwrap(), None);
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "data_dir = [unclosed\n").unwrap();

        assert!(read_data_dir_key(&config_path).is_err());
    }

    #[test]
    fn config_derives_db_path_from_data_dir() {
        let config = Config::resolve(Some(Path::new("/tmp/attacca-test")), None).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/attacca-test"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/attacca-test/player.db"));
    }
}
