//! Configuration loading from `~/.duplex/config.toml` with defaults.

use duplex_wire::DuplexConfig;
use std::path::{Path, PathBuf};

/// A loaded config plus any problem met while loading it.
///
/// The problem is reported once logging is up, since the log filter itself
/// comes from the config.
pub struct LoadedConfig {
    pub config: DuplexConfig,
    pub path: PathBuf,
    pub warning: Option<String>,
}

/// Load the config file, falling back to defaults if it is missing or bad.
pub fn load_config(path: Option<&Path>) -> LoadedConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return LoadedConfig {
            config: DuplexConfig::default(),
            path: config_path,
            warning: None,
        };
    }

    let warning = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<DuplexConfig>(&contents) {
            Ok(config) => {
                return LoadedConfig {
                    config,
                    path: config_path,
                    warning: None,
                }
            }
            Err(e) => format!(
                "Failed to parse config {}, using defaults: {e}",
                config_path.display()
            ),
        },
        Err(e) => format!(
            "Failed to read config file {}, using defaults: {e}",
            config_path.display()
        ),
    };
    LoadedConfig {
        config: DuplexConfig::default(),
        path: config_path,
        warning: Some(warning),
    }
}

/// Default config path: `~/.duplex/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".duplex")
        .join("config.toml")
}
