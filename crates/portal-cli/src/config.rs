//! Configuration loading from `~/.portal/config.toml` with defaults.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, environment
//! variables (`PORT`, `AGENT_URL`, `PORTAL_DEFAULT_DEST`), command-line flags.

use portal_bridge::PortalConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default config location: `~/.portal/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".portal"))
        .unwrap_or_else(|| PathBuf::from(".portal"))
        .join("config.toml")
}

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing file is normal. A file that cannot be read or parsed is logged
/// and ignored rather than aborting startup.
pub fn load_config(path: Option<&Path>) -> PortalConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return PortalConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<PortalConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                PortalConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            PortalConfig::default()
        }
    }
}

/// Apply environment overrides read through `var`.
pub fn apply_env_overrides(config: &mut PortalConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(port) = var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(port) => config.frontend.set_port(port),
            Err(_) => warn!(value = %port, "Ignoring invalid PORT"),
        }
    }
    if let Some(url) = var("AGENT_URL").filter(|v| !v.is_empty()) {
        config.outlet.agent_url = url;
    }
    if let Some(dest) = var("PORTAL_DEFAULT_DEST") {
        config.outlet.default_dest = dest;
    }
}

/// Load the file and apply the process environment.
pub fn effective_config(path: Option<&Path>) -> PortalConfig {
    let mut config = load_config(path);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config
}

/// Render a config as TOML.
pub fn render(config: &PortalConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
