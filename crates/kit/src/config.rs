//! User configuration file parsing for `virtmate/config.toml`
//!
//! The file lives in the user's configuration directory
//! (`$XDG_CONFIG_HOME/virtmate/config.toml`) unless `VIRTMATE_CONFIG` names
//! another path. Every key is optional; command line flags win over it.

use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{
    eyre::{eyre, Context as _},
    Result,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clone::CloneMode;

/// Environment variable overriding the configuration file location
pub const CONFIG_ENV: &str = "VIRTMATE_CONFIG";
/// Configuration directory name below the user's configuration directory
pub const CONFIG_DIR: &str = "virtmate";
/// Configuration file name
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration loaded from `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Hypervisor connection
    #[serde(default)]
    pub libvirt: LibvirtConfig,

    /// Cloning defaults
    #[serde(default)]
    pub clone: CloneConfig,
}

/// `[libvirt]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LibvirtConfig {
    /// Default connection URI (e.g. `qemu:///system`)
    pub connect: Option<String>,
}

/// `[clone]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CloneConfig {
    /// Default clone mode
    #[serde(default)]
    pub mode: CloneMode,
}

impl Config {
    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The default location, if the user has a configuration directory
    pub fn default_path() -> Option<Utf8PathBuf> {
        let dir = dirs::config_dir()?;
        let dir = Utf8PathBuf::from_path_buf(dir).ok()?;
        Some(dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from `path`
    ///
    /// Returns `None` if the file doesn't exist.
    pub fn load_from(path: &Utf8Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file: {path}"))
            }
        };
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        debug!("Loaded configuration from {path}");
        Ok(Some(config))
    }

    /// Load the user's configuration
    ///
    /// A path given through `VIRTMATE_CONFIG` must exist; the default file
    /// may be absent, in which case built-in defaults apply.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            let path = Utf8PathBuf::from_path_buf(path.into())
                .map_err(|p| eyre!("{CONFIG_ENV} is not valid UTF-8: {}", p.display()))?;
            return Self::load_from(&path)?
                .ok_or_else(|| eyre!("Config file {path} (from {CONFIG_ENV}) does not exist"));
        }
        match Self::default_path() {
            Some(path) => Ok(Self::load_from(&path)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    /// Connection URI, preferring one given on the command line
    pub fn connect_uri(&self, cli: Option<String>) -> Option<String> {
        cli.or_else(|| self.libvirt.connect.clone())
    }
}
