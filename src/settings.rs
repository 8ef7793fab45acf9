//! Settings for launching the simulator
//!
//! Values come from an optional TOML file and can be overridden from the
//! command line. Every key has a default, so an empty file (or no file at
//! all) launches `sumo -c scenario.sumocfg`.

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// File looked up when no settings path is given explicitly
pub const DEFAULT_SETTINGS_FILE: &str = "settings.toml";

/// Simulator binary used when none is configured
pub const DEFAULT_SUMO_BINARY: &str = "sumo";

/// Scenario used when none is configured
pub const DEFAULT_SUMO_CONFIG: &str = "scenario.sumocfg";

/// Connection attempts made while the simulator boots
pub const DEFAULT_CONNECT_RETRIES: u32 = 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Simulator executable, looked up on `PATH` if not absolute
    pub sumo_binary: String,

    /// Scenario configuration passed with `-c`
    pub sumo_config: PathBuf,

    /// Port for the remote-control server; a free one is picked if unset
    pub remote_port: Option<u16>,

    /// How many times to try connecting before giving up
    pub connect_retries: u32,

    /// Additional arguments appended to the launch command line
    pub extra_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sumo_binary: DEFAULT_SUMO_BINARY.to_string(),
            sumo_config: PathBuf::from(DEFAULT_SUMO_CONFIG),
            remote_port: None,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            extra_args: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse settings")
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    /// Resolve the settings source.
    ///
    /// An explicitly named file must exist. Without one, `settings.toml` in
    /// the working directory is used if present, otherwise the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_SETTINGS_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    warn!(
                        "No {} found, using built-in defaults",
                        DEFAULT_SETTINGS_FILE
                    );
                    Ok(Self::default())
                }
            }
        }
    }

    /// Command line that launches the simulator listening on `port`
    pub fn launch_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            self.sumo_binary.clone(),
            "-c".to_string(),
            self.sumo_config.display().to_string(),
            "--remote-port".to_string(),
            port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}
