//! Configuration for the vessel server.
//!
//! Configuration is loaded from `~/.config/vessel/server.toml`. Values set
//! there become kernel [`Settings`]; `VESSEL_*` environment variables are
//! applied on top.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use vessel_kernel::Settings;
use vessel_kernel::config::DEFAULT_MAX_MESSAGE_LENGTH;

/// Configuration for the vessel server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the front listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Root of the environment cache. Defaults to the XDG cache dir.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub inherit_from_local: bool,

    /// Extra packages installed into every environment when
    /// `inherit_from_local` is off.
    #[serde(default)]
    pub agent_requirements: Vec<String>,

    /// Worker agent binary. Defaults to `vessel-agent` next to the server.
    #[serde(default)]
    pub agent_program: Option<PathBuf>,

    #[serde(default = "default_python_exe")]
    pub python_exe: String,

    #[serde(default = "default_conda_exe")]
    pub conda_exe: String,

    #[serde(default = "default_max_message_length")]
    pub max_send_message_length: usize,

    #[serde(default = "default_max_message_length")]
    pub max_receive_message_length: usize,

    /// Warm bridges kept alive at once.
    #[serde(default = "default_bridge_slots")]
    pub bridge_slots: usize,
}

fn default_listen() -> String {
    "127.0.0.1:50001".to_string()
}

fn default_python_exe() -> String {
    "python3".to_string()
}

fn default_conda_exe() -> String {
    "conda".to_string()
}

fn default_max_message_length() -> usize {
    DEFAULT_MAX_MESSAGE_LENGTH
}

fn default_bridge_slots() -> usize {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cache_dir: None,
            inherit_from_local: false,
            agent_requirements: Vec::new(),
            agent_program: None,
            python_exe: default_python_exe(),
            conda_exe: default_conda_exe(),
            max_send_message_length: default_max_message_length(),
            max_receive_message_length: default_max_message_length(),
            bridge_slots: default_bridge_slots(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "vessel")
            .context("Could not determine config directory")?;

        Ok(dirs.config_dir().join("server.toml"))
    }

    /// Kernel settings from this file, without environment overrides.
    pub fn to_settings(&self) -> Settings {
        let mut settings = Settings::default()
            .with_inherit_from_local(self.inherit_from_local)
            .with_agent_requirements(self.agent_requirements.clone())
            .with_python_exe(self.python_exe.clone())
            .with_conda_exe(self.conda_exe.clone())
            .with_max_send_message_length(self.max_send_message_length)
            .with_max_receive_message_length(self.max_receive_message_length)
            .with_bridge_slots(self.bridge_slots);
        if let Some(dir) = &self.cache_dir {
            settings = settings.with_cache_dir(dir);
        }
        if let Some(program) = &self.agent_program {
            settings = settings.with_agent_program(program);
        }
        settings
    }

    /// Kernel settings with `VESSEL_*` overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        self.to_settings()
            .from_env()
            .context("Invalid VESSEL_* environment variable")
    }
}
