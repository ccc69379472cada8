//! Runtime settings for the kernel.
//!
//! Defaults come from [`Settings::default`], embedders refine them with the
//! `with_*` setters, and [`Settings::from_env`] layers `VESSEL_*`
//! environment variables on top.

use std::path::PathBuf;

use vessel_types::VesselError;

use crate::paths;

/// Default limit for a single frame in either direction (16 MiB).
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Name of the worker agent binary looked up next to the current executable.
pub const AGENT_BINARY: &str = "vessel-agent";

/// Kernel settings shared by builders, bridges and the pool.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the on-disk environment cache.
    pub cache_dir: PathBuf,
    /// When false, `agent_requirements` are installed into every built
    /// environment alongside the user's requirements.
    pub inherit_from_local: bool,
    pub agent_requirements: Vec<String>,
    /// Program launched for each bridge.
    pub agent_program: PathBuf,
    pub python_exe: String,
    pub conda_exe: String,
    pub max_send_message_length: usize,
    pub max_receive_message_length: usize,
    /// Number of warm bridges kept alive at once.
    pub bridge_slots: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: paths::cache_dir(),
            inherit_from_local: false,
            agent_requirements: Vec::new(),
            agent_program: default_agent_program(),
            python_exe: "python3".to_string(),
            conda_exe: "conda".to_string(),
            max_send_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_receive_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            bridge_slots: 1,
        }
    }
}

impl Settings {
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_inherit_from_local(mut self, inherit: bool) -> Self {
        self.inherit_from_local = inherit;
        self
    }

    pub fn with_agent_requirements(mut self, requirements: Vec<String>) -> Self {
        self.agent_requirements = requirements;
        self
    }

    pub fn with_agent_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.agent_program = program.into();
        self
    }

    pub fn with_python_exe(mut self, exe: impl Into<String>) -> Self {
        self.python_exe = exe.into();
        self
    }

    pub fn with_conda_exe(mut self, exe: impl Into<String>) -> Self {
        self.conda_exe = exe.into();
        self
    }

    pub fn with_max_send_message_length(mut self, len: usize) -> Self {
        self.max_send_message_length = len;
        self
    }

    pub fn with_max_receive_message_length(mut self, len: usize) -> Self {
        self.max_receive_message_length = len;
        self
    }

    /// Zero is treated as one; the pool always keeps at least one slot.
    pub fn with_bridge_slots(mut self, slots: usize) -> Self {
        self.bridge_slots = slots.max(1);
        self
    }

    /// Apply `VESSEL_*` overrides from the process environment.
    pub fn from_env(self) -> Result<Self, VesselError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self, VesselError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("VESSEL_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("VESSEL_INHERIT_FROM_LOCAL") {
            self.inherit_from_local = parse_bool("VESSEL_INHERIT_FROM_LOCAL", &value)?;
        }
        if let Some(value) = lookup("VESSEL_AGENT_REQUIREMENTS") {
            self.agent_requirements = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup("VESSEL_MAX_SEND_MESSAGE_LENGTH") {
            self.max_send_message_length = parse_usize("VESSEL_MAX_SEND_MESSAGE_LENGTH", &value)?;
        }
        if let Some(value) = lookup("VESSEL_MAX_RECEIVE_MESSAGE_LENGTH") {
            self.max_receive_message_length =
                parse_usize("VESSEL_MAX_RECEIVE_MESSAGE_LENGTH", &value)?;
        }
        if let Some(value) = lookup("VESSEL_BRIDGE_SLOTS") {
            self.bridge_slots = parse_usize("VESSEL_BRIDGE_SLOTS", &value)?.max(1);
        }
        Ok(self)
    }
}

/// `vessel-agent` next to the running binary, or bare on `PATH`.
fn default_agent_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(AGENT_BINARY)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(AGENT_BINARY))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, VesselError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(VesselError::config(
            name,
            format!("{name} must be a boolean, got '{other}'"),
        )),
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize, VesselError> {
    value.trim().parse().map_err(|_| {
        VesselError::config(
            name,
            format!("{name} must be a non-negative integer, got '{value}'"),
        )
    })
}
