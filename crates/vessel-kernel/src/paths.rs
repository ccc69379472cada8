//! XDG-compliant paths for vessel.
//!
//! | Purpose | Path |
//! |---------|------|
//! | Environment cache | `$XDG_CACHE_HOME/vessel` (`~/.cache/vessel`) |
//! | Server config | `$XDG_CONFIG_HOME/vessel` (`~/.config/vessel`) |

use std::path::PathBuf;

use directories::BaseDirs;

/// Get the user's home directory, falling back to the system temp dir.
pub fn home_dir() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(std::env::temp_dir)
}

/// Returns `$XDG_CACHE_HOME` or falls back to `~/.cache`.
pub fn xdg_cache_home() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.cache_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".cache"))
}

/// Returns `$XDG_CONFIG_HOME` or falls back to `~/.config`.
pub fn xdg_config_home() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config"))
}

/// Root of the on-disk environment cache.
pub fn cache_dir() -> PathBuf {
    xdg_cache_home().join("vessel")
}

/// Directory holding `server.toml`.
pub fn config_dir() -> PathBuf {
    xdg_config_home().join("vessel")
}
