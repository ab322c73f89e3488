//! Engine settings
//!
//! Where the wrapped tools live and how long to wait for them. This is not the
//! declared state: it never says *what* the host should look like, and it can
//! never enable a safety switch.
//!
//! Search order:
//! 1. explicit path (`--settings`)
//! 2. `$MINISTACK_SETTINGS`
//! 3. `$XDG_CONFIG_HOME/ministack/settings.toml` (or the platform config dir)
//! 4. `/etc/ministack/settings.toml`
//! 5. built-in defaults
//!
//! Loaded once at startup and passed by reference; nothing reads it globally.

use crate::error::MinistackError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System settings directory
pub const SYSTEM_SETTINGS_DIR: &str = "/etc/ministack";
const SETTINGS_FILE: &str = "settings.toml";

/// Environment override for the settings file
pub const SETTINGS_ENV: &str = "MINISTACK_SETTINGS";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HomebrewSettings {
    /// Absolute path so a fresh install works before PATH is updated
    pub brew_path: PathBuf,
    /// Official bootstrap script, run with NONINTERACTIVE=1
    pub install_script_url: String,
}

impl Default for HomebrewSettings {
    fn default() -> Self {
        Self {
            brew_path: PathBuf::from("/opt/homebrew/bin/brew"),
            install_script_url: "https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OllamaSettings {
    pub binary: PathBuf,
    /// Base URL of the local API (no trailing /api)
    pub api_url: String,
    /// Per-request timeout for /api/version and /api/tags
    pub request_timeout_secs: u64,
    /// How long to wait for the API after `brew services start`
    pub start_timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/opt/homebrew/bin/ollama"),
            api_url: "http://127.0.0.1:11434".to_string(),
            request_timeout_secs: 5,
            start_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DockerSettings {
    pub binary: PathBuf,
    /// Docker Desktop bundle; the CLI symlinks only appear after first launch
    pub app_path: PathBuf,
    pub start_timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Per-request bound on a compose app's health URL
    pub request_timeout_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/local/bin/docker"),
            app_path: PathBuf::from("/Applications/Docker.app"),
            start_timeout_secs: 60,
            health_timeout_secs: 120,
            request_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunSettings {
    /// Bound on a whole reconcile run; checked between actions only
    pub timeout_secs: Option<u64>,
    /// Permit mutating runs on a non-macOS host
    pub allow_non_darwin: bool,
}

/// Complete engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub homebrew: HomebrewSettings,

    #[serde(default)]
    pub ollama: OllamaSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub run: RunSettings,
}

impl Settings {
    /// Load settings following the search order. Returns the settings and the
    /// file they came from (None when defaults were used).
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), MinistackError> {
        if let Some(path) = explicit {
            return Ok((Self::load_file(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = std::env::var(SETTINGS_ENV) {
            let path = PathBuf::from(path);
            return Ok((Self::load_file(&path)?, Some(path)));
        }

        for candidate in candidate_paths() {
            if candidate.exists() {
                return Ok((Self::load_file(&candidate)?, Some(candidate)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Load a specific settings file. Unlike the declared state, a broken
    /// settings file is an error, never a silent fallback to defaults.
    pub fn load_file(path: &Path) -> Result<Self, MinistackError> {
        let content = fs::read_to_string(path).map_err(|source| MinistackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|message| MinistackError::Settings {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let settings: Settings = toml::from_str(content).map_err(|e| e.to_string())?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.ollama.api_url.starts_with("http://") && !self.ollama.api_url.starts_with("https://")
        {
            return Err(format!(
                "ollama.api_url must be an http(s) URL, got '{}'",
                self.ollama.api_url
            ));
        }
        if self.ollama.request_timeout_secs == 0 {
            return Err("ollama.request_timeout_secs must be positive".to_string());
        }
        if self.docker.request_timeout_secs == 0 {
            return Err("docker.request_timeout_secs must be positive".to_string());
        }
        if self.run.timeout_secs == Some(0) {
            return Err("run.timeout_secs must be positive (omit it for no timeout)".to_string());
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run.timeout_secs.map(Duration::from_secs)
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("ministack").join(SETTINGS_FILE));
    }
    paths.push(PathBuf::from(SYSTEM_SETTINGS_DIR).join(SETTINGS_FILE));
    paths
}
