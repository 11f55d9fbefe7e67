//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit path (`--config`)
//! 2. `esimkit.toml` next to the executable
//! 3. `$HOME/.config/esimkit/config.toml` (`%APPDATA%\esimkit\config.toml` on Windows)
//! 4. Built-in defaults
//!
//! Environment variables (`ESIMKIT_*`) override file values; CLI arguments
//! always take precedence over both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EsimError, Result, ResultExt as _};

pub const DEFAULT_API_BASE_URL: &str = "https://api.simplifytrip.com/api/v1";

/// Accepted range for every network timeout, in seconds.
pub const NETWORK_TIMEOUT_SECS: std::ops::RangeInclusive<u64> = 10..=15;

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EsimConfig {
    pub paths: PathsConfig,
    pub api: ApiConfig,
    pub qr: QrConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub inventory_db: PathBuf,
    pub session_cache: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Profile status endpoint; the serial is appended as the last path
    /// segment.  Empty means `{base_url}/esim`.
    pub status_url: String,
    pub timeout_secs: u64,
    /// Timeout for the anti-forgery token fetch.
    pub auth_timeout_secs: u64,
    pub email: Option<String>,
    pub password: Option<String>,
    pub origin: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// Edge length of one QR module in pixels.
    pub module_px: u32,
    pub quiet_zone: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file.
    /// Empty string means no file logging.
    pub json_log_file: String,
    /// Emit JSON lines on stderr instead of human-readable text (for
    /// container pipelines).  Stdout always carries only command output.
    pub json_console: bool,
}

/// Where log events go.  Every variant keeps stdout free of log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    JsonStderr,
    /// JSON lines appended to a file, plus human-readable stderr.
    JsonFile(PathBuf),
    Stderr,
}

impl LoggingConfig {
    pub fn sink(&self) -> LogSink {
        if self.json_console {
            LogSink::JsonStderr
        } else if !self.json_log_file.is_empty() {
            LogSink::JsonFile(PathBuf::from(&self.json_log_file))
        } else {
            LogSink::Stderr
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            inventory_db: PathBuf::from("esimkit-inventory.db"),
            session_cache: PathBuf::from("esimkit-session.json"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            status_url: String::new(),
            timeout_secs: 15,
            auth_timeout_secs: 10,
            email: None,
            password: None,
            origin: "https://simplifytrip.com".to_string(),
            user_agent: format!("esimkit/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            module_px: 10,
            quiet_zone: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_console: false,
        }
    }
}

impl ApiConfig {
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn status_url(&self) -> String {
        if self.status_url.trim().is_empty() {
            format!("{}/esim", self.base_url())
        } else {
            self.status_url.trim_end_matches('/').to_string()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl EsimConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: EsimConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("esimkit.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        #[cfg(windows)]
        {
            if let Ok(appdata) = std::env::var("APPDATA") {
                let candidate = PathBuf::from(appdata).join("esimkit").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("esimkit")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("ESIMKIT_DB") {
            self.paths.inventory_db = PathBuf::from(db);
        }
        if let Ok(cache) = std::env::var("ESIMKIT_SESSION_CACHE") {
            self.paths.session_cache = PathBuf::from(cache);
        }
        if let Ok(url) = std::env::var("ESIMKIT_API_URL") {
            self.api.base_url = url;
        }
        if let Ok(url) = std::env::var("ESIMKIT_STATUS_URL") {
            self.api.status_url = url;
        }
        if let Ok(email) = std::env::var("ESIMKIT_API_EMAIL") {
            self.api.email = Some(email);
        }
        if let Ok(password) = std::env::var("ESIMKIT_API_PASSWORD") {
            self.api.password = Some(password);
        }
        if let Ok(level) = std::env::var("ESIMKIT_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Reject values that would let a network call hang or go nowhere.
    /// Timeouts must fall within [`NETWORK_TIMEOUT_SECS`].
    pub fn validate(&self) -> Result<()> {
        for (label, secs) in [
            ("api.timeout_secs", self.api.timeout_secs),
            ("api.auth_timeout_secs", self.api.auth_timeout_secs),
        ] {
            if !NETWORK_TIMEOUT_SECS.contains(&secs) {
                return Err(EsimError::Config(format!(
                    "{label} = {secs} out of range [{}, {}]",
                    NETWORK_TIMEOUT_SECS.start(),
                    NETWORK_TIMEOUT_SECS.end()
                )));
            }
        }
        if self.api.base_url.trim().is_empty() {
            return Err(EsimError::Config("api.base_url must not be empty".into()));
        }
        if self.qr.module_px == 0 {
            return Err(EsimError::Config("qr.module_px must be at least 1".into()));
        }
        Ok(())
    }
}
