use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{PipelinerError, Result};
use crate::logging::LogRotation;
use crate::script::Interpreter;

pub const DEFAULT_ENDPOINT_PATH: &str = "/github-webhook";
pub const DEFAULT_LOG_MAX_FILES: usize = 5;

/// Construction-time options for a [`crate::Pipeliner`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelinerConfig {
    /// Port for the owned listener. Required unless an external app is used.
    pub port: Option<u16>,
    pub host: IpAddr,
    pub endpoint_path: String,
    pub scripts_path: PathBuf,
    pub hmac_secret: String,
    pub interpreter: Interpreter,
    pub script_timeout_secs: Option<u64>,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<PathBuf>,
    pub log_rotation: LogRotation,
    /// Rotated log files kept in `log_dir`.
    pub log_max_files: usize,
}

impl Default for PipelinerConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            scripts_path: PathBuf::from("."),
            hmac_secret: String::new(),
            interpreter: Interpreter::default(),
            script_timeout_secs: None,
            log_dir: None,
            log_rotation: LogRotation::default(),
            log_max_files: DEFAULT_LOG_MAX_FILES,
        }
    }
}

impl PipelinerConfig {
    pub fn new(hmac_secret: impl Into<String>) -> Self {
        Self {
            hmac_secret: hmac_secret.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_scripts_path(mut self, scripts_path: impl Into<PathBuf>) -> Self {
        self.scripts_path = scripts_path.into();
        self
    }

    pub fn with_endpoint_path(mut self, endpoint_path: impl Into<String>) -> Self {
        self.endpoint_path = endpoint_path.into();
        self
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        self.script_timeout_secs.map(Duration::from_secs)
    }

    /// Checks required options. `external_app` waives the port requirement.
    pub fn validate(&self, external_app: bool) -> Result<()> {
        if self.hmac_secret.is_empty() {
            return Err(PipelinerError::ConfigError(
                "\"hmac_secret\" is required".to_string(),
            ));
        }
        if !external_app && self.port.is_none() {
            return Err(PipelinerError::ConfigError(
                "Provide either \"port\" or an external app".to_string(),
            ));
        }
        if !self.endpoint_path.starts_with('/') {
            return Err(PipelinerError::ConfigError(format!(
                "\"endpoint_path\" must start with '/', got '{}'",
                self.endpoint_path
            )));
        }
        Ok(())
    }

    /// Parses a TOML configuration document.
    pub fn from_toml(config_str: &str) -> Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    /// Loads the configuration file at `path`, or defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let config_str = std::fs::read_to_string(path).map_err(|e| {
            PipelinerError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        toml::from_str(&config_str).map_err(|e| {
            PipelinerError::ConfigError(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Applies `PORT`, `PIPELINER_HMAC_SECRET`, `PIPELINER_SCRIPTS_PATH` and
    /// `PIPELINER_ENDPOINT_PATH` from `lookup` over the file values.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            let port = port.parse().map_err(|_| {
                PipelinerError::ConfigError(format!("PORT must be a port number, got '{}'", port))
            })?;
            self.port = Some(port);
        }
        if let Some(secret) = lookup("PIPELINER_HMAC_SECRET") {
            self.hmac_secret = secret;
        }
        if let Some(scripts_path) = lookup("PIPELINER_SCRIPTS_PATH") {
            self.scripts_path = PathBuf::from(scripts_path);
        }
        if let Some(endpoint_path) = lookup("PIPELINER_ENDPOINT_PATH") {
            self.endpoint_path = endpoint_path;
        }
        Ok(self)
    }
}
