//! Engine Configuration
//!
//! One TOML file configures both sides of the socket:
//!
//! ```toml
//! socket_path = "/run/installer-engine/engine.sock"
//!
//! [server]
//! max_connections = 64
//! shutdown_grace_ms = 5000
//!
//! [client]
//! request_timeout_ms = 30000
//!
//! [client.reconnect]
//! max_attempts = 5
//!
//! [security]
//! allowed_roots = ["/mnt", "/tmp", "/run/installer-engine"]
//!
//! [launcher]
//! elevation_helper = "pkexec"
//! ```
//!
//! Every section is optional. Environment variables override the file
//! (see [`EngineConfig::apply_env`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::launcher::LauncherConfig;
use crate::security::SecurityConfig;
use crate::server::ServerConfig;

/// Configuration file name under the config directory
pub const CONFIG_FILE_NAME: &str = "engine.toml";

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path:?}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has wrongly typed fields
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
}

/// Complete engine configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Socket path shared by server, client and launcher (overrides the sections)
    pub socket_path: Option<PathBuf>,
    /// `[server]`
    pub server: ServerConfig,
    /// `[client]`
    pub client: ClientConfig,
    /// `[security]`
    pub security: SecurityConfig,
    /// `[launcher]`
    pub launcher: LauncherConfig,
}

/// Default configuration file: `$XDG_CONFIG_HOME/installer-engine/engine.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("installer-engine").join(CONFIG_FILE_NAME))
}

/// File the configuration is read from: `explicit`, else the default
/// path when it exists
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|p| p.exists()),
    }
}

/// Load and parse a configuration file
///
/// # Errors
///
/// Returns `ConfigError::Read` or `ConfigError::Parse`.
pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    EngineConfig::from_toml_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl EngineConfig {
    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Defaults with environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load `path` if given, otherwise the default file if it exists, then
    /// apply environment overrides
    ///
    /// # Errors
    ///
    /// Fails if an explicitly given file cannot be loaded, or the default
    /// file exists but is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match resolve_config_path(path) {
            Some(path) => load_config_from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// - `ENGINE_SOCKET`: socket path
    /// - `ENGINE_MAX_CONNECTIONS`
    /// - `ENGINE_SHUTDOWN_GRACE_MS`
    /// - `ENGINE_CONNECT_TIMEOUT_MS`
    /// - `ENGINE_REQUEST_TIMEOUT_MS`
    /// - `ENGINE_AUTO_RECONNECT`: "0" or "false" to disable
    /// - `ENGINE_RECONNECT_ATTEMPTS`
    /// - `ENGINE_BINARY`: engine executable for the launcher
    /// - `ENGINE_ELEVATION_HELPER`
    /// - `ENGINE_ALLOWED_ROOTS` and the other `[security]` overrides
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
        self.security = std::mem::take(&mut self.security).with_env();
    }

    /// Apply overrides from an arbitrary lookup (testable without touching
    /// the process environment)
    pub fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(path) = lookup("ENGINE_SOCKET").filter(|v| !v.is_empty()) {
            self.socket_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse("ENGINE_MAX_CONNECTIONS") {
            self.server.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = parse("ENGINE_SHUTDOWN_GRACE_MS") {
            self.server.shutdown_grace_ms = v;
        }
        if let Some(v) = parse("ENGINE_CONNECT_TIMEOUT_MS") {
            self.client.connect_timeout_ms = v;
        }
        if let Some(v) = parse("ENGINE_REQUEST_TIMEOUT_MS") {
            self.client.request_timeout_ms = v;
        }
        if let Some(v) = lookup("ENGINE_AUTO_RECONNECT") {
            self.client.auto_reconnect = v != "0" && v.to_lowercase() != "false";
        }
        if let Some(v) = parse("ENGINE_RECONNECT_ATTEMPTS") {
            self.client.reconnect.max_attempts = u32::try_from(v).unwrap_or(u32::MAX);
        }
        if let Some(bin) = lookup("ENGINE_BINARY").filter(|v| !v.is_empty()) {
            self.launcher.engine_binary = PathBuf::from(bin);
        }
        if let Some(helper) = lookup("ENGINE_ELEVATION_HELPER").filter(|v| !v.is_empty()) {
            self.launcher.elevation_helper = helper;
        }
    }

    /// Server settings with the shared socket path and `[security]` filled in
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        let mut server = self.server.clone();
        if let Some(path) = &self.socket_path {
            server.socket_path.clone_from(path);
        }
        server.security = self.security.clone();
        server
    }

    /// Client settings with the shared socket path filled in
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut client = self.client.clone();
        if let Some(path) = &self.socket_path {
            client.socket_path.clone_from(path);
        }
        client
    }
}
