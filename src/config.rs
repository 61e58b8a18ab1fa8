//! Configuration management for sqlite-session.
//!
//! Handles loading session configuration from TOML files, connection strings
//! and environment variables.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use url::form_urlencoded;

/// Engine open flag: read only.
pub const OPEN_READONLY: u32 = 1;
/// Engine open flag: read/write.
pub const OPEN_READWRITE: u32 = 2;
/// Engine open flag: create the database file if missing.
pub const OPEN_CREATE: u32 = 4;

/// Main configuration structure: a set of named sessions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Named session configurations.
    #[serde(default)]
    pub sessions: HashMap<String, SessionConfig>,
}

/// How the database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
    #[default]
    #[serde(rename = "rwc")]
    ReadWriteCreate,
}

impl OpenMode {
    /// Returns the mode as it appears in connection strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
            Self::ReadWriteCreate => "rwc",
        }
    }

    /// Maps an engine open flag mask to a mode. The widest flag wins.
    pub fn from_flags(flags: u32) -> Result<Self> {
        if flags & OPEN_CREATE != 0 {
            Ok(Self::ReadWriteCreate)
        } else if flags & OPEN_READWRITE != 0 {
            Ok(Self::ReadWrite)
        } else if flags & OPEN_READONLY != 0 {
            Ok(Self::ReadOnly)
        } else {
            Err(SessionError::config(format!("Invalid open flags: {flags}")))
        }
    }
}

impl FromStr for OpenMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ro" | "readonly" => Ok(Self::ReadOnly),
            "rw" | "readwrite" => Ok(Self::ReadWrite),
            "rwc" | "create" => Ok(Self::ReadWriteCreate),
            _ => Err(SessionError::config(format!(
                "Unknown open mode '{s}'. Expected: ro, rw or rwc"
            ))),
        }
    }
}

/// Configuration for opening one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Database file path, or `:memory:`.
    #[serde(default = "default_database")]
    pub database: String,

    /// Open mode.
    #[serde(default)]
    pub mode: OpenMode,

    /// How long the engine waits on a locked database before failing.
    pub busy_timeout_ms: Option<u64>,

    /// Prefix of the metadata shadow tables.
    #[serde(default = "default_meta_namespace")]
    pub meta_namespace: String,
}

fn default_database() -> String {
    ":memory:".to_string()
}

fn default_meta_namespace() -> String {
    "meta".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            mode: OpenMode::default(),
            busy_timeout_ms: None,
            meta_namespace: default_meta_namespace(),
        }
    }
}

impl SessionConfig {
    /// Creates a config for the given database path with default settings.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// Creates a config for a private in-memory database.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Parses a connection string.
    ///
    /// Format: `sqlite://path/to/file.db?mode=ro&busy_timeout=500`.
    /// `sqlite::memory:` and `sqlite://:memory:` select an in-memory database.
    /// A string without a scheme is taken as a plain file path.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let Some(rest) = conn_str.strip_prefix("sqlite:") else {
            if conn_str.contains("://") {
                return Err(SessionError::config(format!(
                    "Invalid connection string '{conn_str}'. Expected scheme 'sqlite'"
                )));
            }
            let config = Self::new(conn_str);
            config.validate()?;
            return Ok(config);
        };
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        let (database, query) = match rest.split_once('?') {
            Some((database, query)) => (database, Some(query)),
            None => (rest, None),
        };

        if database.is_empty() {
            return Err(SessionError::config("Database path is required"));
        }

        let mut config = Self::new(database);

        for (key, value) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            match key.as_ref() {
                "mode" => config.mode = value.parse()?,
                "busy_timeout" => {
                    let ms = value.parse().map_err(|e| {
                        SessionError::config(format!("Invalid busy_timeout '{value}': {e}"))
                    })?;
                    config.busy_timeout_ms = Some(ms);
                }
                "namespace" => config.meta_namespace = value.into_owned(),
                other => {
                    return Err(SessionError::config(format!(
                        "Unknown connection parameter '{other}'"
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Converts the config back to a connection string.
    pub fn to_connection_string(&self) -> String {
        let mut conn_str = format!("sqlite://{}?mode={}", self.database, self.mode.as_str());
        if let Some(ms) = self.busy_timeout_ms {
            conn_str.push_str(&format!("&busy_timeout={ms}"));
        }
        if self.meta_namespace != default_meta_namespace() {
            conn_str.push_str(&format!("&namespace={}", self.meta_namespace));
        }
        conn_str
    }

    /// Returns true if the database lives in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.database == ":memory:"
    }

    /// Checks invariants that the TOML or connection string parser cannot express.
    ///
    /// The namespace is spliced into quoted identifiers, so it is restricted
    /// to ASCII letters, digits and underscores.
    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(SessionError::config("Database path is required"));
        }
        validate_namespace(&self.meta_namespace)
    }

    /// Applies environment variables (SQLSESS_DATABASE, SQLSESS_BUSY_TIMEOUT) as defaults.
    pub fn apply_env_defaults(&mut self) {
        if self.is_in_memory() {
            if let Ok(database) = std::env::var("SQLSESS_DATABASE") {
                self.database = database;
            }
        }
        if self.busy_timeout_ms.is_none() {
            self.busy_timeout_ms = std::env::var("SQLSESS_BUSY_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok());
        }
    }

    /// Returns a short string for log lines.
    pub fn display_string(&self) -> String {
        format!("{} ({})", self.database, self.mode.as_str())
    }
}

/// Rejects metadata namespaces that are not plain identifiers.
pub fn validate_namespace(ns: &str) -> Result<()> {
    if ns.is_empty() || !ns.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SessionError::config(format!(
            "Invalid metadata namespace '{ns}'"
        )));
    }
    Ok(())
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sqlite-session")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields the default config.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| SessionError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            SessionError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })?;
        for session in config.sessions.values() {
            session.validate()?;
        }
        Ok(config)
    }

    /// Gets a named session, or the default session if name is None.
    pub fn get_session(&self, name: Option<&str>) -> Option<&SessionConfig> {
        let key = name.unwrap_or("default");
        self.sessions.get(key)
    }
}
