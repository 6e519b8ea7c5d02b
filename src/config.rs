//! relaycast configuration
//!
//! Configuration comes from, lowest precedence first:
//! 1. Built-in defaults
//! 2. `realtime.conf` (INI style, `[Server]` / `[Messaging]` / `[License]`)
//! 3. Environment variables (`RELAYCAST_*`)
//! 4. Command line flags, applied by the binary

use std::path::{Path, PathBuf};

use ini::{Ini, ParseOption};
use tracing::{debug, warn};

use crate::hub::{DEFAULT_CONTROL_CAPACITY, DEFAULT_DATA_CAPACITY};

pub const CONF_NAME: &str = "realtime.conf";
pub const LICENSE_NAME: &str = "license.txt";

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_RESOURCE: &str = "/realtime/";
pub const DEFAULT_LICENSE_SECRET: &str = "relaycast";

/// relaycast configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbose logging
    pub debug: bool,
    /// HTTP / WebSocket listen port
    pub port: u16,
    /// Data queue capacity (publishes and replies)
    pub data_queue_capacity: usize,
    /// Control queue capacity (subscribe / unsubscribe)
    pub control_queue_capacity: usize,
    /// WebSocket endpoint path
    pub resource: String,
    /// Transport allowlist, empty means all
    pub allowed_types: Vec<String>,
    /// Licence key file; searched next to `root` when unset
    pub license_file: Option<PathBuf>,
    /// Secret licence keys are derived with
    pub license_secret: String,
    /// Directory config and licence files are searched from
    pub root: PathBuf,
    /// Config file that was applied, if any
    pub config_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            port: DEFAULT_PORT,
            data_queue_capacity: DEFAULT_DATA_CAPACITY,
            control_queue_capacity: DEFAULT_CONTROL_CAPACITY,
            resource: DEFAULT_RESOURCE.to_string(),
            allowed_types: Vec::new(),
            license_file: None,
            license_secret: DEFAULT_LICENSE_SECRET.to_string(),
            root: default_root(),
            config_file: None,
        }
    }
}

impl Config {
    /// Build the configuration from defaults, the config file and the
    /// environment
    pub fn load(root: Option<&Path>, config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(root) = root {
            config.root = root.to_path_buf();
        }

        let path = match config_file {
            Some(path) => Some(path.to_path_buf()),
            None => first_existing(&search_paths(&config.root, CONF_NAME)),
        };
        if let Some(path) = path {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let file = FileSettings::parse(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
            config.apply_file(&file);
            debug!(path = %path.display(), "config file applied");
            config.config_file = Some(path);
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Apply settings read from a config file
    pub fn apply_file(&mut self, file: &FileSettings) {
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(types) = &file.allowed_types {
            self.allowed_types = types.clone();
        }
        if let Some(resource) = &file.resource {
            self.resource = normalize_resource(resource);
        }
        if let Some(limit) = file.message_cache_limit {
            self.data_queue_capacity = limit;
        }
        if let Some(limit) = file.control_queue_limit {
            self.control_queue_capacity = limit;
        }
        if let Some(path) = &file.license_file {
            self.license_file = Some(path.clone());
        }
        if let Some(secret) = &file.license_secret {
            self.license_secret = secret.clone();
        }
    }

    /// Apply `RELAYCAST_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    pub fn apply_env_from<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("RELAYCAST_DEBUG") {
            self.debug = parse_bool(&value)
                .ok_or(ConfigError::InvalidEnv("RELAYCAST_DEBUG", "expected bool"))?;
        }

        if let Some(value) = var("RELAYCAST_PORT") {
            self.port = value
                .parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or(ConfigError::InvalidEnv("RELAYCAST_PORT", "expected port number"))?;
        }

        if let Some(value) = var("RELAYCAST_DATA_QUEUE") {
            self.data_queue_capacity = parse_capacity(&value)
                .ok_or(ConfigError::InvalidEnv("RELAYCAST_DATA_QUEUE", "expected positive integer"))?;
        }

        if let Some(value) = var("RELAYCAST_CONTROL_QUEUE") {
            self.control_queue_capacity = parse_capacity(&value).ok_or(ConfigError::InvalidEnv(
                "RELAYCAST_CONTROL_QUEUE",
                "expected positive integer",
            ))?;
        }

        if let Some(value) = var("RELAYCAST_RESOURCE")
            && !value.is_empty()
        {
            self.resource = normalize_resource(&value);
        }

        if let Some(value) = var("RELAYCAST_LICENSE_FILE")
            && !value.is_empty()
        {
            self.license_file = Some(PathBuf::from(value));
        }

        if let Some(value) = var("RELAYCAST_LICENSE_SECRET")
            && !value.is_empty()
        {
            self.license_secret = value;
        }

        Ok(())
    }

    /// Licence file to load: the configured one, else the first
    /// `license.txt` found next to `root`
    pub fn license_path(&self) -> Option<PathBuf> {
        match &self.license_file {
            Some(path) => Some(path.clone()),
            None => first_existing(&search_paths(&self.root, LICENSE_NAME)),
        }
    }

    /// Whether the WebSocket transport may be served
    pub fn websocket_allowed(&self) -> bool {
        self.allowed_types.is_empty() || self.allowed_types.iter().any(|t| t == "websocket")
    }
}

/// Locations searched for `name`: `root/`, `root/../etc/`, `root/etc/`
pub fn search_paths(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut paths = vec![root.join(name)];
    if let Some(parent) = root.parent() {
        paths.push(parent.join("etc").join(name));
    }
    paths.push(root.join("etc").join(name));
    paths
}

fn first_existing(paths: &[PathBuf]) -> Option<PathBuf> {
    paths.iter().find(|path| path.is_file()).cloned()
}

/// Settings found in `realtime.conf`
///
/// ```text
/// [Server]
/// debug = true
/// websocket-port = 8001
/// allowed-types = websocket
/// resource = /realtime/
///
/// [Messaging]
/// message-cache-limit = 5000
/// control-queue-limit = 500
///
/// [License]
/// file = /etc/relaycast/license.txt
/// secret = ...
/// ```
///
/// Missing keys stay `None`; invalid values are ignored with a warning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSettings {
    pub debug: Option<bool>,
    pub port: Option<u16>,
    pub allowed_types: Option<Vec<String>>,
    pub resource: Option<String>,
    pub message_cache_limit: Option<usize>,
    pub control_queue_limit: Option<usize>,
    pub license_file: Option<PathBuf>,
    pub license_secret: Option<String>,
}

impl FileSettings {
    pub fn parse(text: &str) -> Result<Self, ini::ParseError> {
        let option = ParseOption {
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(text, option)?;
        Ok(Self::from_ini(&ini))
    }

    pub fn from_ini(ini: &Ini) -> Self {
        Self {
            debug: setting(ini, "Server", "debug", parse_bool),
            port: setting(ini, "Server", "websocket-port", |v: &str| {
                v.parse::<u16>().ok().filter(|port| *port > 0)
            }),
            allowed_types: setting(ini, "Server", "allowed-types", |v: &str| {
                Some(
                    v.split(',')
                        .map(|t| t.trim().to_lowercase())
                        .filter(|t| !t.is_empty())
                        .collect(),
                )
            }),
            resource: setting(ini, "Server", "resource", |v: &str| Some(v.to_string())),
            message_cache_limit: setting(ini, "Messaging", "message-cache-limit", parse_capacity),
            control_queue_limit: setting(ini, "Messaging", "control-queue-limit", parse_capacity),
            license_file: setting(ini, "License", "file", |v: &str| Some(PathBuf::from(v))),
            license_secret: setting(ini, "License", "secret", |v: &str| Some(v.to_string())),
        }
    }
}

/// Typed value of `[section] key`; empty values count as unset
fn setting<T>(ini: &Ini, section: &str, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let value = ini.get_from(Some(section), key)?.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = parse(value);
    if parsed.is_none() {
        warn!(section, key, value, "invalid setting ignored");
    }
    parsed
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_capacity(value: &str) -> Option<usize> {
    value.parse::<usize>().ok().filter(|n| *n > 0)
}

fn normalize_resource(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Directory of the running executable, or the working directory
fn default_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: ini::ParseError,
    },
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
}
