//! CLI surface and optional JSON config-file overlay.
//!
//! Precedence, highest to lowest: explicit CLI flag, config-file value,
//! built-in default.

use crate::error::DaemonError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIN_QUEUE_CAPACITY: usize = 100;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "telemetryd")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sideband telemetry daemon for local worker processes")]
pub struct Cli {
    /// Path of the Unix-domain socket to listen on
    #[arg(long = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Octal file mode applied to the socket file (e.g. 0600)
    #[arg(long = "socket-mode")]
    pub socket_mode: Option<String>,

    /// Message queue capacity; values below 100 are clamped to 1000
    #[arg(long = "msg-bufsize")]
    pub msg_bufsize: Option<usize>,

    /// Minimum log level: none, error, warn, info, debug
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Optional JSON file layering over these defaults
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// Config-file overlay; every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub socket_path: Option<String>,
    pub socket_mode: Option<String>,
    pub msg_bufsize: Option<usize>,
    pub log_level: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path).map_err(|source| DaemonError::ConfigFile {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| DaemonError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Fully resolved, validated configuration the rest of the daemon runs on.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    pub queue_capacity: usize,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/ocdaemon.sock"),
            socket_mode: 0o600,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Resolve CLI flags over an optional config file over built-in
    /// defaults, then validate.
    pub fn resolve(cli: &Cli) -> Result<Self, DaemonError> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let mut config = DaemonConfig::default();

        if let Some(path) = file.socket_path {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(mode) = file.socket_mode {
            config.socket_mode = parse_octal_mode(&mode)?;
        }
        if let Some(bufsize) = file.msg_bufsize {
            config.queue_capacity = bufsize;
        }
        if let Some(level) = file.log_level {
            config.log_level = level;
        }

        if let Some(path) = &cli.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(mode) = &cli.socket_mode {
            config.socket_mode = parse_octal_mode(mode)?;
        }
        if let Some(bufsize) = cli.msg_bufsize {
            config.queue_capacity = bufsize;
        }
        if let Some(level) = &cli.log_level {
            config.log_level = level.clone();
        }

        config.queue_capacity = if config.queue_capacity < MIN_QUEUE_CAPACITY {
            DEFAULT_QUEUE_CAPACITY
        } else {
            config.queue_capacity
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), DaemonError> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(DaemonError::Config("socket path must not be empty".to_string()));
        }
        if !matches!(
            self.log_level.as_str(),
            "none" | "error" | "warn" | "info" | "debug"
        ) {
            return Err(DaemonError::Config(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn env_filter(&self) -> String {
        match self.log_level.as_str() {
            "none" => "off".to_string(),
            other => format!("telemetryd={other}"),
        }
    }
}

fn parse_octal_mode(s: &str) -> Result<u32, DaemonError> {
    let trimmed = s.trim_start_matches("0o").trim_start_matches('0');
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    u32::from_str_radix(trimmed, 8)
        .map_err(|_| DaemonError::Config(format!("invalid octal socket mode '{s}'")))
}
