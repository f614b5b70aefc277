//! Configuration module for the HTTP server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the HTTP server
#[derive(Parser, Debug)]
#[command(name = "minihttpd")]
#[command(version = "0.1.0")]
#[command(about = "An epoll-driven HTTP/1.1 static file server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1316)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Idle connection timeout in milliseconds (0 disables eviction)
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Document root directory
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads, 0 resolves to the CPU count
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Idle connection timeout in milliseconds, 0 disables eviction
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Edge-triggered connection handling
    #[serde(default = "default_edge_triggered")]
    pub edge_triggered: bool,
    /// Maximum number of simultaneous connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            timeout_ms: default_timeout_ms(),
            edge_triggered: default_edge_triggered(),
            max_connections: default_max_connections(),
        }
    }
}

/// Site content configuration
#[derive(Debug, Deserialize)]
pub struct SiteSection {
    /// Document root directory
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:1316".to_string()
}

fn default_workers() -> usize {
    6
}

fn default_timeout_ms() -> u64 {
    60_000 // one minute of idleness
}

fn default_edge_triggered() -> bool {
    true
}

fn default_max_connections() -> usize {
    10_000
}

fn default_root() -> PathBuf {
    PathBuf::from("./www")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub timeout_ms: u64,
    pub edge_triggered: bool,
    pub root: PathBuf,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::merge(CliArgs::parse())
    }

    fn merge(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let workers = cli.workers.unwrap_or(toml_config.server.workers);
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: if workers == 0 { num_cpus() } else { workers },
            timeout_ms: cli.timeout_ms.unwrap_or(toml_config.server.timeout_ms),
            edge_triggered: toml_config.server.edge_triggered,
            root: cli.root.unwrap_or(toml_config.site.root),
            max_connections: toml_config.server.max_connections,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Number of available CPU cores
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
