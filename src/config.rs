//! Configuration for the remote control server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The HTTP listener runs this far above the base port.
pub const HTTP_PORT_OFFSET: u16 = 10;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "remote-core")]
#[command(version)]
#[command(about = "Buffer-pooled remote control command server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Base TCP port; the HTTP listener uses base + 10
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently admitted connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Size of each connection's receive buffer in bytes
    #[arg(long)]
    pub receive_buffer_size: Option<usize>,

    /// Size of each connection's send buffer in bytes
    #[arg(long)]
    pub send_buffer_size: Option<usize>,

    /// Read/write timeout in seconds
    #[arg(long)]
    pub io_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Templates for the `format` command, `{body}` is the placeholder
    #[serde(default)]
    pub templates: HashMap<String, String>,
}

/// Listener and admission settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

/// Per-connection buffer sizes
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_receive_size")]
    pub receive_size: usize,
    #[serde(default = "default_send_size")]
    pub send_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            receive_size: default_receive_size(),
            send_size: default_send_size(),
        }
    }
}

/// Settings passed through to the command collaborators
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Hour of day (0-23) at which the library cache rebuild starts
    #[serde(default = "default_build_hour")]
    pub build_hour: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            build_hour: default_build_hour(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5150
}

fn default_max_connections() -> usize {
    100
}

fn default_backlog() -> i32 {
    1024
}

fn default_io_timeout() -> u64 {
    30
}

fn default_receive_size() -> usize {
    4 * 1024
}

fn default_send_size() -> usize {
    16 * 1024
}

fn default_build_hour() -> u8 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub backlog: i32,
    pub io_timeout_secs: u64,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub cache_build_hour: u8,
    pub log_level: String,
    pub templates: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            io_timeout_secs: cli.io_timeout.unwrap_or(toml_config.server.io_timeout_secs),
            receive_buffer_size: cli
                .receive_buffer_size
                .unwrap_or(toml_config.buffers.receive_size),
            send_buffer_size: cli
                .send_buffer_size
                .unwrap_or(toml_config.buffers.send_size),
            cache_build_hour: toml_config.cache.build_hour,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            templates: toml_config.templates,
        }
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.receive_buffer_size == 0 || self.send_buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        if self.cache_build_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "cache build hour {} is not in 0-23",
                self.cache_build_hour
            )));
        }
        if self.io_timeout_secs == 0 {
            return Err(ConfigError::Invalid("io_timeout must be at least 1 second".into()));
        }
        self.http_port()?;
        Ok(())
    }

    /// Port of the HTTP listener, derived from the base port.
    pub fn http_port(&self) -> Result<u16, ConfigError> {
        self.port
            .checked_add(HTTP_PORT_OFFSET)
            .ok_or(ConfigError::PortOutOfRange(self.port))
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Base port {0} leaves no room for the HTTP listener")]
    PortOutOfRange(u16),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5150);
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.buffers.send_size, 16 * 1024);
        assert!(config.templates.is_empty());

        let resolved = Config::default();
        assert_eq!(resolved.http_port().unwrap(), 5160);
        assert!(resolved.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 40500
            max_connections = 4

            [buffers]
            receive_size = 512
            send_size = 2048

            [cache]
            build_hour = 5

            [logging]
            level = "debug"

            [templates]
            page = "<html>{body}</html>"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 40500);
        assert_eq!(config.server.max_connections, 4);
        assert_eq!(config.server.io_timeout_secs, 30);
        assert_eq!(config.buffers.receive_size, 512);
        assert_eq!(config.buffers.send_size, 2048);
        assert_eq!(config.cache.build_hour, 5);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.templates["page"], "<html>{body}</html>");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs {
            port: Some(6000),
            send_buffer_size: Some(128),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        let file: TomlConfig = toml::from_str("[server]\nport = 7000\nmax_connections = 8").unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.port, 6000);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.send_buffer_size, 128);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_explicit_info_overrides_file_level() {
        let file: TomlConfig = toml::from_str("[logging]\nlevel = \"debug\"").unwrap();
        let config = Config::merge(CliArgs::default(), file);
        assert_eq!(config.log_level, "debug");

        let cli = CliArgs {
            log_level: Some("info".to_string()),
            ..Default::default()
        };
        let file: TomlConfig = toml::from_str("[logging]\nlevel = \"debug\"").unwrap();
        assert_eq!(Config::merge(cli, file).log_level, "info");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.port = u16::MAX - 5;
        assert!(matches!(config.validate(), Err(ConfigError::PortOutOfRange(_))));

        let mut config = Config::default();
        config.cache_build_hour = 24;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
