//! Configuration module for duplex-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "duplex-echo")]
#[command(author = "duplex-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A structured-concurrency TCP echo service", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub role: RoleArgs,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Payload written by the sender on every tick
    #[arg(long, global = true)]
    pub payload: Option<String>,

    /// Milliseconds between payload writes
    #[arg(long, global = true)]
    pub interval_ms: Option<u64>,
}

/// Which end of the connection to run
#[derive(Subcommand, Debug)]
pub enum RoleArgs {
    /// Connect to a peer and run one session until it closes the stream
    Client {
        /// Host to connect to
        #[arg(long)]
        host: Option<String>,

        /// Port to connect to
        #[arg(short, long)]
        port: Option<u16>,

        /// Give up connecting after this many milliseconds
        #[arg(long)]
        connect_timeout_ms: Option<u64>,
    },
    /// Accept connections and run a session on each
    Server {
        /// Address to bind to (e.g., 127.0.0.1:12345)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// What the server's sender writes
        #[arg(long, value_enum)]
        mode: Option<ServerMode>,

        /// Maximum number of concurrent sessions
        #[arg(long)]
        max_connections: Option<usize>,
    },
}

/// Role selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// What a server session writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Write back every chunk received
    Echo,
    /// Write the configured payload on a timer, like a client
    Fixed,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Host to connect to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// What the server writes
    #[serde(default = "default_server_mode")]
    pub mode: ServerMode,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mode: default_server_mode(),
            max_connections: default_max_connections(),
        }
    }
}

/// Per-session configuration shared by both roles
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Payload written on every tick
    #[serde(default = "default_payload")]
    pub payload: String,
    /// Milliseconds between writes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Bytes reserved for each read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on session sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Milliseconds a write may stall after the session is cancelled
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload: default_payload(),
            interval_ms: default_interval_ms(),
            read_buffer_size: default_read_buffer_size(),
            nodelay: default_nodelay(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_server_mode() -> ServerMode {
    ServerMode::Echo
}

fn default_max_connections() -> usize {
    1024
}

fn default_payload() -> String {
    "async can sometimes be confusing, but I believe in you!".to_string()
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_read_buffer_size() -> usize {
    4 * 1024
}

fn default_nodelay() -> bool {
    true
}

fn default_cancel_grace_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub listen: String,
    pub server_mode: ServerMode,
    pub max_connections: usize,
    pub payload: String,
    pub interval: Duration,
    pub read_buffer_size: usize,
    pub nodelay: bool,
    pub cancel_grace: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML config and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            client,
            server,
            session,
            logging,
        } = toml_config;

        let mut config = Config {
            role: Role::Client,
            host: client.host,
            port: client.port,
            connect_timeout: Duration::from_millis(client.connect_timeout_ms),
            listen: server.listen,
            server_mode: server.mode,
            max_connections: server.max_connections,
            payload: cli.payload.unwrap_or(session.payload),
            interval: Duration::from_millis(cli.interval_ms.unwrap_or(session.interval_ms)),
            read_buffer_size: session.read_buffer_size,
            nodelay: session.nodelay,
            cancel_grace: Duration::from_millis(session.cancel_grace_ms),
            log_level: cli.log_level.unwrap_or(logging.level),
        };

        match cli.role {
            RoleArgs::Client {
                host,
                port,
                connect_timeout_ms,
            } => {
                config.role = Role::Client;
                if let Some(host) = host {
                    config.host = host;
                }
                if let Some(port) = port {
                    config.port = port;
                }
                if let Some(ms) = connect_timeout_ms {
                    config.connect_timeout = Duration::from_millis(ms);
                }
            }
            RoleArgs::Server {
                listen,
                mode,
                max_connections,
            } => {
                config.role = Role::Server;
                if let Some(listen) = listen {
                    config.listen = listen;
                }
                if let Some(mode) = mode {
                    config.server_mode = mode;
                }
                if let Some(max) = max_connections {
                    config.max_connections = max;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.role == Role::Client && self.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".into()));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("interval must be greater than zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be greater than zero".into()));
        }
        if self.payload.is_empty() {
            return Err(ConfigError::Invalid("payload must not be empty".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read buffer size must be greater than zero".into()));
        }
        if self.cancel_grace.is_zero() {
            return Err(ConfigError::Invalid("cancel grace must be greater than zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max connections must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
