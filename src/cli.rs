//! Command-line and configuration-file handling for the `tcpserv` binary.
//!
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

use tcpserv::config::{
    DEFAULT_BACKLOG, DEFAULT_MAX_CONNECTIONS, DEFAULT_SERVER_IO_TIMEOUT, DEFAULT_SHUTDOWN_GRACE,
};
use tcpserv::frame::DEFAULT_MAX_PAYLOAD_BYTES;
use tcpserv::{ClientOptions, HandlerErrorPolicy, LengthPrefix, ServerOptions, ShutdownPolicy};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcpserv")]
#[command(version = "0.1.0")]
#[command(about = "Stateless request/response TCP services", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a listener with a built-in handler until Ctrl-C
    Serve {
        /// Address to bind to (e.g., 127.0.0.1:55555)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Handler applied to every request
        #[arg(long, value_enum)]
        handler: Option<BuiltinHandler>,

        /// Maximum accepted request payload in bytes
        #[arg(short = 'm', long)]
        max_payload_bytes: Option<usize>,

        /// Per read/write stall timeout in milliseconds
        #[arg(long)]
        io_timeout_ms: Option<u64>,
    },

    /// Send one request and print the response
    Request {
        /// Server address (e.g., 127.0.0.1:55555)
        #[arg(short = 'a', long)]
        connect: Option<String>,

        /// Connect timeout in milliseconds
        #[arg(long)]
        connect_timeout_ms: Option<u64>,

        /// Per read/write stall timeout in milliseconds
        #[arg(long)]
        io_timeout_ms: Option<u64>,

        /// Request payload
        payload: String,
    },
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinHandler {
    Echo,
    #[default]
    Reverse,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnHandlerError {
    #[default]
    Close,
    Respond,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnShutdown {
    #[default]
    Drain,
    Abort,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to, also the default target of `request`
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub handler: BuiltinHandler,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub on_handler_error: OnHandlerError,
    /// Marker payload written when `on_handler_error = "respond"`
    #[serde(default)]
    pub error_response: String,
    #[serde(default)]
    pub shutdown: OnShutdown,
    pub shutdown_grace_ms: Option<u64>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            handler: BuiltinHandler::default(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            on_handler_error: OnHandlerError::default(),
            error_response: String::new(),
            shutdown: OnShutdown::default(),
            shutdown_grace_ms: None,
        }
    }
}

/// Framing configuration, shared by both roles
#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub length_prefix: LengthPrefix,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            length_prefix: LengthPrefix::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TimeoutSection {
    pub connect_ms: Option<u64>,
    pub io_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
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
    "127.0.0.1:55555".to_string()
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary was asked to do, fully resolved.
#[derive(Debug, Clone)]
pub enum Action {
    Serve {
        host: String,
        port: u16,
        handler: BuiltinHandler,
        options: ServerOptions,
    },
    Request {
        host: String,
        port: u16,
        payload: Bytes,
        options: ClientOptions,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub action: Action,
}

impl Config {
    /// Parse the process arguments and resolve against the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = cli.log_level.unwrap_or(file.logging.level);
        let connect_ms = file.timeouts.connect_ms;

        let action = match cli.command {
            Command::Serve {
                listen,
                handler,
                max_payload_bytes,
                io_timeout_ms,
            } => {
                let (host, port) = split_addr(&listen.unwrap_or(file.server.listen))?;
                let on_handler_error = match file.server.on_handler_error {
                    OnHandlerError::Close => HandlerErrorPolicy::Close,
                    OnHandlerError::Respond => {
                        HandlerErrorPolicy::Respond(Bytes::from(file.server.error_response))
                    }
                };
                let shutdown = match file.server.shutdown {
                    OnShutdown::Drain => ShutdownPolicy::Drain,
                    OnShutdown::Abort => ShutdownPolicy::Abort,
                };
                let options = ServerOptions {
                    max_payload_bytes: max_payload_bytes.unwrap_or(file.protocol.max_payload_bytes),
                    length_prefix: file.protocol.length_prefix,
                    io_timeout: Some(
                        io_timeout_ms
                            .or(file.timeouts.io_ms)
                            .map_or(DEFAULT_SERVER_IO_TIMEOUT, Duration::from_millis),
                    ),
                    backlog: file.server.backlog,
                    max_connections: file.server.max_connections,
                    on_handler_error,
                    shutdown,
                    shutdown_grace: Some(
                        file.server
                            .shutdown_grace_ms
                            .map_or(DEFAULT_SHUTDOWN_GRACE, Duration::from_millis),
                    ),
                };
                Action::Serve {
                    host,
                    port,
                    handler: handler.unwrap_or(file.server.handler),
                    options,
                }
            }
            Command::Request {
                connect,
                connect_timeout_ms,
                io_timeout_ms,
                payload,
            } => {
                let (host, port) = split_addr(&connect.unwrap_or(file.server.listen))?;
                let options = ClientOptions {
                    max_payload_bytes: file.protocol.max_payload_bytes,
                    length_prefix: file.protocol.length_prefix,
                    connect_timeout: connect_timeout_ms.or(connect_ms).map(Duration::from_millis),
                    io_timeout: io_timeout_ms.or(file.timeouts.io_ms).map(Duration::from_millis),
                };
                Action::Request {
                    host,
                    port,
                    payload: Bytes::from(payload),
                    options,
                }
            }
        };

        Ok(Config { log_level, action })
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_addr(addr: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid address '{0}', expected HOST:PORT")]
    InvalidAddress(String),
}
