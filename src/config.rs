//! Configuration module for fullname-server.
//!
//! Settings come from a JSON configuration file (or TOML when the file has a
//! `.toml` extension) plus command-line arguments. CLI arguments take
//! precedence over config file values.

use crate::protocol::DEFAULT_SIGNATURE;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Watchdog deadline as a multiple of the per-step delay.
pub const WATCHDOG_FACTOR: u64 = 20;

/// Lower bound on the watchdog deadline.
pub const MIN_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(1);

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "fullname-server")]
#[command(author = "fullname-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A one-shot name-transformation TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long, default_value = "config/config.json")]
    pub config: PathBuf,

    /// Activity log file, overrides `log_file_name`
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Error log file, overrides `error_log_file_name`
    #[arg(long)]
    pub error_log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// How each connection is handled
    #[arg(long, value_enum)]
    pub worker: Option<WorkerMode>,

    /// What to do with in-flight connections on shutdown
    #[arg(long, value_enum)]
    pub shutdown: Option<ShutdownMode>,

    /// Number of runtime threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and serve them (default)
    Serve,
    /// Serve a single exchange over stdin/stdout; used by process workers
    Handle(HandleArgs),
}

/// Arguments passed to a worker process.
#[derive(Args, Debug, Clone)]
pub struct HandleArgs {
    /// Delay before and after transforming the message, in seconds
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,

    /// Activity log file to append to
    #[arg(long)]
    pub activity_log: Option<PathBuf>,

    /// Signature placed in replies
    #[arg(long, default_value = DEFAULT_SIGNATURE)]
    pub signature: String,

    /// Activity log level
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// How the server runs the exchange for each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// A task inside the server process.
    #[default]
    Task,
    /// A child process with the socket as its stdin and stdout.
    Process,
}

/// Whether shutdown waits for in-flight connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Stop accepting, then wait for live connections to finish.
    #[default]
    Drain,
    /// Stop accepting and exit right away.
    Immediate,
}

/// Port given either as a string (`"8080"`) or a number (`8080`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Text(String),
    Number(u16),
}

impl From<PortValue> for String {
    fn from(port: PortValue) -> Self {
        match port {
            PortValue::Text(s) => s,
            PortValue::Number(n) => n.to_string(),
        }
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    PortValue::deserialize(deserializer).map(String::from)
}

/// Configuration file structure
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    /// Address to bind to
    pub address: String,
    /// Port to bind to
    #[serde(deserialize_with = "deserialize_port")]
    pub port: String,
    /// Activity log file
    pub log_file_name: PathBuf,
    /// Error log file
    pub error_log_file_name: PathBuf,
    /// Per-step delay in seconds
    pub timeout: u64,
    #[serde(default)]
    pub worker: WorkerMode,
    /// Worker executable for process mode (defaults to this binary)
    #[serde(default)]
    pub worker_program: Option<PathBuf>,
    /// Watchdog deadline in seconds
    #[serde(default)]
    pub watchdog_timeout: Option<u64>,
    #[serde(default)]
    pub shutdown: ShutdownMode,
    /// Upper bound on the drain phase in seconds
    #[serde(default)]
    pub drain_timeout: Option<u64>,
    #[serde(default = "default_signature")]
    pub signature: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of runtime threads
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_signature() -> String {
    DEFAULT_SIGNATURE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FileConfig {
    /// Parse a configuration file, choosing the format by extension.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
        } else {
            serde_json::from_str(contents)
                .map_err(|e| ConfigError::JsonParse(path.to_path_buf(), e))
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: String,
    /// Delay applied before and after each transform
    pub timeout: Duration,
    /// Deadline after which a worker is killed
    pub watchdog_timeout: Duration,
    pub worker: WorkerMode,
    pub worker_program: Option<PathBuf>,
    pub shutdown: ShutdownMode,
    pub drain_timeout: Duration,
    pub signature: String,
    pub log_file: PathBuf,
    pub error_log_file: PathBuf,
    pub log_level: String,
    pub workers: Option<usize>,
}

impl Config {
    /// Load the configuration file named by `cli` and merge CLI overrides.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&cli.config)
            .map_err(|e| ConfigError::FileRead(cli.config.clone(), e))?;
        let file = FileConfig::parse(&cli.config, &contents)?;

        Ok(Self::resolve(cli, file))
    }

    /// Merge CLI args with file config (CLI takes precedence)
    fn resolve(cli: &CliArgs, file: FileConfig) -> Self {
        let timeout = Duration::from_secs(file.timeout);
        let watchdog_timeout = watchdog_deadline(file.timeout, file.watchdog_timeout);
        let drain_timeout = file
            .drain_timeout
            .map(Duration::from_secs)
            .unwrap_or(watchdog_timeout + Duration::from_secs(1));

        Config {
            address: file.address,
            port: file.port,
            timeout,
            watchdog_timeout,
            worker: cli.worker.unwrap_or(file.worker),
            worker_program: file.worker_program,
            shutdown: cli.shutdown.unwrap_or(file.shutdown),
            drain_timeout,
            signature: file.signature,
            log_file: cli.log_file.clone().unwrap_or(file.log_file_name),
            error_log_file: cli
                .error_log_file
                .clone()
                .unwrap_or(file.error_log_file_name),
            log_level: cli.log_level.clone().unwrap_or(file.log_level),
            workers: cli.workers.or(file.workers),
        }
    }

    /// `address:port` as given in the configuration.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    #[cfg(test)]
    pub fn for_test(timeout_secs: u64) -> Self {
        let watchdog_timeout = watchdog_deadline(timeout_secs, None);
        Config {
            address: "127.0.0.1".to_string(),
            port: "0".to_string(),
            timeout: Duration::from_secs(timeout_secs),
            watchdog_timeout,
            worker: WorkerMode::Task,
            worker_program: None,
            shutdown: ShutdownMode::Drain,
            drain_timeout: watchdog_timeout + Duration::from_secs(1),
            signature: "Server written by X".to_string(),
            log_file: PathBuf::from("log_file.txt"),
            error_log_file: PathBuf::from("error_log_file.txt"),
            log_level: "info".to_string(),
            workers: None,
        }
    }
}

/// Watchdog deadline: an explicit value, or `WATCHDOG_FACTOR` times the
/// per-step delay, never below `MIN_WATCHDOG_TIMEOUT`.
fn watchdog_deadline(timeout_secs: u64, explicit: Option<u64>) -> Duration {
    let secs = explicit.unwrap_or_else(|| timeout_secs.saturating_mul(WATCHDOG_FACTOR));
    Duration::from_secs(secs).max(MIN_WATCHDOG_TIMEOUT)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    JsonParse(PathBuf, serde_json::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::JsonParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
