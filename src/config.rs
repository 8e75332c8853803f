//! Configuration Module
//!
//! Handles configuration loading from a YAML file, environment variables and
//! command-line arguments, in that order of precedence. The result is
//! validated once at startup and never changed afterwards.

use crate::{NodeError, Result};
use clap::{Arg, ArgMatches, Command};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let seconds = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "" => value, // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(seconds)
            .map_err(|e| format!("Duration out of range '{}': {}", s, e))
    }
}

use duration_serde::parse_duration;

const MIN_CACHE_SIZE_MIB: u64 = 1024;
const MIN_THREADS: usize = 4;
const MIN_GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(15);
const CLIENT_SECRET_PATTERN: &str = "^[a-zA-Z0-9]{52}$";

/// Serving and bandwidth configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub client_hostname: String,
    pub client_port: u16,
    /// Port advertised to the coordinator, 0 to advertise `client_port`
    pub client_external_port: u16,
    /// Worker threads; also bounds concurrent requests
    pub threads: usize,
    /// Egress speed reported to the coordinator, 0 for unlimited
    pub max_kilobits_per_second: u64,
    /// Hourly egress cap, 0 for unlimited
    pub max_mebibytes_per_hour: u64,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub graceful_shutdown_wait: Duration,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub tick_interval: Duration,
    /// Referer hosts allowed to embed images, empty to allow any
    pub allowed_referer_domains: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_hostname: "0.0.0.0".to_string(),
            client_port: 443,
            client_external_port: 0,
            threads: 16,
            max_kilobits_per_second: 0,
            max_mebibytes_per_hour: 0,
            graceful_shutdown_wait: Duration::from_secs(60),
            tick_interval: Duration::from_secs(15),
            allowed_referer_domains: vec![
                "mangadex.org".to_string(),
                "mangadex.network".to_string(),
            ],
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.client_port == 0 {
            return Err("client_port must not be 0".to_string());
        }
        if self.threads < MIN_THREADS {
            return Err(format!(
                "threads must be at least {} (got {})",
                MIN_THREADS, self.threads
            ));
        }
        if self.graceful_shutdown_wait < MIN_GRACEFUL_SHUTDOWN_WAIT {
            return Err(format!(
                "graceful_shutdown_wait must be at least {}s (got {:?})",
                MIN_GRACEFUL_SHUTDOWN_WAIT.as_secs(),
                self.graceful_shutdown_wait
            ));
        }
        if self.tick_interval.is_zero() {
            return Err("tick_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub cache_dir: PathBuf,
    pub max_cache_size_mib: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache"),
            max_cache_size_mib: 20 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_cache_size_mib < MIN_CACHE_SIZE_MIB {
            return Err(format!(
                "max_cache_size_mib must be at least {} (got {})",
                MIN_CACHE_SIZE_MIB, self.max_cache_size_mib
            ));
        }
        Ok(())
    }

    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_mib * 1024 * 1024
    }
}

/// Coordinator connection configuration
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub url: String,
    pub client_secret: String,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("url", &self.url)
            .field("client_secret", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: "https://api.mangadex.network/".to_string(),
            client_secret: String::new(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!("coordinator url must be http(s): {}", self.url));
        }
        let pattern = Regex::new(CLIENT_SECRET_PATTERN).map_err(|e| e.to_string())?;
        if !pattern.is_match(&self.client_secret) {
            return Err("client_secret must be 52 alphanumeric characters".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Application logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            log_level: "info".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub coordinator: CoordinatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, |name| std::env::var(name).ok())
    }

    /// Load configuration from explicit arguments and environment lookup
    pub fn load_from_args<I, T, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
        F: Fn(&str) -> Option<String>,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| NodeError::ConfigError(e.to_string()))?;
        Self::from_matches(&matches, env)
    }

    fn from_matches<F>(matches: &ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env)?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        info!(
            "Configuration loaded: listen={}:{}, cache_dir={:?}, max_cache_size={} MiB, threads={}",
            config.server.client_hostname,
            config.server.client_port,
            config.cache.cache_dir,
            config.cache.max_cache_size_mib,
            config.server.threads
        );
        Ok(config)
    }

    /// Build CLI command structure
    pub fn build_cli() -> Command {
        Command::new("edge-node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Edge image cache node")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Cache directory"),
            )
            .arg(
                Arg::new("max-cache-size-mib")
                    .long("max-cache-size-mib")
                    .value_name("MIB")
                    .help("Maximum cache size in MiB (minimum 1024)"),
            )
            .arg(
                Arg::new("client-hostname")
                    .long("client-hostname")
                    .value_name("HOST")
                    .help("Address to listen on"),
            )
            .arg(
                Arg::new("client-port")
                    .short('p')
                    .long("client-port")
                    .value_name("PORT")
                    .help("Port to listen on"),
            )
            .arg(
                Arg::new("client-external-port")
                    .long("client-external-port")
                    .value_name("PORT")
                    .help("Port advertised to the coordinator"),
            )
            .arg(
                Arg::new("threads")
                    .long("threads")
                    .value_name("COUNT")
                    .help("Worker threads (minimum 4)"),
            )
            .arg(
                Arg::new("max-mebibytes-per-hour")
                    .long("max-mebibytes-per-hour")
                    .value_name("MIB")
                    .help("Hourly egress cap in MiB, 0 for unlimited"),
            )
            .arg(
                Arg::new("max-kilobits-per-second")
                    .long("max-kilobits-per-second")
                    .value_name("KBPS")
                    .help("Egress speed reported to the coordinator, 0 for unlimited"),
            )
            .arg(
                Arg::new("graceful-shutdown-wait")
                    .long("graceful-shutdown-wait")
                    .value_name("DURATION")
                    .help("Time allowed for draining, e.g. 60s (minimum 15s)"),
            )
            .arg(
                Arg::new("coordinator-url")
                    .long("coordinator-url")
                    .value_name("URL")
                    .help("Coordinator base URL"),
            )
            .arg(
                Arg::new("log-dir")
                    .long("log-dir")
                    .value_name("DIR")
                    .help("Application log directory"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            NodeError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = env("CACHE_DIR") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(&dir);
        }
        if let Some(size) = env("MAX_CACHE_SIZE_MIB") {
            self.cache.max_cache_size_mib = parse_number("MAX_CACHE_SIZE_MIB", &size)?;
        }
        if let Some(host) = env("CLIENT_HOSTNAME") {
            self.server.client_hostname = host;
        }
        if let Some(port) = env("CLIENT_PORT") {
            self.server.client_port = parse_number("CLIENT_PORT", &port)?;
        }
        if let Some(port) = env("CLIENT_EXTERNAL_PORT") {
            self.server.client_external_port = parse_number("CLIENT_EXTERNAL_PORT", &port)?;
        }
        if let Some(threads) = env("THREADS") {
            self.server.threads = parse_number("THREADS", &threads)?;
        }
        if let Some(cap) = env("MAX_MEBIBYTES_PER_HOUR") {
            self.server.max_mebibytes_per_hour = parse_number("MAX_MEBIBYTES_PER_HOUR", &cap)?;
        }
        if let Some(speed) = env("MAX_KILOBITS_PER_SECOND") {
            self.server.max_kilobits_per_second = parse_number("MAX_KILOBITS_PER_SECOND", &speed)?;
        }
        if let Some(wait) = env("GRACEFUL_SHUTDOWN_WAIT") {
            self.server.graceful_shutdown_wait =
                parse_duration(&wait).map_err(NodeError::ConfigError)?;
        }
        if let Some(url) = env("COORDINATOR_URL") {
            self.coordinator.url = url;
        }
        if let Some(secret) = env("CLIENT_SECRET") {
            self.coordinator.client_secret = secret;
        }
        if let Some(dir) = env("LOG_DIR") {
            self.logging.log_dir = pathbuf_serde::expand_tilde(&dir);
        }
        if let Some(level) = env("LOG_LEVEL") {
            self.logging.log_level = level;
        }
        Ok(())
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(dir);
        }
        if let Some(size) = matches.get_one::<String>("max-cache-size-mib") {
            self.cache.max_cache_size_mib = parse_number("--max-cache-size-mib", size)?;
        }
        if let Some(host) = matches.get_one::<String>("client-hostname") {
            self.server.client_hostname = host.clone();
        }
        if let Some(port) = matches.get_one::<String>("client-port") {
            self.server.client_port = parse_number("--client-port", port)?;
        }
        if let Some(port) = matches.get_one::<String>("client-external-port") {
            self.server.client_external_port = parse_number("--client-external-port", port)?;
        }
        if let Some(threads) = matches.get_one::<String>("threads") {
            self.server.threads = parse_number("--threads", threads)?;
        }
        if let Some(cap) = matches.get_one::<String>("max-mebibytes-per-hour") {
            self.server.max_mebibytes_per_hour = parse_number("--max-mebibytes-per-hour", cap)?;
        }
        if let Some(speed) = matches.get_one::<String>("max-kilobits-per-second") {
            self.server.max_kilobits_per_second =
                parse_number("--max-kilobits-per-second", speed)?;
        }
        if let Some(wait) = matches.get_one::<String>("graceful-shutdown-wait") {
            self.server.graceful_shutdown_wait =
                parse_duration(wait).map_err(NodeError::ConfigError)?;
        }
        if let Some(url) = matches.get_one::<String>("coordinator-url") {
            self.coordinator.url = url.clone();
        }
        if let Some(dir) = matches.get_one::<String>("log-dir") {
            self.logging.log_dir = pathbuf_serde::expand_tilde(dir);
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .map_err(|e| NodeError::ConfigError(format!("Invalid server configuration: {}", e)))?;
        self.cache
            .validate()
            .map_err(|e| NodeError::ConfigError(format!("Invalid cache configuration: {}", e)))?;
        self.coordinator.validate().map_err(|e| {
            NodeError::ConfigError(format!("Invalid coordinator configuration: {}", e))
        })?;
        Ok(())
    }

    /// Port reported to the coordinator
    pub fn advertised_port(&self) -> u16 {
        if self.server.client_external_port != 0 {
            self.server.client_external_port
        } else {
            self.server.client_port
        }
    }

    /// Egress speed in bytes per second, 0 when unlimited
    pub fn network_speed_bytes_per_second(&self) -> u64 {
        self.server.max_kilobits_per_second * 1000 / 8
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| NodeError::ConfigError(format!("Invalid value for {}: {} ({})", name, value, e)))
}
