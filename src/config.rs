//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before serving.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Values become visible to `env`-sourced variables.
    pub env_files: Vec<String>,
    /// HTTP server
    pub server: ServerConfig,
    /// Outbound relay
    pub relay: RelayConfig,
    /// Connection logging
    pub logging: LoggingConfig,
    /// Catalog file seeding the in-memory store
    pub catalog: Option<PathBuf>,
}

impl Config {
    /// Load configuration from an optional YAML file plus `ACCELMCP_` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("ACCELMCP_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load env files into the process environment.
    pub fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Domain under which subdomain-routed services live
    /// (`<identifier>.<base_domain>`)
    pub base_domain: Option<String>,
    /// Accept `?service=` / `X-MCP-Service` on `/mcp` when the host does not match
    pub routing_fallback: bool,
    /// Time allowed to receive a request body; capability calls use their own timeouts
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39400,
            base_domain: None,
            routing_fallback: true,
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Outbound relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle pooled connection lifetime
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// Cap on backend detail carried in relay errors
    pub max_error_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            max_error_body_bytes: 1000,
        }
    }
}

/// Connection log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Record connection logs at all
    pub enabled: bool,
    /// Background writer tasks
    pub workers: usize,
    /// Pending records before new ones are dropped
    pub queue_capacity: usize,
    /// Body size kept per record (bytes)
    pub max_body_bytes: usize,
    /// Masking rules
    pub masking: MaskingConfig,
    /// Age after which records are pruned
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// How often pruning runs
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            queue_capacity: 1024,
            max_body_bytes: 10 * 1024,
            masking: MaskingConfig::default(),
            retention: Duration::from_secs(30 * 24 * 3600),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

/// Which sensitive patterns are masked in logged bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// 13-19 digit card-like numbers
    pub credit_cards: bool,
    /// Email addresses
    pub emails: bool,
    /// Phone-number-like digit groups
    pub phone_numbers: bool,
    /// Extra regexes, each match replaced with `[REDACTED]`
    pub custom_patterns: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            credit_cards: true,
            emails: true,
            phone_numbers: true,
            custom_patterns: Vec::new(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string ("100ms", "30s", "5m", "2h", "30d")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; a bare number is seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.trim().parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
