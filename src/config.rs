//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::error::FederationError;

/// Signature algorithms the verifier and signer understand.
pub const SUPPORTED_ALGORITHMS: &[&str] = &["rsa-sha256", "rsa-sha512", "hs2019"];

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 3000)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "forge.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://forge.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Domain without port, used for synthesized e-mail addresses.
    pub fn host_name(&self) -> String {
        normalized_server_host(&self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Display name of the instance service actor
    pub name: String,
    /// Software name advertised through NodeInfo
    pub software_name: String,
    /// RSA modulus size for generated signing keys
    pub key_bits: usize,
}

/// Federation settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Mount ActivityPub routes and start the delivery runtime
    pub enabled: bool,
    /// Publish user counts in NodeInfo
    pub share_user_statistics: bool,
    /// Maximum accepted body size in bytes, inbound and outbound
    pub max_size: usize,
    /// Accepted signature algorithms; the first one is used for signing
    pub algorithms: Vec<String>,
    /// Allowed clock skew for the Date header in seconds
    pub clock_skew_secs: i64,
    /// TCP connect timeout for outbound calls
    pub connect_timeout_secs: u64,
    /// Total timeout for each outbound call
    pub request_timeout_secs: u64,
    /// Permit outbound calls to loopback/private addresses (testing only)
    pub allow_private_networks: bool,
    /// How long fetched public keys stay cached
    pub public_key_cache_ttl_secs: u64,
    /// Seconds between re-fetches of federated user profiles (0 = never)
    pub profile_refresh_interval_secs: u64,
    pub queue: QueueConfig,
}

impl FederationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Algorithm used for outbound signatures.
    pub fn signing_algorithm(&self) -> &str {
        self.algorithms
            .first()
            .map(String::as_str)
            .unwrap_or("rsa-sha256")
    }
}

/// Delivery queue settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub pending_workers: usize,
    pub refresh_workers: usize,
    pub delivery_workers: usize,
    /// Items claimed per worker poll
    pub batch_size: u32,
    /// Idle poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Seconds a claimed item stays invisible to other workers
    pub lease_secs: i64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Drop an item after this many failed attempts (0 = retry forever)
    pub max_attempts: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FORGEFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, FederationError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.domain", "localhost:3000")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/forgefed.db")?
            .set_default("instance.name", "forgefed")?
            .set_default("instance.software_name", "forgejo")?
            .set_default("instance.key_bits", 4096)?
            .set_default("federation.enabled", true)?
            .set_default("federation.share_user_statistics", true)?
            .set_default("federation.max_size", 4 * 1024 * 1024)?
            .set_default("federation.algorithms", vec!["rsa-sha256", "rsa-sha512"])?
            .set_default("federation.clock_skew_secs", 300)?
            .set_default("federation.connect_timeout_secs", 5)?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.allow_private_networks", false)?
            .set_default("federation.public_key_cache_ttl_secs", 3600)?
            .set_default("federation.profile_refresh_interval_secs", 86400)?
            .set_default("federation.queue.pending_workers", 2)?
            .set_default("federation.queue.refresh_workers", 2)?
            .set_default("federation.queue.delivery_workers", 4)?
            .set_default("federation.queue.batch_size", 20)?
            .set_default("federation.queue.poll_interval_ms", 2000)?
            .set_default("federation.queue.lease_secs", 300)?
            .set_default("federation.queue.base_backoff_secs", 5)?
            .set_default("federation.queue.max_backoff_secs", 3600)?
            .set_default("federation.queue.max_attempts", 0)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FORGEFED")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.algorithms")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), FederationError> {
        if self.federation.algorithms.is_empty() {
            return Err(FederationError::Config(
                "federation.algorithms must not be empty".to_string(),
            ));
        }

        for algorithm in &self.federation.algorithms {
            if !SUPPORTED_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(FederationError::Config(format!(
                    "federation.algorithms contains unsupported algorithm: {}",
                    algorithm
                )));
            }
        }

        let queue = &self.federation.queue;
        if queue.pending_workers == 0 || queue.refresh_workers == 0 || queue.delivery_workers == 0
        {
            return Err(FederationError::Config(
                "federation.queue worker counts must be greater than 0".to_string(),
            ));
        }

        if queue.batch_size == 0 {
            return Err(FederationError::Config(
                "federation.queue.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.instance.key_bits < 1024 {
            return Err(FederationError::Config(
                "instance.key_bits must be at least 1024".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(FederationError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_networks {
            tracing::warn!("Outbound federation requests may reach private networks");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
