//! Configuration management for Turnstile.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Policy, Tier};
use crate::store::RedisStoreOptions;

/// Prefix for environment overrides, e.g. `TURNSTILE__POLICIES__IP__WINDOW_SECS`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Unprefixed policy variables understood for compatibility with existing
/// deployments, and the setting each one feeds.
///
/// Despite the `PER_SECOND` names these are per-window limits; the
/// `BLOCK_DURATION` variables give the window length.
const LEGACY_POLICY_VARS: [(&str, &str); 4] = [
    ("IP_REQUESTS_PER_SECOND", "POLICIES__IP__REQUESTS_PER_WINDOW"),
    ("IP_BLOCK_DURATION_SECONDS", "POLICIES__IP__WINDOW_SECS"),
    (
        "DEFAULT_TOKEN_REQUESTS_PER_SECOND",
        "POLICIES__TOKEN__REQUESTS_PER_WINDOW",
    ),
    (
        "DEFAULT_TOKEN_BLOCK_DURATION_SECONDS",
        "POLICIES__TOKEN__WINDOW_SECS",
    ),
];

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-tier rate limit policies
    #[serde(default)]
    pub policies: PoliciesConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the rate limited application listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address of the admin API
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,

    /// Header carrying the caller's API token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Header carrying the proxy chain of client addresses
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            token_header: default_token_header(),
            forwarded_header: default_forwarded_header(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9091))
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

fn default_forwarded_header() -> String {
    "X-Forwarded-For".to_string()
}

/// Policies for both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// Policy for requests identified by client address
    #[serde(default = "default_ip_policy")]
    pub ip: PolicyConfig,

    /// Policy for requests carrying an API token
    #[serde(default = "default_token_policy")]
    pub token: PolicyConfig,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            ip: default_ip_policy(),
            token: default_token_policy(),
        }
    }
}

impl PoliciesConfig {
    /// Resolve the policy for `tier`.
    pub fn policy(&self, tier: Tier) -> Result<Policy> {
        let config = match tier {
            Tier::Ip => &self.ip,
            Tier::Token => &self.token,
        };
        config.to_policy().map_err(|e| match e {
            TurnstileError::Config(msg) => {
                TurnstileError::Config(format!("{} policy: {}", tier, msg))
            }
            other => other,
        })
    }
}

fn default_ip_policy() -> PolicyConfig {
    PolicyConfig {
        requests_per_window: 5,
        window_secs: 300,
    }
}

fn default_token_policy() -> PolicyConfig {
    PolicyConfig {
        requests_per_window: 10,
        window_secs: 300,
    }
}

/// A rate limit as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Requests admitted per window
    pub requests_per_window: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl PolicyConfig {
    /// Validate and convert into a [`Policy`].
    pub fn to_policy(&self) -> Result<Policy> {
        Policy::new(
            self.requests_per_window,
            Duration::from_secs(self.window_secs),
        )
    }
}

/// Which counter store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server; required when running several instances
    Redis,
    /// Process-local counters
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace for counter keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Number of Redis connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound on each store round trip in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            pool_size: default_pool_size(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    "turnstile".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_operation_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// Connection options for the Redis store.
    pub fn redis_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            url: self.url.clone(),
            key_prefix: self.key_prefix.clone(),
            pool_size: self.pool_size,
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }
}

/// Translate the unprefixed variables of older deployments into
/// `SECTION__FIELD` settings.
fn legacy_env<F>(lookup: F) -> Result<config::Map<String, String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut vars = config::Map::new();

    for (legacy, setting) in LEGACY_POLICY_VARS {
        if let Some(value) = lookup(legacy) {
            vars.insert(setting.to_string(), value);
        }
    }

    if let Some(port) = lookup("SERVER_PORT") {
        let port = parse_port("SERVER_PORT", &port)?;
        vars.insert(
            "SERVER__LISTEN_ADDR".to_string(),
            SocketAddr::from(([0, 0, 0, 0], port)).to_string(),
        );
    }

    let host = lookup("REDIS_HOST");
    let port = lookup("REDIS_PORT");
    let password = lookup("REDIS_PASSWORD");
    let db = lookup("REDIS_DB");
    if host.is_some() || port.is_some() || password.is_some() || db.is_some() {
        let host = host.unwrap_or_else(|| "localhost".to_string());
        let port = match port {
            Some(port) => parse_port("REDIS_PORT", &port)?,
            None => 6379,
        };
        let db: u32 = match db {
            Some(db) => db.trim().parse().map_err(|e| {
                TurnstileError::Config(format!("invalid REDIS_DB `{}`: {}", db, e))
            })?,
            None => 0,
        };
        let auth = match password {
            Some(password) if !password.is_empty() => format!(":{}@", password),
            _ => String::new(),
        };
        vars.insert(
            "STORE__URL".to_string(),
            format!("redis://{}{}:{}/{}", auth, host, port, db),
        );
    }

    Ok(vars)
}

fn parse_port(name: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| TurnstileError::Config(format!("invalid {} `{}`: {}", name, value, e)))
}

impl TurnstileConfig {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment, in increasing order of precedence.
    ///
    /// The unprefixed variables of older deployments (`IP_REQUESTS_PER_SECOND`,
    /// `REDIS_HOST`, `SERVER_PORT`, ...) are honored too, below any
    /// `TURNSTILE__*` override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = config::Config::try_from(&TurnstileConfig::default())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }
        let legacy = legacy_env(lookup)?;
        if !legacy.is_empty() {
            info!(settings = legacy.len(), "Applying legacy environment variables");
            builder = builder.add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(legacy)),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.policies.policy(Tier::Ip)?;
        self.policies.policy(Tier::Token)?;

        for (name, value) in [
            ("token_header", &self.server.token_header),
            ("forwarded_header", &self.server.forwarded_header),
        ] {
            HeaderName::try_from(value.as_str()).map_err(|e| {
                TurnstileError::Config(format!("invalid {} `{}`: {}", name, value, e))
            })?;
        }

        if self.store.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "store key_prefix must not be empty".to_string(),
            ));
        }
        if self.store.pool_size == 0 {
            return Err(TurnstileError::Config(
                "store pool_size must be greater than zero".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store operation_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
