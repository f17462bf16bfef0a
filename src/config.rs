//! Server configuration.
//!
//! All options can be set from the environment with a `TANDEM_` prefix
//! (e.g. `TANDEM_LISTEN_ADDR`, `TANDEM_DURABLE_STORE_URL`). Anything not
//! set falls back to the defaults below.

use std::env;
use std::fmt;
use std::time::Duration;

/// Runtime configuration for the session endpoint and both stores.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the WebSocket endpoint binds to.
    pub listen_addr: String,
    /// Postgres connection string. Empty selects the in-memory store.
    pub durable_store_url: String,
    /// Redis connection string. Empty selects the in-memory ephemeral store.
    pub ephemeral_store_url: String,
    /// Origin allowlist for the upgrade handshake (None = allow any).
    pub frontend_origin: Option<String>,
    /// Idle read timeout before a session is closed.
    pub idle_timeout_seconds: u64,
    /// Retry attempts for durable-store writes.
    pub store_retry_attempts: u32,
    /// Operation-log window per file.
    pub op_log_window: usize,
    /// Presence entry TTL.
    pub presence_ttl_seconds: u64,
    /// Operation-log TTL after inactivity.
    pub op_log_ttl_seconds: u64,
    /// Chat ring length per room.
    pub chat_ring_size: usize,
    /// Chat ring TTL.
    pub chat_ttl_seconds: u64,
    /// Bounded per-session outbound queue depth.
    pub outbound_queue_frames: usize,
    /// HS256 secret for the default JWT verifier (binary only).
    pub auth_jwt_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
            durable_store_url: String::new(),
            ephemeral_store_url: String::new(),
            frontend_origin: None,
            idle_timeout_seconds: 60,
            store_retry_attempts: 3,
            op_log_window: 100,
            presence_ttl_seconds: 3600,
            op_log_ttl_seconds: 300,
            chat_ring_size: 100,
            chat_ttl_seconds: 86_400,
            outbound_queue_frames: 256,
            auth_jwt_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = env::var("TANDEM_LISTEN_ADDR") {
            config.listen_addr = v;
        }
        if let Ok(v) = env::var("TANDEM_DURABLE_STORE_URL") {
            config.durable_store_url = v;
        }
        if let Ok(v) = env::var("TANDEM_EPHEMERAL_STORE_URL") {
            config.ephemeral_store_url = v;
        }
        if let Ok(v) = env::var("TANDEM_FRONTEND_ORIGIN") {
            if !v.is_empty() {
                config.frontend_origin = Some(v);
            }
        }
        if let Ok(v) = env::var("TANDEM_AUTH_JWT_SECRET") {
            if !v.is_empty() {
                config.auth_jwt_secret = Some(v);
            }
        }

        config.idle_timeout_seconds =
            parse_var("TANDEM_IDLE_TIMEOUT_SECONDS", config.idle_timeout_seconds)?;
        config.store_retry_attempts =
            parse_var("TANDEM_STORE_RETRY_ATTEMPTS", config.store_retry_attempts)?;
        config.op_log_window = parse_var("TANDEM_OP_LOG_WINDOW", config.op_log_window)?;
        config.presence_ttl_seconds =
            parse_var("TANDEM_PRESENCE_TTL_SECONDS", config.presence_ttl_seconds)?;
        config.op_log_ttl_seconds =
            parse_var("TANDEM_OP_LOG_TTL_SECONDS", config.op_log_ttl_seconds)?;
        config.chat_ring_size = parse_var("TANDEM_CHAT_RING_SIZE", config.chat_ring_size)?;
        config.chat_ttl_seconds = parse_var("TANDEM_CHAT_TTL_SECONDS", config.chat_ttl_seconds)?;
        config.outbound_queue_frames = parse_var(
            "TANDEM_OUTBOUND_QUEUE_FRAMES",
            config.outbound_queue_frames,
        )?;

        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_seconds)
    }

    pub fn op_log_ttl(&self) -> Duration {
        Duration::from_secs(self.op_log_ttl_seconds)
    }

    pub fn chat_ttl(&self) -> Duration {
        Duration::from_secs(self.chat_ttl_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

/// Fatal configuration error (exit code 1 at startup).
#[derive(Debug, Clone)]
pub enum ConfigError {
    Invalid(String, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(name, value) => {
                write!(f, "invalid value for {name}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
