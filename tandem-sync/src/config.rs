//! Server configuration.
//!
//! Values come from the process environment:
//!
//! | Variable                  | Field              | Default   |
//! |---------------------------|--------------------|-----------|
//! | `HOST`                    | `host`             | `0.0.0.0` |
//! | `PORT`                    | `port`             | `1234`    |
//! | `JWT_SECRET`              | `jwt_secret`       | unset     |
//! | `SYNC_DEV_MODE`           | `dev_mode`         | `false`   |
//! | `SYNC_PEER_QUEUE`         | `peer_queue_capacity` | `256`  |
//! | `SYNC_SESSION_GRACE_SECS` | `session_grace`    | unset (sessions never evicted) |

use std::time::Duration;

use crate::error::{ServerError, ServerResult};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind to
    pub host: String,
    /// Listen port (0 = ephemeral)
    pub port: u16,
    /// Shared HS256 secret for bearer token verification
    pub jwt_secret: Option<String>,
    /// Admit connections whose token is missing or unverifiable.
    /// Must be switched on explicitly; a missing secret alone never enables it.
    pub dev_mode: bool,
    /// Frames buffered per peer before the peer counts as lagging and is evicted
    pub peer_queue_capacity: usize,
    /// How long an empty session is kept before eviction (None = forever)
    pub session_grace: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1234,
            jwt_secret: None,
            dev_mode: false,
            peer_queue_capacity: 256,
            session_grace: None,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> ServerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse_number("PORT", &port)?;
        }
        config.jwt_secret = lookup("JWT_SECRET").filter(|s| !s.is_empty());
        if let Some(flag) = lookup("SYNC_DEV_MODE") {
            config.dev_mode = parse_flag("SYNC_DEV_MODE", &flag)?;
        }
        if let Some(capacity) = lookup("SYNC_PEER_QUEUE") {
            let capacity: usize = parse_number("SYNC_PEER_QUEUE", &capacity)?;
            if capacity == 0 {
                return Err(ServerError::Config("SYNC_PEER_QUEUE must be positive".into()));
            }
            config.peer_queue_capacity = capacity;
        }
        if let Some(secs) = lookup("SYNC_SESSION_GRACE_SECS") {
            let secs: u64 = parse_number("SYNC_SESSION_GRACE_SECS", &secs)?;
            config.session_grace = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Address string for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Bind to the given host and port.
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Require tokens signed with `secret`.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    /// Toggle permissive development mode.
    pub fn with_dev_mode(mut self, enabled: bool) -> Self {
        self.dev_mode = enabled;
        self
    }

    /// Set the per-peer outbound queue capacity.
    pub fn with_peer_queue_capacity(mut self, capacity: usize) -> Self {
        self.peer_queue_capacity = capacity.max(1);
        self
    }

    /// Evict sessions that stay empty for `grace`.
    pub fn with_session_grace(mut self, grace: Duration) -> Self {
        self.session_grace = Some(grace);
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> ServerResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ServerError::Config(format!("{key} is not a valid number: {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> ServerResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ServerError::Config(format!("{key} is not a boolean: {value:?}"))),
    }
}
