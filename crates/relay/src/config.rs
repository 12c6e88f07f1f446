// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

use crate::access::{parse_room_acl, RoomAccessStore};

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `flowpresence_relay=debug`).
    pub log_filter: String,
    /// Raw room ACL (`room=user|user;room2=user`). `None` leaves rooms open.
    pub room_acl: Option<String>,
    pub activity: ActivityConfig,
    pub limits: ConnectionLimits,
}

/// Thresholds for the idle/away sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityConfig {
    pub idle_after: Duration,
    pub away_after: Duration,
    pub check_interval: Duration,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(60),
            away_after: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Per-user connection cap and per-connection message rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_connections_per_user: usize,
    /// Client frames accepted per `message_rate_window` on one connection.
    pub message_rate_limit: usize,
    pub message_rate_window: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self { max_connections_per_user: 10, message_rate_limit: 100, message_rate_window: Duration::from_secs(1) }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FLOWPRESENCE_RELAY_HOST` | `0.0.0.0` |
    /// | `FLOWPRESENCE_RELAY_PORT` | `8080` |
    /// | `FLOWPRESENCE_RELAY_CORS_ORIGINS` | *(none, cors.rs uses dev defaults)* |
    /// | `FLOWPRESENCE_RELAY_LOG_FILTER` | `info` |
    /// | `FLOWPRESENCE_RELAY_ROOM_ACL` | *(none, every room open)* |
    /// | `FLOWPRESENCE_RELAY_IDLE_TIMEOUT_SECS` | `60` |
    /// | `FLOWPRESENCE_RELAY_AWAY_TIMEOUT_SECS` | `300` |
    /// | `FLOWPRESENCE_RELAY_IDLE_CHECK_INTERVAL_SECS` | `60` |
    /// | `FLOWPRESENCE_RELAY_MAX_CONNECTIONS_PER_USER` | `10` |
    /// | `FLOWPRESENCE_RELAY_MESSAGE_RATE_LIMIT` | `100` |
    /// | `FLOWPRESENCE_RELAY_MESSAGE_RATE_WINDOW_SECS` | `1` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FLOWPRESENCE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("FLOWPRESENCE_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr =
            format!("{host}:{port}").parse().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let cors_origins = env("FLOWPRESENCE_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("FLOWPRESENCE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let room_acl = env("FLOWPRESENCE_RELAY_ROOM_ACL").ok().filter(|value| !value.trim().is_empty());

        let defaults = ActivityConfig::default();
        let positive = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok()).filter(|n| *n > 0);
        let secs = |key: &str, default: Duration| positive(key).map(Duration::from_secs).unwrap_or(default);
        let idle_after = secs("FLOWPRESENCE_RELAY_IDLE_TIMEOUT_SECS", defaults.idle_after);
        let away_after = secs("FLOWPRESENCE_RELAY_AWAY_TIMEOUT_SECS", defaults.away_after).max(idle_after);
        let check_interval = secs("FLOWPRESENCE_RELAY_IDLE_CHECK_INTERVAL_SECS", defaults.check_interval);

        let limit_defaults = ConnectionLimits::default();
        let count = |key: &str, default: usize| {
            positive(key).and_then(|n| usize::try_from(n).ok()).unwrap_or(default)
        };
        let limits = ConnectionLimits {
            max_connections_per_user: count(
                "FLOWPRESENCE_RELAY_MAX_CONNECTIONS_PER_USER",
                limit_defaults.max_connections_per_user,
            ),
            message_rate_limit: count("FLOWPRESENCE_RELAY_MESSAGE_RATE_LIMIT", limit_defaults.message_rate_limit),
            message_rate_window: secs("FLOWPRESENCE_RELAY_MESSAGE_RATE_WINDOW_SECS", limit_defaults.message_rate_window),
        };

        Self {
            listen_addr,
            cors_origins,
            log_filter,
            room_acl,
            activity: ActivityConfig { idle_after, away_after, check_interval },
            limits,
        }
    }

    /// Build the access store described by `room_acl`.
    pub fn room_access(&self) -> anyhow::Result<RoomAccessStore> {
        match self.room_acl.as_deref() {
            None => Ok(RoomAccessStore::Open),
            Some(raw) => Ok(RoomAccessStore::from_table(parse_room_acl(raw)?)),
        }
    }
}
