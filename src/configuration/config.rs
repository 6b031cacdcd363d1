use std::env;
use std::time::Duration;

use log::warn;

use crate::container_runtime::types::ResourceLimits;

/// Runtime configuration for the broker.
///
/// Every field has a default suitable for local development; the
/// environment loader overrides individual fields from the variables
/// documented on each one.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the HTTP/WebSocket server binds to (`SERVER_HOST`).
    pub host: String,
    /// Port the HTTP/WebSocket server binds to (`SERVER_PORT`).
    pub port: u16,
    /// SQLite database file path (`DATABASE_PATH`).
    pub database_path: String,
    /// Idle TTL applied to detached sessions (`SESSION_IDLE_TTL_SECS`).
    pub idle_ttl: Duration,
    /// Grace window for sessions that are never attached (`READY_GRACE_SECS`).
    pub ready_grace: Duration,
    /// Overall budget for pull + create + start + ready probe
    /// (`SESSION_CREATE_TIMEOUT_SECS`).
    pub create_timeout: Duration,
    /// Retention of terminated rows for audit visibility.
    pub audit_grace: Duration,
    /// Sweeper tick interval.
    pub sweep_interval: Duration,
    /// Maximum non-terminated sessions per user (`MAX_SESSIONS_PER_USER`).
    pub max_sessions_per_user: i64,
    /// Session-creation requests allowed per identifier per minute
    /// (`RATE_LIMIT_PER_MINUTE`).
    pub rate_limit_per_minute: i64,
    /// Loopback port of the anonymizing SOCKS proxy (`ANYONE_SOCKS_PORT`).
    pub socks_port: u16,
    /// Images a session may be created from (`IMAGE_ALLOWLIST`, comma-separated).
    pub image_allowlist: Vec<String>,
    /// Image used when the creation request names none.
    pub default_image: String,
    /// Resource limits applied to every session container.
    pub resource_limits: ResourceLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_path: "hublot.sqlite3".to_string(),
            idle_ttl: Duration::from_secs(600),
            ready_grace: Duration::from_secs(120),
            create_timeout: Duration::from_secs(30),
            audit_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            max_sessions_per_user: 3,
            rate_limit_per_minute: 10,
            socks_port: 9050,
            image_allowlist: vec![
                "ubuntu:22.04".to_string(),
                "ubuntu:20.04".to_string(),
                "alpine:latest".to_string(),
                "debian:latest".to_string(),
                "node:18-alpine".to_string(),
                "python:3.11-slim".to_string(),
                "rust:latest".to_string(),
            ],
            default_image: "ubuntu:22.04".to_string(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment, falling back
    /// to the defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(host) = env::var("SERVER_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("SERVER_PORT") {
            config.port = port;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database_path = path;
        }
        if let Some(secs) = env_parse::<u64>("SESSION_IDLE_TTL_SECS") {
            config.idle_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("READY_GRACE_SECS") {
            config.ready_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SESSION_CREATE_TIMEOUT_SECS") {
            config.create_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse::<i64>("MAX_SESSIONS_PER_USER") {
            config.max_sessions_per_user = max;
        }
        if let Some(limit) = env_parse::<i64>("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute = limit;
        }
        if let Some(port) = env_parse::<u16>("ANYONE_SOCKS_PORT") {
            config.socks_port = port;
        }
        if let Ok(list) = env::var("IMAGE_ALLOWLIST") {
            let images: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if images.is_empty() {
                warn!("IMAGE_ALLOWLIST is set but empty, keeping defaults");
            } else {
                config.image_allowlist = images;
            }
        }

        if !config.image_allowlist.contains(&config.default_image) {
            // An allow-list that excludes the default image would make
            // bodies without `container_image` unserviceable.
            config.default_image = config.image_allowlist[0].clone();
        }

        config
    }

    /// Returns whether `image` may be used for session creation.
    pub fn is_image_allowed(&self, image: &str) -> bool {
        self.image_allowlist.iter().any(|allowed| allowed == image)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring unparseable {}={}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.idle_ttl, Duration::from_secs(600));
        assert_eq!(config.ready_grace, Duration::from_secs(120));
        assert_eq!(config.max_sessions_per_user, 3);
        assert!(config.is_image_allowed("alpine:latest"));
        assert!(!config.is_image_allowed("privileged:latest"));
        assert!(config.image_allowlist.contains(&config.default_image));
    }

    #[test]
    fn allowlist_is_exact_match() {
        let config = Config::default();
        assert!(!config.is_image_allowed("ubuntu"));
        assert!(!config.is_image_allowed("ubuntu:22.04-extra"));
    }
}
