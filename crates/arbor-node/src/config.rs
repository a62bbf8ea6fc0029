//! Arbor node configuration.
//!
//! Configuration is loaded from environment variables. The shared network
//! secret is redacted in Debug output.

use arbor_protocol::{PeerInfo, DEFAULT_MAX_FRAME_LENGTH};
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default listen address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3780";

/// Default advertised hostname other servers connect to.
pub const DEFAULT_ADVERTISED_HOSTNAME: &str = "localhost";

/// Default advertised port.
pub const DEFAULT_ADVERTISED_PORT: u16 = 3780;

/// Default coordinator tick interval in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default gossip period in ticks (announce every Nth tick).
pub const DEFAULT_GOSSIP_PERIOD_TICKS: u64 = 5;

/// Default number of ticks before a pending registration whose lock replies
/// never complete is failed rather than left hanging.
pub const DEFAULT_REGISTRATION_TIMEOUT_TICKS: u64 = 20;

/// Default node id prefix for generated ids.
pub const DEFAULT_NODE_ID_PREFIX: &str = "node";

/// Arbor node configuration.
///
/// Loaded from environment variables with sensible defaults; the network
/// secret is required. `from_vars` exists so tests can build configs without
/// touching the process environment.
#[derive(Clone)]
pub struct Config {
    /// TCP listen address (default: "0.0.0.0:3780").
    pub bind_address: String,

    /// Hostname other servers are told to reach this node at.
    pub advertised_hostname: String,

    /// Port other servers are told to reach this node at.
    pub advertised_port: u16,

    /// Hostname of an existing tree member to join, if any.
    pub remote_hostname: Option<String>,

    /// Port of the existing tree member.
    pub remote_port: Option<u16>,

    /// Shared network secret every server must present in AUTHENTICATE.
    /// Protected by `SecretString` to prevent accidental logging.
    pub network_secret: SecretString,

    /// Unique identifier for this node.
    pub node_id: String,

    /// Coordinator tick interval in milliseconds.
    pub tick_interval_ms: u64,

    /// Load gossip is broadcast every this many ticks.
    pub gossip_period_ticks: u64,

    /// Pending registrations are failed after this many ticks without a
    /// complete set of lock replies.
    pub registration_timeout_ticks: u64,

    /// Maximum accepted wire frame length in bytes.
    pub max_frame_length: usize,
}

/// Custom Debug implementation that redacts the network secret.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("advertised_hostname", &self.advertised_hostname)
            .field("advertised_port", &self.advertised_port)
            .field("remote_hostname", &self.remote_hostname)
            .field("remote_port", &self.remote_port)
            .field("network_secret", &"[REDACTED]")
            .field("node_id", &self.node_id)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .field("gossip_period_ticks", &self.gossip_period_ticks)
            .field(
                "registration_timeout_ticks",
                &self.registration_timeout_ticks,
            )
            .field("max_frame_length", &self.max_frame_length)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let network_secret = SecretString::from(
            vars.get("ARBOR_NETWORK_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("ARBOR_NETWORK_SECRET".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("ARBOR_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let advertised_hostname = vars
            .get("ARBOR_ADVERTISED_HOSTNAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADVERTISED_HOSTNAME.to_string());

        let advertised_port = match vars.get("ARBOR_ADVERTISED_PORT") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("ARBOR_ADVERTISED_PORT: {raw}"))
            })?,
            None => DEFAULT_ADVERTISED_PORT,
        };

        let remote_hostname = vars.get("ARBOR_REMOTE_HOSTNAME").cloned();
        let remote_port = match vars.get("ARBOR_REMOTE_PORT") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("ARBOR_REMOTE_PORT: {raw}"))
            })?),
            None => None,
        };
        if remote_hostname.is_some() != remote_port.is_some() {
            return Err(ConfigError::InvalidValue(
                "ARBOR_REMOTE_HOSTNAME and ARBOR_REMOTE_PORT must be set together".to_string(),
            ));
        }

        let tick_interval_ms = vars
            .get("ARBOR_TICK_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TICK_INTERVAL_MS);

        let gossip_period_ticks = vars
            .get("ARBOR_GOSSIP_PERIOD_TICKS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GOSSIP_PERIOD_TICKS);

        let registration_timeout_ticks = vars
            .get("ARBOR_REGISTRATION_TIMEOUT_TICKS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REGISTRATION_TIMEOUT_TICKS);

        let max_frame_length = vars
            .get("ARBOR_MAX_FRAME_LENGTH")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_LENGTH);

        // Generate a node id when none is pinned
        let node_id = vars.get("ARBOR_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            advertised_hostname,
            advertised_port,
            remote_hostname,
            remote_port,
            network_secret,
            node_id,
            tick_interval_ms,
            gossip_period_ticks,
            registration_timeout_ticks,
            max_frame_length,
        })
    }

    /// This node's identity as carried on the wire.
    #[must_use]
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.node_id.clone(),
            hostname: self.advertised_hostname.clone(),
            port: self.advertised_port,
        }
    }

    /// Coordinator tick interval.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Delay before acknowledging an anonymous login, so the replicating
    /// LOCK_REQUEST has time to propagate: one and a half ticks.
    #[must_use]
    pub const fn anon_login_delay(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms + self.tick_interval_ms / 2)
    }

    /// Delay before completing a load-based redirect.
    #[must_use]
    pub const fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "ARBOR_NETWORK_SECRET".to_string(),
            "a-shared-secret".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.network_secret.expose_secret(), "a-shared-secret");
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.advertised_hostname, DEFAULT_ADVERTISED_HOSTNAME);
        assert_eq!(config.advertised_port, DEFAULT_ADVERTISED_PORT);
        assert!(config.remote_hostname.is_none());
        assert!(config.remote_port.is_none());
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.gossip_period_ticks, DEFAULT_GOSSIP_PERIOD_TICKS);
        assert_eq!(
            config.registration_timeout_ticks,
            DEFAULT_REGISTRATION_TIMEOUT_TICKS
        );
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        // Node id should be auto-generated
        assert!(config.node_id.starts_with("node-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("ARBOR_BIND_ADDRESS".to_string(), "127.0.0.1:4000".to_string());
        vars.insert("ARBOR_ADVERTISED_HOSTNAME".to_string(), "relay1".to_string());
        vars.insert("ARBOR_ADVERTISED_PORT".to_string(), "4000".to_string());
        vars.insert("ARBOR_REMOTE_HOSTNAME".to_string(), "relay0".to_string());
        vars.insert("ARBOR_REMOTE_PORT".to_string(), "3780".to_string());
        vars.insert("ARBOR_NODE_ID".to_string(), "node-custom-001".to_string());
        vars.insert("ARBOR_TICK_INTERVAL_MS".to_string(), "200".to_string());
        vars.insert("ARBOR_GOSSIP_PERIOD_TICKS".to_string(), "3".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.advertised_hostname, "relay1");
        assert_eq!(config.advertised_port, 4000);
        assert_eq!(config.remote_hostname.as_deref(), Some("relay0"));
        assert_eq!(config.remote_port, Some(3780));
        assert_eq!(config.node_id, "node-custom-001");
        assert_eq!(config.tick_interval_ms, 200);
        assert_eq!(config.gossip_period_ticks, 3);
    }

    #[test]
    fn test_from_vars_missing_network_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "ARBOR_NETWORK_SECRET")
        );
    }

    #[test]
    fn test_remote_requires_both_host_and_port() {
        let mut vars = base_vars();
        vars.insert("ARBOR_REMOTE_HOSTNAME".to_string(), "relay0".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut vars = base_vars();
        vars.insert("ARBOR_ADVERTISED_PORT".to_string(), "not-a-port".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_debug_redacts_network_secret() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("a-shared-secret"));
    }

    #[test]
    fn test_anon_login_delay_is_one_and_a_half_ticks() {
        let mut vars = base_vars();
        vars.insert("ARBOR_TICK_INTERVAL_MS".to_string(), "100".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.anon_login_delay(), Duration::from_millis(150));
    }
}
