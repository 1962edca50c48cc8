//! Hub configuration.
//!
//! Values come from, in increasing precedence: built-in defaults, a TOML file, `CLOUDHUB_*`
//! environment variables, and finally command-line flags applied by the binary. The result is
//! validated once and treated as immutable afterwards.
//!
//! ```toml
//! listen = "0.0.0.0:10000"
//! keepalive_interval_secs = 30
//! node_limit = 1000
//!
//! [tls]
//! ca = "/etc/cloudhub/ca.crt"
//! cert = "/etc/cloudhub/server.crt"
//! key = "/etc/cloudhub/server.key"
//!
//! [auth]
//! enabled = true
//! modes = ["node"]
//! ```

use crate::auth::AuthMode;
use crate::backoff::Backoff;
use crate::pool::PoolSettings;
use crate::session::SessionSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_LISTEN: &str = "CLOUDHUB_LISTEN";
pub const ENV_NODE_LIMIT: &str = "CLOUDHUB_NODE_LIMIT";
pub const ENV_KEEPALIVE_INTERVAL: &str = "CLOUDHUB_KEEPALIVE_INTERVAL";
pub const ENV_AUTH_DEBUG: &str = "CLOUDHUB_AUTH_DEBUG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} in {name}")]
    Env { name: &'static str, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { field, reason: reason.into() }
    }
}

/// PEM files of the server identity and the CA that signs node certificates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log refusals and admit anyway.
    #[serde(default)]
    pub debug: bool,
    /// Authorizers in chain order.
    #[serde(default = "default_modes")]
    pub modes: Vec<AuthMode>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { enabled: true, debug: false, modes: default_modes() }
    }
}

/// Ack retry budget and queue pacing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryConfig {
    #[serde(default = "default_ack_retry_interval_secs")]
    pub ack_retry_interval_secs: u64,
    #[serde(default = "default_ack_max_retries")]
    pub ack_max_retries: usize,
    #[serde(default = "default_queue_base_delay_ms")]
    pub queue_base_delay_ms: u64,
    #[serde(default = "default_queue_max_delay_secs")]
    pub queue_max_delay_secs: u64,
    #[serde(default = "default_queue_qps")]
    pub queue_qps: f64,
    #[serde(default = "default_queue_burst")]
    pub queue_burst: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_retry_interval_secs: default_ack_retry_interval_secs(),
            ack_max_retries: default_ack_max_retries(),
            queue_base_delay_ms: default_queue_base_delay_ms(),
            queue_max_delay_secs: default_queue_max_delay_secs(),
            queue_qps: default_queue_qps(),
            queue_burst: default_queue_burst(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { reconcile_interval_secs: default_reconcile_interval_secs() }
    }
}

/// Process-wide hub settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_node_limit")]
    pub node_limit: usize,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_true() -> bool {
    true
}
fn default_modes() -> Vec<AuthMode> {
    vec![AuthMode::Node]
}
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 10000))
}
fn default_keepalive_interval_secs() -> u64 {
    30
}
fn default_node_limit() -> usize {
    1000
}
fn default_write_timeout_secs() -> u64 {
    30
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_ack_retry_interval_secs() -> u64 {
    5
}
fn default_ack_max_retries() -> usize {
    4
}
fn default_queue_base_delay_ms() -> u64 {
    5
}
fn default_queue_max_delay_secs() -> u64 {
    1000
}
fn default_queue_qps() -> f64 {
    10.0
}
fn default_queue_burst() -> usize {
    100
}
fn default_reconcile_interval_secs() -> u64 {
    5
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            node_limit: default_node_limit(),
            write_timeout_secs: default_write_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            tls: None,
            auth: AuthConfig::default(),
            delivery: DeliveryConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&s)
    }

    /// Defaults or `path`, then the process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CLOUDHUB_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_LISTEN) {
            self.listen = parse_env(ENV_LISTEN, v)?;
        }
        if let Some(v) = lookup(ENV_NODE_LIMIT) {
            self.node_limit = parse_env(ENV_NODE_LIMIT, v)?;
        }
        if let Some(v) = lookup(ENV_KEEPALIVE_INTERVAL) {
            self.keepalive_interval_secs = parse_env(ENV_KEEPALIVE_INTERVAL, v)?;
        }
        if let Some(v) = lookup(ENV_AUTH_DEBUG) {
            self.auth.debug = parse_env(ENV_AUTH_DEBUG, v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_secs == 0 {
            return Err(ConfigError::invalid("keepalive_interval_secs", "must be positive"));
        }
        if self.node_limit == 0 {
            return Err(ConfigError::invalid("node_limit", "must be positive"));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::invalid("write_timeout_secs", "must be positive"));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::invalid("handshake_timeout_secs", "must be positive"));
        }
        if self.auth.modes.is_empty() {
            return Err(ConfigError::invalid("auth.modes", "at least one mode is required"));
        }
        if self.delivery.ack_retry_interval_secs == 0 {
            return Err(ConfigError::invalid("delivery.ack_retry_interval_secs", "must be positive"));
        }
        if self.delivery.queue_qps.is_nan() || self.delivery.queue_qps <= 0.0 {
            return Err(ConfigError::invalid("delivery.queue_qps", "must be positive"));
        }
        if self.delivery.queue_burst == 0 {
            return Err(ConfigError::invalid("delivery.queue_burst", "must be positive"));
        }
        if self.sync.reconcile_interval_secs == 0 {
            return Err(ConfigError::invalid("sync.reconcile_interval_secs", "must be positive"));
        }
        self.queue_backoff()?;
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.sync.reconcile_interval_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            keepalive_interval: self.keepalive_interval(),
            ack_retry_interval: Duration::from_secs(self.delivery.ack_retry_interval_secs),
            ack_max_retries: self.delivery.ack_max_retries,
            write_timeout: Duration::from_secs(self.write_timeout_secs),
        }
    }

    pub fn pool_settings(&self) -> Result<PoolSettings, ConfigError> {
        Ok(PoolSettings {
            backoff: self.queue_backoff()?,
            qps: self.delivery.queue_qps,
            burst: self.delivery.queue_burst,
        })
    }

    fn queue_backoff(&self) -> Result<Backoff, ConfigError> {
        Backoff::exponential(Duration::from_millis(self.delivery.queue_base_delay_ms))
            .with_max(Duration::from_secs(self.delivery.queue_max_delay_secs))
            .map_err(|e| ConfigError::invalid("delivery.queue_max_delay_secs", e.to_string()))
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
        config.validate().unwrap();
        let session = config.session_settings();
        assert_eq!(session, SessionSettings::default());
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
    }

    #[test]
    fn parses_sections() {
        let config = HubConfig::from_toml_str(
            r#"
            listen = "127.0.0.1:9000"
            keepalive_interval_secs = 15
            node_limit = 2

            [tls]
            ca = "/ca.pem"
            cert = "/cert.pem"
            key = "/key.pem"

            [auth]
            debug = true
            modes = ["always_allow", "node"]

            [delivery]
            ack_max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.node_limit, 2);
        assert_eq!(config.tls.as_ref().unwrap().ca, PathBuf::from("/ca.pem"));
        assert!(config.auth.enabled && config.auth.debug);
        assert_eq!(config.auth.modes, vec![AuthMode::AlwaysAllow, AuthMode::Node]);
        assert_eq!(config.session_settings().ack_max_retries, 2);
        assert_eq!(config.session_settings().keepalive_interval, Duration::from_secs(15));
    }

    #[test]
    fn rejects_unknown_fields_and_modes() {
        assert!(matches!(HubConfig::from_toml_str("bogus = 1"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            HubConfig::from_toml_str("[auth]\nmodes = [\"rbac\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation() {
        let mut config = HubConfig { keepalive_interval_secs: 0, ..HubConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "keepalive_interval_secs", .. })));
        config.keepalive_interval_secs = 30;
        config.node_limit = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "node_limit", .. })));
        config.node_limit = 1;
        config.auth.modes.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "auth.modes", .. })));
        config.auth.modes = default_modes();
        config.delivery.queue_max_delay_secs = 0;
        assert!(config.validate().is_err());
        assert!(config.pool_settings().is_err());
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_LISTEN, "127.0.0.1:1234"),
            (ENV_NODE_LIMIT, "7"),
            (ENV_KEEPALIVE_INTERVAL, "9"),
            (ENV_AUTH_DEBUG, "true"),
        ]);
        let mut config = HubConfig::default();
        config.apply_env_with(|name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.listen.port(), 1234);
        assert_eq!(config.node_limit, 7);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(9));
        assert!(config.auth.debug);

        let err = config
            .apply_env_with(|name| (name == ENV_NODE_LIMIT).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: ENV_NODE_LIMIT, .. }));
    }
}
