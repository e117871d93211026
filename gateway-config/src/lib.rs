//! Typed gateway configuration loaded with figment.
//!
//! Sources merge in order: built-in defaults, an optional TOML file, then
//! `GATEWAY_*` environment variables with `__` separating nested keys
//! (`GATEWAY_AUDIT__BATCH_SIZE=50`).

#![warn(missing_docs, clippy::pedantic)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "GATEWAY_";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but are out of range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Dotted key of the offending value.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// License settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// `community`, or any enterprise mode such as `saas` or `enterprise`.
    pub deployment_mode: String,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            deployment_mode: "community".to_owned(),
        }
    }
}

/// Audit queue and storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// Entries per batch.
    pub batch_size: usize,
    /// Seconds between periodic flushes.
    pub flush_interval_secs: u64,
    /// NDJSON journal path; used when no database is configured.
    pub journal_path: Option<PathBuf>,
    /// PostgreSQL URL for `audit_logs`.
    pub database_url: Option<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_secs: 5,
            journal_path: None,
            database_url: None,
        }
    }
}

impl AuditSettings {
    /// Flush interval as a duration.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Metrics collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Rolling window length.
    pub window: usize,
    /// Consecutive failures before health goes down.
    pub failure_threshold: u32,
    /// Trailing seconds for the error rate.
    pub error_window_secs: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window: 1000,
            failure_threshold: 5,
            error_window_secs: 60,
        }
    }
}

/// Policy management settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Tenant-tier policies allowed per tenant on community deployments.
    pub community_limit: usize,
    /// PostgreSQL URL for `policies`; in-memory storage when absent.
    pub database_url: Option<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            community_limit: 30,
            database_url: None,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address.
    pub bind: SocketAddr,
    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,
    /// Requests processed concurrently.
    pub max_concurrent_requests: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            max_concurrent_requests: 256,
        }
    }
}

impl ServerSettings {
    /// Request deadline as a duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// `plain` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "plain".to_owned(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// License settings.
    pub license: LicenseConfig,
    /// Audit settings.
    pub audit: AuditSettings,
    /// Metrics settings.
    pub metrics: MetricsSettings,
    /// Policy settings.
    pub policy: PolicySettings,
    /// Server settings.
    pub server: ServerSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl GatewayConfig {
    /// Figment with defaults, the optional TOML file and environment overrides.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] for unreadable or mistyped sources and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let config: Self = Self::figment(path).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        let checks: [(bool, &'static str, &'static str); 6] = [
            (self.audit.queue_capacity == 0, "audit.queue_capacity", "must be positive"),
            (self.audit.batch_size == 0, "audit.batch_size", "must be positive"),
            (self.audit.flush_interval_secs == 0, "audit.flush_interval_secs", "must be positive"),
            (self.metrics.window == 0, "metrics.window", "must be positive"),
            (self.server.request_timeout_secs == 0, "server.request_timeout_secs", "must be positive"),
            (self.server.max_concurrent_requests == 0, "server.max_concurrent_requests", "must be positive"),
        ];
        match checks.into_iter().find(|(bad, _, _)| *bad) {
            Some((_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_sources() {
        Jail::expect_with(|_jail| {
            let config = GatewayConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.audit.queue_capacity, 10_000);
            assert_eq!(config.audit.flush_interval(), Duration::from_secs(5));
            assert_eq!(config.metrics.failure_threshold, 5);
            assert_eq!(config.policy.community_limit, 30);
            assert_eq!(config.license.deployment_mode, "community");
            Ok(())
        });
    }

    #[test]
    fn file_then_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.toml",
                r#"
                [license]
                deployment_mode = "saas"

                [audit]
                batch_size = 25
                journal_path = "/var/log/gateway/audit.ndjson"
                "#,
            )?;
            jail.set_env("GATEWAY_AUDIT__BATCH_SIZE", "50");
            jail.set_env("GATEWAY_SERVER__BIND", "127.0.0.1:9000");

            let config = GatewayConfig::load(Some(Path::new("gateway.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.license.deployment_mode, "saas");
            assert_eq!(config.audit.batch_size, 50);
            assert_eq!(
                config.audit.journal_path.as_deref(),
                Some(Path::new("/var/log/gateway/audit.ndjson"))
            );
            assert_eq!(config.server.bind.port(), 9000);
            Ok(())
        });
    }

    #[test]
    fn zero_sizes_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("GATEWAY_METRICS__WINDOW", "0");
            let err = GatewayConfig::load(None).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { field: "metrics.window", .. }));
            Ok(())
        });
    }
}
