//! RelayCore configuration
//!
//! TOML-backed configuration for the reliability core. Every value has a
//! programmatic default; loading validates fail-fast and reports problems as
//! `CoreError::Config` before anything starts polling.

use std::collections::HashMap;
use std::path::Path;

use rc_common::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the reliability core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub throttling: ThrottlingConfig,
    pub cluster: ClusterConfig,
    pub confirmation: ConfirmationConfig,
}

/// Poll intervals and time thresholds, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// How long a POSTPONED message waits before it becomes due again
    pub postponed_interval_secs: u64,
    /// How long a PARTLY_FAILED message waits before the next retry
    pub partly_failed_interval_secs: u64,
    /// How long a failed confirmation waits before the next attempt
    pub confirmation_interval_secs: u64,
    /// How often alert definitions are evaluated
    pub alert_interval_secs: u64,
    /// Grace period before a PROCESSING message is considered stuck
    pub repair_grace_secs: u64,
    /// Age at which a guaranteed-order message that never reached the head
    /// of its funnel is force-failed instead of postponed again
    pub postponed_when_failed_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            postponed_interval_secs: 30,
            partly_failed_interval_secs: 60,
            confirmation_interval_secs: 60,
            alert_interval_secs: 300,
            repair_grace_secs: 300,
            postponed_when_failed_secs: 3600,
        }
    }
}

/// Failure-count ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Confirmation attempts before FAILED -> FAILED_END
    pub confirmation_failed_limit: u32,
    /// External call failures before FAILED -> FAILED_END
    pub external_call_failed_limit: u32,
    /// Message retries before PARTLY_FAILED -> FAILED
    pub partly_failed_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            confirmation_failed_limit: 3,
            external_call_failed_limit: 3,
            partly_failed_limit: 3,
        }
    }
}

/// Throttling rules plus the global default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    /// Bypass counting entirely (load tests / emergencies)
    pub disabled: bool,
    pub default_limit: u32,
    pub default_interval_secs: u64,
    #[serde(rename = "rule")]
    pub rules: Vec<ThrottleRule>,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            default_limit: 60,
            default_interval_secs: 60,
            rules: Vec::new(),
        }
    }
}

/// One throttle rule; `*` in either scope field is a wildcard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRule {
    pub source_system: String,
    pub service: String,
    pub limit: u32,
    pub interval_secs: u64,
}

/// Cluster coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    pub redis_url: String,
    pub instance_id: String,
    /// Staggers node boot before the first NOT_CONCURRENT claim
    pub startup_delay_secs: u64,
    /// TTL of a claimed firing lease
    pub firing_ttl_secs: u64,
    /// Per-job execution mode overrides: "concurrent" | "not_concurrent"
    pub job_modes: HashMap<String, String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            startup_delay_secs: 30,
            firing_ttl_secs: 60,
            job_modes: HashMap::new(),
        }
    }
}

/// Confirmation sender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Source-system callback endpoint; None leaves confirmations to the
    /// embedding application's own sender
    pub target_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            target_url: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: CoreConfig = toml::from_str(s)
            .map_err(|e| CoreError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Fail-fast validation of every mandatory parameter.
    pub fn validate(&self) -> Result<()> {
        let p = &self.polling;
        for (name, value) in [
            ("polling.postponed_interval_secs", p.postponed_interval_secs),
            ("polling.partly_failed_interval_secs", p.partly_failed_interval_secs),
            ("polling.confirmation_interval_secs", p.confirmation_interval_secs),
            ("polling.alert_interval_secs", p.alert_interval_secs),
            ("polling.repair_grace_secs", p.repair_grace_secs),
            ("polling.postponed_when_failed_secs", p.postponed_when_failed_secs),
        ] {
            if value == 0 {
                return Err(CoreError::Config(format!("{} must be positive", name)));
            }
        }

        if self.throttling.default_limit == 0 {
            return Err(CoreError::Config(
                "throttling.default_limit must be positive".to_string(),
            ));
        }
        if self.throttling.default_interval_secs == 0 {
            return Err(CoreError::Config(
                "throttling.default_interval_secs must be positive".to_string(),
            ));
        }
        for rule in &self.throttling.rules {
            if rule.source_system.is_empty() || rule.service.is_empty() {
                return Err(CoreError::Config(format!(
                    "throttling rule has an empty scope field: ({:?}, {:?})",
                    rule.source_system, rule.service
                )));
            }
            if rule.limit == 0 || rule.interval_secs == 0 {
                return Err(CoreError::Config(format!(
                    "throttling rule ({}, {}) must have positive limit and interval",
                    rule.source_system, rule.service
                )));
            }
        }

        if self.cluster.enabled && self.cluster.redis_url.is_empty() {
            return Err(CoreError::Config(
                "cluster.redis_url is required when cluster mode is enabled".to_string(),
            ));
        }
        if self.cluster.firing_ttl_secs == 0 {
            return Err(CoreError::Config(
                "cluster.firing_ttl_secs must be positive".to_string(),
            ));
        }
        for (job, mode) in &self.cluster.job_modes {
            if mode != "concurrent" && mode != "not_concurrent" {
                return Err(CoreError::Config(format!(
                    "cluster.job_modes.{}: unknown mode {:?} (use \"concurrent\" or \"not_concurrent\")",
                    job, mode
                )));
            }
        }

        Ok(())
    }
}
