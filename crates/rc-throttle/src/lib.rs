//! Throttling / Rate Limiter
//!
//! Per-scope fixed-window admission control. A window is keyed by
//! `floor(unix_now / interval_secs)`; a fresh window starts counting from
//! zero, there is no leaky-bucket decay. The counter storage is a trait so
//! a clustered deployment can enforce the limit cluster-wide through Redis
//! while a single node counts in process memory - both sides expose the
//! same interface and are interchangeable.

pub mod counter;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rc_common::{CoreError, Result};
use rc_config::ThrottlingConfig;
use tracing::{debug, warn};

pub use counter::{MemoryThrottleCounter, RedisThrottleCounter, ThrottleCounter};

/// Wildcard for either scope field.
pub const ANY: &str = "*";

/// `(source system, service)` pair a throttle rule applies to; either field
/// may be the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleScope {
    pub source_system: String,
    pub service: String,
}

impl ThrottleScope {
    pub fn new(source_system: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            source_system: source_system.into(),
            service: service.into(),
        }
    }

    pub fn any_source(service: impl Into<String>) -> Self {
        Self::new(ANY, service)
    }
}

/// Resolved limit for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleProps {
    pub limit: u32,
    pub interval_secs: u64,
}

/// Rule table with a fixed resolution order: exact match, then service
/// wildcard `(source, *)`, then source wildcard `(*, service)`, then the
/// global default.
#[derive(Debug, Clone)]
pub struct ThrottleRules {
    rules: HashMap<ThrottleScope, ThrottleProps>,
    default: ThrottleProps,
}

impl ThrottleRules {
    pub fn new(default: ThrottleProps) -> Self {
        Self {
            rules: HashMap::new(),
            default,
        }
    }

    pub fn from_config(config: &ThrottlingConfig) -> Self {
        let mut rules = Self::new(ThrottleProps {
            limit: config.default_limit,
            interval_secs: config.default_interval_secs,
        });
        for rule in &config.rules {
            rules.add(
                ThrottleScope::new(rule.source_system.clone(), rule.service.clone()),
                ThrottleProps {
                    limit: rule.limit,
                    interval_secs: rule.interval_secs,
                },
            );
        }
        rules
    }

    pub fn add(&mut self, scope: ThrottleScope, props: ThrottleProps) {
        self.rules.insert(scope, props);
    }

    pub fn resolve(&self, scope: &ThrottleScope) -> ThrottleProps {
        if let Some(props) = self.rules.get(scope) {
            return *props;
        }
        if let Some(props) = self
            .rules
            .get(&ThrottleScope::new(scope.source_system.clone(), ANY))
        {
            return *props;
        }
        if let Some(props) = self.rules.get(&ThrottleScope::new(ANY, scope.service.clone())) {
            return *props;
        }
        self.default
    }
}

/// Synchronous admission gate called inline with message handling.
pub struct ThrottleService {
    rules: ThrottleRules,
    counter: Arc<dyn ThrottleCounter>,
    /// Bypass counting entirely (load tests / emergencies)
    disabled: bool,
}

impl ThrottleService {
    pub fn new(rules: ThrottleRules, counter: Arc<dyn ThrottleCounter>, disabled: bool) -> Self {
        Self {
            rules,
            counter,
            disabled,
        }
    }

    /// Admit or reject one call for the scope.
    pub async fn throttle(&self, scope: &ThrottleScope) -> Result<()> {
        self.throttle_at(scope, Utc::now()).await
    }

    /// Admission check against an explicit clock instant.
    pub async fn throttle_at(&self, scope: &ThrottleScope, now: DateTime<Utc>) -> Result<()> {
        if self.disabled {
            return Ok(());
        }

        let props = self.rules.resolve(scope);
        let window = now.timestamp() / props.interval_secs as i64;
        let key = format!("{}:{}:{}", scope.source_system, scope.service, window);
        let window_end = (window + 1) * props.interval_secs as i64;

        let count = self
            .counter
            .increment(&key, window_end)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if count > props.limit as u64 {
            warn!(
                source_system = %scope.source_system,
                service = %scope.service,
                count,
                limit = props.limit,
                interval_secs = props.interval_secs,
                "Throttling limit exceeded"
            );
            return Err(CoreError::RateLimitExceeded {
                source_system: scope.source_system.clone(),
                service: scope.service.clone(),
            });
        }

        debug!(
            source_system = %scope.source_system,
            service = %scope.service,
            count,
            limit = props.limit,
            "Call admitted"
        );
        Ok(())
    }

    /// Drop counters whose window has passed. Redis counters expire via TTL;
    /// the in-memory counter needs this per-node housekeeping job.
    pub async fn prune(&self) {
        self.counter.prune(Utc::now().timestamp()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rules() -> ThrottleRules {
        let mut rules = ThrottleRules::new(ThrottleProps {
            limit: 100,
            interval_secs: 60,
        });
        rules.add(
            ThrottleScope::new("crm", "sendSms"),
            ThrottleProps {
                limit: 5,
                interval_secs: 10,
            },
        );
        rules.add(
            ThrottleScope::new("crm", ANY),
            ThrottleProps {
                limit: 20,
                interval_secs: 60,
            },
        );
        rules.add(
            ThrottleScope::new(ANY, "sendSms"),
            ThrottleProps {
                limit: 2,
                interval_secs: 10,
            },
        );
        rules
    }

    #[test]
    fn test_resolution_order() {
        let rules = rules();
        // Exact match wins
        assert_eq!(rules.resolve(&ThrottleScope::new("crm", "sendSms")).limit, 5);
        // Service wildcard (source, *) next
        assert_eq!(rules.resolve(&ThrottleScope::new("crm", "other")).limit, 20);
        // Source wildcard (*, service) next
        assert_eq!(rules.resolve(&ThrottleScope::new("erp", "sendSms")).limit, 2);
        // Global default last
        assert_eq!(rules.resolve(&ThrottleScope::new("erp", "other")).limit, 100);
    }

    #[test]
    fn test_rules_from_config() {
        let config = ThrottlingConfig {
            disabled: false,
            default_limit: 7,
            default_interval_secs: 30,
            rules: vec![rc_config::ThrottleRule {
                source_system: "*".to_string(),
                service: "sendSms".to_string(),
                limit: 2,
                interval_secs: 10,
            }],
        };
        let rules = ThrottleRules::from_config(&config);
        assert_eq!(rules.resolve(&ThrottleScope::new("x", "y")).limit, 7);
        assert_eq!(rules.resolve(&ThrottleScope::any_source("sendSms")).limit, 2);
    }

    #[tokio::test]
    async fn test_throttle_boundary_and_window_rollover() {
        // limit=2, interval=10s for (*, sendSms): calls 1 and 2 in the
        // window pass, call 3 is rejected, the next window admits again.
        let service = ThrottleService::new(
            rules(),
            Arc::new(MemoryThrottleCounter::new()),
            false,
        );
        let scope = ThrottleScope::new("erp", "sendSms");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        service.throttle_at(&scope, t0).await.unwrap();
        service.throttle_at(&scope, t0 + chrono::Duration::seconds(3)).await.unwrap();

        let err = service
            .throttle_at(&scope, t0 + chrono::Duration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RateLimitExceeded { .. }));

        // Window rolls over at the 10s boundary
        service
            .throttle_at(&scope, t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scopes_are_counted_independently() {
        let service = ThrottleService::new(
            rules(),
            Arc::new(MemoryThrottleCounter::new()),
            false,
        );
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let erp = ThrottleScope::new("erp", "sendSms");
        let billing = ThrottleScope::new("billing", "sendSms");
        service.throttle_at(&erp, t0).await.unwrap();
        service.throttle_at(&erp, t0).await.unwrap();
        assert!(service.throttle_at(&erp, t0).await.is_err());

        // A different concrete scope has its own counter
        service.throttle_at(&billing, t0).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_flag_bypasses_counting() {
        let service = ThrottleService::new(
            rules(),
            Arc::new(MemoryThrottleCounter::new()),
            true,
        );
        let scope = ThrottleScope::new("erp", "sendSms");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        for _ in 0..10 {
            service.throttle_at(&scope, t0).await.unwrap();
        }
    }
}
