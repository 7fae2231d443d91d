//! Operational alerts
//!
//! An alert pairs a plain definition (id, limit, notification text) with a
//! [`CountSource`] that produces the current value of whatever is being
//! watched. The checker evaluates every enabled alert when invoked and
//! raises a warning through the [`AdminNotifier`] whenever the count
//! exceeds the limit. Scheduling is the caller's concern; this crate only
//! evaluates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rc_common::{
    AdminNotifier, CoreError, MsgState, Result, Warning, WarningCategory, WarningSeverity,
};
use rc_store::MessageRepository;
use tracing::{debug, error, info};

/// Placeholder for the measured count in subject/body templates.
pub const ACTUAL_COUNT_PLACEHOLDER: &str = "$actualCount";
/// Placeholder for the configured limit in subject/body templates.
pub const LIMIT_PLACEHOLDER: &str = "$limit";

/// Plain description of one alert. Carries no behavior; the measurement
/// lives in the [`CountSource`] registered next to it.
#[derive(Debug, Clone)]
pub struct AlertDefinition {
    pub id: String,
    pub enabled: bool,
    /// Counts strictly above this limit raise the alert
    pub limit: u64,
    /// Optional notification subject; supports `$actualCount` and `$limit`
    pub subject: Option<String>,
    /// Optional notification body; supports `$actualCount` and `$limit`
    pub body: Option<String>,
}

impl AlertDefinition {
    pub fn new(id: impl Into<String>, limit: u64) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            limit,
            subject: None,
            body: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    fn render(&self, template: &str, count: u64) -> String {
        template
            .replace(ACTUAL_COUNT_PLACEHOLDER, &count.to_string())
            .replace(LIMIT_PLACEHOLDER, &self.limit.to_string())
    }

    /// Notification text for a breached alert.
    pub fn notification_text(&self, count: u64) -> String {
        match (&self.subject, &self.body) {
            (_, Some(body)) => self.render(body, count),
            (Some(subject), None) => self.render(subject, count),
            (None, None) => format!(
                "Alert {}: count {} exceeded limit {}",
                self.id, count, self.limit
            ),
        }
    }
}

/// Produces the current value an alert definition is compared against.
#[async_trait]
pub trait CountSource: Send + Sync {
    async fn current_count(&self) -> Result<u64>;
}

/// Counts messages that entered a state within a trailing window.
pub struct StateCountSource {
    messages: Arc<dyn MessageRepository>,
    state: MsgState,
    lookback: Duration,
}

impl StateCountSource {
    pub fn new(messages: Arc<dyn MessageRepository>, state: MsgState, lookback: Duration) -> Self {
        Self {
            messages,
            state,
            lookback,
        }
    }
}

#[async_trait]
impl CountSource for StateCountSource {
    async fn current_count(&self) -> Result<u64> {
        self.messages
            .count_in_state(self.state, Some(Utc::now() - self.lookback))
            .await
            .map_err(|e| CoreError::Store(e.to_string()))
    }
}

struct RegisteredAlert {
    definition: AlertDefinition,
    source: Arc<dyn CountSource>,
}

/// Evaluates all registered alerts on demand.
pub struct AlertChecker {
    alerts: Vec<RegisteredAlert>,
    notifier: Arc<dyn AdminNotifier>,
}

impl AlertChecker {
    pub fn new(notifier: Arc<dyn AdminNotifier>) -> Self {
        Self {
            alerts: Vec::new(),
            notifier,
        }
    }

    pub fn add(&mut self, definition: AlertDefinition, source: Arc<dyn CountSource>) {
        self.alerts.push(RegisteredAlert { definition, source });
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Evaluate every enabled alert once. A failing count source is logged
    /// and skipped so one broken alert cannot silence the rest.
    pub async fn check_all(&self) -> Result<()> {
        for alert in &self.alerts {
            let def = &alert.definition;
            if !def.enabled {
                debug!(alert = %def.id, "Alert disabled, skipping");
                continue;
            }

            let count = match alert.source.current_count().await {
                Ok(count) => count,
                Err(e) => {
                    error!(alert = %def.id, error = %e, "Alert count source failed");
                    continue;
                }
            };

            if count > def.limit {
                info!(alert = %def.id, count, limit = def.limit, "Alert limit exceeded");
                self.notifier
                    .notify(Warning::new(
                        WarningCategory::Alert,
                        WarningSeverity::Warn,
                        def.notification_text(count),
                        format!("alert:{}", def.id),
                    ))
                    .await;
            } else {
                debug!(alert = %def.id, count, limit = def.limit, "Alert within limit");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCount(u64);

    #[async_trait]
    impl CountSource for FixedCount {
        async fn current_count(&self) -> Result<u64> {
            Ok(self.0)
        }
    }

    struct FailingCount;

    #[async_trait]
    impl CountSource for FailingCount {
        async fn current_count(&self) -> Result<u64> {
            Err(rc_common::CoreError::Store("count query failed".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        warnings: parking_lot::Mutex<Vec<Warning>>,
    }

    #[async_trait]
    impl AdminNotifier for RecordingNotifier {
        async fn notify(&self, warning: Warning) {
            self.warnings.lock().push(warning);
        }
    }

    #[tokio::test]
    async fn test_breached_alert_notifies() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut checker = AlertChecker::new(notifier.clone());
        checker.add(
            AlertDefinition::new("failed-messages", 5),
            Arc::new(FixedCount(8)),
        );

        checker.check_all().await.unwrap();

        let warnings = notifier.warnings.lock();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].category, WarningCategory::Alert);
        assert!(warnings[0].message.contains("failed-messages"));
    }

    #[tokio::test]
    async fn test_count_at_limit_does_not_fire() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut checker = AlertChecker::new(notifier.clone());
        checker.add(AlertDefinition::new("waiting", 5), Arc::new(FixedCount(5)));

        checker.check_all().await.unwrap();
        assert!(notifier.warnings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_alert_never_evaluated() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut checker = AlertChecker::new(notifier.clone());
        checker.add(
            AlertDefinition::new("noisy", 0).disabled(),
            Arc::new(FixedCount(100)),
        );

        checker.check_all().await.unwrap();
        assert!(notifier.warnings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_other_alerts() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut checker = AlertChecker::new(notifier.clone());
        checker.add(AlertDefinition::new("broken", 1), Arc::new(FailingCount));
        checker.add(AlertDefinition::new("healthy", 1), Arc::new(FixedCount(3)));

        checker.check_all().await.unwrap();

        let warnings = notifier.warnings.lock();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("healthy"));
    }

    #[test]
    fn test_template_placeholders() {
        let def = AlertDefinition::new("queue-depth", 10)
            .with_body("Depth $actualCount is over $limit");
        assert_eq!(
            def.notification_text(42),
            "Depth 42 is over 10"
        );
    }

    #[test]
    fn test_default_notification_text() {
        let def = AlertDefinition::new("queue-depth", 10);
        assert_eq!(
            def.notification_text(42),
            "Alert queue-depth: count 42 exceeded limit 10"
        );
    }
}
