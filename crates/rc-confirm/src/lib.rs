//! Confirmation Retry Engine
//!
//! Reliably notifies the source system that a message reached a final state.
//! A confirmation starts as a pending ledger row (FAILED, failed_count 0)
//! under the reserved `_confirm_` operation; a poller drains due rows,
//! claims each with the ledger CAS and hands it to the sender. Send failures
//! are retried up to a ceiling, then parked terminal FAILED_END for manual
//! attention.

pub mod http_sender;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rc_common::{
    AdminNotifier, CoreError, ExternalCall, ExternalCallState, Message, MsgState, Result,
    Warning, WarningCategory, WarningSeverity, CONFIRMATION_OPERATION,
};
use rc_store::{ExternalCallRepository, MessageRepository};
use tracing::{debug, error, info, warn};

pub use http_sender::{HttpConfirmationSender, HttpSenderConfig};

/// Completion notification delivered back to the source system.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub correlation_id: String,
    pub source_system: String,
    pub service: String,
    /// Final state of the message: OK or FAILED
    #[serde(serialize_with = "state_as_str")]
    pub state: MsgState,
}

// The callback payload carries the same state vocabulary the rest of the
// system uses ("OK"/"FAILED"), not the enum variant names.
fn state_as_str<S: serde::Serializer>(state: &MsgState, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

/// Seam to the notification transport; delivery itself is an external
/// collaborator.
#[async_trait]
pub trait ConfirmationSender: Send + Sync {
    async fn send(&self, confirmation: &Confirmation) -> Result<()>;
}

pub struct ConfirmationService {
    calls: Arc<dyn ExternalCallRepository>,
    messages: Arc<dyn MessageRepository>,
    notifier: Arc<dyn AdminNotifier>,
    /// Failures beyond this count make the confirmation terminal
    failed_limit: u32,
}

impl ConfirmationService {
    pub fn new(
        calls: Arc<dyn ExternalCallRepository>,
        messages: Arc<dyn MessageRepository>,
        notifier: Arc<dyn AdminNotifier>,
        failed_limit: u32,
    ) -> Self {
        Self {
            calls,
            messages,
            notifier,
            failed_limit,
        }
    }

    /// Register a pending confirmation for a message that reached OK/FAILED.
    pub async fn insert_failed_confirmation(&self, message: &Message) -> Result<ExternalCall> {
        debug_assert!(
            message.state.is_terminal(),
            "confirmations are only registered for finished messages"
        );
        let call = self
            .calls
            .upsert_failed(
                CONFIRMATION_OPERATION,
                &message.correlation_id,
                message.msg_id,
                message.msg_timestamp,
                Utc::now(),
            )
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        debug!(
            msg_id = message.msg_id,
            correlation_id = %message.correlation_id,
            "Confirmation registered as pending"
        );
        Ok(call)
    }

    /// Confirmation delivered: PROCESSING -> OK.
    pub async fn confirmation_complete(&self, call: &ExternalCall) -> Result<()> {
        let affected = self
            .calls
            .try_finish(call.id, ExternalCallState::Ok, call.failed_count, Utc::now())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        if affected == 0 {
            return Err(CoreError::Contract(format!(
                "confirmation {} not in PROCESSING at completion",
                call.id
            )));
        }
        info!(correlation_id = %call.entity_id, "Confirmation delivered");
        Ok(())
    }

    /// Confirmation send failed: back to FAILED for a later retry, or
    /// terminal FAILED_END once the ceiling is exceeded.
    pub async fn confirmation_failed(&self, call: &ExternalCall) -> Result<()> {
        let new_count = call.failed_count + 1;
        let to = if new_count > self.failed_limit {
            ExternalCallState::FailedEnd
        } else {
            ExternalCallState::Failed
        };

        let affected = self
            .calls
            .try_finish(call.id, to, new_count, Utc::now())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        if affected == 0 {
            return Err(CoreError::Contract(format!(
                "confirmation {} not in PROCESSING at failure",
                call.id
            )));
        }

        if to == ExternalCallState::FailedEnd {
            error!(
                correlation_id = %call.entity_id,
                failed_count = new_count,
                "Confirmation retries exhausted"
            );
            self.notifier
                .notify(Warning::new(
                    WarningCategory::Confirmation,
                    WarningSeverity::Error,
                    format!(
                        "confirmation for {} gave up after {} attempts ({})",
                        call.entity_id,
                        new_count,
                        rc_common::error_code::CONFIRMATION_EXHAUSTED
                    ),
                    "ConfirmationService".to_string(),
                ))
                .await;
        } else {
            warn!(
                correlation_id = %call.entity_id,
                failed_count = new_count,
                "Confirmation send failed, will retry"
            );
        }
        Ok(())
    }

    /// Deliver one claimed confirmation.
    async fn deliver(&self, call: &ExternalCall, sender: &dyn ConfirmationSender) -> Result<()> {
        let message = self
            .messages
            .find_by_id(call.msg_id)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        let message = match message {
            Some(m) => m,
            None => {
                // The owning message is gone; nothing sensible to confirm.
                warn!(
                    msg_id = call.msg_id,
                    correlation_id = %call.entity_id,
                    "Message behind confirmation no longer exists"
                );
                return self.confirmation_failed(call).await;
            }
        };

        let confirmation = Confirmation {
            correlation_id: message.correlation_id.clone(),
            source_system: message.source_system.clone(),
            service: message.service.clone(),
            state: message.state,
        };

        match sender.send(&confirmation).await {
            Ok(()) => self.confirmation_complete(call).await,
            Err(e) => {
                warn!(correlation_id = %call.entity_id, error = %e, "Confirmation sender failed");
                self.confirmation_failed(call).await
            }
        }
    }
}

/// Configuration for the confirmation poller.
#[derive(Debug, Clone)]
pub struct ConfirmationPollerConfig {
    /// How long a failed confirmation waits before the next attempt
    pub interval: Duration,
    /// Consecutive lock failures that abort a poll cycle
    pub max_lock_failures: u32,
}

impl Default for ConfirmationPollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_lock_failures: 5,
        }
    }
}

/// Drains all currently-due confirmations per cycle, mirroring the message
/// poller's fetch -> lock -> dispatch shape.
pub struct ConfirmationPoller {
    service: Arc<ConfirmationService>,
    calls: Arc<dyn ExternalCallRepository>,
    sender: Arc<dyn ConfirmationSender>,
    config: ConfirmationPollerConfig,
    running: AtomicBool,
}

impl ConfirmationPoller {
    pub fn new(
        service: Arc<ConfirmationService>,
        calls: Arc<dyn ExternalCallRepository>,
        sender: Arc<dyn ConfirmationSender>,
        config: ConfirmationPollerConfig,
    ) -> Self {
        Self {
            service,
            calls,
            sender,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Confirmation cycle already running, skipping");
            return;
        }

        let mut lock_failures = 0u32;
        loop {
            let now = Utc::now();
            let due = match self.calls.find_confirmation_due(self.config.interval, now).await {
                Ok(Some(call)) => call,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to poll for due confirmations");
                    break;
                }
            };

            // Claim the pending row; a peer node may beat us to it.
            let claimed = match self
                .calls
                .try_acquire(due.id, ExternalCallState::Failed, due.msg_id, due.msg_timestamp, now)
                .await
            {
                Ok(n) => n == 1,
                Err(e) => {
                    error!(error = %e, "Failed to claim confirmation");
                    break;
                }
            };

            if !claimed {
                lock_failures += 1;
                if lock_failures >= self.config.max_lock_failures {
                    info!(
                        lock_failures,
                        "Too many consecutive lock failures, ending confirmation cycle"
                    );
                    break;
                }
                continue;
            }
            lock_failures = 0;

            let mut claimed_call = due.clone();
            claimed_call.state = ExternalCallState::Processing;
            if let Err(e) = self.service.deliver(&claimed_call, self.sender.as_ref()).await {
                error!(call_id = due.id, error = %e, "Confirmation delivery bookkeeping failed");
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rc_common::LogNotifier;
    use rc_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct MockSender {
        sent: AtomicUsize,
        fail: bool,
    }

    impl MockSender {
        fn ok() -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ConfirmationSender for MockSender {
        async fn send(&self, _confirmation: &Confirmation) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CoreError::Integration("callback endpoint down".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn finished_message(store: &MemoryStore, correlation: &str, state: MsgState) -> Message {
        let mut msg = Message::new(correlation, "crm", "customer", "op", Utc::now(), "{}");
        msg.state = state;
        store.insert(msg).await.unwrap()
    }

    fn setup(
        store: Arc<MemoryStore>,
        sender: Arc<MockSender>,
        failed_limit: u32,
    ) -> (Arc<ConfirmationService>, ConfirmationPoller) {
        let service = Arc::new(ConfirmationService::new(
            store.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            failed_limit,
        ));
        let poller = ConfirmationPoller::new(
            service.clone(),
            store,
            sender,
            ConfirmationPollerConfig {
                interval: Duration::from_millis(0),
                max_lock_failures: 5,
            },
        );
        (service, poller)
    }

    #[tokio::test]
    async fn test_confirmation_starts_pending() {
        let store = Arc::new(MemoryStore::new());
        let msg = finished_message(&store, "c1", MsgState::Ok).await;
        let (service, _) = setup(store.clone(), Arc::new(MockSender::ok()), 3);

        let call = service.insert_failed_confirmation(&msg).await.unwrap();
        assert_eq!(call.state, ExternalCallState::Failed);
        assert_eq!(call.failed_count, 0);
        assert_eq!(call.operation_name, CONFIRMATION_OPERATION);
        assert_eq!(call.entity_id, "c1");
    }

    #[tokio::test]
    async fn test_poller_delivers_due_confirmations() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(MockSender::ok());
        let (service, poller) = setup(store.clone(), sender.clone(), 3);

        let a = finished_message(&store, "c1", MsgState::Ok).await;
        let b = finished_message(&store, "c2", MsgState::Failed).await;
        let call_a = service.insert_failed_confirmation(&a).await.unwrap();
        let call_b = service.insert_failed_confirmation(&b).await.unwrap();

        poller.run().await;

        assert_eq!(sender.sent.load(Ordering::SeqCst), 2);
        for id in [call_a.id, call_b.id] {
            let call = store.find_call_by_id(id).await.unwrap().unwrap();
            assert_eq!(call.state, ExternalCallState::Ok);
        }
    }

    #[tokio::test]
    async fn test_send_failure_parks_failed_below_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let (service, _) = setup(store.clone(), Arc::new(MockSender::failing()), 2);

        let msg = finished_message(&store, "c1", MsgState::Ok).await;
        let call = service.insert_failed_confirmation(&msg).await.unwrap();

        // Claim the pending row as the poller would, then report the failure
        let claimed = store
            .try_acquire(call.id, ExternalCallState::Failed, call.msg_id, call.msg_timestamp, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed, 1);
        let in_flight = store.find_call_by_id(call.id).await.unwrap().unwrap();
        service.confirmation_failed(&in_flight).await.unwrap();

        // Below the ceiling: back to FAILED for a later retry
        let stored = store.find_call_by_id(call.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExternalCallState::Failed);
        assert_eq!(stored.failed_count, 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_reaches_failed_end() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(MockSender::failing());
        // Limit 2: failures 1 and 2 stay FAILED, failure 3 is FAILED_END.
        // The zero retry interval makes the re-failed row due again within
        // the same cycle, so one run drains it to the ceiling.
        let (service, poller) = setup(store.clone(), sender.clone(), 2);

        let msg = finished_message(&store, "c1", MsgState::Ok).await;
        let call = service.insert_failed_confirmation(&msg).await.unwrap();

        poller.run().await;
        let stored = store.find_call_by_id(call.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ExternalCallState::FailedEnd);
        assert_eq!(stored.failed_count, 3);
        assert_eq!(sender.sent.load(Ordering::SeqCst), 3);

        // Terminal: no further attempt is ever made
        poller.run().await;
        assert_eq!(sender.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fresh_confirmation_not_due_before_interval() {
        let store = Arc::new(MemoryStore::new());
        let msg = finished_message(&store, "c1", MsgState::Ok).await;
        let service = Arc::new(ConfirmationService::new(
            store.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            3,
        ));
        service.insert_failed_confirmation(&msg).await.unwrap();

        // Interval not elapsed yet
        let due = store
            .find_confirmation_due(Duration::from_secs(60), Utc::now() + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert!(due.is_none());

        let due = store
            .find_confirmation_due(Duration::from_secs(60), Utc::now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert!(due.is_some());
    }
}
