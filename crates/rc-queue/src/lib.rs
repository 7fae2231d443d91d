//! Message Queue & Lock Manager
//!
//! Polls retryable messages (POSTPONED first, then PARTLY_FAILED), claims
//! each candidate with a single conditional update, enforces guaranteed
//! order per funnel value, and dispatches to the downstream pipeline. Zero
//! rows affected on the claim means another worker - possibly on another
//! node - won the message; that is a lock failure, never a processing error.

pub mod operations;
pub mod repair;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rc_common::{
    error_code, AdminNotifier, CoreError, ErrorKind, Message, MsgState, Result, Warning,
    WarningCategory, WarningSeverity,
};
use rc_store::MessageRepository;
use tracing::{debug, error, info, warn};

pub use operations::MessageOperationService;
pub use repair::RepairService;

/// Downstream processing pipeline seam. The routing/transport layer behind
/// this trait is an external collaborator.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<()>;
}

/// Configuration for one message poller.
#[derive(Debug, Clone)]
pub struct MessagePollerConfig {
    /// How long a POSTPONED message waits before becoming due
    pub postponed_interval: Duration,
    /// How long a PARTLY_FAILED message waits before the next retry
    pub partly_failed_interval: Duration,
    /// Age at which a guaranteed-order message that never reached the head
    /// of its funnel is force-failed instead of postponed again
    pub postponed_when_failed: Duration,
    /// Message retries before PARTLY_FAILED becomes terminal FAILED
    pub partly_failed_limit: u32,
    /// Consecutive lock failures that abort a poll cycle
    pub max_lock_failures: u32,
}

impl Default for MessagePollerConfig {
    fn default() -> Self {
        Self {
            postponed_interval: Duration::from_secs(30),
            partly_failed_interval: Duration::from_secs(60),
            postponed_when_failed: Duration::from_secs(3600),
            partly_failed_limit: 3,
            max_lock_failures: 5,
        }
    }
}

/// Poller driving fetch -> lock -> dispatch cycles over the message table.
pub struct MessagePoller {
    repository: Arc<dyn MessageRepository>,
    processor: Arc<dyn MessageProcessor>,
    notifier: Arc<dyn AdminNotifier>,
    config: MessagePollerConfig,
    /// Single-flight guard: only one poll cycle runs at a time per poller
    running: AtomicBool,
}

impl MessagePoller {
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        processor: Arc<dyn MessageProcessor>,
        notifier: Arc<dyn AdminNotifier>,
        config: MessagePollerConfig,
    ) -> Self {
        Self {
            repository,
            processor,
            notifier,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Next candidate for processing: due POSTPONED messages oldest-first,
    /// then due PARTLY_FAILED.
    pub async fn get_next_message(&self) -> Result<Option<Message>> {
        let now = Utc::now();
        if let Some(msg) = self
            .repository
            .find_postponed_due(self.config.postponed_interval, now)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?
        {
            return Ok(Some(msg));
        }
        self.repository
            .find_partly_failed_due(self.config.partly_failed_interval, now)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))
    }

    /// Claim a candidate before any handler touches it.
    pub async fn lock(&self, message: &Message) -> Result<Message> {
        let claimed = self
            .repository
            .try_lock(message.msg_id, message.state, Utc::now())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if !claimed {
            return Err(CoreError::LockFailure(format!(
                "message {} already claimed by another worker",
                message.msg_id
            )));
        }

        let mut locked = message.clone();
        locked.state = MsgState::Processing;
        Ok(locked)
    }

    /// Hand a locked message to the downstream pipeline, enforcing
    /// guaranteed order first.
    pub async fn start_message_processing(&self, message: &Message) -> Result<()> {
        if message.guaranteed_order {
            if let Some(funnel_value) = message.funnel_value.clone() {
                if !self.funnel_check(message, &funnel_value).await? {
                    // Not the funnel head - postponed or expired, not an error.
                    return Ok(());
                }
            }
        }
        self.dispatch(message).await
    }

    /// Returns true when the message is at the head of its funnel and may
    /// proceed.
    async fn funnel_check(&self, message: &Message, funnel_value: &str) -> Result<bool> {
        let siblings = self
            .repository
            .find_messages_for_funnel(funnel_value, message.exclude_failed_state)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        // A single remaining message trivially satisfies the ordering.
        if siblings.len() <= 1 {
            return Ok(true);
        }
        if siblings[0].msg_id == message.msg_id {
            return Ok(true);
        }

        let now = Utc::now();
        let age = now - message.msg_timestamp;
        let threshold = chrono::Duration::from_std(self.config.postponed_when_failed)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2));

        if age >= threshold {
            // A stuck funnel head must not grow the queue without bound.
            warn!(
                msg_id = message.msg_id,
                funnel_value,
                age_seconds = age.num_seconds(),
                "Guaranteed-order message exceeded postpone threshold, force-failing"
            );
            self.repository
                .mark_failed(
                    message.msg_id,
                    error_code::FUNNEL_EXPIRED,
                    &format!(
                        "message waited {}s for the head of funnel {:?} and exceeded the limit",
                        age.num_seconds(),
                        funnel_value
                    ),
                    now,
                )
                .await
                .map_err(|e| CoreError::Store(e.to_string()))?;
            self.notifier
                .notify(Warning::new(
                    WarningCategory::Funnel,
                    WarningSeverity::Error,
                    format!(
                        "message {} force-failed: funnel {:?} head unreachable",
                        message.msg_id, funnel_value
                    ),
                    "MessagePoller".to_string(),
                ))
                .await;
            return Ok(false);
        }

        debug!(
            msg_id = message.msg_id,
            funnel_value,
            head_msg_id = siblings[0].msg_id,
            "Message is not the funnel head, postponing"
        );
        self.repository
            .mark_postponed(message.msg_id, now)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;
        self.notifier
            .notify(Warning::new(
                WarningCategory::Funnel,
                WarningSeverity::Info,
                format!(
                    "message {} postponed behind {} in funnel {:?}",
                    message.msg_id, siblings[0].msg_id, funnel_value
                ),
                "MessagePoller".to_string(),
            ))
            .await;
        Ok(false)
    }

    async fn dispatch(&self, message: &Message) -> Result<()> {
        let now = Utc::now();
        match self.processor.process(message).await {
            Ok(()) => {
                self.repository
                    .mark_ok(message.msg_id, now)
                    .await
                    .map_err(|e| CoreError::Store(e.to_string()))?;
                debug!(msg_id = message.msg_id, "Message processed successfully");
                Ok(())
            }
            Err(e) => self.handle_processing_error(message, e).await,
        }
    }

    /// Route a processing error by its kind tag: lock failures bubble up as
    /// a retry signal for the poll cycle, fatal errors end the message,
    /// everything else is parked for a bounded retry.
    async fn handle_processing_error(&self, message: &Message, e: CoreError) -> Result<()> {
        let now = Utc::now();
        match e.kind() {
            ErrorKind::LockFailure => Err(e),
            ErrorKind::Fatal | ErrorKind::Config => {
                error!(
                    msg_id = message.msg_id,
                    error = %e,
                    "Fatal processing error, message FAILED"
                );
                self.repository
                    .mark_failed(message.msg_id, e.error_code(), &e.to_string(), now)
                    .await
                    .map_err(|e| CoreError::Store(e.to_string()))?;
                Ok(())
            }
            ErrorKind::Retryable => {
                if message.failed_count + 1 > self.config.partly_failed_limit {
                    error!(
                        msg_id = message.msg_id,
                        failed_count = message.failed_count + 1,
                        error = %e,
                        "Retry ceiling exceeded, message FAILED"
                    );
                    self.repository
                        .mark_failed(message.msg_id, e.error_code(), &e.to_string(), now)
                        .await
                        .map_err(|e| CoreError::Store(e.to_string()))?;
                } else {
                    warn!(
                        msg_id = message.msg_id,
                        failed_count = message.failed_count + 1,
                        error = %e,
                        "Processing failed, scheduling retry"
                    );
                    self.repository
                        .mark_partly_failed(message.msg_id, &e.to_string(), now)
                        .await
                        .map_err(|e| CoreError::Store(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// One poll cycle: fetch -> lock -> dispatch until no candidate remains.
    /// Aborts after `max_lock_failures` consecutive lock failures to avoid
    /// spinning against cluster contention; that abort is logged, not fatal.
    pub async fn run(&self) {
        // Try-acquire/run/release; a cycle already in flight wins.
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Poll cycle already running, skipping");
            return;
        }

        let mut lock_failures = 0u32;
        loop {
            let candidate = match self.get_next_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to poll for messages");
                    break;
                }
            };

            let locked = match self.lock(&candidate).await {
                Ok(locked) => locked,
                Err(e) if e.kind() == ErrorKind::LockFailure => {
                    lock_failures += 1;
                    if lock_failures >= self.config.max_lock_failures {
                        info!(
                            lock_failures,
                            "Too many consecutive lock failures, ending poll cycle"
                        );
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(msg_id = candidate.msg_id, error = %e, "Lock attempt failed");
                    break;
                }
            };

            match self.start_message_processing(&locked).await {
                Ok(()) => lock_failures = 0,
                Err(e) if e.kind() == ErrorKind::LockFailure => {
                    lock_failures += 1;
                    if lock_failures >= self.config.max_lock_failures {
                        info!(
                            lock_failures,
                            "Too many consecutive lock failures, ending poll cycle"
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!(msg_id = locked.msg_id, error = %e, "Processing dispatch failed");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use rc_common::LogNotifier;
    use rc_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct MockProcessor {
        processed: AtomicUsize,
        fail_with: Option<fn() -> CoreError>,
    }

    impl MockProcessor {
        fn ok() -> Self {
            Self {
                processed: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(f: fn() -> CoreError) -> Self {
            Self {
                processed: AtomicUsize::new(0),
                fail_with: Some(f),
            }
        }

        fn count(&self) -> usize {
            self.processed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageProcessor for MockProcessor {
        async fn process(&self, _message: &Message) -> Result<()> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    fn poller(
        store: Arc<MemoryStore>,
        processor: Arc<MockProcessor>,
        config: MessagePollerConfig,
    ) -> MessagePoller {
        MessagePoller::new(store, processor, Arc::new(LogNotifier), config)
    }

    fn due_config() -> MessagePollerConfig {
        // Everything inserted in tests is due immediately
        MessagePollerConfig {
            postponed_interval: Duration::from_millis(0),
            partly_failed_interval: Duration::from_millis(0),
            ..Default::default()
        }
    }

    async fn insert(
        store: &MemoryStore,
        correlation: &str,
        state: MsgState,
        msg_timestamp: DateTime<Utc>,
    ) -> Message {
        let mut msg = Message::new(correlation, "crm", "customer", "setCustomer", msg_timestamp, "{}");
        msg.state = state;
        msg.last_update_timestamp = msg_timestamp;
        store.insert(msg).await.unwrap()
    }

    #[tokio::test]
    async fn test_postponed_polled_before_partly_failed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        insert(&store, "pf", MsgState::PartlyFailed, now - ChronoDuration::seconds(300)).await;
        insert(&store, "pp", MsgState::Postponed, now - ChronoDuration::seconds(100)).await;

        let poller = poller(store, Arc::new(MockProcessor::ok()), due_config());
        let next = poller.get_next_message().await.unwrap().unwrap();
        // PARTLY_FAILED is older, but POSTPONED takes priority
        assert_eq!(next.correlation_id, "pp");
    }

    #[tokio::test]
    async fn test_run_drains_queue() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now() - ChronoDuration::seconds(60);
        let a = insert(&store, "a", MsgState::Postponed, now).await;
        let b = insert(&store, "b", MsgState::PartlyFailed, now).await;

        let processor = Arc::new(MockProcessor::ok());
        let poller = poller(store.clone(), processor.clone(), due_config());
        poller.run().await;

        assert_eq!(processor.count(), 2);
        assert_eq!(store.find_by_id(a.msg_id).await.unwrap().unwrap().state, MsgState::Ok);
        assert_eq!(store.find_by_id(b.msg_id).await.unwrap().unwrap().state, MsgState::Ok);
    }

    #[tokio::test]
    async fn test_stale_candidate_is_lock_failure() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now() - ChronoDuration::seconds(60);
        let msg = insert(&store, "a", MsgState::Postponed, now).await;

        let poller = poller(store.clone(), Arc::new(MockProcessor::ok()), due_config());
        let candidate = poller.get_next_message().await.unwrap().unwrap();

        // Another worker claims the row between fetch and lock
        assert!(store.try_lock(msg.msg_id, MsgState::Postponed, Utc::now()).await.unwrap());

        let err = poller.lock(&candidate).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockFailure);
    }

    #[tokio::test]
    async fn test_funnel_head_is_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut head = Message::new("h", "crm", "customer", "setCustomer", now - ChronoDuration::seconds(30), "{}");
        head.state = MsgState::Postponed;
        head = head.with_funnel("f1", true);
        let head = store.insert(head).await.unwrap();

        let mut tail = Message::new("t", "crm", "customer", "setCustomer", now, "{}");
        tail.state = MsgState::Postponed;
        tail = tail.with_funnel("f1", true);
        store.insert(tail).await.unwrap();

        let processor = Arc::new(MockProcessor::ok());
        let poller = poller(store.clone(), processor.clone(), due_config());

        let locked = poller.lock(&store.find_by_id(head.msg_id).await.unwrap().unwrap()).await.unwrap();
        poller.start_message_processing(&locked).await.unwrap();

        assert_eq!(processor.count(), 1);
        assert_eq!(store.find_by_id(head.msg_id).await.unwrap().unwrap().state, MsgState::Ok);
    }

    #[tokio::test]
    async fn test_non_head_is_postponed_not_processed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut head = Message::new("h", "crm", "customer", "setCustomer", now - ChronoDuration::seconds(30), "{}");
        head.state = MsgState::Postponed;
        head = head.with_funnel("f1", true);
        store.insert(head).await.unwrap();

        let mut tail = Message::new("t", "crm", "customer", "setCustomer", now, "{}");
        tail.state = MsgState::Postponed;
        tail = tail.with_funnel("f1", true);
        let tail = store.insert(tail).await.unwrap();

        let processor = Arc::new(MockProcessor::ok());
        let poller = poller(store.clone(), processor.clone(), due_config());

        let locked = poller.lock(&store.find_by_id(tail.msg_id).await.unwrap().unwrap()).await.unwrap();
        poller.start_message_processing(&locked).await.unwrap();

        assert_eq!(processor.count(), 0);
        assert_eq!(
            store.find_by_id(tail.msg_id).await.unwrap().unwrap().state,
            MsgState::Postponed
        );
    }

    #[tokio::test]
    async fn test_single_funnel_message_trivially_ordered() {
        let store = Arc::new(MemoryStore::new());
        let mut only = Message::new("o", "crm", "customer", "setCustomer", Utc::now(), "{}");
        only.state = MsgState::Postponed;
        only = only.with_funnel("f1", true);
        let only = store.insert(only).await.unwrap();

        let processor = Arc::new(MockProcessor::ok());
        let poller = poller(store.clone(), processor.clone(), due_config());

        let locked = poller.lock(&store.find_by_id(only.msg_id).await.unwrap().unwrap()).await.unwrap();
        poller.start_message_processing(&locked).await.unwrap();
        assert_eq!(processor.count(), 1);
    }

    #[tokio::test]
    async fn test_expired_funnel_message_force_failed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut head = Message::new("h", "crm", "customer", "setCustomer", now - ChronoDuration::seconds(7200), "{}");
        head.state = MsgState::PartlyFailed;
        head = head.with_funnel("f1", true);
        store.insert(head).await.unwrap();

        // Old message stuck behind the head, past the 1h threshold
        let mut stale = Message::new("s", "crm", "customer", "setCustomer", now - ChronoDuration::seconds(7000), "{}");
        stale.state = MsgState::Postponed;
        stale = stale.with_funnel("f1", true);
        let stale = store.insert(stale).await.unwrap();

        let processor = Arc::new(MockProcessor::ok());
        let poller = poller(store.clone(), processor.clone(), due_config());

        let locked = poller.lock(&store.find_by_id(stale.msg_id).await.unwrap().unwrap()).await.unwrap();
        poller.start_message_processing(&locked).await.unwrap();

        assert_eq!(processor.count(), 0);
        let failed = store.find_by_id(stale.msg_id).await.unwrap().unwrap();
        assert_eq!(failed.state, MsgState::Failed);
        assert_eq!(failed.failed_error_code.as_deref(), Some(error_code::FUNNEL_EXPIRED));
    }

    #[tokio::test]
    async fn test_fatal_error_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now() - ChronoDuration::seconds(60);
        let msg = insert(&store, "a", MsgState::Postponed, now).await;

        let processor = Arc::new(MockProcessor::failing(|| {
            CoreError::Validation("missing customer id".into())
        }));
        let poller = poller(store.clone(), processor, due_config());
        poller.run().await;

        let failed = store.find_by_id(msg.msg_id).await.unwrap().unwrap();
        assert_eq!(failed.state, MsgState::Failed);
        assert!(failed.failed_description.unwrap().contains("missing customer id"));
    }

    #[tokio::test]
    async fn test_retryable_error_parks_partly_failed() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now() - ChronoDuration::seconds(60);
        let msg = insert(&store, "a", MsgState::Postponed, now).await;

        let processor = Arc::new(MockProcessor::failing(|| {
            CoreError::Integration("connection refused".into())
        }));
        // Positive retry interval: the parked message is not due again
        // within the same cycle
        let config = MessagePollerConfig {
            postponed_interval: Duration::from_millis(0),
            partly_failed_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let poller = poller(store.clone(), processor.clone(), config);

        poller.run().await;
        let parked = store.find_by_id(msg.msg_id).await.unwrap().unwrap();
        assert_eq!(parked.state, MsgState::PartlyFailed);
        assert_eq!(parked.failed_count, 1);
        assert_eq!(processor.count(), 1);

        // Still parked; the retry interval has not elapsed
        poller.run().await;
        let parked = store.find_by_id(msg.msg_id).await.unwrap().unwrap();
        assert_eq!(parked.state, MsgState::PartlyFailed);
        assert_eq!(parked.failed_count, 1);
        assert_eq!(processor.count(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now() - ChronoDuration::seconds(60);
        let msg = insert(&store, "a", MsgState::Postponed, now).await;

        let processor = Arc::new(MockProcessor::failing(|| {
            CoreError::Integration("connection refused".into())
        }));
        let config = MessagePollerConfig {
            partly_failed_limit: 2,
            ..due_config()
        };
        let poller = poller(store.clone(), processor.clone(), config);

        // Zero retry interval: one cycle re-fetches the parked message
        // immediately and drives it over the ceiling
        poller.run().await;

        let failed = store.find_by_id(msg.msg_id).await.unwrap().unwrap();
        assert_eq!(failed.state, MsgState::Failed);
        assert_eq!(failed.failed_count, 3);
        assert_eq!(processor.count(), 3);

        // Terminal: nothing left to poll
        poller.run().await;
        assert_eq!(processor.count(), 3);
    }

    /// Repository that always offers a candidate but never grants the lock,
    /// simulating a cluster peer winning every claim.
    struct ContendedRepository {
        offered: Message,
        lock_attempts: AtomicUsize,
    }

    #[async_trait]
    impl rc_store::MessageRepository for ContendedRepository {
        async fn insert(&self, msg: Message) -> AnyResult<Message> {
            Ok(msg)
        }
        async fn find_by_id(&self, _msg_id: i64) -> AnyResult<Option<Message>> {
            Ok(None)
        }
        async fn find_postponed_due(
            &self,
            _interval: Duration,
            _now: DateTime<Utc>,
        ) -> AnyResult<Option<Message>> {
            Ok(Some(self.offered.clone()))
        }
        async fn find_partly_failed_due(
            &self,
            _interval: Duration,
            _now: DateTime<Utc>,
        ) -> AnyResult<Option<Message>> {
            Ok(None)
        }
        async fn find_messages_for_funnel(
            &self,
            _funnel_value: &str,
            _exclude_failed: bool,
        ) -> AnyResult<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn try_lock(
            &self,
            _msg_id: i64,
            _current: MsgState,
            _now: DateTime<Utc>,
        ) -> AnyResult<bool> {
            self.lock_attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
        async fn cas_state(
            &self,
            _msg_id: i64,
            _from: &[MsgState],
            _to: MsgState,
            _now: DateTime<Utc>,
        ) -> AnyResult<u64> {
            Ok(0)
        }
        async fn mark_ok(&self, _msg_id: i64, _now: DateTime<Utc>) -> AnyResult<u64> {
            Ok(0)
        }
        async fn mark_postponed(&self, _msg_id: i64, _now: DateTime<Utc>) -> AnyResult<u64> {
            Ok(0)
        }
        async fn mark_partly_failed(
            &self,
            _msg_id: i64,
            _description: &str,
            _now: DateTime<Utc>,
        ) -> AnyResult<u64> {
            Ok(0)
        }
        async fn mark_failed(
            &self,
            _msg_id: i64,
            _error_code: &str,
            _description: &str,
            _now: DateTime<Utc>,
        ) -> AnyResult<u64> {
            Ok(0)
        }
        async fn recover_stuck(&self, _grace: Duration, _now: DateTime<Utc>) -> AnyResult<u64> {
            Ok(0)
        }
        async fn count_in_state(
            &self,
            _state: MsgState,
            _since: Option<DateTime<Utc>>,
        ) -> AnyResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_lock_failure_safety_valve_ends_cycle() {
        let mut offered = Message::new("a", "crm", "customer", "setCustomer", Utc::now(), "{}");
        offered.msg_id = 1;
        offered.state = MsgState::Postponed;

        let repository = Arc::new(ContendedRepository {
            offered,
            lock_attempts: AtomicUsize::new(0),
        });
        let processor = Arc::new(MockProcessor::ok());
        let poller = MessagePoller::new(
            repository.clone(),
            processor.clone(),
            Arc::new(LogNotifier),
            due_config(),
        );

        poller.run().await;

        // The valve tripped after exactly max_lock_failures claims
        assert_eq!(repository.lock_attempts.load(Ordering::SeqCst), 5);
        assert_eq!(processor.count(), 0);
    }
}
