//! Persistence gateway for the reliability core.
//!
//! Typed finders plus conditional single-row updaters returning affected-row
//! counts - the compare-and-swap primitive every cross-node guarantee rests
//! on. Contention is resolved entirely through the store: no multi-row
//! transaction spans workers and no in-process lock is relied upon for
//! cross-node safety.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rc_common::{ExternalCall, ExternalCallState, Message, MsgState};
use anyhow::Result;

pub use memory::MemoryStore;

/// Message table gateway.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persist a new message and assign its surrogate id.
    async fn insert(&self, msg: Message) -> Result<Message>;

    async fn find_by_id(&self, msg_id: i64) -> Result<Option<Message>>;

    /// Oldest POSTPONED message whose postponed interval has elapsed.
    async fn find_postponed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// Oldest PARTLY_FAILED message whose retry interval has elapsed.
    async fn find_partly_failed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// All non-terminal messages sharing a funnel value, ordered by
    /// msg_timestamp. FAILED siblings are included unless `exclude_failed`.
    async fn find_messages_for_funnel(
        &self,
        funnel_value: &str,
        exclude_failed: bool,
    ) -> Result<Vec<Message>>;

    /// Atomically claim a message: `current` -> PROCESSING. Returns false
    /// when another worker already claimed it (zero rows affected).
    async fn try_lock(
        &self,
        msg_id: i64,
        current: MsgState,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Conditional state transition; the CAS primitive for manual operations
    /// (restart, cancel). Returns affected-row count.
    async fn cas_state(
        &self,
        msg_id: i64,
        from: &[MsgState],
        to: MsgState,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn mark_ok(&self, msg_id: i64, now: DateTime<Utc>) -> Result<u64>;

    async fn mark_postponed(&self, msg_id: i64, now: DateTime<Utc>) -> Result<u64>;

    /// Record a non-fatal failure: increments failed_count and parks the
    /// message as PARTLY_FAILED for the next scheduled retry.
    async fn mark_partly_failed(
        &self,
        msg_id: i64,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Record a fatal failure: terminal FAILED with error code + description.
    async fn mark_failed(
        &self,
        msg_id: i64,
        error_code: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Timeout-based repair: messages stuck in PROCESSING or WAITING_FOR_RES
    /// past the grace period are returned to PARTLY_FAILED.
    async fn recover_stuck(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64>;

    /// Count messages in a state, optionally only those updated since a
    /// cutoff. Used by alert count sources.
    async fn count_in_state(
        &self,
        state: MsgState,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64>;
}

/// External-call ledger gateway. At most one row per
/// `(operation_name, entity_id)` - enforced by the store, relied on by the
/// concurrent-insert path.
#[async_trait]
pub trait ExternalCallRepository: Send + Sync {
    async fn find_by_key(
        &self,
        operation_name: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>>;

    async fn find_call_by_id(&self, id: i64) -> Result<Option<ExternalCall>>;

    /// Insert a fresh ledger row. Returns None when the key already exists;
    /// the caller re-reads and walks the decision table instead.
    async fn insert_new(
        &self,
        operation_name: &str,
        entity_id: &str,
        state: ExternalCallState,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalCall>>;

    /// CAS `from` -> PROCESSING, stamping the driving message. Zero rows
    /// affected means another attempt won the row.
    async fn try_acquire(
        &self,
        id: i64,
        from: ExternalCallState,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// CAS PROCESSING -> `to` with the given failed_count. Zero rows
    /// affected means the row was not in PROCESSING anymore.
    async fn try_finish(
        &self,
        id: i64,
        to: ExternalCallState,
        failed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Create-or-reset a pending confirmation row: FAILED with
    /// failed_count 0 (confirmations start "pending", not "in flight").
    async fn upsert_failed(
        &self,
        operation_name: &str,
        entity_id: &str,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExternalCall>;

    /// Oldest due pending confirmation (reserved operation, FAILED state,
    /// retry interval elapsed).
    async fn find_confirmation_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalCall>>;
}

/// Convert a std Duration into chrono for cutoff arithmetic.
pub(crate) fn chrono_interval(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2))
}
