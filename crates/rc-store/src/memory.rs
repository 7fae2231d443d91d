//! In-memory store implementation.
//!
//! Backs tests and single-node deployments. The same conditional-update
//! contract as the SQL implementation: every mutation is a single-row CAS
//! under one lock, so concurrent callers observe the same
//! zero-rows-affected signal they would get from the database.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rc_common::{ExternalCall, ExternalCallState, Message, MsgState};
use anyhow::Result;

use crate::{chrono_interval, ExternalCallRepository, MessageRepository};

#[derive(Default)]
struct Inner {
    messages: HashMap<i64, Message>,
    next_msg_id: i64,
    calls: HashMap<i64, ExternalCall>,
    call_keys: HashMap<(String, String), i64>,
    next_call_id: i64,
}

/// Shared in-memory message table + external-call ledger.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn funnel_states(exclude_failed: bool) -> Vec<MsgState> {
        let mut states = vec![
            MsgState::Processing,
            MsgState::Postponed,
            MsgState::PartlyFailed,
            MsgState::WaitingForRes,
        ];
        if !exclude_failed {
            states.push(MsgState::Failed);
        }
        states
    }

    fn find_due(
        inner: &Inner,
        state: MsgState,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let cutoff = now - chrono_interval(interval);
        inner
            .messages
            .values()
            .filter(|m| m.state == state && m.last_update_timestamp <= cutoff)
            .min_by_key(|m| m.msg_timestamp)
            .cloned()
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert(&self, mut msg: Message) -> Result<Message> {
        let mut inner = self.inner.lock();
        inner.next_msg_id += 1;
        msg.msg_id = inner.next_msg_id;
        inner.messages.insert(msg.msg_id, msg.clone());
        Ok(msg)
    }

    async fn find_by_id(&self, msg_id: i64) -> Result<Option<Message>> {
        Ok(self.inner.lock().messages.get(&msg_id).cloned())
    }

    async fn find_postponed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock();
        Ok(Self::find_due(&inner, MsgState::Postponed, interval, now))
    }

    async fn find_partly_failed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock();
        Ok(Self::find_due(&inner, MsgState::PartlyFailed, interval, now))
    }

    async fn find_messages_for_funnel(
        &self,
        funnel_value: &str,
        exclude_failed: bool,
    ) -> Result<Vec<Message>> {
        let states = Self::funnel_states(exclude_failed);
        let inner = self.inner.lock();
        let mut siblings: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| {
                m.funnel_value.as_deref() == Some(funnel_value) && states.contains(&m.state)
            })
            .cloned()
            .collect();
        siblings.sort_by_key(|m| m.msg_timestamp);
        Ok(siblings)
    }

    async fn try_lock(
        &self,
        msg_id: i64,
        current: MsgState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.messages.get_mut(&msg_id) {
            Some(msg) if msg.state == current => {
                msg.state = MsgState::Processing;
                msg.start_process_timestamp = Some(now);
                msg.last_update_timestamp = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_state(
        &self,
        msg_id: i64,
        from: &[MsgState],
        to: MsgState,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.messages.get_mut(&msg_id) {
            Some(msg) if from.contains(&msg.state) => {
                msg.state = to;
                msg.last_update_timestamp = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_ok(&self, msg_id: i64, now: DateTime<Utc>) -> Result<u64> {
        self.cas_state(msg_id, &[MsgState::Processing], MsgState::Ok, now)
            .await
    }

    async fn mark_postponed(&self, msg_id: i64, now: DateTime<Utc>) -> Result<u64> {
        self.cas_state(msg_id, &[MsgState::Processing], MsgState::Postponed, now)
            .await
    }

    async fn mark_partly_failed(
        &self,
        msg_id: i64,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.messages.get_mut(&msg_id) {
            Some(msg) if msg.state == MsgState::Processing => {
                msg.state = MsgState::PartlyFailed;
                msg.failed_count += 1;
                msg.failed_description = Some(description.to_string());
                msg.last_update_timestamp = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_failed(
        &self,
        msg_id: i64,
        error_code: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.messages.get_mut(&msg_id) {
            Some(msg) if !msg.state.is_terminal() => {
                msg.state = MsgState::Failed;
                msg.failed_count += 1;
                msg.failed_error_code = Some(error_code.to_string());
                msg.failed_description = Some(description.to_string());
                msg.last_update_timestamp = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn recover_stuck(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - chrono_interval(grace);
        let mut inner = self.inner.lock();
        let mut recovered = 0;
        for msg in inner.messages.values_mut() {
            let stuck = matches!(msg.state, MsgState::Processing | MsgState::WaitingForRes)
                && msg.last_update_timestamp <= cutoff;
            if stuck {
                msg.state = MsgState::PartlyFailed;
                msg.failed_count += 1;
                msg.last_update_timestamp = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn count_in_state(
        &self,
        state: MsgState,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.state == state)
            .filter(|m| since.map_or(true, |cutoff| m.last_update_timestamp >= cutoff))
            .count() as u64)
    }
}

#[async_trait]
impl ExternalCallRepository for MemoryStore {
    async fn find_by_key(
        &self,
        operation_name: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>> {
        let inner = self.inner.lock();
        let key = (operation_name.to_string(), entity_id.to_string());
        Ok(inner
            .call_keys
            .get(&key)
            .and_then(|id| inner.calls.get(id))
            .cloned())
    }

    async fn find_call_by_id(&self, id: i64) -> Result<Option<ExternalCall>> {
        Ok(self.inner.lock().calls.get(&id).cloned())
    }

    async fn insert_new(
        &self,
        operation_name: &str,
        entity_id: &str,
        state: ExternalCallState,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalCall>> {
        let mut inner = self.inner.lock();
        let key = (operation_name.to_string(), entity_id.to_string());
        if inner.call_keys.contains_key(&key) {
            return Ok(None);
        }
        inner.next_call_id += 1;
        let call = ExternalCall {
            id: inner.next_call_id,
            operation_name: operation_name.to_string(),
            entity_id: entity_id.to_string(),
            state,
            msg_id,
            msg_timestamp,
            failed_count: 0,
            last_update_timestamp: now,
        };
        inner.call_keys.insert(key, call.id);
        inner.calls.insert(call.id, call.clone());
        Ok(Some(call))
    }

    async fn try_acquire(
        &self,
        id: i64,
        from: ExternalCallState,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.calls.get_mut(&id) {
            Some(call) if call.state == from => {
                call.state = ExternalCallState::Processing;
                call.msg_id = msg_id;
                call.msg_timestamp = msg_timestamp;
                call.last_update_timestamp = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn try_finish(
        &self,
        id: i64,
        to: ExternalCallState,
        failed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.calls.get_mut(&id) {
            Some(call) if call.state == ExternalCallState::Processing => {
                call.state = to;
                call.failed_count = failed_count;
                call.last_update_timestamp = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn upsert_failed(
        &self,
        operation_name: &str,
        entity_id: &str,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExternalCall> {
        let mut inner = self.inner.lock();
        let key = (operation_name.to_string(), entity_id.to_string());
        if let Some(id) = inner.call_keys.get(&key).copied() {
            let call = inner
                .calls
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("dangling ledger key for call {}", id))?;
            call.state = ExternalCallState::Failed;
            call.msg_id = msg_id;
            call.msg_timestamp = msg_timestamp;
            call.failed_count = 0;
            call.last_update_timestamp = now;
            return Ok(call.clone());
        }
        inner.next_call_id += 1;
        let call = ExternalCall {
            id: inner.next_call_id,
            operation_name: operation_name.to_string(),
            entity_id: entity_id.to_string(),
            state: ExternalCallState::Failed,
            msg_id,
            msg_timestamp,
            failed_count: 0,
            last_update_timestamp: now,
        };
        inner.call_keys.insert(key, call.id);
        inner.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn find_confirmation_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalCall>> {
        let cutoff = now - chrono_interval(interval);
        let inner = self.inner.lock();
        Ok(inner
            .calls
            .values()
            .filter(|c| {
                c.operation_name == rc_common::CONFIRMATION_OPERATION
                    && c.state == ExternalCallState::Failed
                    && c.last_update_timestamp <= cutoff
            })
            .min_by_key(|c| c.last_update_timestamp)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rc_common::Message;

    fn msg(correlation: &str, state: MsgState) -> Message {
        let mut m = Message::new(
            correlation,
            "crm",
            "customer",
            "setCustomer",
            Utc::now(),
            "{}",
        );
        m.state = state;
        m
    }

    #[tokio::test]
    async fn test_lock_is_single_winner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let m = store.insert(msg("c1", MsgState::Postponed)).await.unwrap();

        assert!(store.try_lock(m.msg_id, MsgState::Postponed, now).await.unwrap());
        // Second claim sees the row already in PROCESSING
        assert!(!store.try_lock(m.msg_id, MsgState::Postponed, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_finder_respects_interval_and_order() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut older = msg("c1", MsgState::Postponed);
        older.msg_timestamp = now - ChronoDuration::seconds(120);
        older.last_update_timestamp = now - ChronoDuration::seconds(90);
        let mut newer = msg("c2", MsgState::Postponed);
        newer.msg_timestamp = now - ChronoDuration::seconds(60);
        newer.last_update_timestamp = now - ChronoDuration::seconds(90);
        let mut fresh = msg("c3", MsgState::Postponed);
        fresh.last_update_timestamp = now;

        store.insert(older).await.unwrap();
        store.insert(newer).await.unwrap();
        store.insert(fresh).await.unwrap();

        let found = store
            .find_postponed_due(Duration::from_secs(30), now)
            .await
            .unwrap()
            .expect("a due message");
        assert_eq!(found.correlation_id, "c1");
    }

    #[tokio::test]
    async fn test_funnel_finder_excludes_failed_on_request() {
        let store = MemoryStore::new();
        let mut a = msg("c1", MsgState::Failed);
        a.funnel_value = Some("f1".to_string());
        let mut b = msg("c2", MsgState::Postponed);
        b.funnel_value = Some("f1".to_string());
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        assert_eq!(store.find_messages_for_funnel("f1", false).await.unwrap().len(), 2);
        assert_eq!(store.find_messages_for_funnel("f1", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_stuck() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut stuck = msg("c1", MsgState::Processing);
        stuck.last_update_timestamp = now - ChronoDuration::seconds(600);
        let mut live = msg("c2", MsgState::Processing);
        live.last_update_timestamp = now;
        let stuck = store.insert(stuck).await.unwrap();
        store.insert(live).await.unwrap();

        let recovered = store
            .recover_stuck(Duration::from_secs(300), now)
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let repaired = store.find_by_id(stuck.msg_id).await.unwrap().unwrap();
        assert_eq!(repaired.state, MsgState::PartlyFailed);
        assert_eq!(repaired.failed_count, 1);
    }

    #[tokio::test]
    async fn test_ledger_insert_is_unique_per_key() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store
            .insert_new("sendSms", "k1", ExternalCallState::Processing, 1, now, now)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .insert_new("sendSms", "k1", ExternalCallState::Processing, 2, now, now)
            .await
            .unwrap();
        assert!(second.is_none());
        // Different operation, same entity id is a different key
        let other = store
            .insert_new("sendEmail", "k1", ExternalCallState::Processing, 3, now, now)
            .await
            .unwrap();
        assert!(other.is_some());
    }
}
