//! Manual state-transition operations
//!
//! The operator-facing surface (excluded from this core) observes
//! failed_error_code / failed_count / state and drives restart or cancel
//! through these operations. Both are conditional updates; a zero-row
//! result means the message was not in an eligible state.

use std::sync::Arc;

use chrono::Utc;
use rc_common::{CoreError, MsgState, Result};
use rc_store::MessageRepository;
use tracing::info;

pub struct MessageOperationService {
    repository: Arc<dyn MessageRepository>,
}

impl MessageOperationService {
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self { repository }
    }

    /// Re-run a FAILED or CANCEL message: back to PARTLY_FAILED, picked up
    /// by the next poll cycle.
    pub async fn restart(&self, msg_id: i64) -> Result<()> {
        let affected = self
            .repository
            .cas_state(
                msg_id,
                &[MsgState::Failed, MsgState::Cancel],
                MsgState::PartlyFailed,
                Utc::now(),
            )
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if affected == 0 {
            return Err(CoreError::Validation(format!(
                "message {} is not FAILED or CANCEL, cannot restart",
                msg_id
            )));
        }
        info!(msg_id, "Message restarted");
        Ok(())
    }

    /// Cancel a message that has not been fully processed yet.
    pub async fn cancel(&self, msg_id: i64) -> Result<()> {
        let affected = self
            .repository
            .cas_state(
                msg_id,
                &[MsgState::New, MsgState::Postponed, MsgState::PartlyFailed],
                MsgState::Cancel,
                Utc::now(),
            )
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if affected == 0 {
            return Err(CoreError::Validation(format!(
                "message {} is not in a cancellable state",
                msg_id
            )));
        }
        info!(msg_id, "Message cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_common::Message;
    use rc_store::MemoryStore;

    async fn insert(store: &MemoryStore, state: MsgState) -> Message {
        let mut msg = Message::new("c", "crm", "customer", "op", Utc::now(), "{}");
        msg.state = state;
        store.insert(msg).await.unwrap()
    }

    #[tokio::test]
    async fn test_restart_failed_message() {
        let store = Arc::new(MemoryStore::new());
        let msg = insert(&store, MsgState::Failed).await;

        let ops = MessageOperationService::new(store.clone());
        ops.restart(msg.msg_id).await.unwrap();

        assert_eq!(
            store.find_by_id(msg.msg_id).await.unwrap().unwrap().state,
            MsgState::PartlyFailed
        );
    }

    #[tokio::test]
    async fn test_restart_cancelled_message() {
        let store = Arc::new(MemoryStore::new());
        let msg = insert(&store, MsgState::Cancel).await;

        let ops = MessageOperationService::new(store.clone());
        ops.restart(msg.msg_id).await.unwrap();

        assert_eq!(
            store.find_by_id(msg.msg_id).await.unwrap().unwrap().state,
            MsgState::PartlyFailed
        );
    }

    #[tokio::test]
    async fn test_restart_rejects_ok_message() {
        let store = Arc::new(MemoryStore::new());
        let msg = insert(&store, MsgState::Ok).await;

        let ops = MessageOperationService::new(store.clone());
        assert!(ops.restart(msg.msg_id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_postponed_message() {
        let store = Arc::new(MemoryStore::new());
        let msg = insert(&store, MsgState::Postponed).await;

        let ops = MessageOperationService::new(store.clone());
        ops.cancel(msg.msg_id).await.unwrap();

        assert_eq!(
            store.find_by_id(msg.msg_id).await.unwrap().unwrap().state,
            MsgState::Cancel
        );
    }

    #[tokio::test]
    async fn test_cancel_rejects_in_flight_message() {
        let store = Arc::new(MemoryStore::new());
        let msg = insert(&store, MsgState::Processing).await;

        let ops = MessageOperationService::new(store.clone());
        assert!(ops.cancel(msg.msg_id).await.is_err());
    }
}
