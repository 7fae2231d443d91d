//! Stuck-message repair
//!
//! A processing attempt has no cooperative cancellation; a crashed or hung
//! worker leaves its message in PROCESSING (or WAITING_FOR_RES). The repair
//! sweep finds rows stuck past a grace period and returns them to
//! PARTLY_FAILED so a later poll cycle retries them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rc_common::{
    AdminNotifier, CoreError, Result, Warning, WarningCategory, WarningSeverity,
};
use rc_store::MessageRepository;
use tracing::{debug, warn};

pub struct RepairService {
    repository: Arc<dyn MessageRepository>,
    notifier: Arc<dyn AdminNotifier>,
    grace: Duration,
}

impl RepairService {
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        notifier: Arc<dyn AdminNotifier>,
        grace: Duration,
    ) -> Self {
        Self {
            repository,
            notifier,
            grace,
        }
    }

    /// One sweep; returns the number of repaired messages.
    pub async fn run(&self) -> Result<u64> {
        let recovered = self
            .repository
            .recover_stuck(self.grace, Utc::now())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if recovered > 0 {
            warn!(recovered, "Repair sweep returned stuck messages to retry");
            self.notifier
                .notify(Warning::new(
                    WarningCategory::Repair,
                    WarningSeverity::Warn,
                    format!("{} stuck messages returned to PARTLY_FAILED", recovered),
                    "RepairService".to_string(),
                ))
                .await;
        } else {
            debug!("Repair sweep found nothing stuck");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rc_common::{LogNotifier, Message, MsgState};
    use rc_store::MemoryStore;

    #[tokio::test]
    async fn test_repair_recovers_only_stuck_rows() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let mut stuck = Message::new("s", "crm", "customer", "op", now, "{}");
        stuck.state = MsgState::Processing;
        stuck.last_update_timestamp = now - ChronoDuration::seconds(600);
        let stuck = store.insert(stuck).await.unwrap();

        let mut waiting = Message::new("w", "crm", "customer", "op", now, "{}");
        waiting.state = MsgState::WaitingForRes;
        waiting.last_update_timestamp = now - ChronoDuration::seconds(600);
        let waiting = store.insert(waiting).await.unwrap();

        let mut live = Message::new("l", "crm", "customer", "op", now, "{}");
        live.state = MsgState::Processing;
        live.last_update_timestamp = now;
        let live = store.insert(live).await.unwrap();

        let repair = RepairService::new(store.clone(), Arc::new(LogNotifier), Duration::from_secs(300));
        assert_eq!(repair.run().await.unwrap(), 2);

        assert_eq!(store.find_by_id(stuck.msg_id).await.unwrap().unwrap().state, MsgState::PartlyFailed);
        assert_eq!(store.find_by_id(waiting.msg_id).await.unwrap().unwrap().state, MsgState::PartlyFailed);
        assert_eq!(store.find_by_id(live.msg_id).await.unwrap().unwrap().state, MsgState::Processing);
    }
}
