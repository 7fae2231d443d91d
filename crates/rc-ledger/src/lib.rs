//! External Call Ledger
//!
//! Idempotent tracking of outbound calls keyed by business identity. One
//! ledger row per `(operation_name, entity_id)`; strict msg_timestamp
//! ordering decides whether a call proceeds, ties favor the already-recorded
//! state. A row in PROCESSING is a lock failure for everyone else - the
//! caller retries the whole operation after a short backoff.

use std::sync::Arc;

use chrono::Utc;
use rc_common::{
    CoreError, ExternalCall, ExternalCallKeyType, ExternalCallState, Message, Result,
};
use rc_store::ExternalCallRepository;
use tracing::{debug, warn};

/// Outcome of `request_call`.
#[derive(Debug, Clone)]
pub enum CallDecision {
    /// Perform the outbound call, then report `complete` or `fail` against
    /// the returned row.
    Execute(ExternalCall),
    /// The key was already satisfied by a same-or-newer message. The caller
    /// must pass its current payload through unchanged - no new outbound
    /// call, no bookkeeping update.
    Suppress(ExternalCall),
}

impl CallDecision {
    pub fn is_execute(&self) -> bool {
        matches!(self, CallDecision::Execute(_))
    }
}

pub struct ExternalCallService {
    repository: Arc<dyn ExternalCallRepository>,
    /// Failures beyond this count make the row terminal FAILED_END
    failed_limit: u32,
}

impl ExternalCallService {
    pub fn new(repository: Arc<dyn ExternalCallRepository>, failed_limit: u32) -> Self {
        Self {
            repository,
            failed_limit,
        }
    }

    fn entity_id<'a>(key_type: ExternalCallKeyType, key: &'a str, message: &'a Message) -> &'a str {
        match key_type {
            ExternalCallKeyType::Message => &message.correlation_id,
            ExternalCallKeyType::Custom => key,
        }
    }

    /// Decide whether an outbound call for this key may proceed.
    pub async fn request_call(
        &self,
        key_type: ExternalCallKeyType,
        operation_name: &str,
        key: &str,
        message: &Message,
    ) -> Result<CallDecision> {
        let entity_id = Self::entity_id(key_type, key, message);
        let now = Utc::now();

        let existing = self
            .repository
            .find_by_key(operation_name, entity_id)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        let stored = match existing {
            None => {
                // First attempt for this key. The unique key resolves a
                // concurrent race to exactly one PROCESSING row; losers get
                // a lock failure and retry.
                match self
                    .repository
                    .insert_new(
                        operation_name,
                        entity_id,
                        ExternalCallState::Processing,
                        message.msg_id,
                        message.msg_timestamp,
                        now,
                    )
                    .await
                    .map_err(|e| CoreError::Store(e.to_string()))?
                {
                    Some(call) => {
                        debug!(
                            operation = operation_name,
                            entity_id,
                            msg_id = message.msg_id,
                            "External call registered"
                        );
                        return Ok(CallDecision::Execute(call));
                    }
                    None => {
                        return Err(CoreError::LockFailure(format!(
                            "external call ({}, {}) claimed concurrently",
                            operation_name, entity_id
                        )))
                    }
                }
            }
            Some(call) => call,
        };

        match stored.state {
            ExternalCallState::Processing => Err(CoreError::LockFailure(format!(
                "external call ({}, {}) is in flight for msg {}",
                operation_name, entity_id, stored.msg_id
            ))),

            ExternalCallState::Ok | ExternalCallState::FailedEnd => {
                if message.msg_timestamp > stored.msg_timestamp {
                    // A newer business event supersedes a stale result.
                    self.acquire(&stored, message, now).await
                } else {
                    debug!(
                        operation = operation_name,
                        entity_id,
                        msg_id = message.msg_id,
                        stored_msg_id = stored.msg_id,
                        "Duplicate or out-of-order call suppressed"
                    );
                    Ok(CallDecision::Suppress(stored))
                }
            }

            ExternalCallState::Failed => {
                if message.msg_timestamp >= stored.msg_timestamp {
                    self.acquire(&stored, message, now).await
                } else {
                    // An already-superseded retry must not clobber newer
                    // failure bookkeeping.
                    Ok(CallDecision::Suppress(stored))
                }
            }
        }
    }

    async fn acquire(
        &self,
        stored: &ExternalCall,
        message: &Message,
        now: chrono::DateTime<Utc>,
    ) -> Result<CallDecision> {
        let affected = self
            .repository
            .try_acquire(stored.id, stored.state, message.msg_id, message.msg_timestamp, now)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if affected == 0 {
            return Err(CoreError::LockFailure(format!(
                "external call ({}, {}) changed under us",
                stored.operation_name, stored.entity_id
            )));
        }

        let call = self
            .repository
            .find_call_by_id(stored.id)
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?
            .ok_or_else(|| {
                CoreError::Contract(format!("external call {} vanished after acquire", stored.id))
            })?;
        Ok(CallDecision::Execute(call))
    }

    /// Report a successful outbound call: PROCESSING -> OK.
    pub async fn complete(&self, call: &ExternalCall) -> Result<()> {
        self.finish(call, ExternalCallState::Ok, call.failed_count)
            .await
    }

    /// Report a failed outbound call: PROCESSING -> FAILED, or terminal
    /// FAILED_END once the failure ceiling is exceeded.
    pub async fn fail(&self, call: &ExternalCall) -> Result<()> {
        let new_count = call.failed_count + 1;
        let to = if new_count > self.failed_limit {
            warn!(
                operation = %call.operation_name,
                entity_id = %call.entity_id,
                failed_count = new_count,
                "External call failure ceiling exceeded, marking FAILED_END"
            );
            ExternalCallState::FailedEnd
        } else {
            ExternalCallState::Failed
        };
        self.finish(call, to, new_count).await
    }

    async fn finish(
        &self,
        call: &ExternalCall,
        to: ExternalCallState,
        failed_count: u32,
    ) -> Result<()> {
        let affected = self
            .repository
            .try_finish(call.id, to, failed_count, Utc::now())
            .await
            .map_err(|e| CoreError::Store(e.to_string()))?;

        if affected == 0 {
            // The completion contract requires the row to still be ours and
            // in PROCESSING; anything else is a programming error, not a
            // business failure.
            let actual = self
                .repository
                .find_call_by_id(call.id)
                .await
                .map_err(|e| CoreError::Store(e.to_string()))?;
            return Err(CoreError::Contract(format!(
                "external call ({}, {}) not in PROCESSING at completion (actual: {:?})",
                call.operation_name,
                call.entity_id,
                actual.map(|c| c.state)
            )));
        }
        Ok(())
    }
}
