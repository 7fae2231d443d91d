//! PostgreSQL store implementation.
//!
//! Every updater is a single conditional UPDATE whose WHERE clause carries
//! the expected current state; the affected-row count is the contention
//! signal. The unique key on `(operation_name, entity_id)` makes the
//! concurrent first-insert race resolve to exactly one PROCESSING row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rc_common::{ExternalCall, ExternalCallState, Message, MsgState, CONFIRMATION_OPERATION};
use anyhow::Result;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::{chrono_interval, ExternalCallRepository, MessageRepository};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message (
                msg_id BIGSERIAL PRIMARY KEY,
                correlation_id TEXT NOT NULL,
                source_system TEXT NOT NULL,
                service TEXT NOT NULL,
                operation_name TEXT NOT NULL,
                msg_timestamp TIMESTAMPTZ NOT NULL,
                receive_timestamp TIMESTAMPTZ NOT NULL,
                start_process_timestamp TIMESTAMPTZ,
                last_update_timestamp TIMESTAMPTZ NOT NULL,
                funnel_value TEXT,
                funnel_component_id TEXT,
                guaranteed_order BOOLEAN NOT NULL DEFAULT FALSE,
                exclude_failed_state BOOLEAN NOT NULL DEFAULT FALSE,
                state TEXT NOT NULL,
                failed_count INTEGER NOT NULL DEFAULT 0,
                failed_error_code TEXT,
                failed_description TEXT,
                business_error TEXT,
                parent_msg_id BIGINT,
                object_id TEXT,
                entity_type TEXT,
                payload TEXT NOT NULL,
                envelope TEXT,
                UNIQUE (source_system, correlation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_message_state_due
                ON message(state, last_update_timestamp);
            CREATE INDEX IF NOT EXISTS idx_message_funnel
                ON message(funnel_value);

            CREATE TABLE IF NOT EXISTS external_call (
                id BIGSERIAL PRIMARY KEY,
                operation_name TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                state TEXT NOT NULL,
                msg_id BIGINT NOT NULL,
                msg_timestamp TIMESTAMPTZ NOT NULL,
                failed_count INTEGER NOT NULL DEFAULT 0,
                last_update_timestamp TIMESTAMPTZ NOT NULL,
                UNIQUE (operation_name, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_external_call_confirmation_due
                ON external_call(operation_name, state, last_update_timestamp);
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("Message and external_call schema initialized");
        Ok(())
    }

    fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<Message> {
        let state_str: String = row.get("state");
        let state = MsgState::parse(&state_str)
            .ok_or_else(|| anyhow::anyhow!("unknown message state {:?}", state_str))?;
        Ok(Message {
            msg_id: row.get("msg_id"),
            correlation_id: row.get("correlation_id"),
            source_system: row.get("source_system"),
            service: row.get("service"),
            operation_name: row.get("operation_name"),
            msg_timestamp: row.get("msg_timestamp"),
            receive_timestamp: row.get("receive_timestamp"),
            start_process_timestamp: row.get("start_process_timestamp"),
            last_update_timestamp: row.get("last_update_timestamp"),
            funnel_value: row.get("funnel_value"),
            funnel_component_id: row.get("funnel_component_id"),
            guaranteed_order: row.get("guaranteed_order"),
            exclude_failed_state: row.get("exclude_failed_state"),
            state,
            failed_count: row.get::<i32, _>("failed_count") as u32,
            failed_error_code: row.get("failed_error_code"),
            failed_description: row.get("failed_description"),
            business_error: row.get("business_error"),
            parent_msg_id: row.get("parent_msg_id"),
            object_id: row.get("object_id"),
            entity_type: row.get("entity_type"),
            payload: row.get("payload"),
            envelope: row.get("envelope"),
        })
    }

    fn call_from_row(row: &sqlx::postgres::PgRow) -> Result<ExternalCall> {
        let state_str: String = row.get("state");
        let state = ExternalCallState::parse(&state_str)
            .ok_or_else(|| anyhow::anyhow!("unknown external call state {:?}", state_str))?;
        Ok(ExternalCall {
            id: row.get("id"),
            operation_name: row.get("operation_name"),
            entity_id: row.get("entity_id"),
            state,
            msg_id: row.get("msg_id"),
            msg_timestamp: row.get("msg_timestamp"),
            failed_count: row.get::<i32, _>("failed_count") as u32,
            last_update_timestamp: row.get("last_update_timestamp"),
        })
    }

    async fn find_due(
        &self,
        state: MsgState,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let cutoff = now - chrono_interval(interval);
        let row = sqlx::query(
            "SELECT * FROM message WHERE state = $1 AND last_update_timestamp <= $2 \
             ORDER BY msg_timestamp LIMIT 1",
        )
        .bind(state.as_str())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::message_from_row).transpose()
    }
}

#[async_trait]
impl MessageRepository for PostgresStore {
    async fn insert(&self, mut msg: Message) -> Result<Message> {
        let row = sqlx::query(
            r#"
            INSERT INTO message (
                correlation_id, source_system, service, operation_name,
                msg_timestamp, receive_timestamp, start_process_timestamp,
                last_update_timestamp, funnel_value, funnel_component_id,
                guaranteed_order, exclude_failed_state, state, failed_count,
                failed_error_code, failed_description, business_error,
                parent_msg_id, object_id, entity_type, payload, envelope
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22)
            RETURNING msg_id
            "#,
        )
        .bind(&msg.correlation_id)
        .bind(&msg.source_system)
        .bind(&msg.service)
        .bind(&msg.operation_name)
        .bind(msg.msg_timestamp)
        .bind(msg.receive_timestamp)
        .bind(msg.start_process_timestamp)
        .bind(msg.last_update_timestamp)
        .bind(&msg.funnel_value)
        .bind(&msg.funnel_component_id)
        .bind(msg.guaranteed_order)
        .bind(msg.exclude_failed_state)
        .bind(msg.state.as_str())
        .bind(msg.failed_count as i32)
        .bind(&msg.failed_error_code)
        .bind(&msg.failed_description)
        .bind(&msg.business_error)
        .bind(msg.parent_msg_id)
        .bind(&msg.object_id)
        .bind(&msg.entity_type)
        .bind(&msg.payload)
        .bind(&msg.envelope)
        .fetch_one(&self.pool)
        .await?;

        msg.msg_id = row.get("msg_id");
        Ok(msg)
    }

    async fn find_by_id(&self, msg_id: i64) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM message WHERE msg_id = $1")
            .bind(msg_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::message_from_row).transpose()
    }

    async fn find_postponed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.find_due(MsgState::Postponed, interval, now).await
    }

    async fn find_partly_failed_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.find_due(MsgState::PartlyFailed, interval, now).await
    }

    async fn find_messages_for_funnel(
        &self,
        funnel_value: &str,
        exclude_failed: bool,
    ) -> Result<Vec<Message>> {
        let mut states = vec!["PROCESSING", "POSTPONED", "PARTLY_FAILED", "WAITING_FOR_RES"];
        if !exclude_failed {
            states.push("FAILED");
        }
        let states: Vec<String> = states.into_iter().map(String::from).collect();

        let rows = sqlx::query(
            "SELECT * FROM message WHERE funnel_value = $1 AND state = ANY($2) \
             ORDER BY msg_timestamp",
        )
        .bind(funnel_value)
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn try_lock(
        &self,
        msg_id: i64,
        current: MsgState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE message SET state = 'PROCESSING', start_process_timestamp = $1, \
             last_update_timestamp = $1 WHERE msg_id = $2 AND state = $3",
        )
        .bind(now)
        .bind(msg_id)
        .bind(current.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cas_state(
        &self,
        msg_id: i64,
        from: &[MsgState],
        to: MsgState,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            "UPDATE message SET state = $1, last_update_timestamp = $2 \
             WHERE msg_id = $3 AND state = ANY($4)",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(msg_id)
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
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
        let result = sqlx::query(
            "UPDATE message SET state = 'PARTLY_FAILED', failed_count = failed_count + 1, \
             failed_description = $1, last_update_timestamp = $2 \
             WHERE msg_id = $3 AND state = 'PROCESSING'",
        )
        .bind(description)
        .bind(now)
        .bind(msg_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_failed(
        &self,
        msg_id: i64,
        error_code: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE message SET state = 'FAILED', failed_count = failed_count + 1, \
             failed_error_code = $1, failed_description = $2, last_update_timestamp = $3 \
             WHERE msg_id = $4 AND state NOT IN ('OK', 'FAILED', 'CANCEL')",
        )
        .bind(error_code)
        .bind(description)
        .bind(now)
        .bind(msg_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stuck(&self, grace: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - chrono_interval(grace);
        let result = sqlx::query(
            "UPDATE message SET state = 'PARTLY_FAILED', failed_count = failed_count + 1, \
             last_update_timestamp = $1 \
             WHERE state IN ('PROCESSING', 'WAITING_FOR_RES') AND last_update_timestamp <= $2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} stuck messages", recovered);
        }
        Ok(recovered)
    }

    async fn count_in_state(
        &self,
        state: MsgState,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let row = match since {
            Some(cutoff) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM message \
                     WHERE state = $1 AND last_update_timestamp >= $2",
                )
                .bind(state.as_str())
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT COUNT(*) AS n FROM message WHERE state = $1")
                    .bind(state.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl ExternalCallRepository for PostgresStore {
    async fn find_by_key(
        &self,
        operation_name: &str,
        entity_id: &str,
    ) -> Result<Option<ExternalCall>> {
        let row = sqlx::query(
            "SELECT * FROM external_call WHERE operation_name = $1 AND entity_id = $2",
        )
        .bind(operation_name)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::call_from_row).transpose()
    }

    async fn find_call_by_id(&self, id: i64) -> Result<Option<ExternalCall>> {
        let row = sqlx::query("SELECT * FROM external_call WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::call_from_row).transpose()
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
        // ON CONFLICT DO NOTHING turns the unique-key race into a clean
        // "no row returned" signal for the loser.
        let row = sqlx::query(
            r#"
            INSERT INTO external_call (
                operation_name, entity_id, state, msg_id, msg_timestamp,
                failed_count, last_update_timestamp
            ) VALUES ($1, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (operation_name, entity_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(operation_name)
        .bind(entity_id)
        .bind(state.as_str())
        .bind(msg_id)
        .bind(msg_timestamp)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::call_from_row).transpose()
    }

    async fn try_acquire(
        &self,
        id: i64,
        from: ExternalCallState,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE external_call SET state = 'PROCESSING', msg_id = $1, msg_timestamp = $2, \
             last_update_timestamp = $3 WHERE id = $4 AND state = $5",
        )
        .bind(msg_id)
        .bind(msg_timestamp)
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn try_finish(
        &self,
        id: i64,
        to: ExternalCallState,
        failed_count: u32,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE external_call SET state = $1, failed_count = $2, \
             last_update_timestamp = $3 WHERE id = $4 AND state = 'PROCESSING'",
        )
        .bind(to.as_str())
        .bind(failed_count as i32)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_failed(
        &self,
        operation_name: &str,
        entity_id: &str,
        msg_id: i64,
        msg_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ExternalCall> {
        let row = sqlx::query(
            r#"
            INSERT INTO external_call (
                operation_name, entity_id, state, msg_id, msg_timestamp,
                failed_count, last_update_timestamp
            ) VALUES ($1, $2, 'FAILED', $3, $4, 0, $5)
            ON CONFLICT (operation_name, entity_id) DO UPDATE SET
                state = 'FAILED', msg_id = $3, msg_timestamp = $4,
                failed_count = 0, last_update_timestamp = $5
            RETURNING *
            "#,
        )
        .bind(operation_name)
        .bind(entity_id)
        .bind(msg_id)
        .bind(msg_timestamp)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Self::call_from_row(&row)
    }

    async fn find_confirmation_due(
        &self,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExternalCall>> {
        let cutoff = now - chrono_interval(interval);
        let row = sqlx::query(
            "SELECT * FROM external_call \
             WHERE operation_name = $1 AND state = 'FAILED' AND last_update_timestamp <= $2 \
             ORDER BY last_update_timestamp LIMIT 1",
        )
        .bind(CONFIRMATION_OPERATION)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::call_from_row).transpose()
    }
}
