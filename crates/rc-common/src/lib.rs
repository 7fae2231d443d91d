use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Core Message Types
// ============================================================================

/// One inbound business unit of work flowing through the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: i64,
    /// Business-visible identifier assigned by the source system
    pub correlation_id: String,
    pub source_system: String,
    pub service: String,
    pub operation_name: String,
    /// Business time assigned by the sender - drives ledger tie-breaks
    pub msg_timestamp: DateTime<Utc>,
    pub receive_timestamp: DateTime<Utc>,
    pub start_process_timestamp: Option<DateTime<Utc>>,
    pub last_update_timestamp: DateTime<Utc>,
    /// Grouping key forcing serialized, timestamp-ordered processing
    pub funnel_value: Option<String>,
    pub funnel_component_id: Option<String>,
    pub guaranteed_order: bool,
    /// Whether FAILED siblings block funnel progress
    pub exclude_failed_state: bool,
    pub state: MsgState,
    pub failed_count: u32,
    pub failed_error_code: Option<String>,
    pub failed_description: Option<String>,
    pub business_error: Option<String>,
    pub parent_msg_id: Option<i64>,
    pub object_id: Option<String>,
    pub entity_type: Option<String>,
    pub payload: String,
    pub envelope: Option<String>,
}

impl Message {
    /// Create a message as the inbound transport would, in NEW state.
    pub fn new(
        correlation_id: impl Into<String>,
        source_system: impl Into<String>,
        service: impl Into<String>,
        operation_name: impl Into<String>,
        msg_timestamp: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            msg_id: 0,
            correlation_id: correlation_id.into(),
            source_system: source_system.into(),
            service: service.into(),
            operation_name: operation_name.into(),
            msg_timestamp,
            receive_timestamp: now,
            start_process_timestamp: None,
            last_update_timestamp: now,
            funnel_value: None,
            funnel_component_id: None,
            guaranteed_order: false,
            exclude_failed_state: false,
            state: MsgState::New,
            failed_count: 0,
            failed_error_code: None,
            failed_description: None,
            business_error: None,
            parent_msg_id: None,
            object_id: None,
            entity_type: None,
            payload: payload.into(),
            envelope: None,
        }
    }

    pub fn with_funnel(mut self, funnel_value: impl Into<String>, guaranteed_order: bool) -> Self {
        self.funnel_value = Some(funnel_value.into());
        self.guaranteed_order = guaranteed_order;
        self
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Age of the message relative to its business timestamp, in whole seconds.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.msg_timestamp).num_seconds()
    }
}

/// Message state machine.
///
/// PROCESSING is the in-flight marker claimed by the conditional lock update;
/// POSTPONED and PARTLY_FAILED are the retryable parking states the pollers
/// feed from; WAITING_FOR_RES parks a message awaiting an asynchronous
/// external response and is recovered by the repair sweep like stale
/// PROCESSING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgState {
    New,
    Processing,
    Postponed,
    PartlyFailed,
    WaitingForRes,
    Ok,
    Failed,
    Cancel,
}

impl MsgState {
    /// Terminal states are never mutated again except for deferred deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MsgState::Ok | MsgState::Failed | MsgState::Cancel)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgState::New => "NEW",
            MsgState::Processing => "PROCESSING",
            MsgState::Postponed => "POSTPONED",
            MsgState::PartlyFailed => "PARTLY_FAILED",
            MsgState::WaitingForRes => "WAITING_FOR_RES",
            MsgState::Ok => "OK",
            MsgState::Failed => "FAILED",
            MsgState::Cancel => "CANCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(MsgState::New),
            "PROCESSING" => Some(MsgState::Processing),
            "POSTPONED" => Some(MsgState::Postponed),
            "PARTLY_FAILED" => Some(MsgState::PartlyFailed),
            "WAITING_FOR_RES" => Some(MsgState::WaitingForRes),
            "OK" => Some(MsgState::Ok),
            "FAILED" => Some(MsgState::Failed),
            "CANCEL" => Some(MsgState::Cancel),
            _ => None,
        }
    }
}

// ============================================================================
// External Call Ledger Types
// ============================================================================

/// One row per idempotent outbound-call key `(operation_name, entity_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCall {
    pub id: i64,
    pub operation_name: String,
    pub entity_id: String,
    pub state: ExternalCallState,
    pub msg_id: i64,
    /// Always reflects the newest message that legitimately drove a call
    pub msg_timestamp: DateTime<Utc>,
    pub failed_count: u32,
    pub last_update_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalCallState {
    Processing,
    Ok,
    Failed,
    FailedEnd,
}

impl ExternalCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalCallState::Processing => "PROCESSING",
            ExternalCallState::Ok => "OK",
            ExternalCallState::Failed => "FAILED",
            ExternalCallState::FailedEnd => "FAILED_END",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(ExternalCallState::Processing),
            "OK" => Some(ExternalCallState::Ok),
            "FAILED" => Some(ExternalCallState::Failed),
            "FAILED_END" => Some(ExternalCallState::FailedEnd),
            _ => None,
        }
    }
}

/// How the ledger key is derived for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalCallKeyType {
    /// Entity id is the owning message's correlation id
    Message,
    /// Entity id supplied explicitly by the caller
    Custom,
}

/// Reserved ledger operation name used by the confirmation retry engine.
pub const CONFIRMATION_OPERATION: &str = "_confirm_";

// ============================================================================
// Internal Error Codes
// ============================================================================

/// Short stable codes recorded in `failed_error_code` by the core itself.
pub mod error_code {
    /// Unspecified internal error
    pub const INTERNAL: &str = "E100";
    /// Guaranteed-order message exceeded the postponed-when-failed threshold
    pub const FUNNEL_EXPIRED: &str = "E106";
    /// Confirmation retries exhausted
    pub const CONFIRMATION_EXHAUSTED: &str = "E107";
    /// Throttling limit exceeded
    pub const THROTTLED: &str = "E109";
}

// ============================================================================
// Warning / Notification Types
// ============================================================================

/// Warning categories raised by the core subsystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    /// Guaranteed-order postponement / funnel expiry
    Funnel,
    /// Message processing failures
    Processing,
    /// Confirmation delivery exhausted
    Confirmation,
    /// Rate limiting triggered
    Throttling,
    /// Scheduler / cluster coordination issues
    Scheduler,
    /// Stuck-message repair sweep activity
    Repair,
    /// Alert limit breached
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// A notification destined for the operator-facing sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
        }
    }
}

/// Sink for operator notifications. Delivery (email, chat, ...) is an
/// external collaborator; the default implementation logs.
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, warning: Warning);
}

/// Notifier that writes warnings to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl AdminNotifier for LogNotifier {
    async fn notify(&self, warning: Warning) {
        match warning.severity {
            WarningSeverity::Info => tracing::info!(
                category = ?warning.category,
                source = %warning.source,
                "{}", warning.message
            ),
            WarningSeverity::Warn => tracing::warn!(
                category = ?warning.category,
                source = %warning.source,
                "{}", warning.message
            ),
            WarningSeverity::Error | WarningSeverity::Critical => tracing::error!(
                category = ?warning.category,
                severity = ?warning.severity,
                source = %warning.source,
                "{}", warning.message
            ),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Routing tag attached to every core error.
///
/// Callers route on the tag via `CoreError::kind`, never on the concrete
/// variant, to choose the fatal vs. retryable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Contention signal - another worker claimed the row; always retried,
    /// never surfaced to an operator
    LockFailure,
    /// Terminal for the current message; no retry
    Fatal,
    /// Eligible for the next scheduled retry, bounded by the failure ceiling
    Retryable,
    /// Fails fast at startup/validation time; never a runtime retry target
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("lock failure: {0}")]
    LockFailure(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("business failure: {0}")]
    Business(String),

    #[error("no data found: {0}")]
    NoDataFound(String),

    #[error("multiple data found: {0}")]
    MultipleDataFound(String),

    #[error("throttling limit exceeded for ({source_system}, {service})")]
    RateLimitExceeded {
        source_system: String,
        service: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("integration error: {0}")]
    Integration(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::LockFailure(_) => ErrorKind::LockFailure,
            CoreError::Validation(_)
            | CoreError::Business(_)
            | CoreError::NoDataFound(_)
            | CoreError::MultipleDataFound(_)
            | CoreError::Contract(_) => ErrorKind::Fatal,
            CoreError::RateLimitExceeded { .. }
            | CoreError::Store(_)
            | CoreError::Integration(_) => ErrorKind::Retryable,
            CoreError::Config(_) => ErrorKind::Config,
        }
    }

    /// Error code to record on a message failed by this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::RateLimitExceeded { .. } => error_code::THROTTLED,
            _ => error_code::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
