//! Closed error-code space shared by every subsystem.
//!
//! Each code carries static metadata (severity, category, retryable flag and
//! a human suggestion) looked up from a table keyed by the variant. Errors
//! cross the IPC boundary as the JSON envelope written to `results.jsonl`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Codes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Service lifecycle
    ServiceNotRunning,
    ServiceAlreadyRunning,
    ServiceStartFailed,
    ServiceStopFailed,
    // Network
    NetworkDisconnected,
    NetworkSendFailed,
    RelayAllFailed,
    // Validation
    InvalidArgs,
    InvalidPubkey,
    InvalidSignature,
    // Group
    GroupNotFound,
    GroupAlreadyExists,
    NotGroupOwner,
    MemberNotFound,
    MemberBanned,
    MemberMuted,
    // Message
    MessageExpired,
    MessageRetryExhausted,
    ReplayAttackDetected,
    // System
    FileError,
    UnknownCommand,
    InternalError,
}

impl ErrorCode {
    /// Stable numeric code, blocked per category.
    pub fn code(&self) -> u16 {
        use ErrorCode::*;
        match self {
            ServiceNotRunning => 100,
            ServiceAlreadyRunning => 101,
            ServiceStartFailed => 102,
            ServiceStopFailed => 103,
            NetworkDisconnected => 200,
            NetworkSendFailed => 201,
            RelayAllFailed => 202,
            InvalidArgs => 300,
            InvalidPubkey => 301,
            InvalidSignature => 302,
            GroupNotFound => 400,
            GroupAlreadyExists => 401,
            NotGroupOwner => 402,
            MemberNotFound => 403,
            MemberBanned => 404,
            MemberMuted => 405,
            MessageExpired => 500,
            MessageRetryExhausted => 501,
            ReplayAttackDetected => 502,
            FileError => 600,
            UnknownCommand => 601,
            InternalError => 602,
        }
    }

    /// The wire identifier, e.g. `"RELAY_ALL_FAILED"`.
    pub fn key(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ServiceNotRunning => "SERVICE_NOT_RUNNING",
            ServiceAlreadyRunning => "SERVICE_ALREADY_RUNNING",
            ServiceStartFailed => "SERVICE_START_FAILED",
            ServiceStopFailed => "SERVICE_STOP_FAILED",
            NetworkDisconnected => "NETWORK_DISCONNECTED",
            NetworkSendFailed => "NETWORK_SEND_FAILED",
            RelayAllFailed => "RELAY_ALL_FAILED",
            InvalidArgs => "INVALID_ARGS",
            InvalidPubkey => "INVALID_PUBKEY",
            InvalidSignature => "INVALID_SIGNATURE",
            GroupNotFound => "GROUP_NOT_FOUND",
            GroupAlreadyExists => "GROUP_ALREADY_EXISTS",
            NotGroupOwner => "NOT_GROUP_OWNER",
            MemberNotFound => "MEMBER_NOT_FOUND",
            MemberBanned => "MEMBER_BANNED",
            MemberMuted => "MEMBER_MUTED",
            MessageExpired => "MESSAGE_EXPIRED",
            MessageRetryExhausted => "MESSAGE_RETRY_EXHAUSTED",
            ReplayAttackDetected => "REPLAY_ATTACK_DETECTED",
            FileError => "FILE_ERROR",
            UnknownCommand => "UNKNOWN_COMMAND",
            InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn meta(&self) -> &'static ErrorMeta {
        META.get(self).expect("every code has a metadata entry")
    }

    pub fn retryable(&self) -> bool {
        self.meta().retryable
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Network,
    Service,
    Validation,
    Group,
    Message,
    System,
}

#[derive(Debug, Clone)]
pub struct ErrorMeta {
    pub severity: Severity,
    pub category: Category,
    pub retryable: bool,
    pub suggestion: &'static str,
}

static META: Lazy<HashMap<ErrorCode, ErrorMeta>> = Lazy::new(|| {
    use Category::*;
    use ErrorCode::*;
    use Severity::*;

    let mut m = HashMap::new();
    let mut put = |code, severity, category, retryable, suggestion| {
        m.insert(
            code,
            ErrorMeta { severity, category, retryable, suggestion },
        );
    };

    put(ServiceNotRunning, Medium, Service, false,
        "start the service before issuing commands");
    put(ServiceAlreadyRunning, Medium, Service, false,
        "another instance owns this data directory; stop it first");
    put(ServiceStartFailed, High, Service, true,
        "check data directory permissions and relay configuration");
    put(ServiceStopFailed, Medium, Service, true,
        "retry; remove the PID file manually if it is stale");

    put(NetworkDisconnected, Medium, Network, true,
        "the relay pool is reconnecting; retry shortly");
    put(NetworkSendFailed, Medium, Network, true,
        "the message stays queued and will be retried");
    put(RelayAllFailed, High, Network, true,
        "no relay accepted the publish; check connectivity and relay URLs");

    put(InvalidArgs, Low, Validation, false,
        "check the command arguments");
    put(InvalidPubkey, Low, Validation, false,
        "public keys are 64 lowercase hex characters");
    put(InvalidSignature, High, Validation, false,
        "the event signature does not match its author");

    put(GroupNotFound, Low, Group, false,
        "list groups to see which ids are known locally");
    put(GroupAlreadyExists, Low, Group, false,
        "join the existing group instead of creating it");
    put(NotGroupOwner, Medium, Group, false,
        "only the group owner may perform this operation");
    put(MemberNotFound, Low, Group, false,
        "the target is not a member of this group");
    put(MemberBanned, Medium, Group, false,
        "banned members cannot send to this group");
    put(MemberMuted, Low, Group, false,
        "wait for the mute to expire");

    put(MessageExpired, Low, Message, false,
        "the message exceeded its delivery window; resend if still relevant");
    put(MessageRetryExhausted, Medium, Message, false,
        "delivery failed after all retries; resend if still relevant");
    put(ReplayAttackDetected, High, Message, false,
        "a duplicate event id was rejected");

    put(FileError, Critical, System, false,
        "check data directory permissions and free space");
    put(UnknownCommand, Low, System, false,
        "see the command reference for supported commands");
    put(InternalError, High, System, false,
        "inspect the service log for details");

    m
});

// ─── Error value ─────────────────────────────────────────────────────────────

/// The error type crossing subsystem boundaries. Carries one of the closed
/// codes plus a contextual message; `details` preserves the text of wrapped
/// foreign errors.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.key())]
pub struct AgentError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Normalize an arbitrary error to `code`, keeping the original text.
    pub fn wrap(code: ErrorCode, err: impl std::fmt::Display) -> Self {
        let text = err.to_string();
        Self {
            code,
            message: text.clone(),
            details: Some(serde_json::json!({ "source": text })),
        }
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// The `error` object of the failure envelope (§ result envelope).
    pub fn to_json(&self) -> serde_json::Value {
        let meta = self.code.meta();
        let mut obj = serde_json::json!({
            "code": self.code.code(),
            "code_key": self.code.key(),
            "message": self.message,
            "suggestion": meta.suggestion,
            "severity": meta.severity,
            "category": meta.category,
            "retryable": meta.retryable,
        });
        if let Some(details) = &self.details {
            obj["details"] = details.clone();
        }
        obj
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::wrap(ErrorCode::FileError, e)
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::wrap(ErrorCode::InternalError, e)
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

// ─── Tests ───────────────────────────────────────────────────────────────────
