//! Plain data types used by the metadata store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Closed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    SessionCreate,
    SessionReady,
    SessionAttach,
    SessionDetach,
    SessionTerminate,
    SessionFail,
    SecurityViolation,
    PrivacyEnable,
    PrivacyDisable,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SessionCreate => "session.create",
            AuditKind::SessionReady => "session.ready",
            AuditKind::SessionAttach => "session.attach",
            AuditKind::SessionDetach => "session.detach",
            AuditKind::SessionTerminate => "session.terminate",
            AuditKind::SessionFail => "session.fail",
            AuditKind::SecurityViolation => "security.violation",
            AuditKind::PrivacyEnable => "privacy.enable",
            AuditKind::PrivacyDisable => "privacy.disable",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only audit record as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub seq: i64,
    pub session_id: Option<Uuid>,
    pub user_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Severity attached to a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecuritySeverity {
    Info,
    Warning,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecuritySeverity::Info => "info",
            SecuritySeverity::Warning => "warning",
            SecuritySeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for SecuritySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource usage sample bound for the optional metrics channel.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub session_id: Uuid,
    pub cpu_percent: Option<f64>,
    pub memory_usage_bytes: Option<i64>,
    pub memory_limit_bytes: Option<i64>,
}
