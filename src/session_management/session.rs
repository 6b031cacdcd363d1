use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container_runtime::types::ResourceLimits;

/// Lifecycle states of a session.
///
/// Transitions are restricted to the edges encoded in
/// [`SessionStatus::can_transition`]; everything else is a bug in the
/// caller. Persistence-level compare-and-set enforces that a transition
/// observed a current `from` state, this enum enforces which edges exist
/// at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Creating,
    Ready,
    Attached,
    Detached,
    Terminating,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "Creating",
            SessionStatus::Ready => "Ready",
            SessionStatus::Attached => "Attached",
            SessionStatus::Detached => "Detached",
            SessionStatus::Terminating => "Terminating",
            SessionStatus::Terminated => "Terminated",
            SessionStatus::Failed => "Failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Creating" => Some(SessionStatus::Creating),
            "Ready" => Some(SessionStatus::Ready),
            "Attached" => Some(SessionStatus::Attached),
            "Detached" => Some(SessionStatus::Detached),
            "Terminating" => Some(SessionStatus::Terminating),
            "Terminated" => Some(SessionStatus::Terminated),
            "Failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    /// Whether the `self -> to` edge exists in the lifecycle DAG.
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Creating, Ready)
                | (Creating, Failed)
                | (Ready, Attached)
                | (Ready, Terminating)
                | (Attached, Detached)
                | (Attached, Terminating)
                | (Detached, Attached)
                | (Detached, Terminating)
                | (Terminating, Terminated)
                | (Terminating, Failed)
                | (Failed, Terminated)
        )
    }

    /// States in which a client stream may bind.
    pub fn is_attachable(self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Detached)
    }

    /// States that count against the per-user quota.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionStatus::Terminated | SessionStatus::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's pairing with one ephemeral container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Opaque identifier supplied by the upstream authenticator.
    pub user_id: String,
    /// Base image the container was created from.
    pub image: String,
    pub status: SessionStatus,
    /// Engine-assigned container handle; set once Ready, cleared on
    /// Terminated.
    pub container_ref: Option<String>,
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
    /// When a detached session becomes eligible for eviction.
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// A fresh record in `Creating`, before any container exists.
    pub fn new(
        user_id: String,
        image: String,
        limits: ResourceLimits,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            image,
            status: SessionStatus::Creating,
            container_ref: None,
            resource_limits: limits,
            created_at: now,
            last_activity_at: now,
            detached_at: None,
            expires_at: None,
            metadata: HashMap::new(),
        }
    }
}
