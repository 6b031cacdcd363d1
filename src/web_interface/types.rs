//! Request/response bodies and input validation for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session_management::SessionStatus;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub container_image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub websocket_url: String,
    pub created_at: DateTime<Utc>,
}

/// Error payload returned by every non-2xx API response.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// User ids are opaque but must be non-empty and shell-safe:
/// alphanumerics plus `_`, `-`, `.`, at most 255 bytes.
pub fn validate_user_id(user_id: &str) -> bool {
    if user_id.is_empty() || user_id.len() > 255 {
        return false;
    }
    user_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Rejects image references carrying shell metacharacters before the
/// allow-list is even consulted.
pub fn validate_image_name(image: &str) -> bool {
    if image.is_empty() || image.len() > 255 {
        return false;
    }
    let invalid = ['$', '`', '|', ';', '&', '>', '<', '\\', '"', '\'', ' '];
    !image.chars().any(|c| invalid.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_user_ids() {
        assert!(validate_user_id("alice"));
        assert!(validate_user_id("user_123"));
        assert!(validate_user_id("user-name.v2"));
    }

    #[test]
    fn rejects_bad_user_ids() {
        assert!(!validate_user_id(""));
        assert!(!validate_user_id("user;id"));
        assert!(!validate_user_id("user id"));
        assert!(!validate_user_id(&"x".repeat(256)));
    }

    #[test]
    fn accepts_normal_image_references() {
        assert!(validate_image_name("ubuntu:22.04"));
        assert!(validate_image_name("node:18-alpine"));
    }

    #[test]
    fn rejects_image_references_with_metacharacters() {
        assert!(!validate_image_name(""));
        assert!(!validate_image_name("ubuntu; rm -rf /"));
        assert!(!validate_image_name("ubuntu`id`"));
    }
}
