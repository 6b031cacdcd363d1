//! HTTP API routes.
//!
//! Thin request handlers: validation, rate limiting, and delegation to
//! the session manager and egress supervisor. All replies are JSON.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::Utc;
use log::warn;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{reply, Filter, Rejection, Reply};

use crate::anonymity::EgressSupervisor;
use crate::configuration::Config;
use crate::error_handling::types::{ContainerError, SessionError};
use crate::session_management::SessionManager;
use crate::storage::types::SecuritySeverity;
use crate::storage::MetadataStore;
use crate::web_interface::terminal;
use crate::web_interface::types::{
    validate_image_name, validate_user_id, ApiError, CreateSessionRequest, CreateSessionResponse,
};

/// Shared handle bundle cloned into every route.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub store: Arc<MetadataStore>,
    pub anonymity: Arc<EgressSupervisor>,
    pub config: Arc<Config>,
}

fn with_state(
    state: AppState,
) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The complete route tree: the JSON API plus the stream transports.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let create = warp::path!("api" / "sessions")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(create_session);

    let list = warp::path!("api" / "sessions")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(list_sessions);

    let get = warp::path!("api" / "sessions" / Uuid)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_session);

    let delete = warp::path!("api" / "sessions" / Uuid)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(delete_session);

    let health = warp::path!("health").and(warp::get()).and_then(health);

    let privacy_enable = warp::path!("api" / "privacy" / "enable")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(privacy_enable);

    let privacy_disable = warp::path!("api" / "privacy" / "disable")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(privacy_disable);

    let privacy_status = warp::path!("api" / "privacy" / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(privacy_status);

    create
        .or(list)
        .or(get)
        .or(delete)
        .or(health)
        .or(privacy_enable)
        .or(privacy_disable)
        .or(privacy_status)
        .or(terminal::terminal_routes(state))
}

type JsonReply = reply::WithStatus<reply::Json>;

async fn create_session(
    state: AppState,
    body: CreateSessionRequest,
) -> Result<JsonReply, Infallible> {
    if !validate_user_id(&body.user_id) {
        return Ok(error_reply(StatusCode::BAD_REQUEST, "Invalid user_id"));
    }

    let image = body
        .container_image
        .unwrap_or_else(|| state.config.default_image.clone());
    if !validate_image_name(&image) || !state.config.is_image_allowed(&image) {
        warn!("Rejected disallowed image {:?}", image);
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "Container image not allowed",
        ));
    }

    // Windowed per-user throttle on session creation.
    match state
        .store
        .incr_rate(&body.user_id, "session_create", Utc::now())
        .await
    {
        Ok(count) if count > state.config.rate_limit_per_minute => {
            warn!("Rate limit hit for user {}", body.user_id);
            let _ = state
                .store
                .append_security(
                    None,
                    &body.user_id,
                    "rate_limit_exceeded",
                    SecuritySeverity::Warning,
                    Some("session_create"),
                    Utc::now(),
                )
                .await;
            return Ok(error_reply(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
            ));
        }
        Ok(_) => {}
        Err(e) => {
            // A broken counter must not block creation outright.
            warn!("Rate limit check failed: {}", e);
        }
    }

    match state.sessions.create_session(&body.user_id, &image).await {
        Ok(session) => {
            let response = CreateSessionResponse {
                session_id: session.id,
                status: session.status,
                websocket_url: format!("/pty/{}", session.id),
                created_at: session.created_at,
            };
            Ok(reply::with_status(reply::json(&response), StatusCode::OK))
        }
        Err(e) => Ok(session_error_reply(e)),
    }
}

async fn list_sessions(
    state: AppState,
    query: HashMap<String, String>,
) -> Result<JsonReply, Infallible> {
    let Some(user_id) = query.get("user_id") else {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "Missing user_id query parameter",
        ));
    };

    match state.sessions.list_sessions(user_id).await {
        Ok(sessions) => Ok(reply::with_status(
            reply::json(&sessions),
            StatusCode::OK,
        )),
        Err(e) => Ok(session_error_reply(e)),
    }
}

async fn get_session(id: Uuid, state: AppState) -> Result<JsonReply, Infallible> {
    match state.sessions.get_session(id).await {
        Ok(session) => Ok(reply::with_status(reply::json(&session), StatusCode::OK)),
        Err(e) => Ok(session_error_reply(e)),
    }
}

async fn delete_session(id: Uuid, state: AppState) -> Result<JsonReply, Infallible> {
    match state.sessions.delete_session(id).await {
        Ok(()) => Ok(reply::with_status(
            reply::json(&serde_json::json!({"status": "terminating"})),
            StatusCode::OK,
        )),
        Err(e) => Ok(session_error_reply(e)),
    }
}

async fn health() -> Result<JsonReply, Infallible> {
    Ok(reply::with_status(
        reply::json(&serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        StatusCode::OK,
    ))
}

async fn privacy_enable(state: AppState) -> Result<JsonReply, Infallible> {
    match state.anonymity.clone().enable().await {
        Ok(status) => Ok(reply::with_status(
            reply::json(&serde_json::json!({
                "status": "enabled",
                "socks_port": status.socks_port,
            })),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to enable privacy: {}", e),
        )),
    }
}

async fn privacy_disable(state: AppState) -> Result<JsonReply, Infallible> {
    match state.anonymity.disable().await {
        Ok(_) => Ok(reply::with_status(
            reply::json(&serde_json::json!({"status": "disabled"})),
            StatusCode::OK,
        )),
        Err(e) => Ok(error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to disable privacy: {}", e),
        )),
    }
}

async fn privacy_status(state: AppState) -> Result<JsonReply, Infallible> {
    Ok(reply::with_status(
        reply::json(&state.anonymity.status()),
        StatusCode::OK,
    ))
}

fn error_reply(code: StatusCode, message: impl Into<String>) -> JsonReply {
    reply::with_status(reply::json(&ApiError::new(message)), code)
}

fn session_error_reply(error: SessionError) -> JsonReply {
    let (code, message) = match &error {
        SessionError::NotFound => (StatusCode::NOT_FOUND, "Session not found".to_string()),
        SessionError::QuotaExceeded => (
            StatusCode::CONFLICT,
            "Session quota exceeded for user".to_string(),
        ),
        SessionError::RateLimited => {
            (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".to_string())
        }
        SessionError::ImageNotAllowed(image) => (
            StatusCode::BAD_REQUEST,
            format!("Image not allowed: {}", image),
        ),
        SessionError::InvalidUserId => (StatusCode::BAD_REQUEST, "Invalid user_id".to_string()),
        SessionError::NotAttachable(status) => (
            StatusCode::CONFLICT,
            format!("Session is {}", status),
        ),
        SessionError::CreateTimeout => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Session creation timed out".to_string(),
        ),
        SessionError::Container(ContainerError::ResourceExhausted(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Container resources exhausted".to_string(),
        ),
        SessionError::Container(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Container runtime error: {}", e),
        ),
        SessionError::Storage(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Storage error: {}", e),
        ),
    };
    error_reply(code, message)
}
