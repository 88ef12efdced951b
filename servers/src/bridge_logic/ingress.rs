//! Producer ingress: `POST /publish` feeds a package into the batch cache.
//!
//! Query parameters:
//! - `sessions=1,2` target sessions; omitted or empty means everyone.
//! - `binary=true` never merge, send as a binary frame.
//! - `immediate=true` bypass the cache.
//! - `timeout_ms=N` slot wait of an immediate publish.
//!
//! The request body is the package, unchanged.

use crate::bridge_logic::downstream::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use lib_bridge::{BroadcastError, SessionId};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_IMMEDIATE_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Default, Deserialize)]
pub struct PublishParams {
    pub sessions: Option<String>,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub immediate: bool,
    pub timeout_ms: Option<u64>,
}

/// Parses `"1, 2,3"`. An empty or missing list means every session.
pub fn parse_sessions(sessions: Option<&str>) -> Result<Vec<SessionId>, String> {
    let Some(sessions) = sessions else {
        return Ok(Vec::new());
    };
    sessions
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<SessionId>()
                .map_err(|_| format!("Invalid session id: {}", part))
        })
        .collect()
}

fn status_for(error: &BroadcastError) -> StatusCode {
    match error {
        BroadcastError::AcquireTimeout(_) | BroadcastError::ShutDown | BroadcastError::OutOfResources => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn publish_handler(
    State(state): State<AppState>,
    Query(params): Query<PublishParams>,
    body: Bytes,
) -> impl IntoResponse {
    let destinations = match parse_sessions(params.sessions.as_deref()) {
        Ok(destinations) => destinations,
        Err(message) => return (StatusCode::BAD_REQUEST, message),
    };
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_IMMEDIATE_TIMEOUT_MS));

    match state
        .cache
        .add(body, destinations, params.binary, params.immediate, timeout)
        .await
    {
        Ok(()) if params.immediate => (StatusCode::OK, "published".to_string()),
        Ok(()) => (StatusCode::ACCEPTED, "queued".to_string()),
        Err(e) => {
            log::warn!("Publish request failed: {}", e);
            (status_for(&e), e.to_string())
        }
    }
}
