use crate::bridge_logic::config::Config;
use crate::bridge_logic::ingress;
use crate::bridge_logic::sessions::{Outgoing, SessionRegistry};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use lib_bridge::{BatchCache, Broadcaster};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything the HTTP handlers share.
#[derive(Clone)]
pub struct AppState {
    pub broadcaster: Arc<Broadcaster>,
    pub cache: Arc<BatchCache<Broadcaster>>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: broadcast::Sender<()>,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/publish", post(ingress::publish_handler))
        .with_state(app_state)
}

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(app_state);

    let addr = SocketAddr::new(config.bind_address(), config.port());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.broadcaster.snapshot().await {
        Ok(pool) => {
            let cache = state.cache.stats().await;
            (
                StatusCode::OK,
                Json(json!({
                    "sessions": state.sessions.len(),
                    "pool": pool,
                    "cache": cache,
                })),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

fn to_ws_message(outgoing: &Outgoing) -> Message {
    if outgoing.binary {
        return Message::Binary(outgoing.payload.clone());
    }
    match std::str::from_utf8(&outgoing.payload) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => {
            log::warn!("Text frame of {} bytes is not valid UTF-8; sending as binary.", outgoing.payload.len());
            Message::Binary(outgoing.payload.clone())
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session_id, mut outgoing_rx) = state.sessions.register();
    let mut shutdown_rx = state.shutdown.subscribe();
    let (mut sender, mut receiver) = socket.split();
    log::info!("Session {} connected", session_id);

    loop {
        tokio::select! {
            // Handle incoming messages from the viewer
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => state.sessions.forward(session_id, text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => state.sessions.forward(session_id, &data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Session {} read error: {}", session_id, e);
                        break;
                    }
                }
            }
            // Frames published by the broadcaster
            Some(outgoing) = outgoing_rx.recv() => {
                let result = sender.send(to_ws_message(&outgoing)).await;
                // The write is done (or failed); this session's share of the slot goes.
                drop(outgoing);
                if let Err(e) = result {
                    log::debug!("Session {} write error: {}", session_id, e);
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.sessions.unregister(session_id);
    // Frames still queued for this session release their slots here.
    outgoing_rx.close();
    while outgoing_rx.try_recv().is_ok() {}
    log::info!("Session {} disconnected", session_id);
}
