//! ==============================================================================
//! server.rs - viewer web server
//! ==============================================================================
//!
//! ```text
//! routes:
//!     GET /ws           websocket, one json text frame per telemetry event
//!     GET /api/health   status + connected viewer count
//!     GET /api/schema   sensor id -> field names, for labeling columns
//!     GET /*            dashboard files from server.static_dir
//!
//! per connection:
//!     register in the SubscriberRegistry, spawn a task that drains the
//!     subscriber queue into the socket (each write bounded by
//!     VIEWER_WRITE_TIMEOUT), and read inbound frames until the
//!     viewer goes away. viewers are read-only: inbound text is ignored.
//!     whichever side ends first tears the other down and the subscriber
//!     is removed.
//! ```
//!
//! ==============================================================================

use crate::registry::{SubscriberId, SubscriberRegistry};
use crate::schema::{SchemaTable, SensorSchema};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

/// a viewer that cannot take a frame within this long is dropped
pub const VIEWER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ServerState {
    pub registry: SubscriberRegistry,
    pub schema: SchemaTable,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub viewers: usize,
}

pub fn router(state: ServerState, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler))
        .route("/api/schema", get(schema_handler))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server<F>(
    bind: &str,
    state: ServerState,
    static_dir: &Path,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, static_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "viewer server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        viewers: state.registry.len().await,
    })
}

async fn schema_handler(State(state): State<ServerState>) -> Json<Vec<SensorSchema>> {
    Json(state.schema.describe())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn handle_socket(socket: WebSocket, registry: SubscriberRegistry) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber, mut frames) = registry.register().await;
    let id = subscriber.id();
    // only the registry keeps a sender, so removal ends `frames`
    drop(subscriber);

    let mut send_task = tokio::spawn(async move {
        forward_frames(&mut frames, &mut sender, id, VIEWER_WRITE_TIMEOUT).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.remove(id).await;
}

/// Drain a subscriber queue into a socket until the queue closes, a write
/// fails, or a write takes longer than `write_timeout`.
async fn forward_frames<S>(
    frames: &mut mpsc::Receiver<Arc<str>>,
    sender: &mut S,
    id: SubscriberId,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let write = sender.send(Message::Text(frame.to_string()));
        match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!(subscriber = id, "websocket send failed");
                return;
            }
            Err(_) => {
                tracing::warn!(subscriber = id, "websocket write timed out, dropping viewer");
                return;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sender.close()).await;
}
