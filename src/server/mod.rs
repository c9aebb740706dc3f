//! HTTP and WebSocket surface.
//!
//! `GET /agents/:session` upgrades to a WebSocket carrying one conversation:
//! text frames in, JSON protocol events out.

mod state;

pub use state::AppState;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::relay::ServerEvent;

/// Events buffered per connection before the relay waits on the socket.
const EVENT_BUFFER: usize = 64;

struct ServerError(anyhow::Error);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for ServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(reset_session));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/agents/:session", get(agent_socket))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(port, "port already in use, try `critic serve --port <PORT>`");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    info!("Server running on http://localhost:{}", port);
    info!("  WS     /agents/:session         - Conversation socket");
    info!("  GET    /api/sessions            - List sessions");
    info!("  GET    /api/sessions/:id        - Session snapshot");
    info!("  DELETE /api/sessions/:id        - Reset a session");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.store.list()?))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let session = state.store.get(&id).await?;
    Ok(Json(serde_json::json!({
        "id": id,
        "subject": session.subject,
        "history": session.history,
    })))
}

async fn reset_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    state.store.reset(&id).await?;
    info!(session = %id, "session reset via API");
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_socket(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, session_id, state))
}

/// Drive one client connection.
///
/// The reader forwards frames into a queue and cancels `closed` when the
/// client leaves; turns are taken from the queue one at a time; the writer
/// drains protocol events into the socket.
async fn run_connection(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let connection_id = uuid::Uuid::new_v4();
    info!(session = %session_id, %connection_id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(EVENT_BUFFER);
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<String>();
    let closed = CancellationToken::new();

    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = {
        let closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            closed.cancel();
        })
    };

    while let Some(message) = inbound_rx.recv().await {
        if closed.is_cancelled() {
            break;
        }
        match state
            .handler
            .handle(&session_id, &message, &event_tx, &closed)
            .await
        {
            Ok(report) => debug!(session = %session_id, ?report, "turn handled"),
            Err(e) => {
                error!(session = %session_id, error = %e, "turn aborted");
                let _ = event_tx.send(ServerEvent::error(e.to_string())).await;
            }
        }
    }

    drop(event_tx);
    let _ = writer.await;
    reader.abort();
    info!(session = %session_id, %connection_id, "client disconnected");
}
