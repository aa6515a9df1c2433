//! HTTP surface: the three WebSocket endpoints, health, uploads and the
//! optional static page directory.

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        DefaultBodyLimit, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing, Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tower_http::services::ServeDir;

use crate::{
    connection::{ConnectionHandle, Outbound},
    events::{ControlNotice, NoticeSender},
    hub::Hub,
    registry::SessionKind,
    routing::{AgentLink, Link, SessionLink},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Telegram refuses bot uploads above 50 MB, so there is no point accepting more.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
struct RelayApiState {
    hub: Arc<Hub>,
    notices: NoticeSender,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn relay_api_router(
    hub: Arc<Hub>,
    notices: NoticeSender,
    static_dir: Option<PathBuf>,
) -> Router {
    let state = RelayApiState { hub, notices };

    let router = Router::new()
        .route("/health", routing::get(relay_api_health))
        .route(
            "/upload",
            routing::post(relay_api_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/ws/agent", routing::get(relay_api_agent_ws))
        .route("/ws/shell", routing::get(relay_api_shell_ws))
        .route("/ws/files", routing::get(relay_api_files_ws))
        .with_state(state);

    match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn relay_api_health(State(state): State<RelayApiState>) -> Json<Value> {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "service": "device-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "agents": stats.agents,
        "sessions": stats.shell_sessions + stats.file_sessions,
        "pending": stats.pending_commands,
        "shellSessions": stats.shell_sessions,
        "fileSessions": stats.file_sessions,
        "pendingCommands": stats.pending_commands,
    }))
}

async fn relay_api_upload(
    State(state): State<RelayApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };
    let (Some(source), Some(filename)) = (header("x-source-name"), header("x-filename")) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "x-source-name and x-filename headers are required",
            })),
        );
    };
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "empty upload"})),
        );
    }

    let size = body.len();
    tracing::info!(
        target = "device_relay::http",
        source = %source,
        filename = %filename,
        size,
        "upload received"
    );
    let notice = ControlNotice::Document {
        source,
        filename,
        bytes: body.to_vec(),
    };
    if state.notices.send(notice).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": "control channel unavailable"})),
        );
    }
    (StatusCode::OK, Json(json!({"success": true, "size": size})))
}

async fn relay_api_agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<RelayApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let (connection, outbound) = ConnectionHandle::new();
        run_socket(socket, state.hub, AgentLink::new(connection), outbound)
    })
}

async fn relay_api_shell_ws(
    ws: WebSocketUpgrade,
    State(state): State<RelayApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let (connection, outbound) = ConnectionHandle::new();
        run_socket(
            socket,
            state.hub,
            SessionLink::new(SessionKind::Shell, connection),
            outbound,
        )
    })
}

async fn relay_api_files_ws(
    ws: WebSocketUpgrade,
    State(state): State<RelayApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let (connection, outbound) = ConnectionHandle::new();
        run_socket(
            socket,
            state.hub,
            SessionLink::new(SessionKind::FileBrowser, connection),
            outbound,
        )
    })
}

// ---------------------------------------------------------------------------
// Socket loop
// ---------------------------------------------------------------------------

/// Pump one socket: a writer task drains the connection's outbound queue (and
/// keeps the socket alive with pings) while this task feeds text frames to the
/// link. Either side ending tears the other down.
async fn run_socket<L: Link>(
    socket: WebSocket,
    hub: Arc<Hub>,
    mut link: L,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
) {
    let connection_id = link.connection().id();
    tracing::debug!(target = "device_relay::http", connection = %connection_id, "socket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(Outbound::Frame(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { reason }) => {
                        let frame = CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        let _ = ws_tx.flush().await;
                        break;
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => link.handle_text(&hub, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(
                        target = "device_relay::http",
                        connection = %connection_id,
                        error = %error,
                        "socket read failed"
                    );
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    link.closed(&hub);
    writer.abort();
    tracing::debug!(target = "device_relay::http", connection = %connection_id, "socket disconnected");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::relay_api_router;
    use crate::{
        connection::ConnectionHandle,
        events::{notice_channel, ControlNotice, EventEmitter, NoticeReceiver},
        hub::Hub,
    };

    fn test_router() -> (axum::Router, Arc<Hub>, NoticeReceiver) {
        let (tx, rx) = notice_channel();
        let hub = Arc::new(Hub::new(None, tx.clone(), EventEmitter::new(false)));
        (relay_api_router(hub.clone(), tx, None), hub, rx)
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&body).expect("response body should be json")
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (router, hub, _rx) = test_router();
        let (conn, _out) = ConnectionHandle::new();
        hub.register_agent("a1", "Pixel", conn);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "device-relay");
        assert_eq!(body["agents"], 1);
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["pending"], 0);
    }

    #[tokio::test]
    async fn upload_without_headers_is_rejected() {
        let (router, _hub, mut rx) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/upload")
                    .method("POST")
                    .header("x-filename", "log.txt")
                    .body(Body::from("hello"))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["success"], false);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn upload_becomes_document_notice() {
        let (router, _hub, mut rx) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/upload")
                    .method("POST")
                    .header("x-source-name", "Pixel")
                    .header("x-filename", "log.txt")
                    .body(Body::from("line one\n"))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            rx.try_recv().unwrap(),
            ControlNotice::Document {
                source: "Pixel".into(),
                filename: "log.txt".into(),
                bytes: b"line one\n".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404_without_static_dir() {
        let (router, _hub, _rx) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/shell.html")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let (router, _hub, _rx) = test_router();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/ws/agent")
                    .method("GET")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_ne!(response.status(), StatusCode::OK);
    }
}
