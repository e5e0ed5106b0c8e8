//! WebSocket reverse-tunnel listener: an outbound connection to a broker
//! that multiplexes virtual HTTP requests and SSE streams over a JSON frame
//! protocol, for Executors with no inbound port of their own.

use crate::{Handler, Listener, ListenerInfo, TaskEvent};
use async_trait::async_trait;
use awcp_error::{AwcpError, ErrorCode};
use awcp_protocol::AwcpMessage;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One frame of the broker<->listener tunnel protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelFrame {
    /// Client -> broker: authenticate the tunnel.
    Auth {
        /// Bearer token identifying this Executor to the broker.
        token: String,
    },
    /// Broker -> client: authentication accepted.
    AuthOk {
        /// Publicly reachable URL now routed to this tunnel.
        public_url: String,
    },
    /// Broker -> client: authentication rejected.
    AuthError {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// Broker -> client: a virtual HTTP request to answer.
    HttpRequest {
        /// Correlates with the matching `HttpResponse`.
        request_id: String,
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Request headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Request body, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Client -> broker: the answer to a `HttpRequest`.
    HttpResponse {
        /// Matches the originating `HttpRequest`.
        request_id: String,
        /// HTTP status code.
        status: u16,
        /// Response headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Response body, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// Broker -> client: open an SSE stream for `path`.
    SseOpen {
        /// Correlates this stream's subsequent events.
        stream_id: String,
        /// The SSE route being opened (e.g. a task-events path).
        path: String,
    },
    /// Client -> broker: one SSE event.
    SseEvent {
        /// Matches the originating `SseOpen`.
        stream_id: String,
        /// Event payload.
        data: serde_json::Value,
    },
    /// Client -> broker: the stream ended (terminal event delivered).
    SseEnd {
        /// Matches the originating `SseOpen`.
        stream_id: String,
    },
    /// Broker -> client: the subscriber disconnected; stop producing events.
    SseClose {
        /// Matches the originating `SseOpen`.
        stream_id: String,
    },
    /// Either direction: keepalive.
    Ping,
}

/// An outbound WebSocket tunnel to a broker.
pub struct WsTunnelListener {
    broker_url: String,
    auth_token: String,
    max_retries: u32,
    base_backoff: Duration,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTunnelListener {
    /// Construct a tunnel listener. `max_retries` bounds the linear-backoff
    /// reconnect loop; `base_backoff` is the per-attempt delay multiplier
    /// (`base_backoff * attempt`).
    #[must_use]
    pub fn new(broker_url: impl Into<String>, auth_token: impl Into<String>, max_retries: u32) -> Self {
        Self {
            broker_url: broker_url.into(),
            auth_token: auth_token.into(),
            max_retries,
            base_backoff: Duration::from_secs(1),
            stopped: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Override the per-attempt backoff multiplier (default 1s).
    #[must_use]
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }
}

#[async_trait]
impl Listener for WsTunnelListener {
    async fn start(&self, handler: Arc<dyn Handler>) -> Result<ListenerInfo, AwcpError> {
        self.stopped.store(false, Ordering::SeqCst);
        let broker_url = self.broker_url.clone();
        let auth_token = self.auth_token.clone();
        let max_retries = self.max_retries;
        let base_backoff = self.base_backoff;
        let stopped = Arc::clone(&self.stopped);

        let handle = tokio::spawn(async move {
            run_reconnect_loop(broker_url, auth_token, max_retries, base_backoff, stopped, handler).await;
        });
        *self.task.lock().await = Some(handle);

        Ok(ListenerInfo {
            kind: "ws-tunnel",
            public_url: None,
        })
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_reconnect_loop(
    broker_url: String,
    auth_token: String,
    max_retries: u32,
    base_backoff: Duration,
    stopped: Arc<AtomicBool>,
    handler: Arc<dyn Handler>,
) {
    let mut attempt: u32 = 0;
    while !stopped.load(Ordering::SeqCst) && attempt < max_retries {
        attempt += 1;
        match run_session(&broker_url, &auth_token, &handler, &stopped).await {
            Ok(()) => {
                info!("tunnel session ended cleanly");
                attempt = 0;
            }
            Err(e) => {
                warn!(error = %e, attempt, "tunnel session failed, reconnecting");
            }
        }
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(base_backoff * attempt.max(1)).await;
    }
}

async fn run_session(
    broker_url: &str,
    auth_token: &str,
    handler: &Arc<dyn Handler>,
    stopped: &Arc<AtomicBool>,
) -> Result<(), AwcpError> {
    let (stream, _response) = tokio_tungstenite::connect_async(broker_url)
        .await
        .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "connect to tunnel broker").with_context("cause", e.to_string()))?;
    let (write, mut read) = stream.split();
    let mut sender = FrameSender(Arc::new(Mutex::new(write)));

    let auth = TunnelFrame::Auth {
        token: auth_token.to_string(),
    };
    sender.send(&auth).await?;

    match next_frame(&mut read).await? {
        Some(TunnelFrame::AuthOk { public_url }) => {
            info!(%public_url, "tunnel authenticated");
        }
        Some(TunnelFrame::AuthError { reason }) => {
            return Err(AwcpError::new(ErrorCode::AuthFailed, reason));
        }
        other => {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                format!("expected AUTH_OK, got {other:?}"),
            ));
        }
    }

    // Streams this session opened, so they can be torn down on disconnect.
    let open_streams: Arc<Mutex<HashMap<String, JoinHandle<()>>>> = Arc::new(Mutex::new(HashMap::new()));

    while !stopped.load(Ordering::SeqCst) {
        let frame = match next_frame(&mut read).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(e),
        };

        match frame {
            TunnelFrame::HttpRequest {
                request_id,
                method,
                path,
                body,
                ..
            } => {
                let response = dispatch_http_request(handler, &method, &path, body).await;
                sender.send(&response_frame(request_id, response)).await?;
            }
            TunnelFrame::SseOpen { stream_id, path } => {
                let id = match parse_task_id(&path) {
                    Some(id) => id,
                    None => {
                        sender.send(&TunnelFrame::SseEnd { stream_id }).await?;
                        continue;
                    }
                };
                let handler = Arc::clone(handler);
                let stream_id_for_task = stream_id.clone();
                let forwarder = spawn_sse_forwarder(handler, id, stream_id_for_task, sender.clone());
                open_streams.lock().await.insert(stream_id, forwarder);
            }
            TunnelFrame::SseClose { stream_id } => {
                if let Some(handle) = open_streams.lock().await.remove(&stream_id) {
                    handle.abort();
                }
            }
            TunnelFrame::Ping => {
                sender.send(&TunnelFrame::Ping).await?;
            }
            other => {
                debug!(?other, "ignoring unexpected tunnel frame");
            }
        }
    }

    for (_, handle) in open_streams.lock().await.drain() {
        handle.abort();
    }
    Ok(())
}

fn parse_task_id(path: &str) -> Option<Uuid> {
    let id_segment = path.trim_start_matches("/tasks/").split('/').next()?;
    Uuid::parse_str(id_segment).ok()
}

async fn dispatch_http_request(
    handler: &Arc<dyn Handler>,
    method: &str,
    path: &str,
    body: Option<String>,
) -> Result<serde_json::Value, AwcpError> {
    if method.eq_ignore_ascii_case("POST") && path == "/" {
        let msg: AwcpMessage = serde_json::from_str(body.as_deref().unwrap_or("{}"))
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "decode tunneled message").with_context("cause", e.to_string()))?;
        return match handler.handle_message(msg).await? {
            Some(reply) => Ok(serde_json::to_value(reply).unwrap_or(serde_json::json!({}))),
            None => Ok(serde_json::json!({ "ok": true })),
        };
    }
    if method.eq_ignore_ascii_case("GET") && path.ends_with("/result") {
        if let Some(id) = parse_task_id(path) {
            let view = handler.get_task_result(id).await?;
            return Ok(serde_json::to_value(view).unwrap_or(serde_json::json!({})));
        }
    }
    if method.eq_ignore_ascii_case("POST") && path.starts_with("/cancel/") {
        if let Some(id) = Uuid::parse_str(path.trim_start_matches("/cancel/")).ok() {
            handler.cancel_delegation(id).await;
            return Ok(serde_json::json!({ "ok": true }));
        }
    }
    if method.eq_ignore_ascii_case("GET") && path == "/status" {
        return Ok(serde_json::to_value(handler.get_status().await).unwrap_or(serde_json::json!({})));
    }
    Err(AwcpError::new(ErrorCode::WorkspaceNotFound, format!("no route for {method} {path}")))
}

fn response_frame(request_id: String, result: Result<serde_json::Value, AwcpError>) -> TunnelFrame {
    match result {
        Ok(body) => TunnelFrame::HttpResponse {
            request_id,
            status: 200,
            headers: HashMap::new(),
            body: Some(body.to_string()),
        },
        Err(e) => TunnelFrame::HttpResponse {
            request_id,
            status: 500,
            headers: HashMap::new(),
            body: Some(serde_json::json!({ "error": e.message }).to_string()),
        },
    }
}

fn spawn_sse_forwarder(
    handler: Arc<dyn Handler>,
    id: Uuid,
    stream_id: String,
    mut sender: FrameSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = match handler.subscribe_task(id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(delegation_id = %id, error = %e, "failed to subscribe to task events");
                return;
            }
        };
        while let Some(event) = events.next().await {
            let is_terminal = matches!(event, TaskEvent::Terminal { .. });
            let data = serde_json::to_value(&event).unwrap_or(serde_json::json!({}));
            let frame = TunnelFrame::SseEvent {
                stream_id: stream_id.clone(),
                data,
            };
            if sender.send(&frame).await.is_err() {
                return;
            }
            if is_terminal {
                let _ = sender.send(&TunnelFrame::SseEnd { stream_id }).await;
                return;
            }
        }
    })
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// A cloneable handle to the write half, serialized behind a mutex so the
/// main session loop and every SSE forwarder task can share one socket.
#[derive(Clone)]
struct FrameSender(Arc<Mutex<WsSink>>);

impl FrameSender {
    async fn send(&mut self, frame: &TunnelFrame) -> Result<(), AwcpError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "encode tunnel frame").with_context("cause", e.to_string()))?;
        self.0
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "send tunnel frame").with_context("cause", e.to_string()))
    }
}

async fn next_frame(
    read: &mut futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) -> Result<Option<TunnelFrame>, AwcpError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = serde_json::from_str(&text).map_err(|e| {
                    AwcpError::new(ErrorCode::SetupFailed, "decode tunnel frame").with_context("cause", e.to_string())
                })?;
                return Ok(Some(frame));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(AwcpError::new(ErrorCode::SetupFailed, "tunnel read error").with_context("cause", e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_task_id_extracts_uuid_from_events_path() {
        let id = Uuid::new_v4();
        let path = format!("/tasks/{id}/events");
        assert_eq!(parse_task_id(&path), Some(id));
    }

    #[test]
    fn parse_task_id_rejects_malformed_path() {
        assert_eq!(parse_task_id("/tasks/not-a-uuid/events"), None);
    }

    #[test]
    fn tunnel_frame_round_trips_through_json() {
        let frame = TunnelFrame::AuthOk {
            public_url: "https://executor.example/tunnel/abc".into(),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("AUTH_OK"));
        let decoded: TunnelFrame = serde_json::from_str(&text).unwrap();
        matches!(decoded, TunnelFrame::AuthOk { .. });
    }
}
