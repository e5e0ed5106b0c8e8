//! HTTP listener: `POST /`, an SSE task-event stream, a polling result
//! endpoint, cancellation, and a status probe.

use crate::{Handler, Listener, ListenerInfo, TaskEvent};
use async_trait::async_trait;
use awcp_error::{AwcpError, AwcpErrorDto, ErrorCode};
use awcp_protocol::AwcpMessage;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Json, Router,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt as _;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};
use uuid::Uuid;

/// Default per-request timeout for this listener.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct ApiError(AwcpError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::WorkspaceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Declined | ErrorCode::AuthFailed => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": AwcpErrorDto::from(&self.0) }))).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    handler: Arc<dyn Handler>,
}

/// A plain HTTP listener bound to a fixed address.
pub struct HttpListener {
    bind: SocketAddr,
    running: Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl HttpListener {
    /// Construct a listener bound to `bind` once started.
    #[must_use]
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            running: Mutex::new(None),
        }
    }

    /// Build the router for this listener, exposed for embedding in a
    /// larger app (e.g. the daemon binary) or for tests.
    #[must_use]
    pub fn router(handler: Arc<dyn Handler>) -> Router {
        Router::new()
            .route("/", post(handle_message))
            .route("/tasks/{id}/events", get(task_events))
            .route("/tasks/{id}/result", get(task_result))
            .route("/cancel/{id}", post(cancel))
            .route("/status", get(status))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(on_request_timeout))
                    .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
            )
            .with_state(AppState { handler })
    }
}

#[async_trait]
impl Listener for HttpListener {
    async fn start(&self, handler: Arc<dyn Handler>) -> Result<ListenerInfo, AwcpError> {
        let listener = TokioTcpListener::bind(self.bind).await.map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, format!("bind HTTP listener on {}", self.bind)).with_source(e)
        })?;
        let addr = listener.local_addr().map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "read bound HTTP listener address").with_source(e)
        })?;

        let app = Self::router(handler);
        let shutdown = Arc::new(Notify::new());
        let shutdown_signal = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal.notified().await;
                })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP listener exited with an error");
            }
        });

        *self.running.lock().await = Some((handle, shutdown));
        info!(%addr, "HTTP listener started");
        Ok(ListenerInfo {
            kind: "http",
            public_url: Some(format!("http://{addr}")),
        })
    }

    async fn stop(&self) {
        if let Some((handle, shutdown)) = self.running.lock().await.take() {
            shutdown.notify_waiters();
            let _ = handle.await;
        }
    }
}

async fn on_request_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({ "error": { "code": "timeout", "message": format!("request exceeded {REQUEST_TIMEOUT:?}") } })),
        )
            .into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": { "message": err.to_string() } }))).into_response()
    }
}

async fn handle_message(
    State(state): State<AppState>,
    Json(msg): Json<AwcpMessage>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.handler.handle_message(msg).await {
        Ok(Some(reply)) => Ok(Json(serde_json::to_value(reply).unwrap_or(json!({ "ok": true })))),
        Ok(None) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Err(ApiError(e)),
    }
}

async fn task_events(
    AxPath(id): AxPath<Uuid>,
    State(state): State<AppState>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let events = state.handler.subscribe_task(id).await.map_err(ApiError)?;
    let stream = events.map(|event: TaskEvent| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(data))
    });
    Ok(Sse::new(stream))
}

async fn task_result(
    AxPath(id): AxPath<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.handler.get_task_result(id).await.map_err(ApiError)?;
    Ok(Json(serde_json::to_value(view).unwrap_or(json!({}))))
}

async fn cancel(AxPath(id): AxPath<Uuid>, State(state): State<AppState>) -> Response {
    if state.handler.cancel_delegation(id).await {
        Json(json!({ "ok": true, "cancelled": true })).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "ok": false, "cancelled": false }))).into_response()
    }
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.handler.get_status().await;
    Json(serde_json::to_value(report).unwrap_or(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StatusReport, TaskResultView};
    use futures::stream::{self, BoxStream};
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct StubHandler {
        cancelled: AtomicU32,
    }

    #[async_trait]
    impl Handler for StubHandler {
        async fn handle_message(&self, msg: AwcpMessage) -> Result<Option<AwcpMessage>, AwcpError> {
            Ok(Some(AwcpMessage::error(msg.delegation_id(), ErrorCode::Declined, "stub")))
        }

        async fn subscribe_task(&self, _id: Uuid) -> Result<BoxStream<'static, TaskEvent>, AwcpError> {
            Ok(Box::pin(stream::iter(vec![TaskEvent::Progress {
                message: "working".into(),
            }])))
        }

        async fn get_task_result(&self, _id: Uuid) -> Result<TaskResultView, AwcpError> {
            Ok(TaskResultView {
                status: "running".into(),
                message: None,
            })
        }

        async fn cancel_delegation(&self, _id: Uuid) -> bool {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn get_status(&self) -> StatusReport {
            StatusReport {
                active: 0,
                uptime_seconds: 1,
            }
        }
    }

    #[tokio::test]
    async fn status_route_returns_report() {
        let handler: Arc<dyn Handler> = Arc::new(StubHandler::default());
        let app = HttpListener::router(handler);

        let response = tower::ServiceExt::oneshot(
            app,
            axum::http::Request::builder()
                .uri("/status")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["active"], 0);
    }

    #[tokio::test]
    async fn cancel_route_invokes_handler() {
        let handler = Arc::new(StubHandler::default());
        let app = HttpListener::router(handler.clone());
        let id = Uuid::new_v4();

        let response = tower::ServiceExt::oneshot(
            app,
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/cancel/{id}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(handler.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_route_returns_not_found_for_unknown_id() {
        #[derive(Default)]
        struct UnknownHandler;

        #[async_trait]
        impl Handler for UnknownHandler {
            async fn handle_message(&self, msg: AwcpMessage) -> Result<Option<AwcpMessage>, AwcpError> {
                Ok(Some(AwcpMessage::error(msg.delegation_id(), ErrorCode::Declined, "stub")))
            }

            async fn subscribe_task(&self, _id: Uuid) -> Result<BoxStream<'static, TaskEvent>, AwcpError> {
                Ok(Box::pin(stream::iter(vec![])))
            }

            async fn get_task_result(&self, _id: Uuid) -> Result<TaskResultView, AwcpError> {
                Err(AwcpError::new(ErrorCode::WorkspaceNotFound, "unknown"))
            }

            async fn cancel_delegation(&self, _id: Uuid) -> bool {
                false
            }

            async fn get_status(&self) -> StatusReport {
                StatusReport {
                    active: 0,
                    uptime_seconds: 1,
                }
            }
        }

        let handler: Arc<dyn Handler> = Arc::new(UnknownHandler);
        let app = HttpListener::router(handler);
        let id = Uuid::new_v4();

        let response = tower::ServiceExt::oneshot(
            app,
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/cancel/{id}"))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_exceeding_the_timeout_gets_a_408() {
        #[derive(Default)]
        struct SlowHandler;

        #[async_trait]
        impl Handler for SlowHandler {
            async fn handle_message(&self, _msg: AwcpMessage) -> Result<Option<AwcpMessage>, AwcpError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(None)
            }

            async fn subscribe_task(&self, _id: Uuid) -> Result<BoxStream<'static, TaskEvent>, AwcpError> {
                Ok(Box::pin(stream::iter(vec![])))
            }

            async fn get_task_result(&self, _id: Uuid) -> Result<TaskResultView, AwcpError> {
                Err(AwcpError::new(ErrorCode::WorkspaceNotFound, "unknown"))
            }

            async fn cancel_delegation(&self, _id: Uuid) -> bool {
                false
            }

            async fn get_status(&self) -> StatusReport {
                StatusReport {
                    active: 0,
                    uptime_seconds: 1,
                }
            }
        }

        let handler: Arc<dyn Handler> = Arc::new(SlowHandler);
        let app = Router::new()
            .route("/", post(handle_message))
            .layer(
                ServiceBuilder::new()
                    .layer(HandleErrorLayer::new(on_request_timeout))
                    .layer(TimeoutLayer::new(Duration::from_millis(10))),
            )
            .with_state(AppState { handler });

        let response = tower::ServiceExt::oneshot(
            app,
            axum::http::Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    serde_json::to_vec(&AwcpMessage::error(Uuid::new_v4(), ErrorCode::Declined, "x")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
