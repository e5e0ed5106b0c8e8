// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-listener
#![deny(unsafe_code)]
//!
//! Listener abstraction: something that accepts inbound [`AwcpMessage`]s and
//! exposes a task-event stream. Two reference implementations are provided:
//! [`HttpListener`] (plain HTTP + SSE) and [`WsTunnelListener`] (an outbound
//! WebSocket reverse tunnel through a broker, for Executors without an
//! inbound port).

pub mod http;
pub mod ws_tunnel;

use async_trait::async_trait;
use awcp_error::AwcpError;
use awcp_protocol::AwcpMessage;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use http::HttpListener;
pub use ws_tunnel::WsTunnelListener;

/// One update on a delegation's task-event stream. Totally ordered and
/// delivered at most once per subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskEvent {
    /// Free-form progress update.
    Progress {
        /// Human-readable progress message.
        message: String,
    },
    /// The delegation reached a terminal state; no further events follow.
    Terminal {
        /// The terminal message (DONE or ERROR).
        message: AwcpMessage,
    },
}

/// Current disposition of a delegation/assignment, for `GET .../result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultView {
    /// `"running"`, `"completed"`, or `"error"`. `"not_applicable"` and
    /// `"not_found"` are never produced here: an unknown id is surfaced as
    /// an `Err` instead, turned into a 404 by the listener.
    pub status: String,
    /// The terminal message, once available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<AwcpMessage>,
}

/// Summary counts for `GET /status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Number of non-terminal delegations/assignments.
    pub active: u32,
    /// Process uptime, in seconds.
    pub uptime_seconds: u64,
}

/// What a listener dispatches every inbound message and task-stream
/// subscription to. Implemented by whatever owns the Delegator/Executor
/// engine; kept here as a narrow trait so this crate never depends on
/// `awcp-delegator`/`awcp-executor` directly.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one inbound protocol message, returning a synchronous reply
    /// if the wire protocol defines one for this message kind.
    async fn handle_message(&self, msg: AwcpMessage) -> Result<Option<AwcpMessage>, AwcpError>;

    /// Subscribe to a delegation's task-event stream. The stream ends after
    /// its first [`TaskEvent::Terminal`] item.
    async fn subscribe_task(&self, id: Uuid) -> Result<BoxStream<'static, TaskEvent>, AwcpError>;

    /// Current result view for a delegation.
    async fn get_task_result(&self, id: Uuid) -> Result<TaskResultView, AwcpError>;

    /// Cancel a delegation. Idempotent. Returns `false` if `id` is unknown
    /// to every engine this process hosts.
    async fn cancel_delegation(&self, id: Uuid) -> bool;

    /// Summary status for this process.
    async fn get_status(&self) -> StatusReport;
}

/// What a [`Listener::start`] call reports back.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Listener kind, e.g. `"http"` or `"ws-tunnel"`.
    pub kind: &'static str,
    /// Externally reachable URL, if this listener has one (a tunnel only
    /// gets one once the broker completes the AUTH handshake).
    pub public_url: Option<String>,
}

/// A running or startable inbound channel for protocol messages.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Start serving, dispatching every inbound message to `handler`.
    async fn start(&self, handler: std::sync::Arc<dyn Handler>) -> Result<ListenerInfo, AwcpError>;

    /// Stop serving. Best-effort; safe to call on an already-stopped listener.
    async fn stop(&self);
}
