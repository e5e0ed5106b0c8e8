// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Embedded control-plane daemon: wires whichever of the Delegator and
//! Executor engines this process hosts to an `awcp-listener`, answering
//! task-event subscriptions, result polling, cancellation, and status.

use async_trait::async_trait;
use awcp_core::{AssignmentState, DelegationState, RecordedError};
use awcp_delegator::DelegatorEngine;
use awcp_error::{AwcpError, ErrorCode};
use awcp_executor::ExecutorEngine;
use awcp_listener::{Handler, StatusReport, TaskEvent, TaskResultView};
use awcp_protocol::{AuthInfo, AwcpMessage, PROTOCOL_VERSION};
use futures::stream::{self, BoxStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared state backing the daemon's listener(s). A process may host a
/// Delegator engine, an Executor engine, or both, depending on which
/// configuration files `main` loaded.
#[derive(Clone)]
pub struct AppState {
    delegator: Option<Arc<DelegatorEngine>>,
    executor: Option<Arc<ExecutorEngine>>,
    /// Fallback Delegator callback URL used when an inbound INVITE's
    /// `auth.metadata` doesn't carry one, for simple 1:1 deployments.
    default_peer_url: Option<String>,
    started_at: Instant,
}

impl AppState {
    /// Build the shared state. At least one of `delegator`/`executor`
    /// should be `Some`, or this process has nothing to do.
    #[must_use]
    pub fn new(
        delegator: Option<Arc<DelegatorEngine>>,
        executor: Option<Arc<ExecutorEngine>>,
        default_peer_url: Option<String>,
    ) -> Self {
        Self {
            delegator,
            executor,
            default_peer_url,
            started_at: Instant::now(),
        }
    }

    /// The Delegator engine this process hosts, if any.
    #[must_use]
    pub fn delegator(&self) -> Option<&Arc<DelegatorEngine>> {
        self.delegator.as_ref()
    }

    /// The Executor engine this process hosts, if any.
    #[must_use]
    pub fn executor(&self) -> Option<&Arc<ExecutorEngine>> {
        self.executor.as_ref()
    }
}

fn peer_url_from_auth(auth: &Option<AuthInfo>, fallback: Option<&str>) -> Option<String> {
    if let Some(auth) = auth {
        if let Some(url) = auth.metadata.get("callbackUrl").and_then(|v| v.as_str()) {
            return Some(url.to_string());
        }
    }
    fallback.map(str::to_string)
}

fn delegation_terminal_message(d: &awcp_core::Delegation) -> Option<AwcpMessage> {
    match d.state {
        DelegationState::Completed => d.result.as_ref().map(|r| AwcpMessage::Done {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: d.id,
            final_summary: r.summary.clone(),
            highlights: r.highlights.clone(),
            notes: r.notes.clone(),
            snapshot: None,
        }),
        DelegationState::Error | DelegationState::Cancelled | DelegationState::Expired => {
            Some(error_message(d.id, d.error.clone()))
        }
        _ => None,
    }
}

fn assignment_terminal_message(a: &awcp_core::Assignment) -> Option<AwcpMessage> {
    match a.state {
        AssignmentState::Completed => a.result.as_ref().map(|r| AwcpMessage::Done {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: a.id,
            final_summary: r.summary.clone(),
            highlights: r.highlights.clone(),
            notes: r.notes.clone(),
            snapshot: None,
        }),
        AssignmentState::Error => Some(error_message(a.id, a.error.clone())),
        _ => None,
    }
}

fn error_message(delegation_id: Uuid, recorded: Option<RecordedError>) -> AwcpMessage {
    let err = recorded.unwrap_or(RecordedError {
        code: ErrorCode::Cancelled,
        message: "terminated without a recorded error".into(),
        hint: None,
    });
    AwcpMessage::Error {
        version: PROTOCOL_VERSION.to_string(),
        delegation_id,
        code: err.code,
        message: err.message,
        hint: err.hint,
    }
}

#[async_trait]
impl Handler for AppState {
    async fn handle_message(&self, msg: AwcpMessage) -> Result<Option<AwcpMessage>, AwcpError> {
        match msg {
            AwcpMessage::Invite {
                delegation_id,
                task,
                lease,
                environment,
                auth,
                ..
            } => {
                let executor = self.executor.as_ref().ok_or_else(|| {
                    AwcpError::new(ErrorCode::SetupFailed, "this daemon has no Executor engine configured")
                })?;
                let peer_url = peer_url_from_auth(&auth, self.default_peer_url.as_deref()).ok_or_else(|| {
                    AwcpError::new(ErrorCode::SetupFailed, "no Delegator callback URL for this INVITE")
                })?;
                let invite = awcp_core::InviteSnapshot { task, lease, environment };
                executor.on_invite(delegation_id, peer_url, invite).await?;
                Ok(None)
            }
            AwcpMessage::Start {
                delegation_id,
                lease,
                work_dir,
                ..
            } => {
                let executor = self.executor.as_ref().ok_or_else(|| {
                    AwcpError::new(ErrorCode::SetupFailed, "this daemon has no Executor engine configured")
                })?;
                let peer_url = self
                    .default_peer_url
                    .clone()
                    .ok_or_else(|| AwcpError::new(ErrorCode::SetupFailed, "no Delegator callback URL for START"))?;
                executor.on_start(delegation_id, peer_url, lease, work_dir).await?;
                Ok(None)
            }
            AwcpMessage::Accept {
                delegation_id,
                executor_work_dir,
                executor_constraints,
                ..
            } => {
                let delegator = self.delegator.as_ref().ok_or_else(|| {
                    AwcpError::new(ErrorCode::SetupFailed, "this daemon has no Delegator engine configured")
                })?;
                delegator.on_accept(delegation_id, executor_work_dir, executor_constraints).await?;
                Ok(None)
            }
            AwcpMessage::Done {
                delegation_id,
                final_summary,
                highlights,
                notes,
                ..
            } => {
                let delegator = self.delegator.as_ref().ok_or_else(|| {
                    AwcpError::new(ErrorCode::SetupFailed, "this daemon has no Delegator engine configured")
                })?;
                delegator.on_done(delegation_id, final_summary, highlights, notes).await?;
                Ok(None)
            }
            AwcpMessage::Error {
                delegation_id,
                code,
                message,
                hint,
                ..
            } => {
                if let Some(delegator) = &self.delegator {
                    delegator.on_error(delegation_id, code, message, hint).await;
                } else if let Some(executor) = &self.executor {
                    executor.cancel_delegation(delegation_id).await;
                } else {
                    warn!(%delegation_id, "received ERROR with no engine configured to handle it");
                }
                Ok(None)
            }
        }
    }

    async fn subscribe_task(&self, id: Uuid) -> Result<BoxStream<'static, TaskEvent>, AwcpError> {
        if let Some(delegator) = &self.delegator {
            if delegator.get_delegation(id).await.is_ok() {
                let delegator = Arc::clone(delegator);
                return Ok(Box::pin(stream::unfold(
                    (delegator, id, false),
                    |(delegator, id, done)| async move {
                        if done {
                            return None;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                        let d = delegator.get_delegation(id).await.ok()?;
                        match delegation_terminal_message(&d) {
                            Some(message) => Some((TaskEvent::Terminal { message }, (delegator, id, true))),
                            None => Some((
                                TaskEvent::Progress {
                                    message: format!("{:?}", d.state),
                                },
                                (delegator, id, false),
                            )),
                        }
                    },
                )));
            }
        }
        if let Some(executor) = &self.executor {
            if executor.get_assignment(id).await.is_ok() {
                let executor = Arc::clone(executor);
                return Ok(Box::pin(stream::unfold(
                    (executor, id, false),
                    |(executor, id, done)| async move {
                        if done {
                            return None;
                        }
                        tokio::time::sleep(POLL_INTERVAL).await;
                        let a = executor.get_assignment(id).await.ok()?;
                        match assignment_terminal_message(&a) {
                            Some(message) => Some((TaskEvent::Terminal { message }, (executor, id, true))),
                            None => Some((
                                TaskEvent::Progress {
                                    message: format!("{:?}", a.state),
                                },
                                (executor, id, false),
                            )),
                        }
                    },
                )));
            }
        }
        Err(AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown delegation {id}")))
    }

    async fn get_task_result(&self, id: Uuid) -> Result<TaskResultView, AwcpError> {
        if let Some(delegator) = &self.delegator {
            if let Ok(d) = delegator.get_delegation(id).await {
                let message = delegation_terminal_message(&d);
                let status = if message.is_some() {
                    if matches!(d.state, DelegationState::Completed) {
                        "completed"
                    } else {
                        "error"
                    }
                } else {
                    "running"
                };
                return Ok(TaskResultView {
                    status: status.into(),
                    message,
                });
            }
        }
        if let Some(executor) = &self.executor {
            if let Ok(a) = executor.get_assignment(id).await {
                let message = assignment_terminal_message(&a);
                let status = if message.is_some() {
                    if matches!(a.state, AssignmentState::Completed) {
                        "completed"
                    } else {
                        "error"
                    }
                } else {
                    "running"
                };
                return Ok(TaskResultView {
                    status: status.into(),
                    message,
                });
            }
        }
        Err(AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown delegation {id}")))
    }

    async fn cancel_delegation(&self, id: Uuid) -> bool {
        let mut known = false;
        if let Some(delegator) = self.delegator.clone() {
            if delegator.get_delegation(id).await.is_ok() {
                known = true;
                delegator.cancel(id).await;
            }
        }
        if let Some(executor) = self.executor.clone() {
            if executor.get_assignment(id).await.is_ok() {
                known = true;
                // `cancel_delegation` blocks for the cancellation grace window;
                // run it in the background so the caller gets an immediate ack.
                tokio::spawn(async move { executor.cancel_delegation(id).await });
            }
        }
        known
    }

    async fn get_status(&self) -> StatusReport {
        let mut active = 0u32;
        if let Some(delegator) = &self.delegator {
            active += delegator.active_count().await;
        }
        if let Some(executor) = &self.executor {
            active += executor.active_count().await;
        }
        StatusReport {
            active,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// A no-op [`awcp_executor::TaskRunner`] that immediately reports success.
/// The real task runner is an opaque capability the deployment composes in
/// (see `awcp_executor::TaskRunner`); this stub lets the daemon start and
/// answer the protocol without one wired in yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTaskRunner;

#[async_trait]
impl awcp_executor::TaskRunner for EchoTaskRunner {
    async fn run(
        &self,
        ctx: awcp_executor::TaskContext,
        _cancel: awcp_executor::CancellationSignal,
    ) -> Result<awcp_core::DelegationResult, AwcpError> {
        Ok(awcp_core::DelegationResult {
            summary: format!("acknowledged: {}", ctx.task.description),
            highlights: Vec::new(),
            notes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::ErrorCode as CoreErrorCode;

    #[test]
    fn peer_url_prefers_auth_metadata_over_fallback() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("callbackUrl".into(), serde_json::json!("http://delegator.example/"));
        let auth = Some(AuthInfo {
            auth_type: "bearer".into(),
            credential: "token".into(),
            metadata,
        });
        assert_eq!(
            peer_url_from_auth(&auth, Some("http://fallback.example/")),
            Some("http://delegator.example/".to_string())
        );
    }

    #[test]
    fn peer_url_falls_back_when_auth_absent() {
        assert_eq!(
            peer_url_from_auth(&None, Some("http://fallback.example/")),
            Some("http://fallback.example/".to_string())
        );
        assert_eq!(peer_url_from_auth(&None, None), None);
    }

    #[test]
    fn error_message_falls_back_to_a_synthetic_reason_when_unrecorded() {
        let msg = error_message(Uuid::new_v4(), None);
        let AwcpMessage::Error { code, .. } = msg else {
            panic!("expected Error message");
        };
        assert_eq!(code, CoreErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn get_status_reports_zero_with_no_engines_configured() {
        let state = AppState::new(None, None, None);
        let report = state.get_status().await;
        assert_eq!(report.active, 0);
    }

    #[tokio::test]
    async fn subscribe_task_errors_for_an_unknown_delegation() {
        let state = AppState::new(None, None, None);
        let err = state.subscribe_task(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkspaceNotFound);
    }

    #[derive(Default)]
    struct MockOutbound;

    #[async_trait]
    impl awcp_delegator::OutboundChannel for MockOutbound {
        async fn send(&self, _peer_url: &str, _msg: &AwcpMessage) -> Result<(), AwcpError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn get_task_result_reports_running_before_a_terminal_message() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"hi").unwrap();
        let staging = tempfile::tempdir().unwrap();

        let delegator = Arc::new(DelegatorEngine::new(
            awcp_environment::EnvironmentManager::new(staging.path().join("envs")),
            awcp_admission::AdmissionController::new(awcp_admission::AdmissionPolicy::default()),
            Arc::new(awcp_transport::archive::ArchiveDelegatorTransport::default()),
            Arc::new(MockOutbound),
            awcp_delegator::SnapshotPolicy::Auto,
        ));

        let id = delegator
            .delegate(awcp_delegator::DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: awcp_core::EnvironmentSpec::new(vec![awcp_core::Resource::fs(
                    "workspace",
                    source.path().to_string_lossy(),
                    awcp_core::AccessMode::Rw,
                )])
                .unwrap(),
                task: awcp_core::TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: awcp_core::LeaseConfig {
                    ttl_seconds: 60,
                    access_mode: awcp_core::AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        let state = AppState::new(Some(delegator), None, None);
        let view = state.get_task_result(id).await.unwrap();
        assert_eq!(view.status, "running");
    }
}
