// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-delegator
#![deny(unsafe_code)]
//!
//! The Delegator-side engine (`DelegatorEngine`): builds environments, runs
//! admission, hands off through a transport, and drives each [`Delegation`]
//! through its state machine in response to inbound ACCEPT/DONE/ERROR and
//! local cancellation/expiry.

use async_trait::async_trait;
use awcp_admission::{AdmissionController, DependencyCheck, NoDependency};
use awcp_core::{
    AccessMode, ActiveLease, Delegation, DelegationBuilder, DelegationResult, DelegationState,
    EnvironmentDeclaration, EnvironmentSpec, ExecutorConstraints, LeaseConfig, RecordedError,
    Snapshot, SnapshotLocation, SnapshotMetadataCounts, SnapshotStatus, TaskSpec,
};
use awcp_environment::EnvironmentManager;
use awcp_error::{AwcpError, ErrorCode};
use awcp_protocol::{AwcpMessage, ExecutorWorkDir, PROTOCOL_VERSION};
use awcp_transport::DelegatorTransport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// How a [`Snapshot`] produced by a snapshot-capable transport is applied
/// once DONE is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    /// Apply immediately on DONE.
    #[default]
    Auto,
    /// Leave `pending` for an explicit `apply_snapshot`/`discard_snapshot` call.
    Staged,
    /// Never apply.
    Discard,
}

/// Sends an [`AwcpMessage`] to the Executor peer a delegation is addressed
/// to. Implemented by whichever listener/HTTP-client the daemon wires in;
/// kept here as a trait so this crate never depends on a transport-layer
/// HTTP client directly.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Deliver `msg` to `peer_url`, awaiting the synchronous reply if the
    /// wire protocol defines one for this message kind (INVITE expects
    /// ACCEPT or ERROR back; this trait only does best-effort delivery —
    /// the reply itself arrives later through [`DelegatorEngine::on_accept`]
    /// et al., typically fed by a listener).
    async fn send(&self, peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError>;
}

/// Shell commands run around a delegation's lifecycle. Declared locally
/// (rather than reused from `awcp-config`) so this crate stays free of a
/// dependency on it.
#[derive(Debug, Clone, Default)]
pub struct DelegatorHooks {
    /// Run before admission is checked, on `delegate()`.
    pub pre_delegate: Option<String>,
    /// Run after a delegation reaches a terminal state.
    pub post_done: Option<String>,
}

async fn run_hook(command: &str, id: Uuid, which: &str) {
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("AWCP_DELEGATION_ID", id.to_string())
        .status()
        .await;
    match status {
        Ok(s) if s.success() => {}
        Ok(s) => warn!(delegation_id = %id, hook = which, status = %s, "hook exited non-zero"),
        Err(e) => warn!(delegation_id = %id, hook = which, error = %e, "failed to spawn hook"),
    }
}

/// Parameters for [`DelegatorEngine::delegate`].
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    /// Base URL of the Executor's listener.
    pub peer_url: String,
    /// The environment to hand off.
    pub environment: EnvironmentSpec,
    /// The task for the Executor's task runner.
    pub task: TaskSpec,
    /// The lease requested at INVITE time.
    pub lease: LeaseConfig,
}

struct Entry {
    delegation: Mutex<Delegation>,
    env_root: Mutex<Option<std::path::PathBuf>>,
}

/// Delegator-side engine: owns the delegation table and drives every
/// delegation's lifecycle.
pub struct DelegatorEngine {
    environment: EnvironmentManager,
    admission: AdmissionController,
    transport: Arc<dyn DelegatorTransport>,
    outbound: Arc<dyn OutboundChannel>,
    snapshot_policy: SnapshotPolicy,
    hooks: DelegatorHooks,
    delegations: RwLock<HashMap<Uuid, Arc<Entry>>>,
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
    /// Transport handles prepared at `delegate()` time, consumed by
    /// `on_accept` when building START. Indexed by delegation id.
    pending_handles: Mutex<HashMap<Uuid, awcp_core::TransportHandle>>,
}

impl DelegatorEngine {
    /// Construct a new engine. `environment`/`admission` are usually built
    /// from an [`awcp_config::DelegatorConfig`] by the daemon.
    pub fn new(
        environment: EnvironmentManager,
        admission: AdmissionController,
        transport: Arc<dyn DelegatorTransport>,
        outbound: Arc<dyn OutboundChannel>,
        snapshot_policy: SnapshotPolicy,
    ) -> Self {
        Self {
            environment,
            admission,
            transport,
            outbound,
            snapshot_policy,
            hooks: DelegatorHooks::default(),
            delegations: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            pending_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Configure the `preDelegate`/`postDone` hook commands.
    #[must_use]
    pub fn with_hooks(mut self, hooks: DelegatorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Number of delegations currently in a non-terminal state.
    pub async fn active_count(&self) -> u32 {
        let mut count = 0u32;
        for entry in self.delegations.read().await.values() {
            if !entry.delegation.lock().await.state.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Build the environment, run admission, create the record, prepare the
    /// transport, and send INVITE. Returns the new delegation id immediately;
    /// the rest of the lifecycle continues asynchronously via `on_accept`/
    /// `on_done`/`on_error`, driven by whatever listener relays those
    /// messages back.
    pub async fn delegate(&self, req: DelegateRequest) -> Result<Uuid, AwcpError> {
        let id = Uuid::new_v4();
        if let Some(command) = &self.hooks.pre_delegate {
            run_hook(command, id, "preDelegate").await;
        }

        let active = self.active_count().await;
        let stats = self.admission.check_delegate(
            active,
            &req.lease,
            &req.environment,
            &NoDependency as &dyn DependencyCheck,
        )?;
        debug!(
            total_bytes = stats.total_bytes,
            file_count = stats.file_count,
            "admission passed for new delegation"
        );

        let now = Utc::now();
        let built = self.environment.build(id, &req.environment, now)?;

        let mut delegation = DelegationBuilder::new(
            id,
            req.peer_url.clone(),
            req.environment.clone(),
            req.task.clone(),
            req.lease,
            now,
        )
        .build();

        let handle = match self.transport.prepare(id, &built.env_root, req.lease.ttl_seconds).await {
            Ok(h) => h,
            Err(e) => {
                self.environment.release(id);
                return Err(e);
            }
        };

        let invite = AwcpMessage::Invite {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: id,
            task: req.task,
            lease: req.lease,
            environment: EnvironmentDeclaration {
                resources: (&req.environment).into(),
                root: String::new(),
            },
            requirements: None,
            auth: None,
        };

        delegation
            .transition_to(DelegationState::Invited, now)
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))?;

        let entry = Arc::new(Entry {
            delegation: Mutex::new(delegation),
            env_root: Mutex::new(Some(built.env_root)),
        });
        self.delegations.write().await.insert(id, entry);

        if let Err(e) = self.outbound.send(&req.peer_url, &invite).await {
            warn!(delegation_id = %id, error = %e, "failed to deliver INVITE");
            self.fail(id, ErrorCode::SetupFailed, "failed to deliver INVITE", None)
                .await;
            return Err(e);
        }

        // Stash the handle for START once ACCEPT arrives.
        self.pending_handles.lock().await.insert(id, handle);
        Ok(id)
    }

    async fn entry(&self, id: Uuid) -> Result<Arc<Entry>, AwcpError> {
        self.delegations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown delegation {id}")))
    }

    /// Handle an inbound ACCEPT: patch the record, send START with the
    /// prepared handle and active lease, applying the stricter of the
    /// requested and Executor-tightened lease terms.
    pub async fn on_accept(
        &self,
        id: Uuid,
        executor_work_dir: ExecutorWorkDir,
        executor_constraints: Option<ExecutorConstraints>,
    ) -> Result<(), AwcpError> {
        let entry = self.entry(id).await?;
        let now = Utc::now();

        let handle = {
            let mut guard = self.pending_handles.lock().await;
            guard
                .remove(&id)
                .ok_or_else(|| AwcpError::new(ErrorCode::SetupFailed, "no prepared transport handle for delegation"))?
        };

        let (peer_url, lease) = {
            let mut d = entry.delegation.lock().await;
            d.transition_to(DelegationState::Accepted, now)
                .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))?;
            d.executor_work_dir = Some(executor_work_dir.path);
            d.executor_constraints = executor_constraints.clone();

            let mut ttl_seconds = d.lease_config.ttl_seconds;
            let mut access_mode = d.lease_config.access_mode;
            if let Some(c) = &executor_constraints {
                if let Some(max_ttl) = c.max_ttl_seconds {
                    ttl_seconds = ttl_seconds.min(max_ttl);
                }
                if let Some(accepted) = c.accepted_access_mode {
                    if accepted == AccessMode::Ro {
                        access_mode = AccessMode::Ro;
                    }
                }
            }
            let active_lease = ActiveLease {
                expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
                access_mode,
            };
            d.active_lease = Some(active_lease);
            d.transition_to(DelegationState::Started, now)
                .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))?;
            (d.peer_url.clone(), active_lease)
        };

        let start = AwcpMessage::Start {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: id,
            lease,
            work_dir: handle,
        };
        self.outbound.send(&peer_url, &start).await
    }

    /// Mark a started delegation as running once the Executor has signalled
    /// setup complete. Not a wire message of its own; driven by a listener
    /// observing the Executor's first task event.
    pub async fn on_setup_complete(&self, id: Uuid) -> Result<(), AwcpError> {
        let entry = self.entry(id).await?;
        let mut d = entry.delegation.lock().await;
        d.transition_to(DelegationState::Running, Utc::now())
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))
    }

    /// Handle an inbound DONE: record the result, apply or stage a
    /// snapshot per policy, release transport and environment.
    pub async fn on_done(
        &self,
        id: Uuid,
        summary: String,
        highlights: Vec<String>,
        notes: Option<String>,
    ) -> Result<(), AwcpError> {
        let entry = self.entry(id).await?;
        let now = Utc::now();

        {
            let mut d = entry.delegation.lock().await;
            d.result = Some(DelegationResult {
                summary: summary.clone(),
                highlights: highlights.clone(),
                notes,
            });
            d.transition_to(DelegationState::Completed, now)
                .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))?;
        }

        if self.transport.capabilities().supports_snapshots {
            if let Some(env_root) = entry.env_root.lock().await.clone() {
                match self.transport.apply_result(id, &env_root).await {
                    Ok(changed_files) => {
                        let snapshot = Snapshot {
                            id: Uuid::new_v4(),
                            delegation_id: id,
                            summary,
                            highlights,
                            status: match self.snapshot_policy {
                                SnapshotPolicy::Auto => SnapshotStatus::Applied,
                                SnapshotPolicy::Staged => SnapshotStatus::Pending,
                                SnapshotPolicy::Discard => SnapshotStatus::Discarded,
                            },
                            location: SnapshotLocation::LocalPath(env_root.to_string_lossy().into_owned()),
                            metadata: SnapshotMetadataCounts {
                                file_count: changed_files.len() as u64,
                                total_bytes: 0,
                            },
                            changed_files,
                            created_at: now,
                            applied_at: matches!(self.snapshot_policy, SnapshotPolicy::Auto).then_some(now),
                        };
                        self.snapshots.write().await.insert(snapshot.id, snapshot);
                    }
                    Err(e) => warn!(delegation_id = %id, error = %e, "failed to apply transport result"),
                }
            }
        }

        self.release(id).await;

        if let Some(command) = &self.hooks.post_done {
            run_hook(command, id, "postDone").await;
        }
        Ok(())
    }

    /// Handle an inbound ERROR, or record a locally-detected failure.
    pub async fn on_error(&self, id: Uuid, code: ErrorCode, message: String, hint: Option<String>) {
        self.fail(id, code, message, hint).await;
    }

    async fn fail(&self, id: Uuid, code: ErrorCode, message: impl Into<String>, hint: Option<String>) {
        if let Ok(entry) = self.entry(id).await {
            let mut d = entry.delegation.lock().await;
            d.error = Some(RecordedError {
                code,
                message: message.into(),
                hint,
            });
            let _ = d.transition_to(DelegationState::Error, Utc::now());
        }
        self.release(id).await;
    }

    /// Cancel a delegation: idempotent, always succeeds. Sends ERROR(CANCELLED)
    /// best-effort if the delegation is non-terminal.
    pub async fn cancel(&self, id: Uuid) {
        let Ok(entry) = self.entry(id).await else {
            return;
        };
        let (was_terminal, peer_url) = {
            let d = entry.delegation.lock().await;
            (d.state.is_terminal(), d.peer_url.clone())
        };
        if was_terminal {
            return;
        }

        let _ = self
            .outbound
            .send(
                &peer_url,
                &AwcpMessage::Error {
                    version: PROTOCOL_VERSION.to_string(),
                    delegation_id: id,
                    code: ErrorCode::Cancelled,
                    message: "cancelled by Delegator".into(),
                    hint: None,
                },
            )
            .await;

        {
            let mut d = entry.delegation.lock().await;
            let _ = d.transition_to(DelegationState::Cancelled, Utc::now());
        }
        self.release(id).await;
    }

    /// Transition a delegation to `expired` if its active lease has lapsed.
    /// Intended to be polled by a background task.
    pub async fn expire_if_due(&self, id: Uuid, now: DateTime<Utc>) {
        let Ok(entry) = self.entry(id).await else {
            return;
        };
        let expired = {
            let d = entry.delegation.lock().await;
            d.active_lease.map(|l| l.is_expired_at(now)).unwrap_or(false)
        };
        if !expired {
            return;
        }
        let mut d = entry.delegation.lock().await;
        if d.transition_to(DelegationState::Expired, now).is_ok() {
            drop(d);
            self.release(id).await;
        }
    }

    async fn release(&self, id: Uuid) {
        self.transport.cleanup(id).await;
        self.environment.release(id);
        self.pending_handles.lock().await.remove(&id);
    }

    /// Snapshot of a delegation's current record, for status/read APIs.
    pub async fn get_delegation(&self, id: Uuid) -> Result<Delegation, AwcpError> {
        let entry = self.entry(id).await?;
        Ok(entry.delegation.lock().await.clone())
    }

    /// Poll [`Self::get_delegation`] until the delegation reaches a terminal
    /// state or `timeout_ms` elapses. A timeout surfaces as an error; it
    /// does not itself change the delegation's state.
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
        poll_ms: u64,
        timeout_ms: u64,
    ) -> Result<Delegation, AwcpError> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            let delegation = self.get_delegation(id).await?;
            if delegation.state.is_terminal() {
                return Ok(delegation);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AwcpError::new(
                    ErrorCode::Expired,
                    format!("delegation {id} did not complete within {timeout_ms}ms"),
                ));
            }
            tokio::time::sleep(std::time::Duration::from_millis(poll_ms)).await;
        }
    }

    /// Apply a `pending` snapshot. Idempotent: re-applying an already
    /// `applied` snapshot is a no-op.
    pub async fn apply_snapshot(&self, snapshot_id: Uuid) -> Result<(), AwcpError> {
        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .get_mut(&snapshot_id)
            .ok_or_else(|| AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown snapshot {snapshot_id}")))?;
        snapshot
            .apply(Utc::now())
            .map_err(|e| AwcpError::new(ErrorCode::TaskFailed, e.to_string()))
    }

    /// Discard a `pending` snapshot so it is never applied.
    pub async fn discard_snapshot(&self, snapshot_id: Uuid) -> Result<(), AwcpError> {
        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .get_mut(&snapshot_id)
            .ok_or_else(|| AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown snapshot {snapshot_id}")))?;
        if snapshot.status == SnapshotStatus::Pending {
            snapshot.status = SnapshotStatus::Discarded;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_admission::AdmissionPolicy;
    use awcp_core::{AccessMode, Resource};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockTransport {
        supports_snapshots: bool,
    }

    #[async_trait]
    impl DelegatorTransport for MockTransport {
        async fn prepare(
            &self,
            _id: Uuid,
            env_root: &std::path::Path,
            _ttl_seconds: u64,
        ) -> Result<awcp_core::TransportHandle, AwcpError> {
            Ok(awcp_core::TransportHandle::Archive {
                download_url: "https://example.invalid/download".into(),
                upload_url: "https://example.invalid/upload".into(),
                checksum: "deadbeef".into(),
                expires_at: Utc::now() + chrono::Duration::seconds(300),
                chunked: None,
                inline_base64: Some(env_root.to_string_lossy().into_owned()),
            })
        }

        async fn apply_result(&self, _id: Uuid, _dest_root: &std::path::Path) -> Result<Vec<String>, AwcpError> {
            Ok(vec!["out.txt".into()])
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_snapshots: self.supports_snapshots,
                live_sync: false,
            }
        }
    }

    #[derive(Default)]
    struct MockOutbound {
        sent: StdMutex<Vec<AwcpMessage>>,
    }

    #[async_trait]
    impl OutboundChannel for MockOutbound {
        async fn send(&self, _peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    fn test_env(dir: &std::path::Path) -> EnvironmentSpec {
        EnvironmentSpec::new(vec![Resource::fs("workspace", dir.to_string_lossy(), AccessMode::Rw)]).unwrap()
    }

    fn engine(
        staging: &std::path::Path,
        transport: Arc<dyn DelegatorTransport>,
        outbound: Arc<MockOutbound>,
    ) -> DelegatorEngine {
        DelegatorEngine::new(
            EnvironmentManager::new(staging.join("envs")),
            AdmissionController::new(AdmissionPolicy::default()),
            transport,
            outbound,
            SnapshotPolicy::Auto,
        )
    }

    #[tokio::test]
    async fn delegate_moves_to_invited_and_sends_invite() {
        let source = tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"hi").unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound.clone());

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 60,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        let delegation = engine.get_delegation(id).await.unwrap();
        assert_eq!(delegation.state, DelegationState::Invited);
        let sent = outbound.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "INVITE");
    }

    #[tokio::test]
    async fn on_accept_sends_start_and_transitions_to_started() {
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound.clone());

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 120,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        engine
            .on_accept(id, ExecutorWorkDir { path: "/work/abc".into() }, None)
            .await
            .unwrap();

        let delegation = engine.get_delegation(id).await.unwrap();
        assert_eq!(delegation.state, DelegationState::Started);
        assert_eq!(delegation.executor_work_dir.as_deref(), Some("/work/abc"));
        let sent = outbound.sent.lock().unwrap();
        assert_eq!(sent.last().unwrap().kind(), "START");
    }

    #[tokio::test]
    async fn on_accept_tightens_ttl_from_executor_constraints() {
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound);

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 3600,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        engine
            .on_accept(
                id,
                ExecutorWorkDir { path: "/work/abc".into() },
                Some(ExecutorConstraints {
                    accepted_access_mode: Some(AccessMode::Ro),
                    max_ttl_seconds: Some(60),
                    sandbox_profile: None,
                }),
            )
            .await
            .unwrap();

        let delegation = engine.get_delegation(id).await.unwrap();
        let lease = delegation.active_lease.unwrap();
        assert_eq!(lease.access_mode, AccessMode::Ro);
        assert!(lease.expires_at <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[tokio::test]
    async fn on_done_completes_and_stages_snapshot_when_supported() {
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let transport = Arc::new(MockTransport {
            supports_snapshots: true,
        });
        let engine = engine(staging.path(), transport, outbound);

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 60,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();
        engine
            .on_accept(id, ExecutorWorkDir { path: "/work/abc".into() }, None)
            .await
            .unwrap();

        engine
            .on_done(id, "did the thing".into(), vec!["note".into()], None)
            .await
            .unwrap();

        let delegation = engine.get_delegation(id).await.unwrap();
        assert_eq!(delegation.state, DelegationState::Completed);
        assert_eq!(delegation.result.unwrap().summary, "did the thing");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_sends_error_once() {
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound.clone());

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 60,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        engine.cancel(id).await;
        engine.cancel(id).await;

        let delegation = engine.get_delegation(id).await.unwrap();
        assert_eq!(delegation.state, DelegationState::Cancelled);
        let errors = outbound
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind() == "ERROR")
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn wait_for_completion_times_out_on_a_stuck_delegation() {
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound);

        let id = engine
            .delegate(DelegateRequest {
                peer_url: "https://executor.invalid".into(),
                environment: test_env(source.path()),
                task: TaskSpec {
                    description: "demo".into(),
                    prompt: "do the thing".into(),
                },
                lease: LeaseConfig {
                    ttl_seconds: 60,
                    access_mode: AccessMode::Rw,
                },
            })
            .await
            .unwrap();

        let err = engine.wait_for_completion(id, 10, 50).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Expired);
    }

    #[tokio::test]
    async fn apply_snapshot_is_idempotent() {
        let snapshot_id = Uuid::new_v4();
        let source = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let outbound = Arc::new(MockOutbound::default());
        let engine = engine(staging.path(), Arc::new(MockTransport::default()), outbound);
        engine.snapshots.write().await.insert(
            snapshot_id,
            Snapshot {
                id: snapshot_id,
                delegation_id: Uuid::new_v4(),
                summary: "s".into(),
                highlights: vec![],
                status: SnapshotStatus::Pending,
                location: SnapshotLocation::LocalPath(source.path().to_string_lossy().into_owned()),
                metadata: SnapshotMetadataCounts {
                    file_count: 0,
                    total_bytes: 0,
                },
                changed_files: vec![],
                created_at: Utc::now(),
                applied_at: None,
            },
        );

        engine.apply_snapshot(snapshot_id).await.unwrap();
        engine.apply_snapshot(snapshot_id).await.unwrap();
    }
}
