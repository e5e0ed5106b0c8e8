// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-executor
#![deny(unsafe_code)]
//!
//! The Executor-side engine (`ExecutorEngine`): accepts INVITEs, sets up a
//! transport, runs a [`TaskRunner`] cooperatively cancellable on a grace
//! window, and reports DONE/ERROR back to the Delegator.

use async_trait::async_trait;
use awcp_admission::{AdmissionController, DependencyCheck};
use awcp_core::{
    Assignment, AssignmentState, DelegationResult, DeclaredResource, EnvironmentDeclaration,
    InviteSnapshot, RecordedError, TaskSpec,
};
use awcp_error::{AwcpError, ErrorCode};
use awcp_protocol::{AwcpMessage, ExecutorWorkDir, PROTOCOL_VERSION};
use awcp_transport::ExecutorTransport;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default grace period a cancelled runner is given before forced teardown.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Shell commands run after an assignment reaches a terminal state. Declared
/// locally (rather than reused from `awcp-config`) so this crate stays free
/// of a dependency on it.
#[derive(Debug, Clone, Default)]
pub struct ExecutorHooks {
    /// Run after an assignment finishes successfully.
    pub on_task_complete: Option<String>,
    /// Run after an assignment fails or expires.
    pub on_error: Option<String>,
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

/// A cooperative cancellation signal passed to a [`TaskRunner`]. Cloning
/// shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationSignal(Arc<CancellationInner>);

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    /// A fresh, not-yet-cancelled signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this signal cancelled and wake anyone awaiting it.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    /// Whether [`Self::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancelled; resolves immediately if already cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.0.notify.notified().await;
    }
}

/// Everything a [`TaskRunner`] needs to execute one assignment.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Delegation/assignment id.
    pub delegation_id: Uuid,
    /// Resolved work directory the runner should operate in.
    pub work_path: PathBuf,
    /// The task carried verbatim from INVITE.
    pub task: TaskSpec,
    /// The declared environment.
    pub environment: EnvironmentDeclaration,
}

/// Runs one assignment's task. Implementations should observe
/// `cancel.cancelled()` and return promptly once it resolves.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute the task, returning the result to report in DONE.
    async fn run(&self, ctx: TaskContext, cancel: CancellationSignal) -> Result<DelegationResult, AwcpError>;
}

/// Sends an [`AwcpMessage`] to the Delegator peer an assignment is
/// addressed to.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Deliver `msg` to `peer_url`.
    async fn send(&self, peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError>;
}

/// Resolve the work subdirectory the task runner should be given: the sole
/// resource's subdirectory if there is exactly one, else the first `rw`
/// resource in declared order, else the environment root itself.
#[must_use]
pub fn resolve_work_subdir(root: &Path, resources: &[DeclaredResource]) -> PathBuf {
    if let [only] = resources {
        return root.join(&only.name);
    }
    if let Some(rw) = resources.iter().find(|r| r.mode == awcp_core::AccessMode::Rw) {
        return root.join(&rw.name);
    }
    root.to_path_buf()
}

struct Entry {
    assignment: Mutex<Assignment>,
    cancel: CancellationSignal,
    retain_until: Mutex<Option<chrono::DateTime<Utc>>>,
}

/// Executor-side engine: owns the assignment table and drives each
/// assignment from INVITE through to its terminal state.
pub struct ExecutorEngine {
    work_dir_base: PathBuf,
    admission: AdmissionController,
    transport: Arc<dyn ExecutorTransport>,
    outbound: Arc<dyn OutboundChannel>,
    runner: Arc<dyn TaskRunner>,
    cancel_grace: Duration,
    hooks: ExecutorHooks,
    assignments: RwLock<HashMap<Uuid, Arc<Entry>>>,
}

impl ExecutorEngine {
    /// Construct a new engine.
    pub fn new(
        work_dir_base: impl Into<PathBuf>,
        admission: AdmissionController,
        transport: Arc<dyn ExecutorTransport>,
        outbound: Arc<dyn OutboundChannel>,
        runner: Arc<dyn TaskRunner>,
    ) -> Self {
        Self {
            work_dir_base: work_dir_base.into(),
            admission,
            transport,
            outbound,
            runner,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            hooks: ExecutorHooks::default(),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Override the default cancellation grace window.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Configure the `onTaskComplete`/`onError` hook commands.
    #[must_use]
    pub fn with_hooks(mut self, hooks: ExecutorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Number of assignments currently in a non-terminal state.
    pub async fn active_count(&self) -> u32 {
        let mut count = 0u32;
        for entry in self.assignments.read().await.values() {
            if !entry.assignment.lock().await.state.is_terminal() {
                count += 1;
            }
        }
        count
    }

    /// Handle an inbound INVITE: run admission, allocate a work directory,
    /// create a `pending` Assignment, and reply ACCEPT. On decline, reply
    /// ERROR and persist nothing.
    pub async fn on_invite(
        &self,
        delegation_id: Uuid,
        peer_url: String,
        invite: InviteSnapshot,
    ) -> Result<(), AwcpError> {
        let active = self.active_count().await;
        if let Err(e) = self.admission.check_invite(
            active,
            &invite.lease,
            &DependencyAdapter(self.transport.as_ref()),
        ) {
            let _ = self
                .outbound
                .send(
                    &peer_url,
                    &AwcpMessage::error(delegation_id, e.code, e.message.clone()),
                )
                .await;
            return Err(e);
        }

        let now = Utc::now();
        let work_path = self.work_dir_base.join(delegation_id.to_string());
        if let Err(e) = std::fs::create_dir_all(&work_path) {
            let err = AwcpError::new(ErrorCode::SetupFailed, "allocate work directory").with_source(e);
            let _ = self
                .outbound
                .send(&peer_url, &AwcpMessage::error(delegation_id, err.code, err.message.clone()))
                .await;
            return Err(err);
        }

        let assignment = Assignment {
            id: delegation_id,
            state: AssignmentState::Pending,
            invite,
            work_path: work_path.to_string_lossy().into_owned(),
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        let entry = Arc::new(Entry {
            assignment: Mutex::new(assignment),
            cancel: CancellationSignal::new(),
            retain_until: Mutex::new(None),
        });
        self.assignments.write().await.insert(delegation_id, entry);

        self.outbound
            .send(
                &peer_url,
                &AwcpMessage::Accept {
                    version: PROTOCOL_VERSION.to_string(),
                    delegation_id,
                    executor_work_dir: ExecutorWorkDir {
                        path: work_path.to_string_lossy().into_owned(),
                    },
                    executor_constraints: None,
                },
            )
            .await
    }

    async fn entry(&self, id: Uuid) -> Result<Arc<Entry>, AwcpError> {
        self.assignments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AwcpError::new(ErrorCode::WorkspaceNotFound, format!("unknown assignment {id}")))
    }

    /// Handle inbound START: set up the transport, run the task in the
    /// background, and report DONE/ERROR on completion.
    pub async fn on_start(
        self: &Arc<Self>,
        delegation_id: Uuid,
        peer_url: String,
        lease: awcp_core::ActiveLease,
        handle: awcp_core::TransportHandle,
    ) -> Result<(), AwcpError> {
        let entry = self.entry(delegation_id).await?;
        {
            let mut a = entry.assignment.lock().await;
            a.transition_to(AssignmentState::Active, Utc::now())
                .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, e.to_string()))?;
        }

        let engine = Arc::clone(self);
        let entry = Arc::clone(&entry);
        tokio::spawn(async move {
            engine.run_assignment(delegation_id, peer_url, lease, handle, entry).await;
        });
        Ok(())
    }

    async fn run_assignment(
        self: Arc<Self>,
        id: Uuid,
        peer_url: String,
        lease: awcp_core::ActiveLease,
        handle: awcp_core::TransportHandle,
        entry: Arc<Entry>,
    ) {
        let mount_path = match self.transport.setup(id, &handle).await {
            Ok(p) => p,
            Err(e) => {
                self.fail(&entry, &peer_url, id, ErrorCode::SetupFailed, e.message).await;
                return;
            }
        };

        let (resources, task) = {
            let a = entry.assignment.lock().await;
            (a.invite.environment.resources.clone(), a.invite.task.clone())
        };
        let work_path = resolve_work_subdir(&mount_path, &resources);

        let ctx = TaskContext {
            delegation_id: id,
            work_path: work_path.clone(),
            task,
            environment: {
                let a = entry.assignment.lock().await;
                a.invite.environment.clone()
            },
        };

        let run_fut = self.runner.run(ctx, entry.cancel.clone());
        let expiry = tokio::time::sleep(
            (lease.expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(0)),
        );
        tokio::pin!(run_fut);
        tokio::pin!(expiry);

        let outcome = tokio::select! {
            result = &mut run_fut => Outcome::Finished(result),
            () = &mut expiry => Outcome::Expired,
        };

        match outcome {
            Outcome::Finished(Ok(result)) => {
                let snapshot = self
                    .transport
                    .capture_snapshot(id, &handle, &work_path)
                    .await
                    .unwrap_or(None);
                self.transport.teardown(id).await;
                let _ = std::fs::remove_dir_all(&mount_path);

                {
                    let mut a = entry.assignment.lock().await;
                    a.result = Some(result.clone());
                    let _ = a.transition_to(AssignmentState::Completed, Utc::now());
                }
                *entry.retain_until.lock().await = Some(Utc::now() + chrono::Duration::seconds(1800));

                let _ = self
                    .outbound
                    .send(
                        &peer_url,
                        &AwcpMessage::Done {
                            version: PROTOCOL_VERSION.to_string(),
                            delegation_id: id,
                            final_summary: result.summary,
                            highlights: result.highlights,
                            notes: result.notes,
                            snapshot: snapshot.map(|_| awcp_protocol::SnapshotReference {
                                snapshot_id: Uuid::new_v4(),
                            }),
                        },
                    )
                    .await;

                if let Some(command) = &self.hooks.on_task_complete {
                    run_hook(command, id, "onTaskComplete").await;
                }
            }
            Outcome::Finished(Err(e)) => {
                self.transport.teardown(id).await;
                let _ = std::fs::remove_dir_all(&mount_path);
                self.fail(&entry, &peer_url, id, ErrorCode::TaskFailed, e.message).await;
            }
            Outcome::Expired => {
                entry.cancel.cancel();
                tokio::time::sleep(self.cancel_grace).await;
                self.transport.teardown(id).await;
                let _ = std::fs::remove_dir_all(&mount_path);
                self.fail(&entry, &peer_url, id, ErrorCode::Expired, "lease expired mid-run").await;
            }
        }
    }

    async fn fail(&self, entry: &Arc<Entry>, peer_url: &str, id: Uuid, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        {
            let mut a = entry.assignment.lock().await;
            a.error = Some(RecordedError {
                code,
                message: message.clone(),
                hint: None,
            });
            let _ = a.transition_to(AssignmentState::Error, Utc::now());
        }
        *entry.retain_until.lock().await = Some(Utc::now() + chrono::Duration::seconds(1800));
        let _ = self
            .outbound
            .send(peer_url, &AwcpMessage::error(id, code, message))
            .await;

        if let Some(command) = &self.hooks.on_error {
            run_hook(command, id, "onError").await;
        }
    }

    /// Signal cancellation, wait up to the configured grace window for the
    /// runner to exit, then force teardown. Idempotent: a call on an
    /// already-terminal assignment is a no-op.
    pub async fn cancel_delegation(&self, id: Uuid) {
        let Ok(entry) = self.entry(id).await else {
            return;
        };
        let terminal = entry.assignment.lock().await.state.is_terminal();
        if terminal {
            return;
        }
        entry.cancel.cancel();
        debug!(delegation_id = %id, "cancellation signalled, awaiting grace window");
        tokio::time::sleep(self.cancel_grace).await;

        let mut a = entry.assignment.lock().await;
        if !a.state.is_terminal() {
            let _ = a.transition_to(AssignmentState::Error, Utc::now());
            a.error = Some(RecordedError {
                code: ErrorCode::Cancelled,
                message: "cancelled by Delegator".into(),
                hint: None,
            });
            drop(a);
            self.transport.teardown(id).await;
            let work_path = self.work_dir_base.join(id.to_string());
            let _ = std::fs::remove_dir_all(&work_path);
        }
    }

    /// Current assignment record, if it still exists.
    pub async fn get_assignment(&self, id: Uuid) -> Result<Assignment, AwcpError> {
        Ok(self.entry(id).await?.assignment.lock().await.clone())
    }

    /// Drop assignment records whose retention window has elapsed. Intended
    /// to be polled periodically by the daemon.
    pub async fn sweep_expired_records(&self, now: chrono::DateTime<Utc>) {
        let mut table = self.assignments.write().await;
        let mut to_remove = Vec::new();
        for (id, entry) in table.iter() {
            if let Some(until) = *entry.retain_until.lock().await {
                if now >= until {
                    to_remove.push(*id);
                }
            }
        }
        for id in to_remove {
            table.remove(&id);
        }
    }
}

enum Outcome {
    Finished(Result<DelegationResult, AwcpError>),
    Expired,
}

struct DependencyAdapter<'a>(&'a dyn ExecutorTransport);

impl DependencyCheck for DependencyAdapter<'_> {
    fn check_dependency(&self) -> Result<(), AwcpError> {
        self.0.check_dependency()
    }
}
