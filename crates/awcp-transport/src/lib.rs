// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-transport
#![deny(unsafe_code)]
//!
//! The two transport variants a delegation may use to move an environment
//! from Delegator to Executor and a result back: [`archive`] (a served or
//! inline ZIP) and [`sshcert`] (a short-lived SSH certificate plus an
//! `sshfs` FUSE mount).

pub mod archive;
pub mod sshcert;

use async_trait::async_trait;
use awcp_core::TransportHandle;
use awcp_error::AwcpError;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Capability advertisement a transport makes about itself, echoed into
/// [`awcp_core::ExecutorConstraints::sandbox_profile`]'s sibling fields at
/// the engine layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether this transport can produce a deferred-apply [`awcp_core::Snapshot`].
    pub supports_snapshots: bool,
    /// Whether this transport keeps the environment live-synced rather than
    /// copied once at START and once at DONE.
    pub live_sync: bool,
}

/// Delegator-side half of a transport: stage an environment for handoff,
/// optionally fold a result back in, and release any resources held.
#[async_trait]
pub trait DelegatorTransport: Send + Sync {
    /// Prepare `env_root` for handoff to the Executor, returning the
    /// [`TransportHandle`] to embed in START. `ttl_seconds` is the lease's
    /// TTL, which bounds both served-URL expiry and certificate validity.
    async fn prepare(
        &self,
        id: Uuid,
        env_root: &Path,
        ttl_seconds: u64,
    ) -> Result<TransportHandle, AwcpError>;

    /// Fold an Executor-produced result back into `dest_root`. The default
    /// no-op suits transports with no separate result-application step
    /// (e.g. a live-synced mount already wrote through).
    async fn apply_result(&self, _id: Uuid, _dest_root: &Path) -> Result<Vec<String>, AwcpError> {
        Ok(Vec::new())
    }

    /// Release any resources (temp files, registered URLs, mounts) held for
    /// `id`. Best-effort; never fails the caller's own cleanup.
    async fn cleanup(&self, _id: Uuid) {}

    /// This transport's capability advertisement.
    fn capabilities(&self) -> Capabilities;
}

/// Executor-side half of a transport: check its runtime dependency, mount
/// or unpack the handle into a local work directory, tear it down, and
/// optionally capture a result snapshot.
#[async_trait]
pub trait ExecutorTransport: Send + Sync {
    /// Check whether this transport's runtime dependency (an external
    /// binary, typically) is available. Failing this must map to
    /// [`awcp_error::ErrorCode::DepMissing`].
    fn check_dependency(&self) -> Result<(), AwcpError>;

    /// Set up local access to `handle`, returning the absolute work
    /// directory path the task runner should use.
    async fn setup(&self, id: Uuid, handle: &TransportHandle) -> Result<PathBuf, AwcpError>;

    /// Tear down whatever `setup` created for `id`. Best-effort.
    async fn teardown(&self, id: Uuid);

    /// Capture and upload a result snapshot from `work_dir` using the
    /// transport handle received at START, if this transport supports
    /// snapshots; `None` otherwise.
    async fn capture_snapshot(
        &self,
        _id: Uuid,
        _handle: &TransportHandle,
        _work_dir: &Path,
    ) -> Result<Option<CapturedResult>, AwcpError> {
        Ok(None)
    }

    /// This transport's capability advertisement.
    fn capabilities(&self) -> Capabilities;
}

/// Statistics about a result package captured and uploaded by
/// [`ExecutorTransport::capture_snapshot`], used by the Delegator engine to
/// populate a [`awcp_core::Snapshot`]'s metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResult {
    /// sha-256 hex digest of the uploaded result package.
    pub checksum: String,
    /// Number of files in the result package.
    pub file_count: u64,
    /// Total size, in bytes, of the result package's contents.
    pub total_bytes: u64,
    /// Paths changed relative to the environment root.
    pub changed_files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_plain_data() {
        let c = Capabilities {
            supports_snapshots: true,
            live_sync: false,
        };
        assert!(c.supports_snapshots);
        assert!(!c.live_sync);
    }
}
