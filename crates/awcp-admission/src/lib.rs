//! awcp-admission
#![deny(unsafe_code)]
//!
//! The admission controller: an ordered battery of checks run before a
//! delegation is created (Delegator side) or before an INVITE is accepted
//! (Executor side). Each check fails closed with a specific [`ErrorCode`]
//! so a decline always carries an actionable reason.

use awcp_core::{AccessMode, EnvironmentSpec, LeaseConfig, Resource};
use awcp_error::{AwcpError, ErrorCode};
use awcp_glob::IncludeExcludeGlobs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Checks whether a transport's runtime dependency (e.g. the `sshfs`
/// binary) is available. Implemented by `awcp-transport`; kept here as a
/// narrow trait so the admission controller never depends on a concrete
/// transport.
pub trait DependencyCheck {
    /// Return an error (always [`ErrorCode::DepMissing`]) if the
    /// dependency required to run this transport is unavailable.
    fn check_dependency(&self) -> Result<(), AwcpError>;
}

/// A [`DependencyCheck`] that always passes, for transports with no
/// external runtime dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDependency;

impl DependencyCheck for NoDependency {
    fn check_dependency(&self) -> Result<(), AwcpError> {
        Ok(())
    }
}

/// Thresholds the admission controller enforces. Field values match the
/// protocol's documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicy {
    /// Max delegations/assignments this side will run concurrently.
    pub max_concurrent_delegations: u32,
    /// Max lease TTL, in seconds, this side will accept.
    pub max_ttl_seconds: u64,
    /// Access modes this side is willing to grant or accept.
    pub allowed_access_modes: Vec<AccessMode>,
    /// Max total bytes across all resources (Delegator-only check).
    pub max_total_bytes: u64,
    /// Max total file count across all resources (Delegator-only check).
    pub max_file_count: u64,
    /// Max size of any single file (Delegator-only check).
    pub max_single_file_bytes: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_delegations: 5,
            max_ttl_seconds: 3600,
            allowed_access_modes: vec![AccessMode::Ro, AccessMode::Rw],
            max_total_bytes: 100 * 1024 * 1024,
            max_file_count: 10_000,
            max_single_file_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Aggregate statistics from a workspace walk, used both to enforce
/// thresholds and (on success) to report what was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkspaceStats {
    /// Total bytes across every counted file.
    pub total_bytes: u64,
    /// Total number of counted files.
    pub file_count: u64,
}

/// Evaluates the protocol's five ordered admission checks.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    policy: AdmissionPolicy,
}

impl AdmissionController {
    /// Build a controller from an explicit policy.
    #[must_use]
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self { policy }
    }

    /// The policy this controller enforces.
    #[must_use]
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Full Delegator-side admission check, run before a [`Delegation`]
    /// record is created: concurrency, lease TTL, access mode, transport
    /// dependency, then a streaming workspace walk.
    ///
    /// Checks run in order and the first failure short-circuits the rest.
    ///
    /// [`Delegation`]: awcp_core::Delegation
    pub fn check_delegate(
        &self,
        active_delegations: u32,
        lease: &LeaseConfig,
        environment: &EnvironmentSpec,
        dependency: &dyn DependencyCheck,
    ) -> Result<WorkspaceStats, AwcpError> {
        self.check_concurrency(active_delegations)?;
        self.check_ttl(lease.ttl_seconds)?;
        self.check_access_mode(lease.access_mode)?;
        dependency.check_dependency()?;
        self.check_workspace_size(environment)
    }

    /// Executor-side admission check, run on receipt of INVITE: the same
    /// concurrency/TTL/access-mode/dependency checks, minus the workspace
    /// walk (the Executor has no local copy of the Delegator's files yet).
    pub fn check_invite(
        &self,
        active_assignments: u32,
        lease: &LeaseConfig,
        dependency: &dyn DependencyCheck,
    ) -> Result<(), AwcpError> {
        self.check_concurrency(active_assignments)?;
        self.check_ttl(lease.ttl_seconds)?;
        self.check_access_mode(lease.access_mode)?;
        dependency.check_dependency()
    }

    fn check_concurrency(&self, active: u32) -> Result<(), AwcpError> {
        if active >= self.policy.max_concurrent_delegations {
            return Err(AwcpError::new(
                ErrorCode::Declined,
                format!(
                    "at concurrency limit: {active} active, max {}",
                    self.policy.max_concurrent_delegations
                ),
            )
            .with_context("activeCount", active)
            .with_context("maxConcurrentDelegations", self.policy.max_concurrent_delegations));
        }
        Ok(())
    }

    fn check_ttl(&self, ttl_seconds: u64) -> Result<(), AwcpError> {
        if ttl_seconds > self.policy.max_ttl_seconds {
            return Err(AwcpError::new(
                ErrorCode::Declined,
                format!(
                    "requested ttlSeconds {ttl_seconds} exceeds max {}",
                    self.policy.max_ttl_seconds
                ),
            )
            .with_context("requestedTtlSeconds", ttl_seconds)
            .with_context("maxTtlSeconds", self.policy.max_ttl_seconds));
        }
        Ok(())
    }

    fn check_access_mode(&self, mode: AccessMode) -> Result<(), AwcpError> {
        if !self.policy.allowed_access_modes.contains(&mode) {
            return Err(AwcpError::new(
                ErrorCode::Declined,
                format!("access mode {mode} is not permitted by policy"),
            )
            .with_context("requestedAccessMode", mode.to_string()));
        }
        Ok(())
    }

    fn check_workspace_size(&self, environment: &EnvironmentSpec) -> Result<WorkspaceStats, AwcpError> {
        let mut stats = WorkspaceStats::default();
        let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();

        for resource in environment.resources() {
            self.walk_resource(resource, &mut stats, &mut seen_inodes)?;
        }

        Ok(stats)
    }

    fn walk_resource(
        &self,
        resource: &Resource,
        stats: &mut WorkspaceStats,
        seen_inodes: &mut HashSet<(u64, u64)>,
    ) -> Result<(), AwcpError> {
        let root = Path::new(&resource.source);
        let rules = IncludeExcludeGlobs::new(&resource.include, &resource.exclude).map_err(|e| {
            AwcpError::new(
                ErrorCode::WorkspaceInvalid,
                format!("invalid glob pattern on resource {:?}", resource.name),
            )
            .with_context("cause", e.to_string())
        })?;

        let walker = WalkDir::new(root).follow_links(true).into_iter();
        for entry in walker {
            let entry = entry.map_err(|e| {
                AwcpError::new(
                    ErrorCode::WorkspaceInvalid,
                    format!("failed to walk resource {:?}", resource.name),
                )
                .with_context("cause", e.to_string())
            })?;

            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if !rules.decide_path(rel).is_allowed() {
                continue;
            }

            if let Some(key) = inode_key(entry.path()) {
                if !seen_inodes.insert(key) {
                    // Already counted this inode via another symlink path;
                    // skip to break cycles without silently double-counting.
                    continue;
                }
            }

            let len = entry
                .metadata()
                .map_err(|e| {
                    AwcpError::new(
                        ErrorCode::WorkspaceInvalid,
                        format!("failed to stat entry in resource {:?}", resource.name),
                    )
                    .with_context("cause", e.to_string())
                })?
                .len();

            if len > self.policy.max_single_file_bytes {
                return Err(AwcpError::new(
                    ErrorCode::WorkspaceTooLarge,
                    format!(
                        "file {} is {len} bytes, exceeds maxSingleFileBytes {}",
                        entry.path().display(),
                        self.policy.max_single_file_bytes
                    ),
                )
                .with_context("path", entry.path().display().to_string())
                .with_context("sizeBytes", len));
            }

            stats.total_bytes += len;
            stats.file_count += 1;

            if stats.file_count > self.policy.max_file_count {
                return Err(AwcpError::new(
                    ErrorCode::WorkspaceTooLarge,
                    format!(
                        "workspace has more than maxFileCount {} files",
                        self.policy.max_file_count
                    ),
                )
                .with_context("maxFileCount", self.policy.max_file_count));
            }
            if stats.total_bytes > self.policy.max_total_bytes {
                return Err(AwcpError::new(
                    ErrorCode::WorkspaceTooLarge,
                    format!(
                        "workspace exceeds maxTotalBytes {}",
                        self.policy.max_total_bytes
                    ),
                )
                .with_context("maxTotalBytes", self.policy.max_total_bytes)
                .with_context("observedBytes", stats.total_bytes));
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn inode_key(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn inode_key(_path: &Path) -> Option<(u64, u64)> {
    None
}
