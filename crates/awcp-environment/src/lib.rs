// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-environment
#![deny(unsafe_code)]
//!
//! Environment staging for the Delegator side of a delegation: builds a
//! per-delegation environment root from an [`EnvironmentSpec`], applies an
//! Executor's result back onto the original resources, and sweeps stale
//! staging directories left behind by a crashed daemon.

use awcp_core::{AccessMode, EnvironmentSpec, Resource, PROTOCOL_VERSION, RESOURCE_KIND_FS};
use awcp_error::{AwcpError, ErrorCode};
use awcp_glob::IncludeExcludeGlobs;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const MANIFEST_DIR: &str = ".awcp";
const MANIFEST_FILE: &str = "manifest.json";

/// One resource entry recorded in `<envRoot>/.awcp/manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResource {
    /// Resource name, matching [`Resource::name`].
    pub name: String,
    /// Resource kind (`"fs"` today).
    pub kind: String,
    /// Original source path the resource was staged from.
    pub source: String,
    /// Access mode granted for this resource.
    pub mode: AccessMode,
}

/// The manifest written alongside a staged environment root, recording what
/// was staged and when. Never included in any transport payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Literal `"1"`.
    pub version: String,
    /// Owning delegation id.
    pub delegation_id: Uuid,
    /// Staging timestamp.
    pub created_at: DateTime<Utc>,
    /// Resources staged into this environment root, in declared order.
    pub resources: Vec<ManifestResource>,
}

/// Result of [`EnvironmentManager::build`]: the staged root and its manifest.
#[derive(Debug, Clone)]
pub struct BuiltEnvironment {
    /// Absolute path of the staged environment root.
    pub env_root: PathBuf,
    /// The manifest written at `<env_root>/.awcp/manifest.json`.
    pub manifest: Manifest,
}

/// Per-kind staging and result-application behavior. `"fs"` is the only
/// kind this crate ships, but the dispatch table is open to more.
pub trait ResourceAdapter: Send + Sync {
    /// The resource kind this adapter handles (e.g. `"fs"`).
    fn kind(&self) -> &'static str;

    /// Stage `resource` into `dest`, honoring its include/exclude globs.
    fn stage(&self, resource: &Resource, dest: &Path) -> Result<(), AwcpError>;

    /// Apply the Executor's result back onto `resource`'s original source.
    /// A no-op for `ro` resources.
    fn apply_result(&self, resource: &Resource, result_dir: &Path) -> Result<Vec<String>, AwcpError>;
}

/// The only required [`ResourceAdapter`]: a plain filesystem copy honoring
/// include/exclude globs, with "overwrite + add, no delete" result
/// application semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAdapter;

impl ResourceAdapter for FsAdapter {
    fn kind(&self) -> &'static str {
        RESOURCE_KIND_FS
    }

    fn stage(&self, resource: &Resource, dest: &Path) -> Result<(), AwcpError> {
        let src = PathBuf::from(&resource.source);
        if !src.exists() {
            return Err(AwcpError::new(
                ErrorCode::WorkspaceNotFound,
                format!(
                    "resource {:?} source not found: {}",
                    resource.name,
                    src.display()
                ),
            ));
        }

        let rules = IncludeExcludeGlobs::new(&resource.include, &resource.exclude).map_err(|e| {
            AwcpError::new(
                ErrorCode::WorkspaceInvalid,
                format!("invalid glob pattern on resource {:?}", resource.name),
            )
            .with_context("cause", e.to_string())
        })?;

        copy_filtered(&src, dest, &rules).map_err(|e| {
            AwcpError::new(
                ErrorCode::SetupFailed,
                format!("staging resource {:?} failed", resource.name),
            )
            .with_context("cause", e.to_string())
        })
    }

    fn apply_result(&self, resource: &Resource, result_dir: &Path) -> Result<Vec<String>, AwcpError> {
        if resource.mode != AccessMode::Rw {
            return Ok(Vec::new());
        }
        if !result_dir.exists() {
            return Ok(Vec::new());
        }

        let dest = PathBuf::from(&resource.source);
        overlay_copy(result_dir, &dest).map_err(|e| {
            AwcpError::new(
                ErrorCode::TaskFailed,
                format!("applying result for resource {:?} failed", resource.name),
            )
            .with_context("cause", e.to_string())
        })
    }
}

/// Builds, applies, and tears down staged environment roots for delegations.
///
/// One instance is shared by a Delegator engine across its lifetime; the
/// resource-kind dispatch table is immutable once constructed.
pub struct EnvironmentManager {
    base_dir: PathBuf,
    adapters: HashMap<&'static str, Arc<dyn ResourceAdapter>>,
}

impl EnvironmentManager {
    /// Construct a manager rooted at `base_dir`, registering only the
    /// required `"fs"` adapter.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_adapters(base_dir, [Arc::new(FsAdapter) as Arc<dyn ResourceAdapter>])
    }

    /// Construct a manager with an explicit adapter set, keyed by
    /// [`ResourceAdapter::kind`].
    pub fn with_adapters(
        base_dir: impl Into<PathBuf>,
        adapters: impl IntoIterator<Item = Arc<dyn ResourceAdapter>>,
    ) -> Self {
        let mut table: HashMap<&'static str, Arc<dyn ResourceAdapter>> = HashMap::new();
        for adapter in adapters {
            table.insert(adapter.kind(), adapter);
        }
        Self {
            base_dir: base_dir.into(),
            adapters: table,
        }
    }

    /// The staging root a given delegation id would occupy.
    #[must_use]
    pub fn env_root(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(id.to_string())
    }

    /// Stage every resource in `spec` under a fresh environment root for
    /// `id`, writing `.awcp/manifest.json` alongside them.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::WorkspaceNotFound`] if a resource's source is
    /// missing, [`ErrorCode::WorkspaceInvalid`] for unparsable glob patterns,
    /// [`ErrorCode::DepMissing`] for an unregistered resource kind, or
    /// [`ErrorCode::SetupFailed`] for any other staging failure.
    pub fn build(
        &self,
        id: Uuid,
        spec: &EnvironmentSpec,
        now: DateTime<Utc>,
    ) -> Result<BuiltEnvironment, AwcpError> {
        let env_root = self.env_root(id);
        fs::create_dir_all(&env_root).map_err(|e| {
            AwcpError::new(
                ErrorCode::SetupFailed,
                format!("create environment root {}", env_root.display()),
            )
            .with_source(e)
        })?;

        let mut manifest_resources = Vec::with_capacity(spec.resources().len());
        for resource in spec.resources() {
            let adapter = self.adapters.get(resource.kind.as_str()).ok_or_else(|| {
                AwcpError::new(
                    ErrorCode::DepMissing,
                    format!("no adapter registered for resource kind {:?}", resource.kind),
                )
                .with_context("resource", resource.name.clone())
            })?;

            let dest = env_root.join(&resource.name);
            adapter.stage(resource, &dest)?;

            manifest_resources.push(ManifestResource {
                name: resource.name.clone(),
                kind: resource.kind.clone(),
                source: resource.source.clone(),
                mode: resource.mode,
            });
        }

        let manifest = Manifest {
            version: PROTOCOL_VERSION.to_string(),
            delegation_id: id,
            created_at: now,
            resources: manifest_resources,
        };
        self.write_manifest(&env_root, &manifest)?;

        debug!(delegation_id = %id, env_root = %env_root.display(), "environment staged");
        Ok(BuiltEnvironment { env_root, manifest })
    }

    fn write_manifest(&self, env_root: &Path, manifest: &Manifest) -> Result<(), AwcpError> {
        let dir = env_root.join(MANIFEST_DIR);
        fs::create_dir_all(&dir).map_err(|e| {
            AwcpError::new(
                ErrorCode::SetupFailed,
                format!("create manifest dir {}", dir.display()),
            )
            .with_source(e)
        })?;

        let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "serialize manifest").with_source(e)
        })?;
        fs::write(dir.join(MANIFEST_FILE), bytes).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "write manifest").with_source(e)
        })
    }

    /// Apply the Executor's result, staged per-resource under `result_root`,
    /// back onto each `rw` resource's original source. Read-only resources
    /// are left untouched. Returns the paths changed, relative to each
    /// resource's own source, prefixed with the resource name.
    ///
    /// This is "overwrite + add, no delete": files present in the result are
    /// written or overwritten; files absent from the result but present in
    /// the original are left alone.
    pub fn apply_result(
        &self,
        spec: &EnvironmentSpec,
        result_root: &Path,
    ) -> Result<Vec<String>, AwcpError> {
        let mut changed = Vec::new();
        for resource in spec.resources() {
            let adapter = self.adapters.get(resource.kind.as_str()).ok_or_else(|| {
                AwcpError::new(
                    ErrorCode::DepMissing,
                    format!("no adapter registered for resource kind {:?}", resource.kind),
                )
            })?;
            let result_dir = result_root.join(&resource.name);
            let resource_changes = adapter.apply_result(resource, &result_dir)?;
            changed.extend(
                resource_changes
                    .into_iter()
                    .map(|rel| format!("{}/{rel}", resource.name)),
            );
        }
        Ok(changed)
    }

    /// Best-effort removal of a delegation's staging directory. Errors are
    /// logged, never propagated: releasing is always attempted exactly once
    /// per delegation and must not block the caller's own cleanup.
    pub fn release(&self, id: Uuid) {
        let root = self.env_root(id);
        if let Err(e) = fs::remove_dir_all(&root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(delegation_id = %id, error = %e, "failed to release environment root");
            }
        }
    }

    /// Remove any staging directory under `base_dir` whose name parses as a
    /// UUID not present in `known_ids`. Called once at daemon startup to
    /// recover from an unclean shutdown.
    pub fn cleanup_stale(&self, known_ids: &HashSet<Uuid>) -> Result<Vec<Uuid>, AwcpError> {
        let mut removed = Vec::new();
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
            Err(e) => {
                return Err(AwcpError::new(
                    ErrorCode::SetupFailed,
                    format!("scan environment base dir {}", self.base_dir.display()),
                )
                .with_source(e))
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| {
                AwcpError::new(ErrorCode::SetupFailed, "read environment base dir entry")
                    .with_source(e)
            })?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            if known_ids.contains(&id) {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(delegation_id = %id, error = %e, "failed to remove stale environment root");
                continue;
            }
            debug!(delegation_id = %id, "removed stale environment root");
            removed.push(id);
        }

        Ok(removed)
    }
}

fn copy_filtered(src_root: &Path, dest_root: &Path, rules: &IncludeExcludeGlobs) -> anyhow::Result<()> {
    use anyhow::Context;

    let walker = WalkDir::new(src_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(MANIFEST_DIR));

    for entry in walker {
        let entry = entry?;
        let path = entry.path();

        let rel = path.strip_prefix(src_root).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }
        if !rules.decide_path(rel).is_allowed() {
            continue;
        }

        let dest_path = dest_root.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest_path)
                .with_context(|| format!("create dir {}", dest_path.display()))?;
            continue;
        }
        if entry.file_type().is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            fs::copy(path, &dest_path).with_context(|| format!("copy {}", rel.display()))?;
        }
    }

    Ok(())
}

/// Copy every file under `result_dir` into `dest_root`, overwriting existing
/// files and creating new ones; never deletes anything already in
/// `dest_root`. Returns paths changed, relative to `dest_root`.
fn overlay_copy(result_dir: &Path, dest_root: &Path) -> anyhow::Result<Vec<String>> {
    use anyhow::Context;

    fs::create_dir_all(dest_root)
        .with_context(|| format!("create dir {}", dest_root.display()))?;

    let mut changed = Vec::new();
    for entry in WalkDir::new(result_dir).follow_links(false) {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(result_dir).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }

        let dest_path = dest_root.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest_path)
                .with_context(|| format!("create dir {}", dest_path.display()))?;
            continue;
        }
        if entry.file_type().is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            fs::copy(path, &dest_path).with_context(|| format!("copy {}", rel.display()))?;
            changed.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use awcp_core::Resource;
    use std::fs;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn write_file(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn build_stages_single_fs_resource_and_writes_manifest() {
        let src = tempdir().unwrap();
        write_file(&src.path().join("hello.txt"), "hi");
        write_file(&src.path().join("sub/nested.txt"), "nested");

        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());

        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            src.path().to_string_lossy(),
            AccessMode::Rw,
        )])
        .unwrap();

        let id = Uuid::new_v4();
        let built = manager.build(id, &spec, now()).unwrap();

        assert!(built.env_root.join("workspace/hello.txt").exists());
        assert!(built.env_root.join("workspace/sub/nested.txt").exists());
        assert_eq!(built.manifest.resources.len(), 1);
        assert_eq!(built.manifest.resources[0].name, "workspace");

        let manifest_path = built.env_root.join(".awcp/manifest.json");
        assert!(manifest_path.exists());
        let on_disk: Manifest =
            serde_json::from_slice(&fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(on_disk.delegation_id, id);
    }

    #[test]
    fn build_honors_exclude_globs() {
        let src = tempdir().unwrap();
        write_file(&src.path().join("keep.txt"), "keep");
        write_file(&src.path().join("secret.key"), "shh");

        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());

        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            src.path().to_string_lossy(),
            AccessMode::Ro,
        )
        .with_exclude(vec!["*.key".into()])])
        .unwrap();

        let built = manager.build(Uuid::new_v4(), &spec, now()).unwrap();
        assert!(built.env_root.join("workspace/keep.txt").exists());
        assert!(!built.env_root.join("workspace/secret.key").exists());
    }

    #[test]
    fn build_missing_source_is_workspace_not_found() {
        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());
        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            "/does/not/exist/at/all",
            AccessMode::Ro,
        )])
        .unwrap();

        let err = manager.build(Uuid::new_v4(), &spec, now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkspaceNotFound);
    }

    #[test]
    fn apply_result_skips_read_only_resources() {
        let original = tempdir().unwrap();
        write_file(&original.path().join("a.txt"), "original");

        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());
        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            original.path().to_string_lossy(),
            AccessMode::Ro,
        )])
        .unwrap();

        let result_root = tempdir().unwrap();
        write_file(&result_root.path().join("workspace/a.txt"), "modified");

        let changed = manager.apply_result(&spec, result_root.path()).unwrap();
        assert!(changed.is_empty());
        assert_eq!(fs::read_to_string(original.path().join("a.txt")).unwrap(), "original");
    }

    #[test]
    fn apply_result_overwrites_and_adds_for_rw_resources() {
        let original = tempdir().unwrap();
        write_file(&original.path().join("a.txt"), "original");
        write_file(&original.path().join("untouched.txt"), "stays");

        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());
        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            original.path().to_string_lossy(),
            AccessMode::Rw,
        )])
        .unwrap();

        let result_root = tempdir().unwrap();
        write_file(&result_root.path().join("workspace/a.txt"), "modified");
        write_file(&result_root.path().join("workspace/new.txt"), "brand new");

        let mut changed = manager.apply_result(&spec, result_root.path()).unwrap();
        changed.sort();
        assert_eq!(changed, vec!["workspace/a.txt", "workspace/new.txt"]);

        assert_eq!(fs::read_to_string(original.path().join("a.txt")).unwrap(), "modified");
        assert_eq!(fs::read_to_string(original.path().join("new.txt")).unwrap(), "brand new");
        // no-delete: untouched.txt survives even though it wasn't in the result
        assert_eq!(
            fs::read_to_string(original.path().join("untouched.txt")).unwrap(),
            "stays"
        );
    }

    #[test]
    fn release_removes_env_root() {
        let src = tempdir().unwrap();
        write_file(&src.path().join("f.txt"), "x");

        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());
        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            src.path().to_string_lossy(),
            AccessMode::Ro,
        )])
        .unwrap();

        let id = Uuid::new_v4();
        let built = manager.build(id, &spec, now()).unwrap();
        assert!(built.env_root.exists());

        manager.release(id);
        assert!(!built.env_root.exists());
    }

    #[test]
    fn release_is_idempotent_on_missing_root() {
        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());
        // never built; must not panic
        manager.release(Uuid::new_v4());
    }

    #[test]
    fn cleanup_stale_removes_unknown_children_only() {
        let base = tempdir().unwrap();
        let manager = EnvironmentManager::new(base.path());

        let src = tempdir().unwrap();
        write_file(&src.path().join("f.txt"), "x");
        let spec = EnvironmentSpec::new(vec![Resource::fs(
            "workspace",
            src.path().to_string_lossy(),
            AccessMode::Ro,
        )])
        .unwrap();

        let keep_id = Uuid::new_v4();
        let stale_id = Uuid::new_v4();
        manager.build(keep_id, &spec, now()).unwrap();
        manager.build(stale_id, &spec, now()).unwrap();

        let mut known = HashSet::new();
        known.insert(keep_id);

        let removed = manager.cleanup_stale(&known).unwrap();
        assert_eq!(removed, vec![stale_id]);
        assert!(manager.env_root(keep_id).exists());
        assert!(!manager.env_root(stale_id).exists());
    }

    #[test]
    fn cleanup_stale_on_missing_base_dir_is_a_noop() {
        let base = tempdir().unwrap();
        let missing = base.path().join("does-not-exist-yet");
        let manager = EnvironmentManager::new(missing);
        let removed = manager.cleanup_stale(&HashSet::new()).unwrap();
        assert!(removed.is_empty());
    }
}
