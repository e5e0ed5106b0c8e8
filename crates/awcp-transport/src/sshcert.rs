//! SSH-certificate transport: a short-lived certificate signed by a
//! process-wide CA key, paired with an `sshfs` mount for live access to the
//! environment instead of a point-in-time copy.

use crate::{Capabilities, CapturedResult, DelegatorTransport, ExecutorTransport};
use async_trait::async_trait;
use awcp_core::{SshCredential, SshEndpoint, TransportHandle};
use awcp_error::{AwcpError, ErrorCode};
use rand::rngs::OsRng;
use ssh_key::certificate::{Builder as CertBuilder, CertType};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Clock skew allowance before `now` a certificate is made valid from, so a
/// few seconds of drift between Delegator and Executor clocks doesn't bounce
/// a certificate that was only just issued.
const VALIDITY_SKEW_SECONDS: u64 = 30;

/// How long `setup` waits for the `sshfs` mount to come up before giving up.
const MOUNT_READINESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

struct CertificateAuthority {
    key: PrivateKey,
}

impl CertificateAuthority {
    fn generate() -> Result<Self, AwcpError> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "generate SSH certificate authority key")
                .with_context("cause", e.to_string())
        })?;
        Ok(Self { key })
    }

    fn issue(&self, user: &str, ttl_seconds: u64) -> Result<(PrivateKey, String), AwcpError> {
        let leaf = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "generate delegation SSH key")
                .with_context("cause", e.to_string())
        })?;

        let now = now_unix();
        let valid_after = now.saturating_sub(VALIDITY_SKEW_SECONDS);
        let valid_before = now.saturating_add(ttl_seconds).saturating_add(VALIDITY_SKEW_SECONDS);

        let mut builder = CertBuilder::new_with_random_nonce(
            &mut OsRng,
            leaf.public_key().clone(),
            valid_after,
            valid_before,
        )
        .map_err(|e| cert_err("start certificate builder", e))?;
        builder
            .cert_type(CertType::User)
            .map_err(|e| cert_err("set certificate type", e))?;
        builder
            .valid_principal(user)
            .map_err(|e| cert_err("set certificate principal", e))?;
        builder
            .key_id(format!("awcp-{now}"))
            .map_err(|e| cert_err("set certificate key id", e))?;

        let certificate = builder
            .sign(&self.key)
            .map_err(|e| cert_err("sign certificate", e))?;
        let openssh = certificate
            .to_openssh()
            .map_err(|e| cert_err("encode certificate", e))?;
        Ok((leaf, openssh))
    }
}

fn cert_err(action: &str, e: impl std::fmt::Display) -> AwcpError {
    AwcpError::new(ErrorCode::SetupFailed, format!("{action}: {e}"))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

static CA: OnceLock<CertificateAuthority> = OnceLock::new();

fn ca() -> Result<&'static CertificateAuthority, AwcpError> {
    if let Some(ca) = CA.get() {
        return Ok(ca);
    }
    let generated = CertificateAuthority::generate()?;
    Ok(CA.get_or_init(|| generated))
}

/// Delegator side: issues a per-delegation certificate against the shared
/// process-wide CA and points the Executor at the already-running `sshd`
/// exporting `env_root`.
#[derive(Debug, Clone)]
pub struct SshfsDelegatorTransport {
    host: String,
    port: u16,
    user: String,
}

impl SshfsDelegatorTransport {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }
}

#[async_trait]
impl DelegatorTransport for SshfsDelegatorTransport {
    async fn prepare(
        &self,
        _id: Uuid,
        env_root: &Path,
        ttl_seconds: u64,
    ) -> Result<TransportHandle, AwcpError> {
        let (leaf, certificate) = ca()?.issue(&self.user, ttl_seconds)?;
        let private_key = leaf
            .to_openssh(LineEnding::LF)
            .map_err(|e| cert_err("encode delegation private key", e))?
            .to_string();

        Ok(TransportHandle::Sshfs {
            endpoint: SshEndpoint {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
            },
            export_locator: env_root.to_string_lossy().into_owned(),
            credential: SshCredential {
                private_key,
                certificate,
            },
        })
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_snapshots: false,
            live_sync: true,
        }
    }
}

/// Executor side: mounts the Delegator's export over `sshfs` for the
/// lifetime of the task.
#[derive(Debug, Clone, Default)]
pub struct SshfsExecutorTransport;

#[async_trait]
impl ExecutorTransport for SshfsExecutorTransport {
    fn check_dependency(&self) -> Result<(), AwcpError> {
        which("sshfs").map(|_| ()).ok_or_else(|| {
            AwcpError::new(ErrorCode::DepMissing, "the `sshfs` binary was not found on PATH")
        })
    }

    async fn setup(&self, id: Uuid, handle: &TransportHandle) -> Result<PathBuf, AwcpError> {
        let TransportHandle::Sshfs {
            endpoint,
            export_locator,
            credential,
        } = handle
        else {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                "sshfs transport received a non-sshfs handle",
            ));
        };

        let staging = staging_dir_for(id);
        std::fs::create_dir_all(&staging).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "create sshfs staging dir").with_source(e)
        })?;

        let key_path = staging.join("id_ed25519");
        let cert_path = staging.join("id_ed25519-cert.pub");
        write_private_key(&key_path, &credential.private_key)?;
        std::fs::write(&cert_path, &credential.certificate).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "write delegation certificate").with_source(e)
        })?;

        let mount_dir = staging.join("mount");
        std::fs::create_dir_all(&mount_dir).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "create sshfs mount point").with_source(e)
        })?;

        let remote = format!("{}@{}:{}", endpoint.user, endpoint.host, export_locator);
        let mount = Command::new("sshfs")
            .arg(&remote)
            .arg(&mount_dir)
            .arg("-p")
            .arg(endpoint.port.to_string())
            .arg("-o")
            .arg(format!(
                "IdentityFile={},CertificateFile={},StrictHostKeyChecking=no,UserKnownHostsFile=/dev/null",
                key_path.display(),
                cert_path.display(),
            ))
            .status();
        let status = tokio::time::timeout(MOUNT_READINESS_TIMEOUT, mount)
            .await
            .map_err(|_| {
                AwcpError::new(
                    ErrorCode::SetupFailed,
                    format!("sshfs mount did not become ready within {MOUNT_READINESS_TIMEOUT:?}"),
                )
            })?
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "spawn sshfs").with_source(e))?;
        if !status.success() {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                format!("sshfs exited with status {status}"),
            ));
        }

        Ok(mount_dir)
    }

    async fn teardown(&self, id: Uuid) {
        let staging = staging_dir_for(id);
        let mount_dir = staging.join("mount");
        if let Err(e) = unmount(&mount_dir).await {
            warn!(delegation_id = %id, error = %e, "failed to unmount sshfs export");
        }
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(delegation_id = %id, error = %e, "failed to remove sshfs staging dir");
            }
        }
    }

    async fn capture_snapshot(
        &self,
        _id: Uuid,
        _handle: &TransportHandle,
        _work_dir: &Path,
    ) -> Result<Option<CapturedResult>, AwcpError> {
        Ok(None)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_snapshots: false,
            live_sync: true,
        }
    }
}

async fn unmount(mount_dir: &Path) -> Result<(), AwcpError> {
    let status = Command::new("fusermount")
        .arg("-u")
        .arg(mount_dir)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => return Ok(()),
        _ => {}
    }
    let status = Command::new("umount")
        .arg(mount_dir)
        .status()
        .await
        .map_err(|e| AwcpError::new(ErrorCode::TaskFailed, "unmount sshfs export").with_source(e))?;
    if status.success() {
        Ok(())
    } else {
        Err(AwcpError::new(
            ErrorCode::TaskFailed,
            format!("unmount exited with status {status}"),
        ))
    }
}

fn staging_dir_for(id: Uuid) -> PathBuf {
    std::env::temp_dir().join("awcp-sshfs").join(id.to_string())
}

/// Remove any staging directory (private key, certificate, mount point) left
/// behind under the `sshfs` staging root by an unclean shutdown, the same
/// way `EnvironmentManager::cleanup_stale` recovers the environment base dir.
/// Called once at daemon startup with the set of assignment ids still live.
pub fn cleanup_stale_key_files(known_ids: &HashSet<Uuid>) -> Result<Vec<Uuid>, AwcpError> {
    let root = std::env::temp_dir().join("awcp-sshfs");
    let mut removed = Vec::new();
    let entries = match std::fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => {
            return Err(AwcpError::new(ErrorCode::SetupFailed, format!("scan sshfs staging root {}", root.display()))
                .with_source(e))
        }
    };

    for entry in entries {
        let entry = entry
            .map_err(|e| AwcpError::new(ErrorCode::SetupFailed, "read sshfs staging root entry").with_source(e))?;
        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|s| Uuid::parse_str(s).ok()) else {
            continue;
        };
        if known_ids.contains(&id) {
            continue;
        }
        if let Err(e) = std::fs::remove_dir_all(entry.path()) {
            warn!(delegation_id = %id, error = %e, "failed to remove stale sshfs staging dir");
            continue;
        }
        debug!(delegation_id = %id, "removed stale sshfs staging dir");
        removed.push(id);
    }

    Ok(removed)
}

#[cfg(unix)]
fn write_private_key(path: &Path, contents: &str) -> Result<(), AwcpError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents).map_err(|e| {
        AwcpError::new(ErrorCode::SetupFailed, "write delegation private key").with_source(e)
    })?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        AwcpError::new(ErrorCode::SetupFailed, "restrict delegation private key permissions")
            .with_source(e)
    })
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, contents: &str) -> Result<(), AwcpError> {
    std::fs::write(path, contents).map_err(|e| {
        AwcpError::new(ErrorCode::SetupFailed, "write delegation private key").with_source(e)
    })
}

fn which(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(binary);
        candidate.is_file().then_some(candidate)
    })
}
