//! ZIP-archive transport: the default, always-available transport variant.
//!
//! An environment is packed into a deflate ZIP, served either inline (small
//! archives) or from a process-wide embedded HTTP server (large archives,
//! which are also split into fixed-size checksummed chunks so a dropped
//! connection only costs the in-flight chunk). The same server accepts the
//! Executor's result archive back on the upload side.

use crate::{Capabilities, CapturedResult, DelegatorTransport, ExecutorTransport};
use async_trait::async_trait;
use awcp_core::{sha256_hex, ChunkedArchive, TransportHandle};
use awcp_error::{AwcpError, ErrorCode};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archives at or under this size are inlined as base64 in the transport
/// handle rather than served from a URL.
pub const INLINE_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024;

/// Fixed chunk size used for both directions of a served transfer.
pub const CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

const CHUNK_MAX_ATTEMPTS: u32 = 3;
const CHUNK_BASE_BACKOFF: Duration = Duration::from_millis(200);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
const MANIFEST_DIR: &str = ".awcp";

/// Build a deflate ZIP archive of everything under `root`, excluding the
/// `.awcp` manifest directory and dereferencing symlinks.
pub fn build_archive(root: &Path) -> Result<Vec<u8>, AwcpError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(6));

        for entry in WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(MANIFEST_DIR))
        {
            let entry = entry.map_err(|e| archive_err("walk archive source", e))?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path);
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = rel.to_string_lossy().replace('\\', "/");

            if entry.file_type().is_dir() {
                writer
                    .add_directory(format!("{name}/"), options)
                    .map_err(|e| archive_err("add directory to archive", e))?;
                continue;
            }
            if entry.file_type().is_file() {
                writer
                    .start_file(name, options)
                    .map_err(|e| archive_err("start archive entry", e))?;
                let bytes =
                    std::fs::read(path).map_err(|e| archive_err("read file for archive", e))?;
                writer
                    .write_all(&bytes)
                    .map_err(|e| archive_err("write archive entry", e))?;
            }
        }
        writer.finish().map_err(|e| archive_err("finish archive", e))?;
    }
    Ok(buf.into_inner())
}

/// Extract archive `bytes` into `dest`, rejecting any entry whose name is
/// absolute or contains a `..` component.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<(), AwcpError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| archive_err("open archive", e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| archive_err("read archive entry", e))?;
        let rel = sanitize_entry_path(entry.name())?;
        let dest_path = dest.join(&rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest_path)
                .map_err(|e| archive_err("create archive dir", e))?;
            continue;
        }
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| archive_err("create archive parent dir", e))?;
        }
        let mut out = std::fs::File::create(&dest_path)
            .map_err(|e| archive_err("create extracted file", e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| archive_err("write extracted file", e))?;
    }
    Ok(())
}

fn sanitize_entry_path(name: &str) -> Result<PathBuf, AwcpError> {
    use std::path::Component;
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(AwcpError::new(
            ErrorCode::SetupFailed,
            format!("archive entry has an absolute path: {name}"),
        ));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AwcpError::new(
            ErrorCode::SetupFailed,
            format!("archive entry attempts path traversal: {name}"),
        ));
    }
    Ok(path.to_path_buf())
}

fn archive_err(action: &str, e: impl std::fmt::Display) -> AwcpError {
    AwcpError::new(ErrorCode::SetupFailed, format!("{action}: {e}"))
}

/// One checksummed slice of a chunked transfer.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: u32,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

/// Split `bytes` into fixed-size chunks (the last one may be shorter), each
/// carrying its own sha-256 checksum.
pub fn split_into_chunks(bytes: &[u8], chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1) as usize;
    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, slice)| Chunk {
            index: i as u32,
            checksum: sha256_hex(slice),
            bytes: slice.to_vec(),
        })
        .collect()
}

/// Reassemble chunks, which must be in index order and each pass its own
/// checksum, back into the original byte stream.
pub fn reassemble_chunks(chunks: &[Chunk]) -> Result<Vec<u8>, AwcpError> {
    let mut out = Vec::new();
    for (expected_index, chunk) in chunks.iter().enumerate() {
        if chunk.index as usize != expected_index {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                format!(
                    "chunk out of order: expected index {expected_index}, got {}",
                    chunk.index
                ),
            ));
        }
        if sha256_hex(&chunk.bytes) != chunk.checksum {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                format!("chunk {} failed checksum verification", chunk.index),
            ));
        }
        out.extend_from_slice(&chunk.bytes);
    }
    Ok(out)
}

/// Lazily-started, process-wide archive download/upload server.
mod server {
    use axum::extract::{Path as AxPath, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::Engine;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::{Notify, OnceCell};

    #[derive(Clone, Default)]
    pub(super) struct Store {
        downloads: std::sync::Arc<Mutex<HashMap<String, std::sync::Arc<Vec<u8>>>>>,
        uploads: std::sync::Arc<Mutex<HashMap<String, std::sync::Arc<UploadSlot>>>>,
    }

    #[derive(Default)]
    struct UploadSlot {
        chunks: Mutex<HashMap<u32, Vec<u8>>>,
        expected_chunks: Mutex<Option<u32>>,
        completed: Mutex<Option<Vec<u8>>>,
        notify: Notify,
    }

    impl Store {
        pub(super) fn register_download(&self, token: String, bytes: Vec<u8>) {
            self.downloads
                .lock()
                .unwrap()
                .insert(token, std::sync::Arc::new(bytes));
        }

        pub(super) fn drop_download(&self, token: &str) {
            self.downloads.lock().unwrap().remove(token);
        }

        pub(super) fn prepare_upload_slot(&self, token: String) {
            self.uploads
                .lock()
                .unwrap()
                .insert(token, std::sync::Arc::new(UploadSlot::default()));
        }

        fn upload_slot(&self, token: &str) -> Option<std::sync::Arc<UploadSlot>> {
            self.uploads.lock().unwrap().get(token).cloned()
        }

        pub(super) async fn await_upload(&self, token: &str) -> Option<Vec<u8>> {
            let slot = self.upload_slot(token)?;
            loop {
                if let Some(bytes) = slot.completed.lock().unwrap().clone() {
                    return Some(bytes);
                }
                slot.notify.notified().await;
            }
        }

        /// `(received, missing)` sorted indices, for the `status` resume endpoint.
        /// `missing` is empty until a chunk has reported a total chunk count.
        pub(super) fn upload_status(&self, token: &str) -> Option<(Vec<u32>, Vec<u32>)> {
            let slot = self.upload_slot(token)?;
            let received: BTreeSet<u32> = slot.chunks.lock().unwrap().keys().copied().collect();
            let missing = match *slot.expected_chunks.lock().unwrap() {
                Some(total) => (0..total).filter(|i| !received.contains(i)).collect(),
                None => Vec::new(),
            };
            Some((received.into_iter().collect(), missing))
        }

        pub(super) fn drop_upload(&self, token: &str) {
            self.uploads.lock().unwrap().remove(token);
        }
    }

    #[derive(Deserialize)]
    struct ChunkUpload {
        index: u32,
        data: String,
        checksum: String,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    }

    #[derive(Deserialize)]
    struct CompleteUpload {
        checksum: String,
    }

    #[derive(Serialize)]
    pub(super) struct UploadStatus {
        received: Vec<u32>,
        missing: Vec<u32>,
    }

    async fn download(
        AxPath(token): AxPath<String>,
        State(store): State<Store>,
    ) -> Result<Vec<u8>, StatusCode> {
        store
            .downloads
            .lock()
            .unwrap()
            .get(&token)
            .map(|b| (**b).clone())
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn upload_chunk(
        AxPath(token): AxPath<String>,
        State(store): State<Store>,
        Json(req): Json<ChunkUpload>,
    ) -> StatusCode {
        let Some(slot) = store.upload_slot(&token) else {
            return StatusCode::NOT_FOUND;
        };
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&req.data) else {
            return StatusCode::BAD_REQUEST;
        };
        if awcp_core::sha256_hex(&bytes) != req.checksum {
            return StatusCode::BAD_REQUEST;
        }
        slot.chunks.lock().unwrap().insert(req.index, bytes);
        {
            let mut expected = slot.expected_chunks.lock().unwrap();
            if expected.is_none() {
                *expected = Some(req.total_chunks);
            }
        }
        slot.notify.notify_waiters();
        StatusCode::OK
    }

    async fn complete_upload(
        AxPath(token): AxPath<String>,
        State(store): State<Store>,
        Json(req): Json<CompleteUpload>,
    ) -> StatusCode {
        let Some(slot) = store.upload_slot(&token) else {
            return StatusCode::NOT_FOUND;
        };
        let Some(total) = *slot.expected_chunks.lock().unwrap() else {
            return StatusCode::CONFLICT;
        };
        let ordered = {
            let chunks = slot.chunks.lock().unwrap();
            if chunks.len() as u32 != total {
                return StatusCode::CONFLICT;
            }
            let mut ordered = Vec::new();
            for i in 0..total {
                match chunks.get(&i) {
                    Some(bytes) => ordered.extend_from_slice(bytes),
                    None => return StatusCode::CONFLICT,
                }
            }
            ordered
        };
        if awcp_core::sha256_hex(&ordered) != req.checksum {
            return StatusCode::UNPROCESSABLE_ENTITY;
        }
        *slot.completed.lock().unwrap() = Some(ordered);
        slot.notify.notify_waiters();
        StatusCode::OK
    }

    async fn upload_status(
        AxPath(token): AxPath<String>,
        State(store): State<Store>,
    ) -> Result<Json<UploadStatus>, StatusCode> {
        store
            .upload_status(&token)
            .map(|(received, missing)| Json(UploadStatus { received, missing }))
            .ok_or(StatusCode::NOT_FOUND)
    }

    fn router(store: Store) -> Router {
        Router::new()
            .route("/download/{token}", get(download))
            .route("/upload/{token}/chunks", post(upload_chunk))
            .route("/upload/{token}/chunks/complete", post(complete_upload))
            .route("/upload/{token}/chunks/status", get(upload_status))
            .with_state(store)
    }

    pub(super) struct Handle {
        pub(super) base_url: String,
        pub(super) store: Store,
    }

    static SERVER: OnceCell<Handle> = OnceCell::const_new();

    pub(super) async fn handle() -> &'static Handle {
        SERVER
            .get_or_init(|| async {
                let store = Store::default();
                let listener = TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind archive transport server port");
                let addr = listener
                    .local_addr()
                    .expect("read archive transport server local addr");
                let app = router(store.clone());
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "archive transport server exited");
                    }
                });
                Handle {
                    base_url: format!("http://{addr}"),
                    store,
                }
            })
            .await
    }
}

/// Delegator side of the archive transport: packs the environment and
/// waits for the Executor's result to come back.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveDelegatorTransport {
    ttl_headroom: Duration,
}

impl Default for ArchiveDelegatorTransport {
    fn default() -> Self {
        Self {
            ttl_headroom: Duration::from_secs(300),
        }
    }
}

#[async_trait]
impl DelegatorTransport for ArchiveDelegatorTransport {
    async fn prepare(
        &self,
        id: Uuid,
        env_root: &Path,
        ttl_seconds: u64,
    ) -> Result<TransportHandle, AwcpError> {
        let bytes = build_archive(env_root)?;
        let checksum = sha256_hex(&bytes);
        let lease_span = ChronoDuration::seconds(ttl_seconds.min(i64::MAX as u64) as i64);
        let headroom = ChronoDuration::from_std(self.ttl_headroom)
            .unwrap_or_else(|_| ChronoDuration::seconds(300));
        let expires_at = Utc::now() + lease_span + headroom;

        let server = server::handle().await;
        let download_token = format!("{id}-download");
        let upload_token = format!("{id}-upload");
        server.store.register_download(download_token.clone(), bytes.clone());
        server.store.prepare_upload_slot(upload_token.clone());

        let (chunked, inline_base64) = if bytes.len() as u64 > INLINE_THRESHOLD_BYTES {
            let chunks = split_into_chunks(&bytes, CHUNK_SIZE_BYTES);
            let chunk_checksums = chunks.iter().map(|c| c.checksum.clone()).collect();
            (
                Some(ChunkedArchive {
                    chunk_count: chunks.len() as u32,
                    chunk_size: CHUNK_SIZE_BYTES,
                    total_size: bytes.len() as u64,
                    chunk_checksums,
                }),
                None,
            )
        } else {
            (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
            )
        };

        Ok(TransportHandle::Archive {
            download_url: format!("{}/download/{}", server.base_url, download_token),
            upload_url: format!("{}/upload/{}", server.base_url, upload_token),
            checksum,
            expires_at,
            chunked,
            inline_base64,
        })
    }

    async fn apply_result(&self, id: Uuid, dest_root: &Path) -> Result<Vec<String>, AwcpError> {
        let server = server::handle().await;
        let upload_token = format!("{id}-upload");
        let Some(bytes) = server.store.await_upload(&upload_token).await else {
            return Err(AwcpError::new(
                ErrorCode::TaskFailed,
                "no result archive was uploaded for this delegation",
            ));
        };
        extract_archive(&bytes, dest_root)?;
        collect_entry_names(&bytes)
    }

    async fn cleanup(&self, id: Uuid) {
        let server = server::handle().await;
        server.store.drop_download(&format!("{id}-download"));
        server.store.drop_upload(&format!("{id}-upload"));
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_snapshots: true,
            live_sync: false,
        }
    }
}

fn collect_entry_names(bytes: &[u8]) -> Result<Vec<String>, AwcpError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| archive_err("read result archive", e))?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| archive_err("read result archive entry", e))?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

/// Executor side of the archive transport: fetches the environment and
/// ships the result back.
#[derive(Debug, Clone, Default)]
pub struct ArchiveExecutorTransport {
    client: reqwest::Client,
}

#[async_trait]
impl ExecutorTransport for ArchiveExecutorTransport {
    fn check_dependency(&self) -> Result<(), AwcpError> {
        Ok(())
    }

    async fn setup(&self, id: Uuid, handle: &TransportHandle) -> Result<PathBuf, AwcpError> {
        let TransportHandle::Archive {
            download_url,
            checksum,
            expires_at,
            inline_base64,
            ..
        } = handle
        else {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                "archive transport received a non-archive handle",
            ));
        };
        if Utc::now() >= *expires_at {
            return Err(AwcpError::new(
                ErrorCode::StartExpired,
                "archive handle expired before setup",
            ));
        }

        let bytes = if let Some(b64) = inline_base64 {
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| {
                    AwcpError::new(ErrorCode::SetupFailed, "decode inline archive")
                        .with_context("cause", e.to_string())
                })?
        } else {
            self.download_with_retry(download_url).await?
        };

        let actual = sha256_hex(&bytes);
        if &actual != checksum {
            return Err(AwcpError::new(ErrorCode::SetupFailed, "archive checksum mismatch")
                .with_context("expected", checksum.clone())
                .with_context("actual", actual));
        }

        let work_dir = work_dir_for(id);
        std::fs::create_dir_all(&work_dir).map_err(|e| {
            AwcpError::new(ErrorCode::SetupFailed, "create archive work dir").with_source(e)
        })?;
        extract_archive(&bytes, &work_dir)?;
        Ok(work_dir)
    }

    async fn teardown(&self, id: Uuid) {
        let work_dir = work_dir_for(id);
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(delegation_id = %id, error = %e, "failed to remove archive work dir");
            }
        }
    }

    async fn capture_snapshot(
        &self,
        _id: Uuid,
        handle: &TransportHandle,
        work_dir: &Path,
    ) -> Result<Option<CapturedResult>, AwcpError> {
        let TransportHandle::Archive { upload_url, .. } = handle else {
            return Err(AwcpError::new(
                ErrorCode::SetupFailed,
                "archive transport received a non-archive handle",
            ));
        };
        let bytes = build_archive(work_dir)?;
        let checksum = sha256_hex(&bytes);
        let names = collect_entry_names(&bytes)?;
        self.upload_with_retry(upload_url, &bytes).await?;
        Ok(Some(CapturedResult {
            checksum,
            file_count: names.len() as u64,
            total_bytes: bytes.len() as u64,
            changed_files: names,
        }))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_snapshots: true,
            live_sync: false,
        }
    }
}

fn work_dir_for(id: Uuid) -> PathBuf {
    std::env::temp_dir().join("awcp-archives").join(id.to_string())
}

impl ArchiveExecutorTransport {
    async fn download_with_retry(&self, url: &str) -> Result<Vec<u8>, AwcpError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(CHUNK_TIMEOUT, self.client.get(url).send()).await;
            match outcome {
                Ok(Ok(resp)) if resp.status().is_success() => {
                    return resp.bytes().await.map(|b| b.to_vec()).map_err(|e| {
                        AwcpError::new(ErrorCode::SetupFailed, "read archive download body")
                            .with_context("cause", e.to_string())
                    });
                }
                Ok(Ok(resp)) => {
                    warn!(status = %resp.status(), attempt, "archive download attempt failed");
                }
                Ok(Err(e)) => warn!(error = %e, attempt, "archive download attempt errored"),
                Err(_) => warn!(attempt, "archive download attempt timed out"),
            }
            if attempt >= CHUNK_MAX_ATTEMPTS {
                return Err(AwcpError::new(
                    ErrorCode::SetupFailed,
                    format!("failed to download archive from {url} after {attempt} attempts"),
                ));
            }
            tokio::time::sleep(CHUNK_BASE_BACKOFF * attempt).await;
        }
    }

    /// Uploads `bytes` as checksummed chunks, skipping any the server
    /// already holds — a fresh upload and a resumed one after a dropped
    /// connection take the same path.
    async fn upload_with_retry(&self, upload_url: &str, bytes: &[u8]) -> Result<(), AwcpError> {
        let chunks = split_into_chunks(bytes, CHUNK_SIZE_BYTES);
        let total = chunks.len() as u32;
        let received = self.fetch_upload_status(upload_url).await.unwrap_or_default();
        for chunk in &chunks {
            if received.contains(&chunk.index) {
                continue;
            }
            self.post_chunk_with_retry(upload_url, chunk, total).await?;
        }
        self.complete_upload_with_retry(upload_url, &sha256_hex(bytes)).await
    }

    async fn fetch_upload_status(&self, upload_url: &str) -> Option<std::collections::HashSet<u32>> {
        let resp = self
            .client
            .get(format!("{upload_url}/chunks/status"))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let status: UploadStatusResponse = resp.json().await.ok()?;
        Some(status.received.into_iter().collect())
    }

    async fn post_chunk_with_retry(&self, upload_url: &str, chunk: &Chunk, total_chunks: u32) -> Result<(), AwcpError> {
        let url = format!("{upload_url}/chunks");
        let body = ChunkUploadBody {
            index: chunk.index,
            data: base64::engine::general_purpose::STANDARD.encode(&chunk.bytes),
            checksum: chunk.checksum.clone(),
            total_chunks,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(CHUNK_TIMEOUT, self.client.post(&url).json(&body).send()).await;
            match outcome {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(()),
                Ok(Ok(resp)) => warn!(status = %resp.status(), chunk = chunk.index, attempt, "chunk upload attempt failed"),
                Ok(Err(e)) => warn!(error = %e, chunk = chunk.index, attempt, "chunk upload attempt errored"),
                Err(_) => warn!(chunk = chunk.index, attempt, "chunk upload attempt timed out"),
            }
            if attempt >= CHUNK_MAX_ATTEMPTS {
                return Err(AwcpError::new(
                    ErrorCode::TaskFailed,
                    format!("failed to upload chunk {} after {attempt} attempts", chunk.index),
                ));
            }
            tokio::time::sleep(CHUNK_BASE_BACKOFF * attempt).await;
        }
    }

    async fn complete_upload_with_retry(&self, upload_url: &str, checksum: &str) -> Result<(), AwcpError> {
        let url = format!("{upload_url}/chunks/complete");
        let body = CompleteUploadBody {
            checksum: checksum.to_string(),
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(CHUNK_TIMEOUT, self.client.post(&url).json(&body).send()).await;
            match outcome {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(()),
                Ok(Ok(resp)) => warn!(status = %resp.status(), attempt, "complete-upload attempt failed"),
                Ok(Err(e)) => warn!(error = %e, attempt, "complete-upload attempt errored"),
                Err(_) => warn!(attempt, "complete-upload attempt timed out"),
            }
            if attempt >= CHUNK_MAX_ATTEMPTS {
                return Err(AwcpError::new(
                    ErrorCode::TaskFailed,
                    format!("failed to finalize upload after {attempt} attempts"),
                ));
            }
            tokio::time::sleep(CHUNK_BASE_BACKOFF * attempt).await;
        }
    }
}

#[derive(serde::Serialize)]
struct ChunkUploadBody {
    index: u32,
    data: String,
    checksum: String,
    #[serde(rename = "totalChunks")]
    total_chunks: u32,
}

#[derive(serde::Serialize)]
struct CompleteUploadBody {
    checksum: String,
}

#[derive(serde::Deserialize, Default)]
struct UploadStatusResponse {
    received: Vec<u32>,
    #[allow(dead_code)]
    missing: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn archive_round_trips_file_contents() {
        let src = tempdir().unwrap();
        write_file(src.path(), "a.txt", b"hello");
        write_file(src.path(), "nested/b.txt", b"world");

        let bytes = build_archive(src.path()).unwrap();

        let dest = tempdir().unwrap();
        extract_archive(&bytes, dest.path()).unwrap();

        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.path().join("nested/b.txt")).unwrap(), b"world");
    }

    #[test]
    fn archive_excludes_manifest_dir() {
        let src = tempdir().unwrap();
        write_file(src.path(), "a.txt", b"hello");
        write_file(src.path(), ".awcp/manifest.json", b"{}");

        let bytes = build_archive(src.path()).unwrap();
        let dest = tempdir().unwrap();
        extract_archive(&bytes, dest.path()).unwrap();

        assert!(dest.path().join("a.txt").exists());
        assert!(!dest.path().join(".awcp").exists());
    }

    #[test]
    fn extract_rejects_absolute_entry_path() {
        assert!(sanitize_entry_path("/etc/passwd").is_err());
    }

    #[test]
    fn extract_rejects_parent_dir_traversal() {
        assert!(sanitize_entry_path("../../etc/passwd").is_err());
        assert!(sanitize_entry_path("a/../../b").is_err());
    }

    #[test]
    fn extract_accepts_plain_relative_path() {
        assert_eq!(sanitize_entry_path("a/b.txt").unwrap(), Path::new("a/b.txt"));
    }

    #[test]
    fn chunk_round_trip_reassembles_exactly() {
        let data: Vec<u8> = (0..10_000u32).map(|n| (n % 251) as u8).collect();
        let chunks = split_into_chunks(&data, 1024);
        assert!(chunks.len() > 1);
        let reassembled = reassemble_chunks(&chunks).unwrap();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn reassemble_rejects_tampered_chunk() {
        let data = b"hello world".to_vec();
        let mut chunks = split_into_chunks(&data, 4);
        chunks[0].bytes[0] ^= 0xff;
        assert!(reassemble_chunks(&chunks).is_err());
    }

    #[test]
    fn reassemble_rejects_out_of_order_chunks() {
        let data = b"hello world".to_vec();
        let mut chunks = split_into_chunks(&data, 4);
        chunks.swap(0, 1);
        assert!(reassemble_chunks(&chunks).is_err());
    }

    #[tokio::test]
    async fn delegator_prepare_inlines_small_archives() {
        let src = tempdir().unwrap();
        write_file(src.path(), "a.txt", b"hello");

        let transport = ArchiveDelegatorTransport::default();
        let id = Uuid::new_v4();
        let handle = transport.prepare(id, src.path(), 60).await.unwrap();

        match handle {
            TransportHandle::Archive {
                inline_base64,
                chunked,
                ..
            } => {
                assert!(inline_base64.is_some());
                assert!(chunked.is_none());
            }
            _ => panic!("expected an archive handle"),
        }
        transport.cleanup(id).await;
    }

    #[tokio::test]
    async fn delegator_and_executor_round_trip_an_environment() {
        let src = tempdir().unwrap();
        write_file(src.path(), "a.txt", b"hello");
        write_file(src.path(), "nested/b.txt", b"world");

        let delegator = ArchiveDelegatorTransport::default();
        let id = Uuid::new_v4();
        let handle = delegator.prepare(id, src.path(), 60).await.unwrap();

        let executor = ArchiveExecutorTransport::default();
        let work_dir = executor.setup(id, &handle).await.unwrap();
        assert_eq!(fs::read(work_dir.join("a.txt")).unwrap(), b"hello");

        fs::write(work_dir.join("a.txt"), b"changed").unwrap();
        let captured = executor
            .capture_snapshot(id, &handle, &work_dir)
            .await
            .unwrap()
            .expect("archive transport supports snapshots");
        assert!(captured.file_count >= 2);

        let dest = tempdir().unwrap();
        let changed = delegator.apply_result(id, dest.path()).await.unwrap();
        assert!(!changed.is_empty());
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"changed");

        executor.teardown(id).await;
        delegator.cleanup(id).await;
    }

    #[tokio::test]
    async fn chunked_upload_resumes_after_a_dropped_connection() {
        use rand::RngCore;

        let src = tempdir().unwrap();
        let mut filler = vec![0u8; 10 * 1024 * 1024];
        rand::rngs::OsRng.fill_bytes(&mut filler);
        write_file(src.path(), "payload.bin", &filler);

        let bytes = build_archive(src.path()).unwrap();
        let checksum = sha256_hex(&bytes);
        let chunks = split_into_chunks(&bytes, 2 * 1024 * 1024);
        let total = chunks.len() as u32;
        assert!(total > 2, "random payload should span more than two 2MiB chunks");

        let delegator = ArchiveDelegatorTransport::default();
        let id = Uuid::new_v4();
        let handle = delegator.prepare(id, src.path(), 60).await.unwrap();
        let TransportHandle::Archive { upload_url, .. } = handle else {
            panic!("expected an archive handle");
        };

        let client = reqwest::Client::new();
        let post_chunk = |chunk: &Chunk| {
            let url = format!("{upload_url}/chunks");
            let body = serde_json::json!({
                "index": chunk.index,
                "data": base64::engine::general_purpose::STANDARD.encode(&chunk.bytes),
                "checksum": chunk.checksum,
                "totalChunks": total,
            });
            client.post(url).json(&body).send()
        };

        // Connection drops after the first two chunks make it through.
        for chunk in &chunks[..2] {
            let resp = post_chunk(chunk).await.unwrap();
            assert!(resp.status().is_success());
        }

        let status: serde_json::Value = client
            .get(format!("{upload_url}/chunks/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["received"], serde_json::json!([0, 1]));
        let expected_missing: Vec<u32> = (2..total).collect();
        assert_eq!(status["missing"], serde_json::json!(expected_missing));

        // Reconnect and finish the upload.
        for chunk in &chunks[2..] {
            let resp = post_chunk(chunk).await.unwrap();
            assert!(resp.status().is_success());
        }

        let resp = client
            .post(format!("{upload_url}/chunks/complete"))
            .json(&serde_json::json!({ "checksum": checksum }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let dest = tempdir().unwrap();
        let entries = delegator.apply_result(id, dest.path()).await.unwrap();
        assert!(entries.iter().any(|n| n == "payload.bin"));
        assert_eq!(fs::read(dest.path().join("payload.bin")).unwrap(), filler);

        delegator.cleanup(id).await;
    }
}
