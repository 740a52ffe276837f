//! Chunked, resumable, checksum-verified file transfer in both directions
//! over one cache root. The download side accumulates `FileChunk` frames
//! keyed by requestId; the upload side drains a single worker task so disk
//! I/O never blocks the receive path.
use crate::connection::{ConnectionState, PeerConnection};
use crate::error::Result;
use crate::events::TransferEvent;
use crate::external::LocalIndex;
use crate::pairing::crypto::generate_uuid_v4;
use crate::protocol::{
    FileChunkHeader, FileRequestPayload, Frame, MessageType, CHUNK_SIZE, FILE_CHUNK_HEADER_LEN,
};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

const UPLOAD_QUEUE_CAPACITY: usize = 256;
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

struct DownloadState {
    source_device_id: String,
    local_path: PathBuf,
    expected_size: u64,
    expected_checksum: Option<String>,
    file: Arc<AsyncMutex<Option<File>>>,
    bytes_received: u64,
    last_notify_size: u64,
    last_notify_time: Instant,
    status: TransferStatus,
}

struct UploadJob {
    peer: Arc<PeerConnection>,
    request_id: String,
    local_path: String,
    file_id: i64,
    offset: i64,
    length: i64,
}

pub struct FileTransfer {
    cache_root: PathBuf,
    downloads: RwLock<HashMap<String, DownloadState>>,
    local_index: Arc<dyn LocalIndex>,
    event_tx: mpsc::UnboundedSender<TransferEvent>,
    upload_tx: mpsc::Sender<UploadJob>,
}

impl FileTransfer {
    pub fn new(
        cache_root: PathBuf,
        local_index: Arc<dyn LocalIndex>,
        event_tx: mpsc::UnboundedSender<TransferEvent>,
    ) -> Arc<Self> {
        let (upload_tx, upload_rx) = mpsc::channel(UPLOAD_QUEUE_CAPACITY);
        let this = Arc::new(Self {
            cache_root,
            downloads: RwLock::new(HashMap::new()),
            local_index,
            event_tx,
            upload_tx,
        });
        tokio::spawn(upload_worker(upload_rx));
        this
    }

    // -----------------------------------------------------------------
    // Download side
    // -----------------------------------------------------------------

    /// Returns a cache hit's path synchronously via the complete event, or
    /// starts a new download and returns its requestId.
    pub async fn request_file(
        &self,
        conn: &Arc<PeerConnection>,
        source_device_id: &str,
        file_id: i64,
        file_name: &str,
        expected_size: u64,
        checksum: Option<&str>,
    ) -> Result<String> {
        if let Some(path) = self.is_cached(source_device_id, file_id, checksum).await {
            let request_id = generate_uuid_v4();
            let _ = self.event_tx.send(TransferEvent::Completed {
                request_id: request_id.clone(),
                local_path: path.to_string_lossy().into_owned(),
            });
            return Ok(request_id);
        }

        let request_id = generate_uuid_v4();
        let device_dir = self.cache_root.join(source_device_id);
        tokio::fs::create_dir_all(&device_dir).await?;

        let local_path = match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => device_dir.join(format!("{file_id}.{ext}")),
            None => device_dir.join(format!("{file_id}")),
        };

        let file = File::create(&local_path).await?;
        self.downloads.write().insert(
            request_id.clone(),
            DownloadState {
                source_device_id: source_device_id.to_string(),
                local_path: local_path.clone(),
                expected_size,
                expected_checksum: checksum.map(str::to_string),
                file: Arc::new(AsyncMutex::new(Some(file))),
                bytes_received: 0,
                last_notify_size: 0,
                last_notify_time: Instant::now(),
                status: TransferStatus::Pending,
            },
        );

        let payload = FileRequestPayload {
            file_id,
            checksum: checksum.unwrap_or_default().to_string(),
            offset: 0,
            length: 0,
        };
        let frame = match Frame::json(MessageType::FileRequest, request_id.clone(), &payload) {
            Ok(f) => f,
            Err(e) => {
                self.fail_download(&request_id, "failed to issue file request".into()).await;
                return Err(e);
            }
        };

        if let Err(e) = conn.send(frame).await {
            self.fail_download(&request_id, "failed to issue file request".into()).await;
            return Err(e);
        }

        Ok(request_id)
    }

    pub async fn handle_frame(&self, conn: &Arc<PeerConnection>, frame: Frame) -> bool {
        match frame.msg_type {
            MessageType::FileRequest => {
                self.on_file_request(conn, frame).await;
                true
            }
            MessageType::FileResponse => {
                self.on_response(frame).await;
                true
            }
            MessageType::FileChunk => {
                self.on_chunk(frame).await;
                true
            }
            MessageType::FileNotFound => {
                self.fail_download(&frame.request_id, "file not found on remote".into())
                    .await;
                true
            }
            _ => false,
        }
    }

    async fn on_response(&self, frame: Frame) {
        let header = match FileChunkHeader::decode(&frame.payload) {
            Ok(h) => h,
            Err(e) => {
                warn!("malformed FileResponse: {e}");
                return;
            }
        };

        let (bytes_received, expected_size, status_changed) = {
            let mut downloads = self.downloads.write();
            let Some(state) = downloads.get_mut(&frame.request_id) else {
                return;
            };
            let status_changed = state.status != TransferStatus::InProgress;
            state.status = TransferStatus::InProgress;
            state.expected_size = header.total_size.max(0) as u64;
            (state.bytes_received, state.expected_size, status_changed)
        };

        self.maybe_notify_progress(&frame.request_id, bytes_received, expected_size, status_changed)
            .await;
    }

    async fn on_chunk(&self, frame: Frame) {
        if frame.payload.len() < FILE_CHUNK_HEADER_LEN {
            warn!("truncated FileChunk for {}", frame.request_id);
            return;
        }
        let header = match FileChunkHeader::decode(&frame.payload) {
            Ok(h) => h,
            Err(e) => {
                warn!("malformed FileChunk: {e}");
                return;
            }
        };
        let data = &frame.payload[FILE_CHUNK_HEADER_LEN..];

        let (file_handle, write_offset, status_changed) = {
            let mut downloads = self.downloads.write();
            let Some(state) = downloads.get_mut(&frame.request_id) else {
                return;
            };
            let status_changed = state.status != TransferStatus::InProgress;
            state.status = TransferStatus::InProgress;
            (state.file.clone(), state.bytes_received, status_changed)
        };

        {
            let mut guard = file_handle.lock().await;
            let Some(file) = guard.as_mut() else { return };
            if let Err(e) = file.seek(std::io::SeekFrom::Start(write_offset)).await {
                drop(guard);
                self.fail_download(&frame.request_id, format!("seek failed: {e}")).await;
                return;
            }
            if let Err(e) = file.write_all(data).await {
                drop(guard);
                self.fail_download(&frame.request_id, format!("write failed: {e}")).await;
                return;
            }
        }

        let (bytes_received, expected_size, is_last) = {
            let mut downloads = self.downloads.write();
            let Some(state) = downloads.get_mut(&frame.request_id) else {
                return;
            };
            state.bytes_received += data.len() as u64;
            let is_last = header.is_last || state.bytes_received >= state.expected_size;
            (state.bytes_received, state.expected_size, is_last)
        };

        self.maybe_notify_progress(&frame.request_id, bytes_received, expected_size, status_changed)
            .await;

        if is_last {
            self.finish_download(&frame.request_id).await;
        }
    }

    async fn finish_download(&self, request_id: &str) {
        let (local_path, expected_checksum, file_handle) = {
            let downloads = self.downloads.read();
            let Some(state) = downloads.get(request_id) else {
                return;
            };
            (
                state.local_path.clone(),
                state.expected_checksum.clone(),
                state.file.clone(),
            )
        };

        {
            let mut guard = file_handle.lock().await;
            if let Some(mut file) = guard.take() {
                let _ = file.flush().await;
            }
        }

        if let Some(expected) = &expected_checksum {
            let actual = sha256_file(&local_path).await.unwrap_or_default();
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&local_path).await;
                self.downloads.write().remove(request_id);
                let _ = self.event_tx.send(TransferEvent::Failed {
                    request_id: request_id.to_string(),
                    error: crate::error::FamilyVaultError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    }
                    .to_string(),
                });
                return;
            }
        }

        self.downloads.write().remove(request_id);
        let _ = self.event_tx.send(TransferEvent::Completed {
            request_id: request_id.to_string(),
            local_path: local_path.to_string_lossy().into_owned(),
        });
    }

    async fn fail_download(&self, request_id: &str, message: String) {
        let removed = self.downloads.write().remove(request_id);
        let Some(state) = removed else {
            return;
        };
        {
            let mut guard = state.file.lock().await;
            guard.take();
        }
        let _ = tokio::fs::remove_file(&state.local_path).await;
        let _ = self.event_tx.send(TransferEvent::Failed {
            request_id: request_id.to_string(),
            error: message,
        });
    }

    pub async fn cancel_request(&self, request_id: &str) {
        self.fail_download(request_id, "cancelled".into()).await;
    }

    pub async fn cancel_all_requests(&self, source_device_id: &str) {
        let targets: Vec<String> = self
            .downloads
            .read()
            .iter()
            .filter(|(_, state)| state.source_device_id == source_device_id)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in targets {
            self.cancel_request(&request_id).await;
        }
    }

    async fn maybe_notify_progress(
        &self,
        request_id: &str,
        bytes_received: u64,
        expected_size: u64,
        status_changed: bool,
    ) {
        let should_notify = {
            let mut downloads = self.downloads.write();
            let Some(state) = downloads.get_mut(request_id) else {
                return;
            };
            let now = Instant::now();
            let time_elapsed = now.duration_since(state.last_notify_time) >= PROGRESS_MIN_INTERVAL;
            let one_percent = expected_size / 100;
            let bytes_elapsed =
                one_percent > 0 && bytes_received.saturating_sub(state.last_notify_size) >= one_percent;
            let fire = status_changed || time_elapsed || bytes_elapsed;
            if fire {
                state.last_notify_time = now;
                state.last_notify_size = bytes_received;
            }
            fire
        };
        if should_notify {
            let _ = self.event_tx.send(TransferEvent::Progress {
                request_id: request_id.to_string(),
                bytes_received,
                expected_size,
            });
        }
    }

    async fn is_cached(&self, device_id: &str, file_id: i64, checksum: Option<&str>) -> Option<PathBuf> {
        let path = self.get_cached_path(device_id, file_id).await?;
        match checksum {
            Some(expected) => match sha256_file(&path).await {
                Ok(actual) if actual.eq_ignore_ascii_case(expected) => Some(path),
                _ => None,
            },
            None => Some(path),
        }
    }

    /// Any file in the device directory named exactly `{fileId}` or
    /// beginning with `{fileId}.`.
    pub async fn get_cached_path(&self, device_id: &str, file_id: i64) -> Option<PathBuf> {
        let dir = self.cache_root.join(device_id);
        let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
        let exact = file_id.to_string();
        let prefix = format!("{file_id}.");
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == exact || name.starts_with(&prefix) {
                return Some(entry.path());
            }
        }
        None
    }

    pub async fn clear_cache(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.cache_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    pub async fn get_cache_size(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![self.cache_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let ft = entry.file_type().await?;
                if ft.is_dir() {
                    stack.push(entry.path());
                } else if ft.is_file() {
                    total += entry.metadata().await?.len();
                }
            }
        }
        Ok(total)
    }

    // -----------------------------------------------------------------
    // Upload side
    // -----------------------------------------------------------------

    async fn on_file_request(&self, conn: &Arc<PeerConnection>, frame: Frame) {
        let request: FileRequestPayload = match frame.parse_json() {
            Ok(r) => r,
            Err(e) => {
                warn!("malformed FileRequest: {e}");
                return;
            }
        };

        let path = match self.local_index.lookup_path(request.file_id).await {
            Ok(Some(path)) => path,
            _ => {
                let not_found = Frame::new(MessageType::FileNotFound, frame.request_id.clone(), Vec::new());
                let _ = conn.send(not_found).await;
                return;
            }
        };

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let not_found = Frame::new(MessageType::FileNotFound, frame.request_id.clone(), Vec::new());
            let _ = conn.send(not_found).await;
            return;
        }

        let job = UploadJob {
            peer: conn.clone(),
            request_id: frame.request_id,
            local_path: path,
            file_id: request.file_id,
            offset: request.offset,
            length: request.length,
        };

        if self.upload_tx.send(job).await.is_err() {
            warn!("upload queue closed, dropping job for file {}", request.file_id);
        }
    }
}

/// Single worker draining the upload queue so disk I/O never blocks a
/// receive path. Concurrency across peers is emergent: each job still
/// sends into its own peer's serialized send path.
async fn upload_worker(mut jobs: mpsc::Receiver<UploadJob>) {
    while let Some(job) = jobs.recv().await {
        if let Err(e) = run_upload(job).await {
            warn!("upload job failed: {e}");
        }
    }
}

async fn run_upload(job: UploadJob) -> Result<()> {
    let mut file = File::open(&job.local_path).await?;
    let total_size = file.metadata().await?.len() as i64;
    let offset = job.offset.max(0);
    file.seek(std::io::SeekFrom::Start(offset as u64)).await?;

    let bytes_to_send = if job.length > 0 {
        job.length
    } else {
        total_size - offset
    };

    let response_header = FileChunkHeader {
        file_id: job.file_id,
        offset,
        total_size,
        chunk_size: 0,
        is_last: false,
    };
    let response = Frame::new(
        MessageType::FileResponse,
        job.request_id.clone(),
        response_header.encode().to_vec(),
    );
    if job.peer.send(response).await.is_err() {
        return Ok(());
    }

    let mut sent: i64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while sent < bytes_to_send {
        if job.peer.state() != ConnectionState::Connected {
            break;
        }
        let want = std::cmp::min(CHUNK_SIZE as i64, bytes_to_send - sent) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        let is_last = sent + n as i64 >= bytes_to_send;
        let header = FileChunkHeader {
            file_id: job.file_id,
            offset: offset + sent,
            total_size,
            chunk_size: n as i32,
            is_last,
        };
        let mut payload = header.encode().to_vec();
        payload.extend_from_slice(&buf[..n]);
        let frame = Frame::new(MessageType::FileChunk, job.request_id.clone(), payload);
        if job.peer.send(frame).await.is_err() {
            break;
        }
        sent += n as i64;
    }
    Ok(())
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IndexDeltaPayload;

    struct NoopIndex;
    #[async_trait::async_trait]
    impl LocalIndex for NoopIndex {
        async fn lookup_path(&self, _file_id: i64) -> Result<Option<String>> {
            Ok(None)
        }
        async fn list_changes_since(
            &self,
            _since: i64,
            _limit: usize,
            _offset: usize,
        ) -> Result<Vec<IndexDeltaPayload>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn cached_path_matches_exact_and_prefixed_names() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device-a");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        tokio::fs::write(device_dir.join("42.jpg"), b"data").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let transfer = FileTransfer::new(dir.path().to_path_buf(), Arc::new(NoopIndex), tx);
        let found = transfer.get_cached_path("device-a", 42).await;
        assert_eq!(found, Some(device_dir.join("42.jpg")));
    }

    #[tokio::test]
    async fn cache_size_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device-a");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        tokio::fs::write(device_dir.join("1"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(device_dir.join("2.png"), vec![0u8; 20]).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let transfer = FileTransfer::new(dir.path().to_path_buf(), Arc::new(NoopIndex), tx);
        assert_eq!(transfer.get_cache_size().await.unwrap(), 30);
    }

    #[tokio::test]
    async fn sequential_chunks_accumulate_into_correct_offsets() {
        // Regression test: on_chunk must be driven strictly in wire order by
        // its caller (the connection's single receive loop dispatching
        // through an awaited MessageHandler). Calling it out of order or
        // concurrently for the same requestId would corrupt bytes_received.
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device-a");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        let local_path = device_dir.join("7");
        let file = File::create(&local_path).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transfer = FileTransfer::new(dir.path().to_path_buf(), Arc::new(NoopIndex), tx);

        let request_id = "req-1".to_string();
        transfer.downloads.write().insert(
            request_id.clone(),
            DownloadState {
                source_device_id: "device-a".into(),
                local_path: local_path.clone(),
                expected_size: 8,
                expected_checksum: None,
                file: Arc::new(AsyncMutex::new(Some(file))),
                bytes_received: 0,
                last_notify_size: 0,
                last_notify_time: Instant::now(),
                status: TransferStatus::Pending,
            },
        );

        let make_chunk = |offset: i64, data: &[u8], is_last: bool| {
            let header = FileChunkHeader {
                file_id: 7,
                offset,
                total_size: 8,
                chunk_size: data.len() as i32,
                is_last,
            };
            let mut payload = header.encode().to_vec();
            payload.extend_from_slice(data);
            Frame::new(MessageType::FileChunk, request_id.clone(), payload)
        };

        transfer.on_chunk(make_chunk(0, b"abcd", false)).await;
        transfer.on_chunk(make_chunk(4, b"efgh", true)).await;

        let contents = tokio::fs::read(&local_path).await.unwrap();
        assert_eq!(contents, b"abcdefgh");
        assert!(transfer.downloads.read().get(&request_id).is_none());

        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TransferEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn clear_cache_removes_device_directories() {
        let dir = tempfile::tempdir().unwrap();
        let device_dir = dir.path().join("device-a");
        tokio::fs::create_dir_all(&device_dir).await.unwrap();
        tokio::fs::write(device_dir.join("1"), b"x").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let transfer = FileTransfer::new(dir.path().to_path_buf(), Arc::new(NoopIndex), tx);
        transfer.clear_cache().await.unwrap();
        assert!(transfer.get_cached_path("device-a", 1).await.is_none());
    }
}
