//! Contracts for the collaborators this crate treats as external: the local
//! file scanner/index and the SQL database. Neither is implemented here —
//! the host application supplies them. Mirrors the teacher's pattern of
//! keeping platform/storage collaborators behind a narrow trait rather than
//! depending on a concrete database crate.
use crate::error::Result;
use crate::protocol::IndexDeltaPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A visibility marker on a local file or its containing folder; only
/// `Family` content is ever gossiped to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Family,
    Private,
}

/// Read-through view the core needs over the local file index it does not
/// own: resolve a fileId to an absolute path for uploads, and enumerate
/// local changes for `IndexSync`'s producer side.
#[async_trait]
pub trait LocalIndex: Send + Sync {
    async fn lookup_path(&self, file_id: i64) -> Result<Option<String>>;

    /// Rows with `modifiedAt > since` whose effective visibility is
    /// `Family`, paginated. `Private` rows are never returned.
    async fn list_changes_since(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<IndexDeltaPayload>>;
}

/// A row describing a file on another node, as persisted by `IndexSync` and
/// read by search. Primary key is `(source_device_id, remote_file_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    pub source_device_id: String,
    pub remote_file_id: i64,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: String,
    pub extracted_text: Option<String>,
    pub synced_at: i64,
    pub is_deleted: bool,
}

impl From<IndexDeltaPayload> for RemoteFileRecord {
    fn from(delta: IndexDeltaPayload) -> Self {
        Self {
            source_device_id: delta.device_id,
            remote_file_id: delta.file_id,
            path: delta.path,
            name: delta.name,
            mime_type: delta.mime_type,
            size: delta.size,
            modified_at: delta.modified_at,
            checksum: delta.checksum,
            extracted_text: delta.extracted_text,
            synced_at: delta.sync_timestamp,
            is_deleted: delta.is_deleted,
        }
    }
}

/// Database handle the core persists remote-file records and per-peer sync
/// cursors through. Implementations are responsible for serializing their
/// own access and for transactional upsert semantics.
#[async_trait]
pub trait Database: Send + Sync {
    async fn upsert_remote_files(&self, records: &[RemoteFileRecord]) -> Result<()>;

    async fn get_sync_cursor(&self, device_id: &str) -> Result<i64>;

    async fn set_sync_cursor(&self, device_id: &str, last_sync_timestamp: i64) -> Result<()>;
}
