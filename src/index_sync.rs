//! Per-peer delta sync: the consumer side asks for everything since its
//! cursor and ingests a stream of `IndexDelta` frames terminated by an
//! `IndexSyncResponse` ack; the producer side answers the same request by
//! paging the local index in batches of 100. Neither side is correlated
//! through `PeerConnection::send_and_wait` because a stream of many frames
//! shares one requestId -- `sendAndWait`'s single-fire slot does not fit a
//! stream, so sync frames are dispatched through the plain message callback
//! instead and correlated here by requestId.
use crate::connection::PeerConnection;
use crate::error::{FamilyVaultError, Result};
use crate::external::{Database, LocalIndex, RemoteFileRecord};
use crate::pairing::crypto::generate_uuid_v4;
use crate::protocol::{Frame, IndexSyncRequestPayload, MessageType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 100;
const SYNC_DEADLINE: Duration = Duration::from_secs(60);

struct SyncSession {
    peer_device_id: String,
    buffer: Vec<RemoteFileRecord>,
    max_timestamp: i64,
    done: Option<oneshot::Sender<Result<()>>>,
}

pub struct IndexSync {
    local_index: Arc<dyn LocalIndex>,
    database: Arc<dyn Database>,
    sessions: RwLock<HashMap<String, SyncSession>>,
}

impl IndexSync {
    pub fn new(local_index: Arc<dyn LocalIndex>, database: Arc<dyn Database>) -> Arc<Self> {
        Arc::new(Self {
            local_index,
            database,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Consumer side: asks `peer_device_id` for everything since our cursor
    /// for it, and waits for the stream to finish.
    pub async fn request_sync(&self, conn: &Arc<PeerConnection>, peer_device_id: &str) -> Result<()> {
        let since = self.database.get_sync_cursor(peer_device_id).await?;
        let request_id = generate_uuid_v4();
        let (tx, rx) = oneshot::channel();
        self.sessions.write().insert(
            request_id.clone(),
            SyncSession {
                peer_device_id: peer_device_id.to_string(),
                buffer: Vec::new(),
                max_timestamp: since,
                done: Some(tx),
            },
        );

        let payload = IndexSyncRequestPayload {
            since_timestamp: since,
            folder_ids: Vec::new(),
        };
        let frame = match Frame::json(MessageType::IndexSyncRequest, request_id.clone(), &payload) {
            Ok(f) => f,
            Err(e) => {
                self.sessions.write().remove(&request_id);
                return Err(e);
            }
        };
        if let Err(e) = conn.send(frame).await {
            self.sessions.write().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(SYNC_DEADLINE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FamilyVaultError::NetworkError(
                "connection closed during index sync".into(),
            )),
            Err(_) => {
                self.sessions.write().remove(&request_id);
                Err(FamilyVaultError::Timeout("index sync".into()))
            }
        }
    }

    /// Returns `true` if `frame` was an index-sync frame it consumed.
    pub async fn handle_frame(&self, conn: &Arc<PeerConnection>, frame: Frame) -> bool {
        match frame.msg_type {
            MessageType::IndexSyncRequest => {
                if let Err(e) = self.serve_request(conn, &frame).await {
                    warn!("failed to serve index sync request: {e}");
                }
                true
            }
            MessageType::IndexDelta => {
                self.ingest_delta(&frame).await;
                true
            }
            MessageType::IndexSyncResponse => {
                self.finalize(&frame).await;
                true
            }
            _ => false,
        }
    }

    /// Producer side: page the local index and stream deltas back, sharing
    /// the incoming requestId, then send the terminal ack.
    async fn serve_request(&self, conn: &Arc<PeerConnection>, frame: &Frame) -> Result<()> {
        let request: IndexSyncRequestPayload = frame.parse_json()?;
        let mut offset = 0usize;
        loop {
            let page = self
                .local_index
                .list_changes_since(request.since_timestamp, PAGE_SIZE, offset)
                .await?;
            let count = page.len();
            for delta in page {
                let delta_frame = Frame::json(MessageType::IndexDelta, frame.request_id.clone(), &delta)?;
                conn.send(delta_frame).await?;
            }
            if count < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        let ack = Frame::new(MessageType::IndexSyncResponse, frame.request_id.clone(), Vec::new());
        conn.send(ack).await
    }

    async fn ingest_delta(&self, frame: &Frame) {
        let payload: crate::protocol::IndexDeltaPayload = match frame.parse_json() {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed IndexDelta: {e}");
                return;
            }
        };
        let record: RemoteFileRecord = payload.into();
        let ready_to_flush = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(&frame.request_id) else {
                debug!("IndexDelta for unknown session {}", frame.request_id);
                return;
            };
            session.max_timestamp = session.max_timestamp.max(record.synced_at);
            session.buffer.push(record);
            session.buffer.len() >= PAGE_SIZE
        };
        if ready_to_flush {
            self.flush(&frame.request_id).await;
        }
    }

    async fn flush(&self, request_id: &str) {
        let batch = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(request_id) {
                Some(session) if !session.buffer.is_empty() => std::mem::take(&mut session.buffer),
                _ => return,
            }
        };
        if let Err(e) = self.database.upsert_remote_files(&batch).await {
            warn!("failed to persist remote file batch: {e}");
        }
    }

    async fn finalize(&self, frame: &Frame) {
        self.flush(&frame.request_id).await;

        let session = self.sessions.write().remove(&frame.request_id);
        let Some(mut session) = session else {
            return;
        };

        let result = self
            .database
            .set_sync_cursor(&session.peer_device_id, session.max_timestamp)
            .await;
        if let Some(done) = session.done.take() {
            let _ = done.send(result);
        }
    }
}
