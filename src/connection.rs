//! A single handshaken peer connection: device-info exchange, heartbeat
//! keepalive, a serialized send path, and request/response correlation over
//! the framed protocol. One `PeerConnection` wraps one TLS stream; the
//! coordinator owns the registry of these.
use crate::device::{DeviceIdentity, DeviceInfo, DeviceType};
use crate::error::{FamilyVaultError, Result};
use crate::events::NetworkEvent;
use crate::protocol::{DeviceInfoPayload, Frame, Framer, MessageType};
use crate::tls::{ClientStream, ServerStream};
use crate::util::now_unix;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const PROTOCOL_VERSION: i32 = 1;
const DEVICE_INFO_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEAD_CONNECTION_THRESHOLD: Duration = Duration::from_secs(90);
const SEND_AND_WAIT_DEFAULT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Error = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Dispatch target for frames that are neither heartbeats nor correlated
/// responses to an outstanding `send_and_wait`. Implemented by whatever owns
/// the connection registry (the coordinator). Dispatch awaits this directly
/// from the single per-connection receive loop, so implementations observe
/// frames in wire order; spawning independent tasks per call would break
/// that ordering guarantee.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, conn: Arc<PeerConnection>, frame: Frame);
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// One live, authenticated connection to a peer. Both sides have completed
/// TLS and the device-info exchange by the time this exists.
pub struct PeerConnection {
    pub peer: RwLock<DeviceInfo>,
    state: AtomicU8,
    last_activity: AtomicI64,
    writer: AsyncMutex<BoxedWriter>,
    pending: RwLock<HashMap<String, oneshot::Sender<Frame>>>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    handler: Arc<dyn MessageHandler>,
    receive_task: SyncMutex<Option<JoinHandle<()>>>,
    heartbeat_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn device_id(&self) -> String {
        self.peer.read().device_id.clone()
    }

    fn touch(&self) {
        self.last_activity.store(now_unix(), Ordering::SeqCst);
    }

    /// Client side: dial, handshake, exchange device info, and (client only)
    /// trust the server's announced identity without cross-checking it.
    pub async fn connect(
        addr: SocketAddr,
        psk: &[u8],
        our_identity: &DeviceIdentity,
        our_info: DeviceInfoPayload,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<PeerConnection>> {
        let stream = crate::tls::connect(addr, psk, &our_identity.device_id).await?;
        let (reader, writer) = tokio::io::split(stream);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) =
            (Box::new(reader), Box::new(writer));

        let peer_payload = device_info_exchange(&mut reader, &mut writer, &our_info).await?;
        let peer_info = DeviceInfo {
            device_id: peer_payload.device_id,
            device_name: peer_payload.device_name,
            device_type: DeviceType::from_wire(peer_payload.device_type),
            ip_address: addr.ip().to_string(),
            service_port: addr.port(),
            file_count: peer_payload.file_count,
            last_seen_at: now_unix(),
        };

        Ok(Self::spawn(peer_info, reader, writer, event_tx, handler))
    }

    /// Server side: the coordinator hands in an already-handshaken TLS
    /// stream plus the identity captured off the ClientHello SNI. Exchange
    /// device info, then fail fast (`AuthMismatch`) if the peer's announced
    /// `deviceId` does not match that identity, before any other frame is
    /// processed.
    pub async fn accept(
        stream: ServerStream,
        tls_identity: &str,
        remote_addr: SocketAddr,
        our_info: DeviceInfoPayload,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<PeerConnection>> {
        let (reader, writer) = tokio::io::split(stream);
        let (mut reader, mut writer): (BoxedReader, BoxedWriter) =
            (Box::new(reader), Box::new(writer));

        let peer_payload = device_info_exchange(&mut reader, &mut writer, &our_info).await?;

        if peer_payload.device_id != tls_identity {
            warn!(
                "identity mismatch: TLS identity {tls_identity} announced deviceId {}",
                peer_payload.device_id
            );
            return Err(FamilyVaultError::AuthMismatch);
        }

        let peer_info = DeviceInfo {
            device_id: peer_payload.device_id,
            device_name: peer_payload.device_name,
            device_type: DeviceType::from_wire(peer_payload.device_type),
            ip_address: remote_addr.ip().to_string(),
            service_port: remote_addr.port(),
            file_count: peer_payload.file_count,
            last_seen_at: now_unix(),
        };

        Ok(Self::spawn(peer_info, reader, writer, event_tx, handler))
    }

    fn spawn(
        peer_info: DeviceInfo,
        reader: BoxedReader,
        writer: BoxedWriter,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<PeerConnection> {
        let conn = Arc::new(PeerConnection {
            peer: RwLock::new(peer_info.clone()),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            last_activity: AtomicI64::new(now_unix()),
            writer: AsyncMutex::new(writer),
            pending: RwLock::new(HashMap::new()),
            event_tx: event_tx.clone(),
            handler,
            receive_task: SyncMutex::new(None),
            heartbeat_task: SyncMutex::new(None),
        });

        let receive_conn = conn.clone();
        let receive_handle = tokio::spawn(async move {
            receive_conn.receive_loop(reader).await;
        });
        *conn.receive_task.lock() = Some(receive_handle);

        let heartbeat_conn = conn.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat_conn.heartbeat_loop().await;
        });
        *conn.heartbeat_task.lock() = Some(heartbeat_handle);

        let _ = event_tx.send(NetworkEvent::DeviceConnected(peer_info));
        conn
    }

    async fn receive_loop(self: Arc<Self>, mut reader: BoxedReader) {
        let mut framer = Framer::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("connection to {} closed by peer", self.device_id());
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    self.report_error(format!("read error: {e}"));
                    break;
                }
            };
            framer.feed(&buf[..n]);
            loop {
                match framer.next_frame() {
                    Ok(Some(frame)) => {
                        self.touch();
                        self.dispatch(frame).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.report_error(format!("protocol violation: {e}"));
                        self.teardown(ConnectionState::Error);
                        return;
                    }
                }
            }
        }
        self.teardown(ConnectionState::Disconnected);
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame.msg_type {
            MessageType::Heartbeat => {
                let ack = Frame::new(MessageType::HeartbeatAck, frame.request_id.clone(), Vec::new());
                if let Err(e) = self.write_frame(&ack).await {
                    warn!("failed to ack heartbeat from {}: {e}", self.device_id());
                }
            }
            MessageType::HeartbeatAck => {}
            MessageType::Disconnect => {
                self.teardown(ConnectionState::Disconnected);
            }
            _ => {
                if !frame.request_id.is_empty() {
                    let waiter = self.pending.write().remove(&frame.request_id);
                    if let Some(tx) = waiter {
                        let _ = tx.send(frame);
                        return;
                    }
                }
                self.handler.handle(self.clone(), frame).await;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tick.tick().await;
            if self.state() != ConnectionState::Connected {
                break;
            }
            let elapsed = now_unix() - self.last_activity.load(Ordering::SeqCst);
            if elapsed > DEAD_CONNECTION_THRESHOLD.as_secs() as i64 {
                self.report_error("connection dead: no activity within threshold".into());
                self.teardown(ConnectionState::Error);
                break;
            }
            let heartbeat = Frame::new(
                MessageType::Heartbeat,
                crate::pairing::crypto::generate_uuid_v4(),
                Vec::new(),
            );
            if let Err(e) = self.write_frame(&heartbeat).await {
                warn!("failed to send heartbeat to {}: {e}", self.device_id());
                self.teardown(ConnectionState::Error);
                break;
            }
        }
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = frame.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Serialized send; does not wait for a response.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FamilyVaultError::NetworkError("connection is not active".into()));
        }
        self.write_frame(&frame).await
    }

    /// Sends `frame` (assigning a request id if empty) and waits up to
    /// `deadline` for the correlated response.
    pub async fn send_and_wait(&self, mut frame: Frame, deadline: Option<Duration>) -> Result<Frame> {
        if frame.request_id.is_empty() {
            frame.request_id = crate::pairing::crypto::generate_uuid_v4();
        }
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(frame.request_id.clone(), tx);

        if let Err(e) = self.write_frame(&frame).await {
            self.pending.write().remove(&frame.request_id);
            return Err(e);
        }

        let wait = deadline.unwrap_or(SEND_AND_WAIT_DEFAULT);
        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(FamilyVaultError::NetworkError(
                "connection closed while awaiting response".into(),
            )),
            Err(_) => {
                self.pending.write().remove(&frame.request_id);
                Err(FamilyVaultError::Timeout("send_and_wait".into()))
            }
        }
    }

    fn report_error(&self, message: String) {
        let _ = self.event_tx.send(NetworkEvent::Error {
            scope: format!("connection:{}", self.device_id()),
            message,
        });
    }

    /// Tears the connection down, detecting the self-join hazard: if called
    /// from within our own receive or heartbeat task, that task is detached
    /// rather than joined, otherwise the program would deadlock awaiting
    /// itself.
    fn teardown(&self, final_state: ConnectionState) {
        let prior = self.state();
        if prior == ConnectionState::Disconnected || prior == ConnectionState::Error {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);

        let current = tokio::task::try_id();

        if let Some(handle) = self.receive_task.lock().take() {
            if current != Some(handle.id()) {
                handle.abort();
            }
        }
        if let Some(handle) = self.heartbeat_task.lock().take() {
            if current != Some(handle.id()) {
                handle.abort();
            }
        }

        self.set_state(final_state);
        let _ = self
            .event_tx
            .send(NetworkEvent::DeviceDisconnected(self.device_id()));
    }

    /// Public teardown entry point; best-effort sends a `Disconnect` frame
    /// first.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Connected {
            let frame = Frame::new(MessageType::Disconnect, "", Vec::new());
            let _ = self.write_frame(&frame).await;
        }
        self.teardown(ConnectionState::Disconnected);
    }
}

/// Sends our `DeviceInfo`, then accumulates partial reads until one complete
/// frame arrives, within the exchange deadline. TLS may fragment arbitrarily.
async fn device_info_exchange(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    our_info: &DeviceInfoPayload,
) -> Result<DeviceInfoPayload> {
    let fut = async {
        let frame = Frame::json(MessageType::DeviceInfo, "", our_info)?;
        let bytes = frame.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;

        let mut framer = Framer::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(FamilyVaultError::NetworkError(
                    "connection closed during device-info exchange".into(),
                ));
            }
            framer.feed(&buf[..n]);
            if let Some(frame) = framer.next_frame()? {
                if frame.msg_type != MessageType::DeviceInfo {
                    return Err(FamilyVaultError::Protocol(
                        "expected DeviceInfo".into(),
                    ));
                }
                return frame.parse_json::<DeviceInfoPayload>();
            }
        }
    };

    timeout(DEVICE_INFO_DEADLINE, fut)
        .await
        .map_err(|_| FamilyVaultError::Timeout("device-info exchange".into()))?
}

pub fn device_info_payload(identity: &DeviceIdentity, file_count: i64, last_sync_timestamp: i64) -> DeviceInfoPayload {
    DeviceInfoPayload {
        device_id: identity.device_id.clone(),
        device_name: identity.device_name.clone(),
        device_type: identity.device_type as i32,
        protocol_version: PROTOCOL_VERSION,
        file_count,
        last_sync_timestamp,
    }
}
