//! Plaintext TCP request/response transport used exclusively to exchange
//! the family secret under the authority of a one-time PIN. One framed
//! request, one framed response, then close. Security relies entirely on
//! the PIN, the session TTL, and the rate limit — not on this transport.
use crate::error::{FamilyVaultError, Result};
use crate::protocol::{Frame, Framer, MessageType, PairingRequestPayload, PairingResponsePayload};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_PAIRING_PORT: u16 = 45680;
const CONNECTION_DEADLINE: Duration = Duration::from_secs(10);

pub trait PairingRequestHandler: Send + Sync {
    fn handle(&self, request: PairingRequestPayload) -> PairingResponsePayload;
}

pub struct PairingServerHandle {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl PairingServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Binds `port` (0 = OS-assigned) and serially accepts one pairing
/// connection at a time: pairing is low-frequency, so there is no benefit
/// to concurrent handling and every simplification helps auditability.
pub async fn spawn_server(
    port: u16,
    handler: Arc<dyn PairingRequestHandler>,
) -> Result<PairingServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;
    let running = Arc::new(AtomicBool::new(true));
    let running_task = running.clone();

    let task = tokio::spawn(async move {
        while running_task.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("pairing accept failed: {e}");
                    continue;
                }
            };
            debug!("pairing connection from {peer}");
            if let Err(e) = handle_connection(stream, handler.as_ref()).await {
                debug!("pairing connection from {peer} ended with error: {e}");
            }
        }
    });

    Ok(PairingServerHandle {
        running,
        local_addr,
        task,
    })
}

async fn handle_connection(mut stream: TcpStream, handler: &dyn PairingRequestHandler) -> Result<()> {
    let result = timeout(CONNECTION_DEADLINE, read_one_frame(&mut stream)).await;
    let frame = match result {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            let _ = send_error_response(&mut stream, &e.to_string()).await;
            return Err(e);
        }
        Err(_) => {
            let _ = send_error_response(&mut stream, "pairing request timed out").await;
            return Err(FamilyVaultError::Timeout("pairing connection".into()));
        }
    };

    if frame.msg_type != MessageType::PairingRequest {
        let _ = send_error_response(&mut stream, "expected PairingRequest").await;
        return Err(FamilyVaultError::Protocol(
            "expected PairingRequest".into(),
        ));
    }

    let request: PairingRequestPayload = match frame.parse_json() {
        Ok(r) => r,
        Err(e) => {
            let _ = send_error_response(&mut stream, "malformed pairing request").await;
            return Err(e);
        }
    };

    let response = handler.handle(request);
    let response_frame = Frame::json(MessageType::PairingResponse, "", &response)?;
    write_frame(&mut stream, &response_frame).await?;
    Ok(())
}

async fn send_error_response(stream: &mut TcpStream, message: &str) -> Result<()> {
    let response = PairingResponsePayload::failure("INVALID_REQUEST", message);
    let frame = Frame::json(MessageType::PairingResponse, "", &response)?;
    write_frame(stream, &frame).await
}

async fn read_one_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut framer = Framer::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(FamilyVaultError::NetworkError(
                "connection closed before a full frame arrived".into(),
            ));
        }
        framer.feed(&buf[..n]);
        if let Some(frame) = framer.next_frame()? {
            return Ok(frame);
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> Result<()> {
    let bytes = frame.encode()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Dials `host:port`, sends one `PairingRequest`, and waits up to 10s total
/// for a complete `PairingResponse`.
pub async fn request(
    host: &str,
    port: u16,
    request: PairingRequestPayload,
) -> Result<PairingResponsePayload> {
    let fut = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        let frame = Frame::json(MessageType::PairingRequest, "", &request)?;
        write_frame(&mut stream, &frame).await?;
        let response_frame = read_one_frame(&mut stream).await?;
        if response_frame.msg_type != MessageType::PairingResponse {
            return Err(FamilyVaultError::Protocol(
                "expected PairingResponse".into(),
            ));
        }
        response_frame.parse_json::<PairingResponsePayload>()
    };

    timeout(CONNECTION_DEADLINE, fut)
        .await
        .map_err(|_| FamilyVaultError::Timeout("pairing request".into()))?
}
