//! The single entry point a host application constructs: wires PairingCore,
//! NetworkCoordinator, FileTransfer, and IndexSync together and dispatches
//! inbound frames that are neither heartbeats nor correlated responses to
//! whichever of FileTransfer/IndexSync claims the message type.
use crate::connection::{MessageHandler, PeerConnection};
use crate::device::{DeviceIdentity, DeviceType};
use crate::error::{FamilyVaultError, Result};
use crate::events::{NetworkEvent, TransferEvent};
use crate::external::{Database, LocalIndex};
use crate::file_transfer::FileTransfer;
use crate::index_sync::IndexSync;
use crate::pairing::{JoinResult, PairingCore, PairingInfo};
use crate::protocol::Frame;
use crate::secure_storage::SecureStorage;
use crate::tls::IdentityValidator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct FamilyVault {
    pub pairing: Arc<PairingCore>,
    pub coordinator: Arc<crate::coordinator::NetworkCoordinator>,
    pub file_transfer: Arc<FileTransfer>,
    pub index_sync: Arc<IndexSync>,
}

impl FamilyVault {
    pub fn new(
        storage: Arc<dyn SecureStorage>,
        local_index: Arc<dyn LocalIndex>,
        database: Arc<dyn Database>,
        cache_root: PathBuf,
        device_name: &str,
        device_type: DeviceType,
        pairing_port: Option<u16>,
        network_events: mpsc::UnboundedSender<NetworkEvent>,
        transfer_events: mpsc::UnboundedSender<TransferEvent>,
        identity_validator: Option<IdentityValidator>,
    ) -> Result<Self> {
        let pairing = PairingCore::new(storage, device_name, device_type, pairing_port)?;
        let identity = DeviceIdentity::new(pairing.device_id().to_string(), pairing.device_name(), device_type);

        let file_transfer = FileTransfer::new(cache_root, local_index.clone(), transfer_events);
        let index_sync = IndexSync::new(local_index, database);

        let handler: Arc<dyn MessageHandler> = Arc::new(CoreDispatcher {
            file_transfer: file_transfer.clone(),
            index_sync: index_sync.clone(),
        });

        let coordinator = crate::coordinator::NetworkCoordinator::new(
            identity,
            pairing.clone(),
            handler,
            network_events,
            identity_validator,
        );

        Ok(Self {
            pairing,
            coordinator,
            file_transfer,
            index_sync,
        })
    }

    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        self.coordinator.start(port).await
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }

    pub async fn create_family(&self) -> Result<PairingInfo> {
        self.pairing.create_family().await
    }

    pub async fn regenerate_pin(&self) -> Result<PairingInfo> {
        self.pairing.regenerate_pin().await
    }

    pub fn cancel_pairing(&self) {
        self.pairing.cancel_pairing();
    }

    pub async fn join_by_pin(&self, pin: &str, host: &str, port: u16) -> Result<JoinResult> {
        self.pairing.join_by_pin(pin, host, port).await
    }

    pub async fn join_by_qr(&self, data: &str) -> Result<JoinResult> {
        self.pairing.join_by_qr(data).await
    }

    pub fn is_configured(&self) -> bool {
        self.pairing.is_configured()
    }

    pub fn reset(&self) -> Result<()> {
        self.pairing.reset()
    }

    pub fn connect_to_address(&self, addr: SocketAddr) {
        self.coordinator.connect_to_address(addr);
    }

    pub async fn disconnect_from_device(&self, device_id: &str) {
        self.coordinator.disconnect_from_device(device_id).await;
    }

    fn find_connection(&self, device_id: &str) -> Result<Arc<PeerConnection>> {
        self.coordinator
            .find_connection(device_id)
            .ok_or_else(|| FamilyVaultError::NotFound(format!("not connected to {device_id}")))
    }

    pub async fn request_file(
        &self,
        device_id: &str,
        file_id: i64,
        file_name: &str,
        expected_size: u64,
        checksum: Option<&str>,
    ) -> Result<String> {
        let conn = self.find_connection(device_id)?;
        self.file_transfer
            .request_file(&conn, device_id, file_id, file_name, expected_size, checksum)
            .await
    }

    pub async fn sync_with(&self, device_id: &str) -> Result<()> {
        let conn = self.find_connection(device_id)?;
        self.index_sync.request_sync(&conn, device_id).await
    }
}

struct CoreDispatcher {
    file_transfer: Arc<FileTransfer>,
    index_sync: Arc<IndexSync>,
}

#[async_trait::async_trait]
impl MessageHandler for CoreDispatcher {
    async fn handle(&self, conn: Arc<PeerConnection>, frame: Frame) {
        if self.index_sync.handle_frame(&conn, frame.clone()).await {
            return;
        }
        if self.file_transfer.handle_frame(&conn, frame.clone()).await {
            return;
        }
        debug!("unhandled message type {:?} from {}", frame.msg_type, conn.device_id());
    }
}
