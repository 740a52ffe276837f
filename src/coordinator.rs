//! The single public entry point higher layers talk to: owns the listener,
//! the accept loop, the peer registry, duplicate-connection arbitration, and
//! broadcast/unicast fan-out. `Discovery` and `PeerConnection` are composed
//! here but neither depends on this module.
use crate::connection::{device_info_payload, ConnectionState, MessageHandler, PeerConnection};
use crate::device::{DeviceIdentity, DeviceInfo};
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::error::{FamilyVaultError, Result};
use crate::events::NetworkEvent;
use crate::pairing::PairingCore;
use crate::protocol::Frame;
use crate::tls::{IdentityValidator, TlsPskServer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SERVICE_PORT: u16 = 45678;
const MAX_PENDING_CONNECT_TASKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoordinatorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Error = 4,
}

impl CoordinatorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CoordinatorState::Starting,
            2 => CoordinatorState::Running,
            3 => CoordinatorState::Stopping,
            4 => CoordinatorState::Error,
            _ => CoordinatorState::Stopped,
        }
    }
}

struct PeerRecord {
    connection: Arc<PeerConnection>,
    is_incoming: bool,
}

pub struct NetworkCoordinator {
    identity: DeviceIdentity,
    pairing: Arc<PairingCore>,
    handler: Arc<dyn MessageHandler>,
    state: AtomicU8,
    registry: RwLock<HashMap<String, PeerRecord>>,
    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    /// Handed to every `PeerConnection` in place of `event_tx`. A bridge task
    /// drains this, prunes the registry on `DeviceDisconnected` before a
    /// stale entry can block a legitimate reconnect, then forwards every
    /// event unchanged to `event_tx`.
    internal_tx: mpsc::UnboundedSender<NetworkEvent>,
    local_addr: RwLock<Option<SocketAddr>>,
    discovery: RwLock<Option<Arc<DiscoveryService>>>,
    accept_task: RwLock<Option<JoinHandle<()>>>,
    connect_tasks: RwLock<Vec<JoinHandle<()>>>,
    identity_validator: Option<IdentityValidator>,
}

impl NetworkCoordinator {
    pub fn new(
        identity: DeviceIdentity,
        pairing: Arc<PairingCore>,
        handler: Arc<dyn MessageHandler>,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        identity_validator: Option<IdentityValidator>,
    ) -> Arc<Self> {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            identity,
            pairing,
            handler,
            state: AtomicU8::new(CoordinatorState::Stopped as u8),
            registry: RwLock::new(HashMap::new()),
            event_tx,
            internal_tx,
            local_addr: RwLock::new(None),
            discovery: RwLock::new(None),
            accept_task: RwLock::new(None),
            connect_tasks: RwLock::new(Vec::new()),
            identity_validator,
        });

        let bridge = this.clone();
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if let NetworkEvent::DeviceDisconnected(ref device_id) = event {
                    // A disconnect reported by a now-dead connection must not
                    // evict a legitimate reconnect that already replaced it.
                    let mut registry = bridge.registry.write();
                    let stale = registry
                        .get(device_id)
                        .map(|r| r.connection.state() != ConnectionState::Connected)
                        .unwrap_or(false);
                    if stale {
                        registry.remove(device_id);
                    }
                }
                let _ = bridge.event_tx.send(event);
            }
        });

        this
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: CoordinatorState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Binds `port` (the caller's choice, or `DEFAULT_SERVICE_PORT`), starts
    /// discovery, and spawns the accept loop.
    pub async fn start(self: &Arc<Self>, port: u16) -> Result<SocketAddr> {
        if !self.pairing.is_configured() {
            return Err(FamilyVaultError::NotConfigured);
        }
        self.set_state(CoordinatorState::Starting);

        let psk = self.pairing.derive_psk().ok_or(FamilyVaultError::NotConfigured)?;
        let tls_server = Arc::new(TlsPskServer::new(&psk)?);

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => l,
            Err(e) if port == DEFAULT_SERVICE_PORT => {
                warn!("default service port {port} unavailable ({e}), falling back to an OS-assigned port");
                TcpListener::bind(("0.0.0.0", 0)).await?
            }
            Err(e) => return Err(FamilyVaultError::from(e)),
        };
        let local_addr = listener.local_addr()?;
        *self.local_addr.write() = Some(local_addr);

        let local_info = DeviceInfo {
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            device_type: self.identity.device_type,
            ip_address: crate::net::preferred_advertise_host().to_string(),
            service_port: local_addr.port(),
            file_count: 0,
            last_seen_at: crate::util::now_unix(),
        };

        let discovery = Arc::new(DiscoveryService::new(local_info)?);
        let (disco_tx, mut disco_rx) = mpsc::unbounded_channel();
        discovery.start(disco_tx)?;
        *self.discovery.write() = Some(discovery);

        let bridge_events = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = disco_rx.recv().await {
                let mapped = match event {
                    DiscoveryEvent::DeviceFound(info) => NetworkEvent::DeviceDiscovered(info),
                    DiscoveryEvent::DeviceLost(id) => NetworkEvent::DeviceLost(id),
                };
                let _ = bridge_events.send(mapped);
            }
        });

        let coordinator = self.clone();
        let accept_handle = tokio::spawn(async move {
            coordinator.accept_loop(listener, tls_server).await;
        });
        *self.accept_task.write() = Some(accept_handle);

        self.set_state(CoordinatorState::Running);
        info!("coordinator listening on {local_addr}");
        Ok(local_addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, tls_server: Arc<TlsPskServer>) {
        loop {
            if self.state() != CoordinatorState::Running {
                break;
            }
            let (tcp, remote_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            tcp.set_nodelay(true).ok();

            let this = self.clone();
            let tls_server = tls_server.clone();
            tokio::spawn(async move {
                let (tls_stream, tls_identity) = match tls_server
                    .accept(tcp, this.identity_validator.as_ref())
                    .await
                {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!("TLS handshake from {remote_addr} failed: {e}");
                        return;
                    }
                };

                let our_info = device_info_payload(&this.identity, 0, 0);
                let conn = match PeerConnection::accept(
                    tls_stream,
                    &tls_identity,
                    remote_addr,
                    our_info,
                    this.internal_tx.clone(),
                    this.handler.clone(),
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = this.event_tx.send(NetworkEvent::Error {
                            scope: format!("accept:{remote_addr}"),
                            message: e.to_string(),
                        });
                        return;
                    }
                };

                let device_id = conn.device_id();
                let mut registry = this.registry.write();
                if registry.contains_key(&device_id) {
                    // Server arbitration: the incumbent wins; drop the new one.
                    drop(registry);
                    debug!("incumbent connection for {device_id} retained, dropping new inbound");
                    let conn = conn;
                    tokio::spawn(async move { conn.disconnect().await });
                    return;
                }
                registry.insert(
                    device_id,
                    PeerRecord {
                        connection: conn,
                        is_incoming: true,
                    },
                );
            });
        }
    }

    /// Non-blocking: spawns a connect task and returns immediately.
    pub fn connect_to_address(self: &Arc<Self>, addr: SocketAddr) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            if this.state() != CoordinatorState::Running {
                return;
            }
            let psk = match this.pairing.derive_psk() {
                Some(psk) => psk,
                None => {
                    let _ = this.event_tx.send(NetworkEvent::Error {
                        scope: format!("connect:{addr}"),
                        message: FamilyVaultError::NotConfigured.to_string(),
                    });
                    return;
                }
            };
            let our_info = device_info_payload(&this.identity, 0, 0);
            let conn = match PeerConnection::connect(
                addr,
                &psk,
                &this.identity,
                our_info,
                this.internal_tx.clone(),
                this.handler.clone(),
            )
            .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = this.event_tx.send(NetworkEvent::Error {
                        scope: format!("connect:{addr}"),
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let device_id = conn.device_id();
            let stale = {
                // Client arbitration: newer wins. Remove any incumbent under
                // the lock, then disconnect it outside the lock.
                let mut registry = this.registry.write();
                let stale = registry.remove(&device_id).map(|r| r.connection);
                registry.insert(
                    device_id,
                    PeerRecord {
                        connection: conn,
                        is_incoming: false,
                    },
                );
                stale
            };
            if let Some(stale) = stale {
                stale.disconnect().await;
            }
        });

        let mut tasks = self.connect_tasks.write();
        tasks.push(task);
        while tasks.len() > MAX_PENDING_CONNECT_TASKS {
            let oldest = tasks.remove(0);
            oldest.abort();
        }
    }

    pub async fn disconnect_from_device(&self, device_id: &str) {
        let conn = {
            let registry = self.registry.read();
            registry.get(device_id).map(|r| r.connection.clone())
        };
        if let Some(conn) = conn {
            conn.disconnect().await;
            self.registry.write().remove(device_id);
        }
    }

    pub async fn disconnect_all(&self) {
        let snapshot: Vec<Arc<PeerConnection>> = {
            let mut registry = self.registry.write();
            let values: Vec<_> = registry.values().map(|r| r.connection.clone()).collect();
            registry.clear();
            values
        };
        for conn in snapshot {
            conn.disconnect().await;
        }
    }

    pub async fn stop(self: &Arc<Self>) {
        self.set_state(CoordinatorState::Stopping);

        if let Some(handle) = self.accept_task.write().take() {
            handle.abort();
        }
        if let Some(discovery) = self.discovery.write().take() {
            discovery.stop();
        }
        for task in self.connect_tasks.write().drain(..) {
            task.abort();
        }

        self.disconnect_all().await;
        self.set_state(CoordinatorState::Stopped);
    }

    /// Fan-out; failures on individual peers do not abort the broadcast.
    pub async fn broadcast(&self, frame: Frame) {
        let peers: Vec<Arc<PeerConnection>> = {
            let registry = self.registry.read();
            registry.values().map(|r| r.connection.clone()).collect()
        };
        for conn in peers {
            if let Err(e) = conn.send(frame.clone()).await {
                warn!("broadcast to {} failed: {e}", conn.device_id());
            }
        }
    }

    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        self.registry
            .read()
            .values()
            .map(|r| r.connection.peer.read().clone())
            .collect()
    }

    pub fn find_connection(&self, device_id: &str) -> Option<Arc<PeerConnection>> {
        self.registry.read().get(device_id).map(|r| r.connection.clone())
    }
}
