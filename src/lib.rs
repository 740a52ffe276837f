pub mod connection;
pub mod coordinator;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod external;
pub mod facade;
pub mod file_transfer;
pub mod index_sync;
pub mod net;
pub mod pairing;
pub mod protocol;
pub mod secure_storage;
pub mod tls;
pub mod util;

pub use connection::{ConnectionState, MessageHandler, PeerConnection};
pub use coordinator::{CoordinatorState, NetworkCoordinator, DEFAULT_SERVICE_PORT};
pub use device::{DeviceIdentity, DeviceInfo, DeviceType};
pub use discovery::{DiscoveryEvent, DiscoveryService};
pub use error::{FamilyVaultError, Result};
pub use events::{NetworkEvent, TransferDirection, TransferEvent};
pub use external::{Database, LocalIndex, RemoteFileRecord, Visibility};
pub use facade::FamilyVault;
pub use file_transfer::{FileTransfer, TransferStatus};
pub use index_sync::IndexSync;
pub use pairing::{JoinResult, PairingCore, PairingInfo};
pub use protocol::{Frame, MessageType};
pub use secure_storage::{FileSecureStorage, SecureStorage};
