use crate::device::DeviceInfo;
use serde::{Deserialize, Serialize};

/// Coordinator-level lifecycle events, delivered to the `NetworkEventHandler`
/// registered by the host application. Never fired while the registry mutex
/// is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetworkEvent {
    DeviceDiscovered(DeviceInfo),
    DeviceLost(String),
    DeviceConnected(DeviceInfo),
    DeviceDisconnected(String),
    Error { scope: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

/// File-transfer progress/terminal events, delivered by `FileTransfer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    Progress {
        request_id: String,
        bytes_received: u64,
        expected_size: u64,
    },
    Completed {
        request_id: String,
        local_path: String,
    },
    Failed {
        request_id: String,
        error: String,
    },
}
