use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// `{Desktop, Mobile, Server}` as carried on the wire in `DeviceInfo.deviceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceType {
    Desktop = 0,
    Mobile = 1,
    Server = 2,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Server => "server",
        }
    }

    pub fn from_wire(v: i32) -> Self {
        match v {
            1 => DeviceType::Mobile,
            2 => DeviceType::Server,
            _ => DeviceType::Desktop,
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mobile" => Ok(DeviceType::Mobile),
            "server" => Ok(DeviceType::Server),
            _ => Ok(DeviceType::Desktop),
        }
    }
}

/// The durable identity of this node, generated once on first boot and
/// persisted in `SecureStorage`. `device_id` doubles as the TLS-PSK identity
/// string transmitted client-to-server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    pub fn new(device_id: String, device_name: String, device_type: DeviceType) -> Self {
        Self {
            device_id,
            device_name,
            device_type,
        }
    }
}

/// What a peer announced about itself plus where it was reached, as tracked
/// by discovery and the peer registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub service_port: u16,
    pub file_count: i64,
    pub last_seen_at: i64,
}

impl DeviceInfo {
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip_address.parse().ok()
    }
}
