//! Advertises this node and browses for family peers on the LAN via mDNS.
//!
//! Grounded on the teacher's `DiscoveryService`: a `ServiceDaemon` plus one
//! browse thread and one cleanup thread, driving `DiscoveryEvent`s into a
//! channel. Trimmed of the teacher's proximity/BLE dual-source tracking,
//! which has no counterpart here.
use crate::device::{DeviceInfo, DeviceType};
use crate::error::{FamilyVaultError, Result};
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

const SERVICE_TYPE: &str = "_familyvault._tcp.local.";
const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const BROWSE_TIMEOUT: Duration = Duration::from_millis(100);
const DEVICE_STALE_TIMEOUT: Duration = Duration::from_secs(15);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    DeviceFound(DeviceInfo),
    DeviceLost(String),
}

#[derive(Clone)]
struct TrackedDevice {
    info: DeviceInfo,
    last_seen: Instant,
}

pub struct DiscoveryService {
    daemon: ServiceDaemon,
    local: DeviceInfo,
    discovered: Arc<RwLock<HashMap<String, TrackedDevice>>>,
    running: Arc<AtomicBool>,
    threads: RwLock<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(local: DeviceInfo) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| FamilyVaultError::NetworkError(format!("mdns init: {e}")))?;
        Self::disable_virtual_interfaces(&daemon);
        Ok(Self {
            daemon,
            local,
            discovered: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            threads: RwLock::new(Vec::new()),
        })
    }

    fn disable_virtual_interfaces(daemon: &ServiceDaemon) {
        for pattern in [
            "vmnet", "vmware", "virtualbox", "vboxnet", "vethernet", "wsl", "docker", "br-",
            "veth", "virbr", "tap", "tun", "utun", "wg", "wireguard",
        ] {
            if let Err(e) = daemon.disable_interface(IfKind::Name(pattern.to_string())) {
                trace!("could not disable interface pattern '{pattern}': {e}");
            }
        }
    }

    fn instance_name(info: &DeviceInfo) -> String {
        format!("{}--{}", info.device_name.replace("--", "-"), info.device_id)
    }

    fn parse_instance_name(instance: &str) -> Option<(String, String)> {
        let pos = instance.rfind("--")?;
        let name = instance[..pos].to_string();
        let id = instance[pos + 2..].to_string();
        (!id.is_empty() && !name.is_empty()).then_some((name, id))
    }

    /// Idempotent: calling `start` while already running just re-announces.
    pub fn start(&self, event_tx: mpsc::UnboundedSender<DiscoveryEvent>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.announce()?;
            return Ok(());
        }
        self.announce()?;

        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| FamilyVaultError::NetworkError(format!("mdns browse: {e}")))?;
        let local_id = self.local.device_id.clone();
        let discovered = self.discovered.clone();
        let running = self.running.clone();
        let tx = event_tx.clone();

        let browse_handle = std::thread::Builder::new()
            .name("familyvault-mdns-browse".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match receiver.recv_timeout(BROWSE_TIMEOUT) {
                        Ok(ServiceEvent::ServiceResolved(resolved)) => {
                            Self::handle_resolved(&resolved, &local_id, &discovered, &tx);
                        }
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                            Self::handle_removed(&fullname, &discovered, &tx);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string().to_lowercase();
                            if msg.contains("timeout") || msg.contains("timed out") {
                                continue;
                            }
                            warn!("mdns browse channel error: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(FamilyVaultError::from)?;

        let daemon = self.daemon.clone();
        let local = self.local.clone();
        let running_announce = self.running.clone();
        let announce_handle = std::thread::Builder::new()
            .name("familyvault-mdns-announce".into())
            .spawn(move || {
                while running_announce.load(Ordering::SeqCst) {
                    std::thread::sleep(REANNOUNCE_INTERVAL);
                    if !running_announce.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = Self::do_announce(&daemon, &local) {
                        debug!("re-announce failed: {e}");
                    }
                }
            })
            .map_err(FamilyVaultError::from)?;

        let discovered_cleanup = self.discovered.clone();
        let running_cleanup = self.running.clone();
        let tx_cleanup = event_tx;
        let cleanup_handle = std::thread::Builder::new()
            .name("familyvault-mdns-cleanup".into())
            .spawn(move || {
                while running_cleanup.load(Ordering::SeqCst) {
                    std::thread::sleep(CLEANUP_INTERVAL);
                    if !running_cleanup.load(Ordering::SeqCst) {
                        break;
                    }
                    let now = Instant::now();
                    let lost: Vec<String> = {
                        let mut devices = discovered_cleanup.write();
                        let stale: Vec<String> = devices
                            .iter()
                            .filter(|(_, t)| now.duration_since(t.last_seen) > DEVICE_STALE_TIMEOUT)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in &stale {
                            devices.remove(id);
                        }
                        stale
                    };
                    for id in lost {
                        let _ = tx_cleanup.send(DiscoveryEvent::DeviceLost(id));
                    }
                }
            })
            .map_err(FamilyVaultError::from)?;

        let mut threads = self.threads.write();
        threads.push(browse_handle);
        threads.push(announce_handle);
        threads.push(cleanup_handle);
        info!("discovery started for {}", SERVICE_TYPE);
        Ok(())
    }

    /// Idempotent: calling `stop` twice or without a prior `start` is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        let _ = self
            .daemon
            .unregister(&format!("{}.{}", Self::instance_name(&self.local), SERVICE_TYPE));
        for handle in self.threads.write().drain(..) {
            let _ = handle.join();
        }
        self.discovered.write().clear();
    }

    fn announce(&self) -> Result<()> {
        Self::do_announce(&self.daemon, &self.local)
    }

    fn do_announce(daemon: &ServiceDaemon, local: &DeviceInfo) -> Result<()> {
        let ip: IpAddr = local
            .ip_addr()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        if ip.is_unspecified() {
            return Ok(());
        }
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), local.device_id.clone());
        properties.insert("name".to_string(), local.device_name.clone());
        properties.insert("type".to_string(), local.device_type.as_str().to_string());

        let hostname = format!("{}.local.", local.device_id);
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &Self::instance_name(local),
            &hostname,
            ip,
            local.service_port,
            properties,
        )
        .map_err(|e| FamilyVaultError::NetworkError(format!("mdns service info: {e}")))?
        .enable_addr_auto();

        daemon
            .register(service)
            .map_err(|e| FamilyVaultError::NetworkError(format!("mdns register: {e}")))?;
        Ok(())
    }

    fn handle_resolved(
        resolved: &mdns_sd::ResolvedService,
        local_id: &str,
        discovered: &Arc<RwLock<HashMap<String, TrackedDevice>>>,
        tx: &mpsc::UnboundedSender<DiscoveryEvent>,
    ) {
        let device_id = resolved
            .txt_properties
            .get("id")
            .map(|v| v.val_str().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                resolved
                    .fullname
                    .strip_suffix(&format!(".{SERVICE_TYPE}"))
                    .and_then(Self::parse_instance_name)
                    .map(|(_, id)| id)
            });
        let Some(device_id) = device_id else {
            warn!("could not extract device id from {}", resolved.fullname);
            return;
        };
        if device_id == local_id {
            return;
        }

        let device_name = resolved
            .txt_properties
            .get("name")
            .map(|v| v.val_str().to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let device_type = resolved
            .txt_properties
            .get("type")
            .and_then(|v| v.val_str().parse::<DeviceType>().ok())
            .unwrap_or(DeviceType::Desktop);
        let ip = resolved
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| resolved.addresses.iter().next())
            .map(|a| a.to_ip_addr());
        let Some(ip) = ip else {
            return;
        };

        let now_ts = crate::util::now_unix();
        let info = DeviceInfo {
            device_id: device_id.clone(),
            device_name,
            device_type,
            ip_address: ip.to_string(),
            service_port: resolved.port,
            file_count: 0,
            last_seen_at: now_ts,
        };

        discovered.write().insert(
            device_id,
            TrackedDevice {
                info: info.clone(),
                last_seen: Instant::now(),
            },
        );
        let _ = tx.send(DiscoveryEvent::DeviceFound(info));
    }

    fn handle_removed(
        fullname: &str,
        discovered: &Arc<RwLock<HashMap<String, TrackedDevice>>>,
        tx: &mpsc::UnboundedSender<DiscoveryEvent>,
    ) {
        let Some(instance) = fullname.strip_suffix(&format!(".{SERVICE_TYPE}")) else {
            return;
        };
        let Some((_, device_id)) = Self::parse_instance_name(instance) else {
            return;
        };
        if discovered.write().remove(&device_id).is_some() {
            let _ = tx.send(DiscoveryEvent::DeviceLost(device_id));
        }
    }

    pub fn discovered_devices(&self) -> Vec<DeviceInfo> {
        self.discovered.read().values().map(|t| t.info.clone()).collect()
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_roundtrips() {
        let info = DeviceInfo {
            device_id: "abc-123".into(),
            device_name: "My--Desk".into(),
            device_type: DeviceType::Desktop,
            ip_address: "127.0.0.1".into(),
            service_port: 1,
            file_count: 0,
            last_seen_at: 0,
        };
        let name = DiscoveryService::instance_name(&info);
        let (parsed_name, parsed_id) = DiscoveryService::parse_instance_name(&name).unwrap();
        assert_eq!(parsed_id, "abc-123");
        assert_eq!(parsed_name, "My-Desk");
    }
}
