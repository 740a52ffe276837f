pub mod crypto;
pub mod session;
pub mod transport;

use crate::device::DeviceType;
use crate::error::{FamilyVaultError, Result};
use crate::protocol::{PairingRequestPayload, PairingResponsePayload};
use crate::secure_storage::{SecureStorage, KEY_DEVICE_ID, KEY_DEVICE_NAME, KEY_FAMILY_SECRET};
use crate::util::now_unix;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use session::PairingSession;
use std::sync::Arc;
use tracing::warn;
use transport::{PairingServerHandle, DEFAULT_PAIRING_PORT};

/// What `createFamily`/`regeneratePin` return to the initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingInfo {
    pub pin: String,
    pub qr_url: String,
    pub qr_base64: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QrPayloadJson {
    pin: String,
    host: String,
    port: u16,
    nonce: String,
    expires: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResult {
    Success,
    AlreadyConfigured,
    InvalidPin,
    Expired,
    RateLimited,
    NetworkError(String),
    InternalError(String),
}

struct FamilyState {
    secret: Option<Vec<u8>>,
    session: Option<PairingSession>,
}

/// Bootstraps and maintains the shared family secret: random/HKDF/PIN
/// primitives (`crypto`), the session state machine (`session`), and the
/// pre-TLS secret handoff (`transport`), wired together behind one facade.
pub struct PairingCore {
    storage: Arc<dyn SecureStorage>,
    device_id: String,
    device_type: DeviceType,
    pairing_port: u16,
    state: RwLock<FamilyState>,
    server: Mutex<Option<PairingServerHandle>>,
}

impl PairingCore {
    pub fn new(
        storage: Arc<dyn SecureStorage>,
        default_device_name: &str,
        device_type: DeviceType,
        pairing_port: Option<u16>,
    ) -> Result<Arc<Self>> {
        let device_id = match storage.get_string(KEY_DEVICE_ID)? {
            Some(id) => id,
            None => {
                let id = crypto::generate_uuid_v4();
                storage.put_string(KEY_DEVICE_ID, &id)?;
                id
            }
        };
        if storage.get_string(KEY_DEVICE_NAME)?.is_none() {
            storage.put_string(KEY_DEVICE_NAME, default_device_name)?;
        }
        let secret = storage.get(KEY_FAMILY_SECRET)?;

        Ok(Arc::new(Self {
            storage,
            device_id,
            device_type,
            pairing_port: pairing_port.unwrap_or(DEFAULT_PAIRING_PORT),
            state: RwLock::new(FamilyState {
                secret,
                session: None,
            }),
            server: Mutex::new(None),
        }))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> String {
        self.storage
            .get_string(KEY_DEVICE_NAME)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn is_configured(&self) -> bool {
        self.state.read().secret.is_some()
    }

    /// `Some` iff `Configured*`.
    pub fn derive_psk(&self) -> Option<[u8; 32]> {
        self.state
            .read()
            .secret
            .as_ref()
            .map(|s| crypto::derive_psk(s))
    }

    pub fn psk_identity(&self) -> String {
        self.device_id.clone()
    }

    /// `NoFamily -> Configured+SessionOpen`. Generates the family secret,
    /// persists it, opens a 5-minute pairing session, and starts the
    /// plaintext pairing server.
    pub async fn create_family(self: &Arc<Self>) -> Result<PairingInfo> {
        if self.is_configured() {
            return Err(FamilyVaultError::AlreadyConfigured);
        }
        let secret = crypto::random_bytes(32);
        self.storage.put(KEY_FAMILY_SECRET, &secret)?;
        let session = PairingSession::open(&secret);
        let info = self.pairing_info_from(&session);

        {
            let mut state = self.state.write();
            state.secret = Some(secret);
            state.session = Some(session);
        }

        self.start_server().await?;
        Ok(info)
    }

    /// From any `Configured*` state: replaces nonce+PIN and restarts the
    /// server, permitting another device to join.
    pub async fn regenerate_pin(self: &Arc<Self>) -> Result<PairingInfo> {
        let secret = {
            let state = self.state.read();
            state
                .secret
                .clone()
                .ok_or(FamilyVaultError::NotConfigured)?
        };
        let session = PairingSession::open(&secret);
        let info = self.pairing_info_from(&session);
        self.state.write().session = Some(session);
        self.start_server().await?;
        Ok(info)
    }

    /// Closes the session (`Configured+SessionOpen -> Configured`) and stops
    /// the pairing server; an idle server with no session can only answer
    /// `EXPIRED`.
    pub fn cancel_pairing(&self) {
        self.state.write().session = None;
        if let Some(handle) = self.server.lock().take() {
            handle.stop();
        }
    }

    pub fn is_pairing_open(&self) -> bool {
        let state = self.state.read();
        state
            .session
            .as_ref()
            .is_some_and(|s| !s.is_expired(now_unix()))
    }

    async fn start_server(self: &Arc<Self>) -> Result<()> {
        if let Some(handle) = self.server.lock().take() {
            handle.stop();
        }
        let handler: Arc<dyn transport::PairingRequestHandler> = self.clone();
        let handle = transport::spawn_server(self.pairing_port, handler).await?;
        *self.server.lock() = Some(handle);
        Ok(())
    }

    fn pairing_info_from(&self, session: &PairingSession) -> PairingInfo {
        let host = crate::net::preferred_advertise_host();
        let qr_url = format!(
            "fv://join?pin={}&host={}&port={}",
            session.pin, host, self.pairing_port
        );
        let qr_json = QrPayloadJson {
            pin: session.pin.clone(),
            host: host.to_string(),
            port: self.pairing_port,
            nonce: hex::encode(&session.nonce),
            expires: session.expires_at,
        };
        let qr_base64 = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&qr_json).unwrap_or_default());

        PairingInfo {
            pin: session.pin.clone(),
            qr_url,
            qr_base64,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }

    /// `NoFamily -> Configured` on success. Returns `AlreadyConfigured`
    /// without dialing if already configured.
    pub async fn join_by_pin(self: &Arc<Self>, pin: &str, host: &str, port: u16) -> Result<JoinResult> {
        if self.is_configured() {
            return Ok(JoinResult::AlreadyConfigured);
        }
        if pin.len() != 6 || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(FamilyVaultError::InvalidPin("pin must be 6 decimal digits".into()));
        }
        let request = PairingRequestPayload {
            pin: pin.to_string(),
            device_id: self.device_id.clone(),
            device_name: self.device_name(),
            device_type: self.device_type as i32,
        };
        let response = match transport::request(host, port, request).await {
            Ok(r) => r,
            Err(e) => return Ok(JoinResult::NetworkError(e.to_string())),
        };

        match response {
            PairingResponsePayload::Success {
                success: true,
                family_secret,
            } => {
                let secret = hex::decode(&family_secret)
                    .map_err(|_| FamilyVaultError::Internal("malformed family secret".into()))?;
                if secret.len() != 32 {
                    return Ok(JoinResult::InternalError(
                        "family secret is not 32 bytes".into(),
                    ));
                }
                self.storage.put(KEY_FAMILY_SECRET, &secret)?;
                self.state.write().secret = Some(secret);
                Ok(JoinResult::Success)
            }
            PairingResponsePayload::Failure { error_code, .. } => {
                Ok(match error_code.as_str() {
                    "INVALID_PIN" => JoinResult::InvalidPin,
                    "EXPIRED" => JoinResult::Expired,
                    "RATE_LIMITED" => JoinResult::RateLimited,
                    other => JoinResult::InternalError(other.to_string()),
                })
            }
            _ => Ok(JoinResult::InternalError("malformed response".into())),
        }
    }

    pub async fn join_by_qr(self: &Arc<Self>, data: &str) -> Result<JoinResult> {
        let (pin, host, port) = Self::parse_qr(data)?;
        self.join_by_pin(&pin, &host, port).await
    }

    fn parse_qr(data: &str) -> Result<(String, String, u16)> {
        if let Some(query) = data.strip_prefix("fv://join?") {
            let mut pin = None;
            let mut host = None;
            let mut port = None;
            for pair in query.split('&') {
                let Some((k, v)) = pair.split_once('=') else {
                    continue;
                };
                match k {
                    "pin" => pin = Some(v.to_string()),
                    "host" => host = Some(v.to_string()),
                    "port" => port = v.parse::<u16>().ok(),
                    _ => {}
                }
            }
            return match (pin, host, port) {
                (Some(pin), Some(host), Some(port)) => Ok((pin, host, port)),
                _ => Err(FamilyVaultError::InvalidArgument(
                    "malformed fv://join URL".into(),
                )),
            };
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| FamilyVaultError::InvalidArgument("malformed QR payload".into()))?;
        let parsed: QrPayloadJson = serde_json::from_slice(&decoded)?;
        Ok((parsed.pin, parsed.host, parsed.port))
    }

    /// Removes the family secret key and clears any session. The device id
    /// is NOT regenerated.
    pub fn reset(&self) -> Result<()> {
        self.storage.remove(KEY_FAMILY_SECRET)?;
        self.state.write().secret = None;
        self.state.write().session = None;
        if let Some(handle) = self.server.lock().take() {
            handle.stop();
        }
        Ok(())
    }
}

impl transport::PairingRequestHandler for PairingCore {
    fn handle(&self, request: PairingRequestPayload) -> PairingResponsePayload {
        let now = now_unix();
        let mut state = self.state.write();

        let Some(secret) = state.secret.clone() else {
            return PairingResponsePayload::failure("EXPIRED", "no family configured");
        };

        let Some(session) = state.session.as_mut() else {
            return PairingResponsePayload::failure("EXPIRED", "no active pairing session");
        };

        if session.is_rate_limited(now) {
            return PairingResponsePayload::failure("RATE_LIMITED", "too many failed attempts");
        }
        if session.is_expired(now) {
            return PairingResponsePayload::failure("EXPIRED", "pairing session expired");
        }

        let expected_pin = crypto::generate_pin(&secret, &session.nonce);
        if request.pin != expected_pin {
            let locked_out = session.record_failure(now);
            return if locked_out {
                PairingResponsePayload::failure("RATE_LIMITED", "too many failed attempts")
            } else {
                let remaining = session::MAX_FAILED_ATTEMPTS - session.failed_attempts;
                PairingResponsePayload::failure(
                    "INVALID_PIN",
                    format!("incorrect pin, {remaining} attempt(s) remaining"),
                )
            };
        }

        session.record_success();
        warn!(
            "device {} joined the family via pairing (pin validated, secret not logged)",
            request.device_id
        );
        PairingResponsePayload::success(hex::encode(&secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure_storage::FileSecureStorage;

    fn storage(tag: &str) -> Arc<dyn SecureStorage> {
        let dir = std::env::temp_dir().join(format!("familyvault-pairing-test-{tag}-{}", crypto::generate_uuid_v4()));
        Arc::new(FileSecureStorage::new(Some(dir)).unwrap())
    }

    #[tokio::test]
    async fn pairing_happy_path_matches_secret_and_leaves_session_open() {
        let a = PairingCore::new(storage("a"), "Node A", DeviceType::Desktop, Some(0)).unwrap();
        let b = PairingCore::new(storage("b"), "Node B", DeviceType::Desktop, Some(0)).unwrap();

        let info = a.create_family().await.unwrap();
        assert_eq!(info.pin.len(), 6);
        assert!(!b.is_configured());

        let port = a.server.lock().as_ref().unwrap().local_addr().port();
        let result = b.join_by_pin(&info.pin, "127.0.0.1", port).await.unwrap();
        assert_eq!(result, JoinResult::Success);
        assert!(b.is_configured());
        assert_eq!(a.derive_psk(), b.derive_psk());
        assert!(a.is_pairing_open());
    }

    #[tokio::test]
    async fn wrong_pin_three_times_then_lockout() {
        let a = PairingCore::new(storage("c"), "Node A", DeviceType::Desktop, Some(0)).unwrap();
        let info = a.create_family().await.unwrap();
        let port = a.server.lock().as_ref().unwrap().local_addr().port();

        let b = PairingCore::new(storage("d"), "Node B", DeviceType::Desktop, Some(0)).unwrap();
        for _ in 0..3 {
            let _ = b.join_by_pin("000000", "127.0.0.1", port).await;
        }
        let final_attempt = b.join_by_pin(&info.pin, "127.0.0.1", port).await.unwrap();
        assert_eq!(final_attempt, JoinResult::RateLimited);
    }

    #[test]
    fn qr_url_form_parses() {
        let parsed = PairingCore::parse_qr("fv://join?pin=123456&host=192.168.1.5&port=45680").unwrap();
        assert_eq!(parsed, ("123456".to_string(), "192.168.1.5".to_string(), 45680));
    }
}
