//! TLS 1.3 channel between paired peers, approximating RFC 4279 PSK cipher
//! suites -- which mainline `rustls` does not implement -- with a
//! certificate derived deterministically from the pre-shared key. Every
//! family member derives the identical self-signed certificate and private
//! key from the same PSK, so a successful handshake proves PSK possession
//! without proving which peer is on the other end. The client's own device
//! id rides the ClientHello SNI extension: the one field TLS 1.3 sends
//! client-to-server before either side has proven anything, which is where
//! a real PSK identity hint would travel.
use crate::error::{FamilyVaultError, Result};
use crate::pairing::crypto::hkdf_sha256;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The ring default provider, restricted to the two TLS 1.3 AEAD suites the
/// transport is specified to speak. Both sides pin TLS 1.3 explicitly below;
/// restricting the suite list too means a peer cannot negotiate down to a
/// weaker TLS 1.3 cipher even if a future rustls version adds one to the
/// default set.
fn restricted_provider() -> Arc<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|suite| {
        matches!(
            suite.suite(),
            rustls::CipherSuite::TLS13_AES_256_GCM_SHA384
                | rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
        )
    });
    Arc::new(provider)
}

pub type ClientStream = tokio_rustls::client::TlsStream<TcpStream>;
pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Runs against the peer's announced identity before a server-side
/// connection is handed up to the caller; a `false` verdict drops the
/// socket. The only extension point inside the transport layer.
pub type IdentityValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

// A PKCS8 v1 `OneAsymmetricKey` document for Ed25519 is sixteen constant
// bytes followed by the 32-byte raw seed (RFC 8410). Building it by hand
// lets us turn an HKDF output directly into a loadable private key without
// a second, non-deterministic keypair underneath it.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

fn seed_to_pkcs8(seed: &[u8; 32]) -> Vec<u8> {
    let mut doc = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32);
    doc.extend_from_slice(&ED25519_PKCS8_PREFIX);
    doc.extend_from_slice(seed);
    doc
}

/// Derives the single self-signed identity every family member presents:
/// the same PSK in, a bit-identical certificate and key out.
fn derive_family_identity(psk: &[u8]) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>)> {
    let okm = hkdf_sha256(psk, b"familyvault-tls-cert", b"ed25519-seed", 32);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&okm);
    let pkcs8 = seed_to_pkcs8(&seed);

    let key_pair = rcgen::KeyPair::from_der(&pkcs8)
        .map_err(|e| FamilyVaultError::Crypto(format!("PSK keypair derivation failed: {e}")))?;

    let mut params = rcgen::CertificateParams::new(vec!["familyvault-peer".to_string()])
        .map_err(|e| FamilyVaultError::Crypto(format!("certificate params: {e}")))?;
    params.distinguished_name = DistinguishedName::new();
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| FamilyVaultError::Crypto(format!("self-signed certificate: {e}")))?;

    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok((cert_der, key_der))
}

fn fingerprint(der: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Accepts the one certificate derivable from the PSK and nothing else.
#[derive(Debug)]
struct PskVerifier {
    expected_fingerprint: String,
}

impl PskVerifier {
    fn new(expected: &CertificateDer<'_>) -> Self {
        Self {
            expected_fingerprint: fingerprint(expected),
        }
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        if fingerprint(end_entity) == self.expected_fingerprint {
            Ok(())
        } else {
            Err(rustls::Error::General(
                "peer certificate does not match the family PSK".to_string(),
            ))
        }
    }

    fn verify_tls12(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_schemes() -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ServerCertVerifier for PskVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Self::verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Self::verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        Self::supported_schemes()
    }
}

impl ClientCertVerifier for PskVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Self::verify_tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Self::verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        Self::supported_schemes()
    }
}

/// Always resolves to the one PSK-derived certificate, but reads the
/// client's announced identity off the ClientHello SNI on the way there.
/// This is the only place in the transport the client's identity claim is
/// observable; the application layer re-checks it in the device-info
/// exchange.
struct CapturingResolver {
    certified_key: Arc<CertifiedKey>,
    captured: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for CapturingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturingResolver").finish()
    }
}

impl ResolvesServerCert for CapturingResolver {
    fn resolve(&self, client_hello: rustls::server::ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = client_hello.server_name() {
            *self.captured.lock() = Some(name.to_string());
        }
        Some(self.certified_key.clone())
    }
}

/// Client side of the transport: sets the PSK and our identity, dials,
/// completes the handshake, and from then on exposes a raw byte stream.
pub async fn connect(addr: SocketAddr, psk: &[u8], our_identity: &str) -> Result<ClientStream> {
    let fut = async {
        let (cert, key) = derive_family_identity(psk)?;
        let verifier = Arc::new(PskVerifier::new(&cert));

        let config = ClientConfig::builder_with_provider(restricted_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| FamilyVaultError::NetworkError(format!("TLS client config: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(vec![cert], key.into())
            .map_err(|e| FamilyVaultError::NetworkError(format!("TLS client config: {e}")))?;

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(our_identity.to_string())
            .map_err(|_| FamilyVaultError::InvalidArgument("identity is not SNI-representable".into()))?;

        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true).ok();

        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| FamilyVaultError::NetworkError(format!("TLS handshake failed: {e}")))?;
        Ok(stream)
    };

    timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| FamilyVaultError::Timeout("TLS handshake".into()))?
}

/// Server side of the transport: for each accepted TCP socket, performs the
/// PSK handshake and returns the peer's announced identity alongside the
/// stream. A `false` verdict from `validator` tears the socket down before
/// it is handed up.
pub struct TlsPskServer {
    acceptor: TlsAcceptor,
    captured: Arc<Mutex<Option<String>>>,
}

impl TlsPskServer {
    pub fn new(psk: &[u8]) -> Result<Self> {
        let (cert, key) = derive_family_identity(psk)?;
        let client_verifier = Arc::new(PskVerifier::new(&cert));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key.into())
            .map_err(|e| FamilyVaultError::Crypto(format!("TLS signing key: {e}")))?;
        let certified_key = Arc::new(CertifiedKey::new(vec![cert], signing_key));
        let captured = Arc::new(Mutex::new(None));

        let resolver = Arc::new(CapturingResolver {
            certified_key,
            captured: captured.clone(),
        });

        let config = ServerConfig::builder_with_provider(restricted_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| FamilyVaultError::NetworkError(format!("TLS server config: {e}")))?
            .with_client_cert_verifier(client_verifier)
            .with_cert_resolver(resolver);

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            captured,
        })
    }

    pub async fn accept(
        &self,
        tcp: TcpStream,
        validator: Option<&IdentityValidator>,
    ) -> Result<(ServerStream, String)> {
        *self.captured.lock() = None;

        let stream = timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(tcp))
            .await
            .map_err(|_| FamilyVaultError::Timeout("TLS handshake".into()))?
            .map_err(|e| FamilyVaultError::NetworkError(format!("TLS handshake failed: {e}")))?;

        let identity = self
            .captured
            .lock()
            .take()
            .ok_or_else(|| FamilyVaultError::Protocol("peer sent no identity (no SNI)".into()))?;

        if let Some(validator) = validator {
            if !validator(&identity) {
                debug!("identity validator rejected peer {identity}");
                return Err(FamilyVaultError::AuthMismatch);
            }
        }

        Ok((stream, identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_identity_is_deterministic() {
        let psk = [9u8; 32];
        let (cert_a, key_a) = derive_family_identity(&psk).unwrap();
        let (cert_b, key_b) = derive_family_identity(&psk).unwrap();
        assert_eq!(cert_a.as_ref(), cert_b.as_ref());
        assert_eq!(key_a.secret_pkcs8_der(), key_b.secret_pkcs8_der());
    }

    #[test]
    fn different_psks_yield_different_identities() {
        let (cert_a, _) = derive_family_identity(&[1u8; 32]).unwrap();
        let (cert_b, _) = derive_family_identity(&[2u8; 32]).unwrap();
        assert_ne!(cert_a.as_ref(), cert_b.as_ref());
    }

    #[test]
    fn fingerprint_matches_only_expected_cert() {
        let (cert_a, _) = derive_family_identity(&[3u8; 32]).unwrap();
        let (cert_b, _) = derive_family_identity(&[4u8; 32]).unwrap();
        let verifier = PskVerifier::new(&cert_a);
        assert!(verifier.check(&cert_a).is_ok());
        assert!(verifier.check(&cert_b).is_err());
    }
}
