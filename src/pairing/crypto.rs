//! CSPRNG, HKDF-SHA256, PIN derivation, and UUID generation primitives used
//! by the pairing state machine. Grounded on the `hkdf`/`sha2` usage pattern
//! from the wider pack (see `PairingManager::derive_pair_key` in the
//! reference corpus) rather than the teacher, which authenticates peers by
//! certificate fingerprint instead of a PIN-derived secret.
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

/// `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// RFC 5869 HKDF-SHA256, `out_len` bytes of output key material.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; out_len];
    hk.expand(info, &mut okm)
        .expect("out_len is far below HKDF-SHA256's 255*32 byte limit");
    okm
}

/// Deterministic 6-digit PIN from `HKDF(secret || nonce, "familyvault-pin",
/// "pin-derivation", 4)` reduced modulo 10^6, zero-padded.
pub fn generate_pin(secret: &[u8], nonce: &[u8]) -> String {
    let mut ikm = Vec::with_capacity(secret.len() + nonce.len());
    ikm.extend_from_slice(secret);
    ikm.extend_from_slice(nonce);
    let okm = hkdf_sha256(&ikm, b"familyvault-pin", b"pin-derivation", 4);
    let n = u32::from_be_bytes([okm[0], okm[1], okm[2], okm[3]]);
    format!("{:06}", n % 1_000_000)
}

/// `HKDF(family_secret, salt="familyvault-psk-v1", info="tls13-psk", 32)`.
pub fn derive_psk(family_secret: &[u8]) -> [u8; 32] {
    let okm = hkdf_sha256(family_secret, b"familyvault-psk-v1", b"tls13-psk", 32);
    let mut psk = [0u8; 32];
    psk.copy_from_slice(&okm);
    psk
}

pub fn generate_uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_sized() {
        let a = hkdf_sha256(b"ikm", b"salt", b"info", 20);
        let b = hkdf_sha256(b"ikm", b"salt", b"info", 20);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn pin_is_deterministic_six_digits() {
        let secret = random_bytes(32);
        let nonce = random_bytes(16);
        let pin1 = generate_pin(&secret, &nonce);
        let pin2 = generate_pin(&secret, &nonce);
        assert_eq!(pin1, pin2);
        assert_eq!(pin1.len(), 6);
        assert!(pin1.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn pin_zero_is_structurally_valid() {
        // "000000" must be a legitimate, verifiable value: the format! with
        // leading zeros is exercised whenever okm % 1_000_000 < 100_000.
        let pin = format!("{:06}", 0u32);
        assert_eq!(pin, "000000");
        assert_eq!(pin.len(), 6);
    }

    #[test]
    fn derive_psk_deterministic() {
        let secret = [7u8; 32];
        assert_eq!(derive_psk(&secret), derive_psk(&secret));
    }

    #[test]
    fn uuid_v4_has_expected_shape() {
        let id = generate_uuid_v4();
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().filter(|c| *c == '-').count(), 4);
    }
}
