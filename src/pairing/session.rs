use super::crypto::{generate_pin, random_bytes};
use crate::util::now_unix;

pub const SESSION_TTL_SECS: i64 = 300;
pub const RATE_LIMIT_SECS: i64 = 30;
pub const MAX_FAILED_ATTEMPTS: u32 = 3;

/// Initiator-side ephemeral state allowing joiners to exchange a PIN for the
/// family secret. At most one active session per node.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub nonce: Vec<u8>,
    pub pin: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub failed_attempts: u32,
    pub rate_limit_until: Option<i64>,
}

impl PairingSession {
    pub fn open(family_secret: &[u8]) -> Self {
        let nonce = random_bytes(16);
        let pin = generate_pin(family_secret, &nonce);
        let now = now_unix();
        Self {
            nonce,
            pin,
            created_at: now,
            expires_at: now + SESSION_TTL_SECS,
            failed_attempts: 0,
            rate_limit_until: None,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_rate_limited(&self, now: i64) -> bool {
        self.rate_limit_until.is_some_and(|until| now < until)
    }

    /// Records a failed attempt; returns `true` if this failure just
    /// triggered the 30-second lockout.
    pub fn record_failure(&mut self, now: i64) -> bool {
        self.failed_attempts += 1;
        if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
            self.rate_limit_until = Some(now + RATE_LIMIT_SECS);
            self.failed_attempts = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.failed_attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ttl_is_five_minutes() {
        let session = PairingSession::open(b"secret");
        assert_eq!(session.expires_at - session.created_at, 300);
    }

    #[test]
    fn lockout_after_three_failures() {
        let mut session = PairingSession::open(b"secret");
        let now = session.created_at;
        assert!(!session.record_failure(now));
        assert!(!session.record_failure(now));
        assert!(session.record_failure(now));
        assert!(session.is_rate_limited(now));
        assert!(!session.is_rate_limited(now + RATE_LIMIT_SECS));
    }

    #[test]
    fn two_sessions_within_10ms_have_distinct_nonces() {
        let a = PairingSession::open(b"secret");
        let b = PairingSession::open(b"secret");
        assert_ne!(a.nonce, b.nonce);
    }
}
