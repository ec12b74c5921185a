//! Address-validation tokens and stateless-reset tokens
//! (RFC 9000 Sections 8.1, 10.3).
//!
//! A validation token binds the client's IP address to its issue time,
//! sealed under a server-configured 32-byte key. The same format backs
//! Retry tokens and NEW_TOKEN tokens; clients treat both as opaque.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use ring::aead;
use ring::hmac;

use crate::error::{Error, Result};
use crate::types::SR_TOKEN_LEN;

const NONCE_LEN: usize = 12;

/// Outcome of validating a client-presented token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Valid,

    /// Authentic but older than the configured lifetime; the client is
    /// asked to retry rather than rejected.
    Expired,

    /// Not decryptable or bound to a different address.
    Invalid,
}

/// Sealing key for address-validation tokens.
pub struct TokenKey {
    key: aead::LessSafeKey,
}

impl TokenKey {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_256_GCM, key).expect("token key length"),
        );
        Self { key }
    }

    /// Seal a token for `addr` issued at `now`.
    ///
    /// Layout: 12-byte random nonce, then AEAD(ip bytes ‖ u64 unix
    /// milliseconds) with its tag.
    pub fn seal(&self, addr: &IpAddr, now: SystemTime) -> Result<Vec<u8>> {
        let mut plaintext = ip_bytes(addr);
        let stamp = now
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::InternalError)?
            .as_millis() as u64;
        plaintext.extend_from_slice(&stamp.to_be_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut in_out = plaintext;
        let tag = self
            .key
            .seal_in_place_separate_tag(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::InternalError)?;

        let mut token = Vec::with_capacity(NONCE_LEN + in_out.len() + 16);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&in_out);
        token.extend_from_slice(tag.as_ref());
        Ok(token)
    }

    /// Validate a token against the presenting address and lifetime.
    pub fn check(
        &self,
        token: &[u8],
        addr: &IpAddr,
        now: SystemTime,
        lifetime: Duration,
    ) -> TokenCheck {
        let expected_ip = ip_bytes(addr);
        let body_len = expected_ip.len() + 8;

        if token.len() != NONCE_LEN + body_len + 16 {
            return TokenCheck::Invalid;
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&token[..NONCE_LEN]);

        let mut in_out = token[NONCE_LEN..].to_vec();
        let plain = match self.key.open_in_place(
            aead::Nonce::assume_unique_for_key(nonce),
            aead::Aad::empty(),
            &mut in_out,
        ) {
            Ok(plain) => plain,
            Err(_) => return TokenCheck::Invalid,
        };

        if plain.len() != body_len || plain[..expected_ip.len()] != expected_ip[..] {
            return TokenCheck::Invalid;
        }

        let mut stamp_bytes = [0u8; 8];
        stamp_bytes.copy_from_slice(&plain[expected_ip.len()..]);
        let stamp = u64::from_be_bytes(stamp_bytes);

        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if now_ms.saturating_sub(stamp) > lifetime.as_millis() as u64 {
            return TokenCheck::Expired;
        }

        TokenCheck::Valid
    }
}

fn ip_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Derive a stateless-reset token for a connection ID
/// (RFC 9000 Section 10.3.2: a keyed pseudorandom function of the CID).
pub fn stateless_reset_token(key: &[u8], cid: &[u8]) -> [u8; SR_TOKEN_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, cid);

    let mut token = [0u8; SR_TOKEN_LEN];
    token.copy_from_slice(&tag.as_ref()[..SR_TOKEN_LEN]);
    token
}

/// Constant-time token comparison (RFC 9000 Section 10.3.1).
pub fn token_matches(a: &[u8; SR_TOKEN_LEN], b: &[u8]) -> bool {
    if b.len() != SR_TOKEN_LEN {
        return false;
    }
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key() -> TokenKey {
        TokenKey::new(&[0x5c; 32])
    }

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 17))
    }

    #[test]
    fn test_token_roundtrip() {
        let key = key();
        let now = SystemTime::now();

        let token = key.seal(&addr(), now).unwrap();
        assert_eq!(
            key.check(&token, &addr(), now, Duration::from_secs(30)),
            TokenCheck::Valid
        );
    }

    #[test]
    fn test_token_wrong_address() {
        let key = key();
        let now = SystemTime::now();
        let token = key.seal(&addr(), now).unwrap();

        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(
            key.check(&token, &other, now, Duration::from_secs(30)),
            TokenCheck::Invalid
        );
    }

    #[test]
    fn test_token_expiry() {
        let key = key();
        let issued = SystemTime::now();
        let token = key.seal(&addr(), issued).unwrap();

        let later = issued + Duration::from_secs(31);
        assert_eq!(
            key.check(&token, &addr(), later, Duration::from_secs(30)),
            TokenCheck::Expired
        );
    }

    #[test]
    fn test_token_garbled() {
        let key = key();
        let now = SystemTime::now();
        let mut token = key.seal(&addr(), now).unwrap();

        let tail = token.len() - 1;
        token[tail] ^= 0x01;
        assert_eq!(
            key.check(&token, &addr(), now, Duration::from_secs(30)),
            TokenCheck::Invalid
        );

        assert_eq!(
            key.check(b"short", &addr(), now, Duration::from_secs(30)),
            TokenCheck::Invalid
        );
    }

    #[test]
    fn test_token_wrong_key() {
        let now = SystemTime::now();
        let token = key().seal(&addr(), now).unwrap();

        let other = TokenKey::new(&[0x77; 32]);
        assert_eq!(
            other.check(&token, &addr(), now, Duration::from_secs(30)),
            TokenCheck::Invalid
        );
    }

    #[test]
    fn test_ipv6_token() {
        let key = key();
        let now = SystemTime::now();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();

        let token = key.seal(&v6, now).unwrap();
        assert_eq!(
            key.check(&token, &v6, now, Duration::from_secs(30)),
            TokenCheck::Valid
        );
        // v4 presenter with a v6 token fails on length alone
        assert_eq!(
            key.check(&token, &addr(), now, Duration::from_secs(30)),
            TokenCheck::Invalid
        );
    }

    #[test]
    fn test_sr_token_deterministic() {
        let a = stateless_reset_token(b"secret", &[1, 2, 3, 4]);
        let b = stateless_reset_token(b"secret", &[1, 2, 3, 4]);
        let c = stateless_reset_token(b"secret", &[1, 2, 3, 5]);
        let d = stateless_reset_token(b"other", &[1, 2, 3, 4]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_token_matches_constant_time_wrapper() {
        let token = stateless_reset_token(b"secret", &[9; 8]);
        assert!(token_matches(&token, &token));
        let mut other = token;
        other[15] ^= 1;
        assert!(!token_matches(&token, &other));
        assert!(!token_matches(&token, &token[..8]));
    }
}
