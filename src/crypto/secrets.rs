//! Key derivation (RFC 9001 Section 5).
//!
//! Initial secrets are always HKDF-SHA256 over the v1 salt; handshake and
//! 1-RTT secrets arrive from the TLS session and expand with the hash of
//! the negotiated cipher suite.

use ring::aead;
use ring::hkdf;

use crate::error::{Error, Result};

/// QUIC v1 initial salt (RFC 9001 Section 5.2).
const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Retry integrity tag key and nonce (RFC 9001 Section 5.8).
const RETRY_INTEGRITY_KEY_V1: [u8; 16] = [
    0xbe, 0x0c, 0x69, 0x0b, 0x9f, 0x66, 0x57, 0x5a, 0x1d, 0x76, 0x6b, 0x54, 0xe3, 0x68, 0xc8,
    0x4e,
];
const RETRY_INTEGRITY_NONCE_V1: [u8; 12] = [
    0x46, 0x15, 0x99, 0xd3, 0x5d, 0x63, 0x2b, 0xf2, 0x23, 0x98, 0x25, 0xbb,
];

/// TLS 1.3 cipher suites usable with QUIC (RFC 9001 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// TLS_AES_128_GCM_SHA256 (0x1301)
    Aes128GcmSha256,
    /// TLS_AES_256_GCM_SHA384 (0x1302)
    Aes256GcmSha384,
    /// TLS_CHACHA20_POLY1305_SHA256 (0x1303)
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    pub fn from_tls_id(id: u16) -> Result<Self> {
        match id {
            0x1301 => Ok(CipherSuite::Aes128GcmSha256),
            0x1302 => Ok(CipherSuite::Aes256GcmSha384),
            0x1303 => Ok(CipherSuite::ChaCha20Poly1305Sha256),
            // unsupported_certificate alert range is not right here; any
            // unknown suite is a handshake failure
            _ => Err(Error::Crypto(40)),
        }
    }

    pub fn aead(self) -> &'static aead::Algorithm {
        match self {
            CipherSuite::Aes128GcmSha256 => &aead::AES_128_GCM,
            CipherSuite::Aes256GcmSha384 => &aead::AES_256_GCM,
            CipherSuite::ChaCha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
        }
    }

    pub fn hp(self) -> &'static aead::quic::Algorithm {
        match self {
            CipherSuite::Aes128GcmSha256 => &aead::quic::AES_128,
            CipherSuite::Aes256GcmSha384 => &aead::quic::AES_256,
            CipherSuite::ChaCha20Poly1305Sha256 => &aead::quic::CHACHA20,
        }
    }

    pub fn hkdf(self) -> hkdf::Algorithm {
        match self {
            CipherSuite::Aes128GcmSha256 | CipherSuite::ChaCha20Poly1305Sha256 => {
                hkdf::HKDF_SHA256
            }
            CipherSuite::Aes256GcmSha384 => hkdf::HKDF_SHA384,
        }
    }

    pub fn key_len(self) -> usize {
        self.aead().key_len()
    }

    /// Length of secrets produced by the suite's hash.
    pub fn secret_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 | CipherSuite::ChaCha20Poly1305Sha256 => 32,
            CipherSuite::Aes256GcmSha384 => 48,
        }
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label (RFC 8446 Section 7.1) with an empty context.
pub fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const PREFIX: &[u8] = b"tls13 ";

    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = (PREFIX.len() + label.len()) as u8;
    let info = [&out_len[..], &[label_len], PREFIX, label, &[0u8]];

    // lengths are fixed small constants, expand cannot fail
    prk.expand(&info, OkmLen(out.len()))
        .expect("expand label")
        .fill(out)
        .expect("fill label");
}

/// Expand a traffic secret into (key, iv, hp) material.
pub fn derive_packet_material(
    suite: CipherSuite,
    secret: &[u8],
) -> (Vec<u8>, [u8; 12], Vec<u8>) {
    let prk = hkdf::Prk::new_less_safe(suite.hkdf(), secret);

    let mut key = vec![0u8; suite.key_len()];
    hkdf_expand_label(&prk, b"quic key", &mut key);

    let mut iv = [0u8; 12];
    hkdf_expand_label(&prk, b"quic iv", &mut iv);

    let mut hp = vec![0u8; suite.key_len()];
    hkdf_expand_label(&prk, b"quic hp", &mut hp);

    (key, iv, hp)
}

/// Derive the next-generation traffic secret for a key update
/// (RFC 9001 Section 6.1: "quic ku").
pub fn next_generation_secret(suite: CipherSuite, secret: &[u8]) -> Vec<u8> {
    let prk = hkdf::Prk::new_less_safe(suite.hkdf(), secret);
    let mut next = vec![0u8; suite.secret_len()];
    hkdf_expand_label(&prk, b"quic ku", &mut next);
    next
}

/// Derive the client and server initial traffic secrets from the
/// client-chosen destination connection ID (RFC 9001 Section 5.2).
pub fn derive_initial_secrets(dcid: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT_V1);
    let initial = salt.extract(dcid);

    let mut client = vec![0u8; 32];
    hkdf_expand_label(&initial, b"client in", &mut client);

    let mut server = vec![0u8; 32];
    hkdf_expand_label(&initial, b"server in", &mut server);

    (client, server)
}

/// Derive the full initial key pair (client-write, server-write) for a
/// connection. Initial packets always use AES-128-GCM with SHA-256.
pub fn derive_initial_keys(dcid: &[u8]) -> (super::DirectionalKeys, super::DirectionalKeys) {
    let (client_secret, server_secret) = derive_initial_secrets(dcid);
    let suite = CipherSuite::Aes128GcmSha256;
    (
        super::DirectionalKeys::from_secret(suite, client_secret),
        super::DirectionalKeys::from_secret(suite, server_secret),
    )
}

/// Compute the Retry integrity tag over a Retry pseudo-packet
/// (RFC 9001 Section 5.8).
///
/// `pseudo` is the ODCID-prefixed retry packet without the tag.
pub fn retry_integrity_tag(pseudo: &[u8]) -> [u8; 16] {
    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &RETRY_INTEGRITY_KEY_V1).expect("retry key"),
    );
    let nonce = aead::Nonce::assume_unique_for_key(RETRY_INTEGRITY_NONCE_V1);

    let mut in_out: Vec<u8> = Vec::new();
    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo), &mut in_out)
        .expect("retry tag");

    let mut out = [0u8; 16];
    out.copy_from_slice(tag.as_ref());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 9001 Appendix A.1 sample DCID
    const SAMPLE_DCID: [u8; 8] = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

    #[test]
    fn test_initial_secrets_rfc9001_vectors() {
        let (client, server) = derive_initial_secrets(&SAMPLE_DCID);

        let expected_client: [u8; 32] = [
            0xc0, 0x0c, 0xf1, 0x51, 0xca, 0x5b, 0xe0, 0x75, 0xed, 0x0e, 0xbf, 0xb5, 0xc8, 0x03,
            0x23, 0xc4, 0x2d, 0x6b, 0x7d, 0xb6, 0x78, 0x81, 0x28, 0x9a, 0xf4, 0x00, 0x8f, 0x1f,
            0x6c, 0x35, 0x7a, 0xea,
        ];
        let expected_server: [u8; 32] = [
            0x3c, 0x19, 0x98, 0x28, 0xfd, 0x13, 0x9e, 0xfd, 0x21, 0x6c, 0x15, 0x5a, 0xd8, 0x44,
            0xcc, 0x81, 0xfb, 0x82, 0xfa, 0x8d, 0x74, 0x46, 0xfa, 0x7d, 0x78, 0xbe, 0x80, 0x3a,
            0xcd, 0xda, 0x95, 0x1b,
        ];

        assert_eq!(client, expected_client);
        assert_eq!(server, expected_server);
    }

    #[test]
    fn test_client_initial_packet_material() {
        // RFC 9001 A.1: client initial key/iv/hp
        let (client, _) = derive_initial_secrets(&SAMPLE_DCID);
        let (key, iv, hp) = derive_packet_material(CipherSuite::Aes128GcmSha256, &client);

        assert_eq!(
            key,
            [
                0x1f, 0x36, 0x96, 0x13, 0xdd, 0x76, 0xd5, 0x46, 0x77, 0x30, 0xef, 0xcb, 0xe3,
                0xb1, 0xa2, 0x2d
            ]
        );
        assert_eq!(
            iv,
            [0xfa, 0x04, 0x4b, 0x2f, 0x42, 0xa3, 0xfd, 0x3b, 0x46, 0xfb, 0x25, 0x5c]
        );
        assert_eq!(
            hp,
            [
                0x9f, 0x50, 0x44, 0x9e, 0x04, 0xa0, 0xe8, 0x10, 0x28, 0x3a, 0x1e, 0x99, 0x33,
                0xad, 0xed, 0xd2
            ]
        );
    }

    #[test]
    fn test_key_update_idempotence() {
        // Two successive updates equal deriving the second generation
        // directly from the chain.
        let secret = vec![0x42u8; 32];
        let suite = CipherSuite::Aes128GcmSha256;

        let gen1 = next_generation_secret(suite, &secret);
        let gen2 = next_generation_secret(suite, &gen1);

        let gen1b = next_generation_secret(suite, &secret);
        let gen2b = next_generation_secret(suite, &gen1b);

        assert_eq!(gen1, gen1b);
        assert_eq!(gen2, gen2b);
        assert_ne!(gen1, gen2);
    }

    #[test]
    fn test_retry_integrity_rfc9001_vector() {
        // RFC 9001 A.4: retry pseudo-packet for ODCID 0x8394c8f03e515708
        let pseudo: Vec<u8> = {
            let mut v = Vec::new();
            v.push(8);
            v.extend_from_slice(&SAMPLE_DCID);
            v.extend_from_slice(&[
                0xff, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0xf0, 0x67, 0xa5, 0x50, 0x2a, 0x42,
                0x62, 0xb5, 0x74, 0x6f, 0x6b, 0x65, 0x6e,
            ]);
            v
        };

        let tag = retry_integrity_tag(&pseudo);
        assert_eq!(
            tag,
            [
                0x04, 0xa2, 0x65, 0xba, 0x2e, 0xff, 0x4d, 0x82, 0x90, 0x58, 0xfb, 0x3f, 0x0f,
                0x24, 0x96, 0xba
            ]
        );
    }

    #[test]
    fn test_suite_parameters() {
        assert_eq!(CipherSuite::from_tls_id(0x1301), Ok(CipherSuite::Aes128GcmSha256));
        assert_eq!(CipherSuite::Aes128GcmSha256.key_len(), 16);
        assert_eq!(CipherSuite::Aes256GcmSha384.key_len(), 32);
        assert_eq!(CipherSuite::Aes256GcmSha384.secret_len(), 48);
        assert!(CipherSuite::from_tls_id(0x1399).is_err());
    }
}
