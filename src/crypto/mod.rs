//! Packet protection and the pluggable TLS provider seam (RFC 9001).
//!
//! The engine derives all packet-protection key material itself (initial
//! secrets from the client's destination CID, per-level keys from the
//! secrets the TLS session exports) and performs AEAD and header
//! protection via `ring`. The TLS handshake itself is external: the host
//! supplies a [`TlsSession`] and the connection drains its
//! [`HandshakeSink`] after every CRYPTO delivery.

mod keys;
mod provider;
mod secrets;

pub use keys::{DirectionalKeys, Keys};
pub use provider::{HandshakeSink, SecretInstall, SecretDir, TlsSession};
pub use secrets::{
    derive_initial_keys, hkdf_expand_label, retry_integrity_tag, CipherSuite,
};

/// Encryption level of a packet or CRYPTO stream (RFC 9001 Section 2.1).
///
/// 0-RTT keys may be installed but application data is not surfaced
/// before handshake completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    Application = 3,
}

/// Number of encryption levels (and CRYPTO reassembly streams).
pub const ENCRYPTION_LEVELS: usize = 4;

impl EncryptionLevel {
    /// The packet number space this level's packets are numbered in
    /// (RFC 9000 Section 12.3: 0-RTT and 1-RTT share a space).
    pub fn space(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::Handshake => 1,
            EncryptionLevel::ZeroRtt | EncryptionLevel::Application => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncryptionLevel::Initial => "init",
            EncryptionLevel::ZeroRtt => "early",
            EncryptionLevel::Handshake => "hs",
            EncryptionLevel::Application => "app",
        }
    }
}
