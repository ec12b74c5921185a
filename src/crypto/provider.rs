//! The TLS provider seam.
//!
//! The host supplies a [`TlsSession`] (BoringSSL, rustls, or a test
//! double). The connection feeds it reassembled CRYPTO bytes; the session
//! pushes secrets, outgoing handshake bytes, completion and alerts into a
//! [`HandshakeSink`] that the connection drains synchronously after each
//! call. The sink is push-only, so the provider can never re-enter the
//! connection.

use crate::error::Result;

use super::EncryptionLevel;

/// Which direction a secret protects, from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretDir {
    /// Protects packets we receive (client write direction).
    Read,
    /// Protects packets we send (server write direction).
    Write,
}

/// A traffic secret exported by the TLS session.
#[derive(Debug, Clone)]
pub struct SecretInstall {
    pub level: EncryptionLevel,
    pub dir: SecretDir,

    /// Negotiated TLS cipher suite id (0x1301/0x1302/0x1303).
    pub suite: u16,

    pub secret: Vec<u8>,
}

/// Collects everything the TLS session produced during one
/// `read_handshake` call.
#[derive(Default)]
pub struct HandshakeSink {
    /// Secrets to install, in the order the session exported them.
    pub secrets: Vec<SecretInstall>,

    /// Outgoing CRYPTO bytes per level, in emission order.
    pub outgoing: Vec<(EncryptionLevel, Vec<u8>)>,

    /// Set once when the TLS handshake completes.
    pub complete: bool,

    /// Fatal TLS alert to convert into a 0x0100-range close.
    pub alert: Option<u8>,
}

impl HandshakeSink {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A server-side TLS 1.3 session speaking through QUIC CRYPTO streams.
pub trait TlsSession: Send {
    /// Hand the session our encoded transport parameters before the
    /// first CRYPTO delivery.
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()>;

    /// Deliver contiguous CRYPTO bytes received at `level`; the session
    /// pushes its products into `sink`.
    fn read_handshake(
        &mut self,
        level: EncryptionLevel,
        data: &[u8],
        sink: &mut HandshakeSink,
    ) -> Result<()>;

    /// The peer's raw transport parameters, once seen in the ClientHello.
    fn peer_transport_params(&self) -> Option<&[u8]>;

    /// Negotiated ALPN protocol, if any.
    fn alpn_protocol(&self) -> Option<&[u8]>;

    fn is_handshake_complete(&self) -> bool;
}
