//! # quicserv: Server-Side QUIC v1 Connection Engine
//!
//! A pure protocol state machine terminating QUIC version 1 (RFC 8999,
//! RFC 9000, RFC 9001, RFC 9002) connections on top of UDP. The host
//! owns sockets, timers and the event loop; the engine owns everything
//! between the datagram and the application stream:
//!
//! ```text
//! quicserv/
//! ├── error          - RFC 9000 Section 20 error codes
//! ├── types          - varints, connection ids, protocol constants
//! ├── frames         - all 20+ frame types, decode + encode
//! ├── packet         - headers, packet numbers, per-space ACK tracking
//! ├── crypto         - packet protection, key update, TLS provider seam
//! ├── recovery       - RTT estimation, PTO, NewReno (RFC 9002)
//! ├── stream         - reassembly, receive rings, stream accounting
//! ├── flow_control   - connection-level data windows
//! ├── token          - Retry/NEW_TOKEN and stateless-reset tokens
//! ├── server         - amplification limits, stateless reset emission
//! └── connection     - the per-connection state machine
//! ```
//!
//! ## Design
//!
//! 1. **Pure state machine**: no I/O and no clocks. Input is datagrams
//!    and `Instant`s; output is datagrams, events and deadlines.
//! 2. **Single-threaded per connection**: all state is owned by the
//!    connection, serialized on the host's event loop. The only state
//!    shared across connections is immutable configuration.
//! 3. **Pluggable TLS**: the handshake lives behind the
//!    [`crypto::TlsSession`] trait; the session pushes secrets and
//!    flight bytes into a sink the connection drains synchronously.
//! 4. **Frame-level retransmission**: lost packets are never resent;
//!    their frames re-enter the send queue, refreshed where state moved
//!    on (flow-control limits, acknowledgment ranges).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quicserv::{accept, Accept, Config};
//!
//! // first datagram from an unknown 4-tuple
//! match accept(config, peer_ip, now, datagram) {
//!     Accept::Connection(mut conn, transmits) => {
//!         send_all(transmits);
//!         while let Some(event) = conn.poll_event() {
//!             // handshake progress, opened streams, readable data
//!         }
//!     }
//!     Accept::Reject(Some(reply)) => send(reply), // version negotiation
//!     Accept::Reject(None) => {}
//! }
//! ```

pub mod connection;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod packet;
pub mod recovery;
pub mod server;
pub mod stream;
pub mod token;
pub mod transport;
pub mod types;
pub mod version;

pub use connection::{accept, Accept, Config, Connection, Event, StreamRecv, TimerKind, Transmit};
pub use crypto::{EncryptionLevel, HandshakeSink, SecretDir, SecretInstall, TlsSession};
pub use error::{ConnectionError, Error, Result};
pub use transport::TransportParameters;
pub use types::{ConnectionId, StreamId};
pub use version::VERSION_1;
