//! The connection state machine and its public surface
//! (RFC 9000 Sections 5, 10).

mod cid;
mod events;
mod state;

pub use cid::ClientCids;
pub use events::{Event, StreamRecv, TimerKind, Transmit};
pub use state::{accept, Accept, Connection};

use std::time::Duration;

use crate::crypto::TlsSession;
use crate::transport::TransportParameters;
use crate::types;

/// Per-endpoint configuration handed to every accepted connection.
pub struct Config {
    /// The TLS 1.3 session driving the handshake.
    pub tls: Box<dyn TlsSession>,

    /// Our transport parameters; connection-specific fields (CIDs,
    /// stateless reset token) are filled in per connection.
    pub transport_params: TransportParameters,

    /// Ask clients to prove address ownership with a Retry round trip.
    pub retry: bool,

    /// Key sealing Retry and NEW_TOKEN address-validation tokens;
    /// required when `retry` is set.
    pub token_key: Option<[u8; 32]>,

    /// Stateless-reset key; empty disables stateless resets and per-CID
    /// token advertisement.
    pub sr_token_key: Vec<u8>,

    /// Close with NO_APPLICATION_PROTOCOL when ALPN yields nothing.
    pub require_alpn: bool,

    /// Address-validation token lifetime.
    pub retry_lifetime: Duration,

    /// Floor between CONNECTION_CLOSE retransmissions while closing.
    pub cc_min_interval: Duration,

    /// Timer granularity for PTO and loss deadlines.
    pub time_granularity: Duration,

    /// Packet reordering threshold (RFC 9002 kPacketThreshold).
    pub pkt_threshold: u64,

    /// Time reordering threshold as a fraction of RTT
    /// (RFC 9002 kTimeThreshold).
    pub time_threshold: f64,

    /// RTT assumed before the first sample.
    pub initial_rtt: Duration,
}

impl Config {
    pub fn new(tls: Box<dyn TlsSession>, transport_params: TransportParameters) -> Self {
        Self {
            tls,
            transport_params,
            retry: false,
            token_key: None,
            sr_token_key: Vec::new(),
            require_alpn: false,
            retry_lifetime: types::RETRY_LIFETIME,
            cc_min_interval: types::CC_MIN_INTERVAL,
            time_granularity: types::TIME_GRANULARITY,
            pkt_threshold: types::PKT_THRESHOLD,
            time_threshold: types::TIME_THRESHOLD_NUM as f64 / types::TIME_THRESHOLD_DEN as f64,
            initial_rtt: types::INITIAL_RTT,
        }
    }
}
