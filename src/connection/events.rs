//! Host-facing events, transmits and timer kinds.

use bytes::Bytes;

use crate::types::StreamId;

/// A UDP datagram ready to send to the connection's peer.
#[derive(Debug)]
pub struct Transmit {
    pub data: Vec<u8>,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// TLS handshake completed; 1-RTT traffic flows.
    HandshakeComplete,

    /// Peer opened a stream (implicitly-opened streams are announced in
    /// id order before the stream that triggered them).
    StreamOpened(StreamId),

    /// In-order data or EOF is available to read.
    StreamReadable(StreamId),

    /// A previously blocked write side may make progress again.
    StreamWritable(StreamId),

    /// Peer abandoned its send direction (RESET_STREAM).
    StreamReset(StreamId, u64),

    /// Peer asked us to stop sending (STOP_SENDING).
    StreamStopped(StreamId, u64),

    /// The connection terminated. `app` marks an application-level
    /// close; silent closes (idle, stateless reset) carry NO_ERROR.
    Closed {
        code: u64,
        app: bool,
        reason: Bytes,
    },
}

/// Outcome of a stream read.
#[derive(Debug)]
pub enum StreamRecv {
    /// Bytes copied out.
    Data(usize),

    /// Nothing buffered right now.
    WouldBlock,

    /// All data consumed and the peer finished the stream.
    Eof,

    /// The read side failed (peer reset or connection error).
    Error,
}

/// Logical timers a connection keeps; the host arms the earliest
/// deadline from `poll_timeout` and calls `on_timeout` when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// PTO probe or loss-detection deadline (one timer, two roles).
    PtoOrLoss,

    /// Delayed-ACK flush.
    Push,

    /// End of the closing/draining period.
    Close,

    /// Idle timeout.
    Idle,
}
