//! Per-stream state (RFC 9000 Section 3).

use crate::types::{
    stream_is_server_initiated, stream_is_unidirectional, StreamId, STREAM_BUFSIZE,
};

use super::buffer::RingBuffer;
use super::ordered::OrderedStream;

/// One application stream.
///
/// Receive-side flow control is implicit in the ring: the advertised
/// MAX_STREAM_DATA is always `rx.received + ring free space`, so the
/// ring can only overflow if the peer overruns its window.
pub struct Stream {
    pub id: StreamId,

    /// Reassembly state for incoming STREAM frames.
    pub rx: OrderedStream,

    /// In-order received bytes awaiting consumer reads.
    pub ring: RingBuffer,

    /// Highest stream offset seen, for connection-level flow accounting.
    pub rx_highwater: u64,

    /// Peer-granted send window (MAX_STREAM_DATA).
    pub send_max_data: u64,

    /// Bytes accepted from the local sender.
    pub sent: u64,

    /// Bytes the peer acknowledged.
    pub acked: u64,

    /// FIN arrived; surfaced to the consumer only once the ring drains.
    pub pending_eof: bool,

    /// Read side failed (peer RESET_STREAM or connection error).
    pub read_error: bool,

    /// Write side failed (peer STOP_SENDING or connection error).
    pub write_error: bool,

    /// Write side was blocked on the unacked budget and should be
    /// re-armed when acks free space.
    pub write_blocked: bool,

    /// FIN queued on the send side.
    pub fin_sent: bool,

    /// Consumer closed the stream locally.
    pub local_closed: bool,
}

impl Stream {
    pub fn new(id: StreamId, rcvbuf_size: usize, send_max_data: u64) -> Self {
        Self {
            id,
            rx: OrderedStream::new(),
            ring: RingBuffer::new(rcvbuf_size),
            rx_highwater: 0,
            send_max_data,
            sent: 0,
            acked: 0,
            pending_eof: false,
            read_error: false,
            write_error: false,
            write_blocked: false,
            fin_sent: false,
            local_closed: false,
        }
    }

    pub fn is_unidirectional(&self) -> bool {
        stream_is_unidirectional(self.id)
    }

    pub fn is_server_initiated(&self) -> bool {
        stream_is_server_initiated(self.id)
    }

    /// The stream-level send allowance right now: the unacked-buffer
    /// budget capped by the peer's MAX_STREAM_DATA grant. The connection
    /// window is applied by the caller.
    pub fn send_allowance(&self) -> u64 {
        let unacked = self.sent - self.acked;

        if unacked >= STREAM_BUFSIZE as u64 {
            return 0;
        }
        let mut size = STREAM_BUFSIZE as u64 - unacked;

        if self.sent >= self.send_max_data {
            return 0;
        }
        size = size.min(self.send_max_data - self.sent);

        size
    }

    /// Whether the consumer can read or observe EOF.
    pub fn readable(&self) -> bool {
        !self.ring.is_empty() || self.pending_eof || self.read_error
    }

    /// The MAX_STREAM_DATA value to advertise after a consumer read.
    pub fn recv_limit(&self) -> u64 {
        self.rx.received + self.ring.free_space() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_allowance_buffer_budget() {
        let mut s = Stream::new(0, 1024, 1 << 20);
        assert_eq!(s.send_allowance(), STREAM_BUFSIZE as u64);

        s.sent = STREAM_BUFSIZE as u64;
        assert_eq!(s.send_allowance(), 0);

        s.acked = 1000;
        assert_eq!(s.send_allowance(), 1000);
    }

    #[test]
    fn test_send_allowance_peer_window() {
        let mut s = Stream::new(0, 1024, 500);
        assert_eq!(s.send_allowance(), 500);

        s.sent = 500;
        assert_eq!(s.send_allowance(), 0);

        s.send_max_data = 800;
        assert_eq!(s.send_allowance(), 300);
    }

    #[test]
    fn test_recv_limit_tracks_ring() {
        let mut s = Stream::new(0, 64, 0);
        assert_eq!(s.recv_limit(), 64);

        s.ring.write(&[0u8; 16]).unwrap();
        s.rx.received = 16;
        assert_eq!(s.recv_limit(), 64);

        let mut out = [0u8; 16];
        s.ring.read(&mut out);
        assert_eq!(s.recv_limit(), 80);
    }

    #[test]
    fn test_stream_kind_bits() {
        assert!(Stream::new(0x03, 64, 0).is_unidirectional());
        assert!(Stream::new(0x03, 64, 0).is_server_initiated());
        assert!(!Stream::new(0x00, 64, 0).is_unidirectional());
    }
}
