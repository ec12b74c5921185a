//! Core QUIC types: variable-length integers, connection IDs, stream
//! identifiers and protocol constants (RFC 8999, RFC 9000).

use bytes::{Buf, BufMut, Bytes};
use core::time::Duration;

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-Length Integer (RFC 9000 Section 16)
///
/// QUIC uses a variable-length encoding for integers. The first two bits
/// indicate the length: 00=1 byte, 01=2 bytes, 10=4 bytes, 11=8 bytes.
pub type VarInt = u64;

/// Maximum value for VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt encoding and decoding utilities
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt from a `Buf`, consuming 1/2/4/8 bytes.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<VarInt> {
        if !buf.has_remaining() {
            return None;
        }

        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);

        if buf.remaining() < len {
            return None;
        }

        let value = match len {
            1 => buf.get_u8() as u64,
            2 => (buf.get_u16() & 0x3fff) as u64,
            4 => (buf.get_u32() & 0x3fff_ffff) as u64,
            8 => buf.get_u64() & 0x3fff_ffff_ffff_ffff,
            _ => unreachable!(),
        };

        Some(value)
    }

    /// Encode a VarInt into a `BufMut` using the minimal encoding.
    ///
    /// Values above [`VARINT_MAX`] are truncated to it; callers validate
    /// ranges before encoding.
    pub fn encode<B: BufMut>(value: VarInt, buf: &mut B) {
        let value = value.min(VARINT_MAX);

        if value < 0x40 {
            buf.put_u8(value as u8);
        } else if value < 0x4000 {
            buf.put_u16(value as u16 | 0x4000);
        } else if value < 0x4000_0000 {
            buf.put_u32(value as u32 | 0x8000_0000);
        } else {
            buf.put_u64(value | 0xc000_0000_0000_0000);
        }
    }

    /// Calculate the encoded size for a given value.
    pub fn size(value: VarInt) -> usize {
        if value < 0x40 {
            1
        } else if value < 0x4000 {
            2
        } else if value < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

// ============================================================================
// Connection ID (RFC 9000 Section 5.1, RFC 8999 Section 5.3)
// ============================================================================

/// Maximum length of a Connection ID (20 bytes per RFC 9000)
pub const MAX_CID_LENGTH: usize = 20;

/// Length of server-chosen connection IDs.
pub const SERVER_CID_LENGTH: usize = 16;

/// Minimum client DCID length acceptable in an Initial packet
/// (RFC 9000 Section 7.2).
pub const MIN_INITIAL_DCID_LENGTH: usize = 8;

/// Connection ID - opaque endpoint-chosen identifier (RFC 8999 Section 5.3)
///
/// Zero-length CIDs are permitted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a new ConnectionId from bytes.
    ///
    /// Returns `None` if length exceeds `MAX_CID_LENGTH`.
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Generate a random server connection ID ([`SERVER_CID_LENGTH`] bytes).
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; SERVER_CID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            bytes: Bytes::copy_from_slice(&bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Create an empty (zero-length) connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Packet Number (RFC 9000 Section 12.3)
// ============================================================================

/// Packet Number - monotonically increasing per packet number space.
pub type PacketNumber = u64;

/// Sentinel for "no packet number yet" in tracker state.
pub const UNSET_PN: PacketNumber = u64::MAX;

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream identifier. The two least significant bits encode type:
/// bit 0 = server-initiated, bit 1 = unidirectional.
pub type StreamId = u64;

/// Bit 0 of a stream id: set when the server initiated the stream.
pub const STREAM_SERVER_INITIATED: u64 = 0x01;

/// Bit 1 of a stream id: set for unidirectional streams.
pub const STREAM_UNIDIRECTIONAL: u64 = 0x02;

#[inline]
pub fn stream_is_server_initiated(id: StreamId) -> bool {
    id & STREAM_SERVER_INITIATED != 0
}

#[inline]
pub fn stream_is_unidirectional(id: StreamId) -> bool {
    id & STREAM_UNIDIRECTIONAL != 0
}

/// Index of a stream within its type (the id with the two type bits shifted
/// out). Limits and implicit-open accounting operate on this value.
#[inline]
pub fn stream_index(id: StreamId) -> u64 {
    id >> 2
}

// ============================================================================
// Protocol constants
// ============================================================================

/// Minimum size of an Initial packet carrying ack-eliciting frames
/// (RFC 9000 Section 14.1).
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Largest UDP payload the engine will ever produce or accept.
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65527;

/// Default outgoing UDP payload bound before the peer advertises one.
pub const MAX_UDP_PAYLOAD_OUT: usize = 1252;

/// Number of ack-eliciting packets that may arrive before an ACK is forced.
pub const MAX_ACK_GAP: u64 = 2;

/// Receive ring size and per-stream unacked send budget.
pub const STREAM_BUFSIZE: usize = 65536;

/// Out-of-order bytes a crypto or stream reassembler may hold.
pub const MAX_BUFFERED: u64 = 65535;

/// Shortest packet that can carry a valid 16-byte AEAD tag plus header
/// protection sample.
pub const MIN_PKT_LEN: usize = 21;

/// Stateless reset packet bounds: 5 random bytes + 16 token + 22 padding.
pub const MIN_SR_PACKET: usize = 43;
pub const MAX_SR_PACKET: usize = 1200;

/// Stateless reset token length (RFC 9000 Section 10.3).
pub const SR_TOKEN_LEN: usize = 16;

/// AEAD authentication tag length for all QUIC v1 cipher suites.
pub const TAG_LEN: usize = 16;

/// Largest short header: flags + 20-byte CID + 4-byte packet number.
pub const MAX_SHORT_HEADER: usize = 25;

/// Largest long header we emit: flags, version, both CIDs with length
/// bytes, token length, length field, packet number.
pub const MAX_LONG_HEADER: usize = 56;

/// Packet reordering threshold before a packet is declared lost
/// (RFC 9002 Section 6.1.1).
pub const PKT_THRESHOLD: u64 = 3;

/// Time threshold numerator/denominator (9/8 of max RTT, RFC 9002 6.1.2).
pub const TIME_THRESHOLD_NUM: u32 = 9;
pub const TIME_THRESHOLD_DEN: u32 = 8;

/// Timer granularity floor used in PTO and loss deadlines.
pub const TIME_GRANULARITY: Duration = Duration::from_millis(1);

/// RTT estimate used before the first sample (RFC 9002 Section 6.2.2).
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Minimum interval between CONNECTION_CLOSE retransmissions while closing.
pub const CC_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Lifetime of address-validation tokens.
pub const RETRY_LIFETIME: Duration = Duration::from_secs(30);

/// Read timeout while waiting for a post-Retry Initial.
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ack_delay_exponent assumed until the peer advertises one
/// (RFC 9000 Section 18.2).
pub const DEFAULT_ACK_DELAY_EXPONENT: u64 = 3;

/// Default max_ack_delay assumed until the peer advertises one.
pub const DEFAULT_MAX_ACK_DELAY: u64 = 25;

// ============================================================================
// Unit Tests
// ============================================================================
