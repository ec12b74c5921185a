//! Frame type constants and frame structs (RFC 9000 Section 19).

use bytes::Bytes;
use tinyvec::TinyVec;

use crate::crypto::EncryptionLevel;
use crate::types::{PacketNumber, StreamId, VarInt};

/// Frame Type Constants (RFC 9000 Section 19)
pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_PING: u8 = 0x01;
pub const FRAME_TYPE_ACK: u8 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u8 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u8 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u8 = 0x05;
pub const FRAME_TYPE_CRYPTO: u8 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u8 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u8 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_DATA: u8 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u8 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u8 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u8 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u8 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u8 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u8 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u8 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u8 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u8 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u8 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u8 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE_QUIC: u8 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u8 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u8 = 0x1e;

/// STREAM frame flag bits encoded in the type byte (RFC 9000 Section 19.8).
pub const STREAM_FRAME_BIT_FIN: u8 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u8 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u8 = 0x04;

/// ACK Frame (RFC 9000 Section 19.3)
#[derive(Debug, Clone)]
pub struct AckFrame {
    /// Largest packet number being acknowledged
    pub largest: PacketNumber,

    /// Delay since the largest packet was received, in units of
    /// `2^ack_delay_exponent` microseconds.
    pub delay: VarInt,

    /// Number of packets acknowledged contiguously before `largest`.
    pub first_range: VarInt,

    /// Additional (gap, range) pairs, largest-first.
    pub ranges: TinyVec<[AckRange; 8]>,

    /// ECN counts (present only in ACK_ECN frames; counters are parsed
    /// and otherwise ignored).
    pub ecn: Option<EcnCounts>,
}

/// ACK Range (RFC 9000 Section 19.3.1)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    /// Unacknowledged packets before this range, minus one.
    pub gap: VarInt,

    /// Acknowledged packets in this range, minus one.
    pub range: VarInt,
}

/// ECN Counts (RFC 9000 Section 19.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

/// RESET_STREAM Frame (RFC 9000 Section 19.4)
#[derive(Debug, Clone, Copy)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
}

/// STOP_SENDING Frame (RFC 9000 Section 19.5)
#[derive(Debug, Clone, Copy)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
}

/// CRYPTO Frame (RFC 9000 Section 19.6)
#[derive(Debug, Clone)]
pub struct CryptoFrame {
    /// Byte offset in the crypto stream
    pub offset: VarInt,

    /// Handshake bytes
    pub data: Bytes,
}

/// NEW_TOKEN Frame (RFC 9000 Section 19.7)
#[derive(Debug, Clone)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM Frame (RFC 9000 Section 19.8)
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub stream_id: StreamId,

    /// Byte offset in stream (0 if the OFF bit was absent)
    pub offset: VarInt,

    /// FIN bit: no further data follows on this stream.
    pub fin: bool,

    pub data: Bytes,
}

/// MAX_DATA Frame (RFC 9000 Section 19.9)
#[derive(Debug, Clone, Copy)]
pub struct MaxDataFrame {
    pub max_data: VarInt,
}

/// MAX_STREAM_DATA Frame (RFC 9000 Section 19.10)
#[derive(Debug, Clone, Copy)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub limit: VarInt,
}

/// MAX_STREAMS Frame (RFC 9000 Section 19.11)
#[derive(Debug, Clone, Copy)]
pub struct MaxStreamsFrame {
    pub limit: VarInt,
    pub bidi: bool,
}

/// DATA_BLOCKED Frame (RFC 9000 Section 19.12)
#[derive(Debug, Clone, Copy)]
pub struct DataBlockedFrame {
    pub limit: VarInt,
}

/// STREAM_DATA_BLOCKED Frame (RFC 9000 Section 19.13)
#[derive(Debug, Clone, Copy)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub limit: VarInt,
}

/// STREAMS_BLOCKED Frame (RFC 9000 Section 19.14)
#[derive(Debug, Clone, Copy)]
pub struct StreamsBlockedFrame {
    pub limit: VarInt,
    pub bidi: bool,
}

/// NEW_CONNECTION_ID Frame (RFC 9000 Section 19.15)
#[derive(Debug, Clone)]
pub struct NewConnectionIdFrame {
    pub seqnum: VarInt,
    pub retire_prior_to: VarInt,
    pub cid: Bytes,
    pub sr_token: [u8; 16],
}

/// RETIRE_CONNECTION_ID Frame (RFC 9000 Section 19.16)
#[derive(Debug, Clone, Copy)]
pub struct RetireConnectionIdFrame {
    pub seqnum: VarInt,
}

/// CONNECTION_CLOSE Frame (RFC 9000 Section 19.19), both 0x1c and 0x1d.
#[derive(Debug, Clone)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,

    /// Frame type that triggered the close (transport variant only).
    pub frame_type: VarInt,

    /// UTF-8 reason phrase.
    pub reason: Bytes,

    /// True for the application variant (0x1d).
    pub app: bool,
}

/// Unified frame type (RFC 9000 Section 19).
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    NewToken(NewTokenFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
}

impl Frame {
    /// Returns true if this frame is ack-eliciting (RFC 9000 Section 13.2).
    ///
    /// PADDING, ACK, and CONNECTION_CLOSE do not oblige the peer to
    /// acknowledge the packet carrying them.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    /// Whether a frame of this type may appear at `level`
    /// (RFC 9000 Section 12.4, Table 3).
    pub fn permitted_at(&self, level: EncryptionLevel) -> bool {
        match level {
            EncryptionLevel::Initial | EncryptionLevel::Handshake => matches!(
                self,
                Frame::Padding
                    | Frame::Ping
                    | Frame::Ack(_)
                    | Frame::Crypto(_)
                    | Frame::ConnectionClose(ConnectionCloseFrame { app: false, .. })
            ),
            // 0-RTT excludes ACK, CRYPTO, NEW_TOKEN, RETIRE_CONNECTION_ID,
            // HANDSHAKE_DONE and the transport close variant's frame info,
            // but the server never decrypts application data before the
            // handshake surfaces it; apply the 1-RTT table.
            EncryptionLevel::ZeroRtt | EncryptionLevel::Application => true,
        }
    }

    /// The nominal wire type byte, used for error reporting.
    pub fn wire_type(&self) -> u64 {
        match self {
            Frame::Padding => FRAME_TYPE_PADDING as u64,
            Frame::Ping => FRAME_TYPE_PING as u64,
            Frame::Ack(a) if a.ecn.is_some() => FRAME_TYPE_ACK_ECN as u64,
            Frame::Ack(_) => FRAME_TYPE_ACK as u64,
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM as u64,
            Frame::StopSending(_) => FRAME_TYPE_STOP_SENDING as u64,
            Frame::Crypto(_) => FRAME_TYPE_CRYPTO as u64,
            Frame::NewToken(_) => FRAME_TYPE_NEW_TOKEN as u64,
            Frame::Stream(f) => {
                let mut t = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_OFF | STREAM_FRAME_BIT_LEN;
                if f.fin {
                    t |= STREAM_FRAME_BIT_FIN;
                }
                t as u64
            }
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA as u64,
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA as u64,
            Frame::MaxStreams(f) if f.bidi => FRAME_TYPE_MAX_STREAMS_BIDI as u64,
            Frame::MaxStreams(_) => FRAME_TYPE_MAX_STREAMS_UNI as u64,
            Frame::DataBlocked(_) => FRAME_TYPE_DATA_BLOCKED as u64,
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED as u64,
            Frame::StreamsBlocked(f) if f.bidi => FRAME_TYPE_STREAMS_BLOCKED_BIDI as u64,
            Frame::StreamsBlocked(_) => FRAME_TYPE_STREAMS_BLOCKED_UNI as u64,
            Frame::NewConnectionId(_) => FRAME_TYPE_NEW_CONNECTION_ID as u64,
            Frame::RetireConnectionId(_) => FRAME_TYPE_RETIRE_CONNECTION_ID as u64,
            Frame::PathChallenge(_) => FRAME_TYPE_PATH_CHALLENGE as u64,
            Frame::PathResponse(_) => FRAME_TYPE_PATH_RESPONSE as u64,
            Frame::ConnectionClose(f) if f.app => FRAME_TYPE_CONNECTION_CLOSE_APP as u64,
            Frame::ConnectionClose(_) => FRAME_TYPE_CONNECTION_CLOSE_QUIC as u64,
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE as u64,
        }
    }
}
