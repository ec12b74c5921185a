//! Frame serialization (RFC 9000 Section 19).
//!
//! The packetizer sizes packets with [`Frame::wire_len`] before writing,
//! so both paths must agree byte-for-byte.

use bytes::{BufMut, BytesMut};

use crate::types::VarIntCodec;

use super::types::*;

impl Frame {
    /// Serialize this frame into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Padding => buf.put_u8(FRAME_TYPE_PADDING),
            Frame::Ping => buf.put_u8(FRAME_TYPE_PING),

            Frame::Ack(f) => {
                buf.put_u8(if f.ecn.is_some() {
                    FRAME_TYPE_ACK_ECN
                } else {
                    FRAME_TYPE_ACK
                });
                VarIntCodec::encode(f.largest, buf);
                VarIntCodec::encode(f.delay, buf);
                VarIntCodec::encode(f.ranges.len() as u64, buf);
                VarIntCodec::encode(f.first_range, buf);
                for r in &f.ranges {
                    VarIntCodec::encode(r.gap, buf);
                    VarIntCodec::encode(r.range, buf);
                }
                if let Some(ecn) = &f.ecn {
                    VarIntCodec::encode(ecn.ect0, buf);
                    VarIntCodec::encode(ecn.ect1, buf);
                    VarIntCodec::encode(ecn.ce, buf);
                }
            }

            Frame::ResetStream(f) => {
                buf.put_u8(FRAME_TYPE_RESET_STREAM);
                VarIntCodec::encode(f.stream_id, buf);
                VarIntCodec::encode(f.error_code, buf);
                VarIntCodec::encode(f.final_size, buf);
            }

            Frame::StopSending(f) => {
                buf.put_u8(FRAME_TYPE_STOP_SENDING);
                VarIntCodec::encode(f.stream_id, buf);
                VarIntCodec::encode(f.error_code, buf);
            }

            Frame::Crypto(f) => {
                buf.put_u8(FRAME_TYPE_CRYPTO);
                VarIntCodec::encode(f.offset, buf);
                VarIntCodec::encode(f.data.len() as u64, buf);
                buf.extend_from_slice(&f.data);
            }

            Frame::NewToken(f) => {
                buf.put_u8(FRAME_TYPE_NEW_TOKEN);
                VarIntCodec::encode(f.token.len() as u64, buf);
                buf.extend_from_slice(&f.token);
            }

            // STREAM frames always go out with OFF and LEN set, matching
            // what the packetizer accounts for in the max frame size.
            Frame::Stream(f) => {
                buf.put_u8(self.wire_type() as u8);
                VarIntCodec::encode(f.stream_id, buf);
                VarIntCodec::encode(f.offset, buf);
                VarIntCodec::encode(f.data.len() as u64, buf);
                buf.extend_from_slice(&f.data);
            }

            Frame::MaxData(f) => {
                buf.put_u8(FRAME_TYPE_MAX_DATA);
                VarIntCodec::encode(f.max_data, buf);
            }

            Frame::MaxStreamData(f) => {
                buf.put_u8(FRAME_TYPE_MAX_STREAM_DATA);
                VarIntCodec::encode(f.stream_id, buf);
                VarIntCodec::encode(f.limit, buf);
            }

            Frame::MaxStreams(f) => {
                buf.put_u8(self.wire_type() as u8);
                VarIntCodec::encode(f.limit, buf);
            }

            Frame::DataBlocked(f) => {
                buf.put_u8(FRAME_TYPE_DATA_BLOCKED);
                VarIntCodec::encode(f.limit, buf);
            }

            Frame::StreamDataBlocked(f) => {
                buf.put_u8(FRAME_TYPE_STREAM_DATA_BLOCKED);
                VarIntCodec::encode(f.stream_id, buf);
                VarIntCodec::encode(f.limit, buf);
            }

            Frame::StreamsBlocked(f) => {
                buf.put_u8(self.wire_type() as u8);
                VarIntCodec::encode(f.limit, buf);
            }

            Frame::NewConnectionId(f) => {
                buf.put_u8(FRAME_TYPE_NEW_CONNECTION_ID);
                VarIntCodec::encode(f.seqnum, buf);
                VarIntCodec::encode(f.retire_prior_to, buf);
                buf.put_u8(f.cid.len() as u8);
                buf.extend_from_slice(&f.cid);
                buf.extend_from_slice(&f.sr_token);
            }

            Frame::RetireConnectionId(f) => {
                buf.put_u8(FRAME_TYPE_RETIRE_CONNECTION_ID);
                VarIntCodec::encode(f.seqnum, buf);
            }

            Frame::PathChallenge(data) => {
                buf.put_u8(FRAME_TYPE_PATH_CHALLENGE);
                buf.extend_from_slice(data);
            }

            Frame::PathResponse(data) => {
                buf.put_u8(FRAME_TYPE_PATH_RESPONSE);
                buf.extend_from_slice(data);
            }

            Frame::ConnectionClose(f) => {
                buf.put_u8(self.wire_type() as u8);
                VarIntCodec::encode(f.error_code, buf);
                if !f.app {
                    VarIntCodec::encode(f.frame_type, buf);
                }
                VarIntCodec::encode(f.reason.len() as u64, buf);
                buf.extend_from_slice(&f.reason);
            }

            Frame::HandshakeDone => buf.put_u8(FRAME_TYPE_HANDSHAKE_DONE),
        }
    }

    /// Serialized size in bytes.
    pub fn wire_len(&self) -> usize {
        let sz = VarIntCodec::size;
        match self {
            Frame::Padding | Frame::Ping | Frame::HandshakeDone => 1,

            Frame::Ack(f) => {
                let mut len = 1
                    + sz(f.largest)
                    + sz(f.delay)
                    + sz(f.ranges.len() as u64)
                    + sz(f.first_range);
                for r in &f.ranges {
                    len += sz(r.gap) + sz(r.range);
                }
                if let Some(ecn) = &f.ecn {
                    len += sz(ecn.ect0) + sz(ecn.ect1) + sz(ecn.ce);
                }
                len
            }

            Frame::ResetStream(f) => 1 + sz(f.stream_id) + sz(f.error_code) + sz(f.final_size),
            Frame::StopSending(f) => 1 + sz(f.stream_id) + sz(f.error_code),
            Frame::Crypto(f) => {
                1 + sz(f.offset) + sz(f.data.len() as u64) + f.data.len()
            }
            Frame::NewToken(f) => 1 + sz(f.token.len() as u64) + f.token.len(),
            Frame::Stream(f) => {
                1 + sz(f.stream_id) + sz(f.offset) + sz(f.data.len() as u64) + f.data.len()
            }
            Frame::MaxData(f) => 1 + sz(f.max_data),
            Frame::MaxStreamData(f) => 1 + sz(f.stream_id) + sz(f.limit),
            Frame::MaxStreams(f) => 1 + sz(f.limit),
            Frame::DataBlocked(f) => 1 + sz(f.limit),
            Frame::StreamDataBlocked(f) => 1 + sz(f.stream_id) + sz(f.limit),
            Frame::StreamsBlocked(f) => 1 + sz(f.limit),
            Frame::NewConnectionId(f) => {
                1 + sz(f.seqnum) + sz(f.retire_prior_to) + 1 + f.cid.len() + 16
            }
            Frame::RetireConnectionId(f) => 1 + sz(f.seqnum),
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 9,
            Frame::ConnectionClose(f) => {
                let mut len = 1 + sz(f.error_code) + sz(f.reason.len() as u64) + f.reason.len();
                if !f.app {
                    len += sz(f.frame_type);
                }
                len
            }
        }
    }
}
