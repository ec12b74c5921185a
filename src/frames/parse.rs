//! Frame decoding (RFC 9000 Section 19).
//!
//! The parser consumes a decrypted packet payload held in `Bytes`; STREAM
//! and CRYPTO data become cheap sub-slices of that buffer.

use bytes::{Buf, Bytes};
use tinyvec::TinyVec;

use crate::error::{Error, Result};
use crate::types::{VarInt, VarIntCodec};

use super::types::*;

/// Iterates frames over a decrypted packet payload.
pub struct FrameParser {
    buf: Bytes,
}

impl FrameParser {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    /// Parse the next frame, or `None` at end of payload.
    ///
    /// Any malformation maps to [`Error::FrameEncodingError`]; the caller
    /// turns that into a connection close.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        let ty = self.buf.get_u8();

        let frame = match ty {
            FRAME_TYPE_PADDING => Frame::Padding,
            FRAME_TYPE_PING => Frame::Ping,
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => self.parse_ack(ty == FRAME_TYPE_ACK_ECN)?,
            FRAME_TYPE_RESET_STREAM => Frame::ResetStream(ResetStreamFrame {
                stream_id: self.varint()?,
                error_code: self.varint()?,
                final_size: self.varint()?,
            }),
            FRAME_TYPE_STOP_SENDING => Frame::StopSending(StopSendingFrame {
                stream_id: self.varint()?,
                error_code: self.varint()?,
            }),
            FRAME_TYPE_CRYPTO => {
                let offset = self.varint()?;
                let length = self.varint()?;
                Frame::Crypto(CryptoFrame {
                    offset,
                    data: self.take(length)?,
                })
            }
            FRAME_TYPE_NEW_TOKEN => {
                let length = self.varint()?;
                if length == 0 {
                    // An empty token is a FRAME_ENCODING_ERROR (19.7)
                    return Err(Error::FrameEncodingError);
                }
                Frame::NewToken(NewTokenFrame {
                    token: self.take(length)?,
                })
            }
            0x08..=0x0f => self.parse_stream(ty)?,
            FRAME_TYPE_MAX_DATA => Frame::MaxData(MaxDataFrame {
                max_data: self.varint()?,
            }),
            FRAME_TYPE_MAX_STREAM_DATA => Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: self.varint()?,
                limit: self.varint()?,
            }),
            FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
                Frame::MaxStreams(MaxStreamsFrame {
                    limit: self.varint()?,
                    bidi: ty == FRAME_TYPE_MAX_STREAMS_BIDI,
                })
            }
            FRAME_TYPE_DATA_BLOCKED => Frame::DataBlocked(DataBlockedFrame {
                limit: self.varint()?,
            }),
            FRAME_TYPE_STREAM_DATA_BLOCKED => Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id: self.varint()?,
                limit: self.varint()?,
            }),
            FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
                Frame::StreamsBlocked(StreamsBlockedFrame {
                    limit: self.varint()?,
                    bidi: ty == FRAME_TYPE_STREAMS_BLOCKED_BIDI,
                })
            }
            FRAME_TYPE_NEW_CONNECTION_ID => self.parse_new_connection_id()?,
            FRAME_TYPE_RETIRE_CONNECTION_ID => Frame::RetireConnectionId(RetireConnectionIdFrame {
                seqnum: self.varint()?,
            }),
            FRAME_TYPE_PATH_CHALLENGE => Frame::PathChallenge(self.take_array()?),
            FRAME_TYPE_PATH_RESPONSE => Frame::PathResponse(self.take_array()?),
            FRAME_TYPE_CONNECTION_CLOSE_QUIC | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                let app = ty == FRAME_TYPE_CONNECTION_CLOSE_APP;
                let error_code = self.varint()?;
                let frame_type = if app { 0 } else { self.varint()? };
                let reason_len = self.varint()?;
                Frame::ConnectionClose(ConnectionCloseFrame {
                    error_code,
                    frame_type,
                    reason: self.take(reason_len)?,
                    app,
                })
            }
            FRAME_TYPE_HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => return Err(Error::FrameEncodingError),
        };

        Ok(Some(frame))
    }

    fn parse_ack(&mut self, ecn: bool) -> Result<Frame> {
        let largest = self.varint()?;
        let delay = self.varint()?;
        let range_count = self.varint()?;
        let first_range = self.varint()?;

        if first_range > largest {
            // would acknowledge a negative packet number (19.3.1)
            return Err(Error::FrameEncodingError);
        }

        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        let mut smallest = largest - first_range;

        for _ in 0..range_count {
            let gap = self.varint()?;
            let range = self.varint()?;

            if gap + 2 > smallest {
                return Err(Error::FrameEncodingError);
            }
            let next_largest = smallest - gap - 2;
            if range > next_largest {
                return Err(Error::FrameEncodingError);
            }
            smallest = next_largest - range;

            ranges.push(AckRange { gap, range });
        }

        let ecn = if ecn {
            Some(EcnCounts {
                ect0: self.varint()?,
                ect1: self.varint()?,
                ce: self.varint()?,
            })
        } else {
            None
        };

        Ok(Frame::Ack(AckFrame {
            largest,
            delay,
            first_range,
            ranges,
            ecn,
        }))
    }

    fn parse_stream(&mut self, ty: u8) -> Result<Frame> {
        let stream_id = self.varint()?;

        let offset = if ty & STREAM_FRAME_BIT_OFF != 0 {
            self.varint()?
        } else {
            0
        };

        let data = if ty & STREAM_FRAME_BIT_LEN != 0 {
            let length = self.varint()?;
            self.take(length)?
        } else {
            // no length field: data extends to the end of the packet
            self.buf.split_off(0)
        };

        if offset + data.len() as u64 > crate::types::VARINT_MAX {
            return Err(Error::FrameEncodingError);
        }

        Ok(Frame::Stream(StreamFrame {
            stream_id,
            offset,
            fin: ty & STREAM_FRAME_BIT_FIN != 0,
            data,
        }))
    }

    fn parse_new_connection_id(&mut self) -> Result<Frame> {
        let seqnum = self.varint()?;
        let retire_prior_to = self.varint()?;

        if retire_prior_to > seqnum {
            return Err(Error::FrameEncodingError);
        }

        if !self.buf.has_remaining() {
            return Err(Error::FrameEncodingError);
        }
        let len = self.buf.get_u8() as u64;
        if len == 0 || len > crate::types::MAX_CID_LENGTH as u64 {
            return Err(Error::FrameEncodingError);
        }
        let cid = self.take(len)?;

        let sr_token: [u8; 16] = self.take_array()?;

        Ok(Frame::NewConnectionId(NewConnectionIdFrame {
            seqnum,
            retire_prior_to,
            cid,
            sr_token,
        }))
    }

    fn varint(&mut self) -> Result<VarInt> {
        VarIntCodec::decode(&mut self.buf).ok_or(Error::FrameEncodingError)
    }

    fn take(&mut self, len: u64) -> Result<Bytes> {
        if self.buf.remaining() < len as usize {
            return Err(Error::FrameEncodingError);
        }
        Ok(self.buf.split_to(len as usize))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.buf.remaining() < N {
            return Err(Error::FrameEncodingError);
        }
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        assert_eq!(buf.len(), frame.wire_len(), "wire_len mismatch");

        let mut parser = FrameParser::new(buf.freeze());
        let out = parser.next_frame().unwrap().unwrap();
        assert!(parser.next_frame().unwrap().is_none());
        out
    }

    #[test]
    fn test_ping_roundtrip() {
        assert!(matches!(roundtrip(&Frame::Ping), Frame::Ping));
    }

    #[test]
    fn test_ack_roundtrip() {
        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        ranges.push(AckRange { gap: 1, range: 3 });
        ranges.push(AckRange { gap: 0, range: 0 });

        let frame = Frame::Ack(AckFrame {
            largest: 1000,
            delay: 8,
            first_range: 5,
            ranges: ranges.clone(),
            ecn: None,
        });

        match roundtrip(&frame) {
            Frame::Ack(a) => {
                assert_eq!(a.largest, 1000);
                assert_eq!(a.delay, 8);
                assert_eq!(a.first_range, 5);
                assert_eq!(a.ranges.as_slice(), ranges.as_slice());
                assert!(a.ecn.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ack_ecn_roundtrip() {
        let frame = Frame::Ack(AckFrame {
            largest: 7,
            delay: 0,
            first_range: 0,
            ranges: TinyVec::new(),
            ecn: Some(EcnCounts {
                ect0: 1,
                ect1: 2,
                ce: 3,
            }),
        });

        match roundtrip(&frame) {
            Frame::Ack(a) => assert_eq!(
                a.ecn,
                Some(EcnCounts {
                    ect0: 1,
                    ect1: 2,
                    ce: 3
                })
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ack_negative_range_rejected() {
        // first_range > largest would acknowledge pn < 0
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_TYPE_ACK);
        crate::types::VarIntCodec::encode(1, &mut buf); // largest
        crate::types::VarIntCodec::encode(0, &mut buf); // delay
        crate::types::VarIntCodec::encode(0, &mut buf); // range count
        crate::types::VarIntCodec::encode(2, &mut buf); // first range

        let mut parser = FrameParser::new(buf.freeze());
        assert!(matches!(parser.next_frame(), Err(Error::FrameEncodingError)));
    }

    #[test]
    fn test_stream_roundtrip() {
        let frame = Frame::Stream(StreamFrame {
            stream_id: 4,
            offset: 1234,
            fin: true,
            data: Bytes::from_static(b"hello quic"),
        });

        match roundtrip(&frame) {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, 4);
                assert_eq!(s.offset, 1234);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"hello quic");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_stream_without_length_extends_to_end() {
        // type 0x08: no OFF, no LEN, no FIN
        let mut buf = BytesMut::new();
        buf.put_u8(0x08);
        crate::types::VarIntCodec::encode(0, &mut buf);
        buf.extend_from_slice(b"tail data");

        let mut parser = FrameParser::new(buf.freeze());
        match parser.next_frame().unwrap().unwrap() {
            Frame::Stream(s) => {
                assert_eq!(s.offset, 0);
                assert_eq!(&s.data[..], b"tail data");
                assert!(!s.fin);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_crypto_roundtrip() {
        let frame = Frame::Crypto(CryptoFrame {
            offset: 30,
            data: Bytes::from_static(&[0xab; 20]),
        });

        match roundtrip(&frame) {
            Frame::Crypto(c) => {
                assert_eq!(c.offset, 30);
                assert_eq!(c.data.len(), 20);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reset_stop_roundtrip() {
        match roundtrip(&Frame::ResetStream(ResetStreamFrame {
            stream_id: 8,
            error_code: 0x107,
            final_size: 4096,
        })) {
            Frame::ResetStream(f) => {
                assert_eq!(f.stream_id, 8);
                assert_eq!(f.error_code, 0x107);
                assert_eq!(f.final_size, 4096);
            }
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::StopSending(StopSendingFrame {
            stream_id: 3,
            error_code: 0x100,
        })) {
            Frame::StopSending(f) => {
                assert_eq!(f.stream_id, 3);
                assert_eq!(f.error_code, 0x100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_limits_roundtrip() {
        match roundtrip(&Frame::MaxData(MaxDataFrame { max_data: 1 << 20 })) {
            Frame::MaxData(f) => assert_eq!(f.max_data, 1 << 20),
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::MaxStreamData(MaxStreamDataFrame {
            stream_id: 0,
            limit: 65536,
        })) {
            Frame::MaxStreamData(f) => assert_eq!(f.limit, 65536),
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::MaxStreams(MaxStreamsFrame {
            limit: 128,
            bidi: false,
        })) {
            Frame::MaxStreams(f) => {
                assert_eq!(f.limit, 128);
                assert!(!f.bidi);
            }
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::StreamsBlocked(StreamsBlockedFrame {
            limit: 16,
            bidi: true,
        })) {
            Frame::StreamsBlocked(f) => {
                assert_eq!(f.limit, 16);
                assert!(f.bidi);
            }
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::StreamDataBlocked(StreamDataBlockedFrame {
            stream_id: 4,
            limit: 100,
        })) {
            Frame::StreamDataBlocked(f) => assert_eq!(f.limit, 100),
            other => panic!("unexpected {other:?}"),
        }

        match roundtrip(&Frame::DataBlocked(DataBlockedFrame { limit: 9000 })) {
            Frame::DataBlocked(f) => assert_eq!(f.limit, 9000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_connection_id_roundtrip() {
        let frame = Frame::NewConnectionId(NewConnectionIdFrame {
            seqnum: 3,
            retire_prior_to: 1,
            cid: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            sr_token: [0x5a; 16],
        });

        match roundtrip(&frame) {
            Frame::NewConnectionId(f) => {
                assert_eq!(f.seqnum, 3);
                assert_eq!(f.retire_prior_to, 1);
                assert_eq!(f.cid.len(), 8);
                assert_eq!(f.sr_token, [0x5a; 16]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_connection_id_retire_above_seq_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_TYPE_NEW_CONNECTION_ID);
        crate::types::VarIntCodec::encode(1, &mut buf); // seq
        crate::types::VarIntCodec::encode(2, &mut buf); // retire_prior_to > seq
        buf.put_u8(4);
        buf.extend_from_slice(&[0; 4 + 16]);

        let mut parser = FrameParser::new(buf.freeze());
        assert!(matches!(parser.next_frame(), Err(Error::FrameEncodingError)));
    }

    #[test]
    fn test_path_frames_roundtrip() {
        let data = [9u8, 8, 7, 6, 5, 4, 3, 2];
        match roundtrip(&Frame::PathChallenge(data)) {
            Frame::PathChallenge(d) => assert_eq!(d, data),
            other => panic!("unexpected {other:?}"),
        }
        match roundtrip(&Frame::PathResponse(data)) {
            Frame::PathResponse(d) => assert_eq!(d, data),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_connection_close_roundtrip() {
        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0a,
            frame_type: 0x06,
            reason: Bytes::from_static(b"crypto gone wrong"),
            app: false,
        });

        match roundtrip(&frame) {
            Frame::ConnectionClose(f) => {
                assert_eq!(f.error_code, 0x0a);
                assert_eq!(f.frame_type, 0x06);
                assert_eq!(&f.reason[..], b"crypto gone wrong");
                assert!(!f.app);
            }
            other => panic!("unexpected {other:?}"),
        }

        let frame = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0100,
            frame_type: 0,
            reason: Bytes::new(),
            app: true,
        });

        match roundtrip(&frame) {
            Frame::ConnectionClose(f) => {
                assert_eq!(f.error_code, 0x0100);
                assert!(f.app);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_token_handshake_done_roundtrip() {
        match roundtrip(&Frame::NewToken(NewTokenFrame {
            token: Bytes::from_static(&[1; 44]),
        })) {
            Frame::NewToken(f) => assert_eq!(f.token.len(), 44),
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(roundtrip(&Frame::HandshakeDone), Frame::HandshakeDone));
    }

    #[test]
    fn test_empty_new_token_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_TYPE_NEW_TOKEN);
        crate::types::VarIntCodec::encode(0, &mut buf);

        let mut parser = FrameParser::new(buf.freeze());
        assert!(matches!(parser.next_frame(), Err(Error::FrameEncodingError)));
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut parser = FrameParser::new(Bytes::from_static(&[0x42]));
        assert!(matches!(parser.next_frame(), Err(Error::FrameEncodingError)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(FRAME_TYPE_CRYPTO);
        crate::types::VarIntCodec::encode(0, &mut buf);
        crate::types::VarIntCodec::encode(100, &mut buf); // claims 100 bytes
        buf.extend_from_slice(&[0; 10]); // only 10 present

        let mut parser = FrameParser::new(buf.freeze());
        assert!(matches!(parser.next_frame(), Err(Error::FrameEncodingError)));
    }

    #[test]
    fn test_padding_run() {
        let mut parser = FrameParser::new(Bytes::from_static(&[0, 0, 0, 1]));
        assert!(matches!(parser.next_frame().unwrap(), Some(Frame::Padding)));
        assert!(matches!(parser.next_frame().unwrap(), Some(Frame::Padding)));
        assert!(matches!(parser.next_frame().unwrap(), Some(Frame::Padding)));
        assert!(matches!(parser.next_frame().unwrap(), Some(Frame::Ping)));
        assert!(parser.next_frame().unwrap().is_none());
    }
}
