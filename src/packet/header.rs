//! Long and short packet headers (RFC 9000 Section 17, RFC 8999).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{retry_integrity_tag, DirectionalKeys, EncryptionLevel};
use crate::error::{Error, Result};
use crate::types::{ConnectionId, PacketNumber, VarIntCodec, MAX_CID_LENGTH};

use super::number::decode_packet_number;

pub const LONG_BIT: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const KEY_PHASE_BIT: u8 = 0x04;

const LONG_TYPE_MASK: u8 = 0x30;
const LONG_TYPE_INITIAL: u8 = 0x00;
const LONG_TYPE_ZERO_RTT: u8 = 0x10;
const LONG_TYPE_HANDSHAKE: u8 = 0x20;
const LONG_TYPE_RETRY: u8 = 0x30;

/// Wire packet types a server can see or emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    Short,
}

impl PacketType {
    pub fn level(self) -> EncryptionLevel {
        match self {
            PacketType::Initial => EncryptionLevel::Initial,
            PacketType::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketType::Handshake => EncryptionLevel::Handshake,
            PacketType::Retry | PacketType::Short => EncryptionLevel::Application,
        }
    }
}

/// A parsed (still header-protected) packet within a datagram.
#[derive(Debug)]
pub struct Header {
    pub ty: PacketType,

    /// Version field of long headers; 0 for short headers.
    pub version: u32,

    pub dcid: ConnectionId,

    /// Source CID of long headers; empty for short headers.
    pub scid: ConnectionId,

    /// Initial token, empty unless an Initial carried one.
    pub token: Bytes,

    /// Offset of the packet number field within `packet`.
    pub pn_offset: usize,

    /// The complete packet (header + protected payload).
    pub packet: Bytes,
}

impl Header {
    pub fn level(&self) -> EncryptionLevel {
        self.ty.level()
    }

    /// Parse one packet starting at the beginning of `data`.
    ///
    /// For long headers the Length field delimits the packet inside a
    /// coalesced datagram; a short header always consumes the rest.
    /// `server_cid_len` is the length of CIDs this server issues, needed
    /// to delimit short-header DCIDs (RFC 8999 Section 5.2).
    pub fn parse(data: Bytes, server_cid_len: usize) -> Result<Header> {
        let mut buf = data.clone();

        if !buf.has_remaining() {
            return Err(Error::FrameEncodingError);
        }

        let first = buf.get_u8();

        if first & LONG_BIT == 0 {
            // Short header. The fixed bit must be set, but a failed check
            // is handled by the caller as a stateless-reset candidate.
            if buf.remaining() < server_cid_len {
                return Err(Error::FrameEncodingError);
            }
            let dcid = ConnectionId::from_slice(&buf.chunk()[..server_cid_len])
                .ok_or(Error::FrameEncodingError)?;
            buf.advance(server_cid_len);

            return Ok(Header {
                ty: PacketType::Short,
                version: 0,
                dcid,
                scid: ConnectionId::empty(),
                token: Bytes::new(),
                pn_offset: 1 + server_cid_len,
                packet: data,
            });
        }

        if buf.remaining() < 4 {
            return Err(Error::FrameEncodingError);
        }
        let version = buf.get_u32();

        let dcid = Self::parse_cid(&mut buf)?;
        let scid = Self::parse_cid(&mut buf)?;

        let ty = match first & LONG_TYPE_MASK {
            LONG_TYPE_INITIAL => PacketType::Initial,
            LONG_TYPE_ZERO_RTT => PacketType::ZeroRtt,
            LONG_TYPE_HANDSHAKE => PacketType::Handshake,
            LONG_TYPE_RETRY => PacketType::Retry,
            _ => unreachable!(),
        };

        let token = if ty == PacketType::Initial {
            let token_len =
                VarIntCodec::decode(&mut buf).ok_or(Error::FrameEncodingError)?;
            if buf.remaining() < token_len as usize {
                return Err(Error::FrameEncodingError);
            }
            buf.copy_to_bytes(token_len as usize)
        } else {
            Bytes::new()
        };

        // Retry carries no Length or packet number; the server never
        // receives one, parsing stops at the caller.
        let length = VarIntCodec::decode(&mut buf).ok_or(Error::FrameEncodingError)?;

        let pn_offset = data.len() - buf.remaining();
        let total = pn_offset + length as usize;

        if total > data.len() || length < 1 {
            return Err(Error::FrameEncodingError);
        }

        Ok(Header {
            ty,
            version,
            dcid,
            scid,
            token,
            pn_offset,
            packet: data.slice(..total),
        })
    }

    fn parse_cid<B: Buf>(buf: &mut B) -> Result<ConnectionId> {
        if !buf.has_remaining() {
            return Err(Error::FrameEncodingError);
        }
        let len = buf.get_u8() as usize;
        if len > MAX_CID_LENGTH || buf.remaining() < len {
            return Err(Error::FrameEncodingError);
        }
        let cid =
            ConnectionId::from_slice(&buf.chunk()[..len]).ok_or(Error::FrameEncodingError)?;
        buf.advance(len);
        Ok(cid)
    }

    /// Whether the fixed bit survived header parsing; packets without it
    /// are not QUIC v1 packets (candidate stateless resets).
    pub fn fixed_bit(&self) -> bool {
        self.packet[0] & FIXED_BIT != 0
    }
}

/// Remove header protection in place and decode the packet number
/// (RFC 9001 Section 5.4).
///
/// Returns `(packet_number, pn_length, key_phase)`; the key phase is only
/// meaningful for short headers.
pub fn remove_protection(
    keys: &DirectionalKeys,
    packet: &mut [u8],
    pn_offset: usize,
    largest_pn: PacketNumber,
) -> Result<(PacketNumber, usize, bool)> {
    // sample starts 4 bytes past the packet number field start
    let sample_off = pn_offset + 4;
    if sample_off + 16 > packet.len() {
        return Err(Error::FrameEncodingError);
    }

    let mut sample = [0u8; 16];
    sample.copy_from_slice(&packet[sample_off..sample_off + 16]);
    let mask = keys.hp_mask(&sample)?;

    let long = packet[0] & LONG_BIT != 0;
    if long {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }

    let pn_len = (packet[0] & 0x03) as usize + 1;
    if pn_offset + pn_len > packet.len() {
        return Err(Error::FrameEncodingError);
    }

    let mut truncated: u32 = 0;
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
        truncated = (truncated << 8) | packet[pn_offset + i] as u32;
    }

    let pn = decode_packet_number(largest_pn, truncated, pn_len);
    let key_phase = packet[0] & KEY_PHASE_BIT != 0;

    Ok((pn, pn_len, key_phase))
}

/// Apply header protection in place over a sealed packet.
pub fn apply_protection(
    keys: &DirectionalKeys,
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
) -> Result<()> {
    let sample_off = pn_offset + 4;
    if sample_off + 16 > packet.len() {
        return Err(Error::InternalError);
    }

    let mut sample = [0u8; 16];
    sample.copy_from_slice(&packet[sample_off..sample_off + 16]);
    let mask = keys.hp_mask(&sample)?;

    if packet[0] & LONG_BIT != 0 {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }
    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }

    Ok(())
}

/// Write a long header for an outgoing Initial or Handshake packet.
///
/// `payload_len` must already include the packet number and AEAD tag.
/// Returns the packet-number offset.
pub fn build_long_header(
    buf: &mut BytesMut,
    ty: PacketType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    payload_len: usize,
    pn_len: usize,
) -> usize {
    let type_bits = match ty {
        PacketType::Initial => LONG_TYPE_INITIAL,
        PacketType::ZeroRtt => LONG_TYPE_ZERO_RTT,
        PacketType::Handshake => LONG_TYPE_HANDSHAKE,
        PacketType::Retry => LONG_TYPE_RETRY,
        PacketType::Short => unreachable!("short header via build_short_header"),
    };

    buf.put_u8(LONG_BIT | FIXED_BIT | type_bits | (pn_len as u8 - 1));
    buf.put_u32(version);
    buf.put_u8(dcid.len() as u8);
    buf.extend_from_slice(dcid.as_bytes());
    buf.put_u8(scid.len() as u8);
    buf.extend_from_slice(scid.as_bytes());

    if ty == PacketType::Initial {
        // server Initials never carry a token
        VarIntCodec::encode(0, buf);
    }

    VarIntCodec::encode(payload_len as u64, buf);
    buf.len()
}

/// Write a short (1-RTT) header. Returns the packet-number offset.
pub fn build_short_header(
    buf: &mut BytesMut,
    dcid: &ConnectionId,
    key_phase: bool,
    pn_len: usize,
) -> usize {
    let mut first = FIXED_BIT | (pn_len as u8 - 1);
    if key_phase {
        first |= KEY_PHASE_BIT;
    }
    buf.put_u8(first);
    buf.extend_from_slice(dcid.as_bytes());
    buf.len()
}

/// Serialized long-header size before the packet number, used by the
/// packetizer for payload budgeting.
pub fn long_header_len(ty: PacketType, dcid: &ConnectionId, scid: &ConnectionId) -> usize {
    let mut len = 1 + 4 + 1 + dcid.len() + 1 + scid.len();
    if ty == PacketType::Initial {
        len += 1; // empty token length
    }
    len + 2 // 2-byte length field covers any payload we produce
}

/// Build a complete Retry packet (RFC 9000 Section 17.2.5), integrity
/// tagged per RFC 9001 Section 5.8.
pub fn build_retry(
    version: u32,
    odcid: &ConnectionId,
    client_scid: &ConnectionId,
    new_scid: &ConnectionId,
    token: &[u8],
) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(64 + token.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid.as_bytes());

    pseudo.push(LONG_BIT | FIXED_BIT | LONG_TYPE_RETRY);
    pseudo.extend_from_slice(&version.to_be_bytes());
    pseudo.push(client_scid.len() as u8);
    pseudo.extend_from_slice(client_scid.as_bytes());
    pseudo.push(new_scid.len() as u8);
    pseudo.extend_from_slice(new_scid.as_bytes());
    pseudo.extend_from_slice(token);

    let tag = retry_integrity_tag(&pseudo);

    let mut packet = pseudo.split_off(1 + odcid.len());
    packet.extend_from_slice(&tag);
    packet
}

/// Build a Version Negotiation packet echoing the client's CIDs
/// (RFC 9000 Section 17.2.1).
pub fn build_version_negotiation(
    client_dcid: &ConnectionId,
    client_scid: &ConnectionId,
    supported: &[u32],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16 + client_dcid.len() + client_scid.len());

    // the version-negotiation first byte only needs the long-header bit;
    // the rest is unused and left unpredictable is fine but fixed is what
    // everyone emits
    packet.push(LONG_BIT | FIXED_BIT);
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.push(client_scid.len() as u8);
    packet.extend_from_slice(client_scid.as_bytes());
    packet.push(client_dcid.len() as u8);
    packet.extend_from_slice(client_dcid.as_bytes());

    for version in supported {
        packet.extend_from_slice(&version.to_be_bytes());
    }

    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_initial_keys;

    const DCID: [u8; 8] = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

    #[test]
    fn test_parse_long_header() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xc3); // Initial, pn_len bits (protected)
        buf.put_u32(1);
        buf.put_u8(8);
        buf.extend_from_slice(&DCID);
        buf.put_u8(4);
        buf.extend_from_slice(&[1, 2, 3, 4]);
        VarIntCodec::encode(5, &mut buf); // token len
        buf.extend_from_slice(b"token");
        VarIntCodec::encode(20, &mut buf); // length
        buf.extend_from_slice(&[0u8; 20]);

        let header = Header::parse(buf.freeze(), 16).unwrap();
        assert_eq!(header.ty, PacketType::Initial);
        assert_eq!(header.version, 1);
        assert_eq!(header.dcid.as_bytes(), &DCID);
        assert_eq!(header.scid.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(&header.token[..], b"token");
        assert_eq!(header.packet.len(), header.pn_offset + 20);
    }

    #[test]
    fn test_parse_coalesced_length_delimits() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xe0); // Handshake
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(0);
        VarIntCodec::encode(10, &mut buf);
        buf.extend_from_slice(&[0u8; 10]);
        buf.extend_from_slice(&[0xff; 7]); // next coalesced packet

        let data = buf.freeze();
        let header = Header::parse(data.clone(), 16).unwrap();
        assert_eq!(header.ty, PacketType::Handshake);
        assert_eq!(header.packet.len(), data.len() - 7);
    }

    #[test]
    fn test_parse_short_header() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x41);
        buf.extend_from_slice(&[9u8; 16]);
        buf.extend_from_slice(&[0u8; 30]);

        let header = Header::parse(buf.freeze(), 16).unwrap();
        assert_eq!(header.ty, PacketType::Short);
        assert_eq!(header.dcid.len(), 16);
        assert_eq!(header.pn_offset, 17);
        assert!(header.fixed_bit());
    }

    #[test]
    fn test_parse_truncated_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xc0);
        buf.put_u16(0); // truncated version
        assert!(Header::parse(buf.freeze(), 16).is_err());

        // claims 100 payload bytes, has 3
        let mut buf = BytesMut::new();
        buf.put_u8(0xe0);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(0);
        VarIntCodec::encode(100, &mut buf);
        buf.extend_from_slice(&[0u8; 3]);
        assert!(Header::parse(buf.freeze(), 16).is_err());
    }

    #[test]
    fn test_protection_roundtrip() {
        let (client, _server) = derive_initial_keys(&DCID);

        // build an unprotected packet: header + pn(2) + payload + tag space
        let mut buf = BytesMut::new();
        buf.put_u8(0xc1); // Initial, pn_len=2
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(0);
        VarIntCodec::encode(0, &mut buf); // token
        VarIntCodec::encode(2 + 20, &mut buf);
        let pn_offset = buf.len();
        buf.put_u16(0x001d); // pn = 29
        buf.extend_from_slice(&[0xaa; 20]);

        let mut packet = buf.to_vec();
        apply_protection(&client, &mut packet, pn_offset, 2).unwrap();

        let (pn, pn_len, _) =
            remove_protection(&client, &mut packet, pn_offset, 28).unwrap();
        assert_eq!(pn, 29);
        assert_eq!(pn_len, 2);
        assert_eq!(packet[..], buf[..]);
    }

    #[test]
    fn test_retry_packet_shape() {
        let odcid = ConnectionId::from_slice(&DCID).unwrap();
        let client_scid = ConnectionId::from_slice(&[1, 2, 3, 4]).unwrap();
        let new_scid = ConnectionId::from_slice(&[5; 16]).unwrap();

        let packet = build_retry(1, &odcid, &client_scid, &new_scid, b"tok");

        assert_eq!(packet[0] & (LONG_BIT | LONG_TYPE_MASK), LONG_BIT | LONG_TYPE_RETRY);
        assert_eq!(&packet[1..5], &1u32.to_be_bytes());
        // dcid = client scid
        assert_eq!(packet[5] as usize, client_scid.len());
        // token + 16-byte integrity tag at the tail
        assert_eq!(
            packet.len(),
            1 + 4 + 1 + client_scid.len() + 1 + new_scid.len() + 3 + 16
        );
    }

    #[test]
    fn test_version_negotiation_shape() {
        let dcid = ConnectionId::from_slice(&DCID).unwrap();
        let scid = ConnectionId::from_slice(&[7; 4]).unwrap();

        let packet = build_version_negotiation(&dcid, &scid, &[1]);

        assert!(packet[0] & LONG_BIT != 0);
        assert_eq!(&packet[1..5], &[0, 0, 0, 0]);
        // trailing supported version list
        assert_eq!(&packet[packet.len() - 4..], &1u32.to_be_bytes());
    }
}
