//! Packet headers, packet numbers, and per-space send state
//! (RFC 9000 Sections 12, 17).

mod header;
mod number;
mod space;

pub use header::{
    apply_protection, build_long_header, build_retry, build_short_header,
    build_version_negotiation, long_header_len, remove_protection, Header, PacketType,
    FIXED_BIT, KEY_PHASE_BIT, LONG_BIT,
};
pub use number::{decode_packet_number, encode_packet_number};
pub use space::{AckHandling, FrameRecord, SendCtx, MAX_RANGES};
