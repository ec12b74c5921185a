//! QUIC frame types (RFC 9000 Section 19).
//!
//! Frames own their payload bytes (`bytes::Bytes`) so that queued and
//! retransmitted frames carry their data without re-borrowing packet
//! buffers.

mod encode;
mod parse;
mod types;

pub use parse::FrameParser;
pub use types::*;
