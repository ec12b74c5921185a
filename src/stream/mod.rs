//! Stream multiplexing: reassembly, receive rings, id accounting and
//! flow control (RFC 9000 Sections 2-4).

mod buffer;
mod manager;
mod ordered;
mod stream;

pub use buffer::RingBuffer;
pub use manager::{OpenOutcome, Streams};
pub use ordered::{Ordered, OrderedStream};
pub use stream::Stream;
