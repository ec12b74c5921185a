//! Ordered byte-stream reassembly, shared by CRYPTO streams and
//! application streams (RFC 9000 Sections 2.2, 7.5).
//!
//! In-order data is delivered straight to the consumer callback;
//! out-of-order segments are buffered in an offset-sorted list and
//! drained as the contiguous edge advances.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::Result;

#[derive(Debug)]
struct Segment {
    offset: u64,
    data: Bytes,
    fin: bool,
}

/// How an incoming segment was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordered {
    /// Delivered (possibly with buffered successors).
    Delivered,

    /// Start offset is in the future; buffered.
    Buffered,

    /// Entirely old data; dropped.
    Duplicate,
}

/// Reassembly state for one ordered stream.
#[derive(Debug, Default)]
pub struct OrderedStream {
    /// Highest contiguous offset delivered to the consumer.
    pub received: u64,

    /// Bytes sent on the mirror (outgoing) direction; CRYPTO streams use
    /// this for outgoing frame offsets.
    pub sent: u64,

    /// Bytes currently buffered out of order.
    pub total: u64,

    segments: VecDeque<Segment>,
}

impl OrderedStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an incoming segment.
    ///
    /// `deliver` receives `(data, fin)` for each contiguous piece, in
    /// order. A delivery error aborts the drain and propagates.
    pub fn handle<F>(&mut self, offset: u64, data: Bytes, fin: bool, mut deliver: F) -> Result<Ordered>
    where
        F: FnMut(Bytes, bool) -> Result<()>,
    {
        if offset > self.received {
            self.buffer(offset, data, fin);
            return Ok(Ordered::Buffered);
        }

        let (data, fin) = if offset < self.received {
            match Self::trim(self.received, offset, data) {
                Some(data) => (data, fin),
                None => return Ok(Ordered::Duplicate),
            }
        } else {
            (data, fin)
        };

        deliver(data.clone(), fin)?;
        self.received += data.len() as u64;

        // continue with buffered segments that became contiguous
        while let Some(head) = self.segments.front() {
            if head.offset > self.received {
                break;
            }

            let seg = self.segments.pop_front().expect("checked front");
            let full_len = seg.data.len() as u64;

            let data = if seg.offset < self.received {
                match Self::trim(self.received, seg.offset, seg.data) {
                    Some(data) => data,
                    None => {
                        self.total -= full_len;
                        continue;
                    }
                }
            } else {
                seg.data
            };

            deliver(data.clone(), seg.fin)?;
            self.received += data.len() as u64;
            self.total -= full_len;
        }

        Ok(Ordered::Delivered)
    }

    /// Drop the part of a segment that was already delivered. Returns
    /// `None` when nothing remains.
    fn trim(received: u64, offset: u64, data: Bytes) -> Option<Bytes> {
        let tail = (received - offset) as usize;
        if tail >= data.len() {
            return None;
        }
        Some(data.slice(tail..))
    }

    fn buffer(&mut self, offset: u64, data: Bytes, fin: bool) {
        self.total += data.len() as u64;

        let seg = Segment { offset, data, fin };

        // insert keeping ascending offsets, scanning from the tail as
        // arrivals are mostly in order
        let mut at = 0;
        for (i, item) in self.segments.iter().enumerate().rev() {
            if item.offset < seg.offset {
                at = i + 1;
                break;
            }
        }
        self.segments.insert(at, seg);
    }

    /// Whether the given segment would exceed the out-of-order buffering
    /// cap once admitted.
    pub fn exceeds_buffered(&self, offset: u64, len: u64, cap: u64) -> bool {
        let last = offset + len;
        last > self.received && last - self.received > cap
    }
}
