//! Per-packet-number-space send context and received-packet ACK tracker
//! (RFC 9000 Sections 12.3, 13.2).
//!
//! Received packet numbers are tracked as a bounded array of
//! (gap, range) pairs in largest-first order, exactly the shape an ACK
//! frame carries. The array never reallocates; when it is full the
//! current accumulation is flushed as an ACK and the oldest range is
//! evicted.

use std::collections::VecDeque;
use std::time::Instant;

use tinyvec::TinyVec;

use crate::crypto::EncryptionLevel;
use crate::frames::{AckFrame, AckRange, Frame};
use crate::types::{PacketNumber, MAX_ACK_GAP, UNSET_PN};

/// Most (gap, range) pairs retained per space; the oldest is dropped
/// beyond this.
pub const MAX_RANGES: usize = 32;

/// A frame that has been packetized and awaits acknowledgment.
#[derive(Debug)]
pub struct FrameRecord {
    pub frame: Frame,

    /// Packet number the frame was sent in.
    pub pnum: PacketNumber,

    /// Send time of that packet.
    pub last: Instant,

    /// When the frame was first committed to a packet; retransmissions
    /// keep the original time for congestion-recovery attribution.
    pub first: Instant,

    /// Bytes this packet contributed to `in_flight`; set on the first
    /// frame of each packet, 0 on the rest.
    pub plen: usize,
}

/// What `ack_packet` decided about acknowledging the packet.
#[derive(Debug, PartialEq, Eq)]
pub enum AckHandling {
    /// Tracker updated; ACK emission follows the delay policy.
    Tracked,

    /// Packet was older than anything tracked; if it was ack-eliciting a
    /// one-shot ACK was produced.
    TooOld,
}

/// Send context for one packet number space.
pub struct SendCtx {
    pub level: EncryptionLevel,

    /// Next packet number to assign.
    pub pnum: PacketNumber,

    /// Largest packet number the peer has acknowledged.
    pub largest_ack: PacketNumber,

    /// Largest packet number received (for pn decoding).
    pub largest_pn: PacketNumber,

    /// Frames awaiting packetization.
    pub frames: VecDeque<Frame>,

    /// Packetized ack-eliciting frames awaiting acknowledgment,
    /// packet-number order.
    pub sent: VecDeque<FrameRecord>,

    // --- received-packet ACK tracker ---
    /// Head of the tracked set (largest received pn), UNSET_PN if empty.
    largest_range: PacketNumber,

    /// Receive time of `largest_range`, for the ACK delay field.
    pub largest_received: Option<Instant>,

    /// Length of the leading range (packets below `largest_range`).
    first_range: u64,

    ranges: [AckRange; MAX_RANGES],
    nranges: usize,

    /// Largest ack-eliciting pn not yet covered by a sent ACK.
    pending_ack: PacketNumber,

    /// When the current ACK accumulation started.
    pub ack_delay_start: Option<Instant>,

    /// Ack-eliciting packets received since the last ACK went out;
    /// reaching [`MAX_ACK_GAP`] forces emission.
    pub send_ack: u64,
}

impl SendCtx {
    pub fn new(level: EncryptionLevel) -> Self {
        Self {
            level,
            pnum: 0,
            largest_ack: UNSET_PN,
            largest_pn: UNSET_PN,
            frames: VecDeque::new(),
            sent: VecDeque::new(),
            largest_range: UNSET_PN,
            largest_received: None,
            first_range: 0,
            ranges: [AckRange::default(); MAX_RANGES],
            nranges: 0,
            pending_ack: UNSET_PN,
            ack_delay_start: None,
            send_ack: 0,
        }
    }

    /// Allocate the next packet number.
    pub fn next_pnum(&mut self) -> PacketNumber {
        let pn = self.pnum;
        self.pnum += 1;
        pn
    }

    pub fn largest_tracked(&self) -> PacketNumber {
        self.largest_range
    }

    pub fn range_count(&self) -> usize {
        self.nranges
    }

    /// Record receipt of packet `pn` and update the tracked range set.
    ///
    /// Immediate ACK frames forced by tracker overflow or too-old
    /// packets are pushed to `out`; the caller queues them.
    pub fn ack_packet(
        &mut self,
        pn: PacketNumber,
        now: Instant,
        need_ack: bool,
        ack_delay_exponent: u64,
        out: &mut Vec<Frame>,
    ) -> AckHandling {
        let prev_pending = self.pending_ack;

        if need_ack {
            if self.send_ack == 0 {
                self.ack_delay_start = Some(now);
            }
            self.send_ack += 1;

            if self.pending_ack == UNSET_PN || self.pending_ack < pn {
                self.pending_ack = pn;
            }
        }

        let base = self.largest_range;

        if base == UNSET_PN {
            self.largest_range = pn;
            self.largest_received = Some(now);
            return AckHandling::Tracked;
        }

        if base == pn {
            return AckHandling::Tracked;
        }

        let mut largest = base;
        let mut smallest = largest - self.first_range;

        if pn > base {
            if pn - base == 1 {
                self.first_range += 1;
                self.largest_range = pn;
                self.largest_received = Some(now);
                return AckHandling::Tracked;
            }

            // new gap in front of the current largest
            self.flush_if_full(prev_pending, need_ack, now, ack_delay_exponent, out);

            let gap = pn - base - 2;
            let range = self.first_range;

            self.first_range = 0;
            self.largest_range = pn;
            self.largest_received = Some(now);

            // out of order, force send
            if need_ack {
                self.send_ack = MAX_ACK_GAP;
            }

            self.insert_range(0, gap, range);
            return AckHandling::Tracked;
        }

        // pn < base: lookup in existing ranges; arrival is out of order
        if need_ack {
            self.send_ack = MAX_ACK_GAP;
        }

        if pn >= smallest && pn <= largest {
            return AckHandling::Tracked;
        }

        let mut i = 0;
        while i < self.nranges {
            let r = self.ranges[i];

            let ge = smallest - 1;
            let gs = ge - r.gap;

            if pn >= gs && pn <= ge {
                if gs == ge {
                    // gap of exactly one packet, now filled: merge the
                    // neighbouring ranges in place
                    if i == 0 {
                        self.first_range += r.range + 2;
                    } else {
                        self.ranges[i - 1].range += r.range + 2;
                    }

                    self.ranges.copy_within(i + 1..self.nranges, i);
                    self.nranges -= 1;
                } else if pn == gs {
                    // gap shrinks from the tail, current range grows
                    self.ranges[i].gap -= 1;
                    self.ranges[i].range += 1;
                } else if pn == ge {
                    // gap shrinks from the head, previous range grows
                    self.ranges[i].gap -= 1;

                    if i == 0 {
                        self.first_range += 1;
                    } else {
                        self.ranges[i - 1].range += 1;
                    }
                } else {
                    // gap splits in two
                    self.flush_if_full(prev_pending, need_ack, now, ack_delay_exponent, out);

                    self.ranges[i].gap = pn - gs - 1;
                    self.insert_range(i, ge - pn - 1, 0);
                }

                return AckHandling::Tracked;
            }

            largest = smallest - r.gap - 2;
            smallest = largest - r.range;

            if pn >= smallest && pn <= largest {
                // already known
                return AckHandling::Tracked;
            }

            i += 1;
        }

        if pn + 1 == smallest {
            // extends the first or the last range
            if self.nranges == 0 {
                self.first_range += 1;
            } else {
                self.ranges[self.nranges - 1].range += 1;
            }
            return AckHandling::Tracked;
        }

        if self.nranges == MAX_RANGES {
            // too old to keep
            if need_ack {
                out.push(Frame::Ack(AckFrame {
                    largest: pn,
                    delay: 0,
                    first_range: 0,
                    ranges: TinyVec::new(),
                    ecn: None,
                }));
            }
            return AckHandling::TooOld;
        }

        let i = self.nranges;
        self.insert_range(i, smallest - 2 - pn, 0);
        AckHandling::Tracked
    }

    fn insert_range(&mut self, i: usize, gap: u64, range: u64) {
        if self.nranges < MAX_RANGES {
            self.nranges += 1;
        }
        // shifting drops the oldest entry when full
        self.ranges.copy_within(i..self.nranges - 1, i + 1);
        self.ranges[i] = AckRange { gap, range };
    }

    fn flush_if_full(
        &mut self,
        prev_pending: PacketNumber,
        need_ack: bool,
        now: Instant,
        ack_delay_exponent: u64,
        out: &mut Vec<Frame>,
    ) {
        if self.nranges != MAX_RANGES {
            return;
        }

        if prev_pending != UNSET_PN {
            if let Some(frame) = self.make_ack(now, ack_delay_exponent) {
                out.push(frame);
            }
        }

        if prev_pending == self.pending_ack || !need_ack {
            self.pending_ack = UNSET_PN;
        }
    }

    /// Snapshot the tracked ranges as an ACK frame (RFC 9000 13.2.5: the
    /// delay field is only nonzero at the Application level).
    pub fn make_ack(&self, now: Instant, ack_delay_exponent: u64) -> Option<Frame> {
        if self.largest_range == UNSET_PN {
            return None;
        }

        let delay = match (self.level, self.largest_received) {
            (EncryptionLevel::Application, Some(received)) => {
                (now.saturating_duration_since(received).as_micros() as u64)
                    >> ack_delay_exponent
            }
            _ => 0,
        };

        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        ranges.extend_from_slice(&self.ranges[..self.nranges]);

        Some(Frame::Ack(AckFrame {
            largest: self.largest_range,
            delay,
            first_range: self.first_range,
            ranges,
            ecn: None,
        }))
    }

    /// The peer confirmed receipt of an ACK whose largest was `pn`; drop
    /// everything at or below it from the tracker
    /// (RFC 9000 Section 13.2.4).
    pub fn drop_ack_ranges(&mut self, pn: PacketNumber) {
        if self.largest_range == UNSET_PN {
            return;
        }

        if self.pending_ack != UNSET_PN && pn >= self.pending_ack {
            self.pending_ack = UNSET_PN;
        }

        let mut largest = self.largest_range;
        let mut smallest = largest - self.first_range;

        if pn >= largest {
            self.largest_range = UNSET_PN;
            self.first_range = 0;
            self.nranges = 0;
            return;
        }

        if pn >= smallest {
            self.first_range = largest - pn - 1;
            self.nranges = 0;
            return;
        }

        for i in 0..self.nranges {
            let r = self.ranges[i];

            largest = smallest - r.gap - 2;
            smallest = largest - r.range;

            if pn >= largest {
                self.nranges = i;
                return;
            }
            if pn >= smallest {
                self.ranges[i].range = largest - pn - 1;
                self.nranges = i + 1;
                return;
            }
        }
    }

    /// Collect every tracked packet number, largest-first. Test and
    /// debug aid; the hot path never materializes the set.
    #[cfg(test)]
    pub fn tracked_set(&self) -> Vec<PacketNumber> {
        let mut out = Vec::new();
        if self.largest_range == UNSET_PN {
            return out;
        }

        let mut largest = self.largest_range;
        let mut smallest = largest - self.first_range;
        for pn in (smallest..=largest).rev() {
            out.push(pn);
        }

        for r in &self.ranges[..self.nranges] {
            largest = smallest - r.gap - 2;
            smallest = largest - r.range;
            for pn in (smallest..=largest).rev() {
                out.push(pn);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SendCtx {
        SendCtx::new(EncryptionLevel::Application)
    }

    fn insert(ctx: &mut SendCtx, pns: &[u64]) -> Vec<Frame> {
        let now = Instant::now();
        let mut out = Vec::new();
        for &pn in pns {
            ctx.ack_packet(pn, now, true, 3, &mut out);
        }
        out
    }

    #[test]
    fn test_in_order_extends_first_range() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 2, 3]);
        assert_eq!(c.tracked_set(), vec![3, 2, 1, 0]);
        assert_eq!(c.range_count(), 0);
    }

    #[test]
    fn test_gap_creates_range() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 5]);
        assert_eq!(c.tracked_set(), vec![5, 1, 0]);
        assert_eq!(c.range_count(), 1);
        // out-of-order ack-eliciting arrival forces an immediate ACK
        assert!(c.send_ack >= MAX_ACK_GAP);
    }

    #[test]
    fn test_gap_fill_merges() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 3, 2]);
        assert_eq!(c.tracked_set(), vec![3, 2, 1, 0]);
        assert_eq!(c.range_count(), 0);
    }

    #[test]
    fn test_gap_trim_head_and_tail() {
        let mut c = ctx();
        insert(&mut c, &[0, 10]); // gap 1..=9
        insert(&mut c, &[9]); // trims head: joins leading range
        assert_eq!(c.tracked_set(), vec![10, 9, 0]);
        insert(&mut c, &[1]); // trims tail: joins trailing range
        assert_eq!(c.tracked_set(), vec![10, 9, 1, 0]);
    }

    #[test]
    fn test_gap_split() {
        let mut c = ctx();
        insert(&mut c, &[0, 10, 5]);
        assert_eq!(c.tracked_set(), vec![10, 5, 0]);
        assert_eq!(c.range_count(), 2);
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 5, 5, 1, 0]);
        assert_eq!(c.tracked_set(), vec![5, 1, 0]);
    }

    #[test]
    fn test_any_order_equals_union() {
        let pns = [7u64, 2, 9, 0, 4, 3, 12, 8, 1, 11];
        let mut c = ctx();
        insert(&mut c, &pns);

        let mut expected: Vec<u64> = pns.to_vec();
        expected.sort_unstable();
        expected.dedup();
        expected.reverse();

        assert_eq!(c.tracked_set(), expected);
    }

    #[test]
    fn test_overflow_evicts_oldest_and_flushes() {
        let mut c = ctx();
        // every even pn: 0, 2, 4, ... creates a fresh leading range each
        let pns: Vec<u64> = (0..=(MAX_RANGES as u64 + 4)).map(|i| i * 2).collect();
        let out = insert(&mut c, &pns);

        assert_eq!(c.range_count(), MAX_RANGES);
        // overflow flushed accumulated state as ACK frames
        assert!(!out.is_empty());
        // newest packets retained
        let tracked = c.tracked_set();
        assert_eq!(tracked[0], (MAX_RANGES as u64 + 4) * 2);
    }

    #[test]
    fn test_too_old_packet_one_shot_ack() {
        let mut c = ctx();
        // fill the tracker with spaced singletons well above 1
        let pns: Vec<u64> = (0..MAX_RANGES as u64 + 1).map(|i| 100 + i * 2).collect();
        insert(&mut c, &pns);
        assert_eq!(c.range_count(), MAX_RANGES);

        let mut out = Vec::new();
        let handled = c.ack_packet(1, Instant::now(), true, 3, &mut out);
        assert_eq!(handled, AckHandling::TooOld);

        match out.last() {
            Some(Frame::Ack(a)) => {
                assert_eq!(a.largest, 1);
                assert_eq!(a.first_range, 0);
                assert!(a.ranges.is_empty());
            }
            other => panic!("expected one-shot ack, got {other:?}"),
        }
    }

    #[test]
    fn test_extend_last_range_downward() {
        let mut c = ctx();
        insert(&mut c, &[5, 10]);
        insert(&mut c, &[4]); // 4 == smallest - 1 of the last range
        assert_eq!(c.tracked_set(), vec![10, 5, 4]);
    }

    #[test]
    fn test_make_ack_shape() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 2, 6, 7, 10]);

        let frame = c.make_ack(Instant::now(), 3).unwrap();
        match frame {
            Frame::Ack(a) => {
                assert_eq!(a.largest, 10);
                assert_eq!(a.first_range, 0);
                assert_eq!(a.ranges.len(), 2);
                // 10 .. gap(8,9) .. 7,6 .. gap(3,4,5) .. 2,1,0
                assert_eq!(a.ranges[0], AckRange { gap: 1, range: 1 });
                assert_eq!(a.ranges[1], AckRange { gap: 2, range: 2 });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_drop_ack_ranges() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 2, 6, 7, 10]);

        // peer saw an ACK covering up to 6: forget 6 and below
        c.drop_ack_ranges(6);
        assert_eq!(c.tracked_set(), vec![10, 7]);

        // covering everything clears the tracker
        c.drop_ack_ranges(10);
        assert!(c.tracked_set().is_empty());
        assert!(c.make_ack(Instant::now(), 3).is_none());
    }

    #[test]
    fn test_drop_ack_ranges_mid_range() {
        let mut c = ctx();
        insert(&mut c, &[0, 1, 2, 3, 8]);

        c.drop_ack_ranges(1);
        assert_eq!(c.tracked_set(), vec![8, 3, 2]);
    }

    #[test]
    fn test_non_eliciting_does_not_arm_ack() {
        let mut c = ctx();
        let mut out = Vec::new();
        c.ack_packet(0, Instant::now(), false, 3, &mut out);
        assert_eq!(c.send_ack, 0);
        assert!(out.is_empty());
        assert_eq!(c.tracked_set(), vec![0]);
    }

    #[test]
    fn test_pnum_allocation() {
        let mut c = ctx();
        assert_eq!(c.next_pnum(), 0);
        assert_eq!(c.next_pnum(), 1);
        assert_eq!(c.pnum, 2);
    }
}
