//! Receive-side reassembly and window management.
//!
//! [`Receiver`] owns everything between "a decoded segment arrived" and "the
//! application reads contiguous bytes":
//!
//! - The in-order buffer of delivered-but-unread bytes, bounded by
//!   [`MAX_RWND`].
//! - An ordered out-of-order store keyed by sequence number.  Ordering
//!   matters: the drain after each in-order arrival walks entries in
//!   ascending sequence order, so a plain hash map would not do.
//! - The advertised window, `MAX_RWND − |in_buffer|`.
//! - Duplicate and overlap handling: stale segments are discarded, and a
//!   buffered out-of-order entry that partially precedes `RCV.NXT` has its
//!   overlapping prefix trimmed before the remainder is delivered.
//!
//! The receiver does **not** send ACKs itself; it reports what happened to
//! each segment and [`crate::connection::Connection`] decides what to emit.
//!
//! Every placement decision is the signed 32-bit difference
//! `seq − RCV.NXT`: zero means expected, positive means future, negative
//! means already covered.

use std::collections::{BTreeMap, VecDeque};

/// Capacity of the in-order receive buffer in bytes.  The advertised window
/// can never exceed this.
pub const MAX_RWND: u32 = 256 * 1024;

/// What the receiver did with an inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// The segment was the one expected; its bytes (plus any contiguous
    /// out-of-order backlog) moved into the in-order buffer.
    InOrder,
    /// A future segment was stored for later reassembly.
    OutOfOrder,
    /// The segment was entirely old data and was discarded.
    Duplicate,
    /// The expected segment arrived but the free window cannot hold it; it
    /// was dropped so the peer retransmits once the window reopens.
    WindowFull,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Next in-order sequence number expected from the peer (`RCV.NXT`).
    pub rcv_nxt: u32,
    /// Contiguous bytes awaiting consumption by the application.
    in_buffer: VecDeque<u8>,
    /// Future segments keyed by sequence number.  Every key is strictly
    /// above `rcv_nxt`.
    ooo: BTreeMap<u32, Vec<u8>>,
    /// Set once the peer's FIN has been consumed; after the in-order buffer
    /// drains, reads report end-of-stream.
    fin_received: bool,
    /// Lifetime count of segments that arrived ahead of sequence.
    pub reordered_total: u64,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            rcv_nxt: 0,
            in_buffer: VecDeque::new(),
            ooo: BTreeMap::new(),
            fin_received: false,
            reordered_total: 0,
        }
    }

    /// Adopt the peer's initial sequence number from its SYN.  The SYN
    /// consumes one sequence number, so the first data byte is `irs + 1`.
    pub fn synchronize(&mut self, irs: u32) {
        self.rcv_nxt = irs.wrapping_add(1);
    }

    /// Free receive-buffer space to advertise to the peer.
    pub fn window(&self) -> u32 {
        MAX_RWND.saturating_sub(self.in_buffer.len() as u32)
    }

    /// `true` when no in-order bytes are waiting for the application.
    pub fn is_empty(&self) -> bool {
        self.in_buffer.is_empty()
    }

    /// Number of in-order bytes waiting for the application.
    pub fn buffered(&self) -> usize {
        self.in_buffer.len()
    }

    /// Number of segments currently parked in the out-of-order store.
    pub fn out_of_order_len(&self) -> usize {
        self.ooo.len()
    }

    /// `true` once the peer's FIN has been consumed.
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Consume the peer's FIN: it occupies one sequence number and marks the
    /// end of the inbound stream.
    pub fn on_fin(&mut self) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.fin_received = true;
    }

    /// Place an inbound data segment.
    ///
    /// The caller sends a cumulative ACK afterwards regardless of the
    /// outcome: an accepted segment acknowledges the new `RCV.NXT`, while a
    /// duplicate or future segment re-advertises the old one, feeding the
    /// peer's duplicate-ACK counter.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> Ingest {
        let diff = seq.wrapping_sub(self.rcv_nxt) as i32;

        if diff == 0 {
            if self.window() < payload.len() as u32 {
                return Ingest::WindowFull;
            }
            self.in_buffer.extend(payload.iter().copied());
            self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
            self.drain_out_of_order();
            Ingest::InOrder
        } else if diff > 0 {
            self.ooo.insert(seq, payload.to_vec());
            self.reordered_total += 1;
            Ingest::OutOfOrder
        } else {
            Ingest::Duplicate
        }
    }

    /// Move newly contiguous out-of-order entries into the in-order buffer.
    ///
    /// Walks entries in ascending key order.  An entry wholly below
    /// `RCV.NXT` is discarded; one that straddles it loses its overlapping
    /// prefix; the walk stops at the first genuine gap or when the window
    /// cannot hold the next entry.
    fn drain_out_of_order(&mut self) {
        loop {
            let free = MAX_RWND.saturating_sub(self.in_buffer.len() as u32);
            let rcv_nxt = self.rcv_nxt;
            let Some(entry) = self.ooo.first_entry() else {
                break;
            };
            let seq = *entry.key();
            let diff = seq.wrapping_sub(rcv_nxt) as i32;

            if diff > 0 {
                break;
            }
            if diff == 0 {
                if free < entry.get().len() as u32 {
                    break;
                }
                let data = entry.remove();
                self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                self.in_buffer.extend(data);
                continue;
            }

            // Entry starts below RCV.NXT.
            let data = entry.remove();
            let end = seq.wrapping_add(data.len() as u32);
            let end_diff = end.wrapping_sub(self.rcv_nxt) as i32;
            if end_diff > 0 {
                // Straddles RCV.NXT: deliver only the unseen suffix.
                let overlap = self.rcv_nxt.wrapping_sub(seq) as usize;
                self.in_buffer.extend(data[overlap..].iter().copied());
                self.rcv_nxt = end;
            }
            // Fully covered entries are simply dropped.
        }
    }

    /// Copy up to `buf.len()` in-order bytes into `buf`, removing them.
    /// Returns the number of bytes copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.in_buffer.len());
        for (dst, src) in buf[..n].iter_mut().zip(self.in_buffer.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Drop all buffered data and return to the pristine, unsynchronised
    /// state.
    pub fn reset(&mut self) {
        self.rcv_nxt = 0;
        self.in_buffer.clear();
        self.ooo.clear();
        self.fin_received = false;
        self.reordered_total = 0;
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
