//! Scatter-gather buffer for one direction of a TCP connection.
//!
//! Sequence numbers are mapped to 64-bit offsets relative to the first byte
//! of the stream so wraparound never reorders data. Segments at the expected
//! offset are released at once; later segments wait in an ordered map until
//! the gap before them is filled, or until the buffered volume forces the gap
//! to be skipped.
//!
//! A direction whose SYN was not captured has no known first byte. Until it
//! is anchored its data is only buffered, and a segment below the lowest
//! sequence seen so far moves the start down. Anchoring happens when the
//! peer sends data, on FIN, when the buffer bound is hit, or on drain.
//! Data before the start of an anchored stream is dropped.

use std::collections::BTreeMap;

/// Default bound on out-of-order bytes held per direction.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// A contiguous range released in stream order, with the capture time of
/// the segment that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug)]
struct Pending {
    data: Vec<u8>,
    timestamp: i64,
}

#[derive(Debug)]
pub struct HalfStream {
    /// Sequence number of offset 0.
    base: Option<u32>,
    /// False while the first byte is still a guess.
    anchored: bool,
    /// Next offset expected in order.
    next: u64,
    pending: BTreeMap<u64, Pending>,
    pending_bytes: usize,
    max_pending: usize,
    /// Offset just past the FIN, once seen.
    fin_at: Option<u64>,
    skipped: u64,
    /// Bytes dropped for lying before the start of the stream.
    early: u64,
}

impl HalfStream {
    pub fn new(max_pending: usize) -> Self {
        HalfStream {
            base: None,
            anchored: false,
            next: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_pending,
            fin_at: None,
            skipped: 0,
            early: 0,
        }
    }

    /// Record the SYN: data starts one past its sequence number.
    pub fn syn(&mut self, seq: u32) -> Vec<Released> {
        let mut out = Vec::new();
        if self.anchored {
            return out;
        }
        let start = seq.wrapping_add(1);
        match self.base {
            Some(base) if before(base, start) => {
                // Buffered data claims to precede the SYN; keep the lower start.
            }
            _ => self.rebase(start),
        }
        self.anchor(&mut out);
        out
    }

    /// Mark the end of this direction. `seq` is the FIN's own sequence
    /// number, which follows any payload carried on the same segment.
    pub fn fin(&mut self, seq: u32) -> Vec<Released> {
        let mut out = Vec::new();
        if self.base.is_none() {
            self.base = Some(seq);
        }
        if let Some(at) = self.offset_of(seq) {
            self.fin_at = Some(self.fin_at.map_or(at, |prev| prev.min(at)));
        }
        self.anchor(&mut out);
        out
    }

    /// Stop waiting for data below the lowest sequence seen and release
    /// what is contiguous from there.
    pub fn settle(&mut self) -> Vec<Released> {
        let mut out = Vec::new();
        self.anchor(&mut out);
        out
    }

    /// True once the FIN was seen and every byte before it was released.
    pub fn is_closed(&self) -> bool {
        matches!(self.fin_at, Some(at) if self.next >= at)
    }

    /// Bytes dropped because a gap was never filled.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Bytes dropped because they came before the start of the stream.
    pub fn early(&self) -> u64 {
        self.early
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Capture time of the oldest buffered segment.
    pub fn oldest_pending(&self) -> Option<i64> {
        self.pending.values().map(|p| p.timestamp).min()
    }

    /// Offer a segment. Returns the ranges that became contiguous.
    pub fn push(&mut self, seq: u32, data: &[u8], timestamp: i64) -> Vec<Released> {
        let mut out = Vec::new();
        if data.is_empty() {
            return out;
        }
        match self.base {
            None => self.base = Some(seq),
            Some(base) if !self.anchored && before(seq, base) => self.rebase(seq),
            Some(_) => {}
        }

        let Some(start) = self.offset_of(seq) else {
            tracing::debug!(seq, len = data.len(), "dropping data before stream start");
            self.early += data.len() as u64;
            return out;
        };
        let end = start + data.len() as u64;
        if end <= self.next {
            return out;
        }

        if self.anchored && start <= self.next {
            let skip = (self.next - start) as usize;
            self.release(data[skip..].to_vec(), timestamp, &mut out);
            self.drain_ready(&mut out);
            return out;
        }

        let replace = match self.pending.get(&start) {
            Some(existing) => existing.data.len() < data.len(),
            None => true,
        };
        if replace {
            if let Some(old) = self.pending.insert(
                start,
                Pending {
                    data: data.to_vec(),
                    timestamp,
                },
            ) {
                self.pending_bytes -= old.data.len();
            }
            self.pending_bytes += data.len();
        }

        if self.pending_bytes > self.max_pending {
            self.anchored = true;
            self.skip_gap(&mut out);
        }
        out
    }

    /// Release everything still buffered, skipping any remaining gaps.
    pub fn drain_all(&mut self) -> Vec<Released> {
        let mut out = Vec::new();
        self.anchored = true;
        while !self.pending.is_empty() {
            self.skip_gap(&mut out);
        }
        out
    }

    fn anchor(&mut self, out: &mut Vec<Released>) {
        if !self.anchored {
            self.anchored = true;
            self.drain_ready(out);
        }
    }

    /// Move offset 0 down to `seq`. Only valid before anything was released.
    fn rebase(&mut self, seq: u32) {
        let shift = match self.base {
            Some(base) => base.wrapping_sub(seq) as u64,
            None => 0,
        };
        self.base = Some(seq);
        if shift == 0 {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        self.pending = pending.into_iter().map(|(k, v)| (k + shift, v)).collect();
        self.fin_at = self.fin_at.map(|at| at + shift);
    }

    /// Offset of `seq`, or `None` if it lies before offset 0.
    fn offset_of(&self, seq: u32) -> Option<u64> {
        let base = self.base?;
        let rel = seq.wrapping_sub(base) as i64;
        let next = self.next as i64;
        // Pick the 2^32 epoch closest to where the stream currently is.
        let epoch = next & !0xFFFF_FFFF;
        [epoch - (1 << 32) + rel, epoch + rel, epoch + (1 << 32) + rel]
            .into_iter()
            .min_by_key(|c| c.abs_diff(next))
            .filter(|c| *c >= 0)
            .map(|c| c as u64)
    }

    fn release(&mut self, data: Vec<u8>, timestamp: i64, out: &mut Vec<Released>) {
        if data.is_empty() {
            return;
        }
        self.next += data.len() as u64;
        out.push(Released { data, timestamp });
    }

    fn drain_ready(&mut self, out: &mut Vec<Released>) {
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next {
                break;
            }
            let seg = entry.remove();
            self.pending_bytes -= seg.data.len();
            let end = start + seg.data.len() as u64;
            if end > self.next {
                let skip = (self.next - start) as usize;
                self.release(seg.data[skip..].to_vec(), seg.timestamp, out);
            }
        }
    }

    fn skip_gap(&mut self, out: &mut Vec<Released>) {
        if let Some((&start, _)) = self.pending.first_key_value() {
            if start > self.next {
                tracing::debug!(
                    missing = start - self.next,
                    buffered = self.pending_bytes,
                    "skipping gap in TCP stream"
                );
                self.skipped += start - self.next;
                self.next = start;
            }
            self.drain_ready(out);
        }
    }
}

/// Whether `a` precedes `b` in sequence space.
fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
