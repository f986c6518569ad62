//! IPv4 defragmentation.
//!
//! Fragments are grouped by (src, dst, identification, protocol). Once the
//! last fragment has arrived and the byte range from offset 0 is gap-free,
//! the original datagram is rebuilt: the header of the offset-0 fragment with
//! `total_length` corrected and the fragmentation fields cleared, followed by
//! the joined payload. The caller re-runs the network decoder on the result.
//! The frames that carried the fragments can be kept alongside so the
//! datagram's flow still records what was on the wire.

use crate::flow::RawFrame;
use crate::protocol::ipv4::Ipv4Header;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Largest datagram an IPv4 header can describe.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Fragment count above which a group is considered hostile and dropped.
pub const MAX_FRAGMENTS: usize = 8_192;

/// Incomplete groups idle for longer than this (capture time) are discarded.
pub const DEFAULT_FRAGMENT_TIMEOUT_MS: i64 = 60_000;

#[derive(Debug)]
pub enum DefragError {
    /// Reassembled payload would exceed [`MAX_DATAGRAM_SIZE`].
    TooLarge { id: u16, size: usize },
    /// Group exceeded [`MAX_FRAGMENTS`].
    TooManyFragments { id: u16 },
}

impl fmt::Display for DefragError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefragError::TooLarge { id, size } => {
                write!(f, "fragment group {:#06x} too large: {} bytes", id, size)
            }
            DefragError::TooManyFragments { id } => {
                write!(f, "fragment group {:#06x} has too many fragments", id)
            }
        }
    }
}

impl std::error::Error for DefragError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    id: u16,
    protocol: u8,
}

/// A datagram rebuilt from its fragments.
#[derive(Debug)]
pub struct Datagram {
    /// IPv4 header and joined payload.
    pub data: Vec<u8>,
    /// Frames of the fragments, in arrival order, when they were kept.
    pub frames: Vec<RawFrame>,
}

#[derive(Debug, Default)]
struct FragmentGroup {
    /// Payload pieces keyed by byte offset.
    pieces: BTreeMap<usize, Vec<u8>>,
    /// Header of the offset-0 fragment once seen.
    first_header: Option<Vec<u8>>,
    /// End offset announced by the fragment without MF.
    final_len: Option<usize>,
    fragments: usize,
    frames: Vec<RawFrame>,
    last_seen_ms: i64,
}

impl FragmentGroup {
    fn insert(
        &mut self,
        header: &Ipv4Header<'_>,
        frame: Option<&[u8]>,
        now_ms: i64,
    ) -> Result<(), DefragError> {
        let id = header.identification();
        let offset = header.fragment_offset() as usize * 8;
        let payload = header.payload();
        let end = offset + payload.len();

        if end + header.header_len() > MAX_DATAGRAM_SIZE {
            return Err(DefragError::TooLarge { id, size: end });
        }
        self.fragments += 1;
        if self.fragments > MAX_FRAGMENTS {
            return Err(DefragError::TooManyFragments { id });
        }

        self.last_seen_ms = now_ms;
        if offset == 0 && self.first_header.is_none() {
            self.first_header = Some(header.header_bytes().to_vec());
        }
        if !header.more_fragments() {
            self.final_len = Some(end);
        }
        // First copy of an offset wins; retransmitted fragments are ignored.
        self.pieces.entry(offset).or_insert_with(|| payload.to_vec());
        if let Some(frame) = frame {
            self.frames.push(RawFrame {
                ts_ms: now_ms,
                data: frame.to_vec(),
            });
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        let (Some(final_len), Some(_)) = (self.final_len, &self.first_header) else {
            return false;
        };
        let mut covered = 0;
        for (&offset, data) in &self.pieces {
            if offset > covered {
                return false;
            }
            covered = covered.max(offset + data.len());
        }
        covered >= final_len
    }

    fn assemble(self) -> Option<Datagram> {
        let final_len = self.final_len?;
        let mut header = self.first_header?;
        let mut payload = vec![0u8; final_len];
        let mut written = 0;
        for (offset, data) in self.pieces {
            if offset >= final_len {
                continue;
            }
            let end = (offset + data.len()).min(final_len);
            // Overlaps keep the bytes that were placed first.
            if end > written {
                let start = offset.max(written);
                payload[start..end].copy_from_slice(&data[start - offset..end - offset]);
                written = end;
            }
        }

        let total = (header.len() + payload.len()) as u16;
        header[2..4].copy_from_slice(&total.to_be_bytes());
        header[6] &= 0x40; // keep DF, clear MF and offset
        header[7] = 0;
        header.extend_from_slice(&payload);
        Some(Datagram {
            data: header,
            frames: self.frames,
        })
    }
}

/// Buffers IPv4 fragments until their datagram is complete.
#[derive(Debug)]
pub struct Defragmenter {
    groups: AHashMap<FragmentKey, FragmentGroup>,
    timeout_ms: i64,
    last_gc_ms: i64,
}

impl Default for Defragmenter {
    fn default() -> Self {
        Defragmenter::new(DEFAULT_FRAGMENT_TIMEOUT_MS)
    }
}

impl Defragmenter {
    pub fn new(timeout_ms: i64) -> Self {
        Defragmenter {
            groups: AHashMap::new(),
            timeout_ms,
            last_gc_ms: 0,
        }
    }

    /// Number of incomplete fragment groups held.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Feed one fragment, optionally with the frame that carried it.
    /// Returns the rebuilt datagram when this fragment completes its group,
    /// `None` while more fragments are needed.
    ///
    /// Non-fragmented headers must not be passed here.
    pub fn process(
        &mut self,
        header: &Ipv4Header<'_>,
        frame: Option<&[u8]>,
        now_ms: i64,
    ) -> Result<Option<Datagram>, DefragError> {
        if now_ms - self.last_gc_ms >= self.timeout_ms {
            self.discard_older_than(now_ms - self.timeout_ms);
            self.last_gc_ms = now_ms;
        }

        let key = FragmentKey {
            src: header.src_addr(),
            dst: header.dst_addr(),
            id: header.identification(),
            protocol: header.protocol_raw(),
        };

        let group = self.groups.entry(key).or_default();
        if let Err(e) = group.insert(header, frame, now_ms) {
            self.groups.remove(&key);
            return Err(e);
        }
        if !group.is_complete() {
            return Ok(None);
        }

        Ok(self.groups.remove(&key).and_then(FragmentGroup::assemble))
    }

    /// Drop incomplete groups not touched since `cutoff_ms`.
    pub fn discard_older_than(&mut self, cutoff_ms: i64) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, g| g.last_seen_ms >= cutoff_ms);
        let dropped = before - self.groups.len();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded stale IPv4 fragment groups");
        }
        dropped
    }
}
