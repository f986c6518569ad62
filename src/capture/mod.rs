//! Capture drivers built on libpcap.
//!
//! - [`offline`] replays one capture file through the pipeline and records
//!   it in the processed-file ledger.
//! - [`live`] captures from interfaces in rounds, writing each round to a
//!   capture file that is handed to an [`upload::Uploader`].
//! - [`watcher`] feeds capture files appearing in a directory to the
//!   offline driver through the file queue.

pub mod engine;
pub mod live;
pub mod offline;
pub mod upload;
pub mod watcher;

use crate::pipeline::{FlowChain, IngestSettings};
use crate::reassembly::UdpConfig;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use engine::CaptureError;

/// Everything a driver needs besides the source itself.
#[derive(Clone)]
pub struct CaptureContext {
    pub chain: Arc<FlowChain>,
    pub ingest: IngestSettings,
    pub udp: UdpConfig,
    /// BPF filter applied to every source.
    pub filter: Option<String>,
    /// Cleared on interrupt.
    pub running: Arc<AtomicBool>,
}

/// Capture file extensions picked up by the watcher.
pub const CAPTURE_EXTENSIONS: &[&str] = &["pcap", "pcapng", "cap"];

pub fn is_capture_file(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CAPTURE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Writes classic pcap files without going through libpcap.

    use std::path::Path;

    pub const LINKTYPE_ETHERNET: u32 = 1;

    pub fn write_pcap(path: &Path, linktype: u32, packets: &[(i64, Vec<u8>)]) {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&linktype.to_le_bytes());
        for (ts_ms, data) in packets {
            out.extend_from_slice(&((ts_ms / 1000) as u32).to_le_bytes());
            out.extend_from_slice(&(((ts_ms % 1000) * 1000) as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        std::fs::write(path, out).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn capture_extensions() {
        assert!(is_capture_file(Path::new("/tmp/a.pcap")));
        assert!(is_capture_file(Path::new("b.PCAPNG")));
        assert!(!is_capture_file(Path::new("c.pcap.part")));
        assert!(!is_capture_file(Path::new("noext")));
    }
}
