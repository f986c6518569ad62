//! Persistence: flow files, the storage collaborator contract and re-tagging.

pub mod flowfile;
pub mod jsonl;

use crate::analysis::FlagTagger;
use crate::flow::{Endpoint, FlowEntry, FlowProtocol};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

pub use flowfile::FlowFiles;
pub use jsonl::JsonlStore;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Pcap(pcap::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {}", e),
            StoreError::Json(e) => write!(f, "storage encoding error: {}", e),
            StoreError::Pcap(e) => write!(f, "flow capture error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
            StoreError::Pcap(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}

impl From<pcap::Error> for StoreError {
    fn from(e: pcap::Error) -> Self {
        StoreError::Pcap(e)
    }
}

/// Summary record of a persisted flow. The items live in `flow_file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub protocol: FlowProtocol,
    pub time: i64,
    pub duration: i64,
    pub packet_count: u64,
    pub blocked: bool,
    pub tags: BTreeSet<String>,
    pub total_size: usize,
    pub source_file: String,
    /// Flow file name relative to the flow directory.
    pub flow_file: String,
    /// The flow's frames, next to `flow_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcap_file: Option<String>,
}

impl FlowSummary {
    pub fn new(entry: &FlowEntry, flow_file: String, pcap_file: Option<String>) -> Self {
        FlowSummary {
            src: entry.src,
            dst: entry.dst,
            protocol: entry.protocol,
            time: entry.time,
            duration: entry.duration,
            packet_count: entry.packet_count,
            blocked: entry.blocked,
            tags: entry.tags.clone(),
            total_size: entry.total_size,
            source_file: entry.source_file.clone(),
            flow_file,
            pcap_file,
        }
    }
}

/// Identity of a capture file as the processed-file ledger sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File name without directories.
    pub name: String,
    pub size: u64,
    /// Modification time, ms since the epoch.
    pub mtime_ms: i64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
}

impl FileFingerprint {
    /// Stat and hash the file at `path`.
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(path)?, &mut hasher)?;
        Ok(FileFingerprint {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            size: meta.len(),
            mtime_ms,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

/// Storage collaborator. Implementations must tolerate concurrent calls
/// from several ingestion threads.
pub trait FlowStore: Send + Sync {
    /// Whether the ledger already covers `file`: the same content under any
    /// name, or a record of the same name whose size and mtime still match.
    fn record_exists(&self, file: &FileFingerprint) -> Result<bool, StoreError>;

    /// Record `file`, replacing an older record of the same name.
    fn mark_processed(&self, file: &FileFingerprint) -> Result<(), StoreError>;

    /// Store a summary record and return its id.
    fn insert_flow_summary(&self, summary: &FlowSummary) -> Result<String, StoreError>;
}

/// Re-run `tagger` over the items of an already written flow file and
/// return the flag tags they earn.
pub fn retag(path: &Path, tagger: &FlagTagger) -> Result<BTreeSet<String>, StoreError> {
    let items = flowfile::read_items(path)?;
    Ok(tagger.scan(&items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowItem};
    use crate::analysis::tags::{FLAG_IN, FLAG_OUT};

    #[test]
    fn retag_reads_back_flow_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = FlowFiles::new(dir.path());
        let name = files
            .write(&[
                FlowItem::new(Direction::Client, b"hello".to_vec(), 1),
                FlowItem::new(Direction::Server, b"CTF{later}".to_vec(), 2),
            ])
            .unwrap();

        let old = FlagTagger::new(r"FLAG\{\w+\}").unwrap();
        assert!(retag(&files.path(&name), &old).unwrap().is_empty());

        let new = FlagTagger::new(r"CTF\{\w+\}").unwrap();
        let tags = retag(&files.path(&name), &new).unwrap();
        assert!(tags.contains(FLAG_OUT));
        assert!(!tags.contains(FLAG_IN));
    }

    #[test]
    fn fingerprint_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.pcap");
        fs::write(&path, b"abc").unwrap();
        let first = FileFingerprint::of(&path).unwrap();
        assert_eq!(first.name, "round.pcap");
        assert_eq!(first.size, 3);
        assert_eq!(
            first.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        fs::write(&path, b"abd").unwrap();
        let second = FileFingerprint::of(&path).unwrap();
        assert_eq!(second.name, first.name);
        assert_ne!(second.sha256, first.sha256);
    }

    #[test]
    fn retag_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = FlagTagger::new("x").unwrap();
        assert!(matches!(
            retag(&dir.path().join("nope.json.gz"), &tagger),
            Err(StoreError::Io(_))
        ));
    }
}
