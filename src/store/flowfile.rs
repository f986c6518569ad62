//! Flow files: gzip-compressed JSON arrays of `{"f","b","t"}` items.
//!
//! Each file gets a fresh UUID name and is sharded two levels deep by the
//! first four hex digits. Files are created with `create_new`, never
//! overwritten. A flow's frames go to a classic pcap file of the same stem.

use super::StoreError;
use crate::flow::{FlowItem, FrameLog};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const FLOW_FILE_SUFFIX: &str = ".json.gz";
pub const FLOW_PCAP_SUFFIX: &str = ".pcap";

#[derive(Debug, Clone)]
pub struct FlowFiles {
    root: PathBuf,
}

impl FlowFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FlowFiles { root: root.into() }
    }

    /// Absolute path of a name returned by [`FlowFiles::write`].
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `items` to a new file. Returns its name relative to the root.
    pub fn write(&self, items: &[FlowItem]) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}/{}/{}{}", &id[0..2], &id[2..4], id, FLOW_FILE_SUFFIX);
        let path = self.path(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let result = write_items(BufWriter::new(file), items);
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result.map(|_| name)
    }

    pub fn read(&self, name: &str) -> Result<Vec<FlowItem>, StoreError> {
        read_items(&self.path(name))
    }

    /// Write `frames` next to the flow file `flow_name`. Returns the pcap
    /// name relative to the root, or `None` when there are no frames.
    pub fn write_pcap(&self, flow_name: &str, frames: &FrameLog) -> Result<Option<String>, StoreError> {
        let Some(linktype) = frames.linktype().filter(|_| !frames.is_empty()) else {
            return Ok(None);
        };
        let stem = flow_name.strip_suffix(FLOW_FILE_SUFFIX).unwrap_or(flow_name);
        let name = format!("{}{}", stem, FLOW_PCAP_SUFFIX);
        let path = self.path(&name);
        if path.exists() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }

        let result = write_frames(&path, linktype, frames);
        if result.is_err() {
            let _ = fs::remove_file(&path);
        }
        result.map(|_| Some(name))
    }
}

fn write_frames(path: &Path, linktype: i32, frames: &FrameLog) -> Result<(), StoreError> {
    let mut savefile = pcap::Capture::dead(pcap::Linktype(linktype))?.savefile(path)?;
    for frame in frames.frames() {
        let len = frame.data.len() as u32;
        let header = pcap::PacketHeader {
            ts: libc::timeval {
                tv_sec: (frame.ts_ms / 1000) as libc::time_t,
                tv_usec: (frame.ts_ms % 1000 * 1000) as libc::suseconds_t,
            },
            caplen: len,
            len,
        };
        savefile.write(&pcap::Packet::new(&header, &frame.data));
    }
    savefile.flush()?;
    Ok(())
}

/// Encode `items` as gzip JSON into `writer`.
pub fn write_items<W: Write>(writer: W, items: &[FlowItem]) -> Result<(), StoreError> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    serde_json::to_writer(&mut encoder, items)?;
    encoder.finish()?.flush()?;
    Ok(())
}

pub fn read_items(path: &Path) -> Result<Vec<FlowItem>, StoreError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    Ok(serde_json::from_reader(decoder)?)
}
