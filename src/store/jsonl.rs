//! File-backed storage collaborator.
//!
//! `processed.jsonl` holds the processed-file ledger and `flows.jsonl` the
//! flow summaries, one JSON object per line, both append-only. The ledger is
//! loaded into memory on open; a later record for a name supersedes the
//! earlier ones.

use super::{FileFingerprint, FlowStore, FlowSummary, StoreError};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const LEDGER_FILE: &str = "processed.jsonl";
pub const SUMMARY_FILE: &str = "flows.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    file: String,
    /// Wall-clock time the file was marked, ms since the epoch.
    time: i64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mtime_ms: i64,
    #[serde(default)]
    sha256: String,
}

#[derive(Debug, Serialize)]
struct SummaryRecord<'a> {
    id: String,
    #[serde(flatten)]
    summary: &'a FlowSummary,
}

#[derive(Debug, Default)]
struct LedgerIndex {
    hashes: AHashSet<String>,
    /// Size and mtime of the latest record per name.
    names: AHashMap<String, (u64, i64)>,
}

impl LedgerIndex {
    fn insert(&mut self, name: String, size: u64, mtime_ms: i64, sha256: String) {
        if !sha256.is_empty() {
            self.hashes.insert(sha256);
        }
        self.names.insert(name, (size, mtime_ms));
    }

    fn covers(&self, file: &FileFingerprint) -> bool {
        if self.hashes.contains(&file.sha256) {
            return true;
        }
        // Same name and the same size and mtime: nothing was rewritten.
        matches!(
            self.names.get(&file.name),
            Some(&(size, mtime)) if size == file.size && mtime == file.mtime_ms
        )
    }
}

#[derive(Debug)]
struct Ledger {
    index: LedgerIndex,
    writer: BufWriter<File>,
}

#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    ledger: Mutex<Ledger>,
    summaries: Mutex<BufWriter<File>>,
}

fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl JsonlStore {
    /// Open (creating if needed) the store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let ledger_path = dir.join(LEDGER_FILE);
        let mut index = LedgerIndex::default();
        if ledger_path.exists() {
            let reader = BufReader::new(File::open(&ledger_path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerRecord>(&line) {
                    Ok(record) => index.insert(record.file, record.size, record.mtime_ms, record.sha256),
                    Err(e) => tracing::warn!(
                        file = %ledger_path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping malformed ledger line"
                    ),
                }
            }
        }
        tracing::debug!(dir = %dir.display(), processed = index.names.len(), "opened flow store");

        Ok(JsonlStore {
            ledger: Mutex::new(Ledger {
                index,
                writer: BufWriter::new(append(&ledger_path)?),
            }),
            summaries: Mutex::new(BufWriter::new(append(&dir.join(SUMMARY_FILE))?)),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FlowStore for JsonlStore {
    fn record_exists(&self, file: &FileFingerprint) -> Result<bool, StoreError> {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ledger.index.covers(file))
    }

    fn mark_processed(&self, file: &FileFingerprint) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if ledger.index.covers(file) {
            return Ok(());
        }
        let line = serde_json::to_string(&LedgerRecord {
            file: file.name.clone(),
            time: now_ms(),
            size: file.size,
            mtime_ms: file.mtime_ms,
            sha256: file.sha256.clone(),
        })?;
        writeln!(ledger.writer, "{}", line)?;
        ledger.writer.flush()?;
        ledger
            .index
            .insert(file.name.clone(), file.size, file.mtime_ms, file.sha256.clone());
        Ok(())
    }

    fn insert_flow_summary(&self, summary: &FlowSummary) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let line = serde_json::to_string(&SummaryRecord {
            id: id.clone(),
            summary,
        })?;
        let mut writer = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Endpoint, FlowProtocol};
    use std::collections::BTreeSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn summary() -> FlowSummary {
        let ep = |port| Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);
        FlowSummary {
            src: ep(40000),
            dst: ep(80),
            protocol: FlowProtocol::Tcp,
            time: 1_700_000_000_000,
            duration: 12,
            packet_count: 6,
            blocked: false,
            tags: BTreeSet::from(["flag-out".to_string()]),
            total_size: 42,
            source_file: "a.pcap".into(),
            flow_file: "ab/cd/abcd.json.gz".into(),
            pcap_file: Some("ab/cd/abcd.pcap".into()),
        }
    }

    fn fingerprint(name: &str, size: u64, mtime_ms: i64, sha256: &str) -> FileFingerprint {
        FileFingerprint {
            name: name.into(),
            size,
            mtime_ms,
            sha256: sha256.into(),
        }
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = fingerprint("a.pcap", 10, 1_000, "aa");
        {
            let store = JsonlStore::open(dir.path()).unwrap();
            assert!(!store.record_exists(&a).unwrap());
            store.mark_processed(&a).unwrap();
            store.mark_processed(&a).unwrap();
            assert!(store.record_exists(&a).unwrap());
        }
        let store = JsonlStore::open(dir.path()).unwrap();
        assert!(store.record_exists(&a).unwrap());
        assert!(!store.record_exists(&fingerprint("b.pcap", 10, 1_000, "bb")).unwrap());

        let ledger = fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(ledger.lines().count(), 1);
    }

    #[test]
    fn same_content_under_another_name_is_covered() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        store.mark_processed(&fingerprint("a.pcap", 10, 1_000, "aa")).unwrap();
        assert!(store.record_exists(&fingerprint("copy.pcap", 10, 5_000, "aa")).unwrap());
    }

    #[test]
    fn rewritten_file_is_not_covered_until_marked_again() {
        let dir = tempfile::tempdir().unwrap();
        let old = fingerprint("round.pcap", 10, 1_000, "aa");
        let new = fingerprint("round.pcap", 24, 2_000, "bb");
        {
            let store = JsonlStore::open(dir.path()).unwrap();
            store.mark_processed(&old).unwrap();
            assert!(!store.record_exists(&new).unwrap());
            store.mark_processed(&new).unwrap();
        }
        let store = JsonlStore::open(dir.path()).unwrap();
        assert!(store.record_exists(&new).unwrap());
        // The old content stays known by hash.
        assert!(store.record_exists(&old).unwrap());
        // Another rewrite under the name is new again.
        assert!(!store.record_exists(&fingerprint("round.pcap", 30, 3_000, "cc")).unwrap());
    }

    #[test]
    fn malformed_ledger_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(LEDGER_FILE),
            "{\"file\":\"ok.pcap\",\"time\":1,\"size\":4,\"mtime_ms\":9,\"sha256\":\"ab\"}\nnot json\n\n",
        )
        .unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        assert!(store.record_exists(&fingerprint("ok.pcap", 4, 9, "other")).unwrap());
        assert!(store.record_exists(&fingerprint("renamed.pcap", 1, 1, "ab")).unwrap());
    }

    #[test]
    fn summaries_are_appended_with_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path().join("state")).unwrap();
        let a = store.insert_flow_summary(&summary()).unwrap();
        let b = store.insert_flow_summary(&summary()).unwrap();
        assert_ne!(a, b);

        let text = fs::read_to_string(store.dir().join(SUMMARY_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], a);
        assert_eq!(lines[0]["flow_file"], "ab/cd/abcd.json.gz");
        assert_eq!(lines[0]["pcap_file"], "ab/cd/abcd.pcap");
        assert_eq!(lines[0]["tags"][0], "flag-out");
        let back: FlowSummary = serde_json::from_value(lines[1].clone()).unwrap();
        assert_eq!(back, summary());
    }
}
