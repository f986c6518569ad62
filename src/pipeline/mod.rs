//! Completion chain and per-source ingestion.
//!
//! ```text
//! capture driver
//!   |
//!   +--> Ingest (link strip, defrag, TCP engine, UDP aggregator)
//!          |
//!          +--[FlowSink::deliver, synchronous]--> SessionSink
//!                                                   |
//!                                                   +--> FlowChain
//!                                                         normalize -> tag
//!                                                         -> flow file -> summary
//! ```
//!
//! Every capture source runs its own sequential `Ingest`. Sources of one
//! session share the `SessionSink`, which counts persisted and failed flows
//! so the driver can decide whether the source may enter the ledger.

pub mod ingest;
pub mod queue;

use crate::analysis::{FlagTagger, HttpNormalizer};
use crate::flow::FlowEntry;
use crate::reassembly::FlowSink;
use crate::store::{FlowFiles, FlowStore, FlowSummary, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use ingest::{Ingest, IngestError, IngestSettings, IngestStats};
pub use queue::FileQueue;

/// An owned packet handed from a capture thread to an ingestion thread.
#[derive(Debug)]
pub struct OwnedPacket {
    /// Capture time, ms since the epoch.
    pub ts_ms: i64,
    /// Wire length (from the pcap header).
    pub wire_len: u32,
    pub data: Vec<u8>,
}

/// Post-reassembly processing of one finished flow.
pub struct FlowChain {
    normalizer: HttpNormalizer,
    tagger: Option<Arc<FlagTagger>>,
    files: FlowFiles,
    store: Arc<dyn FlowStore>,
}

impl FlowChain {
    pub fn new(
        normalizer: HttpNormalizer,
        tagger: Option<Arc<FlagTagger>>,
        files: FlowFiles,
        store: Arc<dyn FlowStore>,
    ) -> Self {
        FlowChain {
            normalizer,
            tagger,
            files,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    /// Normalize, tag and persist `entry`. Returns the summary id.
    pub fn persist(&self, mut entry: FlowEntry) -> Result<String, StoreError> {
        self.normalizer.normalize(&mut entry);
        if let Some(tagger) = &self.tagger {
            tagger.tag(&mut entry);
        }
        let name = self.files.write(&entry.items)?;
        let pcap_file = match self.files.write_pcap(&name, &entry.frames) {
            Ok(pcap_file) => pcap_file,
            Err(e) => {
                tracing::warn!(flow_file = %name, error = %e, "failed to write flow frames");
                None
            }
        };
        let summary = FlowSummary::new(&entry, name, pcap_file);
        self.store.insert_flow_summary(&summary)
    }
}

/// Sink for one capture session.
pub struct SessionSink {
    chain: Arc<FlowChain>,
    persisted: AtomicU64,
    failed: AtomicU64,
}

impl SessionSink {
    pub fn new(chain: Arc<FlowChain>) -> Self {
        SessionSink {
            chain,
            persisted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl FlowSink for SessionSink {
    fn deliver(&self, entry: FlowEntry) {
        let (src, dst, source) = (entry.src, entry.dst, entry.source_file.clone());
        match self.chain.persist(entry) {
            Ok(id) => {
                self.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%id, %src, %dst, "flow persisted");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%src, %dst, file = %source, error = %e, "failed to persist flow");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::TempChain;
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowBuilder, FlowProtocol};
    use std::net::{IpAddr, Ipv4Addr};

    fn entry() -> FlowEntry {
        let ep = |port| Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port);
        let mut b = FlowBuilder::new(FlowProtocol::Tcp, ep(40000), ep(80), 1_000);
        b.push(Direction::Client, b"GET / HTTP/1.1\r\n\r\n", 1);
        b.push(Direction::Server, b"HTTP/1.1 200 OK\r\n\r\nFLAG{x}", 2);
        b.finish("a.pcap").unwrap()
    }

    #[test]
    fn persisted_flow_has_file_and_summary() {
        let t = TempChain::new(Some(r"FLAG\{.*\}"));
        let sink = SessionSink::new(t.chain.clone());
        sink.deliver(entry());
        assert_eq!(sink.persisted(), 1);
        assert_eq!(sink.failed(), 0);

        let summaries = t.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["tags"], serde_json::json!(["flag-out"]));
        assert_eq!(summaries[0]["source_file"], "a.pcap");

        let name = summaries[0]["flow_file"].as_str().unwrap();
        let items = crate::store::flowfile::read_items(&t.dir.path().join("flows").join(name)).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].from, Direction::Client);
    }

    #[test]
    fn write_failure_is_counted() {
        let t = TempChain::new(None);
        // A regular file where the flow directory should be.
        let blocked = t.dir.path().join("blocked");
        std::fs::write(&blocked, b"x").unwrap();
        let chain = Arc::new(FlowChain::new(
            HttpNormalizer::default(),
            None,
            FlowFiles::new(&blocked),
            t.store.clone(),
        ));
        let sink = SessionSink::new(chain);
        sink.deliver(entry());
        assert_eq!(sink.persisted(), 0);
        assert_eq!(sink.failed(), 1);
        assert!(t.summaries().is_empty());
    }
}
