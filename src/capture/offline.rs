//! Offline driver: one capture file through the pipeline.

use super::engine::{self, CaptureError};
use super::CaptureContext;
use crate::pipeline::{Ingest, IngestStats, SessionSink};
use crate::reassembly::UdpAggregator;
use crate::store::FileFingerprint;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Already in the ledger, not read.
    AlreadyProcessed,
    /// Read to the end and marked processed.
    Complete,
    /// Interrupted, cut short by a read error, or some flows failed to
    /// persist. Left out of the ledger so a later run retries it.
    Partial,
}

#[derive(Debug, Clone)]
pub struct FileReport {
    /// The file name without directories.
    pub file: String,
    pub status: FileStatus,
    pub stats: IngestStats,
    pub persisted: u64,
    pub failed: u64,
}

/// Process `path` unless the ledger already covers it. Stat, hash, open and
/// filter errors abort the file before anything is written.
pub fn process_file(path: &Path, ctx: &CaptureContext) -> Result<FileReport, CaptureError> {
    let fingerprint = FileFingerprint::of(path)?;
    let file = fingerprint.name.clone();
    let store = ctx.chain.store();

    match store.record_exists(&fingerprint) {
        Ok(true) => {
            tracing::debug!(file = %path.display(), "already processed, skipping");
            return Ok(FileReport {
                file,
                status: FileStatus::AlreadyProcessed,
                stats: IngestStats::default(),
                persisted: 0,
                failed: 0,
            });
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "ledger lookup failed, processing anyway")
        }
    }

    let mut cap = engine::open_offline(path, ctx.filter.as_deref())?;
    let link = engine::link_type(&cap)?;

    let sink = SessionSink::new(ctx.chain.clone());
    let udp = Arc::new(UdpAggregator::new(ctx.udp.clone()));
    let mut ingest = Ingest::new(link, &ctx.ingest, udp.clone(), file.clone());

    let mut cut_short = false;
    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            tracing::info!(file = %path.display(), "interrupted, finalizing");
            cut_short = true;
            break;
        }
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "read error, finalizing");
                cut_short = true;
                break;
            }
        };
        let ts_ms = engine::timestamp_ms(packet.header);
        if let Err(e) = ingest.packet(ts_ms, packet.data, &sink) {
            tracing::debug!(file = %file, error = %e, "packet skipped");
        }
    }

    let stats = ingest.finish(&sink);
    udp.flush_all(&sink);

    let (persisted, failed) = (sink.persisted(), sink.failed());
    let status = if cut_short || failed > 0 {
        FileStatus::Partial
    } else {
        match store.mark_processed(&fingerprint) {
            Ok(()) => FileStatus::Complete,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to mark file processed");
                FileStatus::Partial
            }
        }
    };

    tracing::info!(
        file = %path.display(),
        packets = stats.packets,
        bytes = stats.bytes,
        tcp = stats.tcp,
        udp = stats.udp,
        other = stats.other,
        errors = stats.errors,
        persisted,
        failed,
        status = ?status,
        "file processed"
    );

    Ok(FileReport {
        file,
        status,
        stats,
        persisted,
        failed,
    })
}
