//! Live driver: capture from interfaces in fixed-length rounds.
//!
//! Each interface gets a reader thread that owns the pcap handle, appends
//! every packet to the round's capture file and forwards it over a bounded
//! channel. The calling thread ingests packets and waits on a `select!`
//! between packet arrival, the sweep tick and the round deadline. At the
//! deadline the reader is stopped, packets already captured are drained, all
//! streams are flushed and the file goes to the [`Uploader`].

use super::engine::{self, CaptureError, LiveOptions};
use super::upload::Uploader;
use super::CaptureContext;
use crate::pipeline::{Ingest, IngestStats, OwnedPacket, SessionSink};
use crate::reassembly::{FlowSink, UdpAggregator};
use crate::store::{FileFingerprint, StoreError};
use crossbeam_channel::{select, Receiver, Sender};
use pcap::{Active, Capture, Device};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const PACKET_CHANNEL_CAPACITY: usize = 8192;

#[derive(Debug, Clone)]
pub struct LiveSettings {
    /// Capture on this interface only; every device when `None`.
    pub interface: Option<String>,
    pub options: LiveOptions,
    /// Length of one round.
    pub round: Duration,
    /// Where round capture files are written before upload.
    pub out_dir: PathBuf,
}

/// Why the ingestion loop of one interface stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveEnd {
    Deadline,
    Interrupted,
    /// The reader went away (read error or closed handle).
    SourceClosed,
}

#[derive(Debug, Clone)]
pub struct InterfaceReport {
    pub interface: String,
    pub file: PathBuf,
    pub end: DriveEnd,
    pub stats: IngestStats,
    /// Packets written to the capture file.
    pub written: u64,
}

fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Capture file name for a round on `interface` started at `start_secs`.
pub fn capture_file_name(interface: &str, start_secs: u64) -> String {
    let clean: String = interface
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}_{}.pcap", clean, start_secs)
}

/// Ingest packets from `rx` until the deadline, an interrupt, or the sender
/// going away. Sweeps run on every tick even without traffic.
pub fn drive(
    ingest: &mut Ingest,
    rx: &Receiver<OwnedPacket>,
    deadline: Instant,
    tick: Duration,
    running: &AtomicBool,
    sink: &dyn FlowSink,
) -> DriveEnd {
    let ticker = crossbeam_channel::tick(tick);
    let timeout = crossbeam_channel::at(deadline);
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(pkt) => feed(ingest, &pkt, sink),
                Err(_) => return DriveEnd::SourceClosed,
            },
            recv(ticker) -> _ => {
                if !running.load(Ordering::Relaxed) {
                    return DriveEnd::Interrupted;
                }
                ingest.tick(wall_ms(), sink);
            },
            recv(timeout) -> _ => return DriveEnd::Deadline,
        }
    }
}

/// Stop the reader and ingest what it already forwarded. Every one of those
/// packets is in the round file, which the ledger will mark as processed.
///
/// The reader checks `stop` before each read, so after the flag is set it
/// sends at most one more packet and drops its sender. The drain is bounded
/// by the channel capacity plus that packet.
fn drain_after_stop(
    ingest: &mut Ingest,
    rx: &Receiver<OwnedPacket>,
    stop: &AtomicBool,
    sink: &dyn FlowSink,
) -> usize {
    stop.store(true, Ordering::Relaxed);
    let mut drained = 0;
    for pkt in rx.iter() {
        feed(ingest, &pkt, sink);
        drained += 1;
    }
    drained
}

fn feed(ingest: &mut Ingest, pkt: &OwnedPacket, sink: &dyn FlowSink) {
    if let Err(e) = ingest.packet(pkt.ts_ms, &pkt.data, sink) {
        tracing::debug!(error = %e, len = pkt.wire_len, "packet skipped");
    }
}

/// Reader thread body: write every packet to `path` and forward it.
fn read_packets(
    mut cap: Capture<Active>,
    path: &Path,
    tx: Sender<OwnedPacket>,
    stop: &AtomicBool,
) -> Result<u64, pcap::Error> {
    let mut savefile = cap.savefile(path)?;
    let mut written = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "capture read failed");
                break;
            }
        };
        savefile.write(&packet);
        written += 1;
        let pkt = OwnedPacket {
            ts_ms: engine::timestamp_ms(packet.header),
            wire_len: packet.header.len,
            data: packet.data.to_vec(),
        };
        if tx.send(pkt).is_err() {
            break;
        }
    }
    savefile.flush()?;
    Ok(written)
}

/// Capture on one device until `deadline`, then finalize its ingestion.
fn capture_interface(
    device: Device,
    settings: &LiveSettings,
    ctx: &CaptureContext,
    udp: Arc<UdpAggregator>,
    sink: &SessionSink,
    deadline: Instant,
) -> Result<InterfaceReport, CaptureError> {
    let interface = device.name.clone();
    let start_secs = (wall_ms() / 1000) as u64;
    let file_name = capture_file_name(&interface, start_secs);
    let path = settings.out_dir.join(&file_name);

    let mut options = settings.options.clone();
    options.filter = ctx.filter.clone();
    let cap = engine::open_live(device, &options)?;
    let link = engine::link_type(&cap)?;

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = crossbeam_channel::bounded(PACKET_CHANNEL_CAPACITY);
    let reader = {
        let stop = stop.clone();
        let path = path.clone();
        thread::Builder::new()
            .name(format!("ss-cap-{}", interface))
            .spawn(move || read_packets(cap, &path, tx, &stop))?
    };

    let mut ingest = Ingest::new(link, &ctx.ingest, udp, file_name);
    let tick = Duration::from_millis(ctx.ingest.sweep_interval_ms.max(1) as u64);
    let end = drive(&mut ingest, &rx, deadline, tick, &ctx.running, sink);

    let drained = drain_after_stop(&mut ingest, &rx, &stop, sink);
    let written = match reader.join() {
        Ok(result) => result?,
        Err(_) => {
            return Err(CaptureError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("capture thread for {} panicked", interface),
            )))
        }
    };
    let stats = ingest.finish(sink);

    tracing::info!(
        interface = %interface,
        file = %path.display(),
        end = ?end,
        written,
        drained,
        packets = stats.packets,
        tcp = stats.tcp,
        udp = stats.udp,
        errors = stats.errors,
        "capture round finished"
    );

    Ok(InterfaceReport {
        interface,
        file: path,
        end,
        stats,
        written,
    })
}

/// Run one round on the configured interfaces. With a single interface an
/// open failure aborts the round; with all interfaces it only skips that
/// device unless every device fails.
pub fn run_round(
    settings: &LiveSettings,
    ctx: &CaptureContext,
    uploader: &dyn Uploader,
) -> Result<Vec<InterfaceReport>, CaptureError> {
    let devices = engine::select_devices(settings.interface.as_deref())?;
    fs::create_dir_all(&settings.out_dir)?;

    let sink = SessionSink::new(ctx.chain.clone());
    let udp = Arc::new(UdpAggregator::new(ctx.udp.clone()));
    let deadline = Instant::now() + settings.round;
    let single = devices.len() == 1;

    let results: Vec<Result<InterfaceReport, CaptureError>> = if single {
        devices
            .into_iter()
            .map(|d| capture_interface(d, settings, ctx, udp.clone(), &sink, deadline))
            .collect()
    } else {
        thread::scope(|scope| {
            let mut handles = Vec::new();
            for device in devices {
                let name = device.name.clone();
                let udp = udp.clone();
                let sink = &sink;
                let handle = thread::Builder::new()
                    .name(format!("ss-live-{}", name))
                    .spawn_scoped(scope, move || {
                        capture_interface(device, settings, ctx, udp, sink, deadline)
                    });
                match handle {
                    Ok(h) => handles.push((name, h)),
                    Err(e) => tracing::warn!(interface = %name, error = %e, "failed to start capture thread"),
                }
            }
            handles
                .into_iter()
                .map(|(name, h)| {
                    h.join().unwrap_or_else(|_| {
                        Err(CaptureError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("capture on {} panicked", name),
                        )))
                    })
                })
                .collect()
        })
    };

    // Every interface has joined; UDP aggregates are shared between them.
    udp.flush_all(&sink);

    let mut reports = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) if single => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "interface capture failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if reports.is_empty() {
        if let Some(e) = first_error {
            return Err(e);
        }
    }

    let failed = sink.failed();
    for report in &reports {
        // The round was ingested here; a watcher sharing this ledger skips it.
        if failed == 0 {
            let marked = FileFingerprint::of(&report.file)
                .map_err(StoreError::from)
                .and_then(|fingerprint| ctx.chain.store().mark_processed(&fingerprint));
            if let Err(e) = marked {
                tracing::warn!(file = %report.file.display(), error = %e, "failed to mark capture processed");
            }
        }
        if let Err(e) = uploader.upload(&report.file) {
            tracing::error!(file = %report.file.display(), error = %e, "upload failed");
        }
    }

    Ok(reports)
}

/// Capture rounds until interrupted.
pub fn run(settings: &LiveSettings, ctx: &CaptureContext, uploader: &dyn Uploader) -> Result<(), CaptureError> {
    tracing::info!(
        interface = settings.interface.as_deref().unwrap_or("all"),
        round_secs = settings.round.as_secs(),
        out_dir = %settings.out_dir.display(),
        "live capture starting"
    );
    while ctx.running.load(Ordering::Relaxed) {
        run_round(settings, ctx, uploader)?;
    }
    Ok(())
}
