//! Sequential ingestion path for one capture source.

use crate::defrag::{DefragError, Defragmenter, DEFAULT_FRAGMENT_TIMEOUT_MS};
use crate::flow::{Endpoint, FrameRef};
use crate::protocol::{self, IpProtocol, LinkType, NetworkHeader, ParseError, ParsedPacket, TransportHeader};
use crate::reassembly::{FlowSink, TcpAssembler, TcpConfig, UdpAggregator};
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum IngestError {
    /// Frame could not be decoded.
    Parse(ParseError),
    /// Fragment group rejected.
    Defrag(DefragError),
    /// A datagram rebuilt from fragments does not decode. The fragments
    /// themselves were accepted, so this points at the defragmenter.
    Reassembled { protocol: IpProtocol, reason: String },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Parse(e) => write!(f, "{}", e),
            IngestError::Defrag(e) => write!(f, "defragmentation failed: {}", e),
            IngestError::Reassembled { protocol, reason } => {
                write!(f, "reassembled {} datagram does not decode: {}", protocol, reason)
            }
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ParseError> for IngestError {
    fn from(e: ParseError) -> Self {
        IngestError::Parse(e)
    }
}

impl From<DefragError> for IngestError {
    fn from(e: DefragError) -> Self {
        IngestError::Defrag(e)
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub tcp: TcpConfig,
    /// TCP connections idle this long are force-completed. `None` keeps them
    /// until FIN, RST or the end of the source.
    pub tcp_idle_ms: Option<i64>,
    /// How often, in capture time, the idle sweeps run.
    pub sweep_interval_ms: i64,
    pub fragment_timeout_ms: i64,
    /// Keep each flow's captured frames for the per-flow pcap.
    pub keep_frames: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            tcp: TcpConfig::default(),
            tcp_idle_ms: Some(300_000),
            sweep_interval_ms: 1_000,
            fragment_timeout_ms: DEFAULT_FRAGMENT_TIMEOUT_MS,
            keep_frames: true,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestStats {
    pub packets: u64,
    pub bytes: u64,
    pub tcp: u64,
    pub udp: u64,
    /// Non-IP frames and IP packets that are neither TCP nor UDP.
    pub other: u64,
    pub fragments: u64,
    pub errors: u64,
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets ({} bytes): {} tcp, {} udp, {} other, {} fragments, {} errors",
            self.packets, self.bytes, self.tcp, self.udp, self.other, self.fragments, self.errors
        )
    }
}

pub struct Ingest {
    /// Data link type as reported by pcap, recorded with kept frames.
    linktype: i32,
    link: LinkType,
    keep_frames: bool,
    source_file: String,
    defrag: Defragmenter,
    tcp: TcpAssembler,
    udp: Arc<UdpAggregator>,
    tcp_idle_ms: Option<i64>,
    fragment_timeout_ms: i64,
    sweep_interval_ms: i64,
    last_sweep_ms: Option<i64>,
    stats: IngestStats,
}

impl Ingest {
    pub fn new(
        linktype: pcap::Linktype,
        settings: &IngestSettings,
        udp: Arc<UdpAggregator>,
        source_file: impl Into<String>,
    ) -> Self {
        let source_file = source_file.into();
        let mut tcp = TcpAssembler::new(settings.tcp.clone());
        tcp.set_source_file(source_file.clone());
        Ingest {
            linktype: linktype.0,
            link: LinkType::from(linktype),
            keep_frames: settings.keep_frames,
            source_file,
            defrag: Defragmenter::new(settings.fragment_timeout_ms),
            tcp,
            udp,
            tcp_idle_ms: settings.tcp_idle_ms,
            fragment_timeout_ms: settings.fragment_timeout_ms,
            sweep_interval_ms: settings.sweep_interval_ms.max(1),
            last_sweep_ms: None,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn tcp(&self) -> &TcpAssembler {
        &self.tcp
    }

    /// Feed one captured frame. Errors concern this frame only; the caller
    /// logs them and carries on.
    pub fn packet(&mut self, ts_ms: i64, frame: &[u8], sink: &dyn FlowSink) -> Result<(), IngestError> {
        self.stats.packets += 1;
        self.stats.bytes += frame.len() as u64;
        self.tick(ts_ms, sink);

        let result = self.decode(ts_ms, frame, sink);
        if result.is_err() {
            self.stats.errors += 1;
        }
        result
    }

    fn decode(&mut self, ts_ms: i64, frame: &[u8], sink: &dyn FlowSink) -> Result<(), IngestError> {
        let Some(ip) = protocol::network_slice(self.link, frame)? else {
            self.stats.other += 1;
            return Ok(());
        };
        let network = protocol::parse_network(ip)?;

        if let NetworkHeader::Ipv4(hdr) = &network {
            if hdr.is_fragment() {
                self.stats.fragments += 1;
                let kept = self.keep_frames.then_some(frame);
                let Some(datagram) = self.defrag.process(hdr, kept, ts_ms)? else {
                    return Ok(());
                };
                let parsed = decode_reassembled(&datagram.data)?;
                let linktype = self.linktype;
                let frames: Vec<FrameRef<'_>> = datagram
                    .frames
                    .iter()
                    .map(|f| FrameRef {
                        linktype,
                        ts_ms: f.ts_ms,
                        data: &f.data,
                    })
                    .collect();
                self.dispatch(&parsed, ts_ms, &frames, sink);
                return Ok(());
            }
        }

        let whole = [FrameRef {
            linktype: self.linktype,
            ts_ms,
            data: frame,
        }];
        let frames: &[FrameRef<'_>] = if self.keep_frames { &whole } else { &[] };
        let (transport, payload) = protocol::parse_transport(&network);
        let parsed = ParsedPacket {
            network,
            transport,
            payload,
        };
        self.dispatch(&parsed, ts_ms, frames, sink);
        Ok(())
    }

    fn dispatch(
        &mut self,
        packet: &ParsedPacket<'_>,
        ts_ms: i64,
        frames: &[FrameRef<'_>],
        sink: &dyn FlowSink,
    ) {
        let (src_ip, dst_ip) = (packet.network.src_ip(), packet.network.dst_ip());
        match &packet.transport {
            Some(TransportHeader::Tcp(hdr)) => {
                self.stats.tcp += 1;
                let src = Endpoint::new(src_ip, hdr.src_port());
                let dst = Endpoint::new(dst_ip, hdr.dst_port());
                self.tcp.process(src, dst, hdr, ts_ms, frames, sink);
            }
            Some(TransportHeader::Udp(hdr)) => {
                self.stats.udp += 1;
                let src = Endpoint::new(src_ip, hdr.src_port());
                let dst = Endpoint::new(dst_ip, hdr.dst_port());
                self.udp
                    .process(src, dst, packet.payload, ts_ms, frames, &self.source_file);
            }
            None => self.stats.other += 1,
        }
    }

    /// Run the idle sweeps if the sweep interval has elapsed at `now_ms`.
    /// Live capture also calls this when no packets arrive.
    pub fn tick(&mut self, now_ms: i64, sink: &dyn FlowSink) {
        let Some(last) = self.last_sweep_ms else {
            self.last_sweep_ms = Some(now_ms);
            return;
        };
        if now_ms - last < self.sweep_interval_ms {
            return;
        }
        self.last_sweep_ms = Some(now_ms);

        self.udp.sweep(now_ms, sink);
        if let Some(idle) = self.tcp_idle_ms {
            let flushed = self.tcp.flush_older_than(now_ms - idle, sink);
            if flushed > 0 {
                tracing::debug!(flushed, "TCP idle flush");
            }
        }
        self.defrag.discard_older_than(now_ms - self.fragment_timeout_ms);
    }

    /// Complete every open TCP connection. UDP aggregates may be shared with
    /// other sources and are flushed by the session owner.
    pub fn finish(mut self, sink: &dyn FlowSink) -> IngestStats {
        let flushed = self.tcp.flush_all(sink);
        let tcp = self.tcp.stats();
        tracing::debug!(
            source = %self.source_file,
            flushed,
            completed = tcp.completed,
            discarded = tcp.discarded,
            violations = tcp.violations,
            dropped = tcp.dropped,
            skipped_bytes = tcp.skipped_bytes,
            "TCP engine finished"
        );
        self.stats
    }
}

/// Decode a datagram rebuilt by the defragmenter. TCP and UDP headers must
/// decode here since the fragments arrived whole.
fn decode_reassembled(datagram: &[u8]) -> Result<ParsedPacket<'_>, IngestError> {
    let parsed = protocol::parse_datagram(datagram).map_err(|e| IngestError::Reassembled {
        protocol: IpProtocol::Unknown(datagram.get(9).copied().unwrap_or_default()),
        reason: e.to_string(),
    })?;
    let protocol = parsed.network.protocol();
    if matches!(protocol, IpProtocol::Tcp | IpProtocol::Udp) && parsed.transport.is_none() {
        return Err(IngestError::Reassembled {
            protocol,
            reason: "transport header truncated".into(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FlagTagger;
    use crate::flow::Direction;
    use crate::protocol::tcp::flags::{ACK, FIN, PSH};
    use crate::protocol::testutil::{ethernet, ipv4_header, ipv4_tcp, ipv4_udp, udp_datagram};
    use crate::reassembly::testutil::Collect;
    use pcap::Linktype;

    const CLIENT: ([u8; 4], u16) = ([192, 168, 1, 10], 51000);
    const SERVER: ([u8; 4], u16) = ([192, 168, 1, 20], 8080);

    fn ingest(link: Linktype) -> Ingest {
        Ingest::new(
            link,
            &IngestSettings::default(),
            Arc::new(UdpAggregator::default()),
            "capture.pcap",
        )
    }

    #[test]
    fn out_of_order_response_then_fin() {
        let sink = Collect::default();
        let mut ing = ingest(Linktype::ETHERNET);
        let response = ipv4_tcp(SERVER, CLIENT, 7000, 300, ACK | PSH, b"HTTP/1.1 200 OK\r\n\r\nFLAG{x}");
        let request = ipv4_tcp(CLIENT, SERVER, 300, 7000, ACK | PSH, b"GET / HTTP/1.1\r\n\r\n");
        let fin = ipv4_tcp(CLIENT, SERVER, 318, 7026, FIN | ACK, b"");
        ing.packet(100, &ethernet(0x0800, &response), &sink).unwrap();
        ing.packet(105, &ethernet(0x0800, &request), &sink).unwrap();
        ing.packet(110, &ethernet(0x0800, &fin), &sink).unwrap();
        let stats = ing.finish(&sink);
        assert_eq!(stats.tcp, 3);

        let mut flows = sink.take();
        assert_eq!(flows.len(), 1);
        let entry = &mut flows[0];
        assert_eq!(entry.items.len(), 2);
        assert_eq!(entry.items[0].from, Direction::Server);
        assert_eq!(entry.items[0].timestamp, 100);
        assert_eq!(entry.items[1].from, Direction::Client);
        assert_eq!(entry.source_file, "capture.pcap");

        FlagTagger::new(r"FLAG\{.*\}").unwrap().tag(entry);
        assert_eq!(entry.tags.iter().collect::<Vec<_>>(), vec!["flag-out"]);
    }

    #[test]
    fn fragmented_udp_is_reassembled() {
        let sink = Collect::default();
        let udp = Arc::new(UdpAggregator::default());
        let mut ing = Ingest::new(Linktype::RAW, &IngestSettings::default(), udp.clone(), "f.pcap");

        let dgram = udp_datagram(5353, 53, &[b'q'; 40]);
        let (first, second) = dgram.split_at(24);
        let mut a = ipv4_header([10, 0, 0, 1], [10, 0, 0, 2], 17, first.len());
        a[6] = 0x20; // MF
        a.extend_from_slice(first);
        let mut b = ipv4_header([10, 0, 0, 1], [10, 0, 0, 2], 17, second.len());
        b[7] = 3; // offset 24 bytes
        b.extend_from_slice(second);

        ing.packet(1, &b, &sink).unwrap();
        ing.packet(2, &a, &sink).unwrap();
        assert_eq!(ing.stats().fragments, 2);
        assert_eq!(ing.stats().udp, 1);

        udp.flush_all(&sink);
        let flows = sink.take();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].items[0].payload, vec![b'q'; 40]);
        assert_eq!(flows[0].src.port, 5353);
        // Both fragment frames end up in the flow's pcap, arrival order.
        assert_eq!(flows[0].frames.linktype(), Some(Linktype::RAW.0));
        let frames = flows[0].frames.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, b);
        assert_eq!(frames[1].data, a);
    }

    #[test]
    fn frames_are_dropped_when_not_kept() {
        let sink = Collect::default();
        let udp = Arc::new(UdpAggregator::default());
        let settings = IngestSettings {
            keep_frames: false,
            ..IngestSettings::default()
        };
        let mut ing = Ingest::new(Linktype::RAW, &settings, udp.clone(), "n.pcap");
        ing.packet(1, &ipv4_udp(([10, 0, 0, 1], 1), ([10, 0, 0, 2], 2), b"x"), &sink)
            .unwrap();
        udp.flush_all(&sink);
        let flows = sink.take();
        assert!(flows[0].frames.is_empty());
    }

    #[test]
    fn truncated_reassembly_is_a_typed_error() {
        let sink = Collect::default();
        let mut ing = ingest(Linktype::RAW);
        // Two fragments that together hold only 12 bytes of a TCP header.
        let mut a = ipv4_header([10, 0, 0, 3], [10, 0, 0, 2], 6, 8);
        a[6] = 0x20;
        a.extend_from_slice(&[0, 80, 0, 81, 0, 0, 0, 1]);
        let mut b = ipv4_header([10, 0, 0, 3], [10, 0, 0, 2], 6, 4);
        b[7] = 1;
        b.extend_from_slice(&[0, 0, 0, 0]);

        ing.packet(1, &a, &sink).unwrap();
        assert!(matches!(
            ing.packet(2, &b, &sink),
            Err(IngestError::Reassembled { protocol: IpProtocol::Tcp, .. })
        ));
        assert_eq!(ing.stats().errors, 1);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn udp_idle_sweep_runs_on_capture_clock() {
        let sink = Collect::default();
        let udp = Arc::new(UdpAggregator::default());
        let mut ing = Ingest::new(Linktype::RAW, &IngestSettings::default(), udp.clone(), "u.pcap");
        let a = ([10, 0, 0, 1], 4000);
        let b = ([10, 0, 0, 2], 5000);

        ing.packet(1_000, &ipv4_udp(a, b, b"before"), &sink).unwrap();
        ing.packet(2_000, &ipv4_udp(b, a, b"reply"), &sink).unwrap();
        // 40 s of silence, then the same tuple talks again.
        ing.packet(42_000, &ipv4_udp(a, b, b"after"), &sink).unwrap();

        let first = sink.take();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].items.len(), 2);

        ing.finish(&sink);
        udp.flush_all(&sink);
        let second = sink.take();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].items[0].payload, b"after");
    }

    #[test]
    fn non_ip_and_unknown_protocols_are_counted() {
        let sink = Collect::default();
        let mut ing = ingest(Linktype::ETHERNET);
        ing.packet(1, &ethernet(0x0806, &[0u8; 28]), &sink).unwrap();
        let mut icmp = ipv4_header([10, 0, 0, 1], [10, 0, 0, 2], 1, 8);
        icmp.extend_from_slice(&[8, 0, 0, 0, 0, 1, 0, 1]);
        ing.packet(2, &ethernet(0x0800, &icmp), &sink).unwrap();
        assert_eq!(ing.stats().other, 2);
        assert!(ing.packet(3, &ethernet(0x0800, &[0x45, 0]), &sink).is_err());
    }
}
