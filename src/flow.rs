//! Flow data model and the direction-consolidating builder shared by the TCP
//! and UDP engines.

use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Per-flow byte ceiling: the storage document limit minus reserved overhead.
pub const DEFAULT_MAX_FLOW_SIZE: usize = 6_000_000 - 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => write!(f, "tcp"),
            FlowProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Which side of the canonical key a packet was sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    A,
    B,
}

/// Direction-independent flow key: both directions of a conversation map to
/// the same key, with endpoints in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub a: Endpoint,
    pub b: Endpoint,
}

impl FlowKey {
    pub fn new(protocol: FlowProtocol, src: Endpoint, dst: Endpoint) -> (Self, KeySide) {
        if endpoint_key(&src) <= endpoint_key(&dst) {
            (FlowKey { protocol, a: src, b: dst }, KeySide::A)
        } else {
            (FlowKey { protocol, a: dst, b: src }, KeySide::B)
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.a, self.b)
    }
}

fn endpoint_key(endpoint: &Endpoint) -> (u8, [u8; 16], u16) {
    match endpoint.ip {
        IpAddr::V4(addr) => {
            let mut bytes = [0u8; 16];
            bytes[12..].copy_from_slice(&addr.octets());
            (4, bytes, endpoint.port)
        }
        IpAddr::V6(addr) => (6, addr.octets(), endpoint.port),
    }
}

/// Producer of a chunk relative to the flow's initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "c")]
    Client,
    #[serde(rename = "s")]
    Server,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Client => write!(f, "client"),
            Direction::Server => write!(f, "server"),
        }
    }
}

/// One contiguous directional chunk of application data.
///
/// `payload` is the only copy of the bytes; on disk it is base64 so that
/// arbitrary binary survives the JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowItem {
    #[serde(rename = "f")]
    pub from: Direction,
    #[serde(rename = "b", with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Capture time in milliseconds since the epoch.
    #[serde(rename = "t")]
    pub timestamp: i64,
}

impl FlowItem {
    pub fn new(from: Direction, payload: Vec<u8>, timestamp: i64) -> Self {
        FlowItem {
            from,
            payload,
            timestamp,
        }
    }

    /// Display projection: printable ASCII kept, everything else as `.`.
    pub fn printable(&self) -> String {
        self.payload
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' || b == b'\n' || b == b'\r' || b == b'\t' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect()
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A completed flow, ready for normalization, tagging and persistence.
#[derive(Debug, Clone, Serialize)]
pub struct FlowEntry {
    pub protocol: FlowProtocol,
    /// Client endpoint.
    pub src: Endpoint,
    /// Server endpoint.
    pub dst: Endpoint,
    /// Earliest capture time of the flow's data (ms).
    pub time: i64,
    /// Latest capture time minus `time` (ms).
    pub duration: i64,
    pub packet_count: u64,
    /// Reserved; never set by the core.
    pub blocked: bool,
    pub items: Vec<FlowItem>,
    pub tags: BTreeSet<String>,
    pub total_size: usize,
    pub source_file: String,
    /// Captured frames, kept for the per-flow pcap.
    #[serde(skip)]
    pub frames: FrameLog,
}

impl FlowEntry {
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.contains(tag) {
            self.tags.insert(tag.to_owned());
        }
    }
}

/// A captured frame as handed to the stream engines.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    /// pcap data link type of `data`.
    pub linktype: i32,
    pub ts_ms: i64,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub ts_ms: i64,
    pub data: Vec<u8>,
}

/// The frames of one flow in arrival order, all of one link type.
///
/// Frames of another link type than the first (a UDP aggregate fed by two
/// interfaces) are left out, and so is everything past the byte limit.
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    linktype: Option<i32>,
    frames: Vec<RawFrame>,
    bytes: usize,
}

impl FrameLog {
    pub fn linktype(&self) -> Option<i32> {
        self.linktype
    }

    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn push(&mut self, frame: &FrameRef<'_>, max_bytes: usize) {
        if *self.linktype.get_or_insert(frame.linktype) != frame.linktype {
            return;
        }
        if self.bytes + frame.data.len() > max_bytes {
            return;
        }
        self.bytes += frame.data.len();
        self.frames.push(RawFrame {
            ts_ms: frame.ts_ms,
            data: frame.data.to_vec(),
        });
    }
}

/// Accumulates directional byte ranges for one flow.
///
/// Consecutive ranges in the same direction are appended to the last item.
/// Bytes beyond `max_size` are dropped without error.
#[derive(Debug)]
pub struct FlowBuilder {
    protocol: FlowProtocol,
    client: Endpoint,
    server: Endpoint,
    items: Vec<FlowItem>,
    total_size: usize,
    packet_count: u64,
    max_size: usize,
    truncated: bool,
    tags: BTreeSet<String>,
    /// Earliest and latest capture time of the kept ranges.
    span: Option<(i64, i64)>,
    frames: FrameLog,
}

impl FlowBuilder {
    pub fn new(protocol: FlowProtocol, client: Endpoint, server: Endpoint, max_size: usize) -> Self {
        FlowBuilder {
            protocol,
            client,
            server,
            items: Vec::new(),
            total_size: 0,
            packet_count: 0,
            max_size,
            truncated: false,
            tags: BTreeSet::new(),
            span: None,
            frames: FrameLog::default(),
        }
    }

    pub fn client(&self) -> Endpoint {
        self.client
    }

    pub fn server(&self) -> Endpoint {
        self.server
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_packet(&mut self) {
        self.packet_count += 1;
    }

    pub fn tag(&mut self, tag: &str) {
        self.tags.insert(tag.to_string());
    }

    /// Keep a copy of a frame of this flow, within the byte ceiling.
    pub fn keep_frame(&mut self, frame: &FrameRef<'_>) {
        self.frames.push(frame, self.max_size);
    }

    /// Append a range. Returns the number of bytes kept.
    pub fn push(&mut self, from: Direction, data: &[u8], timestamp: i64) -> usize {
        if data.is_empty() {
            return 0;
        }
        let room = self.max_size.saturating_sub(self.total_size);
        let keep = data.len().min(room);
        if keep < data.len() && !self.truncated {
            self.truncated = true;
            tracing::debug!(
                client = %self.client,
                server = %self.server,
                limit = self.max_size,
                "flow reached size ceiling, truncating"
            );
        }
        if keep == 0 {
            return 0;
        }

        let chunk = &data[..keep];
        self.span = Some(match self.span {
            Some((first, last)) => (first.min(timestamp), last.max(timestamp)),
            None => (timestamp, timestamp),
        });
        match self.items.last_mut() {
            Some(last) if last.from == from => last.payload.extend_from_slice(chunk),
            _ => self.items.push(FlowItem::new(from, chunk.to_vec(), timestamp)),
        }
        self.total_size += keep;
        keep
    }

    /// Materialize the entry. Items stay in release order; `time` and
    /// `duration` span the capture times of every kept range. An empty
    /// builder yields `None`.
    pub fn finish(self, source_file: &str) -> Option<FlowEntry> {
        let (time, last) = self.span?;
        Some(FlowEntry {
            protocol: self.protocol,
            src: self.client,
            dst: self.server,
            time,
            duration: last - time,
            packet_count: self.packet_count,
            blocked: false,
            items: self.items,
            tags: self.tags,
            total_size: self.total_size,
            source_file: source_file.to_string(),
            frames: self.frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 40000),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
        )
    }

    fn builder(max: usize) -> FlowBuilder {
        let (c, s) = endpoints();
        FlowBuilder::new(FlowProtocol::Tcp, c, s, max)
    }

    #[test]
    fn flow_key_is_directionless() {
        let (a, b) = endpoints();
        let (key_ab, side_ab) = FlowKey::new(FlowProtocol::Tcp, a, b);
        let (key_ba, side_ba) = FlowKey::new(FlowProtocol::Tcp, b, a);
        assert_eq!(key_ab, key_ba);
        assert_ne!(side_ab, side_ba);
    }

    #[test]
    fn flow_key_orders_ipv4_before_ipv6() {
        let v4 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 443);
        let v6 = Endpoint::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
        let (key, side) = FlowKey::new(FlowProtocol::Udp, v6, v4);
        assert_eq!(key.a, v4);
        assert_eq!(side, KeySide::B);
    }

    #[test]
    fn same_direction_ranges_are_merged() {
        let mut b = builder(DEFAULT_MAX_FLOW_SIZE);
        b.push(Direction::Client, b"GET ", 1);
        b.push(Direction::Client, b"/ HTTP/1.1\r\n\r\n", 2);
        b.push(Direction::Server, b"HTTP/1.1 200 OK\r\n\r\n", 3);
        b.push(Direction::Client, b"GET /2", 4);
        let entry = b.finish("a.pcap").unwrap();
        assert_eq!(entry.items.len(), 3);
        assert_eq!(entry.items[0].payload, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(entry.items[0].timestamp, 1);
        assert_eq!(entry.time, 1);
        assert_eq!(entry.duration, 3);
        for pair in entry.items.windows(2) {
            assert_ne!(pair[0].from, pair[1].from);
        }
    }

    #[test]
    fn zero_length_range_is_noop() {
        let mut b = builder(100);
        assert_eq!(b.push(Direction::Client, b"", 5), 0);
        assert!(b.is_empty());
        assert!(b.finish("x").is_none());
    }

    #[test]
    fn ceiling_truncates_silently() {
        let mut b = builder(10);
        assert_eq!(b.push(Direction::Client, b"0123456", 1), 7);
        assert_eq!(b.push(Direction::Server, b"abcdef", 2), 3);
        assert_eq!(b.push(Direction::Client, b"more", 3), 0);
        let entry = b.finish("x").unwrap();
        assert_eq!(entry.total_size, 10);
        assert_eq!(entry.items.len(), 2);
        assert_eq!(entry.items[1].payload, b"abc");
    }

    #[test]
    fn finish_keeps_release_order() {
        let mut b = builder(1000);
        b.push(Direction::Client, b"FIRST", 20);
        // Buffered range released after the gap closed, older capture time.
        b.push(Direction::Client, b"LATER", 10);
        b.push(Direction::Server, b"reply", 30);
        let entry = b.finish("x").unwrap();
        assert_eq!(entry.items.len(), 2);
        assert_eq!(entry.items[0].payload, b"FIRSTLATER");
        assert_eq!(entry.items[0].timestamp, 20);
        assert_eq!(entry.items[1].from, Direction::Server);
        assert_eq!(entry.time, 10);
        assert_eq!(entry.duration, 20);
    }

    #[test]
    fn frames_share_one_link_type_and_the_ceiling() {
        let mut b = builder(10);
        let frame = |linktype, data: &'static [u8]| FrameRef {
            linktype,
            ts_ms: 5,
            data,
        };
        b.keep_frame(&frame(1, b"012345"));
        b.keep_frame(&frame(101, b"ab"));
        b.keep_frame(&frame(1, b"6789"));
        b.keep_frame(&frame(1, b"x"));
        b.push(Direction::Client, b"data", 5);
        let entry = b.finish("x").unwrap();
        assert_eq!(entry.frames.linktype(), Some(1));
        let kept: Vec<&[u8]> = entry.frames.frames().iter().map(|f| f.data.as_slice()).collect();
        assert_eq!(kept, vec![&b"012345"[..], &b"6789"[..]]);
    }

    #[test]
    fn payload_round_trips_binary_bytes() {
        let payload: Vec<u8> = (0..=255u8).rev().collect();
        let item = FlowItem::new(Direction::Server, payload.clone(), 1234);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"f\":\"s\""));
        let back: FlowItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, payload);
        assert_eq!(back.timestamp, 1234);
    }

    #[test]
    fn printable_masks_binary() {
        let item = FlowItem::new(Direction::Client, vec![b'o', b'k', 0x00, 0xff], 0);
        assert_eq!(item.printable(), "ok..");
    }
}
