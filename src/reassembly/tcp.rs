//! TCP stream engine.
//!
//! One [`Connection`] per directionless 5-tuple, owned by the assembler for
//! its whole life. Segments go through the FSM, then into the half-stream of
//! their direction; released ranges feed the flow builder. A connection
//! completes when both directions are closed, on RST, or when flushed, and
//! is handed to the sink before its state is dropped.

use super::fsm::{Segment, TcpFsm, Violation, WindowCheck};
use super::stream::{HalfStream, DEFAULT_MAX_PENDING_BYTES};
use super::FlowSink;
use crate::flow::{Direction, Endpoint, FlowBuilder, FlowKey, FlowProtocol, FrameRef, DEFAULT_MAX_FLOW_SIZE};
use crate::protocol::tcp::TcpHeader;
use ahash::AHashMap;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Drop segments that violate the FSM or window check.
    pub strict: bool,
    /// Accept connections whose handshake was not captured.
    pub allow_missing_init: bool,
    pub max_flow_size: usize,
    /// Out-of-order bytes buffered per direction before gaps are skipped.
    pub max_pending_bytes: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            strict: false,
            allow_missing_init: true,
            max_flow_size: DEFAULT_MAX_FLOW_SIZE,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpStats {
    pub segments: u64,
    pub violations: u64,
    pub dropped: u64,
    pub completed: u64,
    /// Connections that finished without any payload.
    pub discarded: u64,
    /// Bytes lost to unfilled sequence gaps.
    pub skipped_bytes: u64,
    /// Bytes dropped for preceding the start of their stream.
    pub early_bytes: u64,
}

#[derive(Debug)]
struct Connection {
    fsm: TcpFsm,
    window: WindowCheck,
    /// Indexed by direction: client-sent, server-sent.
    halves: [HalfStream; 2],
    builder: FlowBuilder,
    last_seen_ms: i64,
}

fn half(dir: Direction) -> usize {
    match dir {
        Direction::Client => 0,
        Direction::Server => 1,
    }
}

impl Connection {
    fn new(client: Endpoint, server: Endpoint, config: &TcpConfig) -> Self {
        Connection {
            fsm: TcpFsm::new(config.allow_missing_init),
            window: WindowCheck::default(),
            halves: [
                HalfStream::new(config.max_pending_bytes),
                HalfStream::new(config.max_pending_bytes),
            ],
            builder: FlowBuilder::new(FlowProtocol::Tcp, client, server, config.max_flow_size),
            last_seen_ms: 0,
        }
    }

    fn direction_of(&self, src: Endpoint) -> Direction {
        if src == self.builder.client() {
            Direction::Client
        } else {
            Direction::Server
        }
    }

    fn is_closed(&self) -> bool {
        self.halves.iter().all(HalfStream::is_closed)
    }
}

/// Pick the client of a connection from its first observed segment.
fn roles(src: Endpoint, dst: Endpoint, tcp: &TcpHeader<'_>) -> (Endpoint, Endpoint) {
    if tcp.syn() {
        return if tcp.ack() { (dst, src) } else { (src, dst) };
    }
    if src.port < dst.port {
        (dst, src)
    } else {
        (src, dst)
    }
}

#[derive(Debug)]
pub struct TcpAssembler {
    config: TcpConfig,
    connections: AHashMap<FlowKey, Connection>,
    source_file: String,
    stats: TcpStats,
}

impl TcpAssembler {
    pub fn new(config: TcpConfig) -> Self {
        TcpAssembler {
            config,
            connections: AHashMap::new(),
            source_file: String::new(),
            stats: TcpStats::default(),
        }
    }

    /// Provenance recorded on every flow completed from now on.
    pub fn set_source_file(&mut self, name: impl Into<String>) {
        self.source_file = name.into();
    }

    pub fn active(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> TcpStats {
        self.stats
    }

    /// Feed one segment sent from `src` to `dst`, captured at `ts_ms`.
    /// `frames` are the captured frames that carried it.
    pub fn process(
        &mut self,
        src: Endpoint,
        dst: Endpoint,
        tcp: &TcpHeader<'_>,
        ts_ms: i64,
        frames: &[FrameRef<'_>],
        sink: &dyn FlowSink,
    ) {
        self.stats.segments += 1;
        let (key, _) = FlowKey::new(FlowProtocol::Tcp, src, dst);
        let config = &self.config;
        let conn = self.connections.entry(key).or_insert_with(|| {
            let (client, server) = roles(src, dst, tcp);
            Connection::new(client, server, config)
        });

        let seg = Segment::from_header(tcp);
        let dir = conn.direction_of(src);
        let mut verdict = conn.fsm.advance(&seg, dir);
        if self.config.strict && verdict.is_ok() {
            verdict = conn.window.accept(&seg, dir);
        }
        if let Err(violation) = verdict {
            self.stats.violations += 1;
            if self.config.strict {
                self.stats.dropped += 1;
                tracing::debug!(flow = %key, %dir, %violation, "dropping TCP segment");
                if violation == Violation::MissingHandshake && conn.builder.is_empty() {
                    self.connections.remove(&key);
                }
                return;
            }
            tracing::trace!(flow = %key, %dir, %violation, state = %conn.fsm.state(), "accepting irregular TCP segment");
        }

        conn.last_seen_ms = ts_ms;
        conn.builder.count_packet();
        for frame in frames {
            conn.builder.keep_frame(frame);
        }

        if seg.payload_len > 0 {
            // The peer cannot be waiting for earlier data once this side talks.
            let peer = dir.flip();
            for range in conn.halves[half(peer)].settle() {
                conn.builder.push(peer, &range.data, range.timestamp);
            }
        }

        let stream = &mut conn.halves[half(dir)];
        let mut released = Vec::new();
        let mut data_seq = seg.seq;
        if seg.syn {
            released.extend(stream.syn(seg.seq));
            data_seq = data_seq.wrapping_add(1);
        }
        released.extend(stream.push(data_seq, tcp.payload(), ts_ms));
        if seg.fin {
            released.extend(stream.fin(data_seq.wrapping_add(seg.payload_len as u32)));
        }
        for range in released {
            conn.builder.push(dir, &range.data, range.timestamp);
        }

        if seg.rst || conn.is_closed() {
            if let Some(conn) = self.connections.remove(&key) {
                self.complete(conn, sink);
            }
        }
    }

    /// Complete connections idle since before `cutoff_ms`. Returns how many
    /// were flushed.
    pub fn flush_older_than(&mut self, cutoff_ms: i64, sink: &dyn FlowSink) -> usize {
        let stale: Vec<FlowKey> = self
            .connections
            .iter()
            .filter(|(_, c)| c.last_seen_ms < cutoff_ms)
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            if let Some(conn) = self.connections.remove(key) {
                self.complete(conn, sink);
            }
        }
        stale.len()
    }

    /// Complete every open connection.
    pub fn flush_all(&mut self, sink: &dyn FlowSink) -> usize {
        let open: Vec<Connection> = self.connections.drain().map(|(_, c)| c).collect();
        let count = open.len();
        for conn in open {
            self.complete(conn, sink);
        }
        count
    }

    fn complete(&mut self, mut conn: Connection, sink: &dyn FlowSink) {
        // The direction holding the oldest buffered data goes first.
        let mut order = [Direction::Client, Direction::Server];
        order.sort_by_key(|dir| conn.halves[half(*dir)].oldest_pending().unwrap_or(i64::MAX));
        for dir in order {
            let stream = &mut conn.halves[half(dir)];
            for range in stream.drain_all() {
                conn.builder.push(dir, &range.data, range.timestamp);
            }
            self.stats.skipped_bytes += stream.skipped();
            self.stats.early_bytes += stream.early();
        }

        let client = conn.builder.client();
        let server = conn.builder.server();
        match conn.builder.finish(&self.source_file) {
            Some(entry) => {
                self.stats.completed += 1;
                tracing::trace!(%client, %server, items = entry.items.len(), bytes = entry.total_size, "TCP flow complete");
                sink.deliver(entry);
            }
            None => {
                self.stats.discarded += 1;
                tracing::trace!(%client, %server, "discarding empty TCP connection");
            }
        }
    }
}
