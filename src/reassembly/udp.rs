//! UDP pseudo-stream aggregation.
//!
//! Datagrams are grouped by directionless 4-tuple. The table sits behind one
//! mutex so that several capture paths can share it; the lock covers lookup,
//! insert and eviction only. Evicted aggregates are finished and delivered
//! after the lock is released.

use super::FlowSink;
use crate::flow::{
    Direction, Endpoint, FlowBuilder, FlowKey, FlowProtocol, FrameRef, DEFAULT_MAX_FLOW_SIZE,
};
use ahash::AHashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Tag carried by every UDP flow.
pub const UDP_TAG: &str = "UDP";

pub const DEFAULT_UDP_IDLE_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Aggregates silent for longer than this are finalized by the sweep.
    pub idle_ms: i64,
    pub max_flow_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            idle_ms: DEFAULT_UDP_IDLE_MS,
            max_flow_size: DEFAULT_MAX_FLOW_SIZE,
        }
    }
}

#[derive(Debug)]
struct UdpAggregate {
    builder: FlowBuilder,
    last_seen_ms: i64,
    source_file: String,
}

#[derive(Debug, Default)]
pub struct UdpAggregator {
    config: UdpConfig,
    table: Mutex<AHashMap<FlowKey, UdpAggregate>>,
}

impl UdpAggregator {
    pub fn new(config: UdpConfig) -> Self {
        UdpAggregator {
            config,
            table: Mutex::new(AHashMap::new()),
        }
    }

    pub fn idle_ms(&self) -> i64 {
        self.config.idle_ms
    }

    fn lock(&self) -> MutexGuard<'_, AHashMap<FlowKey, UdpAggregate>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    /// Attach a datagram and the frames that carried it to its aggregate,
    /// creating one if needed. The sender of the first datagram is recorded
    /// as the client.
    pub fn process(
        &self,
        src: Endpoint,
        dst: Endpoint,
        payload: &[u8],
        ts_ms: i64,
        frames: &[FrameRef<'_>],
        source_file: &str,
    ) {
        let (key, _) = FlowKey::new(FlowProtocol::Udp, src, dst);
        let mut table = self.lock();
        let agg = table.entry(key).or_insert_with(|| {
            let mut builder = FlowBuilder::new(FlowProtocol::Udp, src, dst, self.config.max_flow_size);
            builder.tag(UDP_TAG);
            UdpAggregate {
                builder,
                last_seen_ms: ts_ms,
                source_file: source_file.to_string(),
            }
        });

        let dir = if src == agg.builder.client() {
            Direction::Client
        } else {
            Direction::Server
        };
        agg.builder.count_packet();
        for frame in frames {
            agg.builder.keep_frame(frame);
        }
        agg.builder.push(dir, payload, ts_ms);
        agg.last_seen_ms = agg.last_seen_ms.max(ts_ms);
    }

    /// Finalize aggregates idle for longer than the configured window as of
    /// `now_ms`. Returns the number evicted.
    pub fn sweep(&self, now_ms: i64, sink: &dyn FlowSink) -> usize {
        let cutoff = now_ms - self.config.idle_ms;
        let expired: Vec<UdpAggregate> = {
            let mut table = self.lock();
            let keys: Vec<FlowKey> = table
                .iter()
                .filter(|(_, agg)| agg.last_seen_ms < cutoff)
                .map(|(k, _)| *k)
                .collect();
            keys.iter().filter_map(|k| table.remove(k)).collect()
        };
        let count = expired.len();
        if count > 0 {
            tracing::debug!(evicted = count, "UDP idle sweep");
        }
        for agg in expired {
            finish(agg, sink);
        }
        count
    }

    /// Finalize every aggregate unconditionally.
    pub fn flush_all(&self, sink: &dyn FlowSink) -> usize {
        let all: Vec<UdpAggregate> = self.lock().drain().map(|(_, agg)| agg).collect();
        let count = all.len();
        for agg in all {
            finish(agg, sink);
        }
        count
    }
}

fn finish(agg: UdpAggregate, sink: &dyn FlowSink) {
    if let Some(entry) = agg.builder.finish(&agg.source_file) {
        sink.deliver(entry);
    }
}
