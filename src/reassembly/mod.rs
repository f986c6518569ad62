//! Stream engines: TCP reassembly and UDP pseudo-stream aggregation.
//!
//! Both engines hand finished flows to a [`FlowSink`] synchronously, before
//! the per-connection state is dropped.

pub mod fsm;
pub mod stream;
pub mod tcp;
pub mod udp;

use crate::flow::FlowEntry;

pub use tcp::{TcpAssembler, TcpConfig};
pub use udp::{UdpAggregator, UdpConfig};

/// Receiver of completed flows.
pub trait FlowSink: Send + Sync {
    fn deliver(&self, entry: FlowEntry);
}

impl<F> FlowSink for F
where
    F: Fn(FlowEntry) + Send + Sync,
{
    fn deliver(&self, entry: FlowEntry) {
        self(entry)
    }
}
