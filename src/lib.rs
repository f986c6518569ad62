//! streamscope library crate: flow reconstruction from packet captures.
//!
//! Packets are stripped of their link header, IPv4 fragments are
//! reassembled, TCP segments go through the stream engine and UDP datagrams
//! through the aggregator. Finished flows are HTTP-normalized, flag-tagged
//! and persisted as gzip JSON flow files plus a summary record.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod defrag;
pub mod flow;
pub mod pipeline;
pub mod protocol;
pub mod reassembly;
pub mod store;
