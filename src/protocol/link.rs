//! Capture link types and the non-Ethernet link headers.

use super::{ensure_len, EtherType, ParseError};

/// Linux cooked capture (SLL) header length.
pub const SLL_HEADER_LEN: usize = 16;

/// BSD loopback / NULL encapsulation header length.
pub const LOOPBACK_HEADER_LEN: usize = 4;

/// Data link types as reported by the pcap file or live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// DLT_NULL (0): 4-byte address family in host byte order.
    Null,
    /// DLT_EN10MB (1)
    Ethernet,
    /// DLT_RAW (12 on OpenBSD, 14 elsewhere, 101 as LINKTYPE_RAW)
    Raw,
    /// DLT_LOOP (108): 4-byte address family in network byte order.
    Loop,
    /// DLT_LINUX_SLL (113)
    LinuxSll,
    /// LINKTYPE_IPV4 (228)
    Ipv4,
    /// LINKTYPE_IPV6 (229)
    Ipv6,
    Unsupported(i32),
}

impl From<i32> for LinkType {
    fn from(value: i32) -> Self {
        match value {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            12 | 14 | 101 => LinkType::Raw,
            108 => LinkType::Loop,
            113 => LinkType::LinuxSll,
            228 => LinkType::Ipv4,
            229 => LinkType::Ipv6,
            other => LinkType::Unsupported(other),
        }
    }
}

impl From<pcap::Linktype> for LinkType {
    fn from(value: pcap::Linktype) -> Self {
        LinkType::from(value.0)
    }
}

/// Payload of a Linux cooked capture frame when it carries IP.
pub fn sll_payload(frame: &[u8]) -> Result<Option<&[u8]>, ParseError> {
    ensure_len(frame, SLL_HEADER_LEN)?;
    let proto = EtherType::from(u16::from_be_bytes([frame[14], frame[15]]));
    Ok(match proto {
        EtherType::Ipv4 | EtherType::Ipv6 => Some(&frame[SLL_HEADER_LEN..]),
        _ => None,
    })
}

/// Payload of a NULL/LOOP frame. The family word differs in byte order and
/// per platform for IPv6, so the IP version nibble decides instead.
pub fn loopback_payload(frame: &[u8]) -> Result<Option<&[u8]>, ParseError> {
    ensure_len(frame, LOOPBACK_HEADER_LEN + 1)?;
    let rest = &frame[LOOPBACK_HEADER_LEN..];
    Ok(match rest[0] >> 4 {
        4 | 6 => Some(rest),
        _ => None,
    })
}
