//! Zero-copy IPv4 header view.
//!
//! IPv4 header layout (20-60 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |Version|  IHL  |Type of Service|          Total Length         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |         Identification        |Flags|      Fragment Offset    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  Time to Live |    Protocol   |         Header Checksum       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                       Source Address                          |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Destination Address                        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                    Options                    |    Padding    |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! Only the fields the reassembly path needs are exposed: addresses,
//! protocol, total length and the fragmentation triple (identification,
//! MF flag, offset). The payload is bounded by `total_length`, so Ethernet
//! padding never leaks into a stream.
//!
//! The checksum is never verified: captures routinely contain packets with
//! offloaded (unset) checksums.

use super::{ensure_len, IpProtocol, ParseError};
use std::net::Ipv4Addr;

/// Minimum IPv4 header length (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Zero-copy IPv4 header.
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    /// Parse an IPv4 header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_len(data, IPV4_MIN_HEADER_LEN)?;

        let version = (data[0] >> 4) & 0x0F;
        if version != 4 {
            return Err(ParseError::InvalidHeader(format!(
                "expected IPv4 (version 4), got version {}",
                version
            )));
        }

        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::InvalidHeader(format!(
                "IHL too small: {} (min 5)",
                header_len / 4
            )));
        }
        ensure_len(data, header_len)?;

        Ok(Ipv4Header { data, header_len })
    }

    /// Header length in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Raw header bytes, options included.
    #[inline]
    pub fn header_bytes(&self) -> &'a [u8] {
        &self.data[..self.header_len]
    }

    /// Total length of the IP packet (header + payload) in bytes.
    #[inline]
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Identification field (fragment group id).
    #[inline]
    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    /// MF flag.
    #[inline]
    pub fn more_fragments(&self) -> bool {
        (self.data[6] >> 5) & 1 == 1
    }

    /// Fragment offset in 8-byte units.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.data[6] & 0x1F, self.data[7]])
    }

    /// True when this datagram is one piece of a fragmented original.
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Protocol of the payload.
    #[inline]
    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.data[9])
    }

    #[inline]
    pub fn protocol_raw(&self) -> u8 {
        self.data[9]
    }

    /// Source address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    /// Destination address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    /// Payload after the IPv4 header.
    /// Clamped to `total_length - header_len` to avoid reading trailer bytes.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let total = self.total_length() as usize;
        let payload_len = total.saturating_sub(self.header_len);
        let available = self.data.len() - self.header_len;
        let end = self.header_len + payload_len.min(available);
        &self.data[self.header_len..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ipv4_header() -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45; // Version=4, IHL=5
        pkt[3] = 0x28; // Total length = 40
        pkt[4] = 0xab;
        pkt[5] = 0xcd; // Identification
        pkt[6] = 0x40; // Don't Fragment, offset=0
        pkt[8] = 64;
        pkt[9] = 6; // Protocol = TCP
        pkt[12..16].copy_from_slice(&[192, 168, 1, 100]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(&[0u8; 20]);
        pkt
    }

    #[test]
    fn parse_valid_ipv4() {
        let pkt = make_ipv4_header();
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.header_len(), 20);
        assert_eq!(hdr.total_length(), 40);
        assert_eq!(hdr.identification(), 0xabcd);
        assert_eq!(hdr.protocol(), IpProtocol::Tcp);
        assert_eq!(hdr.src_addr(), Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(hdr.dst_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(!hdr.is_fragment());
        assert_eq!(hdr.payload().len(), 20);
    }

    #[test]
    fn payload_ignores_ethernet_padding() {
        let mut pkt = make_ipv4_header();
        pkt.extend_from_slice(&[0xEE; 6]);
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert_eq!(hdr.payload().len(), 20);
    }

    #[test]
    fn detects_fragments() {
        let mut pkt = make_ipv4_header();
        pkt[6] = 0x20; // MF
        assert!(Ipv4Header::parse(&pkt).unwrap().is_fragment());
        pkt[6] = 0x00;
        pkt[7] = 0x03; // offset 3 * 8
        let hdr = Ipv4Header::parse(&pkt).unwrap();
        assert!(hdr.is_fragment());
        assert_eq!(hdr.fragment_offset(), 3);
    }

    #[test]
    fn reject_too_short_packet() {
        let pkt = [0u8; 19];
        assert!(Ipv4Header::parse(&pkt).is_err());
    }

    #[test]
    fn reject_wrong_version() {
        let mut pkt = [0u8; 20];
        pkt[0] = 0x65;
        assert!(Ipv4Header::parse(&pkt).is_err());
    }
}
