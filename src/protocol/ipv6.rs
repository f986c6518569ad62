//! Zero-copy view of the IPv6 fixed header.
//!
//! IPv6 fixed header layout (40 bytes):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |Version| Traffic Class |           Flow Label                  |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |         Payload Length        |  Next Header  |   Hop Limit   |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                         Source Address                        |
//!  |                          (128 bits)                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                      Destination Address                      |
//!  |                          (128 bits)                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! Extension headers (including the fragment header) are not walked, so
//! fragmented IPv6 traffic never reaches the stream engines.

use super::{ensure_len, IpProtocol, ParseError};
use std::net::Ipv6Addr;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

/// Zero-copy IPv6 header.
#[derive(Debug)]
pub struct Ipv6Header<'a> {
    data: &'a [u8],
}

impl<'a> Ipv6Header<'a> {
    /// Parse an IPv6 fixed header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_len(data, IPV6_HEADER_LEN)?;

        let version = (data[0] >> 4) & 0x0F;
        if version != 6 {
            return Err(ParseError::InvalidHeader(format!(
                "expected IPv6 (version 6), got version {}",
                version
            )));
        }

        Ok(Ipv6Header { data })
    }

    /// Payload length (not including the 40-byte fixed header).
    #[inline]
    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    /// Next header (protocol of the payload when no extension follows).
    #[inline]
    pub fn next_header(&self) -> IpProtocol {
        IpProtocol::from(self.data[6])
    }

    /// Source address.
    #[inline]
    pub fn src_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[8..24]);
        Ipv6Addr::from(octets)
    }

    /// Destination address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&self.data[24..40]);
        Ipv6Addr::from(octets)
    }

    /// Payload after the fixed header, clamped to the payload length.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let payload_len = self.payload_length() as usize;
        let available = self.data.len() - IPV6_HEADER_LEN;
        let end = IPV6_HEADER_LEN + payload_len.min(available);
        &self.data[IPV6_HEADER_LEN..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ipv6_header(next_header: u8) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[5] = 0x14; // Payload length = 20
        pkt[6] = next_header;
        pkt[7] = 64;
        pkt[23] = 1; // ::1
        pkt[39] = 2; // ::2
        pkt.extend_from_slice(&[0u8; 20]);
        pkt
    }

    #[test]
    fn parse_valid_ipv6() {
        let pkt = make_ipv6_header(6);
        let hdr = Ipv6Header::parse(&pkt).unwrap();
        assert_eq!(hdr.payload_length(), 20);
        assert_eq!(hdr.next_header(), IpProtocol::Tcp);
        assert_eq!(hdr.src_addr(), Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(hdr.dst_addr(), Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 2));
        assert_eq!(hdr.payload().len(), 20);
    }

    #[test]
    fn fragment_header_is_not_walked() {
        let pkt = make_ipv6_header(44);
        let hdr = Ipv6Header::parse(&pkt).unwrap();
        assert_eq!(hdr.next_header(), IpProtocol::Unknown(44));
    }

    #[test]
    fn reject_too_short_ipv6() {
        let pkt = [0x60; 39];
        assert!(Ipv6Header::parse(&pkt).is_err());
    }
}
