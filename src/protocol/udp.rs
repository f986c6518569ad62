//! Zero-copy UDP header view.
//!
//! UDP header layout (8 bytes, fixed):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |          Source Port          |       Destination Port        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |            Length             |           Checksum            |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use super::{ensure_len, ParseError};

/// UDP header is always exactly 8 bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// Zero-copy UDP header.
#[derive(Debug)]
pub struct UdpHeader<'a> {
    data: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    /// Parse a UDP header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_len(data, UDP_HEADER_LEN)?;
        Ok(UdpHeader { data })
    }

    /// Source port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.data[0], self.data[1]])
    }

    /// Destination port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// Total length of UDP datagram (header + payload) in bytes.
    #[inline]
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    /// Payload, clamped to the declared length.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let payload_len = (self.length() as usize).saturating_sub(UDP_HEADER_LEN);
        let available = self.data.len() - UDP_HEADER_LEN;
        &self.data[UDP_HEADER_LEN..UDP_HEADER_LEN + payload_len.min(available)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_udp() {
        let mut pkt = vec![0u8; 8];
        pkt[1] = 0x35; // src port = 53
        pkt[2] = 0xC0; // dst port = 49152
        pkt[5] = 0x1C; // length = 28
        pkt.extend_from_slice(&[0xAB; 20]);

        let hdr = UdpHeader::parse(&pkt).unwrap();
        assert_eq!(hdr.src_port(), 53);
        assert_eq!(hdr.dst_port(), 49152);
        assert_eq!(hdr.payload().len(), 20);
    }

    #[test]
    fn short_declared_length_clamps_payload() {
        let mut pkt = vec![0u8; 8];
        pkt[5] = 10;
        pkt.extend_from_slice(&[1, 2, 3, 4]);
        let hdr = UdpHeader::parse(&pkt).unwrap();
        assert_eq!(hdr.payload(), &[1, 2]);
    }

    #[test]
    fn reject_short_udp() {
        let pkt = [0u8; 7];
        assert!(UdpHeader::parse(&pkt).is_err());
    }
}
