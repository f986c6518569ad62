//! Zero-copy Ethernet frame parser.
//!
//! An Ethernet frame has the following layout:
//!   - Destination MAC: 6 bytes
//!   - Source MAC:      6 bytes
//!   - EtherType:       2 bytes
//!   - Payload:         variable
//!
//! 802.1Q and 802.1ad (QinQ) tags sit between the source MAC and the inner
//! EtherType, 4 bytes each; [`EthernetHeader::untagged`] walks past them.

use super::{ensure_len, EtherType, ParseError};

/// Minimum Ethernet header length (no VLAN tags)
pub const ETH_HEADER_LEN: usize = 14;

/// Tag stacks deeper than this are treated as malformed.
const MAX_VLAN_DEPTH: usize = 4;

/// Zero-copy Ethernet header that borrows from the packet buffer.
#[derive(Debug)]
pub struct EthernetHeader<'a> {
    data: &'a [u8],
}

impl<'a> EthernetHeader<'a> {
    /// Parse an Ethernet header from a byte slice.
    pub fn parse(data: &'a [u8]) -> Result<Self, ParseError> {
        ensure_len(data, ETH_HEADER_LEN)?;
        Ok(EthernetHeader { data })
    }

    /// Outer EtherType field.
    #[inline]
    pub fn ether_type(&self) -> EtherType {
        EtherType::from(u16::from_be_bytes([self.data[12], self.data[13]]))
    }

    /// The payload after the Ethernet header.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        &self.data[ETH_HEADER_LEN..]
    }

    /// Inner EtherType and payload once every VLAN tag is stripped.
    pub fn untagged(&self) -> Result<(EtherType, &'a [u8]), ParseError> {
        let mut ether_type = self.ether_type();
        let mut rest = self.payload();
        let mut depth = 0;
        while matches!(ether_type, EtherType::VlanTagged | EtherType::QinQ) {
            depth += 1;
            if depth > MAX_VLAN_DEPTH {
                return Err(ParseError::InvalidHeader("VLAN tag stack too deep".into()));
            }
            ensure_len(rest, 4)?;
            ether_type = EtherType::from(u16::from_be_bytes([rest[2], rest[3]]));
            rest = &rest[4..];
        }
        Ok((ether_type, rest))
    }
}
