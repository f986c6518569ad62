//! Zero-copy packet parsing from the link layer down to TCP/UDP.
//!
//! Parsing is split in two steps so the defragmenter can sit between them:
//! [`network_slice`] strips the link header for the capture's link type, and
//! [`parse_network`] / [`parse_transport`] decode the IP datagram that comes
//! out of it (either the original slice or a reassembled buffer).

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod link;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::IpAddr;

pub use link::LinkType;

/// EtherType constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    VlanTagged,
    QinQ,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            0x8100 => EtherType::VlanTagged,
            0x88A8 | 0x9100 => EtherType::QinQ,
            other => EtherType::Unknown(other),
        }
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EtherType::Ipv4 => write!(f, "IPv4"),
            EtherType::Ipv6 => write!(f, "IPv6"),
            EtherType::Arp => write!(f, "ARP"),
            EtherType::VlanTagged => write!(f, "802.1Q VLAN"),
            EtherType::QinQ => write!(f, "802.1ad QinQ"),
            EtherType::Unknown(v) => write!(f, "Unknown(0x{:04x})", v),
        }
    }
}

/// IP protocol numbers the reassembly engines care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Tcp,
    Udp,
    Unknown(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Unknown(other),
        }
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Unknown(v) => write!(f, "Proto({})", v),
        }
    }
}

/// Errors from protocol parsing
#[derive(Debug)]
pub enum ParseError {
    /// Not enough bytes to parse the header
    TooShort { expected: usize, actual: usize },
    /// Invalid header values
    InvalidHeader(String),
    /// Capture link type we do not decode
    UnsupportedLink(i32),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "packet too short: need {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
            ParseError::UnsupportedLink(dlt) => write!(f, "unsupported link type {}", dlt),
        }
    }
}

impl std::error::Error for ParseError {}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), ParseError> {
    if data.len() < needed {
        return Err(ParseError::TooShort {
            expected: needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Network layer header
#[derive(Debug)]
pub enum NetworkHeader<'a> {
    Ipv4(ipv4::Ipv4Header<'a>),
    Ipv6(ipv6::Ipv6Header<'a>),
}

impl<'a> NetworkHeader<'a> {
    pub fn src_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::Ipv4(h) => IpAddr::V4(h.src_addr()),
            NetworkHeader::Ipv6(h) => IpAddr::V6(h.src_addr()),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match self {
            NetworkHeader::Ipv4(h) => IpAddr::V4(h.dst_addr()),
            NetworkHeader::Ipv6(h) => IpAddr::V6(h.dst_addr()),
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        match self {
            NetworkHeader::Ipv4(h) => h.protocol(),
            NetworkHeader::Ipv6(h) => h.next_header(),
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        match self {
            NetworkHeader::Ipv4(h) => h.payload(),
            NetworkHeader::Ipv6(h) => h.payload(),
        }
    }
}

/// Transport layer header
#[derive(Debug)]
pub enum TransportHeader<'a> {
    Tcp(tcp::TcpHeader<'a>),
    Udp(udp::UdpHeader<'a>),
}

/// A decoded IP datagram, referencing the buffer it was parsed from.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub network: NetworkHeader<'a>,
    pub transport: Option<TransportHeader<'a>>,
    pub payload: &'a [u8],
}

/// Strip the link-layer header. Returns `None` for frames that do not carry IP.
pub fn network_slice(link: LinkType, frame: &[u8]) -> Result<Option<&[u8]>, ParseError> {
    match link {
        LinkType::Ethernet => {
            let eth = ethernet::EthernetHeader::parse(frame)?;
            let (ether_type, rest) = eth.untagged()?;
            Ok(match ether_type {
                EtherType::Ipv4 | EtherType::Ipv6 => Some(rest),
                _ => None,
            })
        }
        LinkType::Raw | LinkType::Ipv4 | LinkType::Ipv6 => Ok(Some(frame)),
        LinkType::LinuxSll => link::sll_payload(frame),
        LinkType::Null | LinkType::Loop => link::loopback_payload(frame),
        LinkType::Unsupported(dlt) => Err(ParseError::UnsupportedLink(dlt)),
    }
}

/// Decode an IPv4 or IPv6 header, picking the version from the first nibble.
pub fn parse_network(data: &[u8]) -> Result<NetworkHeader<'_>, ParseError> {
    ensure_len(data, 1)?;
    match data[0] >> 4 {
        4 => Ok(NetworkHeader::Ipv4(ipv4::Ipv4Header::parse(data)?)),
        6 => Ok(NetworkHeader::Ipv6(ipv6::Ipv6Header::parse(data)?)),
        v => Err(ParseError::InvalidHeader(format!("unknown IP version {}", v))),
    }
}

/// Decode the TCP/UDP header carried by `network`. Other protocols and
/// truncated headers yield `None` with the raw network payload.
pub fn parse_transport<'a>(
    network: &NetworkHeader<'a>,
) -> (Option<TransportHeader<'a>>, &'a [u8]) {
    let l4 = network.payload();
    match network.protocol() {
        IpProtocol::Tcp => match tcp::TcpHeader::parse(l4) {
            Ok(hdr) => {
                let payload = hdr.payload();
                (Some(TransportHeader::Tcp(hdr)), payload)
            }
            Err(_) => (None, l4),
        },
        IpProtocol::Udp => match udp::UdpHeader::parse(l4) {
            Ok(hdr) => {
                let payload = hdr.payload();
                (Some(TransportHeader::Udp(hdr)), payload)
            }
            Err(_) => (None, l4),
        },
        IpProtocol::Unknown(_) => (None, l4),
    }
}

/// Decode an already link-stripped IP datagram in one call.
pub fn parse_datagram(data: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    let network = parse_network(data)?;
    let (transport, payload) = parse_transport(&network);
    Ok(ParsedPacket {
        network,
        transport,
        payload,
    })
}

/// Parse a complete frame without defragmentation.
/// Non-IP frames return `Ok(None)`.
pub fn parse_packet(link: LinkType, frame: &[u8]) -> Result<Option<ParsedPacket<'_>>, ParseError> {
    match network_slice(link, frame)? {
        Some(ip) => parse_datagram(ip).map(Some),
        None => Ok(None),
    }
}
