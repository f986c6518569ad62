//! pcap handles: live interfaces, capture files and device discovery.

use crate::protocol::LinkType;
use crate::store::StoreError;
use pcap::{Active, Activated, Capture, Device, Offline};
use std::fmt;
use std::path::Path;

/// Errors that abort one capture attempt.
#[derive(Debug)]
pub enum CaptureError {
    /// Failed to find a suitable network device.
    NoDevice(String),
    /// pcap error (open, filter, read).
    Pcap(pcap::Error),
    /// The capture's link type is not decoded.
    UnsupportedLink(i32),
    Io(std::io::Error),
    Store(StoreError),
    /// Directory watch could not be set up.
    Watch(notify::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoDevice(msg) => write!(f, "no capture device: {}", msg),
            CaptureError::Pcap(e) => write!(f, "pcap error: {}", e),
            CaptureError::UnsupportedLink(dlt) => write!(f, "unsupported link type {}", dlt),
            CaptureError::Io(e) => write!(f, "I/O error: {}", e),
            CaptureError::Store(e) => write!(f, "{}", e),
            CaptureError::Watch(e) => write!(f, "watch error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Pcap(e) => Some(e),
            CaptureError::Io(e) => Some(e),
            CaptureError::Store(e) => Some(e),
            CaptureError::Watch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(e: std::io::Error) -> Self {
        CaptureError::Io(e)
    }
}

impl From<notify::Error> for CaptureError {
    fn from(e: notify::Error) -> Self {
        CaptureError::Watch(e)
    }
}

impl From<StoreError> for CaptureError {
    fn from(e: StoreError) -> Self {
        CaptureError::Store(e)
    }
}

/// Options for opening a live interface.
#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub promiscuous: bool,
    pub snaplen: i32,
    /// Read timeout so the reader can notice a stop request.
    pub timeout_ms: i32,
    pub filter: Option<String>,
}

impl Default for LiveOptions {
    fn default() -> Self {
        LiveOptions {
            promiscuous: true,
            snaplen: 65535,
            timeout_ms: 100,
            filter: None,
        }
    }
}

/// List all available network interfaces.
pub fn list_interfaces() -> Result<Vec<Device>, CaptureError> {
    Device::list().map_err(CaptureError::Pcap)
}

/// Devices to capture on: the named interface, or every device when `None`.
pub fn select_devices(interface: Option<&str>) -> Result<Vec<Device>, CaptureError> {
    let devices = list_interfaces()?;
    match interface {
        Some(name) => devices
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| vec![d])
            .ok_or_else(|| CaptureError::NoDevice(format!("interface '{}' not found", name))),
        None if devices.is_empty() => Err(CaptureError::NoDevice("no interfaces found".into())),
        None => Ok(devices),
    }
}

/// Open a live capture on `device`.
pub fn open_live(device: Device, options: &LiveOptions) -> Result<Capture<Active>, CaptureError> {
    let name = device.name.clone();
    let mut cap = Capture::from_device(device)?
        .promisc(options.promiscuous)
        .snaplen(options.snaplen)
        .timeout(options.timeout_ms)
        .open()?;

    if let Some(filter) = &options.filter {
        cap.filter(filter, true)?;
    }

    tracing::info!(
        interface = %name,
        promiscuous = options.promiscuous,
        snaplen = options.snaplen,
        filter = options.filter.as_deref().unwrap_or("none"),
        "capture started"
    );

    Ok(cap)
}

/// Open a pcap or pcapng file.
pub fn open_offline(path: &Path, filter: Option<&str>) -> Result<Capture<Offline>, CaptureError> {
    let mut cap = Capture::from_file(path)?;
    if let Some(filter) = filter {
        cap.filter(filter, true)?;
    }
    Ok(cap)
}

/// Link type of an open handle, rejected if the decoder does not know it.
pub fn link_type<T: Activated + ?Sized>(cap: &Capture<T>) -> Result<pcap::Linktype, CaptureError> {
    let linktype = cap.get_datalink();
    match LinkType::from(linktype) {
        LinkType::Unsupported(dlt) => Err(CaptureError::UnsupportedLink(dlt)),
        _ => Ok(linktype),
    }
}

/// Capture time of a packet header in ms since the epoch.
pub fn timestamp_ms(header: &pcap::PacketHeader) -> i64 {
    header.ts.tv_sec as i64 * 1000 + header.ts.tv_usec as i64 / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        match open_offline(&dir.path().join("absent.pcap"), None) {
            Err(CaptureError::Pcap(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a file that does not exist"),
        }
    }

    #[test]
    fn unknown_interface_is_no_device() {
        match select_devices(Some("ss-no-such-interface0")) {
            Err(CaptureError::NoDevice(msg)) => assert!(msg.contains("ss-no-such-interface0")),
            // Device enumeration itself may be refused in a sandbox.
            Err(CaptureError::Pcap(_)) => {}
            other => panic!("unexpected {:?}", other.map(|d| d.len())),
        }
    }
}
