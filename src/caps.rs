//! Capability snapshot of a connected reader

use crate::types::{Region, TagProtocol};

/// What the reader reported about itself when the connection was made.
///
/// Plans and parameter values are validated against this snapshot instead of
/// re-querying the transport. Call `Reader::refresh_capabilities` after
/// re-cabling antennas.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub model: String,
    pub firmware: String,
    /// Every antenna port the reader has
    pub ports: Vec<u8>,
    /// Ports with an antenna attached
    pub connected_ports: Vec<u8>,
    pub supported_regions: Vec<Region>,
    pub protocols: Vec<TagProtocol>,
    /// Read/write power limits in centi-dBm
    pub power_min: i32,
    pub power_max: i32,
}

impl Capabilities {
    pub fn is_connected_port(&self, port: u8) -> bool {
        self.connected_ports.contains(&port)
    }

    pub fn is_port(&self, port: u8) -> bool {
        self.ports.contains(&port)
    }

    pub fn supports_region(&self, region: Region) -> bool {
        self.supported_regions.contains(&region)
    }

    pub fn supports_protocol(&self, protocol: TagProtocol) -> bool {
        self.protocols.contains(&protocol)
    }
}
