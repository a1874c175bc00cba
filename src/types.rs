//! Types for RFID operations

use crate::error::{ReaderError, Result};
use std::borrow::Cow;
use std::hash::{Hash, Hasher};

/// Longest EPC the reader can report, in bytes.
pub const MAX_EPC_LEN: usize = 62;

/// Regulatory region. A reader has exactly one active region.
///
/// `None` means the region was never set; it must be resolved before a read
/// plan can run. `Open` is the unrestricted test region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Region {
    None = 0x00,
    Na = 0x01,
    Eu = 0x02,
    Kr = 0x03,
    In = 0x04,
    Jp = 0x05,
    Prc = 0x06,
    Eu2 = 0x07,
    Eu3 = 0x08,
    Kr2 = 0x09,
    Prc2 = 0x0A,
    Au = 0x0B,
    Nz = 0x0C,
    Na2 = 0x0D,
    Na3 = 0x0E,
    Open = 0xFF,
}

impl Region {
    pub fn from_u8(value: u8) -> Option<Self> {
        let region = match value {
            0x00 => Self::None,
            0x01 => Self::Na,
            0x02 => Self::Eu,
            0x03 => Self::Kr,
            0x04 => Self::In,
            0x05 => Self::Jp,
            0x06 => Self::Prc,
            0x07 => Self::Eu2,
            0x08 => Self::Eu3,
            0x09 => Self::Kr2,
            0x0A => Self::Prc2,
            0x0B => Self::Au,
            0x0C => Self::Nz,
            0x0D => Self::Na2,
            0x0E => Self::Na3,
            0xFF => Self::Open,
            _ => return None,
        };
        Some(region)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Na => "NA",
            Self::Eu => "EU",
            Self::Kr => "KR",
            Self::In => "IN",
            Self::Jp => "JP",
            Self::Prc => "PRC",
            Self::Eu2 => "EU2",
            Self::Eu3 => "EU3",
            Self::Kr2 => "KR2",
            Self::Prc2 => "PRC2",
            Self::Au => "AU",
            Self::Nz => "NZ",
            Self::Na2 => "NA2",
            Self::Na3 => "NA3",
            Self::Open => "OPEN",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Air protocol of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TagProtocol {
    None = 0x00,
    Iso180006b = 0x03,
    Gen2 = 0x05,
    Iso180006bUcode = 0x06,
    Ipx64 = 0x07,
    Ipx256 = 0x08,
    Ata = 0x1D,
}

impl TagProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        let protocol = match value {
            0x00 => Self::None,
            0x03 => Self::Iso180006b,
            0x05 => Self::Gen2,
            0x06 => Self::Iso180006bUcode,
            0x07 => Self::Ipx64,
            0x08 => Self::Ipx256,
            0x1D => Self::Ata,
            _ => return None,
        };
        Some(protocol)
    }
}

/// Gen2 memory bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryBank {
    Reserved = 0x00,
    Epc = 0x01,
    Tid = 0x02,
    User = 0x03,
}

impl MemoryBank {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Reserved),
            0x01 => Some(Self::Epc),
            0x02 => Some(Self::Tid),
            0x03 => Some(Self::User),
            _ => None,
        }
    }
}

/// Gen2 inventory session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gen2Session {
    S0 = 0x00,
    S1 = 0x01,
    S2 = 0x02,
    S3 = 0x03,
}

impl Gen2Session {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::S0),
            0x01 => Some(Self::S1),
            0x02 => Some(Self::S2),
            0x03 => Some(Self::S3),
            _ => None,
        }
    }
}

/// Identity of a tag.
///
/// Two tags are the same tag when protocol and EPC bytes are equal; the PC
/// word is informational.
#[derive(Debug, Clone)]
pub struct TagData {
    pub protocol: TagProtocol,
    pub epc: Vec<u8>,
    pub pc: u16,
}

impl TagData {
    pub fn new(protocol: TagProtocol, epc: &[u8]) -> Result<Self> {
        if epc.len() > MAX_EPC_LEN {
            return Err(ReaderError::InvalidValue(format!(
                "EPC too long: {} bytes (maximum: {} bytes)",
                epc.len(),
                MAX_EPC_LEN
            )));
        }
        Ok(Self {
            protocol,
            epc: epc.to_vec(),
            pc: ((epc.len() as u16).div_ceil(2)) << 11,
        })
    }

    /// Gen2 tag shorthand
    pub fn gen2(epc: &[u8]) -> Result<Self> {
        Self::new(TagProtocol::Gen2, epc)
    }

    /// EPC as uppercase hex
    pub fn epc_hex(&self) -> String {
        bytes_to_hex(&self.epc)
    }
}

impl PartialEq for TagData {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.epc == other.epc
    }
}

impl Eq for TagData {}

impl Hash for TagData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.epc.hash(state);
    }
}

/// One observed read event
#[derive(Debug, Clone, PartialEq)]
pub struct TagReadData {
    pub tag: TagData,
    /// Antenna port the tag was seen on
    pub antenna: u8,
    /// Detections coalesced into this event during one cycle
    pub read_count: u32,
    /// Signal strength in dBm
    pub rssi: i8,
    /// Milliseconds since the UNIX epoch
    pub timestamp_ms: u64,
    /// Sub-millisecond part of the timestamp, 0..1000
    pub timestamp_micros: u16,
    /// Result of the plan's embedded tag operation, if any
    pub data: Vec<u8>,
}

impl TagReadData {
    pub fn epc_hex(&self) -> String {
        self.tag.epc_hex()
    }

    /// High 32 bits of the millisecond timestamp
    pub fn timestamp_high(&self) -> u32 {
        (self.timestamp_ms >> 32) as u32
    }

    /// Low 32 bits of the millisecond timestamp
    pub fn timestamp_low(&self) -> u32 {
        self.timestamp_ms as u32
    }
}

/// Memory view used when matching filters.
///
/// Banks a tag cannot provide return `None` and never match.
pub trait TagMemory {
    fn protocol(&self) -> TagProtocol;

    fn epc(&self) -> &[u8];

    /// Contents of `bank`, starting at bit 0 of the bank
    fn bank(&self, bank: MemoryBank) -> Option<Cow<'_, [u8]>>;
}

/// Build the EPC bank image: CRC word, PC word, then the EPC.
pub fn epc_bank_image(crc: u16, pc: u16, epc: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(4 + epc.len());
    image.extend_from_slice(&crc.to_be_bytes());
    image.extend_from_slice(&pc.to_be_bytes());
    image.extend_from_slice(epc);
    image
}

impl TagMemory for TagData {
    fn protocol(&self) -> TagProtocol {
        self.protocol
    }

    fn epc(&self) -> &[u8] {
        &self.epc
    }

    fn bank(&self, bank: MemoryBank) -> Option<Cow<'_, [u8]>> {
        match bank {
            // CRC is not carried with the tag, so bits 0..16 read as zero.
            MemoryBank::Epc => Some(Cow::Owned(epc_bank_image(0, self.pc, &self.epc))),
            _ => None,
        }
    }
}

impl TagMemory for TagReadData {
    fn protocol(&self) -> TagProtocol {
        self.tag.protocol
    }

    fn epc(&self) -> &[u8] {
        &self.tag.epc
    }

    fn bank(&self, bank: MemoryBank) -> Option<Cow<'_, [u8]>> {
        self.tag.bank(bank)
    }
}

/// Convert bytes to uppercase hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    #[case(Region::None, 0x00)]
    #[case(Region::Na, 0x01)]
    #[case(Region::Eu, 0x02)]
    #[case(Region::Prc, 0x06)]
    #[case(Region::Open, 0xFF)]
    fn test_region_codes(#[case] region: Region, #[case] code: u8) {
        assert_eq!(region as u8, code);
        assert_eq!(Region::from_u8(code), Some(region));
    }

    #[test]
    fn test_region_unknown_code() {
        assert_eq!(Region::from_u8(0x42), None);
    }

    #[test]
    fn test_tag_data_equality_ignores_pc() {
        let a = TagData::gen2(&[0xE2, 0x00, 0x11]).unwrap();
        let mut b = a.clone();
        b.pc = 0x3000;
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_tag_data_protocol_distinguishes() {
        let a = TagData::new(TagProtocol::Gen2, &[0x01]).unwrap();
        let b = TagData::new(TagProtocol::Iso180006b, &[0x01]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tag_data_epc_too_long() {
        let epc = vec![0u8; MAX_EPC_LEN + 1];
        assert!(matches!(TagData::gen2(&epc), Err(ReaderError::InvalidValue(_))));
        assert!(TagData::gen2(&epc[..MAX_EPC_LEN]).is_ok());
    }

    #[test]
    fn test_pc_word_from_epc_length() {
        let tag = TagData::gen2(&[0u8; 12]).unwrap();
        assert_eq!(tag.pc, 0x3000);
    }

    #[test]
    fn test_epc_bank_image() {
        let tag = TagData::gen2(&[0xE2, 0x80]).unwrap();
        let bank = tag.bank(MemoryBank::Epc).unwrap();
        assert_eq!(&bank[..], &[0x00, 0x00, 0x08, 0x00, 0xE2, 0x80]);
        assert!(tag.bank(MemoryBank::Tid).is_none());
    }

    #[test]
    fn test_timestamp_halves() {
        let read = TagReadData {
            tag: TagData::gen2(&[0x01]).unwrap(),
            antenna: 1,
            read_count: 1,
            rssi: -60,
            timestamp_ms: 0x0000_0001_0000_0002,
            timestamp_micros: 0,
            data: vec![],
        };
        assert_eq!(read.timestamp_high(), 1);
        assert_eq!(read.timestamp_low(), 2);
    }

    #[test]
    fn test_bytes_to_hex() {
        assert_eq!(bytes_to_hex(&[0xE2, 0x00, 0x0A]), "E2000A");
    }
}
