//! Tag filters: predicates over tag identity and memory

use crate::error::{ReaderError, Result};
use crate::types::{MemoryBank, TagData, TagMemory, TagProtocol};

/// Largest mask a Gen2 Select can carry, in bytes
pub const MAX_MASK_LEN: usize = 32;

/// Gen2 Select filter over a bit range of one memory bank.
///
/// The mask is read as a big-endian number and its low `bit_length` bits are
/// compared, so `mask = [0x00, 0x30]` with `bit_length = 12` selects `0x030`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gen2Select {
    bank: MemoryBank,
    bit_pointer: u32,
    bit_length: u16,
    mask: Vec<u8>,
    invert: bool,
}

impl Gen2Select {
    pub fn new(
        bank: MemoryBank,
        bit_pointer: u32,
        bit_length: u16,
        mask: &[u8],
        invert: bool,
    ) -> Result<Self> {
        if mask.len() > MAX_MASK_LEN {
            return Err(ReaderError::InvalidFilter(format!(
                "Mask length {} exceeds maximum of {} bytes",
                mask.len(),
                MAX_MASK_LEN
            )));
        }
        if bit_length as usize > mask.len() * 8 {
            return Err(ReaderError::InvalidFilter(format!(
                "Bit length {} exceeds mask capacity of {} bits",
                bit_length,
                mask.len() * 8
            )));
        }
        Ok(Self {
            bank,
            bit_pointer,
            bit_length,
            mask: mask.to_vec(),
            invert,
        })
    }

    pub fn bank(&self) -> MemoryBank {
        self.bank
    }

    pub fn bit_pointer(&self) -> u32 {
        self.bit_pointer
    }

    pub fn bit_length(&self) -> u16 {
        self.bit_length
    }

    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    /// Compare the selected bit range of `memory` (a whole bank) with the mask.
    ///
    /// A bank too short to hold the range counts as a mismatch.
    pub fn matches_bits(&self, memory: &[u8]) -> bool {
        let start = self.bit_pointer as usize;
        let len = self.bit_length as usize;
        let skip = self.mask.len() * 8 - len;
        let equal = start + len <= memory.len() * 8
            && (0..len).all(|i| bit_at(memory, start + i) == bit_at(&self.mask, skip + i));
        equal != self.invert
    }
}

fn bit_at(bytes: &[u8], index: usize) -> bool {
    (bytes[index / 8] >> (7 - index % 8)) & 1 == 1
}

/// Predicate narrowing which tags a read plan or tag operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Matches tags of the same protocol whose EPC starts with this EPC.
    /// A full-length EPC therefore matches exactly one tag.
    TagData(TagData),
    /// Gen2 Select over a memory bank
    Gen2Select(Gen2Select),
}

impl TagFilter {
    /// Filter on an exact or leading EPC
    pub fn epc(protocol: TagProtocol, epc: &[u8]) -> Result<Self> {
        Ok(Self::TagData(TagData::new(protocol, epc)?))
    }

    pub fn gen2_select(
        bank: MemoryBank,
        bit_pointer: u32,
        bit_length: u16,
        mask: &[u8],
        invert: bool,
    ) -> Result<Self> {
        Ok(Self::Gen2Select(Gen2Select::new(
            bank,
            bit_pointer,
            bit_length,
            mask,
            invert,
        )?))
    }

    /// Protocol the filter applies to
    pub fn protocol(&self) -> TagProtocol {
        match self {
            Self::TagData(data) => data.protocol,
            Self::Gen2Select(_) => TagProtocol::Gen2,
        }
    }

    /// Evaluate the filter against a tag. Deterministic for a given tag.
    pub fn matches<M: TagMemory + ?Sized>(&self, tag: &M) -> bool {
        match self {
            Self::TagData(data) => tag.protocol() == data.protocol && tag.epc().starts_with(&data.epc),
            Self::Gen2Select(select) => {
                if tag.protocol() != TagProtocol::Gen2 {
                    return false;
                }
                match tag.bank(select.bank) {
                    Some(memory) => select.matches_bits(&memory),
                    None => false,
                }
            }
        }
    }
}
