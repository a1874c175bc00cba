//! Tag operations, executed standalone or embedded in a read plan

use crate::error::{ReaderError, Result};
use crate::types::{MemoryBank, TagData, TagProtocol};

/// Impinj Monza QT control bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QtControl {
    /// Keep the setting across power cycles
    pub persist: bool,
    /// Expose the public memory map instead of the private one
    pub public_memory: bool,
    /// Reduce read range when the tag is not in secured state
    pub short_range: bool,
}

impl QtControl {
    pub fn to_byte(&self) -> u8 {
        (self.persist as u8) << 2 | (self.public_memory as u8) << 1 | self.short_range as u8
    }

    pub fn from_byte(value: u8) -> Self {
        Self {
            persist: value & 0x04 != 0,
            public_memory: value & 0x02 != 0,
            short_range: value & 0x01 != 0,
        }
    }
}

/// Operation applied to a single tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOp {
    Gen2ReadData {
        bank: MemoryBank,
        word_address: u32,
        /// Zero reads to the end of the bank
        word_count: u8,
    },
    Gen2WriteData {
        bank: MemoryBank,
        word_address: u32,
        data: Vec<u16>,
    },
    /// Replace the EPC of the singulated tag
    Gen2WriteTag { epc: TagData },
    Gen2Kill { kill_password: u32 },
    /// Gen2 lock: 10-bit mask and action fields
    Gen2Lock {
        access_password: u32,
        mask: u16,
        action: u16,
    },
    /// Read guarded by an access password. With no password the reader asks
    /// for one through the auth-request listener during an async read.
    Gen2SecureReadData {
        bank: MemoryBank,
        word_address: u32,
        word_count: u8,
        access_password: Option<u32>,
    },
    MonzaQtRead { access_password: u32 },
    MonzaQtWrite {
        access_password: u32,
        control: QtControl,
    },
    Iso180006bReadData { byte_address: u8, length: u8 },
}

impl TagOp {
    /// Air protocol the operation is defined for
    pub fn protocol(&self) -> TagProtocol {
        match self {
            Self::Gen2ReadData { .. }
            | Self::Gen2WriteData { .. }
            | Self::Gen2WriteTag { .. }
            | Self::Gen2Kill { .. }
            | Self::Gen2Lock { .. }
            | Self::Gen2SecureReadData { .. }
            | Self::MonzaQtRead { .. }
            | Self::MonzaQtWrite { .. } => TagProtocol::Gen2,
            Self::Iso180006bReadData { .. } => TagProtocol::Iso180006b,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gen2ReadData { .. } => "Gen2 ReadData",
            Self::Gen2WriteData { .. } => "Gen2 WriteData",
            Self::Gen2WriteTag { .. } => "Gen2 WriteTag",
            Self::Gen2Kill { .. } => "Gen2 Kill",
            Self::Gen2Lock { .. } => "Gen2 Lock",
            Self::Gen2SecureReadData { .. } => "Gen2 SecureReadData",
            Self::MonzaQtRead { .. } => "Monza QT read",
            Self::MonzaQtWrite { .. } => "Monza QT write",
            Self::Iso180006bReadData { .. } => "ISO18000-6B ReadData",
        }
    }

    /// Host-side checks that need no reader state
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Gen2WriteData { data, .. } if data.is_empty() => {
                Err(ReaderError::InvalidValue("WriteData needs at least one word".into()))
            }
            Self::Gen2WriteData { data, .. } if data.len() > u8::MAX as usize => Err(
                ReaderError::InvalidValue(format!("WriteData too long: {} words", data.len())),
            ),
            Self::Gen2WriteTag { epc } if epc.protocol != TagProtocol::Gen2 || epc.epc.is_empty() => {
                Err(ReaderError::InvalidValue("WriteTag needs a non-empty Gen2 EPC".into()))
            }
            Self::Gen2Lock { mask, action, .. } if *mask > 0x3FF || *action > 0x3FF => Err(
                ReaderError::InvalidValue(format!(
                    "Lock mask/action exceed 10 bits: 0x{:04X}/0x{:04X}",
                    mask, action
                )),
            ),
            // Gen2 tags ignore kill with a zero password
            Self::Gen2Kill { kill_password: 0 } => Err(ReaderError::AccessDenied),
            _ => Ok(()),
        }
    }

    /// True when this operation may only run embedded in an async read,
    /// where the auth-request listener can supply the password.
    pub fn needs_auth_request(&self) -> bool {
        matches!(
            self,
            Self::Gen2SecureReadData {
                access_password: None,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qt_control_byte() {
        let control = QtControl {
            persist: true,
            public_memory: false,
            short_range: true,
        };
        assert_eq!(control.to_byte(), 0x05);
        assert_eq!(QtControl::from_byte(0x05), control);
    }

    #[test]
    fn test_protocols() {
        assert_eq!(TagOp::Gen2Kill { kill_password: 1 }.protocol(), TagProtocol::Gen2);
        assert_eq!(
            TagOp::Iso180006bReadData {
                byte_address: 0,
                length: 8
            }
            .protocol(),
            TagProtocol::Iso180006b
        );
    }

    #[test]
    fn test_kill_zero_password_denied() {
        assert_eq!(
            TagOp::Gen2Kill { kill_password: 0 }.validate(),
            Err(ReaderError::AccessDenied)
        );
    }

    #[test]
    fn test_empty_write_rejected() {
        let op = TagOp::Gen2WriteData {
            bank: MemoryBank::User,
            word_address: 0,
            data: vec![],
        };
        assert!(matches!(op.validate(), Err(ReaderError::InvalidValue(_))));
    }

    #[test]
    fn test_lock_fields_limited_to_ten_bits() {
        let op = TagOp::Gen2Lock {
            access_password: 0x1234,
            mask: 0x400,
            action: 0,
        };
        assert!(matches!(op.validate(), Err(ReaderError::InvalidValue(_))));
    }

    #[test]
    fn test_secure_read_without_password_needs_auth() {
        let op = TagOp::Gen2SecureReadData {
            bank: MemoryBank::User,
            word_address: 0,
            word_count: 2,
            access_password: None,
        };
        assert!(op.needs_auth_request());
        assert!(op.validate().is_ok());
    }
}
