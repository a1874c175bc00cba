//! Host/reader framing.
//!
//! ```text
//! BB | type | cmd | len MSB | len LSB | payload ... | checksum | 7E
//! ```
//!
//! The checksum is the wrapping sum of `type..payload`. Response payloads
//! start with a status byte.

use crate::error::{ReaderError, Result, StatusCode};
use log::warn;

pub const HEADER: u8 = 0xBB;
pub const END: u8 = 0x7E;

/// Bytes around the payload: header, type, command, length (2), checksum, end
pub const OVERHEAD: usize = 7;

// Command codes
pub const GET_FIRMWARE: u8 = 0x03;
pub const GET_PARAM: u8 = 0x10;
pub const SET_PARAM: u8 = 0x11;
pub const READ_CYCLE: u8 = 0x22;
pub const EXEC_TAG_OP: u8 = 0x39;
pub const AUTH_RESPONSE: u8 = 0x3B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Command = 0x00,
    Response = 0x01,
    Tag = 0x02,
    AuthRequest = 0x03,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Command),
            0x01 => Some(Self::Response),
            0x02 => Some(Self::Tag),
            0x03 => Some(Self::AuthRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(command: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Command,
            command,
            payload,
        }
    }

    pub fn response(command: u8, status: StatusCode, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(status as u8);
        payload.extend_from_slice(body);
        Self {
            frame_type: FrameType::Response,
            command,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let param_len = self.payload.len() as u16;
        let msb = (param_len >> 8) as u8;
        let lsb = (param_len & 0xFF) as u8;

        let checksum = [self.frame_type as u8, self.command, msb, lsb]
            .iter()
            .chain(self.payload.iter())
            .fold(0u8, |acc, &b| acc.wrapping_add(b));

        let mut frame = Vec::with_capacity(OVERHEAD + self.payload.len());
        frame.extend_from_slice(&[HEADER, self.frame_type as u8, self.command, msb, lsb]);
        frame.extend_from_slice(&self.payload);
        frame.push(checksum);
        frame.push(END);
        frame
    }

    /// Status byte of a response frame
    pub fn status(&self) -> Result<StatusCode> {
        let raw = *self
            .payload
            .first()
            .ok_or_else(|| ReaderError::invalid_response("Response without status byte"))?;
        StatusCode::from_u8(raw)
            .ok_or_else(|| ReaderError::InvalidResponse(format!("Unknown status code 0x{:02X}", raw)))
    }

    /// Response payload after the status byte
    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or(&[])
    }
}

/// Incremental decoder for a byte stream that may split or join frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pull the next complete frame. Garbage and corrupt frames are skipped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let start = match self.buffer.iter().position(|&b| b == HEADER) {
                Some(start) => start,
                None => {
                    self.buffer.clear();
                    return None;
                }
            };
            if start > 0 {
                warn!("Discarding {} bytes before frame header", start);
                self.buffer.drain(..start);
            }
            if self.buffer.len() < OVERHEAD {
                return None;
            }

            let len = ((self.buffer[3] as usize) << 8) | self.buffer[4] as usize;
            let total = OVERHEAD + len;
            if self.buffer.len() < total {
                return None;
            }

            let frame = &self.buffer[..total];
            let checksum = frame[1..5 + len].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            let frame_type = FrameType::from_u8(frame[1]);

            match frame_type {
                Some(frame_type) if frame[total - 1] == END && frame[total - 2] == checksum => {
                    let parsed = Frame {
                        frame_type,
                        command: frame[2],
                        payload: frame[5..5 + len].to_vec(),
                    };
                    self.buffer.drain(..total);
                    return Some(parsed);
                }
                _ => {
                    warn!("Failed to parse frame: {:02X?}", frame);
                    // Resync on the next header byte
                    self.buffer.drain(..1);
                }
            }
        }
    }
}
