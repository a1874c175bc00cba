//! Host-side driver for UHF RFID readers with support for multiple transport backends.
//!
//! A [`Reader`] talks to one physical reader over a [`Transport`]. It offers a
//! typed parameter store, region resolution, read plans with filters and
//! embedded tag operations, blocking reads, background reads with listeners,
//! and standalone tag operations.
//!
//! # Features
//!
//! - `serial` - Serial port transport for desktop using serialport crate
//! - `uart-esp32` - UART transport for ESP32 using esp-idf-svc
//!
//! # Example
//!
//! ```ignore
//! use uhf_reader::{ReadPlan, ReaderConfig, TagProtocol, TransportRegistry};
//!
//! let reader = TransportRegistry::default().connect("tmr:///dev/ttyUSB0", ReaderConfig::default())?;
//! reader.resolve_region()?;
//! reader.commit_plan(&ReadPlan::simple(&[1], TagProtocol::Gen2, 1000)?)?;
//!
//! reader.read(500)?;
//! while reader.has_more_tags().is_ok() {
//!     let tag = reader.get_next_tag()?;
//!     println!("Found tag: {} on antenna {}", tag.epc_hex(), tag.antenna);
//! }
//! ```

mod caps;
pub mod codec;
mod config;
mod error;
mod filter;
pub mod frame;
mod param;
mod plan;
mod reader;
mod session;
pub mod sim;
mod tagop;
mod tcp;
mod transport;
mod types;
mod uri;

#[cfg(feature = "uart-esp32")]
mod uart;

#[cfg(feature = "serial")]
mod serial;

// Re-exports
pub use caps::Capabilities;
pub use config::ReaderConfig;
pub use error::{ReaderError, Result, StatusCode};
pub use filter::{Gen2Select, MAX_MASK_LEN, TagFilter};
pub use param::{BAUD_RATES, FromParam, MAX_ASYNC_TIME_MS, ParamKey, ParamType, ParamValue};
pub use plan::{DEFAULT_MAX_SUBPLANS, MAX_SUBPLANS, MultiReadPlan, ReadPlan, SimpleReadPlan};
pub use reader::{MAX_READ_DURATION_MS, Reader, RegionState};
pub use session::{AuthListener, ExceptionListener, ListenerId, ReadListener};
pub use tagop::{QtControl, TagOp};
pub use tcp::TcpTransport;
pub use transport::{BoxedTransport, Transport};
pub use types::{
    Gen2Session, MAX_EPC_LEN, MemoryBank, Region, TagData, TagMemory, TagProtocol, TagReadData, bytes_to_hex,
};
pub use uri::{DEFAULT_SCHEME, DEFAULT_TCP_PORT, Endpoint, ReaderUri, TransportFactory, TransportRegistry};

#[cfg(feature = "uart-esp32")]
pub use uart::UartTransport;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TagReport;
    use crate::frame::{Frame, FrameDecoder, FrameType};
    use bytes::BytesMut;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Transport that answers every command with the next scripted reply
    struct ScriptedTransport {
        replies: RefCell<VecDeque<Vec<u8>>>,
        pending: Vec<u8>,
        decoder: FrameDecoder,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    impl Transport for ScriptedTransport {
        type Error = std::io::Error;

        fn open(&mut self) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        fn send_bytes(&mut self, data: &[u8], _timeout_ms: u32) -> std::result::Result<(), Self::Error> {
            self.decoder.feed(data);
            while let Some(frame) = self.decoder.next_frame() {
                self.sent.lock().unwrap().push(frame);
                if let Some(reply) = self.replies.borrow_mut().pop_front() {
                    self.pending.extend(reply);
                }
            }
            Ok(())
        }

        fn receive_bytes(&mut self, buf: &mut [u8], _timeout_ms: u32) -> std::result::Result<usize, Self::Error> {
            if self.pending.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
                return Ok(0);
            }
            let len = self.pending.len().min(buf.len());
            buf[..len].copy_from_slice(&self.pending[..len]);
            self.pending.drain(..len);
            Ok(len)
        }

        fn set_baud_rate(&mut self, _rate: u32) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        fn flush(&mut self) -> std::result::Result<(), Self::Error> {
            Ok(())
        }

        fn shutdown(&mut self) -> std::result::Result<(), Self::Error> {
            Ok(())
        }
    }

    fn value(value: ParamValue) -> Vec<u8> {
        let mut body = BytesMut::new();
        codec::encode_value(&value, &mut body);
        Frame::response(frame::GET_PARAM, StatusCode::Success, &body).encode()
    }

    fn status(command: u8, status: StatusCode) -> Vec<u8> {
        Frame::response(command, status, &[]).encode()
    }

    /// Replies to the commands `Reader::connect` sends
    fn handshake() -> Vec<Vec<u8>> {
        vec![
            Frame::response(frame::GET_FIRMWARE, StatusCode::Success, b"2.1.0").encode(),
            value(ParamValue::Str("M6e".into())),
            value(ParamValue::Str("2.1.0".into())),
            value(ParamValue::PortList(vec![1, 2])),
            value(ParamValue::PortList(vec![1])),
            value(ParamValue::RegionList(vec![Region::Na, Region::Eu])),
            value(ParamValue::ProtocolList(vec![TagProtocol::Gen2])),
            value(ParamValue::I32(500)),
            value(ParamValue::I32(3000)),
        ]
    }

    fn connect_with(replies: Vec<Vec<u8>>) -> (Reader<ScriptedTransport>, Arc<Mutex<Vec<Frame>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            replies: RefCell::new(replies.into()),
            pending: Vec::new(),
            decoder: FrameDecoder::new(),
            sent: Arc::clone(&sent),
        };
        let config = ReaderConfig::default().with_command_timeout(Duration::from_millis(50));
        let reader = Reader::connect(transport, config).unwrap();
        (reader, sent)
    }

    fn connect_then(extra: Vec<Vec<u8>>) -> (Reader<ScriptedTransport>, Arc<Mutex<Vec<Frame>>>) {
        let mut replies = handshake();
        replies.extend(extra);
        connect_with(replies)
    }

    // ===================
    // connect tests
    // ===================

    #[test]
    fn test_connect_takes_snapshot() {
        let (reader, sent) = connect_then(vec![]);
        let caps = reader.capabilities();

        assert_eq!(caps.model, "M6e");
        assert_eq!(caps.firmware, "2.1.0");
        assert_eq!(caps.connected_ports, vec![1]);
        assert_eq!(caps.supported_regions, vec![Region::Na, Region::Eu]);
        assert_eq!((caps.power_min, caps.power_max), (500, 3000));
        assert_eq!(sent.lock().unwrap()[0].command, frame::GET_FIRMWARE);
    }

    #[test]
    fn test_connect_tolerates_missing_optional_caps() {
        let mut replies = handshake();
        replies[1] = status(frame::GET_PARAM, StatusCode::NotFound);
        let (reader, _) = connect_with(replies);
        assert_eq!(reader.capabilities().model, "");
    }

    #[test]
    fn test_connect_without_reply_times_out() {
        let transport = ScriptedTransport {
            replies: RefCell::new(VecDeque::new()),
            pending: Vec::new(),
            decoder: FrameDecoder::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        };
        let config = ReaderConfig::default().with_command_timeout(Duration::from_millis(30));
        assert_eq!(Reader::connect(transport, config).err(), Some(ReaderError::Timeout(30)));
    }

    // ===================
    // parameter tests
    // ===================

    #[test]
    fn test_get_param_decodes_value() {
        let (reader, sent) = connect_then(vec![value(ParamValue::I32(2500))]);

        assert_eq!(reader.get::<i32>(ParamKey::ReadPower), Ok(2500));
        let last = sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.command, frame::GET_PARAM);
        assert_eq!(last.payload, vec![0x00, 0x40]);
    }

    #[test]
    fn test_get_wrong_type_sends_nothing() {
        let (reader, sent) = connect_then(vec![]);
        let before = sent.lock().unwrap().len();

        assert!(matches!(reader.get::<bool>(ParamKey::ReadPower), Err(ReaderError::InvalidType { .. })));
        assert_eq!(sent.lock().unwrap().len(), before);
    }

    #[test]
    fn test_get_unknown_path() {
        let (reader, _) = connect_then(vec![]);
        assert!(matches!(reader.get_by_path("/reader/nope"), Err(ReaderError::NotFound(_))));
    }

    #[test]
    fn test_set_rejected_before_wire() {
        let (reader, sent) = connect_then(vec![]);
        let before = sent.lock().unwrap().len();

        assert!(matches!(reader.set(ParamKey::ReadPower, 9000i32), Err(ReaderError::InvalidValue(_))));
        assert!(matches!(reader.set(ParamKey::PowerMax, 100i32), Err(ReaderError::ReadOnly(_))));
        assert!(matches!(reader.set(ParamKey::BaudRate, 1234u32), Err(ReaderError::InvalidValue(_))));
        assert!(matches!(reader.set(ParamKey::TagopAntenna, 2u8), Err(ReaderError::InvalidAntenna(_))));
        assert!(matches!(reader.set(ParamKey::RegionId, Region::Jp), Err(ReaderError::InvalidValue(_))));
        assert_eq!(sent.lock().unwrap().len(), before);
    }

    #[test]
    fn test_set_by_path_sends_encoded_value() {
        let (reader, sent) = connect_then(vec![status(frame::SET_PARAM, StatusCode::Success)]);

        reader.set_by_path("/reader/radio/readPower", 2000i32).unwrap();
        let last = sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.command, frame::SET_PARAM);
        assert_eq!(last.payload, vec![0x00, 0x40, 0x00, 0x00, 0x07, 0xD0]);
    }

    #[test]
    fn test_unknown_status_is_invalid_response() {
        let reply = Frame {
            frame_type: FrameType::Response,
            command: frame::GET_PARAM,
            payload: vec![0x7F],
        };
        let (reader, _) = connect_then(vec![reply.encode()]);
        assert!(matches!(reader.param(ParamKey::ReadPower), Err(ReaderError::InvalidResponse(_))));
    }

    // ===================
    // read tests
    // ===================

    fn tag_frame(epc: &[u8], antenna: u8) -> Vec<u8> {
        let report = TagReport {
            tag: TagData::gen2(epc).unwrap(),
            antenna,
            read_count: 3,
            rssi: -60,
            offset_ms: 5,
            micros: 250,
            data: vec![],
        };
        let mut payload = BytesMut::new();
        codec::encode_tag_report(&report, &mut payload);
        Frame {
            frame_type: FrameType::Tag,
            command: frame::READ_CYCLE,
            payload: payload.to_vec(),
        }
        .encode()
    }

    #[test]
    fn test_read_cycle_skips_garbage() {
        let mut cycle = vec![0x00, 0x13, 0x37];
        cycle.extend(tag_frame(&[0xE2, 0x00, 0x68, 0x16], 1));
        cycle.extend(Frame::response(frame::READ_CYCLE, StatusCode::Success, &[0x00, 0x01]).encode());
        let (reader, sent) = connect_then(vec![cycle]);

        assert_eq!(reader.read(100), Ok(1));
        assert_eq!(sent.lock().unwrap().last().unwrap().payload, vec![0x00, 0x64]);

        let tag = reader.get_next_tag().unwrap();
        assert_eq!(tag.epc_hex(), "E2006816");
        assert_eq!(tag.read_count, 3);
        assert_eq!(tag.rssi, -60);
        assert_eq!(tag.timestamp_micros, 250);
        assert_eq!(reader.has_more_tags(), Err(ReaderError::NoTags));
    }

    #[test]
    fn test_read_status_error() {
        let (reader, _) = connect_then(vec![status(frame::READ_CYCLE, StatusCode::InvalidRegion)]);
        assert!(matches!(reader.read(100), Err(ReaderError::InvalidRegion(_))));
        // The session is released after a failed read
        assert_eq!(reader.get_next_tag(), Err(ReaderError::NoTags));
        assert!(!reader.is_reading());
    }

    #[test]
    fn test_read_duration_limit() {
        let (reader, _) = connect_then(vec![]);
        assert!(matches!(reader.read(70_000), Err(ReaderError::InvalidValue(_))));
    }

    // ===================
    // tag operation tests
    // ===================

    #[test]
    fn test_tag_op_status_maps_to_error() {
        let (reader, _) = connect_then(vec![
            value(ParamValue::Protocol(TagProtocol::Gen2)),
            status(frame::EXEC_TAG_OP, StatusCode::AccessDenied),
        ]);
        let op = TagOp::Gen2ReadData {
            bank: MemoryBank::User,
            word_address: 0,
            word_count: 2,
        };
        assert_eq!(reader.execute_tag_op(&op, None), Err(ReaderError::AccessDenied));
    }

    #[test]
    fn test_tag_op_returns_data() {
        let (reader, sent) = connect_then(vec![
            value(ParamValue::Protocol(TagProtocol::Gen2)),
            Frame::response(frame::EXEC_TAG_OP, StatusCode::Success, &[0xDE, 0xAD]).encode(),
        ]);
        let op = TagOp::Gen2ReadData {
            bank: MemoryBank::Tid,
            word_address: 0,
            word_count: 1,
        };
        let filter = TagFilter::epc(TagProtocol::Gen2, &[0xE2]).unwrap();

        assert_eq!(reader.execute_tag_op(&op, Some(&filter)), Ok(vec![0xDE, 0xAD]));
        let last = sent.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.command, frame::EXEC_TAG_OP);
        // op, bank, address, count, filter flag, filter kind, protocol, epc
        assert_eq!(
            last.payload,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x05, 0x01, 0xE2]
        );
    }

    #[test]
    fn test_secure_read_without_password_is_denied() {
        let (reader, sent) = connect_then(vec![]);
        let before = sent.lock().unwrap().len();
        let op = TagOp::Gen2SecureReadData {
            bank: MemoryBank::User,
            word_address: 0,
            word_count: 2,
            access_password: None,
        };
        assert_eq!(reader.execute_tag_op(&op, None), Err(ReaderError::AccessDenied));
        assert_eq!(sent.lock().unwrap().len(), before);
    }
}
