//! In-memory reader that speaks the frame protocol.
//!
//! [`SimulatedReader`] is a [`Transport`]: bytes the host sends are parsed as
//! command frames and answered the way a reader would. The paired
//! [`SimHandle`] edits the tag population and reader state from the test
//! side while the host is connected.
//!
//! ```ignore
//! let (transport, sim) = SimulatedReader::new();
//! sim.add_tag(SimTag::gen2(&[0xE2, 0x00, 0x11])?);
//! let reader = Reader::connect(transport, ReaderConfig::default())?;
//! ```

use bytes::BytesMut;
use log::{debug, warn};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::codec::{self, TagReport};
use crate::error::StatusCode;
use crate::frame::{self, Frame, FrameDecoder, FrameType};
use crate::param::{ParamKey, ParamValue};
use crate::plan::ReadPlan;
use crate::reader::lock;
use crate::tagop::{QtControl, TagOp};
use crate::transport::Transport;
use crate::types::{Gen2Session, MemoryBank, Region, TagData, TagMemory, TagProtocol, epc_bank_image};

/// Poll interval while the simulator has nothing to send
const IDLE_POLL: Duration = Duration::from_millis(2);

/// A tag in the simulated field
#[derive(Debug, Clone, PartialEq)]
pub struct SimTag {
    tag: TagData,
    tid: Vec<u8>,
    user: Vec<u8>,
    access_password: u32,
    kill_password: u32,
    antenna: u8,
    rssi: i8,
    departing: bool,
    killed: bool,
    qt: QtControl,
    /// Gen2 lock bits currently in force (10-bit action field)
    locks: u16,
}

impl SimTag {
    pub fn new(tag: TagData) -> Self {
        Self {
            tag,
            tid: vec![0xE2, 0x00, 0x34, 0x12, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF],
            user: vec![0; 8],
            access_password: 0,
            kill_password: 0,
            antenna: 1,
            rssi: -55,
            departing: false,
            killed: false,
            qt: QtControl::default(),
            locks: 0,
        }
    }

    pub fn gen2(epc: &[u8]) -> crate::error::Result<Self> {
        Ok(Self::new(TagData::gen2(epc)?))
    }

    pub fn with_tid(mut self, tid: &[u8]) -> Self {
        self.tid = tid.to_vec();
        self
    }

    pub fn with_user(mut self, user: &[u8]) -> Self {
        self.user = user.to_vec();
        self
    }

    pub fn with_access_password(mut self, password: u32) -> Self {
        self.access_password = password;
        self
    }

    pub fn with_kill_password(mut self, password: u32) -> Self {
        self.kill_password = password;
        self
    }

    pub fn on_antenna(mut self, antenna: u8) -> Self {
        self.antenna = antenna;
        self
    }

    pub fn with_rssi(mut self, rssi: i8) -> Self {
        self.rssi = rssi;
        self
    }

    /// The tag is seen in inventory but leaves the field before any
    /// operation on it completes.
    pub fn departing(mut self) -> Self {
        self.departing = true;
        self
    }

    pub fn tag(&self) -> &TagData {
        &self.tag
    }

    pub fn user(&self) -> &[u8] {
        &self.user
    }

    pub fn tid(&self) -> &[u8] {
        &self.tid
    }

    pub fn access_password(&self) -> u32 {
        self.access_password
    }

    pub fn qt(&self) -> QtControl {
        self.qt
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    fn reserved(&self) -> Vec<u8> {
        let mut image = self.kill_password.to_be_bytes().to_vec();
        image.extend_from_slice(&self.access_password.to_be_bytes());
        image
    }

    fn check_password(&self, password: u32) -> Result<(), StatusCode> {
        if self.access_password != 0 && password != self.access_password {
            return Err(StatusCode::AccessDenied);
        }
        Ok(())
    }

    fn write_locked(&self, bank: MemoryBank) -> bool {
        let pair = match bank {
            MemoryBank::User => 0,
            MemoryBank::Tid => 1,
            MemoryBank::Epc => 2,
            MemoryBank::Reserved => 3,
        };
        self.locks & (1 << (pair * 2 + 1)) != 0
    }

    fn read_words(&self, bank: MemoryBank, word_address: u32, word_count: u8) -> Result<Vec<u8>, StatusCode> {
        let memory = self.bank(bank).ok_or(StatusCode::InvalidValue)?;
        let start = word_address as usize * 2;
        let end = if word_count == 0 {
            memory.len()
        } else {
            start + word_count as usize * 2
        };
        if start > memory.len() || end > memory.len() {
            return Err(StatusCode::InvalidValue);
        }
        Ok(memory[start..end].to_vec())
    }

    fn write_words(&mut self, bank: MemoryBank, word_address: u32, data: &[u16], session_password: u32) -> Result<(), StatusCode> {
        if bank == MemoryBank::Tid {
            return Err(StatusCode::AccessDenied);
        }
        if self.write_locked(bank) {
            self.check_password(session_password)?;
        }
        let mut image = self.bank(bank).ok_or(StatusCode::InvalidValue)?.into_owned();
        let start = word_address as usize * 2;
        if start + data.len() * 2 > image.len() {
            return Err(StatusCode::InvalidValue);
        }
        for (i, word) in data.iter().enumerate() {
            image[start + i * 2..start + i * 2 + 2].copy_from_slice(&word.to_be_bytes());
        }
        match bank {
            MemoryBank::Reserved => {
                self.kill_password = u32::from_be_bytes([image[0], image[1], image[2], image[3]]);
                self.access_password = u32::from_be_bytes([image[4], image[5], image[6], image[7]]);
            }
            MemoryBank::Epc => {
                self.tag.pc = u16::from_be_bytes([image[2], image[3]]);
                self.tag.epc = image[4..].to_vec();
            }
            MemoryBank::User => self.user = image,
            MemoryBank::Tid => {}
        }
        Ok(())
    }

    /// Apply `op` to this tag. `password` answers a secure read that carried
    /// no password of its own.
    fn apply(&mut self, op: &TagOp, password: Option<u32>, session_password: u32) -> Result<Vec<u8>, StatusCode> {
        if self.departing {
            return Err(StatusCode::TagLost);
        }
        if op.protocol() != self.tag.protocol {
            return Err(StatusCode::TagOpUnsupported);
        }
        match op {
            TagOp::Gen2ReadData {
                bank,
                word_address,
                word_count,
            } => self.read_words(*bank, *word_address, *word_count),
            TagOp::Gen2WriteData {
                bank,
                word_address,
                data,
            } => self.write_words(*bank, *word_address, data, session_password).map(|_| Vec::new()),
            TagOp::Gen2WriteTag { epc } => {
                if self.write_locked(MemoryBank::Epc) {
                    self.check_password(session_password)?;
                }
                self.tag = epc.clone();
                Ok(Vec::new())
            }
            TagOp::Gen2Kill { kill_password } => {
                if *kill_password == 0 || *kill_password != self.kill_password {
                    return Err(StatusCode::AccessDenied);
                }
                self.killed = true;
                Ok(Vec::new())
            }
            TagOp::Gen2Lock {
                access_password,
                mask,
                action,
            } => {
                self.check_password(*access_password)?;
                self.locks = (self.locks & !mask) | (action & mask);
                Ok(Vec::new())
            }
            TagOp::Gen2SecureReadData {
                bank,
                word_address,
                word_count,
                access_password,
            } => {
                let password = access_password.or(password).ok_or(StatusCode::AccessDenied)?;
                self.check_password(password)?;
                self.read_words(*bank, *word_address, *word_count)
            }
            TagOp::MonzaQtRead { access_password } => {
                self.check_password(*access_password)?;
                Ok(vec![0x00, self.qt.to_byte()])
            }
            TagOp::MonzaQtWrite {
                access_password,
                control,
            } => {
                self.check_password(*access_password)?;
                self.qt = *control;
                Ok(Vec::new())
            }
            TagOp::Iso180006bReadData { byte_address, length } => {
                let start = *byte_address as usize;
                let end = start + *length as usize;
                if end > self.user.len() {
                    return Err(StatusCode::InvalidValue);
                }
                Ok(self.user[start..end].to_vec())
            }
        }
    }
}

impl TagMemory for SimTag {
    fn protocol(&self) -> TagProtocol {
        self.tag.protocol
    }

    fn epc(&self) -> &[u8] {
        &self.tag.epc
    }

    fn bank(&self, bank: MemoryBank) -> Option<Cow<'_, [u8]>> {
        match bank {
            MemoryBank::Reserved => Some(Cow::Owned(self.reserved())),
            MemoryBank::Epc => Some(Cow::Owned(epc_bank_image(0, self.tag.pc, &self.tag.epc))),
            MemoryBank::Tid => Some(Cow::Borrowed(&self.tid)),
            MemoryBank::User => Some(Cow::Borrowed(&self.user)),
        }
    }
}

/// Reader-side state shared between the transport and its handle
#[derive(Debug)]
struct SimState {
    firmware: String,
    params: HashMap<ParamKey, ParamValue>,
    tags: Vec<SimTag>,
    last_tag: Option<usize>,
    cycle_time: Option<Duration>,
    reported: u64,
    cycles: u64,
    commands: Vec<u8>,
    line_rate: u32,
    fail_next: Option<(u8, StatusCode)>,
}

impl Default for SimState {
    fn default() -> Self {
        let mut params = HashMap::new();
        let defaults = [
            (ParamKey::VersionSoftware, ParamValue::Str("1.3.0".into())),
            (ParamKey::VersionModel, ParamValue::Str("UHF Simulator".into())),
            (
                ParamKey::SupportedProtocols,
                ParamValue::ProtocolList(vec![TagProtocol::Gen2, TagProtocol::Iso180006b]),
            ),
            (ParamKey::BaudRate, ParamValue::U32(115200)),
            (ParamKey::RegionId, ParamValue::Region(Region::None)),
            (ParamKey::SupportedRegions, ParamValue::RegionList(vec![Region::Na, Region::Eu])),
            (ParamKey::PortList, ParamValue::PortList(vec![1, 2, 3, 4])),
            (ParamKey::ConnectedPortList, ParamValue::PortList(vec![1, 2])),
            (ParamKey::ReadPower, ParamValue::I32(3000)),
            (ParamKey::WritePower, ParamValue::I32(3000)),
            (ParamKey::PowerMin, ParamValue::I32(500)),
            (ParamKey::PowerMax, ParamValue::I32(3150)),
            (ParamKey::Gen2Session, ParamValue::Gen2Session(Gen2Session::S0)),
            (ParamKey::Gen2AccessPassword, ParamValue::U32(0)),
            (ParamKey::AsyncOnTime, ParamValue::U32(250)),
            (ParamKey::AsyncOffTime, ParamValue::U32(0)),
            (ParamKey::TagopProtocol, ParamValue::Protocol(TagProtocol::Gen2)),
            (ParamKey::TagopAntenna, ParamValue::U8(1)),
            (ParamKey::UniqueByAntenna, ParamValue::Bool(false)),
        ];
        params.extend(defaults);
        if let Ok(plan) = ReadPlan::simple(&[1], TagProtocol::Gen2, 1000) {
            params.insert(ParamKey::ReadPlan, ParamValue::ReadPlan(plan));
        }
        Self {
            firmware: "1.3.0".into(),
            params,
            tags: Vec::new(),
            last_tag: None,
            cycle_time: None,
            reported: 0,
            cycles: 0,
            commands: Vec::new(),
            line_rate: 115200,
            fail_next: None,
        }
    }
}

impl SimState {
    fn u32_param(&self, key: ParamKey) -> u32 {
        match self.params.get(&key) {
            Some(ParamValue::U32(v)) => *v,
            _ => 0,
        }
    }
}

/// Test-side handle to a [`SimulatedReader`]
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    pub fn add_tag(&self, tag: SimTag) {
        lock(&self.state).tags.push(tag);
    }

    /// Remove the tag with this EPC. Returns false if none was present.
    pub fn remove_tag(&self, epc: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let before = state.tags.len();
        state.tags.retain(|t| t.tag.epc != epc);
        state.last_tag = None;
        before != state.tags.len()
    }

    pub fn clear_tags(&self) {
        let mut state = lock(&self.state);
        state.tags.clear();
        state.last_tag = None;
    }

    /// Current state of the tag with this EPC
    pub fn tag(&self, epc: &[u8]) -> Option<SimTag> {
        lock(&self.state).tags.iter().find(|t| t.tag.epc == epc).cloned()
    }

    /// Overwrite a parameter without any checks, read-only keys included
    pub fn set_param(&self, key: ParamKey, value: impl Into<ParamValue>) {
        lock(&self.state).params.insert(key, value.into());
    }

    pub fn param(&self, key: ParamKey) -> Option<ParamValue> {
        lock(&self.state).params.get(&key).cloned()
    }

    /// Make the reader answer `NotFound` for `key`
    pub fn remove_param(&self, key: ParamKey) {
        lock(&self.state).params.remove(&key);
    }

    pub fn set_firmware(&self, version: &str) {
        lock(&self.state).firmware = version.to_string();
    }

    /// Length of a read cycle. `None` uses the duration the host asked for.
    pub fn set_cycle_time(&self, cycle_time: Option<Duration>) {
        lock(&self.state).cycle_time = cycle_time;
    }

    /// Answer the next `command` with `status` instead of handling it
    pub fn fail_next(&self, command: u8, status: StatusCode) {
        lock(&self.state).fail_next = Some((command, status));
    }

    /// Tag reports sent so far, summed over all cycles
    pub fn reported_tags(&self) -> u64 {
        lock(&self.state).reported
    }

    pub fn cycles(&self) -> u64 {
        lock(&self.state).cycles
    }

    /// Command codes received, oldest first
    pub fn commands(&self) -> Vec<u8> {
        lock(&self.state).commands.clone()
    }

    /// Line rate the host last applied to the transport
    pub fn line_rate(&self) -> u32 {
        lock(&self.state).line_rate
    }
}

enum Step {
    Report(TagReport),
    Auth { report: TagReport, tag: usize, op: TagOp },
}

struct Cycle {
    steps: VecDeque<Step>,
    awaiting: Option<(TagReport, usize, TagOp)>,
    ends_at: Instant,
    count: u16,
}

/// Transport half of the simulator
pub struct SimulatedReader {
    state: Arc<Mutex<SimState>>,
    decoder: FrameDecoder,
    outbox: VecDeque<u8>,
    cycle: Option<Cycle>,
    open: bool,
}

impl SimulatedReader {
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let reader = Self {
            state: Arc::clone(&state),
            decoder: FrameDecoder::new(),
            outbox: VecDeque::new(),
            cycle: None,
            open: false,
        };
        (reader, SimHandle { state })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "simulated reader not open"))
        }
    }

    fn push(&mut self, frame: Frame) {
        self.outbox.extend(frame.encode());
    }

    fn respond(&mut self, command: u8, status: StatusCode, body: &[u8]) {
        self.push(Frame::response(command, status, body));
    }

    fn push_report(&mut self, frame_type: FrameType, report: &TagReport) {
        let mut payload = BytesMut::new();
        codec::encode_tag_report(report, &mut payload);
        self.push(Frame {
            frame_type,
            command: frame::READ_CYCLE,
            payload: payload.to_vec(),
        });
    }

    fn handle(&mut self, frame: Frame) {
        if frame.frame_type != FrameType::Command {
            warn!("Simulator ignoring {:?} frame", frame.frame_type);
            return;
        }
        let injected = {
            let mut state = lock(&self.state);
            state.commands.push(frame.command);
            match state.fail_next {
                Some((command, status)) if command == frame.command => {
                    state.fail_next = None;
                    Some(status)
                }
                _ => None,
            }
        };
        if let Some(status) = injected {
            debug!("Simulator failing cmd 0x{:02X} with {:?}", frame.command, status);
            return self.respond(frame.command, status, &[]);
        }

        let result = match frame.command {
            frame::GET_FIRMWARE => Ok(lock(&self.state).firmware.clone().into_bytes()),
            frame::GET_PARAM => self.get_param(&frame.payload),
            frame::SET_PARAM => self.set_param(&frame.payload).map(|_| Vec::new()),
            frame::READ_CYCLE => match frame.payload[..] {
                [hi, lo] => self.start_cycle(u16::from_be_bytes([hi, lo])).map(|_| Vec::new()),
                _ => Err(StatusCode::InvalidValue),
            },
            frame::EXEC_TAG_OP => self.exec_tag_op(&frame.payload),
            frame::AUTH_RESPONSE => return self.auth_response(&frame.payload),
            _ => Err(StatusCode::NotFound),
        };
        match result {
            // A started cycle answers once it ends
            Ok(_) if frame.command == frame::READ_CYCLE => {}
            Ok(body) => self.respond(frame.command, StatusCode::Success, &body),
            Err(status) => self.respond(frame.command, status, &[]),
        }
    }

    fn key(payload: &[u8]) -> Result<ParamKey, StatusCode> {
        match payload {
            [hi, lo, ..] => ParamKey::from_code(u16::from_be_bytes([*hi, *lo])).ok_or(StatusCode::NotFound),
            _ => Err(StatusCode::InvalidValue),
        }
    }

    fn get_param(&self, payload: &[u8]) -> Result<Vec<u8>, StatusCode> {
        let key = Self::key(payload)?;
        let state = lock(&self.state);
        let value = state.params.get(&key).ok_or(StatusCode::NotFound)?;
        let mut body = BytesMut::new();
        codec::encode_value(value, &mut body);
        Ok(body.to_vec())
    }

    fn set_param(&self, payload: &[u8]) -> Result<(), StatusCode> {
        let key = Self::key(payload)?;
        if key.is_read_only() {
            return Err(StatusCode::ReadOnly);
        }
        let mut body = &payload[2..];
        let value = codec::decode_value(key.param_type(), &mut body).map_err(|_| StatusCode::InvalidValue)?;

        let mut state = lock(&self.state);
        match &value {
            ParamValue::Region(region) => {
                let supported = matches!(
                    state.params.get(&ParamKey::SupportedRegions),
                    Some(ParamValue::RegionList(list)) if list.contains(region)
                );
                if !supported {
                    return Err(StatusCode::InvalidRegion);
                }
            }
            ParamValue::ReadPlan(_) => {
                if matches!(state.params.get(&ParamKey::RegionId), Some(ParamValue::Region(Region::None))) {
                    return Err(StatusCode::InvalidRegion);
                }
            }
            ParamValue::U32(rate) if key == ParamKey::BaudRate => {
                debug!("Simulator switching to {} baud", rate);
            }
            _ => {}
        }
        state.params.insert(key, value);
        Ok(())
    }

    fn start_cycle(&mut self, duration_ms: u16) -> Result<(), StatusCode> {
        let started = Instant::now();
        let mut state = lock(&self.state);
        if matches!(state.params.get(&ParamKey::RegionId), Some(ParamValue::Region(Region::None))) {
            return Err(StatusCode::InvalidRegion);
        }
        let plan = match state.params.get(&ParamKey::ReadPlan) {
            Some(ParamValue::ReadPlan(plan)) => plan.clone(),
            _ => return Err(StatusCode::InvalidValue),
        };
        let unique_by_antenna = matches!(state.params.get(&ParamKey::UniqueByAntenna), Some(ParamValue::Bool(true)));
        let session_password = state.u32_param(ParamKey::Gen2AccessPassword);

        let mut steps: Vec<Step> = Vec::new();
        let mut seen: HashMap<(TagData, Option<u8>), usize> = HashMap::new();
        let mut stopped = false;

        for (leaf, _share) in plan.schedule(duration_ms as u32) {
            let mut found = 0u32;
            for index in 0..state.tags.len() {
                let tag = &state.tags[index];
                let visible = !tag.killed
                    && leaf.antennas().contains(&tag.antenna)
                    && tag.tag.protocol == leaf.protocol()
                    && leaf.filter().is_none_or(|f| f.matches(tag));
                if !visible {
                    continue;
                }
                let key = (tag.tag.clone(), unique_by_antenna.then_some(tag.antenna));
                if let Some(&at) = seen.get(&key) {
                    match &mut steps[at] {
                        Step::Report(report) | Step::Auth { report, .. } => report.read_count += 1,
                    }
                    continue;
                }

                let elapsed = started.elapsed();
                let mut report = TagReport {
                    tag: tag.tag.clone(),
                    antenna: tag.antenna,
                    read_count: 1,
                    rssi: tag.rssi,
                    offset_ms: elapsed.as_millis() as u32,
                    micros: (elapsed.as_micros() % 1000) as u16,
                    data: Vec::new(),
                };
                let step = match leaf.tag_op() {
                    Some(op) if op.needs_auth_request() => Step::Auth {
                        report,
                        tag: index,
                        op: op.clone(),
                    },
                    Some(op) => {
                        match state.tags[index].apply(op, None, session_password) {
                            Ok(data) => report.data = data,
                            Err(status) => debug!("Embedded {} failed: {:?}", op.name(), status),
                        }
                        Step::Report(report)
                    }
                    None => Step::Report(report),
                };
                seen.insert(key, steps.len());
                steps.push(step);
                state.last_tag = Some(index);
                found += 1;

                if leaf.stop_on_count().is_some_and(|n| found >= n) {
                    stopped = true;
                    break;
                }
            }
            if stopped {
                break;
            }
        }

        let length = state
            .cycle_time
            .unwrap_or(Duration::from_millis(duration_ms as u64));
        state.cycles += 1;
        state.reported += steps.len() as u64;
        debug!("Simulated cycle: {} tags, {:?}", steps.len(), length);

        self.cycle = Some(Cycle {
            count: steps.len() as u16,
            steps: steps.into(),
            awaiting: None,
            ends_at: if stopped { started } else { started + length },
        });
        Ok(())
    }

    fn auth_response(&mut self, payload: &[u8]) {
        let Some((mut report, index, op)) = self.cycle.as_mut().and_then(|c| c.awaiting.take()) else {
            return self.respond(frame::AUTH_RESPONSE, StatusCode::InvalidValue, &[]);
        };
        let password = match payload {
            [1, a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        };
        let outcome = {
            let mut state = lock(&self.state);
            let session_password = state.u32_param(ParamKey::Gen2AccessPassword);
            match state.tags.get_mut(index) {
                Some(tag) => tag.apply(&op, password, session_password),
                None => Err(StatusCode::TagLost),
            }
        };
        let status = match outcome {
            Ok(data) => {
                report.data = data;
                StatusCode::Success
            }
            Err(status) => status,
        };
        self.push_report(FrameType::Tag, &report);
        self.respond(frame::AUTH_RESPONSE, status, &[]);
    }

    fn exec_tag_op(&mut self, payload: &[u8]) -> Result<Vec<u8>, StatusCode> {
        let mut buf = payload;
        let op = codec::decode_tag_op(&mut buf).map_err(|_| StatusCode::InvalidValue)?;
        let filter = match buf.first() {
            Some(1) => {
                buf = &buf[1..];
                Some(codec::decode_filter(&mut buf).map_err(|_| StatusCode::InvalidFilter)?)
            }
            _ => None,
        };

        let mut state = lock(&self.state);
        if !matches!(state.params.get(&ParamKey::TagopProtocol), Some(ParamValue::Protocol(p)) if *p == op.protocol()) {
            return Err(StatusCode::TagOpUnsupported);
        }
        let antenna = match state.params.get(&ParamKey::TagopAntenna) {
            Some(ParamValue::U8(antenna)) => *antenna,
            _ => 1,
        };
        let session_password = state.u32_param(ParamKey::Gen2AccessPassword);

        let candidate = |tag: &SimTag| !tag.killed && tag.antenna == antenna && tag.tag.protocol == op.protocol();
        let target = match &filter {
            Some(filter) => state.tags.iter().position(|t| candidate(t) && filter.matches(t)),
            None => state
                .last_tag
                .filter(|&i| state.tags.get(i).is_some_and(candidate))
                .or_else(|| state.tags.iter().position(candidate)),
        };
        let index = target.ok_or(StatusCode::NoTags)?;
        state.last_tag = Some(index);
        state.tags[index].apply(&op, None, session_password)
    }

    /// Move queued cycle output into the outbox
    fn pump(&mut self) {
        loop {
            let Some(cycle) = self.cycle.as_mut() else {
                return;
            };
            if cycle.awaiting.is_some() {
                return;
            }
            match cycle.steps.pop_front() {
                Some(Step::Report(report)) => self.push_report(FrameType::Tag, &report),
                Some(Step::Auth { report, tag, op }) => {
                    cycle.awaiting = Some((report.clone(), tag, op));
                    self.push_report(FrameType::AuthRequest, &report);
                    return;
                }
                None => {
                    if Instant::now() < cycle.ends_at {
                        return;
                    }
                    let count = cycle.count;
                    self.cycle = None;
                    self.respond(frame::READ_CYCLE, StatusCode::Success, &count.to_be_bytes());
                    return;
                }
            }
        }
    }
}

impl Transport for SimulatedReader {
    type Error = io::Error;

    fn open(&mut self) -> Result<(), Self::Error> {
        self.open = true;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8], _timeout_ms: u32) -> Result<(), Self::Error> {
        self.ensure_open()?;
        self.decoder.feed(data);
        while let Some(frame) = self.decoder.next_frame() {
            self.handle(frame);
        }
        Ok(())
    }

    fn receive_bytes(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        self.ensure_open()?;
        self.pump();
        if self.outbox.is_empty() {
            let timeout = Duration::from_millis(timeout_ms.max(1) as u64);
            let wait = match &self.cycle {
                Some(cycle) if cycle.awaiting.is_none() && cycle.steps.is_empty() => {
                    timeout.min(cycle.ends_at.saturating_duration_since(Instant::now()))
                }
                _ => timeout.min(IDLE_POLL),
            };
            thread::sleep(wait);
            self.pump();
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_baud_rate(&mut self, rate: u32) -> Result<(), Self::Error> {
        lock(&self.state).line_rate = rate;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.outbox.clear();
        self.decoder.clear();
        self.cycle = None;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), Self::Error> {
        self.open = false;
        self.cycle = None;
        Ok(())
    }
}
