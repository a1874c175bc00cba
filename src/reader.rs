use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::caps::Capabilities;
use crate::codec::{self, TagReport};
use crate::config::ReaderConfig;
use crate::error::{ReaderError, Result};
use crate::filter::TagFilter;
use crate::frame::{self, Frame, FrameDecoder, FrameType};
use crate::param::{FromParam, ParamKey, ParamValue, type_mismatch};
use crate::plan::ReadPlan;
use crate::session::{Listeners, SessionState};
use crate::tagop::TagOp;
use crate::transport::Transport;
use crate::types::{Region, TagProtocol, TagReadData};

/// Longest read cycle the reader accepts, in milliseconds
pub const MAX_READ_DURATION_MS: u32 = 65535;

/// Whether the reader has a usable region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Region is `NONE`; read plans cannot be committed
    Unresolved,
    Resolved(Region),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Transport plus receive state. Held behind one lock so that commands from
/// the caller and the background read loop never interleave on the wire.
pub(crate) struct Link<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
}

impl<T: Transport> Link<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
        }
    }

    fn send(&mut self, frame: &Frame, timeout_ms: u32) -> Result<()> {
        let bytes = frame.encode();
        debug!("Sending command: {:02X?}", bytes);
        self.transport
            .send_bytes(&bytes, timeout_ms)
            .map_err(ReaderError::transport)
    }

    fn start_command(&mut self, frame: &Frame, timeout_ms: u32) -> Result<()> {
        self.transport.flush().map_err(ReaderError::transport)?;
        self.decoder.clear();
        self.send(frame, timeout_ms)
    }

    fn receive_frame(&mut self, deadline: Instant, budget_ms: u64) -> Result<Frame> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                debug!(
                    "Received frame type {:?} cmd 0x{:02X} ({} bytes)",
                    frame.frame_type,
                    frame.command,
                    frame.payload.len()
                );
                return Ok(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ReaderError::Timeout(budget_ms));
            }
            let wait = (deadline - now).as_millis().clamp(1, 50) as u32;
            match self.transport.receive_bytes(&mut chunk, wait) {
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(e) => {
                    error!("Read error: {:?}", e);
                    return Err(ReaderError::transport(e));
                }
            }
        }
    }

    /// Send one command and wait for its response. `context` names the
    /// command or key in error messages.
    fn exec(&mut self, frame: Frame, timeout_ms: u32, context: &str) -> Result<Frame> {
        self.start_command(&frame, timeout_ms)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let response = self.receive_frame(deadline, timeout_ms as u64)?;
            if response.frame_type == FrameType::Response && response.command == frame.command {
                response.status()?.into_result(context)?;
                return Ok(response);
            }
            warn!(
                "Ignoring unexpected frame type {:?} cmd 0x{:02X} while waiting for 0x{:02X}",
                response.frame_type, response.command, frame.command
            );
        }
    }

    fn get_param(&mut self, key: ParamKey, timeout_ms: u32) -> Result<ParamValue> {
        let frame = Frame::command(frame::GET_PARAM, key.code().to_be_bytes().to_vec());
        let response = self.exec(frame, timeout_ms, key.path())?;
        let mut body = response.body();
        codec::decode_value(key.param_type(), &mut body)
    }

    fn set_param(&mut self, key: ParamKey, value: &ParamValue, timeout_ms: u32) -> Result<()> {
        let mut payload = BytesMut::new();
        payload.put_u16(key.code());
        codec::encode_value(value, &mut payload);
        self.exec(Frame::command(frame::SET_PARAM, payload.to_vec()), timeout_ms, key.path())?;
        if let (ParamKey::BaudRate, ParamValue::U32(rate)) = (key, value) {
            debug!("Switching transport to {} baud", rate);
            self.transport
                .set_baud_rate(*rate)
                .map_err(ReaderError::transport)?;
        }
        Ok(())
    }

    /// Run one read cycle on the committed plan.
    ///
    /// Tags are handed to `on_tag` in arrival order. Auth requests are answered
    /// with whatever `auth` returns; a rejected answer is reported through
    /// `on_error` and the cycle goes on. Returns the reader's tag count.
    pub(crate) fn read_cycle(
        &mut self,
        duration_ms: u16,
        command_timeout_ms: u32,
        auth: Option<&(dyn Fn(&TagReadData) -> Option<u32> + Send + Sync)>,
        on_tag: &mut dyn FnMut(TagReadData),
        on_error: &mut dyn FnMut(ReaderError),
    ) -> Result<u16> {
        let request = Frame::command(frame::READ_CYCLE, duration_ms.to_be_bytes().to_vec());
        self.start_command(&request, command_timeout_ms)?;

        let cycle_start = now_ms();
        let budget_ms = duration_ms as u64 + command_timeout_ms as u64;
        let deadline = Instant::now() + Duration::from_millis(budget_ms);

        loop {
            let frame = self.receive_frame(deadline, budget_ms)?;
            match (frame.frame_type, frame.command) {
                (FrameType::Tag, frame::READ_CYCLE) => {
                    let mut payload = &frame.payload[..];
                    match codec::decode_tag_report(&mut payload) {
                        Ok(report) => on_tag(report.into_read_data(cycle_start)),
                        Err(e) => warn!("Failed to parse tag report: {:?}", e),
                    }
                }
                (FrameType::AuthRequest, _) => {
                    let mut payload = &frame.payload[..];
                    let report: TagReport = codec::decode_tag_report(&mut payload)?;
                    let tag = report.into_read_data(cycle_start);
                    let password = auth.and_then(|listener| listener(&tag));
                    if password.is_none() {
                        debug!("No password for tag {}", tag.epc_hex());
                    }
                    let mut answer = Vec::with_capacity(5);
                    match password {
                        Some(password) => {
                            answer.push(0x01);
                            answer.extend_from_slice(&password.to_be_bytes());
                        }
                        None => answer.push(0x00),
                    }
                    self.send(&Frame::command(frame::AUTH_RESPONSE, answer), command_timeout_ms)?;
                }
                (FrameType::Response, frame::AUTH_RESPONSE) => {
                    if let Err(e) = frame.status()?.into_result("auth response") {
                        on_error(e);
                    }
                }
                (FrameType::Response, frame::READ_CYCLE) => {
                    frame.status()?.into_result("read cycle")?;
                    let body = frame.body();
                    if body.len() < 2 {
                        return Err(ReaderError::invalid_response("Read cycle response without tag count"));
                    }
                    return Ok(u16::from_be_bytes([body[0], body[1]]));
                }
                (frame_type, command) => {
                    warn!("Ignoring frame type {:?} cmd 0x{:02X} during read cycle", frame_type, command);
                }
            }
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown().map_err(ReaderError::transport)
    }
}

/// State shared between the caller's handle and the background threads.
pub(crate) struct Shared<T: Transport> {
    pub(crate) link: Mutex<Link<T>>,
    pub(crate) config: ReaderConfig,
    pub(crate) caps: Mutex<Capabilities>,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) listeners: Mutex<Listeners>,
    pub(crate) buffer: Mutex<VecDeque<TagReadData>>,
}

/// A connected reader.
///
/// All methods take `&self`; wrap the reader in an `Arc` to use it from
/// several threads. Commands from different threads are serialised on the
/// transport. Only one read session (sync or async) runs at a time.
pub struct Reader<T: Transport + Send + 'static> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Transport + Send + 'static> Reader<T> {
    /// Open the transport, check that a reader answers, and take the
    /// capability snapshot.
    pub fn connect(mut transport: T, config: ReaderConfig) -> Result<Self> {
        transport.open().map_err(ReaderError::transport)?;
        transport.flush().map_err(ReaderError::transport)?;

        let shared = Arc::new(Shared {
            link: Mutex::new(Link::new(transport)),
            config,
            caps: Mutex::new(Capabilities::default()),
            session: Mutex::new(SessionState::Idle),
            listeners: Mutex::new(Listeners::default()),
            buffer: Mutex::new(VecDeque::new()),
        });
        let reader = Self { shared };

        let firmware = reader.firmware_version()?;
        let caps = reader.refresh_capabilities()?;
        info!(
            "Connected to {} (firmware {}), connected ports {:?}",
            caps.model, firmware, caps.connected_ports
        );
        Ok(reader)
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.shared.config
    }

    fn timeout_ms(&self) -> u32 {
        self.shared.config.command_timeout_ms()
    }

    /// Get firmware version
    pub fn firmware_version(&self) -> Result<String> {
        let response = lock(&self.shared.link).exec(
            Frame::command(frame::GET_FIRMWARE, vec![0x01]),
            self.timeout_ms(),
            "firmware version",
        )?;
        Ok(String::from_utf8_lossy(response.body()).to_string())
    }

    /// Capability snapshot taken at connect time (or the last refresh)
    pub fn capabilities(&self) -> Capabilities {
        lock(&self.shared.caps).clone()
    }

    /// Query the reader again and replace the capability snapshot.
    pub fn refresh_capabilities(&self) -> Result<Capabilities> {
        let caps = Capabilities {
            model: self.optional(ParamKey::VersionModel, String::new())?,
            firmware: self.optional(ParamKey::VersionSoftware, String::new())?,
            ports: self.get(ParamKey::PortList)?,
            connected_ports: self.get(ParamKey::ConnectedPortList)?,
            supported_regions: self.supported_regions()?,
            protocols: self.optional(ParamKey::SupportedProtocols, vec![TagProtocol::Gen2])?,
            power_min: self.optional(ParamKey::PowerMin, i32::MIN)?,
            power_max: self.optional(ParamKey::PowerMax, i32::MAX)?,
        };
        *lock(&self.shared.caps) = caps.clone();
        Ok(caps)
    }

    fn optional<V: FromParam>(&self, key: ParamKey, default: V) -> Result<V> {
        match self.get(key) {
            Err(ReaderError::NotFound(_)) => {
                debug!("Reader does not report {}", key);
                Ok(default)
            }
            other => other,
        }
    }

    fn supported_regions(&self) -> Result<Vec<Region>> {
        let mut regions: Vec<Region> = self.get(ParamKey::SupportedRegions)?;
        let limit = self.shared.config.max_regions;
        if regions.len() > limit {
            warn!("Reader lists {} regions, keeping the first {}", regions.len(), limit);
            regions.truncate(limit);
        }
        Ok(regions)
    }

    // ===================
    // Parameter store
    // ===================

    /// Fetch a parameter value from the reader. Nothing is cached.
    pub fn param(&self, key: ParamKey) -> Result<ParamValue> {
        lock(&self.shared.link).get_param(key, self.timeout_ms())
    }

    /// Fetch a parameter as a concrete type. Asking for the wrong type fails
    /// with `InvalidType` before anything is sent.
    pub fn get<V: FromParam>(&self, key: ParamKey) -> Result<V> {
        if V::TYPE != key.param_type() {
            return Err(type_mismatch(key, V::TYPE));
        }
        let value = self.param(key)?;
        let found = value.param_type();
        V::from_param(value).ok_or_else(|| type_mismatch(key, found))
    }

    /// Fetch a parameter by its path name
    pub fn get_by_path(&self, path: &str) -> Result<ParamValue> {
        self.param(ParamKey::from_path(path)?)
    }

    /// Validate a value against the key and the capability snapshot, then
    /// store it on the reader.
    pub fn set(&self, key: ParamKey, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into();
        {
            let caps = lock(&self.shared.caps);
            key.validate(&value, &caps, self.shared.config.max_subplans)?;
        }
        if key == ParamKey::ReadPlan && self.region_state()? == RegionState::Unresolved {
            return Err(ReaderError::InvalidRegion(
                "Region is NONE; resolve it before committing a read plan".into(),
            ));
        }
        lock(&self.shared.link).set_param(key, &value, self.timeout_ms())
    }

    /// Store a parameter by its path name
    pub fn set_by_path(&self, path: &str, value: impl Into<ParamValue>) -> Result<()> {
        self.set(ParamKey::from_path(path)?, value)
    }

    // ===================
    // Region
    // ===================

    pub fn region_state(&self) -> Result<RegionState> {
        let region: Region = self.get(ParamKey::RegionId)?;
        Ok(match region {
            Region::None => RegionState::Unresolved,
            region => RegionState::Resolved(region),
        })
    }

    /// Make sure a region is set. An unset region becomes the first entry of
    /// the supported-region list; a set region is left alone.
    pub fn resolve_region(&self) -> Result<Region> {
        if let RegionState::Resolved(region) = self.region_state()? {
            return Ok(region);
        }
        let regions = self.supported_regions()?;
        let region = regions
            .iter()
            .copied()
            .find(|&r| r != Region::None)
            .ok_or_else(|| ReaderError::InvalidRegion("Reader reports no supported regions".into()))?;
        {
            let mut caps = lock(&self.shared.caps);
            if !caps.supports_region(region) {
                caps.supported_regions = regions.clone();
            }
        }
        self.set(ParamKey::RegionId, region)?;
        info!("Region resolved to {}", region);
        Ok(region)
    }

    // ===================
    // Read plan
    // ===================

    /// Validate `plan` against the reader and make it the active plan.
    pub fn commit_plan(&self, plan: &ReadPlan) -> Result<()> {
        self.set(ParamKey::ReadPlan, plan.clone())
    }

    /// Plan currently staged on the reader
    pub fn committed_plan(&self) -> Result<ReadPlan> {
        self.get(ParamKey::ReadPlan)
    }

    // ===================
    // Synchronous read
    // ===================

    /// Run one read cycle on the committed plan for up to `duration_ms`,
    /// blocking the caller. Tags are buffered for [`Reader::get_next_tag`].
    ///
    /// Tags left over from an earlier read are discarded. Fails with
    /// `SessionActive` while an async session runs.
    pub fn read(&self, duration_ms: u32) -> Result<usize> {
        if duration_ms > MAX_READ_DURATION_MS {
            return Err(ReaderError::InvalidValue(format!(
                "Read duration {} ms exceeds {} ms",
                duration_ms, MAX_READ_DURATION_MS
            )));
        }
        let _session = self.begin_sync()?;

        {
            let mut buffer = lock(&self.shared.buffer);
            if !buffer.is_empty() {
                warn!("Discarding {} undrained tags from the previous read", buffer.len());
                buffer.clear();
            }
        }

        let auth = lock(&self.shared.listeners).auth_listener();
        let mut tags = Vec::new();
        let mut failure = None;
        let reported = lock(&self.shared.link).read_cycle(
            duration_ms as u16,
            self.timeout_ms(),
            auth.as_deref(),
            &mut |tag| tags.push(tag),
            &mut |e| {
                failure.get_or_insert(e);
            },
        )?;
        if reported as usize != tags.len() {
            warn!("Reader reported {} tags, received {}", reported, tags.len());
        }

        let count = tags.len();
        lock(&self.shared.buffer).extend(tags);
        debug!("Read cycle finished with {} tags", count);
        match failure {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// `Ok` while buffered tags remain, `NoTags` once they are drained.
    pub fn has_more_tags(&self) -> Result<()> {
        if lock(&self.shared.buffer).is_empty() {
            Err(ReaderError::NoTags)
        } else {
            Ok(())
        }
    }

    /// Take the next buffered tag. Consumed tags are never returned again.
    pub fn get_next_tag(&self) -> Result<TagReadData> {
        lock(&self.shared.buffer).pop_front().ok_or(ReaderError::NoTags)
    }

    /// Read for `duration_ms` and drain the buffer in arrival order
    pub fn read_tags(&self, duration_ms: u32) -> Result<Vec<TagReadData>> {
        self.read(duration_ms)?;
        Ok(lock(&self.shared.buffer).drain(..).collect())
    }

    // ===================
    // Tag operations
    // ===================

    /// Apply `op` to the tag matching `filter`, or to the tag singulated
    /// last when no filter is given. Returns the data the operation produced
    /// (empty for writes). Never retried.
    pub fn execute_tag_op(&self, op: &TagOp, filter: Option<&TagFilter>) -> Result<Vec<u8>> {
        op.validate()?;
        if op.needs_auth_request() {
            return Err(ReaderError::AccessDenied);
        }
        if let Some(filter) = filter {
            if filter.protocol() != op.protocol() {
                return Err(ReaderError::InvalidFilter(format!(
                    "Filter is for {:?} but {} is a {:?} operation",
                    filter.protocol(),
                    op.name(),
                    op.protocol()
                )));
            }
        }
        let tagop_protocol: TagProtocol = self.get(ParamKey::TagopProtocol)?;
        if op.protocol() != tagop_protocol {
            return Err(ReaderError::TagOpUnsupported(format!(
                "{} needs {:?} but /reader/tagop/protocol is {:?}",
                op.name(),
                op.protocol(),
                tagop_protocol
            )));
        }

        let mut payload = BytesMut::new();
        codec::encode_tag_op(op, &mut payload);
        match filter {
            Some(filter) => {
                payload.put_u8(1);
                codec::encode_filter(filter, &mut payload);
            }
            None => payload.put_u8(0),
        }
        let response = lock(&self.shared.link).exec(
            Frame::command(frame::EXEC_TAG_OP, payload.to_vec()),
            self.timeout_ms(),
            op.name(),
        )?;
        debug!("{} returned {} bytes", op.name(), response.body().len());
        Ok(response.body().to_vec())
    }

    // ===================
    // Shutdown
    // ===================

    /// Stop any async session and close the transport
    pub fn shutdown(self) -> Result<()> {
        if self.is_reading() {
            self.stop_reading()?;
        }
        info!("Shutting down reader");
        lock(&self.shared.link).shutdown()
    }

    fn begin_sync(&self) -> Result<SyncGuard<'_, T>> {
        let mut state = lock(&self.shared.session);
        state.settle();
        if !matches!(*state, SessionState::Idle) {
            return Err(ReaderError::SessionActive);
        }
        *state = SessionState::Sync;
        Ok(SyncGuard { shared: &self.shared })
    }
}

/// Returns the session to idle when a sync read ends, even on error.
struct SyncGuard<'a, T: Transport> {
    shared: &'a Shared<T>,
}

impl<T: Transport> Drop for SyncGuard<'_, T> {
    fn drop(&mut self) {
        *lock(&self.shared.session) = SessionState::Idle;
    }
}

impl<T: Transport + Send + 'static> Drop for Reader<T> {
    fn drop(&mut self) {
        if self.is_reading() {
            if let Err(e) = self.stop_reading() {
                warn!("Read loop did not stop cleanly: {}", e);
            }
        }
    }
}
