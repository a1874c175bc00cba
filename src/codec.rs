//! Marshalling of parameter values, read plans, filters, tag operations and
//! tag reports.
//!
//! Values carry no type tag of their own; the parameter key decides how the
//! bytes are read. Integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};
use log::warn;

use crate::error::{ReaderError, Result};
use crate::filter::{Gen2Select, TagFilter};
use crate::param::{ParamType, ParamValue};
use crate::plan::{MultiReadPlan, ReadPlan, SimpleReadPlan};
use crate::tagop::{QtControl, TagOp};
use crate::types::{Gen2Session, MemoryBank, Region, TagData, TagProtocol, TagReadData};

const PLAN_SIMPLE: u8 = 0x01;
const PLAN_MULTI: u8 = 0x02;

const FILTER_TAG_DATA: u8 = 0x01;
const FILTER_GEN2_SELECT: u8 = 0x02;

const OP_READ_DATA: u8 = 0x01;
const OP_WRITE_DATA: u8 = 0x02;
const OP_WRITE_TAG: u8 = 0x03;
const OP_KILL: u8 = 0x04;
const OP_LOCK: u8 = 0x05;
const OP_SECURE_READ_DATA: u8 = 0x06;
const OP_MONZA_QT_READ: u8 = 0x07;
const OP_MONZA_QT_WRITE: u8 = 0x08;
const OP_ISO6B_READ_DATA: u8 = 0x09;

// Simple plan flag bits
const HAS_FILTER: u8 = 0x01;
const HAS_TAG_OP: u8 = 0x02;
const HAS_STOP_COUNT: u8 = 0x04;

/// Nesting limit for multi plans coming off the wire
const MAX_PLAN_DEPTH: usize = 8;

fn truncated(what: &str) -> ReaderError {
    ReaderError::InvalidResponse(format!("Truncated {}", what))
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        Err(truncated(what))
    } else {
        Ok(())
    }
}

fn get_bytes(buf: &mut &[u8], len: usize, what: &str) -> Result<Vec<u8>> {
    need(buf, len, what)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn region(code: u8) -> Result<Region> {
    Region::from_u8(code).ok_or_else(|| ReaderError::InvalidResponse(format!("Unknown region 0x{:02X}", code)))
}

fn protocol(code: u8) -> Result<TagProtocol> {
    TagProtocol::from_u8(code).ok_or_else(|| ReaderError::InvalidResponse(format!("Unknown protocol 0x{:02X}", code)))
}

fn bank(code: u8) -> Result<MemoryBank> {
    MemoryBank::from_u8(code).ok_or_else(|| ReaderError::InvalidFilter(format!("Unknown memory bank {}", code)))
}

/// Lists carry a one-byte count; anything past 255 entries is left off.
fn put_list<T: Copy>(out: &mut BytesMut, items: &[T], code: impl Fn(T) -> u8) {
    let max = u8::MAX as usize;
    if items.len() > max {
        warn!("List of {} entries truncated to {}", items.len(), max);
    }
    let items = &items[..items.len().min(max)];
    out.put_u8(items.len() as u8);
    for &item in items {
        out.put_u8(code(item));
    }
}

fn get_list<T>(buf: &mut &[u8], what: &str, parse: impl Fn(u8) -> Result<T>) -> Result<Vec<T>> {
    need(buf, 1, what)?;
    let count = buf.get_u8() as usize;
    need(buf, count, what)?;
    (0..count).map(|_| parse(buf.get_u8())).collect()
}

pub fn encode_value(value: &ParamValue, out: &mut BytesMut) {
    match value {
        ParamValue::Bool(v) => out.put_u8(*v as u8),
        ParamValue::U8(v) => out.put_u8(*v),
        ParamValue::U32(v) => out.put_u32(*v),
        ParamValue::I32(v) => out.put_i32(*v),
        ParamValue::Str(v) => {
            let bytes = &v.as_bytes()[..v.len().min(u8::MAX as usize)];
            out.put_u8(bytes.len() as u8);
            out.put_slice(bytes);
        }
        ParamValue::Region(v) => out.put_u8(*v as u8),
        ParamValue::RegionList(v) => put_list(out, v, |r| r as u8),
        ParamValue::PortList(v) => put_list(out, v, |p| p),
        ParamValue::Protocol(v) => out.put_u8(*v as u8),
        ParamValue::ProtocolList(v) => put_list(out, v, |p| p as u8),
        ParamValue::Gen2Session(v) => out.put_u8(*v as u8),
        ParamValue::ReadPlan(plan) => encode_plan(plan, out),
    }
}

pub fn decode_value(param_type: ParamType, buf: &mut &[u8]) -> Result<ParamValue> {
    let what = "parameter value";
    let value = match param_type {
        ParamType::Bool => {
            need(buf, 1, what)?;
            ParamValue::Bool(buf.get_u8() != 0)
        }
        ParamType::U8 => {
            need(buf, 1, what)?;
            ParamValue::U8(buf.get_u8())
        }
        ParamType::U32 => {
            need(buf, 4, what)?;
            ParamValue::U32(buf.get_u32())
        }
        ParamType::I32 => {
            need(buf, 4, what)?;
            ParamValue::I32(buf.get_i32())
        }
        ParamType::Str => {
            need(buf, 1, what)?;
            let len = buf.get_u8() as usize;
            let bytes = get_bytes(buf, len, what)?;
            ParamValue::Str(String::from_utf8_lossy(&bytes).into_owned())
        }
        ParamType::Region => {
            need(buf, 1, what)?;
            ParamValue::Region(region(buf.get_u8())?)
        }
        ParamType::RegionList => ParamValue::RegionList(get_list(buf, what, region)?),
        ParamType::PortList => ParamValue::PortList(get_list(buf, what, Ok)?),
        ParamType::Protocol => {
            need(buf, 1, what)?;
            ParamValue::Protocol(protocol(buf.get_u8())?)
        }
        ParamType::ProtocolList => ParamValue::ProtocolList(get_list(buf, what, protocol)?),
        ParamType::Gen2Session => {
            need(buf, 1, what)?;
            let raw = buf.get_u8();
            ParamValue::Gen2Session(
                Gen2Session::from_u8(raw)
                    .ok_or_else(|| ReaderError::InvalidResponse(format!("Unknown session {}", raw)))?,
            )
        }
        ParamType::ReadPlan => ParamValue::ReadPlan(decode_plan(buf)?),
    };
    Ok(value)
}

pub fn encode_plan(plan: &ReadPlan, out: &mut BytesMut) {
    match plan {
        ReadPlan::Simple(plan) => {
            out.put_u8(PLAN_SIMPLE);
            out.put_u32(plan.weight());
            out.put_u8(plan.protocol() as u8);
            put_list(out, plan.antennas(), |p| p);
            let mut flags = 0;
            if plan.filter().is_some() {
                flags |= HAS_FILTER;
            }
            if plan.tag_op().is_some() {
                flags |= HAS_TAG_OP;
            }
            if plan.stop_on_count().is_some() {
                flags |= HAS_STOP_COUNT;
            }
            out.put_u8(flags);
            if let Some(filter) = plan.filter() {
                encode_filter(filter, out);
            }
            if let Some(op) = plan.tag_op() {
                encode_tag_op(op, out);
            }
            if let Some(count) = plan.stop_on_count() {
                out.put_u32(count);
            }
        }
        ReadPlan::Multi(plan) => {
            out.put_u8(PLAN_MULTI);
            out.put_u32(plan.weight());
            out.put_u8(plan.plans().len() as u8);
            for sub in plan.plans() {
                encode_plan(sub, out);
            }
        }
    }
}

pub fn decode_plan(buf: &mut &[u8]) -> Result<ReadPlan> {
    decode_plan_at(buf, 0)
}

fn decode_plan_at(buf: &mut &[u8], depth: usize) -> Result<ReadPlan> {
    if depth > MAX_PLAN_DEPTH {
        return Err(ReaderError::InvalidValue("Read plan nested too deeply".into()));
    }
    let what = "read plan";
    need(buf, 5, what)?;
    let kind = buf.get_u8();
    let weight = buf.get_u32();
    match kind {
        PLAN_SIMPLE => {
            need(buf, 1, what)?;
            let protocol = protocol(buf.get_u8())?;
            let antennas = get_list(buf, what, Ok)?;
            need(buf, 1, what)?;
            let flags = buf.get_u8();
            let mut plan = SimpleReadPlan::new(&antennas, protocol, weight)?;
            if flags & HAS_FILTER != 0 {
                plan.set_filter(Some(decode_filter(buf)?));
            }
            if flags & HAS_TAG_OP != 0 {
                plan.set_tag_op(Some(decode_tag_op(buf)?));
            }
            if flags & HAS_STOP_COUNT != 0 {
                need(buf, 4, what)?;
                plan.set_stop_on_count(Some(buf.get_u32()));
            }
            Ok(ReadPlan::Simple(plan))
        }
        PLAN_MULTI => {
            need(buf, 1, what)?;
            let count = buf.get_u8() as usize;
            let plans = (0..count)
                .map(|_| decode_plan_at(buf, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            // The sender already enforced its own sub-plan cap
            Ok(ReadPlan::Multi(MultiReadPlan::with_limit(plans, weight, usize::MAX)?))
        }
        other => Err(ReaderError::InvalidResponse(format!("Unknown read plan kind 0x{:02X}", other))),
    }
}

pub fn encode_filter(filter: &TagFilter, out: &mut BytesMut) {
    match filter {
        TagFilter::TagData(tag) => {
            out.put_u8(FILTER_TAG_DATA);
            out.put_u8(tag.protocol as u8);
            out.put_u8(tag.epc.len() as u8);
            out.put_slice(&tag.epc);
        }
        TagFilter::Gen2Select(select) => {
            out.put_u8(FILTER_GEN2_SELECT);
            out.put_u8(select.bank() as u8);
            out.put_u8(select.invert() as u8);
            out.put_u32(select.bit_pointer());
            out.put_u16(select.bit_length());
            out.put_u8(select.mask().len() as u8);
            out.put_slice(select.mask());
        }
    }
}

pub fn decode_filter(buf: &mut &[u8]) -> Result<TagFilter> {
    let what = "tag filter";
    need(buf, 1, what)?;
    match buf.get_u8() {
        FILTER_TAG_DATA => {
            need(buf, 2, what)?;
            let protocol = protocol(buf.get_u8())?;
            let len = buf.get_u8() as usize;
            let epc = get_bytes(buf, len, what)?;
            TagFilter::epc(protocol, &epc)
        }
        FILTER_GEN2_SELECT => {
            need(buf, 9, what)?;
            let bank = bank(buf.get_u8())?;
            let invert = buf.get_u8() != 0;
            let bit_pointer = buf.get_u32();
            let bit_length = buf.get_u16();
            let len = buf.get_u8() as usize;
            let mask = get_bytes(buf, len, what)?;
            Ok(TagFilter::Gen2Select(Gen2Select::new(
                bank,
                bit_pointer,
                bit_length,
                &mask,
                invert,
            )?))
        }
        other => Err(ReaderError::InvalidFilter(format!("Unknown filter kind 0x{:02X}", other))),
    }
}

pub fn encode_tag_op(op: &TagOp, out: &mut BytesMut) {
    match op {
        TagOp::Gen2ReadData {
            bank,
            word_address,
            word_count,
        } => {
            out.put_u8(OP_READ_DATA);
            out.put_u8(*bank as u8);
            out.put_u32(*word_address);
            out.put_u8(*word_count);
        }
        TagOp::Gen2WriteData {
            bank,
            word_address,
            data,
        } => {
            out.put_u8(OP_WRITE_DATA);
            out.put_u8(*bank as u8);
            out.put_u32(*word_address);
            out.put_u8(data.len() as u8);
            for word in data {
                out.put_u16(*word);
            }
        }
        TagOp::Gen2WriteTag { epc } => {
            out.put_u8(OP_WRITE_TAG);
            out.put_u8(epc.epc.len() as u8);
            out.put_slice(&epc.epc);
        }
        TagOp::Gen2Kill { kill_password } => {
            out.put_u8(OP_KILL);
            out.put_u32(*kill_password);
        }
        TagOp::Gen2Lock {
            access_password,
            mask,
            action,
        } => {
            out.put_u8(OP_LOCK);
            out.put_u32(*access_password);
            out.put_u16(*mask);
            out.put_u16(*action);
        }
        TagOp::Gen2SecureReadData {
            bank,
            word_address,
            word_count,
            access_password,
        } => {
            out.put_u8(OP_SECURE_READ_DATA);
            out.put_u8(*bank as u8);
            out.put_u32(*word_address);
            out.put_u8(*word_count);
            match access_password {
                Some(password) => {
                    out.put_u8(1);
                    out.put_u32(*password);
                }
                None => out.put_u8(0),
            }
        }
        TagOp::MonzaQtRead { access_password } => {
            out.put_u8(OP_MONZA_QT_READ);
            out.put_u32(*access_password);
        }
        TagOp::MonzaQtWrite {
            access_password,
            control,
        } => {
            out.put_u8(OP_MONZA_QT_WRITE);
            out.put_u32(*access_password);
            out.put_u8(control.to_byte());
        }
        TagOp::Iso180006bReadData { byte_address, length } => {
            out.put_u8(OP_ISO6B_READ_DATA);
            out.put_u8(*byte_address);
            out.put_u8(*length);
        }
    }
}

pub fn decode_tag_op(buf: &mut &[u8]) -> Result<TagOp> {
    let what = "tag operation";
    need(buf, 1, what)?;
    let op = match buf.get_u8() {
        OP_READ_DATA => {
            need(buf, 6, what)?;
            TagOp::Gen2ReadData {
                bank: bank(buf.get_u8())?,
                word_address: buf.get_u32(),
                word_count: buf.get_u8(),
            }
        }
        OP_WRITE_DATA => {
            need(buf, 6, what)?;
            let bank = bank(buf.get_u8())?;
            let word_address = buf.get_u32();
            let count = buf.get_u8() as usize;
            need(buf, count * 2, what)?;
            TagOp::Gen2WriteData {
                bank,
                word_address,
                data: (0..count).map(|_| buf.get_u16()).collect(),
            }
        }
        OP_WRITE_TAG => {
            need(buf, 1, what)?;
            let len = buf.get_u8() as usize;
            let epc = get_bytes(buf, len, what)?;
            TagOp::Gen2WriteTag {
                epc: TagData::gen2(&epc)?,
            }
        }
        OP_KILL => {
            need(buf, 4, what)?;
            TagOp::Gen2Kill {
                kill_password: buf.get_u32(),
            }
        }
        OP_LOCK => {
            need(buf, 8, what)?;
            TagOp::Gen2Lock {
                access_password: buf.get_u32(),
                mask: buf.get_u16(),
                action: buf.get_u16(),
            }
        }
        OP_SECURE_READ_DATA => {
            need(buf, 7, what)?;
            let bank = bank(buf.get_u8())?;
            let word_address = buf.get_u32();
            let word_count = buf.get_u8();
            let access_password = if buf.get_u8() != 0 {
                need(buf, 4, what)?;
                Some(buf.get_u32())
            } else {
                None
            };
            TagOp::Gen2SecureReadData {
                bank,
                word_address,
                word_count,
                access_password,
            }
        }
        OP_MONZA_QT_READ => {
            need(buf, 4, what)?;
            TagOp::MonzaQtRead {
                access_password: buf.get_u32(),
            }
        }
        OP_MONZA_QT_WRITE => {
            need(buf, 5, what)?;
            TagOp::MonzaQtWrite {
                access_password: buf.get_u32(),
                control: QtControl::from_byte(buf.get_u8()),
            }
        }
        OP_ISO6B_READ_DATA => {
            need(buf, 2, what)?;
            TagOp::Iso180006bReadData {
                byte_address: buf.get_u8(),
                length: buf.get_u8(),
            }
        }
        other => return Err(ReaderError::InvalidValue(format!("Unknown tag operation 0x{:02X}", other))),
    };
    Ok(op)
}

/// Tag report as carried in a tag notification frame. The timestamp is an
/// offset from the start of the read cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TagReport {
    pub tag: TagData,
    pub antenna: u8,
    pub read_count: u32,
    pub rssi: i8,
    pub offset_ms: u32,
    pub micros: u16,
    pub data: Vec<u8>,
}

impl TagReport {
    /// Anchor the report to the wall-clock start of its cycle
    pub fn into_read_data(self, cycle_start_ms: u64) -> TagReadData {
        TagReadData {
            tag: self.tag,
            antenna: self.antenna,
            read_count: self.read_count,
            rssi: self.rssi,
            timestamp_ms: cycle_start_ms + self.offset_ms as u64,
            timestamp_micros: self.micros,
            data: self.data,
        }
    }
}

pub fn encode_tag_report(report: &TagReport, out: &mut BytesMut) {
    out.put_u8(report.tag.protocol as u8);
    out.put_u8(report.antenna);
    out.put_u32(report.read_count);
    out.put_i8(report.rssi);
    out.put_u32(report.offset_ms);
    out.put_u16(report.micros);
    out.put_u16(report.tag.pc);
    out.put_u8(report.tag.epc.len() as u8);
    out.put_slice(&report.tag.epc);
    out.put_u16(report.data.len() as u16);
    out.put_slice(&report.data);
}

pub fn decode_tag_report(buf: &mut &[u8]) -> Result<TagReport> {
    let what = "tag report";
    need(buf, 16, what)?;
    let protocol = protocol(buf.get_u8())?;
    let antenna = buf.get_u8();
    let read_count = buf.get_u32();
    let rssi = buf.get_i8();
    let offset_ms = buf.get_u32();
    let micros = buf.get_u16();
    let pc = buf.get_u16();
    let epc_len = buf.get_u8() as usize;
    let epc = get_bytes(buf, epc_len, what)?;
    need(buf, 2, what)?;
    let data_len = buf.get_u16() as usize;
    let data = get_bytes(buf, data_len, what)?;

    let mut tag = TagData::new(protocol, &epc)?;
    tag.pc = pc;
    Ok(TagReport {
        tag,
        antenna,
        read_count,
        rssi,
        offset_ms,
        micros,
        data,
    })
}
