//! Parameter keys, their path names and typed values

use crate::caps::Capabilities;
use crate::error::{ReaderError, Result};
use crate::plan::ReadPlan;
use crate::types::{Gen2Session, Region, TagProtocol};

/// Line rates the reader accepts on `/reader/baudRate`
pub const BAUD_RATES: [u32; 8] = [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

/// Upper bound for the async on/off times, in milliseconds
pub const MAX_ASYNC_TIME_MS: u32 = 65535;

/// Closed set of parameters a reader may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    VersionSoftware,
    VersionModel,
    SupportedProtocols,
    BaudRate,
    RegionId,
    SupportedRegions,
    PortList,
    ConnectedPortList,
    ReadPower,
    WritePower,
    PowerMin,
    PowerMax,
    Gen2Session,
    Gen2AccessPassword,
    ReadPlan,
    AsyncOnTime,
    AsyncOffTime,
    TagopProtocol,
    TagopAntenna,
    UniqueByAntenna,
}

impl ParamKey {
    pub const ALL: [ParamKey; 20] = [
        Self::VersionSoftware,
        Self::VersionModel,
        Self::SupportedProtocols,
        Self::BaudRate,
        Self::RegionId,
        Self::SupportedRegions,
        Self::PortList,
        Self::ConnectedPortList,
        Self::ReadPower,
        Self::WritePower,
        Self::PowerMin,
        Self::PowerMax,
        Self::Gen2Session,
        Self::Gen2AccessPassword,
        Self::ReadPlan,
        Self::AsyncOnTime,
        Self::AsyncOffTime,
        Self::TagopProtocol,
        Self::TagopAntenna,
        Self::UniqueByAntenna,
    ];

    /// Stable path name
    pub fn path(&self) -> &'static str {
        match self {
            Self::VersionSoftware => "/reader/version/software",
            Self::VersionModel => "/reader/version/model",
            Self::SupportedProtocols => "/reader/version/supportedProtocols",
            Self::BaudRate => "/reader/baudRate",
            Self::RegionId => "/reader/region/id",
            Self::SupportedRegions => "/reader/region/supportedRegions",
            Self::PortList => "/reader/antenna/portList",
            Self::ConnectedPortList => "/reader/antenna/connectedPortList",
            Self::ReadPower => "/reader/radio/readPower",
            Self::WritePower => "/reader/radio/writePower",
            Self::PowerMin => "/reader/radio/powerMin",
            Self::PowerMax => "/reader/radio/powerMax",
            Self::Gen2Session => "/reader/gen2/session",
            Self::Gen2AccessPassword => "/reader/gen2/accessPassword",
            Self::ReadPlan => "/reader/read/plan",
            Self::AsyncOnTime => "/reader/read/asyncOnTime",
            Self::AsyncOffTime => "/reader/read/asyncOffTime",
            Self::TagopProtocol => "/reader/tagop/protocol",
            Self::TagopAntenna => "/reader/tagop/antenna",
            Self::UniqueByAntenna => "/reader/tagReadData/uniqueByAntenna",
        }
    }

    /// Resolve a path name. Unknown paths are `NotFound`.
    pub fn from_path(path: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.path() == path)
            .ok_or_else(|| ReaderError::NotFound(path.to_string()))
    }

    /// Identifier used on the wire
    pub fn code(&self) -> u16 {
        match self {
            Self::VersionSoftware => 0x0001,
            Self::VersionModel => 0x0002,
            Self::SupportedProtocols => 0x0003,
            Self::BaudRate => 0x0010,
            Self::RegionId => 0x0020,
            Self::SupportedRegions => 0x0021,
            Self::PortList => 0x0030,
            Self::ConnectedPortList => 0x0031,
            Self::ReadPower => 0x0040,
            Self::WritePower => 0x0041,
            Self::PowerMin => 0x0042,
            Self::PowerMax => 0x0043,
            Self::Gen2Session => 0x0050,
            Self::Gen2AccessPassword => 0x0051,
            Self::ReadPlan => 0x0060,
            Self::AsyncOnTime => 0x0061,
            Self::AsyncOffTime => 0x0062,
            Self::TagopProtocol => 0x0070,
            Self::TagopAntenna => 0x0071,
            Self::UniqueByAntenna => 0x0080,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.code() == code)
    }

    /// Type of every value stored under this key
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::VersionSoftware | Self::VersionModel => ParamType::Str,
            Self::SupportedProtocols => ParamType::ProtocolList,
            Self::BaudRate | Self::Gen2AccessPassword | Self::AsyncOnTime | Self::AsyncOffTime => {
                ParamType::U32
            }
            Self::RegionId => ParamType::Region,
            Self::SupportedRegions => ParamType::RegionList,
            Self::PortList | Self::ConnectedPortList => ParamType::PortList,
            Self::ReadPower | Self::WritePower | Self::PowerMin | Self::PowerMax => ParamType::I32,
            Self::Gen2Session => ParamType::Gen2Session,
            Self::ReadPlan => ParamType::ReadPlan,
            Self::TagopProtocol => ParamType::Protocol,
            Self::TagopAntenna => ParamType::U8,
            Self::UniqueByAntenna => ParamType::Bool,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::VersionSoftware
                | Self::VersionModel
                | Self::SupportedProtocols
                | Self::SupportedRegions
                | Self::PortList
                | Self::ConnectedPortList
                | Self::PowerMin
                | Self::PowerMax
        )
    }

    /// Host-side checks run before a value is sent to the reader
    pub(crate) fn validate(
        &self,
        value: &ParamValue,
        caps: &Capabilities,
        max_subplans: usize,
    ) -> Result<()> {
        if self.is_read_only() {
            return Err(ReaderError::ReadOnly(self.path().into()));
        }
        if value.param_type() != self.param_type() {
            return Err(type_mismatch(*self, value.param_type()));
        }
        let out_of_range =
            |what: String| -> Result<()> { Err(ReaderError::InvalidValue(format!("{}: {}", self.path(), what))) };
        match value {
            ParamValue::U32(rate) if *self == Self::BaudRate && !BAUD_RATES.contains(rate) => {
                out_of_range(format!("unsupported baud rate {}", rate))
            }
            ParamValue::U32(ms)
                if matches!(self, Self::AsyncOnTime | Self::AsyncOffTime) && *ms > MAX_ASYNC_TIME_MS =>
            {
                out_of_range(format!("{} ms exceeds {} ms", ms, MAX_ASYNC_TIME_MS))
            }
            ParamValue::U32(0) if *self == Self::AsyncOnTime => out_of_range("on time must be positive".into()),
            ParamValue::Region(region) if *region == Region::None || !caps.supports_region(*region) => {
                out_of_range(format!("region {} is not supported", region))
            }
            ParamValue::I32(power) if *power < caps.power_min || *power > caps.power_max => out_of_range(format!(
                "power {} outside {}..={} centi-dBm",
                power, caps.power_min, caps.power_max
            )),
            ParamValue::Protocol(protocol) if !caps.supports_protocol(*protocol) => {
                out_of_range(format!("protocol {:?} is not supported", protocol))
            }
            ParamValue::U8(port) if *self == Self::TagopAntenna && !caps.is_connected_port(*port) => {
                Err(ReaderError::InvalidAntenna(format!("Antenna {} is not connected", port)))
            }
            ParamValue::ReadPlan(plan) => plan.validate(caps, max_subplans),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

pub(crate) fn type_mismatch(key: ParamKey, found: ParamType) -> ReaderError {
    ReaderError::InvalidType {
        key: key.path().into(),
        expected: format!("{:?}", key.param_type()),
        found: format!("{:?}", found),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    Bool,
    U8,
    U32,
    I32,
    Str,
    Region,
    RegionList,
    PortList,
    Protocol,
    ProtocolList,
    Gen2Session,
    ReadPlan,
}

/// A typed parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    U8(u8),
    U32(u32),
    I32(i32),
    Str(String),
    Region(Region),
    RegionList(Vec<Region>),
    PortList(Vec<u8>),
    Protocol(TagProtocol),
    ProtocolList(Vec<TagProtocol>),
    Gen2Session(Gen2Session),
    ReadPlan(ReadPlan),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::Bool(_) => ParamType::Bool,
            Self::U8(_) => ParamType::U8,
            Self::U32(_) => ParamType::U32,
            Self::I32(_) => ParamType::I32,
            Self::Str(_) => ParamType::Str,
            Self::Region(_) => ParamType::Region,
            Self::RegionList(_) => ParamType::RegionList,
            Self::PortList(_) => ParamType::PortList,
            Self::Protocol(_) => ParamType::Protocol,
            Self::ProtocolList(_) => ParamType::ProtocolList,
            Self::Gen2Session(_) => ParamType::Gen2Session,
            Self::ReadPlan(_) => ParamType::ReadPlan,
        }
    }
}

/// Rust types that can be read out of a [`ParamValue`]
pub trait FromParam: Sized {
    const TYPE: ParamType;

    fn from_param(value: ParamValue) -> Option<Self>;
}

macro_rules! param_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromParam for $ty {
                const TYPE: ParamType = ParamType::$variant;

                fn from_param(value: ParamValue) -> Option<Self> {
                    match value {
                        ParamValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    ParamValue::$variant(v)
                }
            }
        )*
    };
}

param_conversions! {
    bool => Bool,
    u8 => U8,
    u32 => U32,
    i32 => I32,
    String => Str,
    Region => Region,
    Vec<Region> => RegionList,
    Vec<u8> => PortList,
    TagProtocol => Protocol,
    Vec<TagProtocol> => ProtocolList,
    Gen2Session => Gen2Session,
    ReadPlan => ReadPlan,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn caps() -> Capabilities {
        Capabilities {
            ports: vec![1, 2],
            connected_ports: vec![1],
            supported_regions: vec![Region::Na, Region::Eu],
            protocols: vec![TagProtocol::Gen2],
            power_min: 500,
            power_max: 3000,
            ..Default::default()
        }
    }

    #[test]
    fn test_paths_are_unique_and_resolvable() {
        for key in ParamKey::ALL {
            assert_eq!(ParamKey::from_path(key.path()), Ok(key));
            assert_eq!(ParamKey::from_code(key.code()), Some(key));
        }
        let mut paths: Vec<_> = ParamKey::ALL.iter().map(ParamKey::path).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), ParamKey::ALL.len());
    }

    #[test]
    fn test_unknown_path() {
        assert_eq!(
            ParamKey::from_path("/reader/nope"),
            Err(ReaderError::NotFound("/reader/nope".into()))
        );
    }

    #[rstest]
    #[case(ParamKey::RegionId, "/reader/region/id")]
    #[case(ParamKey::ReadPlan, "/reader/read/plan")]
    #[case(ParamKey::BaudRate, "/reader/baudRate")]
    fn test_well_known_paths(#[case] key: ParamKey, #[case] path: &str) {
        assert_eq!(key.path(), path);
    }

    #[test]
    fn test_read_only_rejected_before_type() {
        let result = ParamKey::PowerMax.validate(&ParamValue::Bool(true), &caps(), 5);
        assert!(matches!(result, Err(ReaderError::ReadOnly(_))));
    }

    #[test]
    fn test_type_mismatch() {
        let result = ParamKey::BaudRate.validate(&ParamValue::Str("fast".into()), &caps(), 5);
        assert!(matches!(result, Err(ReaderError::InvalidType { .. })));
    }

    #[rstest]
    #[case(ParamKey::BaudRate, ParamValue::U32(12345))]
    #[case(ParamKey::ReadPower, ParamValue::I32(3100))]
    #[case(ParamKey::ReadPower, ParamValue::I32(499))]
    #[case(ParamKey::RegionId, ParamValue::Region(Region::Jp))]
    #[case(ParamKey::RegionId, ParamValue::Region(Region::None))]
    #[case(ParamKey::AsyncOnTime, ParamValue::U32(0))]
    #[case(ParamKey::AsyncOffTime, ParamValue::U32(70000))]
    #[case(ParamKey::TagopProtocol, ParamValue::Protocol(TagProtocol::Ipx64))]
    fn test_out_of_range(#[case] key: ParamKey, #[case] value: ParamValue) {
        assert!(matches!(
            key.validate(&value, &caps(), 5),
            Err(ReaderError::InvalidValue(_))
        ));
    }

    #[rstest]
    #[case(ParamKey::BaudRate, ParamValue::U32(115200))]
    #[case(ParamKey::ReadPower, ParamValue::I32(3000))]
    #[case(ParamKey::RegionId, ParamValue::Region(Region::Eu))]
    #[case(ParamKey::Gen2Session, ParamValue::Gen2Session(Gen2Session::S1))]
    #[case(ParamKey::UniqueByAntenna, ParamValue::Bool(true))]
    #[case(ParamKey::TagopAntenna, ParamValue::U8(1))]
    fn test_in_range(#[case] key: ParamKey, #[case] value: ParamValue) {
        assert!(key.validate(&value, &caps(), 5).is_ok());
    }

    #[test]
    fn test_tagop_antenna_must_be_connected() {
        assert!(matches!(
            ParamKey::TagopAntenna.validate(&ParamValue::U8(2), &caps(), 5),
            Err(ReaderError::InvalidAntenna(_))
        ));
    }

    #[test]
    fn test_from_param() {
        assert_eq!(u32::from_param(ParamValue::U32(7)), Some(7));
        assert_eq!(u32::from_param(ParamValue::I32(7)), None);
        assert_eq!(<Vec<u8>>::TYPE, ParamType::PortList);
        assert_eq!(ParamValue::from(Region::Eu), ParamValue::Region(Region::Eu));
    }
}
