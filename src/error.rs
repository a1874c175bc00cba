//! Errors returned by reader operations

/// Result type alias for reader operations.
pub type Result<T> = std::result::Result<T, ReaderError>;

/// Errors that can occur while talking to a reader.
///
/// Construction errors (plans, filters, tag data) are returned before anything
/// touches the transport. Everything else comes back from the call that caused
/// the round-trip. Nothing is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReaderError {
    /// The reader does not know this parameter.
    #[error("Parameter not found: {0}")]
    NotFound(String),

    /// The caller asked for (or supplied) a value of the wrong type.
    #[error("Invalid type for {key}: expected {expected}, found {found}")]
    InvalidType {
        key: String,
        expected: String,
        found: String,
    },

    /// Value is outside the range or enumeration accepted for the key.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Parameter is queryable only.
    #[error("Parameter is read-only: {0}")]
    ReadOnly(String),

    /// No region is set, or the region is not supported by the reader.
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    /// Tag filter is malformed.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Antenna list is empty or references a port that is not connected.
    #[error("Invalid antenna: {0}")]
    InvalidAntenna(String),

    /// Multi read plan has more sub-plans than allowed.
    #[error("Too many sub-plans: {count} (limit {limit})")]
    TooManySubplans { count: usize, limit: usize },

    /// Reader URI could not be parsed or its scheme is not registered.
    #[error("Invalid reader URI: {0}")]
    InvalidUri(String),

    /// Transport or operation exceeded its time budget.
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// Transport layer error (serial, TCP, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame received from the reader could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Sync read buffer is exhausted, or no tag was found.
    #[error("No tags")]
    NoTags,

    /// Tag operation protocol disagrees with `/reader/tagop/protocol`.
    #[error("Tag operation unsupported: {0}")]
    TagOpUnsupported(String),

    /// Operation needs a password that was missing or wrong.
    #[error("Access denied")]
    AccessDenied,

    /// Singulated tag left the field during the operation.
    #[error("Tag lost")]
    TagLost,

    /// Reader ran out of buffer space.
    #[error("Out of memory")]
    OutOfMemory,

    /// Another read session is running on this connection.
    #[error("A read session is already active")]
    SessionActive,

    /// `stop_reading` was called with no async session running.
    #[error("No read session is active")]
    NotReading,
}

impl ReaderError {
    pub(crate) fn transport<E: std::fmt::Debug>(e: E) -> Self {
        Self::Transport(format!("{:?}", e))
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }
}

/// Status byte carried in the first payload byte of every response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0x00,
    NotFound = 0x01,
    InvalidValue = 0x02,
    ReadOnly = 0x03,
    InvalidRegion = 0x04,
    InvalidAntenna = 0x05,
    InvalidFilter = 0x06,
    NoTags = 0x07,
    TagOpUnsupported = 0x08,
    AccessDenied = 0x09,
    TagLost = 0x0A,
    OutOfMemory = 0x0B,
    InvalidType = 0x0C,
    Busy = 0x0D,
}

impl StatusCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        let status = match value {
            0x00 => Self::Success,
            0x01 => Self::NotFound,
            0x02 => Self::InvalidValue,
            0x03 => Self::ReadOnly,
            0x04 => Self::InvalidRegion,
            0x05 => Self::InvalidAntenna,
            0x06 => Self::InvalidFilter,
            0x07 => Self::NoTags,
            0x08 => Self::TagOpUnsupported,
            0x09 => Self::AccessDenied,
            0x0A => Self::TagLost,
            0x0B => Self::OutOfMemory,
            0x0C => Self::InvalidType,
            0x0D => Self::Busy,
            _ => return None,
        };
        Some(status)
    }

    /// Turn a reader status into a result. `context` names the command or key.
    pub fn into_result(self, context: &str) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::NotFound => Err(ReaderError::NotFound(context.into())),
            Self::InvalidValue => Err(ReaderError::InvalidValue(context.into())),
            Self::ReadOnly => Err(ReaderError::ReadOnly(context.into())),
            Self::InvalidRegion => Err(ReaderError::InvalidRegion(context.into())),
            Self::InvalidAntenna => Err(ReaderError::InvalidAntenna(context.into())),
            Self::InvalidFilter => Err(ReaderError::InvalidFilter(context.into())),
            Self::NoTags => Err(ReaderError::NoTags),
            Self::TagOpUnsupported => Err(ReaderError::TagOpUnsupported(context.into())),
            Self::AccessDenied => Err(ReaderError::AccessDenied),
            Self::TagLost => Err(ReaderError::TagLost),
            Self::OutOfMemory => Err(ReaderError::OutOfMemory),
            Self::InvalidType => Err(ReaderError::InvalidType {
                key: context.into(),
                expected: "reader type".into(),
                found: "host type".into(),
            }),
            Self::Busy => Err(ReaderError::SessionActive),
        }
    }
}

impl From<&ReaderError> for StatusCode {
    fn from(e: &ReaderError) -> Self {
        match e {
            ReaderError::NotFound(_) => Self::NotFound,
            ReaderError::InvalidValue(_) => Self::InvalidValue,
            ReaderError::ReadOnly(_) => Self::ReadOnly,
            ReaderError::InvalidRegion(_) => Self::InvalidRegion,
            ReaderError::InvalidAntenna(_) => Self::InvalidAntenna,
            ReaderError::InvalidFilter(_) => Self::InvalidFilter,
            ReaderError::NoTags => Self::NoTags,
            ReaderError::TagOpUnsupported(_) => Self::TagOpUnsupported,
            ReaderError::AccessDenied => Self::AccessDenied,
            ReaderError::TagLost => Self::TagLost,
            ReaderError::OutOfMemory => Self::OutOfMemory,
            ReaderError::InvalidType { .. } => Self::InvalidType,
            ReaderError::SessionActive => Self::Busy,
            _ => Self::InvalidValue,
        }
    }
}
