use std::fmt;

use thiserror::Error;

/// Failure categories shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The message store cannot be reached.
    TransportUnavailable,
    /// A field's length or encoding is wrong for its type.
    MalformedField,
    /// A type code or tag outside the known set.
    UnknownField,
    /// A mandatory field the target cannot express.
    UnsupportedField,
    /// A gateway has no neighbor entry yet.
    UnresolvedGateway,
    /// A registration for an id that is already registered.
    DuplicateRegistration,
    /// A directive that no longer applies to the current tables.
    StaleDirective,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransportUnavailable => "transport unavailable",
            ErrorKind::MalformedField => "malformed field",
            ErrorKind::UnknownField => "unknown field",
            ErrorKind::UnsupportedField => "unsupported field",
            ErrorKind::UnresolvedGateway => "unresolved gateway",
            ErrorKind::DuplicateRegistration => "duplicate registration",
            ErrorKind::StaleDirective => "stale directive",
        };
        f.write_str(s)
    }
}

/// Errors raised by the codec and the messaging channel.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unknown {family} type code {code}")]
    UnknownType { family: &'static str, code: u32 },

    #[error("Unknown field tag {0}")]
    UnknownTag(u8),

    #[error("Malformed {what}: expected {expected} bytes, got {actual}")]
    Length {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing field tag {0}")]
    MissingField(u8),

    #[error("Invalid value for {what}: {value}")]
    InvalidValue { what: &'static str, value: u64 },

    #[error("{what} too long: {actual} exceeds {limit}")]
    TooLong {
        what: &'static str,
        limit: usize,
        actual: usize,
    },

    #[error("Message store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Message store path unusable: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtoError::UnknownType { .. } | ProtoError::UnknownTag(_) => ErrorKind::UnknownField,
            ProtoError::Length { .. }
            | ProtoError::MissingField(_)
            | ProtoError::InvalidValue { .. }
            | ProtoError::TooLong { .. } => ErrorKind::MalformedField,
            ProtoError::Store(_) | ProtoError::Io(_) => ErrorKind::TransportUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
