//! Error taxonomy for the Lattice protocol
//!
//! Three families live here: local wire faults (`WireError`), database
//! operation faults carried over the wire as typed payloads (`DbError`),
//! and service-definition validation faults raised when an API is hosted
//! (`ValidationError`). Transport-level communication errors are owned by
//! the rpc crate; they never travel over the wire.

use thiserror::Error;

/// Request frame discriminator, the byte after the format version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Connect = 1,
    Operation = 2,
}

impl RequestKind {
    pub fn from_tag(tag: u8) -> Option<RequestKind> {
        match tag {
            1 => Some(RequestKind::Connect),
            2 => Some(RequestKind::Operation),
            _ => None,
        }
    }
}

/// Response frame discriminator, the first byte of every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseKind {
    Response = 1,
    Error = 2,
    ServiceUnavailable = 3,
    ProtocolError = 4,
}

impl ResponseKind {
    pub fn from_tag(tag: u8) -> Option<ResponseKind> {
        match tag {
            1 => Some(ResponseKind::Response),
            2 => Some(ResponseKind::Error),
            3 => Some(ResponseKind::ServiceUnavailable),
            4 => Some(ResponseKind::ProtocolError),
            _ => None,
        }
    }
}

/// Local serialization/deserialization faults.
///
/// Readers fail fast: the first length mismatch, invalid tag, or early end
/// of message aborts the whole message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message ended before the expected value was read")]
    UnexpectedEndOfMessage,

    #[error("invalid {what} tag: {tag}")]
    InvalidTag { what: &'static str, tag: u8 },

    #[error("string payload is not valid UTF-16")]
    InvalidUtf16,

    #[error("value does not match the declared wire type (expected {expected})")]
    TypeMismatch { expected: &'static str },

    #[error("type id {0} is not present in the schema")]
    UnknownTypeId(u16),

    #[error("concrete type id {concrete} is not assignable to declared type id {declared}")]
    NotAssignable { concrete: u16, declared: u16 },

    #[error("back-reference to unknown instance id {0}")]
    BackrefOutOfRange(u32),

    #[error("operation expects {expected} arguments, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    #[error("instance of type {type_id} has the wrong field count")]
    WrongFieldCount { type_id: u16 },

    #[error("abstract class {0} cannot be instantiated on the wire")]
    AbstractInstance(u16),

    #[error("chunk of {size} bytes cannot hold a {needed}-byte header")]
    ChunkTooSmall { size: usize, needed: usize },

    #[error("corrupt chunk header: {0}")]
    CorruptChunkHeader(&'static str),

    #[error("message is corrupt: {0}")]
    CorruptMessage(&'static str),
}

/// Database operation fault kinds, forwarded verbatim from the engine.
///
/// `Conflict` and `Busy` are safe to retry; the flag is carried over the
/// wire in the error base class so clients need no kind table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    Conflict,
    UniquenessViolation,
    UnknownReference,
    InvalidArgument,
    NotAllowed,
    Busy,
    Unknown,
}

impl DbErrorKind {
    pub const fn is_retryable(self) -> bool {
        matches!(self, DbErrorKind::Conflict | DbErrorKind::Busy)
    }
}

/// A typed operation fault with a structured wire representation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> DbError {
        DbError {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> DbError {
        DbError::new(DbErrorKind::Conflict, message)
    }

    pub fn busy(message: impl Into<String>) -> DbError {
        DbError::new(DbErrorKind::Busy, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> DbError {
        DbError::new(DbErrorKind::InvalidArgument, message)
    }

    pub fn not_allowed(message: impl Into<String>) -> DbError {
        DbError::new(DbErrorKind::NotAllowed, message)
    }

    pub fn unknown(message: impl Into<String>) -> DbError {
        DbError::new(DbErrorKind::Unknown, message)
    }
}

/// Faults raised while validating a service definition at host time.
///
/// These never travel over the wire; hosting fails before the service is
/// installed. `code()` gives each kind a stable 1000-series identifier
/// for logs and tooling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("operation '{operation}' declares {count} parameters (max {max})")]
    MaxParamCountExceeded { operation: String, count: usize, max: usize },

    #[error("class '{0}' is declared as an operation error but does not derive the error base class")]
    InvalidErrorBaseType(String),

    #[error("type '{0}' referenced by the API is not a serializable protocol type")]
    NonSerializableType(String),

    #[error("operation '{operation}' is missing the required leading context parameter")]
    MissingContextParam { operation: String },

    #[error("operation name '{operation}' is declared twice in interface '{interface}'")]
    DuplicateOperationName { interface: String, operation: String },

    #[error("interface name '{0}' is declared twice in the service")]
    DuplicateInterfaceName(String),

    #[error("a service named '{0}' is already hosted")]
    DuplicateServiceName(String),

    #[error("service or interface name must not be empty")]
    UnnamedApi,

    #[error("class '{0}' is abstract and cannot be used as a concrete API type")]
    AbstractApiType(String),

    #[error("class '{class}' declares {count} properties (max {max})")]
    MaxPropertyCountExceeded { class: String, count: usize, max: usize },

    #[error("schema declares {count} types (max {max})")]
    MaxTypeCountExceeded { count: usize, max: usize },

    #[error("type name '{0}' is declared twice in the schema")]
    DuplicateTypeName(String),

    #[error("field name '{field}' is declared twice in class '{class}' or one of its ancestors")]
    DuplicateFieldName { class: String, field: String },

    #[error("class '{0}' referenced by the API is not declared in the schema")]
    UnknownTypeName(String),

    #[error("class '{class}' extends '{base}', which is sealed")]
    BaseClassSealed { class: String, base: String },

    #[error("class '{class}' extends '{base}', which is a built-in type")]
    BaseClassBuiltIn { class: String, base: String },

    #[error("class '{0}' participates in an inheritance cycle")]
    InheritanceCycle(String),

    #[error("operation '{0}' has no registered implementation")]
    MissingOperationImpl(String),
}

impl ValidationError {
    /// Stable numeric identifier for this validation failure.
    pub fn code(&self) -> u16 {
        match self {
            ValidationError::MaxParamCountExceeded { .. } => 1000,
            ValidationError::InvalidErrorBaseType(_) => 1001,
            ValidationError::NonSerializableType(_) => 1002,
            ValidationError::MissingContextParam { .. } => 1003,
            ValidationError::DuplicateOperationName { .. } => 1004,
            ValidationError::DuplicateInterfaceName(_) => 1005,
            ValidationError::DuplicateServiceName(_) => 1006,
            ValidationError::UnnamedApi => 1007,
            ValidationError::AbstractApiType(_) => 1008,
            ValidationError::MaxPropertyCountExceeded { .. } => 1009,
            ValidationError::MaxTypeCountExceeded { .. } => 1010,
            ValidationError::DuplicateTypeName(_) => 1011,
            ValidationError::DuplicateFieldName { .. } => 1012,
            ValidationError::UnknownTypeName(_) => 1013,
            ValidationError::BaseClassSealed { .. } => 1014,
            ValidationError::BaseClassBuiltIn { .. } => 1015,
            ValidationError::InheritanceCycle(_) => 1016,
            ValidationError::MissingOperationImpl(_) => 1017,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_roundtrip() {
        for kind in [RequestKind::Connect, RequestKind::Operation] {
            assert_eq!(RequestKind::from_tag(kind as u8), Some(kind));
        }
        assert_eq!(RequestKind::from_tag(0), None);

        for kind in [
            ResponseKind::Response,
            ResponseKind::Error,
            ResponseKind::ServiceUnavailable,
            ResponseKind::ProtocolError,
        ] {
            assert_eq!(ResponseKind::from_tag(kind as u8), Some(kind));
        }
        assert_eq!(ResponseKind::from_tag(0), None);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(DbError::conflict("write-write conflict").retryable);
        assert!(DbError::busy("engine saturated").retryable);
        assert!(!DbError::invalid_argument("bad id").retryable);
        assert!(!DbError::unknown("boom").retryable);
    }

    #[test]
    fn test_validation_codes_unique() {
        let errors = [
            ValidationError::UnnamedApi,
            ValidationError::DuplicateServiceName("s".into()),
            ValidationError::InvalidErrorBaseType("e".into()),
        ];
        let mut codes: Vec<u16> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        let len = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len);
    }
}
