//! Error types for the data transport.

use crate::DataTransport::controller::ControllerKey;

/// Coarse classification of a [`TransportError`].
///
/// Configuration errors abort circuit construction and are never retried.
/// Protocol errors leave the circuit unusable. Resource errors report an
/// exhausted or violated bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Protocol,
    Resource,
    Io,
}

/// Errors raised by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No controller exists for the negotiated combination.
    #[error("no controller supports {key}")]
    UnsupportedController {
        /// The selection key that was looked up.
        key: ControllerKey,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },

    /// An endpoint string could not be parsed or resolved.
    #[error("invalid endpoint '{name}': {reason}")]
    InvalidEndpoint {
        /// The endpoint string.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A partition combination cannot be mapped onto the destination.
    #[error("invalid partition: {message}")]
    InvalidPartition {
        /// What was wrong.
        message: String,
    },

    /// A request referenced a circuit this transport does not know.
    #[error("unknown circuit {id:#010x}")]
    UnknownCircuit {
        /// The circuit id.
        id: u32,
    },

    /// A port or buffer index is out of range for its set.
    #[error("unknown {what} {index} (count {count})")]
    UnknownPort {
        /// Kind of index ("output port", "input buffer", ...).
        what: &'static str,
        /// The index requested.
        index: usize,
        /// Number of elements available.
        count: usize,
    },

    /// A buffer was queued while it was already waiting in the queue.
    #[error("buffer {buffer} of output port {port} is already queued")]
    DuplicateQueuedBuffer {
        /// Output port id.
        port: u32,
        /// Output buffer id.
        buffer: u32,
    },

    /// The remote side answered a mailbox request with an error code.
    #[error("remote request {request} to '{endpoint}' failed with code {code}")]
    RemoteRequestFailed {
        /// Request type name.
        request: &'static str,
        /// Remote endpoint.
        endpoint: String,
        /// Error code written by the responder.
        code: i32,
    },

    /// A mailbox request could not be decoded.
    #[error("malformed request: {message}")]
    MalformedRequest {
        /// What was wrong.
        message: String,
    },

    /// An operation was invoked in a state that does not allow it.
    #[error("invalid state: {message}")]
    InvalidState {
        /// What was wrong.
        message: String,
    },

    /// The endpoint heap cannot satisfy an allocation.
    #[error("out of endpoint memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes still free.
        available: usize,
    },

    /// An access fell outside the mapped region.
    #[error("access at offset {offset} length {len} exceeds region of {size} bytes")]
    OutOfBounds {
        /// Start offset.
        offset: u64,
        /// Length of the access.
        len: usize,
        /// Region size.
        size: usize,
    },

    /// A bounded container is full.
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded {
        /// What overflowed.
        what: &'static str,
        /// The bound.
        limit: usize,
    },

    /// A bounded wait expired.
    #[error("timed out waiting for {what}")]
    Timeout {
        /// What was awaited.
        what: String,
    },

    /// Shared memory backend failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedController { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidEndpoint { .. }
            | Self::InvalidPartition { .. } => ErrorClass::Configuration,
            Self::UnknownCircuit { .. }
            | Self::UnknownPort { .. }
            | Self::DuplicateQueuedBuffer { .. }
            | Self::RemoteRequestFailed { .. }
            | Self::MalformedRequest { .. }
            | Self::InvalidState { .. } => ErrorClass::Protocol,
            Self::OutOfMemory { .. }
            | Self::OutOfBounds { .. }
            | Self::CapacityExceeded { .. }
            | Self::Timeout { .. } => ErrorClass::Resource,
            Self::Io(_) => ErrorClass::Io,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
