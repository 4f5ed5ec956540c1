//! Error types for the device layer

use thiserror::Error;

use tele_protocol::LinkError;

/// Errors from the value codec
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Kind tag does not name a supported value kind
    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    /// Point has no asdu/io address and cannot become a live record
    #[error("undefined asdu/io address")]
    MissingAddress,

    /// Payload does not match the shape its kind tag requires
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Bitstring payload is not a hex string
    #[error("invalid bitstring encoding: {0}")]
    InvalidBitstring(String),
}

/// Errors surfaced by device action dispatch
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Unknown action name at the string-keyed server boundary
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Action name is known but its arguments are malformed
    #[error("invalid arguments for {action}: {reason}")]
    InvalidArguments { action: String, reason: String },

    /// Codec failure that must reach the caller (e.g. command decode)
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Link failure during an in-flight action
    #[error(transparent)]
    Link(#[from] LinkError),
}
