//! Error types for the link layer

use thiserror::Error;

use crate::types::Address;

/// Errors that can occur on a telecontrol link
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The connection was closed (locally or by the peer)
    #[error("connection closed")]
    ConnectionClosed,

    /// No endpoint is listening at the requested address
    #[error("connection refused: no listener at {0}")]
    ConnectionRefused(Address),

    /// Another server already listens at the requested address
    #[error("address already in use: {0}")]
    AddressInUse(Address),
}
