//! IEC 60870-5-104 Link Library
//!
//! This crate provides the typed constructs of the IEC 60870-5-104
//! telecontrol protocol as consumed by the device-simulation layer:
//!
//! - **Typed values**: a closed sum over the nine information-element kinds,
//!   plus quality, time and cause-of-transmission metadata
//! - **Records**: `Data` (monitored point report) and `Command` (control
//!   direction request)
//! - **Link**: a narrow `connect`/`listen` interface over an in-process
//!   channel transport, standing in for the external protocol engine
//!
//! The protocol state machine itself (APCI framing, acknowledgement windows,
//! retransmission timers) is owned by the external driver; this crate only
//! models the surface the device layer talks to.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tele_protocol::{Address, LinkNetwork, LinkOptions};
//!
//! let network = LinkNetwork::new();
//! let addr = Address::new("127.0.0.1", 2404);
//!
//! let server = network.listen(addr.clone(), handler, LinkOptions::default())?;
//! let conn = network.connect(addr, LinkOptions::default()).await?;
//!
//! let data = conn.interrogate(1).await?;
//! ```

pub mod error;
pub mod link;
pub mod types;

pub use error::LinkError;
pub use link::{Connection, ConnectionMeta, LinkNetwork, Server, ServerHandler};
pub use types::{
    Address, BinaryCounterValue, BitstringValue, Cause, Command, CommandAction, Data, DataValue,
    DoubleValue, FloatingValue, FreezeCode, LinkOptions, NormalizedValue, Quality, RegulatingValue,
    ScaledValue, SingleValue, StepPositionValue, Time, GLOBAL_ASDU,
};
