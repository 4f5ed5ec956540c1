//! Telecontrol Device Simulation Library
//!
//! This crate provides stateful master and slave device simulations for an
//! IEC 60870-5-104 link management tool. It includes:
//!
//! - **ObservableStore**: path-addressed JSON state with change notification
//! - **CallbackRegistry**: RAII-scoped notification fan-out
//! - **Codec**: JSON encoding of protocol values, data records and commands
//! - **Master**: controlling station with a rolling data change history
//! - **Slave**: controlled station serving configured data and command points
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use tele_device::{Device, Master, MasterAction, Slave};
//! use tele_protocol::LinkNetwork;
//!
//! let network = LinkNetwork::new();
//!
//! let slave = Slave::new(network.clone(), &json!({}));
//! let server = slave.start().await?;
//!
//! let master = Master::new(network, &json!({}));
//! master.start().await?;
//! master.execute(MasterAction::Interrogate { asdu: 0xFFFF }).await?;
//! ```

pub mod codec;
pub mod device;
pub mod error;
pub mod master;
pub mod registry;
pub mod slave;
pub mod store;

pub use device::{Device, DeviceProperties};
pub use error::{CodecError, DeviceError};
pub use master::{Master, MasterAction};
pub use registry::{CallbackRegistry, Registration};
pub use slave::{Slave, SlaveAction};
pub use store::{ObservableStore, StoreEvent};
