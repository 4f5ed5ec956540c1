//! Device abstraction shared by the master and slave simulations
//!
//! A device owns an [`ObservableStore`] holding its whole visible state,
//! exposes a persistable configuration derived from that state, and runs
//! string-keyed actions that arrive from a management front end.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tele_protocol::{Address, LinkOptions};

use crate::error::DeviceError;
use crate::store::ObservableStore;

/// Common surface of a simulated telecontrol device
#[allow(async_fn_in_trait)]
pub trait Device {
    /// Action vocabulary accepted by this device
    type Action;
    /// Handle to the running link endpoint
    type Handle;

    /// Live state store published to front ends
    fn data(&self) -> &Arc<ObservableStore>;

    /// Persistable configuration derived from the current state
    fn conf(&self) -> Value;

    /// Bring up the link endpoint
    async fn start(&self) -> Result<Self::Handle, DeviceError>;

    /// Run a single action
    async fn execute(&self, action: Self::Action) -> Result<Option<Value>, DeviceError>;

    /// Tear down the link endpoint; idempotent
    fn close(&self);
}

/// Link endpoint properties kept under the store's `properties` key
///
/// Fields missing from a stored configuration fall back to the standard
/// defaults, so partially edited properties never block a device start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProperties {
    pub host: String,
    pub port: u16,
    pub response_timeout: u64,
    pub supervisory_timeout: u64,
    pub test_timeout: u64,
    pub send_window_size: u16,
    pub receive_window_size: u16,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        let options = LinkOptions::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: 2404,
            response_timeout: options.response_timeout,
            supervisory_timeout: options.supervisory_timeout,
            test_timeout: options.test_timeout,
            send_window_size: options.send_window_size,
            receive_window_size: options.receive_window_size,
        }
    }
}

impl DeviceProperties {
    /// Decode properties from a store subtree, defaulting missing fields
    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
            .unwrap_or_default()
    }

    /// Encode properties as a store subtree
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "host": self.host,
            "port": self.port,
            "response_timeout": self.response_timeout,
            "supervisory_timeout": self.supervisory_timeout,
            "test_timeout": self.test_timeout,
            "send_window_size": self.send_window_size,
            "receive_window_size": self.receive_window_size,
        })
    }

    /// Endpoint address of the link
    pub fn address(&self) -> Address {
        Address::new(self.host.clone(), self.port)
    }

    /// Link layer parameters
    pub fn options(&self) -> LinkOptions {
        LinkOptions {
            response_timeout: self.response_timeout,
            supervisory_timeout: self.supervisory_timeout,
            test_timeout: self.test_timeout,
            send_window_size: self.send_window_size,
            receive_window_size: self.receive_window_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_default_properties() {
        let properties = DeviceProperties::default();
        assert_eq!(properties.address(), Address::new("127.0.0.1", 2404));
        assert_eq!(properties.options(), LinkOptions::default());
        assert_eq!(
            DeviceProperties::from_value(Some(&properties.to_json())),
            properties
        );
    }

    #[test]
    fn test_partial_properties_fall_back_to_defaults() {
        let properties = DeviceProperties::from_value(Some(&json!({
            "host": "10.0.0.1",
            "port": 19998,
        })));
        assert_eq!(properties.host, "10.0.0.1");
        assert_eq!(properties.port, 19998);
        assert_eq!(properties.response_timeout, 15);
        assert_eq!(properties.send_window_size, 12);
    }

    #[test]
    fn test_missing_properties_use_defaults() {
        assert_eq!(
            DeviceProperties::from_value(None),
            DeviceProperties::default()
        );
    }
}
