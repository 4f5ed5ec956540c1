//! Typed IEC 60870-5-104 constructs
//!
//! These mirror the information elements the protocol engine exchanges with
//! the device layer. JSON member names (SCREAMING_SNAKE enum variants, plain
//! field maps for structured kinds) match the representation the UI-facing
//! store uses, so serde derives double as the wire format of the codec.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Station address wildcard meaning "all stations"
///
/// Protocol convention (broadcast common address); interrogation requests
/// carrying this address match every configured point.
pub const GLOBAL_ASDU: u16 = 0xFFFF;

/// Single-point information value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingleValue {
    Off,
    On,
}

/// Double-point information value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DoubleValue {
    Intermediate,
    Off,
    On,
    Fault,
}

/// Regulating step command value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulatingValue {
    Lower,
    Higher,
}

/// Step position value (transformer tap position and similar)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPositionValue {
    /// Position in the range -64..=63
    pub value: i8,
    /// Equipment is in transient state
    pub transient: bool,
}

/// 32-bit bitstring value (4 raw bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstringValue(pub [u8; 4]);

/// Normalized measurement value in [-1, 1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedValue(pub f64);

/// Scaled measurement value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledValue(pub i16);

/// Short floating point measurement value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatingValue(pub f32);

/// Integrated totals (counter) value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCounterValue {
    /// Counter reading
    pub value: i32,
    /// Sequence number incremented on freeze
    pub sequence: u8,
    /// Counter overflowed since last read
    pub overflow: bool,
    /// Counter was adjusted since last read
    pub adjusted: bool,
    /// Counter reading is invalid
    pub invalid: bool,
}

/// Tagged union over the nine information-element kinds
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataValue {
    Single(SingleValue),
    Double(DoubleValue),
    Regulating(RegulatingValue),
    StepPosition(StepPositionValue),
    Bitstring(BitstringValue),
    Normalized(NormalizedValue),
    Scaled(ScaledValue),
    Floating(FloatingValue),
    BinaryCounter(BinaryCounterValue),
}

impl DataValue {
    /// Returns the kind tag used in the JSON representation
    pub fn kind(&self) -> &'static str {
        match self {
            DataValue::Single(_) => "Single",
            DataValue::Double(_) => "Double",
            DataValue::Regulating(_) => "Regulating",
            DataValue::StepPosition(_) => "StepPosition",
            DataValue::Bitstring(_) => "Bitstring",
            DataValue::Normalized(_) => "Normalized",
            DataValue::Scaled(_) => "Scaled",
            DataValue::Floating(_) => "Floating",
            DataValue::BinaryCounter(_) => "BinaryCounter",
        }
    }
}

/// Quality descriptor attached to a data report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quality {
    pub invalid: bool,
    pub not_topical: bool,
    pub substituted: bool,
    pub blocked: bool,
    pub overflow: bool,
}

/// CP56Time2a time tag components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Time {
    pub milliseconds: u16,
    pub invalid: bool,
    pub minutes: u8,
    pub summer_time: bool,
    pub hours: u8,
    pub day_of_week: u8,
    pub day_of_month: u8,
    pub months: u8,
    pub years: u8,
}

/// Cause of transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cause {
    #[default]
    Undefined,
    Periodic,
    BackgroundScan,
    Spontaneous,
    Initialized,
    Request,
    Activation,
    ActivationConfirmation,
    Deactivation,
    DeactivationConfirmation,
    ActivationTermination,
    RemoteCommand,
    LocalCommand,
    InterrogatedStation,
    InterrogatedCounter,
    UnknownType,
    UnknownCause,
    UnknownAsduAddress,
    UnknownIoAddress,
}

/// Counter interrogation freeze behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreezeCode {
    Read,
    Freeze,
    FreezeAndReset,
    Reset,
}

/// Command qualifier action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandAction {
    Select,
    Execute,
    Cancel,
}

/// Monitored data point report
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub value: DataValue,
    pub quality: Option<Quality>,
    pub time: Option<Time>,
    /// Station (common ASDU) address
    pub asdu_address: u16,
    /// Information object address
    pub io_address: u32,
    pub cause: Cause,
    pub is_test: bool,
}

/// Control direction command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: CommandAction,
    pub value: DataValue,
    pub asdu_address: u16,
    pub io_address: u32,
    pub time: Option<Time>,
    pub qualifier: u8,
}

/// Endpoint address of a telecontrol link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Link layer parameters passed to the protocol engine
///
/// Timeouts are in seconds (t1/t2/t3 in protocol terms), window sizes are
/// the k/w APDU counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    pub response_timeout: u64,
    pub supervisory_timeout: u64,
    pub test_timeout: u64,
    pub send_window_size: u16,
    pub receive_window_size: u16,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            response_timeout: 15,
            supervisory_timeout: 10,
            test_timeout: 20,
            send_window_size: 12,
            receive_window_size: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_tags() {
        assert_eq!(DataValue::Single(SingleValue::On).kind(), "Single");
        assert_eq!(
            DataValue::BinaryCounter(BinaryCounterValue {
                value: 0,
                sequence: 0,
                overflow: false,
                adjusted: false,
                invalid: false,
            })
            .kind(),
            "BinaryCounter"
        );
        assert_eq!(DataValue::Bitstring(BitstringValue([0; 4])).kind(), "Bitstring");
    }

    #[test]
    fn test_enum_member_names() {
        let json = serde_json::to_value(SingleValue::Off).unwrap();
        assert_eq!(json, serde_json::json!("OFF"));

        let json = serde_json::to_value(DoubleValue::Intermediate).unwrap();
        assert_eq!(json, serde_json::json!("INTERMEDIATE"));

        let json = serde_json::to_value(Cause::InterrogatedStation).unwrap();
        assert_eq!(json, serde_json::json!("INTERROGATED_STATION"));

        let freeze: FreezeCode = serde_json::from_value(serde_json::json!("FREEZE_AND_RESET")).unwrap();
        assert_eq!(freeze, FreezeCode::FreezeAndReset);
    }

    #[test]
    fn test_default_cause_is_undefined() {
        assert_eq!(Cause::default(), Cause::Undefined);
    }

    #[test]
    fn test_address_display() {
        let addr = Address::new("127.0.0.1", 2404);
        assert_eq!(addr.to_string(), "127.0.0.1:2404");
    }

    #[test]
    fn test_default_link_options() {
        let opts = LinkOptions::default();
        assert_eq!(opts.response_timeout, 15);
        assert_eq!(opts.supervisory_timeout, 10);
        assert_eq!(opts.test_timeout, 20);
        assert_eq!(opts.send_window_size, 12);
        assert_eq!(opts.receive_window_size, 8);
    }
}
