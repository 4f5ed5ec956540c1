//! JSON codec for telecontrol values, data records and commands
//!
//! Stored points keep every kind's payload side by side in a single value
//! map, so switching a point's type never loses the other payloads. The
//! decoders read the entry selected by the point's kind tag and ignore the
//! rest.

use serde_json::{json, Value};

use tele_protocol::{
    BinaryCounterValue, BitstringValue, Cause, Command, CommandAction, Data, DataValue,
    DoubleValue, Quality, RegulatingValue, ScaledValue, SingleValue, StepPositionValue, Time,
};

use crate::error::CodecError;

/// Encode a value as a single-entry map keyed by its kind tag
pub fn value_to_json(value: &DataValue) -> Value {
    match value {
        DataValue::Single(v) => json!({"Single": single_name(v)}),
        DataValue::Double(v) => json!({"Double": double_name(v)}),
        DataValue::Regulating(v) => json!({"Regulating": regulating_name(v)}),
        DataValue::StepPosition(v) => json!({"StepPosition": {
            "value": v.value,
            "transient": v.transient,
        }}),
        DataValue::Bitstring(v) => json!({"Bitstring": bytes_to_hex(&v.0)}),
        DataValue::Normalized(v) => json!({"Normalized": v.0}),
        DataValue::Scaled(v) => json!({"Scaled": v.0}),
        DataValue::Floating(v) => json!({"Floating": v.0}),
        DataValue::BinaryCounter(v) => json!({"BinaryCounter": {
            "value": v.value,
            "sequence": v.sequence,
            "overflow": v.overflow,
            "adjusted": v.adjusted,
            "invalid": v.invalid,
        }}),
    }
}

/// Decode the `kind` entry of a value map
///
/// `payload` is the stored value map; entries for other kinds are ignored.
/// Bitstring payloads are hex strings, whitespace allowed, zero-padded or
/// truncated to four octets.
pub fn value_from_json(kind: &str, payload: &Value) -> Result<DataValue, CodecError> {
    let inner = payload
        .get(kind)
        .ok_or_else(|| invalid(kind, "missing payload entry"))?;

    match kind {
        "Single" => decode_member::<SingleValue>(kind, inner).map(DataValue::Single),
        "Double" => decode_member::<DoubleValue>(kind, inner).map(DataValue::Double),
        "Regulating" => decode_member::<RegulatingValue>(kind, inner).map(DataValue::Regulating),
        "StepPosition" => {
            decode_member::<StepPositionValue>(kind, inner).map(DataValue::StepPosition)
        }
        "Bitstring" => {
            let text = inner
                .as_str()
                .ok_or_else(|| invalid(kind, "expected hex string"))?;
            let bytes = hex_to_bytes(text)?;
            let mut octets = [0u8; 4];
            for (slot, byte) in octets.iter_mut().zip(bytes) {
                *slot = byte;
            }
            Ok(DataValue::Bitstring(BitstringValue(octets)))
        }
        "Normalized" => decode_member(kind, inner).map(DataValue::Normalized),
        "Scaled" => decode_member::<ScaledValue>(kind, inner).map(DataValue::Scaled),
        "Floating" => decode_member(kind, inner).map(DataValue::Floating),
        "BinaryCounter" => {
            decode_member::<BinaryCounterValue>(kind, inner).map(DataValue::BinaryCounter)
        }
        _ => Err(CodecError::UnsupportedType(kind.to_string())),
    }
}

/// Encode a live data record as a stored point
pub fn data_to_json(data: &Data) -> Value {
    json!({
        "type": data.value.kind(),
        "asdu": data.asdu_address,
        "io": data.io_address,
        "value": value_to_json(&data.value),
        "quality": data.quality,
        "time": data.time,
        "cause": data.cause,
        "is_test": data.is_test,
    })
}

/// Decode a stored data point into a live record
///
/// Points whose asdu or io address is still unset decode to
/// [`CodecError::MissingAddress`].
pub fn data_from_json(point: &Value) -> Result<Data, CodecError> {
    let (asdu_address, io_address) = decode_addresses(point)?;
    let kind = point
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("data", "missing type tag"))?;

    Ok(Data {
        value: value_from_json(kind, point.get("value").unwrap_or(&Value::Null))?,
        quality: decode_optional::<Quality>("quality", point)?,
        time: decode_optional::<Time>("time", point)?,
        asdu_address,
        io_address,
        cause: decode_field::<Cause>("cause", point)?,
        is_test: decode_field::<bool>("is_test", point)?,
    })
}

/// Decode a stored command point into a live command
///
/// A missing or null qualifier decodes to zero.
pub fn command_from_json(point: &Value) -> Result<Command, CodecError> {
    let (asdu_address, io_address) = decode_addresses(point)?;
    let kind = point
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("command", "missing type tag"))?;

    let qualifier = match point.get("qualifier") {
        None | Some(Value::Null) => 0,
        Some(raw) => u8::try_from(raw.as_u64().ok_or_else(|| invalid("qualifier", raw))?)
            .map_err(|_| invalid("qualifier", raw))?,
    };

    Ok(Command {
        action: decode_field::<CommandAction>("action", point)?,
        value: value_from_json(kind, point.get("value").unwrap_or(&Value::Null))?,
        asdu_address,
        io_address,
        time: decode_optional::<Time>("time", point)?,
        qualifier,
    })
}

fn decode_addresses(point: &Value) -> Result<(u16, u32), CodecError> {
    let asdu = point.get("asdu").unwrap_or(&Value::Null);
    let io = point.get("io").unwrap_or(&Value::Null);
    if asdu.is_null() || io.is_null() {
        return Err(CodecError::MissingAddress);
    }

    let asdu = asdu
        .as_u64()
        .and_then(|raw| u16::try_from(raw).ok())
        .ok_or_else(|| invalid("asdu", asdu))?;
    let io = io
        .as_u64()
        .and_then(|raw| u32::try_from(raw).ok())
        .ok_or_else(|| invalid("io", io))?;
    Ok((asdu, io))
}

fn decode_member<T: serde::de::DeserializeOwned>(
    kind: &str,
    inner: &Value,
) -> Result<T, CodecError> {
    serde_json::from_value(inner.clone()).map_err(|err| invalid(kind, err))
}

fn decode_field<T: serde::de::DeserializeOwned>(
    field: &str,
    point: &Value,
) -> Result<T, CodecError> {
    serde_json::from_value(point.get(field).cloned().unwrap_or(Value::Null))
        .map_err(|err| invalid(field, err))
}

fn decode_optional<T: serde::de::DeserializeOwned>(
    field: &str,
    point: &Value,
) -> Result<Option<T>, CodecError> {
    match point.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|err| invalid(field, err)),
    }
}

fn invalid(kind: &str, reason: impl ToString) -> CodecError {
    CodecError::InvalidPayload {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

fn single_name(value: &SingleValue) -> &'static str {
    match value {
        SingleValue::Off => "OFF",
        SingleValue::On => "ON",
    }
}

fn double_name(value: &DoubleValue) -> &'static str {
    match value {
        DoubleValue::Intermediate => "INTERMEDIATE",
        DoubleValue::Off => "OFF",
        DoubleValue::On => "ON",
        DoubleValue::Fault => "FAULT",
    }
}

fn regulating_name(value: &RegulatingValue) -> &'static str {
    match value {
        RegulatingValue::Lower => "LOWER",
        RegulatingValue::Higher => "HIGHER",
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    let mut pending = None;
    for c in text.chars() {
        if c.is_ascii_whitespace() {
            continue;
        }
        let digit = c
            .to_digit(16)
            .ok_or_else(|| CodecError::InvalidBitstring(text.to_string()))? as u8;
        pending = match pending {
            None => Some(digit),
            Some(high) => {
                bytes.push((high << 4) | digit);
                None
            }
        };
    }
    if pending.is_some() {
        return Err(CodecError::InvalidBitstring(text.to_string()));
    }
    Ok(bytes)
}
