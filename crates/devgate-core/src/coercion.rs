/*!
 * Value coercion for devgate.
 *
 * Converts raw protocol readings into typed telemetry values. The range of
 * the declared value type is checked before the conversion; every reading
 * that cannot be represented fails with [`Error::UnsupportedValue`].
 */
use chrono::Utc;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{DeviceResource, TelemetryResult, TypedValue, ValueType};

/// Coerce a reading into a result for the given resource
///
/// The result is stamped with the current wall-clock time in nanoseconds.
pub fn coerce(resource: &DeviceResource, reading: &Value) -> Result<TelemetryResult> {
    let value_type = &resource.properties.value_type;
    let value = coerce_value(value_type, reading).map_err(|e| match e {
        Error::UnsupportedValue(msg) => Error::unsupported_value(format!(
            "fail to parse {} reading, {}",
            resource.name, msg
        )),
        other => other,
    })?;

    Ok(TelemetryResult {
        name: resource.name.clone(),
        value_type: value_type.clone(),
        value,
        create_timestamp: now_nanos(),
    })
}

/// Coerce a reading into the native representation of a value type
pub fn coerce_value(value_type: &ValueType, reading: &Value) -> Result<TypedValue> {
    match value_type {
        ValueType::Bool => to_bool(reading).map(TypedValue::Bool),
        ValueType::String => to_string(reading).map(TypedValue::String),
        ValueType::Uint8 => to_integer(reading, value_type, 0, u8::MAX as i128)
            .map(|v| TypedValue::Uint8(v as u8)),
        ValueType::Uint16 => to_integer(reading, value_type, 0, u16::MAX as i128)
            .map(|v| TypedValue::Uint16(v as u16)),
        ValueType::Uint32 => to_integer(reading, value_type, 0, u32::MAX as i128)
            .map(|v| TypedValue::Uint32(v as u32)),
        ValueType::Uint64 => to_integer(reading, value_type, 0, u64::MAX as i128)
            .map(|v| TypedValue::Uint64(v as u64)),
        ValueType::Int8 => to_integer(reading, value_type, i8::MIN as i128, i8::MAX as i128)
            .map(|v| TypedValue::Int8(v as i8)),
        ValueType::Int16 => to_integer(reading, value_type, i16::MIN as i128, i16::MAX as i128)
            .map(|v| TypedValue::Int16(v as i16)),
        ValueType::Int32 => to_integer(reading, value_type, i32::MIN as i128, i32::MAX as i128)
            .map(|v| TypedValue::Int32(v as i32)),
        ValueType::Int64 => to_integer(reading, value_type, i64::MIN as i128, i64::MAX as i128)
            .map(|v| TypedValue::Int64(v as i64)),
        ValueType::Float32 => {
            let v = to_float(reading)?;
            if v.is_nan() || v.abs() > f32::MAX as f64 {
                return Err(out_of_range(value_type, reading));
            }
            Ok(TypedValue::Float32(v as f32))
        }
        ValueType::Float64 => {
            let v = to_float(reading)?;
            if !v.is_finite() {
                return Err(out_of_range(value_type, reading));
            }
            Ok(TypedValue::Float64(v))
        }
        ValueType::Object => Ok(TypedValue::Object(reading.clone())),
        ValueType::Other(name) => Err(Error::unsupported_value(format!(
            "none supported value type: {}",
            name
        ))),
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Intermediate numeric form of a reading
#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i128),
    Float(f64),
}

fn to_number(reading: &Value) -> Result<Number> {
    match reading {
        Value::Bool(b) => Ok(Number::Int(i128::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Number::Int(i128::from(i)))
            } else if let Some(u) = n.as_u64() {
                Ok(Number::Int(i128::from(u)))
            } else {
                n.as_f64()
                    .map(Number::Float)
                    .ok_or_else(|| Error::unsupported_value(format!("invalid number {}", n)))
            }
        }
        Value::String(s) => parse_number(s.trim())
            .ok_or_else(|| Error::unsupported_value(format!("unable to parse {:?} as a number", s))),
        other => Err(Error::unsupported_value(format!(
            "unable to cast {} to a number",
            other
        ))),
    }
}

fn parse_number(s: &str) -> Option<Number> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if digits.starts_with(['+', '-']) {
        return None;
    }
    let signed = |v: i128| if negative { v.checked_neg() } else { Some(v) };

    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        return i128::from_str_radix(hex, 16)
            .ok()
            .and_then(signed)
            .map(Number::Int);
    }
    if let Some(v) = digits.parse::<i128>().ok().and_then(signed) {
        return Some(Number::Int(v));
    }
    s.parse::<f64>().ok().map(Number::Float)
}

fn to_integer(reading: &Value, value_type: &ValueType, min: i128, max: i128) -> Result<i128> {
    let value = match to_number(reading)? {
        Number::Int(i) => i,
        Number::Float(f) => {
            if !f.is_finite() || f.trunc() < i128::MIN as f64 || f.trunc() > i128::MAX as f64 {
                return Err(out_of_range(value_type, reading));
            }
            f.trunc() as i128
        }
    };
    if value < min || value > max {
        return Err(out_of_range(value_type, reading));
    }
    Ok(value)
}

fn to_float(reading: &Value) -> Result<f64> {
    Ok(match to_number(reading)? {
        Number::Int(i) => i as f64,
        Number::Float(f) => f,
    })
}

fn to_bool(reading: &Value) -> Result<bool> {
    match reading {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => match s.as_str() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
            _ => Err(Error::unsupported_value(format!(
                "unable to parse {:?} as a bool",
                s
            ))),
        },
        other => Err(Error::unsupported_value(format!(
            "unable to cast {} to a bool",
            other
        ))),
    }
}

fn to_string(reading: &Value) -> Result<String> {
    match reading {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::unsupported_value(format!(
            "unable to cast {} to a string",
            other
        ))),
    }
}

fn out_of_range(value_type: &ValueType, reading: &Value) -> Error {
    Error::unsupported_value(format!("{} is out of range for {}", reading, value_type))
}
