/*!
 * Data model for devgate.
 *
 * Configuration types arrive from the orchestration layer (files or
 * cluster resources) and are never mutated by the gateway. Field names
 * follow the camelCase layout of those documents.
 */
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque property bag carried by drivers, devices, resources and buses
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Decode a property bag into a typed protocol configuration
pub fn from_properties<T: DeserializeOwned>(properties: &Properties) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(properties.clone()))
        .map_err(|e| Error::config_invalid(e.to_string()))
}

/// Identifies a protocol driver instance and its protocol-specific settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Driver type ("mqtt", "opcua", ...)
    #[serde(rename = "type")]
    pub driver_type: String,
    /// Protocol-specific settings
    #[serde(default)]
    pub properties: Properties,
}

impl DriverConfig {
    /// Create a driver config with the given type and properties
    pub fn new<S: Into<String>>(driver_type: S, properties: Properties) -> Self {
        Self {
            driver_type: driver_type.into(),
            properties,
        }
    }
}

/// Configuration of one message bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBusConfig {
    /// A disabled bus is never constructed
    #[serde(default)]
    pub enabled: bool,
    /// Message bus type ("mqtt", ...)
    #[serde(rename = "type")]
    pub message_bus_type: String,
    /// Bus-specific settings
    #[serde(default)]
    pub properties: Properties,
}

/// A device's identity, owning driver, addressing and resource schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub name: String,
    pub driver_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Protocol addressing, e.g. the OPC-UA `endpoint`
    #[serde(default)]
    pub protocol_properties: Properties,
    #[serde(default)]
    pub profile: DeviceProfile,
}

impl DeviceConfig {
    /// Look up a resource of this device by name
    pub fn resource(&self, name: &str) -> Option<&DeviceResource> {
        find_device_resource(name, &self.profile.device_resources)
    }
}

/// Resource schema of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(default)]
    pub device_resources: Vec<DeviceResource>,
}

/// One addressable telemetry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceResource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: ResourceProperties,
    /// Protocol-specific addressing, e.g. the OPC-UA `nodeId`
    #[serde(default)]
    pub attributes: Properties,
}

impl DeviceResource {
    /// Create a resource with the given name and value type
    pub fn new<S: Into<String>>(name: S, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            properties: ResourceProperties {
                value_type,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Read a string attribute
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Find a resource by name
pub fn find_device_resource<'a>(
    name: &str,
    resources: &'a [DeviceResource],
) -> Option<&'a DeviceResource> {
    resources.iter().find(|r| r.name == name)
}

/// Access mode of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadWrite {
    #[default]
    R,
    W,
    RW,
    WR,
}

/// Semantic and numeric-range contract of a resource's values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProperties {
    #[serde(default)]
    pub read_write: ReadWrite,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<f64>,
    #[serde(default)]
    pub optional: Properties,
}

/// Declared value type of a resource
///
/// Unrecognised names are kept in [`ValueType::Other`] so that a bad
/// schema only fails when a reading is coerced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Bool,
    #[default]
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Object,
    Other(String),
}

impl ValueType {
    /// Canonical name of the value type
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bool => "Bool",
            Self::String => "String",
            Self::Uint8 => "Uint8",
            Self::Uint16 => "Uint16",
            Self::Uint32 => "Uint32",
            Self::Uint64 => "Uint64",
            Self::Int8 => "Int8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
            Self::Int64 => "Int64",
            Self::Float32 => "Float32",
            Self::Float64 => "Float64",
            Self::Object => "Object",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for ValueType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "Bool" => Self::Bool,
            "String" => Self::String,
            "Uint8" => Self::Uint8,
            "Uint16" => Self::Uint16,
            "Uint32" => Self::Uint32,
            "Uint64" => Self::Uint64,
            "Int8" => Self::Int8,
            "Int16" => Self::Int16,
            "Int32" => Self::Int32,
            "Int64" => Self::Int64,
            "Float32" => Self::Float32,
            "Float64" => Self::Float64,
            "Object" => Self::Object,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for ValueType {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<ValueType> for String {
    fn from(value_type: ValueType) -> Self {
        value_type.as_str().to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coerced reading in the native representation of its value type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    String(String),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Object(serde_json::Value),
}

impl TypedValue {
    /// The value type this value is a representation of
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::String(_) => ValueType::String,
            Self::Uint8(_) => ValueType::Uint8,
            Self::Uint16(_) => ValueType::Uint16,
            Self::Uint32(_) => ValueType::Uint32,
            Self::Uint64(_) => ValueType::Uint64,
            Self::Int8(_) => ValueType::Int8,
            Self::Int16(_) => ValueType::Int16,
            Self::Int32(_) => ValueType::Int32,
            Self::Int64(_) => ValueType::Int64,
            Self::Float32(_) => ValueType::Float32,
            Self::Float64(_) => ValueType::Float64,
            Self::Object(_) => ValueType::Object,
        }
    }

    /// Convert to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Bool(v) => Value::Bool(*v),
            Self::String(v) => Value::String(v.clone()),
            Self::Uint8(v) => Value::from(*v),
            Self::Uint16(v) => Value::from(*v),
            Self::Uint32(v) => Value::from(*v),
            Self::Uint64(v) => Value::from(*v),
            Self::Int8(v) => Value::from(*v),
            Self::Int16(v) => Value::from(*v),
            Self::Int32(v) => Value::from(*v),
            Self::Int64(v) => Value::from(*v),
            Self::Float32(v) => Value::from(*v),
            Self::Float64(v) => Value::from(*v),
            Self::Object(v) => v.clone(),
        }
    }
}

/// The coerced, typed output of one reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryResult {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub value: TypedValue,
    /// Unix time in nanoseconds
    pub create_timestamp: i64,
}

/// Write-path request addressed to one resource of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub device_name: String,
    pub resource_name: String,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_config_from_json() {
        let config: DeviceConfig = serde_json::from_value(json!({
            "name": "d1",
            "driverType": "opcua",
            "protocolProperties": {"endpoint": "opc.tcp://127.0.0.1:4840"},
            "profile": {
                "deviceResources": [{
                    "name": "temp",
                    "properties": {"valueType": "Float64", "units": "C"},
                    "attributes": {"nodeId": "ns=2;i=2"}
                }]
            }
        }))
        .unwrap();

        assert_eq!(config.name, "d1");
        assert_eq!(config.driver_type, "opcua");
        let temp = config.resource("temp").unwrap();
        assert_eq!(temp.properties.value_type, ValueType::Float64);
        assert_eq!(temp.properties.read_write, ReadWrite::R);
        assert_eq!(temp.properties.units.as_deref(), Some("C"));
        assert_eq!(temp.attribute_str("nodeId"), Some("ns=2;i=2"));
        assert!(config.resource("humidity").is_none());
    }

    #[test]
    fn test_unknown_value_type_is_kept() {
        let props: ResourceProperties =
            serde_json::from_value(json!({"valueType": "Complex128"})).unwrap();
        assert_eq!(props.value_type, ValueType::Other("Complex128".to_string()));
        assert_eq!(props.value_type.to_string(), "Complex128");
    }

    #[test]
    fn test_driver_config_type_field() {
        let config: DriverConfig =
            serde_json::from_value(json!({"type": "mqtt", "properties": {"subTopic": "devices/#"}}))
                .unwrap();
        assert_eq!(config.driver_type, "mqtt");
        assert_eq!(config.properties["subTopic"], "devices/#");

        let bus: MessageBusConfig =
            serde_json::from_value(json!({"type": "mqtt"})).unwrap();
        assert!(!bus.enabled);
        assert!(bus.properties.is_empty());
    }

    #[test]
    fn test_telemetry_result_serialization() {
        let result = TelemetryResult {
            name: "temp".to_string(),
            value_type: ValueType::Float64,
            value: TypedValue::Float64(21.5),
            create_timestamp: 1_700_000_000_000_000_000,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "temp",
                "type": "Float64",
                "value": 21.5,
                "createTimestamp": 1_700_000_000_000_000_000i64
            })
        );
    }

    #[test]
    fn test_typed_value_reports_its_type() {
        assert_eq!(TypedValue::Uint8(1).value_type(), ValueType::Uint8);
        assert_eq!(TypedValue::Object(json!({})).value_type(), ValueType::Object);
        assert_eq!(TypedValue::Int16(-3).to_json(), json!(-3));
    }

    #[test]
    fn test_from_properties() {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Probe {
            sub_topic: String,
            #[serde(default)]
            qos: u8,
        }

        let props = json!({"subTopic": "devices/#"}).as_object().cloned().unwrap();
        let probe: Probe = from_properties(&props).unwrap();
        assert_eq!(probe.sub_topic, "devices/#");
        assert_eq!(probe.qos, 0);

        let bad = json!({"subTopic": 3}).as_object().cloned().unwrap();
        assert!(matches!(
            from_properties::<Probe>(&bad),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_find_device_resource() {
        let resources = vec![
            DeviceResource::new("temp", ValueType::Float64),
            DeviceResource::new("level", ValueType::Uint8),
        ];
        let level = find_device_resource("level", &resources).unwrap();
        assert_eq!(level.properties.value_type, ValueType::Uint8);
        assert!(find_device_resource("humidity", &resources).is_none());
    }
}
