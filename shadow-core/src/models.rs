//! Device shadow data model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The canonical state of a single device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Shadow {
    /// The stable ID of the device.
    pub device: String,
    /// The state last reported by the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<State>,
    /// The state the device is asked to converge to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<State>,
    /// The connection status of the device, advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
}

impl Shadow {
    /// Create an empty shadow for the given device.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }
}

/// A reported or desired state document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The number of merges applied to this state.
    #[serde(default)]
    pub version: u64,
    /// The state document itself.
    #[serde(default)]
    pub data: Value,
    /// Unix timestamp in milliseconds of the last update.
    #[serde(default)]
    pub timestamp: i64,
}

impl State {
    /// Create a new unversioned state holding the given data.
    pub fn new(data: Value, timestamp: i64) -> Self {
        Self { version: 0, data, timestamp }
    }
}

/// The connection status of a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub client_id: String,
    /// Unix timestamp in milliseconds of the status change.
    pub timestamp: i64,
}

/// The kinds of state stored per device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKey {
    Reported,
    Desired,
    Connection,
    /// Any unrecognized kind received over the wire.
    Garbage,
}

impl StateKey {
    /// Map a wire enum value onto a state key, unknown values becoming `Garbage`.
    pub fn from_wire(val: i32) -> Self {
        match val {
            0 => Self::Reported,
            1 => Self::Desired,
            2 => Self::Connection,
            _ => Self::Garbage,
        }
    }

    /// The key suffix used in the state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Desired => "desired",
            Self::Connection => "connection",
            // NOTE: unknown kinds share a single slot; kept for compatibility with existing stores.
            Self::Garbage => "garbage",
        }
    }
}

/// Build the state store key of the given device & state kind, formatted as `<device>:<kind>`.
pub fn key(device: &str, kind: StateKey) -> String {
    format!("{}:{}", device, kind.as_str())
}

/// A versioned per-device state record as carried on the delta & changelog topics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateMessage {
    #[serde(default)]
    pub version: u64,
    /// A delta fragment on delta topics, the full document on changelog topics.
    #[serde(default)]
    pub state: Value,
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// The combined reported & desired document produced by the document merge stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    /// Incremented by exactly one for each consumed source record.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
}

/// A raw publish received from a device, before routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub proto_level: u8,
    pub source_topic: String,
    pub source_device: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// A message addressed to a device, relative to its own topic namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// The target device, not necessarily the connected one.
    pub device_id: String,
    /// The topic path below the device namespace, never starting with `/`.
    pub sub_path: String,
    pub data: Value,
}

/// Serde helpers encoding raw payload bytes as base64 strings.
mod base64_bytes {
    use serde::{de::Error as DeError, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded: String = Deserialize::deserialize(de)?;
        base64::decode(&encoded).map_err(|err| DeError::custom(err.to_string()))
    }
}
