//! Uplink message model
//!
//! TTN uplink envelopes are loosely typed: any field may be missing, and
//! numeric metadata sometimes arrives as a string. Decoding therefore never
//! fails once the bytes are valid JSON. Every string field falls back to `""`,
//! every number to zero, and missing substructures to their empty value.
//!
//! # Examples
//! ```
//! use ttn_mqtt::protocol::InboundMessage;
//!
//! let wire = br#"{"app_id":"a","dev_id":"d","payload_raw":"SGk=","metadata":{"frequency":"868.1"}}"#;
//! let message = InboundMessage::decode(wire).unwrap();
//! assert_eq!(message.app_id, "a");
//! assert_eq!(message.metadata.frequency, "868.1");
//! assert!(message.metadata.gateways.is_empty());
//! ```

use super::codec::{decode_envelope, decode_payload_raw, CodecError};
use serde::Serialize;
use serde_json::{Map, Value};

/// One decoded uplink
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct InboundMessage {
    pub app_id: String,
    pub dev_id: String,
    /// Base64 payload exactly as received
    pub payload_raw: String,
    /// Output of the application's payload decoder, when one is configured
    pub payload_fields: Option<Value>,
    pub metadata: Metadata,
}

/// Radio metadata attached to an uplink
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Metadata {
    pub time: String,
    pub frequency: String,
    pub data_rate: String,
    /// Receiving gateways in wire order
    pub gateways: Vec<Gateway>,
}

/// A gateway that heard the uplink
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Gateway {
    pub gateway_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

impl InboundMessage {
    /// Decode raw frame bytes; only malformed JSON is an error
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let value = decode_envelope(payload)?;
        Ok(Self::from_json(&value))
    }

    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        Self {
            app_id: opt_string(object, "app_id"),
            dev_id: opt_string(object, "dev_id"),
            payload_raw: opt_string(object, "payload_raw"),
            payload_fields: object.get("payload_fields").filter(|v| v.is_object()).cloned(),
            metadata: object
                .get("metadata")
                .map(Metadata::from_json)
                .unwrap_or_default(),
        }
    }

    /// The device payload as bytes
    pub fn payload_bytes(&self) -> Result<Vec<u8>, CodecError> {
        decode_payload_raw(&self.payload_raw)
    }
}

impl Metadata {
    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        let gateways = object
            .get("gateways")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().map(Gateway::from_json).collect())
            .unwrap_or_default();

        Self {
            time: opt_string(object, "time"),
            frequency: opt_string(object, "frequency"),
            data_rate: opt_string(object, "data_rate"),
            gateways,
        }
    }
}

impl Gateway {
    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };

        Self {
            gateway_id: opt_string(object, "gtw_id"),
            latitude: opt_f64(object, "latitude"),
            longitude: opt_f64(object, "longitude"),
            altitude: opt_i32(object, "altitude"),
        }
    }
}

/// Strings verbatim, numbers and booleans by their text, anything else `""`
fn opt_string(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn opt_f64(object: &Map<String, Value>, key: &str) -> f64 {
    let parsed = match object.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn opt_i32(object: &Map<String, Value>, key: &str) -> i32 {
    let parsed = match object.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.is_finite()).map(|v| v as i64)),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|v| v as i64),
        _ => None,
    };
    parsed.and_then(|v| i32::try_from(v).ok()).unwrap_or(0)
}
