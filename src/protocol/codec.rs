//! Wire envelope codec
//!
//! Downlinks travel as `{"payload_raw": "<base64>"}`. Uplinks arrive as a JSON
//! object whose fields are interpreted by [`crate::protocol::messages`]; this
//! layer only checks that the bytes are JSON at all.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Longest downlink command, in bytes, that will ever be sent
pub const MAX_DOWNLINK_LEN: usize = 3;

/// Outbound envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkEnvelope {
    pub payload_raw: String,
}

/// Envelope encoding and decoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Downlink command is {len} bytes, limit is {max}")]
    PayloadTooLong { len: usize, max: usize },
    #[error("Malformed JSON envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub fn encode_downlink(command: &str) -> Result<Bytes, CodecError> {
    if command.len() > MAX_DOWNLINK_LEN {
        return Err(CodecError::PayloadTooLong {
            len: command.len(),
            max: MAX_DOWNLINK_LEN,
        });
    }

    let envelope = DownlinkEnvelope {
        payload_raw: BASE64_STANDARD.encode(command.as_bytes()),
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

pub fn decode_envelope(payload: &[u8]) -> Result<Value, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode a base64 `payload_raw` value into the device's raw bytes
pub fn decode_payload_raw(payload_raw: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64_STANDARD.decode(payload_raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn long_commands_are_rejected(command in "[ -~]{4,32}") {
            let result = encode_downlink(&command);
            prop_assert!(
                matches!(result, Err(CodecError::PayloadTooLong { .. })),
                "command {:?} should be rejected", command
            );
        }

        #[test]
        fn short_commands_survive_the_envelope(command in "[ -~]{0,3}") {
            let encoded = encode_downlink(&command).unwrap();
            let envelope: DownlinkEnvelope = serde_json::from_slice(&encoded).unwrap();
            let raw = decode_payload_raw(&envelope.payload_raw).unwrap();
            prop_assert_eq!(raw, command.as_bytes().to_vec());
        }
    }

    #[test]
    fn test_encode_on_command() {
        let encoded = encode_downlink("ON").unwrap();
        assert_eq!(&encoded[..], br#"{"payload_raw":"T04="}"#);
    }

    #[test]
    fn test_encode_length_is_counted_in_bytes() {
        // Two characters, four bytes
        assert!(matches!(
            encode_downlink("éé"),
            Err(CodecError::PayloadTooLong { len: 4, max: 3 })
        ));
        assert!(encode_downlink("é").is_ok());
    }

    #[test]
    fn test_encode_empty_command() {
        let encoded = encode_downlink("").unwrap();
        assert_eq!(&encoded[..], br#"{"payload_raw":""}"#);
    }

    #[test]
    fn test_decode_envelope() {
        let value = decode_envelope(br#"{"app_id":"a"}"#).unwrap();
        assert_eq!(value["app_id"], "a");

        // Missing fields are not this layer's concern
        assert!(decode_envelope(b"{}").is_ok());
        assert!(decode_envelope(b"[1,2]").is_ok());
    }

    #[test]
    fn test_decode_malformed_envelope() {
        assert!(matches!(
            decode_envelope(b"not json"),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(decode_envelope(b""), Err(CodecError::Decode(_))));
        assert!(matches!(
            decode_envelope(br#"{"app_id":"#),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_payload_raw() {
        assert_eq!(decode_payload_raw("SGk=").unwrap(), b"Hi");
        assert!(matches!(
            decode_payload_raw("not*base64"),
            Err(CodecError::Base64(_))
        ));
    }
}
