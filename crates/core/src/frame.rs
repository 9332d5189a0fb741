//! Wire encoding for the two frame shapes that cross the tunnel channel.
//!
//! Frames are single-line JSON objects; bodies are carried as base64 text so
//! the channel, which is text-only, still round-trips arbitrary bytes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AetherError;

pub type Headers = HashMap<String, Vec<String>>;

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One inbound public HTTP request, materialized for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Never serialized: only meaningful on the edge, which owns the
    /// suspended handler and needs a deadline reference point.
    #[serde(skip, default = "std::time::Instant::now")]
    pub created_at: std::time::Instant,
}

/// The agent's reply to one `RequestFrame`, or a synthetic failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub err: String,
}

impl ResponseFrame {
    /// Build the synthetic response sent to every exchange still pending
    /// when a session tears down.
    pub fn closed(id: u64, reason: &str) -> Self {
        Self {
            id,
            status_code: 0,
            headers: Headers::default(),
            body: Vec::new(),
            err: reason.to_string(),
        }
    }

    pub fn origin_failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status_code: 0,
            headers: Headers::default(),
            body: Vec::new(),
            err: message.into(),
        }
    }
}

/// Encode a frame to the JSON text that goes out on the channel.
///
/// ```
/// use aether_core::frame::{RequestFrame, encode};
/// use std::time::Instant;
///
/// let req = RequestFrame {
///     id: 1,
///     ip: "1.2.3.4".into(),
///     method: "GET".into(),
///     url: "/ping".into(),
///     headers: Default::default(),
///     body: b"hi".to_vec(),
///     created_at: Instant::now(),
/// };
///
/// let text = encode(&req).unwrap();
/// assert!(text.contains("\"id\":1"));
/// ```
pub fn encode<T: Serialize>(frame: &T) -> Result<String, AetherError> {
    serde_json::to_string(frame).map_err(|err| AetherError::MalformedFrame(err.to_string()))
}

/// Decode a frame from channel bytes, rejecting anything that doesn't parse
/// into the expected shape.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a str) -> Result<T, AetherError> {
    serde_json::from_str(bytes).map_err(|err| AetherError::MalformedFrame(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestFrame {
        RequestFrame {
            id: 42,
            ip: "10.0.0.1".into(),
            method: "POST".into(),
            url: "/echo?x=1".into(),
            headers: Headers::from([
                ("content-type".to_string(), vec!["application/json".to_string()]),
                ("x-test".to_string(), vec!["a".to_string(), "b".to_string()]),
            ]),
            body: vec![0, 159, 146, 150, 1, 2, 3],
            created_at: std::time::Instant::now(),
        }
    }

    #[test]
    fn request_round_trips_byte_for_byte() {
        let req = sample_request();
        let text = encode(&req).unwrap();
        let decoded: RequestFrame = decode(&text).unwrap();

        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.ip, req.ip);
        assert_eq!(decoded.method, req.method);
        assert_eq!(decoded.url, req.url);
        assert_eq!(decoded.headers, req.headers);
        assert_eq!(decoded.body, req.body);
    }

    #[test]
    fn empty_body_round_trips() {
        let mut req = sample_request();
        req.body.clear();
        let text = encode(&req).unwrap();
        let decoded: RequestFrame = decode(&text).unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn response_round_trips_with_err() {
        let res = ResponseFrame::closed(7, "connection was closed");
        let text = encode(&res).unwrap();
        let decoded: ResponseFrame = decode(&text).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.err, "connection was closed");
        assert_eq!(decoded.status_code, 0);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode::<ResponseFrame>("not json").unwrap_err();
        assert!(matches!(err, AetherError::MalformedFrame(_)));
    }

    #[test]
    fn missing_required_id_is_rejected() {
        let err = decode::<ResponseFrame>("{}").unwrap_err();
        assert!(matches!(err, AetherError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let decoded: ResponseFrame =
            decode(r#"{"id":1,"status_code":200,"extra":"ignored"}"#).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.status_code, 200);
    }
}
