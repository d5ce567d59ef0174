//! Binary layout of tunneled HTTP requests and responses
//!
//! Every encoded payload starts with a single version byte
//! ([`crate::WIRE_VERSION`]) followed by the bincode encoding of the
//! payload struct. Headers are carried as an ordered list of name/value
//! pairs, so repeated header names and their order survive the trip.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload layout errors
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// An HTTP request carried to the agent inside a `Request` packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunneledRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// An HTTP response carried back from the agent inside a `Response` packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunneledResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TunneledRequest {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        encode_versioned(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        decode_versioned(bytes)
    }
}

impl TunneledResponse {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        encode_versioned(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        decode_versioned(bytes)
    }
}

fn encode_versioned<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let mut buf = vec![crate::WIRE_VERSION];
    bincode::serialize_into(&mut buf, value)?;
    Ok(buf)
}

fn decode_versioned<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, PayloadError> {
    let (&version, rest) = bytes.split_first().ok_or(PayloadError::Empty)?;
    if version != crate::WIRE_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(rest)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = TunneledRequest {
            method: "POST".to_string(),
            uri: "/api/items?limit=10".to_string(),
            headers: vec![
                ("Host".to_string(), "example.com".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: br#"{"name":"widget"}"#.to_vec(),
        };

        let encoded = request.encode().unwrap();
        assert_eq!(encoded[0], crate::WIRE_VERSION);

        let decoded = TunneledRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_round_trip_with_binary_body() {
        let response = TunneledResponse {
            status: 200,
            headers: vec![(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            )],
            body: vec![0, 159, 146, 150, 255],
        };

        let decoded = TunneledResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_repeated_headers_preserve_order() {
        let response = TunneledResponse {
            status: 200,
            headers: vec![
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
                ("Set-Cookie".to_string(), "c=3".to_string()),
            ],
            body: Vec::new(),
        };

        let decoded = TunneledResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.headers, response.headers);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let request = TunneledRequest {
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        };

        let mut encoded = request.encode().unwrap();
        encoded[0] = 42;

        let err = TunneledRequest::decode(&encoded).unwrap_err();
        assert!(matches!(err, PayloadError::UnsupportedVersion(42)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let err = TunneledResponse::decode(&[]).unwrap_err();
        assert!(matches!(err, PayloadError::Empty));
    }
}
