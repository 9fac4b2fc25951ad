// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use courier_core::{CourierError, Result};

pub const MAX_REQUEST_ID_LENGTH: usize = 64;

/// Inbound control messages larger than this are dropped before decryption.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024;

pub const METHOD_CONNECT: &str = "connect";
pub const METHOD_GET_PUBLIC_KEY: &str = "get_public_key";
pub const METHOD_SIGN_EVENT: &str = "sign_event";
pub const METHOD_NIP04_ENCRYPT: &str = "nip04_encrypt";
pub const METHOD_NIP04_DECRYPT: &str = "nip04_decrypt";
pub const METHOD_NIP44_ENCRYPT: &str = "nip44_encrypt";
pub const METHOD_NIP44_DECRYPT: &str = "nip44_decrypt";
pub const METHOD_PING: &str = "ping";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nip46Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nip46Response {
    pub id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Nip46Response {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<String> {
        match (self.result, self.error) {
            (_, Some(error)) if !error.is_empty() => Err(CourierError::Remote(error)),
            (Some(result), _) => Ok(result),
            (None, _) => Err(CourierError::Remote("empty response".into())),
        }
    }
}

/// A decrypted control message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nip46Message {
    Request(Nip46Request),
    Response(Nip46Response),
}

impl Nip46Message {
    pub fn id(&self) -> &str {
        match self {
            Nip46Message::Request(r) => &r.id,
            Nip46Message::Response(r) => &r.id,
        }
    }

    /// Parse and validate a decrypted payload. Non-string `result` values are
    /// kept as their JSON text.
    pub fn parse(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| is_valid_request_id(id))
            .ok_or_else(|| CourierError::invalid_input("missing or malformed request id"))?
            .to_string();

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let params = match value.get("params") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.iter().map(value_text).collect(),
                Some(_) => return Err(CourierError::invalid_input("params must be an array")),
            };
            return Ok(Nip46Message::Request(Nip46Request {
                id,
                method: method.to_string(),
                params,
            }));
        }

        let result = value.get("result").filter(|v| !v.is_null()).map(value_text);
        let error = value
            .get("error")
            .filter(|v| !v.is_null())
            .map(value_text)
            .filter(|e| !e.is_empty());
        Ok(Nip46Message::Response(Nip46Response { id, result, error }))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            Nip46Message::Request(r) => serde_json::to_string(r)?,
            Nip46Message::Response(r) => serde_json::to_string(r)?,
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LENGTH
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_and_response() {
        let req = Nip46Message::parse(r#"{"id":"abc-1","method":"ping","params":[]}"#).unwrap();
        assert_eq!(
            req,
            Nip46Message::Request(Nip46Request {
                id: "abc-1".into(),
                method: "ping".into(),
                params: vec![],
            })
        );

        let resp = Nip46Message::parse(r#"{"id":"abc-1","result":"pong","error":null}"#).unwrap();
        match resp {
            Nip46Message::Response(r) => assert_eq!(r.into_result().unwrap(), "pong"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_string_result_kept_as_json() {
        let resp =
            Nip46Message::parse(r#"{"id":"x","result":["wss://a.example.com"]}"#).unwrap();
        let Nip46Message::Response(r) = resp else {
            panic!("expected response");
        };
        assert_eq!(r.result.as_deref(), Some(r#"["wss://a.example.com"]"#));
    }

    #[test]
    fn test_error_response_surfaces() {
        let resp = Nip46Response {
            id: "x".into(),
            result: None,
            error: Some("denied".into()),
        };
        assert!(matches!(resp.into_result(), Err(CourierError::Remote(e)) if e == "denied"));
    }

    #[test]
    fn test_request_id_validation() {
        assert!(is_valid_request_id(&new_request_id()));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("has space"));
        assert!(!is_valid_request_id(&"a".repeat(MAX_REQUEST_ID_LENGTH + 1)));
        assert!(Nip46Message::parse(r#"{"id":"bad id","method":"ping"}"#).is_err());
        assert!(Nip46Message::parse(r#"{"method":"ping"}"#).is_err());
    }
}
