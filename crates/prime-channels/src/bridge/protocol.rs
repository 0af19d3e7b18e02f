//! Wire format spoken with the bridge process: one JSON object per line.
//!
//! Requests carry an `id`; responses echo it with `result` or `error`.
//! Unsolicited lines carry `event` and `data` instead.

use prime_core::traits::{ClientEvent, ConnectionUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
pub(crate) struct BridgeRequest<'a> {
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Deserialize)]
struct RawLine {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<RawError>,
    event: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct RawError {
    message: String,
}

/// One decoded line from the bridge's stdout.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    Event(ClientEvent),
    /// Well-formed but irrelevant (other events, log lines, blanks).
    Ignored(String),
}

/// Serialize a request as a newline-terminated line.
pub(crate) fn encode_request(
    id: u64,
    method: &str,
    params: Option<Value>,
) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&BridgeRequest { id, method, params })?;
    line.push('\n');
    Ok(line)
}

/// Decode a stdout line.
pub(crate) fn parse_line(line: &str) -> Inbound {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Inbound::Ignored(String::new());
    }

    let raw: RawLine = match serde_json::from_str(trimmed) {
        Ok(r) => r,
        Err(_) => return Inbound::Ignored(trimmed.to_string()),
    };

    if let Some(event) = raw.event {
        return match event.as_str() {
            "connection.update" => match serde_json::from_value::<ConnectionUpdate>(raw.data) {
                Ok(update) => Inbound::Event(ClientEvent::ConnectionUpdate(update)),
                Err(e) => Inbound::Ignored(format!("malformed connection.update: {e}")),
            },
            "creds.update" => Inbound::Event(ClientEvent::CredsUpdate(raw.data)),
            other => Inbound::Ignored(other.to_string()),
        };
    }

    match raw.id {
        Some(id) => {
            let result = match raw.error {
                Some(err) => Err(err.message),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Inbound::Response { id, result }
        }
        None => Inbound::Ignored(trimmed.to_string()),
    }
}

/// Pull the code out of a `requestPairingCode` result: a bare string or `{"code": ...}`.
pub(crate) fn pairing_code_from_result(result: &Value) -> Option<String> {
    result
        .as_str()
        .or_else(|| result.get("code").and_then(|c| c.as_str()))
        .map(str::to_string)
        .filter(|c| !c.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prime_core::traits::{ConnectionState, DisconnectReason};

    #[test]
    fn test_encode_request_line() {
        let line = encode_request(
            3,
            "requestPairingCode",
            Some(serde_json::json!({"phoneNumber": "15551234567"})),
        )
        .unwrap();
        assert!(line.ends_with('\n'));
        let json: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["method"], "requestPairingCode");
        assert_eq!(json["params"]["phoneNumber"], "15551234567");
    }

    #[test]
    fn test_encode_request_without_params() {
        let line = encode_request(9, "end", None).unwrap();
        let json: Value = serde_json::from_str(line.trim()).unwrap();
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_parse_response_result() {
        let inbound = parse_line(r#"{"id":2,"result":{"code":"ABCD1234"}}"#);
        assert_eq!(
            inbound,
            Inbound::Response {
                id: 2,
                result: Ok(serde_json::json!({"code": "ABCD1234"}))
            }
        );
    }

    #[test]
    fn test_parse_response_error() {
        let inbound = parse_line(r#"{"id":4,"error":{"message":"rate-overlimit"}}"#);
        assert_eq!(
            inbound,
            Inbound::Response {
                id: 4,
                result: Err("rate-overlimit".to_string())
            }
        );
    }

    #[test]
    fn test_parse_connection_close_event() {
        let inbound = parse_line(
            r#"{"event":"connection.update","data":{"connection":"close","lastDisconnect":{"statusCode":440}}}"#,
        );
        let Inbound::Event(ClientEvent::ConnectionUpdate(update)) = inbound else {
            panic!("expected connection update, got {inbound:?}");
        };
        assert_eq!(update.connection, Some(ConnectionState::Close));
        assert_eq!(
            update.last_disconnect.unwrap().reason(),
            DisconnectReason::Replaced
        );
    }

    #[test]
    fn test_parse_creds_event() {
        let inbound = parse_line(r#"{"event":"creds.update","data":{"registered":true}}"#);
        assert_eq!(
            inbound,
            Inbound::Event(ClientEvent::CredsUpdate(
                serde_json::json!({"registered": true})
            ))
        );
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert!(matches!(parse_line(""), Inbound::Ignored(_)));
        assert!(matches!(parse_line("bridge starting..."), Inbound::Ignored(_)));
        assert!(matches!(
            parse_line(r#"{"event":"messages.upsert","data":{}}"#),
            Inbound::Ignored(_)
        ));
        assert!(matches!(parse_line(r#"{"hello":1}"#), Inbound::Ignored(_)));
    }

    #[test]
    fn test_pairing_code_from_result_shapes() {
        assert_eq!(
            pairing_code_from_result(&serde_json::json!("ABCD1234")).as_deref(),
            Some("ABCD1234")
        );
        assert_eq!(
            pairing_code_from_result(&serde_json::json!({"code": "WXYZ9876"})).as_deref(),
            Some("WXYZ9876")
        );
        assert!(pairing_code_from_result(&serde_json::json!({"code": ""})).is_none());
        assert!(pairing_code_from_result(&Value::Null).is_none());
    }
}
