//! Codec between wire text and [`Message`] envelopes
//!
//! # Wire Format
//!
//! One UTF-8 text frame carries one JSON object. The object's variant is
//! identified by the presence of a discriminant key:
//!
//! ```text
//! {"request":true,"id":12,"method":"join","data":{}}
//! {"notification":true,"method":"tick","data":{}}
//! {"response":true,"id":12,"ok":true,"data":{}}
//! {"response":true,"id":12,"ok":false,"errorCode":404,"errorReason":"gone"}
//! ```
//!
//! # Decoding Order
//!
//! [`parse`] checks `request`, then `response` (branching on `ok`), then
//! `notification`. The first key present wins. Text that is not JSON fails
//! with [`Error::Syntax`]; JSON that matches no envelope fails with
//! [`Error::Parse`].
//!
//! # Examples
//!
//! ```rust
//! use relink_core::{codec, Message};
//!
//! let message = Message::notification("tick", None);
//! let text = codec::encode(&message).unwrap();
//! assert_eq!(codec::parse(&text).unwrap(), message);
//! ```

use crate::error::{Error, Result};
use crate::message::{default_data, Message, Notification, Request, RequestId, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize)]
struct RequestFrame {
    request: bool,
    id: RequestId,
    method: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct NotificationFrame {
    notification: bool,
    method: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct SuccessFrame {
    response: bool,
    id: RequestId,
    ok: bool,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFrame {
    response: bool,
    id: RequestId,
    ok: bool,
    error_code: i32,
    error_reason: String,
}

#[derive(Deserialize)]
struct OkProbe {
    ok: bool,
}

/// Encode a message to its wire text
///
/// # Errors
///
/// Returns `Error::Serialization` if the payload cannot be serialized.
pub fn encode(message: &Message) -> Result<String> {
    let text = match message {
        Message::Request(request) => serde_json::to_string(&RequestFrame {
            request: true,
            id: request.id,
            method: request.method.clone(),
            data: Some(request.data.clone()),
        }),
        Message::Notification(notification) => serde_json::to_string(&NotificationFrame {
            notification: true,
            method: notification.method.clone(),
            data: Some(notification.data.clone()),
        }),
        Message::Response(Response::Success { id, data }) => serde_json::to_string(&SuccessFrame {
            response: true,
            id: *id,
            ok: true,
            data: Some(data.clone()),
        }),
        Message::Response(Response::Error {
            id,
            error_code,
            error_reason,
        }) => serde_json::to_string(&ErrorFrame {
            response: true,
            id: *id,
            ok: false,
            error_code: *error_code,
            error_reason: error_reason.clone(),
        }),
    };

    text.map_err(|e| Error::Serialization(e.to_string()))
}

/// Parse wire text into a message
///
/// # Errors
///
/// - `Error::Syntax` if `raw` is not well-formed JSON
/// - `Error::Parse` if the JSON is not an object carrying one of the
///   discriminant keys, or if the discriminated object is malformed
pub fn parse(raw: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(raw).map_err(|e| Error::Syntax(e.to_string()))?;
    parse_value(value)
}

/// Parse an already decoded JSON value into a message
pub fn parse_value(value: Value) -> Result<Message> {
    let object = match value.as_object() {
        Some(object) => object,
        None => return Err(Error::Parse("message is not an object".to_string())),
    };

    if object.contains_key("request") {
        let frame: RequestFrame = from_value(value, "request")?;
        let id = positive_id(frame.id)?;
        return Ok(Message::Request(Request::with_id(id, frame.method, frame.data)));
    }

    if object.contains_key("response") {
        let probe: OkProbe = from_value(value.clone(), "response")?;
        if probe.ok {
            let frame: SuccessFrame = from_value(value, "success response")?;
            return Ok(Message::Response(Response::Success {
                id: positive_id(frame.id)?,
                data: default_data(frame.data),
            }));
        }

        let frame: ErrorFrame = from_value(value, "error response")?;
        return Ok(Message::Response(Response::Error {
            id: positive_id(frame.id)?,
            error_code: frame.error_code,
            error_reason: frame.error_reason,
        }));
    }

    if object.contains_key("notification") {
        let frame: NotificationFrame = from_value(value, "notification")?;
        return Ok(Message::Notification(Notification::new(frame.method, frame.data)));
    }

    Err(Error::Parse("unknown message type".to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value, kind: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Parse(format!("invalid {}: {}", kind, e)))
}

fn positive_id(id: RequestId) -> Result<RequestId> {
    if id == 0 {
        return Err(Error::Parse("id must be a positive integer".to_string()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let data = json!({"room": "lobby", "n": [1, 2, 3]});
        let message = Message::request("join", Some(data.clone()));
        let decoded = parse(&encode(&message).unwrap()).unwrap();

        match decoded {
            Message::Request(request) => {
                assert_eq!(request.method, "join");
                assert_eq!(request.data, data);
                assert_eq!(Some(request.id), message.id());
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_round_trip() {
        let message = Message::notification("tick", Some(json!({"n": 1})));
        assert_eq!(parse(&encode(&message).unwrap()).unwrap(), message);
    }

    #[test]
    fn test_success_and_error_round_trip() {
        let ok = Message::success(5, Some(json!({"v": true})));
        assert_eq!(parse(&encode(&ok).unwrap()).unwrap(), ok);

        let err = Message::error(5, 404, "not found");
        assert_eq!(parse(&encode(&err).unwrap()).unwrap(), err);
    }

    #[test]
    fn test_wire_shape() {
        let text = encode(&Message::error(9, 400, "bad")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["response"], true);
        assert_eq!(value["ok"], false);
        assert_eq!(value["errorCode"], 400);
        assert_eq!(value["errorReason"], "bad");
        assert!(value.get("data").is_none());

        let text = encode(&Message::request("m", None)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["request"], true);
        assert_eq!(value["data"], json!({}));
    }

    #[test]
    fn test_missing_data_defaults_to_object() {
        let parsed = parse(r#"{"notification":true,"method":"tick"}"#).unwrap();
        assert_eq!(parsed, Message::notification("tick", None));

        let parsed = parse(r#"{"response":true,"id":3,"ok":true,"data":null}"#).unwrap();
        assert_eq!(parsed, Message::success(3, Some(json!({}))));
    }

    #[test]
    fn test_unknown_message_type() {
        let err = parse(r#"{"method":"x","id":1}"#).unwrap_err();
        assert_eq!(err, Error::Parse("unknown message type".to_string()));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(parse("[1,2]"), Err(Error::Parse(_))));
        assert!(matches!(parse("42"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(parse("{not json"), Err(Error::Syntax(_))));
        assert!(matches!(parse(""), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_discriminant_order() {
        // request wins over notification when both keys are present
        let parsed = parse(r#"{"request":true,"notification":true,"id":1,"method":"m"}"#).unwrap();
        assert!(parsed.is_request());
    }

    #[test]
    fn test_malformed_envelopes() {
        // missing method
        assert!(matches!(parse(r#"{"request":true,"id":1}"#), Err(Error::Parse(_))));
        // zero id
        assert!(matches!(
            parse(r#"{"request":true,"id":0,"method":"m"}"#),
            Err(Error::Parse(_))
        ));
        // negative id
        assert!(matches!(
            parse(r#"{"response":true,"id":-1,"ok":true}"#),
            Err(Error::Parse(_))
        ));
        // response without ok
        assert!(matches!(parse(r#"{"response":true,"id":1}"#), Err(Error::Parse(_))));
        // error response without code
        assert!(matches!(
            parse(r#"{"response":true,"id":1,"ok":false,"errorReason":"x"}"#),
            Err(Error::Parse(_))
        ));
    }
}
