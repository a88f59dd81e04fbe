//! JSON-RPC message model.
//!
//! Classification rules for inbound JSON:
//! - a method and a non-empty id is a [`Request`]
//! - a method and an empty or absent id is a [`Notification`]
//! - no method, a non-empty id, and a `result` or `error` member is a [`Response`]
//!
//! Numeric ids are accepted and normalized to their decimal string form. The
//! `jsonrpc` member is always written and never required on input.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;

use crate::error::MessageError;
use crate::error_codes::{self, ErrorCategory};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: String,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// Structured error carried in a Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(reason: impl std::fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid params: {reason}"),
        )
    }

    pub fn invalid_request(reason: impl std::fmt::Display) -> Self {
        Self::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid request: {reason}"),
        )
    }

    pub fn parse_error(reason: impl std::fmt::Display) -> Self {
        Self::new(error_codes::PARSE_ERROR, format!("Parse error: {reason}"))
    }

    pub fn internal(reason: impl std::fmt::Display) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, reason.to_string())
    }

    /// Attaches the category/retryable envelope local callers use for programmatic handling.
    pub fn with_category(self, suggestion: Option<String>) -> Self {
        let category = self.category();
        let retryable = error_codes::is_retryable(self.code);
        let mut data = json!({
            "category": category.as_str(),
            "retryable": retryable,
        });
        if let Some(suggestion) = suggestion {
            data["suggestion"] = Value::String(suggestion);
        }
        self.with_data(data)
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code)
    }
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Result(result),
        }
    }

    pub fn error(id: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Error(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Result(_))
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(err) => Err(err),
        }
    }
}

impl Message {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        let wire: WireMessage = serde_json::from_slice(bytes).map_err(MessageError::Json)?;
        Message::try_from(wire)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(notif) => Some(&notif.method),
            Message::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Notification> for Message {
    fn from(value: Notification) -> Self {
        Message::Notification(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}

/// Decodes handler params into `T`, treating absent or null params as an empty object.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(value) => value,
    };
    serde_json::from_value(value).map_err(RpcError::invalid_params)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "deserialize_id")]
    #[serde(skip_serializing_if = "WireId::is_absent")]
    id: WireId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Id as it appears on the wire: absent, explicit `null`, or a string.
#[derive(Debug, Clone, Default, PartialEq)]
enum WireId {
    #[default]
    Absent,
    Null,
    Value(String),
}

impl WireId {
    fn is_absent(&self) -> bool {
        matches!(self, WireId::Absent)
    }

    fn non_empty(self) -> Option<String> {
        match self {
            WireId::Value(id) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
}

impl Serialize for WireId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WireId::Absent | WireId::Null => serializer.serialize_none(),
            WireId::Value(id) => serializer.serialize_str(id),
        }
    }
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<WireId, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(WireId::Null),
        Value::String(id) => Ok(WireId::Value(id)),
        Value::Number(n) => Ok(WireId::Value(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or number, got {other}"
        ))),
    }
}

/// Maps a present-but-null member to `Some(Value::Null)` so `"result": null` still counts.
fn deserialize_present<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<WireMessage> for Message {
    type Error = MessageError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let id = wire.id.non_empty();
        match (wire.method, id) {
            (Some(method), Some(id)) => Ok(Message::Request(Request {
                id,
                method,
                params: wire.params,
            })),
            (Some(method), None) => Ok(Message::Notification(Notification {
                method,
                params: wire.params,
            })),
            (None, Some(id)) => {
                let outcome = match (wire.error, wire.result) {
                    (Some(error), _) => Outcome::Error(error),
                    (None, Some(result)) => Outcome::Result(result),
                    (None, None) => {
                        return Err(MessageError::Shape(format!(
                            "message {id} has neither method nor result/error"
                        )));
                    }
                };
                Ok(Message::Response(Response { id, outcome }))
            }
            (None, None) => Err(MessageError::Shape(
                "message has neither method nor id".to_string(),
            )),
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let mut wire = WireMessage {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: WireId::Absent,
            method: None,
            params: None,
            result: None,
            error: None,
        };
        match message {
            Message::Request(req) => {
                wire.id = WireId::Value(req.id);
                wire.method = Some(req.method);
                wire.params = req.params;
            }
            Message::Notification(notif) => {
                wire.method = Some(notif.method);
                wire.params = notif.params;
            }
            Message::Response(resp) => {
                wire.id = if resp.id.is_empty() {
                    WireId::Null
                } else {
                    WireId::Value(resp.id)
                };
                match resp.outcome {
                    Outcome::Result(value) => wire.result = Some(value),
                    Outcome::Error(err) => wire.error = Some(err),
                }
            }
        }
        wire
    }
}
