// Server -> client envelope and client -> server request parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::command::ClientCommand;

pub const CODE_OK: i32 = 0;
pub const CODE_DUPLICATE: i32 = 409;
pub const CODE_RATE_LIMITED: i32 = 429;
pub const CODE_MALFORMED: i32 = 500;

/// Longest `requestId` the gateway will key idempotency records by.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Every frame the gateway sends on the command socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
    pub trace_id: String,
    /// Epoch milliseconds.
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerEnvelope {
    pub fn ok(
        message: impl Into<String>,
        data: Option<Value>,
        trace_id: impl Into<String>,
        ts: i64,
    ) -> Self {
        Self {
            code: CODE_OK,
            message: message.into(),
            data,
            trace_id: trace_id.into(),
            ts,
            request_id: None,
        }
    }

    pub fn error(code: i32, message: impl Into<String>, trace_id: impl Into<String>, ts: i64) -> Self {
        Self { code, message: message.into(), data: None, trace_id: trace_id.into(), ts, request_id: None }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }
}

/// A parsed client request: `{requestId, type, ...fields}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub request_id: String,
    pub command: ClientCommand,
}

#[derive(Debug, Error, PartialEq)]
pub enum ClientEnvelopeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("requestId is missing or empty")]
    MissingRequestId,
    #[error("requestId exceeds {MAX_REQUEST_ID_LEN} characters")]
    RequestIdTooLong,
    #[error("unrecognized command: {reason}")]
    InvalidCommand { request_id: String, reason: String },
}

impl ClientEnvelopeError {
    /// The request id to echo back, when one could be recovered.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::InvalidCommand { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

impl ClientEnvelope {
    pub fn parse(raw: &str) -> Result<Self, ClientEnvelopeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|error| ClientEnvelopeError::InvalidJson(error.to_string()))?;
        let Value::Object(ref fields) = value else {
            return Err(ClientEnvelopeError::NotAnObject);
        };

        let request_id = match fields.get("requestId") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(ClientEnvelopeError::MissingRequestId),
        };
        if request_id.chars().count() > MAX_REQUEST_ID_LEN {
            return Err(ClientEnvelopeError::RequestIdTooLong);
        }

        let command = serde_json::from_value::<ClientCommand>(value).map_err(|error| {
            ClientEnvelopeError::InvalidCommand {
                request_id: request_id.clone(),
                reason: error.to_string(),
            }
        })?;

        Ok(Self { request_id, command })
    }
}
