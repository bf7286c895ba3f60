use std::future::Future;
use std::time::Duration;

use axum::{
    http::{header, header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tandem_common::protocol::envelope::{
    ServerEnvelope, CODE_DUPLICATE, CODE_MALFORMED, CODE_RATE_LIMITED,
};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static TRACE_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthInvalidToken,
    AdmissionThrottled,
    AdmissionTimeout,
    MessageThrottled,
    DuplicateRequest,
    MalformedPayload,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AdmissionThrottled => "ADMISSION_THROTTLED",
            Self::AdmissionTimeout => "ADMISSION_TIMEOUT",
            Self::MessageThrottled => "MESSAGE_THROTTLED",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AdmissionThrottled | Self::MessageThrottled => StatusCode::TOO_MANY_REQUESTS,
            Self::AdmissionTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::DuplicateRequest => StatusCode::CONFLICT,
            Self::MalformedPayload => StatusCode::BAD_REQUEST,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code carried in a server envelope after the upgrade.
    pub const fn envelope_code(self) -> i32 {
        match self {
            Self::DuplicateRequest => CODE_DUPLICATE,
            Self::MessageThrottled | Self::AdmissionThrottled => CODE_RATE_LIMITED,
            Self::AuthInvalidToken => 401,
            Self::MalformedPayload | Self::AdmissionTimeout | Self::InternalError => CODE_MALFORMED,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::AdmissionThrottled
                | Self::AdmissionTimeout
                | Self::MessageThrottled
                | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AdmissionThrottled => "too many connection attempts",
            Self::AdmissionTimeout => "admission did not complete in time",
            Self::MessageThrottled => "message rate limit exceeded",
            Self::DuplicateRequest => "duplicate",
            Self::MalformedPayload => "malformed payload",
            Self::InternalError => "internal server error",
        }
    }
}

/// A client-facing failure. Before the socket upgrade it renders as an HTTP
/// JSON error; afterwards as a [`ServerEnvelope`].
#[derive(Debug, Clone)]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
    details: Value,
    retry_after: Option<Duration>,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), retry_after: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn to_envelope(&self, ts: i64) -> ServerEnvelope {
        let mut envelope = ServerEnvelope::error(
            self.code.envelope_code(),
            self.message.clone(),
            current_trace_id().unwrap_or_default(),
            ts,
        );
        let mut data = serde_json::Map::new();
        if let Some(retry_after) = self.retry_after {
            data.insert("retryAfterMs".into(), json!(retry_after.as_millis() as u64));
        }
        if let Value::Object(details) = &self.details {
            data.extend(details.clone());
        }
        if !data.is_empty() {
            envelope = envelope.with_data(Value::Object(data));
        }
        envelope
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let trace_id = current_trace_id();

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "trace_id": trace_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(retry_after) = self.retry_after {
            // Whole seconds, rounded up so clients never retry early.
            let seconds = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let Some(trace_id) = trace_id {
            attach_trace_id_header(&mut response, &trace_id);
        }

        response
    }
}

pub async fn with_trace_id_scope<F>(trace_id: String, future: F) -> F::Output
where
    F: Future,
{
    TRACE_ID.scope(trace_id, future).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}

pub fn trace_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID_HEADER)
        .or_else(|| headers.get(REQUEST_ID_HEADER))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_trace_id_header(response: &mut Response, trace_id: &str) {
    if let Ok(header) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, header);
    }
}
