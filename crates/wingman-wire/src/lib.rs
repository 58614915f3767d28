//! Request/response bodies spoken between the host and the sidecar, plus the
//! event union that streaming consumers receive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of every meaningful line in a `text/event-stream` body.
pub const EVENT_LINE_PREFIX: &str = "data:";
/// Payload that logically terminates a prompt stream.
pub const DONE_SENTINEL: &str = "[DONE]";

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTokenResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthStartRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthStartResponse {
    pub ok: bool,
    #[serde(rename = "deviceCode")]
    pub device_code: String,
    #[serde(rename = "userCode")]
    pub user_code: String,
    #[serde(rename = "verificationURI", alias = "verificationUri")]
    pub verification_uri: String,
    #[serde(
        rename = "verificationURIComplete",
        alias = "verificationUriComplete",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub verification_uri_complete: Option<String>,
    /// Suggested poll interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthPollRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "deviceCode")]
    pub device_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthPollResponse {
    pub ok: bool,
    /// `pending`, `slow_down`, `complete`, `expired`, ... as reported by the sidecar.
    pub status: String,
    #[serde(rename = "accessToken", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
}

impl DeviceAuthPollResponse {
    pub fn is_complete(&self) -> bool {
        self.access_token.is_some() || self.status.eq_ignore_ascii_case("complete")
    }
}

// ============================================================================
// Prompt
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(rename = "chatID")]
    pub chat_id: String,
    #[serde(rename = "projectPath")]
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "allowedTools", default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Opaque to the host; forwarded verbatim to the worker.
    #[serde(
        rename = "executionContext",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_context: Option<Value>,
}

impl PromptRequest {
    pub fn new(
        prompt: impl Into<String>,
        chat_id: impl Into<String>,
        project_path: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            chat_id: chat_id.into(),
            project_path: project_path.into(),
            model: None,
            allowed_tools: None,
            execution_context: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Body of every non-2xx response the sidecar produces on purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub ok: bool,
    pub error: String,
}

// ============================================================================
// Streaming
// ============================================================================

/// A field that historical sidecar versions sent either as a plain string or
/// as arbitrary JSON. Normalised to display text before anyone renders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flexible {
    Text(String),
    Structured(Value),
}

impl Flexible {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(text) => Some(Flexible::Text(text.clone())),
            other => Some(Flexible::Structured(other.clone())),
        }
    }

    /// Display rendering. Empty strings and empty containers render as `None`.
    pub fn render(&self) -> Option<String> {
        match self {
            Flexible::Text(text) if text.is_empty() => None,
            Flexible::Text(text) => Some(text.clone()),
            Flexible::Structured(Value::Object(map)) if map.is_empty() => None,
            Flexible::Structured(Value::Array(items)) if items.is_empty() => None,
            Flexible::Structured(value) => {
                serde_json::to_string_pretty(value).ok()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// One discrete unit extracted from a prompt stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta(String),
    Status(String),
    ToolExecution(ToolExecution),
    /// Error reported by the worker inside the stream. Not terminal.
    Error(String),
    Completed,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed)
    }
}
