use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::constants;

#[derive(Error, Debug)]
pub enum CellstreamError {
    #[error("Generation cancelled")]
    Cancelled,

    #[error("Connection reset by provider: {0}")]
    ConnectionReset(String),

    #[error("Prompt needs {estimated} tokens but {model} accepts {limit}")]
    BudgetExceeded {
        model: String,
        estimated: usize,
        limit: usize,
    },

    #[error("Selected reductions leave the prompt {remaining_overflow} tokens over the limit of {limit}")]
    InsufficientReduction {
        remaining_overflow: usize,
        limit: usize,
    },

    #[error("Tool call {index} arguments are not valid JSON: {source}")]
    UnparseableToolArguments {
        index: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unhandled finish_reason: {0}")]
    UnhandledFinishReason(String),

    #[error("Provider error (status {status}): {message}")]
    ProviderHttp {
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("No tokenizer available for model {0}")]
    UnknownModelTokenizer(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl CellstreamError {
    /// User-facing remediation for the error class, if there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CellstreamError::ConnectionReset(_) => Some(constants::HINT_CONNECTION_RESET),
            CellstreamError::ProviderHttp { status, .. } => match status.as_u16() {
                400 => Some(constants::HINT_MAX_TOKEN_LIMIT),
                401 => Some(constants::HINT_API_KEY_ORG),
                404 => Some(constants::HINT_ENDPOINT_MODEL),
                429 => Some(constants::HINT_RATE_LIMIT),
                500 => Some(constants::HINT_SERVER_ERROR),
                _ => None,
            },
            CellstreamError::InsufficientReduction { .. } => Some(constants::NOT_ENOUGH_SAVINGS),
            CellstreamError::UnhandledFinishReason(_) => Some(constants::UNHANDLED_FINISH_REASON),
            _ => None,
        }
    }

    /// Operator gave up; not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CellstreamError::Cancelled)
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: CellstreamError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    /// Detail string for the single modal failure: hint first, raw message after.
    pub fn detail(&self) -> String {
        match self.inner.hint() {
            Some(hint) => format!("{} {}", hint, self.inner),
            None => self.inner.to_string(),
        }
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<CellstreamError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// --- MESSAGES (what is sent on every request) ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn assistant_tool_call(call: ToolCallRequest) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            name: Some(call.function.name.clone()),
            tool_calls: Some(vec![call]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn content_str(&self) -> &str {
        match self.content.as_deref() {
            Some(c) => c,
            None => "",
        }
    }

    pub fn contains(&self, marker: &str) -> bool {
        match &self.content {
            Some(c) => c.contains(marker),
            None => false,
        }
    }
}

/// --- TOOL CALLS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRequest {
    #[serde(default, skip_serializing)]
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCallRequest {
    pub fn synthetic_id() -> String {
        format!("call_{}", Uuid::new_v4().simple())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Partial tool call as it arrives on the wire. `index` is the merge key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "output", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    Executed(String),
    Declined,
}

impl ToolCallOutcome {
    /// Text fed back to the model in the `tool` message.
    pub fn as_message_content(&self) -> &str {
        match self {
            ToolCallOutcome::Executed(output) => output,
            ToolCallOutcome::Declined => constants::TOOL_CALL_DECLINED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallResult {
    pub call: ToolCallRequest,
    pub outcome: ToolCallOutcome,
}

/// --- STREAMING HUB ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolsCall,
    Cancelled,
    Null,
}

impl FinishReason {
    /// Maps `choices[0].finish_reason`. `Ok(None)` means the turn is still in progress.
    pub fn from_provider(reason: Option<&str>) -> std::result::Result<Option<Self>, CellstreamError> {
        match reason {
            None => Ok(None),
            Some("stop") => Ok(Some(FinishReason::Stop)),
            Some("length") => Ok(Some(FinishReason::Length)),
            Some("content_filter") => Ok(Some(FinishReason::ContentFilter)),
            Some("tool_calls") | Some("function_call") => Ok(Some(FinishReason::ToolsCall)),
            Some(other) => Err(CellstreamError::UnhandledFinishReason(other.to_string())),
        }
    }

    /// Whether the provider stream is over after this signal.
    pub fn ends_stream(&self) -> bool {
        !matches!(self, FinishReason::ToolsCall | FinishReason::Null)
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolsCall => "tools_call",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Null => "null",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUnit {
    TextFragment(String),
    ToolCallDeltaBatch(Vec<ToolCallDelta>),
    FinishSignal(FinishReason),
}

/// --- PROVIDER WIRE TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct PulseDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct ProviderPulseChoice {
    #[serde(default)]
    pub delta: PulseDelta,
    pub finish_reason: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone, Default)]
pub struct ProviderPulse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ProviderPulseChoice>,
    pub usage: Option<Usage>,
}

impl ProviderPulse {
    pub fn text(content: &str) -> Self {
        Self::with_choice(ProviderPulseChoice {
            delta: PulseDelta {
                content: Some(content.to_string()),
                ..Default::default()
            },
            finish_reason: None,
        })
    }

    pub fn tool_calls(deltas: Vec<ToolCallDelta>) -> Self {
        Self::with_choice(ProviderPulseChoice {
            delta: PulseDelta {
                tool_calls: Some(deltas),
                ..Default::default()
            },
            finish_reason: None,
        })
    }

    pub fn finish(reason: &str) -> Self {
        Self::with_choice(ProviderPulseChoice {
            delta: PulseDelta::default(),
            finish_reason: Some(reason.to_string()),
        })
    }

    fn with_choice(choice: ProviderPulseChoice) -> Self {
        Self {
            choices: vec![choice],
            ..Default::default()
        }
    }
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum LineEvent {
    Pulse(ProviderPulse),
    Error(ProviderError),
    Unknown(String),
}

pub fn parse_provider_line(data: &str) -> LineEvent {
    if data.len() > 10 * 1024 * 1024 {
        return LineEvent::Error(ProviderError {
            error: ProviderErrorDetails {
                message: format!("JSON chunk too large: {} bytes", data.len()),
                error_type: None,
                code: None,
            },
        });
    }
    // Error first: it is the more specific shape (requires "error").
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(pulse) = serde_json::from_str::<ProviderPulse>(data) {
        if !pulse.choices.is_empty() || pulse.usage.is_some() {
            return LineEvent::Pulse(pulse);
        }
    }
    tracing::debug!(
        "[STREAM] Unknown line format: {}",
        crate::str_utils::first_n_chars_lossy(data, 200)
    );
    LineEvent::Unknown(data.to_string())
}

#[cfg(test)]
mod parsing_tests {
    use super::*;

    #[test]
    fn test_parse_provider_pulse_full() {
        let json = r#"{"id":"123","model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        match parse_provider_line(json) {
            LineEvent::Pulse(p) => {
                assert_eq!(p.id, "123");
                assert_eq!(p.choices[0].delta.content.as_deref(), Some("Hello"));
            }
            other => panic!("Expected Pulse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_call_delta() {
        let json = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"readFile","arguments":""}}]},"finish_reason":null}]}"#;
        match parse_provider_line(json) {
            LineEvent::Pulse(p) => {
                let deltas = p.choices[0].delta.tool_calls.clone().unwrap_or_default();
                assert_eq!(deltas.len(), 1);
                assert_eq!(deltas[0].id.as_deref(), Some("call_1"));
                assert_eq!(deltas[0].call_type.as_deref(), Some("function"));
            }
            other => panic!("Expected Pulse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_provider_error() {
        let json = r#"{"error":{"message":"Rate limit reached","type":"requests","code":null}}"#;
        match parse_provider_line(json) {
            LineEvent::Error(e) => assert!(e.error.message.contains("Rate limit")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider(None).ok(), Some(None));
        assert_eq!(
            FinishReason::from_provider(Some("function_call")).ok(),
            Some(Some(FinishReason::ToolsCall))
        );
        assert!(matches!(
            FinishReason::from_provider(Some("eos")),
            Err(CellstreamError::UnhandledFinishReason(r)) if r == "eos"
        ));
    }

    #[test]
    fn test_message_serialization_skips_absent_fields() {
        let msg = Message::user("hi");
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["role"], "user");
    }

    #[test]
    fn test_provider_http_hints() {
        let err = CellstreamError::ProviderHttp {
            status: reqwest::StatusCode::TOO_MANY_REQUESTS,
            message: "slow down".into(),
        };
        assert_eq!(err.hint(), Some(constants::HINT_RATE_LIMIT));
        let observed: ObservedError = err.into();
        assert!(observed.detail().contains("slow down"));
        assert!(observed.detail().starts_with(constants::HINT_RATE_LIMIT));
    }
}
