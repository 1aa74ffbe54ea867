//! Request configuration
//!
//! Per-document settings are a typed struct rather than an open map, so each
//! setting reaches exactly one request field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::API_KEY_ENV;
use crate::types::{CellstreamError, Message, Result, ToolDefinition};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<BTreeMap<String, f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            temperature: None,
            top_p: None,
            n: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            logit_bias: None,
            user: None,
            tools: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = if tools.is_empty() { None } else { Some(tools) };
        self
    }
}

/// Sampling parameters persisted per document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logit_bias: Option<BTreeMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(CellstreamError::Configuration(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        ))
        .into())
    }
}

impl RequestSettings {
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    pub fn n(&self) -> Option<u32> {
        self.n
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn presence_penalty(&self) -> Option<f32> {
        self.presence_penalty
    }

    pub fn frequency_penalty(&self) -> Option<f32> {
        self.frequency_penalty
    }

    pub fn logit_bias(&self) -> Option<&BTreeMap<String, f32>> {
        self.logit_bias.as_ref()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn set_temperature(&mut self, value: f32) -> Result<()> {
        check_range("temperature", value, 0.0, 2.0)?;
        self.temperature = Some(value);
        Ok(())
    }

    pub fn set_top_p(&mut self, value: f32) -> Result<()> {
        check_range("top_p", value, 0.0, 1.0)?;
        self.top_p = Some(value);
        Ok(())
    }

    pub fn set_n(&mut self, value: u32) -> Result<()> {
        if value == 0 {
            return Err(CellstreamError::Configuration("n must be at least 1".into()).into());
        }
        self.n = Some(value);
        Ok(())
    }

    pub fn set_max_tokens(&mut self, value: u32) -> Result<()> {
        if value == 0 {
            return Err(CellstreamError::Configuration("max_tokens must be positive".into()).into());
        }
        self.max_tokens = Some(value);
        Ok(())
    }

    pub fn set_presence_penalty(&mut self, value: f32) -> Result<()> {
        check_range("presence_penalty", value, -2.0, 2.0)?;
        self.presence_penalty = Some(value);
        Ok(())
    }

    pub fn set_frequency_penalty(&mut self, value: f32) -> Result<()> {
        check_range("frequency_penalty", value, -2.0, 2.0)?;
        self.frequency_penalty = Some(value);
        Ok(())
    }

    /// Accepts the JSON object form the operator types in.
    pub fn set_logit_bias_json(&mut self, raw: &str) -> Result<()> {
        let parsed: BTreeMap<String, f32> = serde_json::from_str(raw).map_err(|e| {
            CellstreamError::Configuration(format!("Logit Bias must be a valid JSON object: {}", e))
        })?;
        self.logit_bias = Some(parsed);
        Ok(())
    }

    pub fn set_user(&mut self, value: impl Into<String>) {
        self.user = Some(value.into());
    }

    /// Copies every configured parameter onto the request, field by field.
    pub fn apply_to(&self, request: &mut ChatCompletionRequest) {
        if let Some(v) = self.temperature() {
            request.temperature = Some(v);
        }
        if let Some(v) = self.top_p() {
            request.top_p = Some(v);
        }
        if let Some(v) = self.n() {
            request.n = Some(v);
        }
        if let Some(v) = self.presence_penalty() {
            request.presence_penalty = Some(v);
        }
        if let Some(v) = self.frequency_penalty() {
            request.frequency_penalty = Some(v);
        }
        if let Some(v) = self.logit_bias() {
            request.logit_bias = Some(v.clone());
        }
        if let Some(v) = self.user() {
            request.user = Some(v.to_string());
        }
    }
}

/// Settings stored alongside the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub request: RequestSettings,
}

impl DocumentSettings {
    pub fn model(&self) -> Result<&str> {
        match self.model.as_deref() {
            Some(m) if !m.trim().is_empty() => Ok(m),
            _ => Err(CellstreamError::Configuration(
                "You must choose a valid model before proceeding.".into(),
            )
            .into()),
        }
    }
}

/// The single global credential: explicit value first, then the environment.
pub fn resolve_api_key(explicit: Option<&str>) -> Result<String> {
    if let Some(key) = explicit {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(CellstreamError::Configuration(format!(
            "API key is not set (pass --api-key or set {})",
            API_KEY_ENV
        ))
        .into()),
    }
}
