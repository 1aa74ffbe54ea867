//! Token Counting
//!
//! Prompt size estimation using the model's BPE, following the chat format
//! overhead (+4 per message, +1 for `name`, +3 priming).

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::types::{CellstreamError, Message, Result, ToolDefinition};

const TOKENS_PER_MESSAGE: usize = 4;
const TOKENS_PER_NAME: usize = 1;
const REPLY_PRIMING_TOKENS: usize = 3;

pub trait TokenEncoder: Send + Sync {
    fn encode_len(&self, text: &str) -> usize;
}

pub struct TiktokenEncoder {
    bpe: CoreBPE,
}

impl TokenEncoder for TiktokenEncoder {
    fn encode_len(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Counts whitespace-separated words. Deterministic stand-in when no BPE is wanted.
pub struct WhitespaceEncoder;

impl TokenEncoder for WhitespaceEncoder {
    fn encode_len(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Context window size, `None` for models we do not know.
pub fn token_limit(model: &str) -> Option<usize> {
    match model {
        "gpt-3.5-turbo"
        | "gpt-3.5-turbo-0125"
        | "gpt-3.5-turbo-1106"
        | "gpt-3.5-turbo-instruct"
        | "gpt-3.5-turbo-0613"
        | "gpt-4-0125-preview"
        | "gpt-4-turbo-preview"
        | "gpt-4-1106-preview"
        | "gpt-4-vision-preview"
        | "gpt-4-1106-vision-preview" => Some(4096),
        "gpt-3.5-turbo-0301" => Some(4097),
        "gpt-4" | "gpt-4-0613" | "gpt-4-0314" => Some(8192),
        "gpt-3.5-turbo-16k" | "gpt-3.5-turbo-16k-0613" => Some(16385),
        "gpt-4-32k" | "gpt-4-32k-0613" | "gpt-4-32k-0314" => Some(32768),
        _ => None,
    }
}

/// Tokenizer lookup name. Never used for the request payload.
pub fn valid_alternative(model: &str) -> &str {
    match model {
        "gpt-3.5-turbo-16k-0613" | "gpt-3.5-turbo-0613" | "gpt-3.5-turbo-16k" => "gpt-3.5-turbo",
        "gpt-4-0613" | "gpt-4-32k-0613" => "gpt-4",
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelProfile {
    pub name: String,
    pub context_window_tokens: Option<usize>,
}

impl ModelProfile {
    pub fn for_model(model: &str) -> Self {
        Self {
            name: model.to_string(),
            context_window_tokens: token_limit(model),
        }
    }
}

/// Tokens left for the reply, or `BudgetExceeded` when nothing is left.
pub fn reply_budget(model: &str, estimated: usize, limit: usize) -> Result<usize> {
    if estimated >= limit {
        return Err(CellstreamError::BudgetExceeded {
            model: model.to_string(),
            estimated,
            limit,
        }
        .into());
    }
    Ok(limit - estimated)
}

#[derive(Clone)]
pub struct TokenAccountant {
    encoder: Arc<dyn TokenEncoder>,
}

impl TokenAccountant {
    pub fn for_model(model: &str) -> Result<Self> {
        let alternative = valid_alternative(model);
        let bpe = tiktoken_rs::get_bpe_from_model(alternative).map_err(|e| {
            tracing::warn!("[TOKENS] No tokenizer for {} ({}): {}", model, alternative, e);
            CellstreamError::UnknownModelTokenizer(model.to_string())
        })?;
        tracing::debug!("[TOKENS] Using tokenizer of {} for {}", alternative, model);
        Ok(Self::with_encoder(TiktokenEncoder { bpe }))
    }

    pub fn with_encoder(encoder: impl TokenEncoder + 'static) -> Self {
        Self {
            encoder: Arc::new(encoder),
        }
    }

    pub fn encode_len(&self, text: &str) -> usize {
        self.encoder.encode_len(text)
    }

    pub fn count_message(&self, message: &Message) -> Result<usize> {
        let mut tokens = TOKENS_PER_MESSAGE;
        let value = serde_json::to_value(message)?;
        if let serde_json::Value::Object(fields) = value {
            for (key, field) in &fields {
                tokens += match field {
                    serde_json::Value::String(s) => self.encoder.encode_len(s),
                    other => self.encoder.encode_len(&other.to_string()),
                };
                if key == "name" {
                    tokens += TOKENS_PER_NAME;
                }
            }
        }
        Ok(tokens)
    }

    pub fn count_tokens(&self, messages: &[Message], tools: &[ToolDefinition]) -> Result<usize> {
        let mut total = 0;
        for message in messages {
            total += self.count_message(message)?;
        }
        for tool in tools {
            total += self.encoder.encode_len(&serde_json::to_string(tool)?);
        }
        Ok(total + REPLY_PRIMING_TOKENS)
    }
}
