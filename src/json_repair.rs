//! JSON Repair Fallback
//!
//! Tool-call arguments that do not concatenate into valid JSON get one more
//! chance: a small auxiliary completion asks the model to rewrite the text as
//! JSON. Nothing here guesses at structure locally.

use std::future::Future;

use crate::config::ChatCompletionRequest;
use crate::constants::{
    JSON_REPAIR_EXAMPLE_INPUT, JSON_REPAIR_EXAMPLE_OUTPUT, JSON_REPAIR_MODEL, JSON_REPAIR_SYSTEM,
};
use crate::provider::ChatBackend;
use crate::types::{CellstreamError, Message, Result};

/// Rewrites arbitrary text into (hopefully) valid JSON text.
pub trait JsonRepair: Sync {
    fn repair(&self, broken: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Fallback that always declines; used where no backend is available.
pub struct NoRepair;

impl JsonRepair for NoRepair {
    async fn repair(&self, _broken: &str) -> Result<String> {
        Err(CellstreamError::Protocol("no JSON repair backend configured".to_string()).into())
    }
}

/// Repairs through a non-streaming completion against the same provider.
pub struct CompletionRepair<'a, B> {
    backend: &'a B,
    model: String,
}

impl<'a, B: ChatBackend> CompletionRepair<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self {
            backend,
            model: JSON_REPAIR_MODEL.to_string(),
        }
    }
}

impl<'a, B: ChatBackend> JsonRepair for CompletionRepair<'a, B> {
    async fn repair(&self, broken: &str) -> Result<String> {
        tracing::info!(
            "[REPAIR] Asking {} to rewrite {} chars into JSON",
            self.model,
            broken.len()
        );
        self.backend
            .complete_chat(repair_request(&self.model, broken))
            .await
    }
}

/// Few-shot request: one worked example, then the broken text.
pub fn repair_request(model: &str, broken: &str) -> ChatCompletionRequest {
    let messages = vec![
        Message::system(JSON_REPAIR_SYSTEM),
        Message::user(JSON_REPAIR_EXAMPLE_INPUT),
        Message::assistant(JSON_REPAIR_EXAMPLE_OUTPUT),
        Message::user(broken),
    ];
    let mut request = ChatCompletionRequest::new(model, messages);
    request.temperature = Some(0.0);
    request.stream = false;
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_request_is_few_shot() {
        let req = repair_request("gpt-4", "{include:*.md}");
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[2].content_str(), JSON_REPAIR_EXAMPLE_OUTPUT);
        assert_eq!(req.messages[3].content_str(), "{include:*.md}");
        assert_eq!(req.temperature, Some(0.0));
        assert!(!req.stream);
    }
}
