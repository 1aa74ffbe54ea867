//! Chat-completion backend
//!
//! One OpenAI-compatible endpoint. Streaming requests go through the
//! normalizer; non-streaming requests (JSON repair) return the first choice's
//! message content.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ChatCompletionRequest;
use crate::constants::{CHAT_COMPLETIONS_PATH, OPENAI_BASE_URL};
use crate::logging::redact;
use crate::streaming::{is_connection_reset, response_events, StreamNormalizer};
use crate::types::*;

pub trait ChatBackend: Send + Sync {
    /// Dispatches a streaming request and returns the ordered unit channel.
    fn stream_chat(
        &self,
        request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<Result<StreamUnit>>>> + Send;

    /// Non-streaming request; returns `choices[0].message.content`.
    fn complete_chat(
        &self,
        request: ChatCompletionRequest,
    ) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            request_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, options: &ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)));
        // Streams stay open as long as the model writes; no overall timeout by default.
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                options.base_url.trim_end_matches('/'),
                CHAT_COMPLETIONS_PATH
            ),
            api_key: api_key.into(),
        })
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        tracing::debug!(
            "[PROVIDER] POST {} model={} messages={} stream={}",
            self.endpoint,
            request.model,
            request.messages.len(),
            request.stream
        );
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = match response.text().await {
            Ok(t) => t,
            Err(_) => "Unknown error (failed to read response text)".to_string(),
        };
        Err(http_error(status, &body).into())
    }
}

/// Maps a non-2xx response body to a typed error, preferring the provider's message.
pub fn http_error(status: reqwest::StatusCode, body: &str) -> CellstreamError {
    let message = match serde_json::from_str::<ProviderError>(body) {
        Ok(err) => err.error.message,
        Err(_) => crate::str_utils::first_n_chars_lossy(body, 500).into_owned(),
    };
    // Some providers echo the submitted key back in auth failures.
    let message = redact(&message);
    tracing::error!("[PROVIDER] HTTP {}: {}", status, message);
    CellstreamError::ProviderHttp { status, message }
}

pub fn classify_transport_error(e: reqwest::Error) -> ObservedError {
    if is_connection_reset(&e) {
        CellstreamError::ConnectionReset(e.to_string()).into()
    } else {
        CellstreamError::Network(e).into()
    }
}

impl ChatBackend for OpenAiBackend {
    async fn stream_chat(
        &self,
        mut request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<StreamUnit>>> {
        request.stream = true;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CellstreamError::Cancelled.into()),
            r = self.send(&request) => r?,
        };
        Ok(StreamNormalizer::spawn(response_events(response), cancel))
    }

    async fn complete_chat(&self, mut request: ChatCompletionRequest) -> Result<String> {
        request.stream = false;
        let response = self.send(&request).await?;
        let parsed: CompletionResponse = response.json().await.map_err(classify_transport_error)?;
        match parsed.choices.into_iter().next().and_then(|c| c.message.content) {
            Some(content) => Ok(content),
            None => Err(CellstreamError::Protocol("completion returned no content".into()).into()),
        }
    }
}
