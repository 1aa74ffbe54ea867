//! Completion session
//!
//! One operator command: assemble the prompt from the document, keep it within
//! the model's window, stream the reply into new units, run any requested tool
//! calls and resend until the model is done.

use tokio_util::sync::CancellationToken;

use crate::config::{ChatCompletionRequest, DocumentSettings};
use crate::constants::*;
use crate::conversation::{read_session_messages, CompletionType};
use crate::document::Document;
use crate::json_repair::CompletionRepair;
use crate::mitigation::{apply_token_reductions, OverflowContext, StrategyFilter};
use crate::operator::{Notice, Operator};
use crate::provider::ChatBackend;
use crate::segmentation::{DriveOutcome, Segmenter};
use crate::token_counting::{reply_budget, ModelProfile, TokenAccountant};
use crate::tool_calls::finalize_tool_calls;
use crate::tools::ToolRegistry;
use crate::types::*;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub mode: CompletionType,
    pub filter: StrategyFilter,
    /// Automatic resends after a `length` finish. Zero disables.
    pub max_auto_continue: usize,
    pub max_tool_rounds: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: CompletionType::default(),
            filter: StrategyFilter::default(),
            max_auto_continue: 0,
            max_tool_rounds: 8,
        }
    }
}

/// State captured when the command starts; nothing is read from globals later.
pub struct SessionContext<'a, D> {
    pub document: &'a D,
    pub settings: DocumentSettings,
    pub target: usize,
}

impl<'a, D: Document> SessionContext<'a, D> {
    pub async fn capture(document: &'a D, target: usize) -> Result<Self> {
        let count = document.unit_count().await;
        if target >= count {
            return Err(CellstreamError::Configuration(format!(
                "unit {} does not exist (document has {} units)",
                target, count
            ))
            .into());
        }
        Ok(Self {
            document,
            settings: document.settings().await,
            target,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.settings.model = Some(model.into());
        self
    }
}

enum Prepared {
    Request(Box<ChatCompletionRequest>),
    Cancelled,
}

pub struct CompletionEngine<'a, B, O> {
    backend: &'a B,
    operator: &'a O,
    tools: &'a ToolRegistry,
    options: EngineOptions,
}

impl<'a, B: ChatBackend, O: Operator> CompletionEngine<'a, B, O> {
    pub fn new(backend: &'a B, operator: &'a O, tools: &'a ToolRegistry, options: EngineOptions) -> Self {
        Self {
            backend,
            operator,
            tools,
            options,
        }
    }

    /// Runs the session and reports the outcome to the operator.
    pub async fn run<D: Document>(
        &self,
        ctx: &SessionContext<'_, D>,
        cancel: CancellationToken,
    ) -> Result<FinishReason> {
        self.operator.progress(GEN_NEXT_CELL);
        match self.complete(ctx, &cancel).await {
            Ok(reason) => {
                match reason {
                    FinishReason::Cancelled => self.operator.notify(Notice::Info, COMP_CANCELLED),
                    FinishReason::ContentFilter => self.operator.notify(Notice::Error, API_VIOLATION),
                    _ => self.operator.notify(Notice::Info, COMP_COMPLETED),
                }
                Ok(reason)
            }
            Err(e) if e.inner.is_cancellation() => {
                self.operator.notify(Notice::Info, COMP_CANCELLED);
                Ok(FinishReason::Cancelled)
            }
            Err(e) => {
                tracing::error!("[ENGINE] Session failed: {}", e);
                self.operator
                    .notify(Notice::Error, &format!("{}: {}", COMP_FAILED, e.detail()));
                Err(e)
            }
        }
    }

    /// The request loop without operator-facing outcome reporting.
    pub async fn complete<D: Document>(
        &self,
        ctx: &SessionContext<'_, D>,
        cancel: &CancellationToken,
    ) -> Result<FinishReason> {
        let mut segmenter = Segmenter::new(ctx.target);
        let mut continuations = 0;
        let mut tool_rounds = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(FinishReason::Cancelled);
            }

            let request = match self.prepare_request(ctx, &segmenter).await? {
                Prepared::Request(r) => *r,
                Prepared::Cancelled => return Ok(FinishReason::Cancelled),
            };

            self.operator.progress(SENDING_REQUEST);
            let mut rx = self.backend.stream_chat(request, cancel.clone()).await?;
            let outcome = segmenter.drive(&mut rx, ctx.document, self.operator).await?;

            match outcome {
                DriveOutcome::ToolCalls(deltas) => {
                    tool_rounds += 1;
                    if tool_rounds > self.options.max_tool_rounds {
                        tracing::warn!(
                            "[ENGINE] Giving up after {} tool rounds",
                            self.options.max_tool_rounds
                        );
                        return Ok(FinishReason::ToolsCall);
                    }
                    if cancel.is_cancelled() {
                        tracing::info!("[ENGINE] Cancelled before running {} tool call(s)", deltas.len());
                        return Ok(FinishReason::Cancelled);
                    }
                    if !self.run_tool_calls(ctx, &segmenter, deltas).await? {
                        return Ok(FinishReason::Cancelled);
                    }
                }
                DriveOutcome::Finished(FinishReason::Length)
                    if continuations < self.options.max_auto_continue =>
                {
                    continuations += 1;
                    tracing::info!(
                        "[ENGINE] Reply truncated, continuing ({}/{})",
                        continuations,
                        self.options.max_auto_continue
                    );
                }
                DriveOutcome::Finished(FinishReason::ToolsCall) => {
                    // Finish signal without any deltas: nothing to run.
                    self.operator.notify(Notice::Info, TOOL_CALLS_REQUESTED);
                    return Ok(FinishReason::ToolsCall);
                }
                DriveOutcome::Finished(reason) => {
                    tracing::info!("[ENGINE] Finished with {}", reason);
                    return Ok(reason);
                }
            }
        }
    }

    async fn prepare_request<D: Document>(
        &self,
        ctx: &SessionContext<'_, D>,
        segmenter: &Segmenter,
    ) -> Result<Prepared> {
        let model = ctx.settings.model()?;
        let tools = self.tools.definitions();
        let mut messages = read_session_messages(
            ctx.document,
            ctx.target,
            segmenter.current_index(),
            self.options.mode,
        )
        .await?;

        self.operator.progress(CALCULATING_TOKENS);
        let profile = ModelProfile::for_model(model);
        let mut max_tokens = None;

        match TokenAccountant::for_model(model) {
            Ok(accountant) => {
                if let Some(limit) = profile.context_window_tokens {
                    let estimated = accountant.count_tokens(&messages, &tools)?;
                    tracing::info!("[TOKENS] Prompt {} / window {}", estimated, limit);

                    if estimated > limit {
                        self.operator.progress(CALCULATING_REDUCTIONS);
                        let reduced = apply_token_reductions(
                            OverflowContext {
                                messages: &messages,
                                tools: &tools,
                                overflow: estimated - limit,
                                limit,
                            },
                            &accountant,
                            self.operator,
                            self.options.filter,
                        )
                        .await?;
                        match reduced {
                            Some(r) => messages = r,
                            None => return Ok(Prepared::Cancelled),
                        }
                    }

                    let estimated = accountant.count_tokens(&messages, &tools)?;
                    match reply_budget(model, estimated, limit) {
                        Ok(budget) => max_tokens = u32::try_from(budget).ok(),
                        Err(e) => {
                            tracing::warn!("[TOKENS] {}", e.inner);
                            if !self.operator.confirm_over_budget(estimated, limit).await {
                                return Ok(Prepared::Cancelled);
                            }
                            // Operator insists: send without a max_tokens cap.
                        }
                    }
                } else {
                    tracing::warn!("[TOKENS] No known context window for {}, skipping token limit checks", model);
                    self.operator.notify(Notice::Warning, CONTEXT_WINDOW_UNKNOWN);
                }
            }
            Err(e) => {
                tracing::warn!("[TOKENS] Skipping token limit checks: {}", e.inner);
                self.operator.notify(Notice::Warning, TOKENIZER_UNAVAILABLE);
            }
        }

        if profile.context_window_tokens.is_none() {
            max_tokens = ctx.settings.request.max_tokens();
        }

        let mut request = ChatCompletionRequest::new(model, messages).with_tools(tools);
        request.temperature = Some(0.0);
        request.max_tokens = max_tokens;
        ctx.settings.request.apply_to(&mut request);

        tracing::debug!(
            "[ENGINE] Request: model={} messages={} max_tokens={:?}",
            request.model,
            request.messages.len(),
            request.max_tokens
        );
        Ok(Prepared::Request(Box::new(request)))
    }

    /// Returns `false` when the operator dismissed the approval prompt.
    async fn run_tool_calls<D: Document>(
        &self,
        ctx: &SessionContext<'_, D>,
        segmenter: &Segmenter,
        deltas: Vec<ToolCallDelta>,
    ) -> Result<bool> {
        let repair = CompletionRepair::new(self.backend);
        let calls = finalize_tool_calls(deltas, &repair).await?;
        if calls.is_empty() {
            return Ok(true);
        }

        let picked = match self.operator.pick_tool_calls(&calls).await {
            Some(p) => p,
            None => return Ok(false),
        };

        let mut results = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            if picked.contains(&i) {
                tracing::info!("[ENGINE] Executing tool {} ({})", call.function.name, call.id);
                results.push(self.tools.execute(call).await);
            } else {
                tracing::info!("[ENGINE] Tool {} declined", call.function.name);
                results.push(ToolRegistry::declined(call));
            }
        }

        ctx.document
            .attach_tool_results(segmenter.current_index(), results)
            .await?;
        Ok(true)
    }
}
