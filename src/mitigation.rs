//! Token overflow mitigation
//!
//! When the assembled prompt does not fit the model's window, a fixed list of
//! reversible reductions is offered to the operator together with how many
//! tokens each would save. The chosen ones are applied in list order, each on
//! the already-reduced messages.

use crate::constants::{
    CODE_CELL_MARKER, CODE_CELL_OUTPUT_MARKER, CODE_CELL_PROBLEMS_MARKER, NOT_ENOUGH_SAVINGS,
    REMOVE_CODE_CELLS, REMOVE_OUTPUT, REMOVE_PROBLEMS, REMOVE_SYSTEM_MSG, TABIFY_WHITESPACE,
};
use crate::operator::{Choice, Notice, Operator};
use crate::token_counting::TokenAccountant;
use crate::types::{CellstreamError, Message, Result, Role, ToolDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    RemoveOutput,
    RemoveProblems,
    RemoveCodeCells,
    RemoveSystemMessage,
    Tabify,
}

impl StrategyKind {
    /// Application order.
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::RemoveOutput,
        StrategyKind::RemoveProblems,
        StrategyKind::RemoveCodeCells,
        StrategyKind::RemoveSystemMessage,
        StrategyKind::Tabify,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::RemoveOutput => REMOVE_OUTPUT,
            StrategyKind::RemoveProblems => REMOVE_PROBLEMS,
            StrategyKind::RemoveCodeCells => REMOVE_CODE_CELLS,
            StrategyKind::RemoveSystemMessage => REMOVE_SYSTEM_MSG,
            StrategyKind::Tabify => TABIFY_WHITESPACE,
        }
    }

    /// Pure: returns a new array, the input is untouched.
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        match self {
            StrategyKind::RemoveOutput => drop_marked(messages, CODE_CELL_OUTPUT_MARKER),
            StrategyKind::RemoveProblems => drop_marked(messages, CODE_CELL_PROBLEMS_MARKER),
            StrategyKind::RemoveCodeCells => drop_marked(messages, CODE_CELL_MARKER),
            StrategyKind::RemoveSystemMessage => messages
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned()
                .collect(),
            StrategyKind::Tabify => messages
                .iter()
                .map(|m| {
                    let mut m = m.clone();
                    if let Some(content) = &m.content {
                        m.content = Some(content.replace("    ", "\t"));
                    }
                    m
                })
                .collect(),
        }
    }
}

// Tool-call messages have no content and always survive.
fn drop_marked(messages: &[Message], marker: &str) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.content.is_none() || !m.contains(marker))
        .cloned()
        .collect()
}

#[derive(Debug, Clone)]
pub struct TokenReductionStrategy {
    pub kind: StrategyKind,
    pub label: &'static str,
    estimated_savings: Option<i64>,
}

impl TokenReductionStrategy {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            label: kind.label(),
            estimated_savings: None,
        }
    }

    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        self.kind.apply(messages)
    }

    /// Savings against `baseline` tokens, computed on a scratch copy once.
    pub fn savings(
        &mut self,
        messages: &[Message],
        tools: &[ToolDefinition],
        baseline: usize,
        accountant: &TokenAccountant,
    ) -> Result<i64> {
        if let Some(saved) = self.estimated_savings {
            return Ok(saved);
        }
        let reduced = self.apply(messages);
        let after = accountant.count_tokens(&reduced, tools)?;
        let saved = baseline as i64 - after as i64;
        self.estimated_savings = Some(saved);
        Ok(saved)
    }

    pub fn estimated_savings(&self) -> Option<i64> {
        self.estimated_savings
    }
}

pub fn default_strategies() -> Vec<TokenReductionStrategy> {
    StrategyKind::ALL
        .iter()
        .map(|k| TokenReductionStrategy::new(*k))
        .collect()
}

/// Which strategies reach the picker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyFilter {
    #[default]
    ShowAll,
    /// Hide strategies saving at most one token.
    HideUnprofitable,
}

impl StrategyFilter {
    fn admits(&self, savings: i64) -> bool {
        match self {
            StrategyFilter::ShowAll => true,
            StrategyFilter::HideUnprofitable => savings > 1,
        }
    }
}

/// Everything the mitigation pass needs to know about the prompt.
pub struct OverflowContext<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
    pub overflow: usize,
    pub limit: usize,
}

/// `Ok(None)` means the operator cancelled (empty or dismissed selection).
pub async fn apply_token_reductions<O: Operator>(
    ctx: OverflowContext<'_>,
    accountant: &TokenAccountant,
    operator: &O,
    filter: StrategyFilter,
) -> Result<Option<Vec<Message>>> {
    let baseline = accountant.count_tokens(ctx.messages, ctx.tools)?;
    tracing::info!(
        "[MITIGATION] Prompt has {} tokens, {} over the limit of {}",
        baseline,
        ctx.overflow,
        ctx.limit
    );

    let mut offered = Vec::new();
    for mut strategy in default_strategies() {
        let saved = strategy.savings(ctx.messages, ctx.tools, baseline, accountant)?;
        tracing::debug!("[MITIGATION] '{}' would save {} tokens", strategy.label, saved);
        if filter.admits(saved) {
            offered.push(strategy);
        }
    }

    let choices: Vec<Choice> = offered
        .iter()
        .map(|s| Choice {
            label: s.label.to_string(),
            description: format!("{} tokens", s.estimated_savings().unwrap_or_default()),
            picked: false,
        })
        .collect();

    let selection = match operator.pick_strategies(ctx.overflow, &choices).await {
        Some(sel) if !sel.is_empty() => sel,
        _ => {
            tracing::info!("[MITIGATION] No strategy selected, cancelling");
            return Ok(None);
        }
    };

    let mut reduced = ctx.messages.to_vec();
    for (i, strategy) in offered.iter().enumerate() {
        if selection.contains(&i) {
            tracing::info!("[MITIGATION] Applying '{}'", strategy.label);
            reduced = strategy.apply(&reduced);
        }
    }

    let after = accountant.count_tokens(&reduced, ctx.tools)?;
    if after > ctx.limit {
        let remaining_overflow = after - ctx.limit;
        tracing::warn!(
            "[MITIGATION] Still {} tokens over the limit after reductions",
            remaining_overflow
        );
        operator.notify(Notice::Error, NOT_ENOUGH_SAVINGS);
        return Err(CellstreamError::InsufficientReduction {
            remaining_overflow,
            limit: ctx.limit,
        }
        .into());
    }

    tracing::info!(
        "[MITIGATION] Reduced prompt from {} to {} tokens ({} messages)",
        baseline,
        after,
        reduced.len()
    );
    Ok(Some(reduced))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallRequest;

    fn sample() -> Vec<Message> {
        vec![
            Message::user("<JupyterCodeCell>```python\nx = 1\n```</JupyterCodeCell>").with_name("code"),
            Message::user("<JupyterCodeCellOutput>\n1\n</JupyterCodeCellOutput>"),
            Message::user("<JupyterCodeCellProblems>:\nE1: bad\n</JupyterCodeCellProblems>"),
            Message::user("plain question"),
            Message::system("be nice"),
        ]
    }

    #[test]
    fn test_marker_strategies() {
        let msgs = sample();
        assert_eq!(StrategyKind::RemoveOutput.apply(&msgs).len(), 4);
        assert_eq!(StrategyKind::RemoveProblems.apply(&msgs).len(), 4);
        // The code-cell marker is a prefix of the other two markers.
        assert_eq!(StrategyKind::RemoveCodeCells.apply(&msgs).len(), 2);
        assert_eq!(StrategyKind::RemoveSystemMessage.apply(&msgs).len(), 4);
        assert_eq!(msgs.len(), 5);
    }

    #[test]
    fn test_tool_call_messages_survive_marker_strategies() {
        let call = ToolCallRequest {
            index: 0,
            id: "call_1".into(),
            call_type: "function".into(),
            function: crate::types::FunctionCall {
                name: "readFile".into(),
                arguments: "{}".into(),
            },
        };
        let msgs = vec![Message::assistant_tool_call(call)];
        assert_eq!(StrategyKind::RemoveCodeCells.apply(&msgs).len(), 1);
    }

    #[test]
    fn test_tabify() {
        let msgs = vec![Message::user("def f():\n        return 1")];
        let out = StrategyKind::Tabify.apply(&msgs);
        assert_eq!(out[0].content_str(), "def f():\n\t\treturn 1");
    }

    #[test]
    fn test_savings_memoized() {
        let acc = TokenAccountant::with_encoder(crate::token_counting::WhitespaceEncoder);
        let msgs = sample();
        let base = acc.count_tokens(&msgs, &[]).unwrap();
        let mut s = TokenReductionStrategy::new(StrategyKind::RemoveSystemMessage);
        let first = s.savings(&msgs, &[], base, &acc).unwrap();
        assert!(first > 0);
        // Different input, same memoized answer.
        assert_eq!(s.savings(&[], &[], 0, &acc).unwrap(), first);
    }

    #[test]
    fn test_filter_policy() {
        assert!(StrategyFilter::ShowAll.admits(0));
        assert!(!StrategyFilter::HideUnprofitable.admits(1));
        assert!(StrategyFilter::HideUnprofitable.admits(2));
        assert_eq!(StrategyFilter::default(), StrategyFilter::ShowAll);
    }
}
