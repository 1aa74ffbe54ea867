//! Operator surface
//!
//! Everything that needs a human: strategy multi-select, tool-call approval,
//! the over-budget confirmation, notifications and progress. The terminal
//! implementation reads answers from stdin.

use std::future::Future;

use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::types::ToolCallRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Info,
    Warning,
    Error,
}

/// One entry of a multi-select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub description: String,
    pub picked: bool,
}

pub trait Operator: Send + Sync {
    /// Multi-select. `None` means the picker was dismissed.
    fn pick(&self, title: &str, choices: &[Choice]) -> impl Future<Output = Option<Vec<usize>>> + Send;

    fn confirm(&self, question: &str) -> impl Future<Output = bool> + Send;

    fn notify(&self, level: Notice, message: &str);

    fn progress(&self, message: &str);

    /// Strategy selection for an over-budget prompt.
    fn pick_strategies(
        &self,
        overflow: usize,
        choices: &[Choice],
    ) -> impl Future<Output = Option<Vec<usize>>> + Send {
        async move {
            let title = format!(
                "Prompt is {} tokens over the limit. Select the reductions to apply",
                overflow
            );
            self.pick(&title, choices).await
        }
    }

    /// Approval of requested tool calls; every call starts picked.
    fn pick_tool_calls(
        &self,
        calls: &[ToolCallRequest],
    ) -> impl Future<Output = Option<Vec<usize>>> + Send {
        let choices: Vec<Choice> = calls
            .iter()
            .map(|c| Choice {
                label: c.function.name.clone(),
                description: c.function.arguments.clone(),
                picked: true,
            })
            .collect();
        async move {
            self.pick(crate::constants::TOOL_CALLS_REQUESTED, &choices)
                .await
        }
    }

    fn confirm_over_budget(&self, estimated: usize, limit: usize) -> impl Future<Output = bool> + Send {
        async move {
            let question = format!(
                "The prompt uses {} of {} tokens, leaving no room for a reply. Send anyway without max_tokens?",
                estimated, limit
            );
            self.confirm(&question).await
        }
    }
}

/// Interactive operator on stdin/stderr.
pub struct TerminalOperator {
    input: Mutex<Lines<BufReader<Stdin>>>,
    assume_yes: bool,
}

impl TerminalOperator {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            assume_yes,
        }
    }

    async fn read_line(&self) -> Option<String> {
        let mut input = self.input.lock().await;
        match input.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("[OPERATOR] Failed to read stdin: {}", e);
                None
            }
        }
    }
}

/// Parses "1,3" / "all" / "" (keep defaults) / "q" (dismiss) into indices.
pub fn parse_selection(answer: &str, choices: &[Choice]) -> Option<Vec<usize>> {
    let answer = answer.trim();
    if answer.eq_ignore_ascii_case("q") {
        return None;
    }
    if answer.is_empty() {
        return Some(
            choices
                .iter()
                .enumerate()
                .filter(|(_, c)| c.picked)
                .map(|(i, _)| i)
                .collect(),
        );
    }
    if answer.eq_ignore_ascii_case("all") {
        return Some((0..choices.len()).collect());
    }
    if answer.eq_ignore_ascii_case("none") {
        return Some(Vec::new());
    }
    let mut picked = Vec::new();
    for part in answer.split(|c: char| c == ',' || c.is_whitespace()) {
        if part.is_empty() {
            continue;
        }
        match part.parse::<usize>() {
            Ok(n) if n >= 1 && n <= choices.len() => {
                if !picked.contains(&(n - 1)) {
                    picked.push(n - 1);
                }
            }
            _ => return None,
        }
    }
    picked.sort_unstable();
    Some(picked)
}

impl Operator for TerminalOperator {
    async fn pick(&self, title: &str, choices: &[Choice]) -> Option<Vec<usize>> {
        if self.assume_yes {
            return parse_selection("", choices);
        }
        eprintln!("{}", title.bold());
        for (i, choice) in choices.iter().enumerate() {
            let mark = if choice.picked { "[x]" } else { "[ ]" };
            eprintln!("  {} {} {} {}", mark, format!("{}.", i + 1).cyan(), choice.label, choice.description.dimmed());
        }
        eprint!("Numbers (e.g. 1,3), 'all', 'none', Enter for defaults, 'q' to cancel: ");
        let line = self.read_line().await?;
        parse_selection(&line, choices)
    }

    async fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{} [y/N] ", question.yellow());
        match self.read_line().await {
            Some(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            None => false,
        }
    }

    fn notify(&self, level: Notice, message: &str) {
        match level {
            Notice::Info => {
                tracing::info!("[OPERATOR] {}", message);
                eprintln!("{}", message.green());
            }
            Notice::Warning => {
                tracing::warn!("[OPERATOR] {}", message);
                eprintln!("{}", message.yellow());
            }
            Notice::Error => {
                tracing::error!("[OPERATOR] {}", message);
                eprintln!("{}", message.red().bold());
            }
        }
    }

    fn progress(&self, message: &str) {
        let now = chrono::Local::now().format("%H:%M:%S");
        eprintln!("{} {}", format!("[{}]", now).dimmed(), message);
    }
}
