//! Conversation assembly
//!
//! Rebuilds the message array from document units on every request.

use crate::constants::{
    CODE_CELL_MARKER, CODE_CELL_OUTPUT_MARKER, CODE_CELL_PROBLEMS_MARKER, DEFAULT_SYSTEM_MESSAGE,
};
use crate::document::{Document, DocumentUnit, UnitKind};
use crate::types::{CellstreamError, Message, Result, Role, ToolCallResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionType {
    CurrentCellOnly,
    #[default]
    CurrentCellAndAbove,
}

impl CompletionType {
    pub fn start_index(&self, target: usize) -> usize {
        match self {
            CompletionType::CurrentCellOnly => target,
            CompletionType::CurrentCellAndAbove => 0,
        }
    }
}

fn unit_content(unit: &DocumentUnit) -> String {
    match unit.kind {
        UnitKind::Code => format!(
            "<{m}>```{lang} \n{content}\n```</{m}>",
            m = CODE_CELL_MARKER,
            lang = unit.language,
            content = unit.content
        ),
        UnitKind::Prose => unit.content.clone(),
    }
}

fn unit_messages(unit: &DocumentUnit) -> Vec<Message> {
    let role = match unit.role_tag {
        Some(r) => r,
        None => Role::User,
    };

    let mut messages = vec![Message::new(role, unit_content(unit)).with_name(unit.kind.as_str())];

    if !unit.diagnostics.is_empty() {
        let lines: Vec<String> = unit
            .diagnostics
            .iter()
            .map(|d| match &d.code {
                Some(code) => format!("{}: {}", code, d.message),
                None => d.message.clone(),
            })
            .collect();
        messages.push(Message::new(
            role,
            format!(
                "<{m}>:\n{}\n</{m}>",
                lines.join("\n"),
                m = CODE_CELL_PROBLEMS_MARKER
            ),
        ));
    }

    for output in unit.outputs.iter().filter(|o| !o.is_image()) {
        messages.push(Message::new(
            role,
            format!("<{m}>\n{}\n</{m}>", output.data, m = CODE_CELL_OUTPUT_MARKER),
        ));
    }

    append_tool_results(&mut messages, &unit.tool_results);
    messages
}

fn convert_range(units: &[DocumentUnit], start: usize, end: usize) -> Result<Vec<Message>> {
    if end >= units.len() || start > end {
        return Err(CellstreamError::Protocol(format!(
            "unit range {}..={} out of range (document has {})",
            start,
            end,
            units.len()
        ))
        .into());
    }
    let mut messages: Vec<Message> = units[start..=end].iter().flat_map(unit_messages).collect();
    ensure_system_message(&mut messages);
    Ok(messages)
}

/// Units `start..=target` (per `mode`) as messages, plus the default system message.
pub fn convert_units_to_messages(
    units: &[DocumentUnit],
    target: usize,
    mode: CompletionType,
) -> Result<Vec<Message>> {
    convert_range(units, mode.start_index(target), target)
}

/// Appends the default system message unless one exists anywhere.
pub fn ensure_system_message(messages: &mut Vec<Message>) {
    if !messages.iter().any(|m| m.role == Role::System) {
        messages.push(Message::system(DEFAULT_SYSTEM_MESSAGE));
    }
}

/// Assistant tool-call message followed by the tool's answer, per result.
pub fn append_tool_results(messages: &mut Vec<Message>, results: &[ToolCallResult]) {
    for result in results {
        messages.push(Message::assistant_tool_call(result.call.clone()));
        messages.push(Message::tool_result(
            result.call.id.clone(),
            result.outcome.as_message_content(),
        ));
    }
}

pub async fn read_messages<D: Document>(
    document: &D,
    target: usize,
    mode: CompletionType,
) -> Result<Vec<Message>> {
    let units = document.read_units(0..target + 1).await?;
    convert_units_to_messages(&units, target, mode)
}

/// Like `read_messages`, but also includes the units generated after `target`
/// up to `through`, so follow-up requests see the reply so far.
pub async fn read_session_messages<D: Document>(
    document: &D,
    target: usize,
    through: usize,
    mode: CompletionType,
) -> Result<Vec<Message>> {
    let through = through.max(target);
    let units = document.read_units(0..through + 1).await?;
    convert_range(&units, mode.start_index(target), through)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CellOutput, Diagnostic};
    use crate::types::{FunctionCall, ToolCallOutcome, ToolCallRequest};

    fn notebook_units() -> Vec<DocumentUnit> {
        let mut code = DocumentUnit::code("python", "print(1)");
        code.diagnostics.push(Diagnostic {
            code: Some("E0602".into()),
            message: "undefined name".into(),
        });
        code.outputs.push(CellOutput {
            mime: "text/plain".into(),
            data: "1".into(),
        });
        code.outputs.push(CellOutput {
            mime: "image/png".into(),
            data: "iVBOR".into(),
        });
        vec![
            DocumentUnit::prose("You are terse.").with_role(Role::System),
            DocumentUnit::prose("What does this print?"),
            code,
        ]
    }

    #[test]
    fn test_code_unit_wrapped_with_diagnostics_and_outputs() {
        let msgs = convert_units_to_messages(&notebook_units(), 2, CompletionType::CurrentCellAndAbove).unwrap();
        // system, prose, code, problems, one text output; no default system message.
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].name.as_deref(), Some("markdown"));
        assert_eq!(
            msgs[2].content_str(),
            "<JupyterCodeCell>```python \nprint(1)\n```</JupyterCodeCell>"
        );
        assert_eq!(msgs[2].name.as_deref(), Some("code"));
        assert_eq!(
            msgs[3].content_str(),
            "<JupyterCodeCellProblems>:\nE0602: undefined name\n</JupyterCodeCellProblems>"
        );
        assert_eq!(
            msgs[4].content_str(),
            "<JupyterCodeCellOutput>\n1\n</JupyterCodeCellOutput>"
        );
    }

    #[test]
    fn test_current_cell_only_adds_default_system() {
        let msgs = convert_units_to_messages(&notebook_units(), 1, CompletionType::CurrentCellOnly).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].content_str(), DEFAULT_SYSTEM_MESSAGE);
    }

    #[test]
    fn test_system_injection_idempotent() {
        let mut msgs = vec![Message::user("hi")];
        ensure_system_message(&mut msgs);
        ensure_system_message(&mut msgs);
        assert_eq!(msgs.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[test]
    fn test_tool_results_pairs() {
        let call = ToolCallRequest {
            index: 0,
            id: "call_9".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "readFile".into(),
                arguments: "{}".into(),
            },
        };
        let mut msgs = Vec::new();
        append_tool_results(
            &mut msgs,
            &[ToolCallResult {
                call,
                outcome: ToolCallOutcome::Declined,
            }],
        );
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].name.as_deref(), Some("readFile"));
        assert_eq!(msgs[1].role, Role::Tool);
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(msgs[1].content_str(), crate::constants::TOOL_CALL_DECLINED);
    }

    #[tokio::test]
    async fn test_session_messages_include_generated_units() {
        let nb = crate::document::Notebook::from_units(vec![
            DocumentUnit::prose("earlier"),
            DocumentUnit::prose("question"),
            DocumentUnit::prose("partial answer").with_role(Role::Assistant),
        ]);
        let msgs = read_session_messages(&nb, 1, 2, CompletionType::CurrentCellOnly)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content_str(), "question");
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[2].role, Role::System);
    }

    #[test]
    fn test_target_out_of_range() {
        assert!(convert_units_to_messages(&[], 0, CompletionType::CurrentCellOnly).is_err());
    }
}
