//! Tool-call delta merging
//!
//! Providers stream a tool call as many partial deltas that share an `index`.
//! The accumulator stitches them together; `finalize_tool_calls` validates the
//! concatenated arguments once the turn is terminal.

use std::collections::BTreeMap;

use crate::json_repair::JsonRepair;
use crate::types::{
    CellstreamError, FunctionCall, FunctionDelta, Result, ToolCallDelta, ToolCallRequest,
};

#[derive(Clone, Default)]
pub struct ToolCallBuffer {
    pub id: Option<String>,
    pub call_type: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Clone, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, ToolCallBuffer>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn push(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let entry = self.calls.entry(delta.index).or_default();
            if let Some(id) = &delta.id {
                entry.id = Some(id.clone());
            }
            if let Some(t) = &delta.call_type {
                entry.call_type = Some(t.clone());
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    if !name.is_empty() {
                        tracing::debug!("[ACCUMULATOR] Tool call {} name: {}", delta.index, name);
                        entry.name = Some(name.clone());
                    }
                }
                if let Some(args) = &function.arguments {
                    entry.arguments.push_str(args);
                }
            }
        }
    }

    /// Merged deltas in index order. Arguments are the in-order concatenation.
    pub fn merged(&self) -> Vec<ToolCallDelta> {
        self.calls
            .iter()
            .map(|(index, buf)| ToolCallDelta {
                index: *index,
                id: buf.id.clone(),
                call_type: buf.call_type.clone(),
                function: Some(FunctionDelta {
                    name: buf.name.clone(),
                    arguments: Some(buf.arguments.clone()),
                }),
            })
            .collect()
    }

    pub fn take_merged(&mut self) -> Vec<ToolCallDelta> {
        let merged = self.merged();
        self.calls.clear();
        merged
    }
}

/// Turns merged deltas into complete requests, repairing arguments that are not JSON.
pub async fn finalize_tool_calls<R: JsonRepair>(
    deltas: Vec<ToolCallDelta>,
    repair: &R,
) -> Result<Vec<ToolCallRequest>> {
    // Re-merge so callers may pass raw (unmerged) batches too.
    let mut acc = ToolCallAccumulator::new();
    acc.push(&deltas);

    let mut requests = Vec::with_capacity(acc.len());
    for delta in acc.merged() {
        let index = delta.index;
        let function = delta.function.unwrap_or_default();
        let name = match function.name {
            Some(n) => n,
            None => {
                tracing::warn!("[FINALIZE] Tool call {} has no function name", index);
                String::new()
            }
        };
        let id = match delta.id {
            Some(id) => id,
            None => {
                let id = ToolCallRequest::synthetic_id();
                tracing::warn!(
                    "[FINALIZE] Tool call {} ({}) arrived without an id; using {}",
                    index,
                    name,
                    id
                );
                id
            }
        };
        let raw = function.arguments.unwrap_or_default();
        let arguments = finalize_arguments(index, &name, &raw, repair).await?;

        requests.push(ToolCallRequest {
            index,
            id,
            call_type: match delta.call_type {
                Some(t) => t,
                None => "function".to_string(),
            },
            function: FunctionCall { name, arguments },
        });
    }
    Ok(requests)
}

async fn finalize_arguments<R: JsonRepair>(
    index: u32,
    name: &str,
    raw: &str,
    repair: &R,
) -> Result<String> {
    if raw.trim().is_empty() {
        return Ok("{}".to_string());
    }

    let parse_err = match serde_json::from_str::<serde_json::Value>(raw) {
        // Re-serialize to drop concatenation artifacts (stray whitespace etc).
        Ok(value) => return Ok(serde_json::to_string(&value)?),
        Err(e) => e,
    };

    tracing::warn!(
        "[FINALIZE] Tool call {} ('{}') arguments are not valid JSON ({} chars, truncated: {}): {}",
        index,
        name,
        raw.len(),
        parse_err.is_eof(),
        parse_err
    );

    match repair.repair(raw).await {
        Ok(repaired) => match serde_json::from_str::<serde_json::Value>(repaired.trim()) {
            Ok(value) => {
                tracing::info!(
                    "[REPAIR] Tool call {} arguments repaired: {} -> {} chars",
                    index,
                    raw.len(),
                    repaired.len()
                );
                Ok(serde_json::to_string(&value)?)
            }
            Err(e) => {
                tracing::error!("[REPAIR] Repaired arguments for tool call {} still invalid: {}", index, e);
                Err(CellstreamError::UnparseableToolArguments { index, source: e }.into())
            }
        },
        Err(e) => {
            tracing::error!("[REPAIR] Repair request for tool call {} failed: {}", index, e.inner);
            Err(CellstreamError::UnparseableToolArguments {
                index,
                source: parse_err,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_repair::NoRepair;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            call_type: id.map(|_| "function".to_string()),
            function: Some(FunctionDelta {
                name: name.map(str::to_string),
                arguments: Some(args.to_string()),
            }),
        }
    }

    #[test]
    fn test_merge_by_index_keeps_order_and_first_id() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&[delta(0, Some("call_a"), Some("findFiles"), "{\"incl")]);
        acc.push(&[delta(1, Some("call_b"), Some("readFile"), "{")]);
        acc.push(&[delta(0, None, None, "ude\":\"*.rs\"}")]);
        acc.push(&[delta(1, None, None, "}")]);

        let merged = acc.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id.as_deref(), Some("call_a"));
        assert_eq!(
            merged[0].function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"include\":\"*.rs\"}")
        );
        assert_eq!(merged[1].function.as_ref().and_then(|f| f.name.as_deref()), Some("readFile"));
    }

    #[tokio::test]
    async fn test_finalize_empty_arguments_become_object() {
        let calls = finalize_tool_calls(vec![delta(0, Some("c"), Some("findFiles"), "")], &NoRepair)
            .await
            .unwrap();
        assert_eq!(calls[0].function.arguments, "{}");
        assert_eq!(calls[0].call_type, "function");
    }

    #[tokio::test]
    async fn test_finalize_assigns_synthetic_id() {
        let calls = finalize_tool_calls(vec![delta(3, None, Some("readFile"), "{}")], &NoRepair)
            .await
            .unwrap();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].index, 3);
    }

    #[tokio::test]
    async fn test_finalize_without_repair_propagates_parse_error() {
        let result =
            finalize_tool_calls(vec![delta(0, Some("c"), Some("readFile"), "{path: x")], &NoRepair).await;
        match result {
            Err(e) => assert!(matches!(
                e.inner,
                CellstreamError::UnparseableToolArguments { index: 0, .. }
            )),
            Ok(calls) => panic!("expected error, got {:?}", calls),
        }
    }
}
