//! Segmentation
//!
//! Splits the coalesced text stream into alternating prose and code units by
//! watching for markdown fence markers. Every unit it creates is tagged as
//! authored by the assistant.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;

use crate::coalesce::ChunkCoalescer;
use crate::constants::RECEIVING_TOKENS;
use crate::document::{Document, UnitKind};
use crate::operator::Operator;
use crate::str_utils::is_blank;
use crate::types::{FinishReason, Result, Role, StreamUnit, ToolCallDelta};

lazy_static! {
    static ref OPEN_FENCE: Regex =
        Regex::new(r"```([A-Za-z0-9_+#.-]+)[ \t]*\n").expect("Invalid fence regex");
}

const CLOSE_FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Undetermined,
    InProse,
    InCode,
}

/// How a drive over the unit channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Finished(FinishReason),
    ToolCalls(Vec<ToolCallDelta>),
}

enum Marker<'a> {
    Open {
        start: usize,
        end: usize,
        language: &'a str,
    },
    Close {
        start: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Segmenter {
    state: SegmentState,
    current: usize,
}

impl Segmenter {
    /// `anchor` is the unit new output is inserted after.
    pub fn new(anchor: usize) -> Self {
        Self {
            state: SegmentState::Undetermined,
            current: anchor,
        }
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    fn next_marker<'a>(&self, text: &'a str) -> Option<Marker<'a>> {
        let open = OPEN_FENCE.captures(text).and_then(|caps| {
            let whole = caps.get(0)?;
            let language = caps.get(1)?.as_str();
            Some(Marker::Open {
                start: whole.start(),
                end: whole.end(),
                language,
            })
        });
        // A bare fence only closes a block we are inside of.
        let close = if self.state == SegmentState::InCode {
            text.find(CLOSE_FENCE)
        } else {
            None
        };

        match (open, close) {
            (Some(Marker::Open { start, .. }), Some(c)) if c < start => Some(Marker::Close { start: c }),
            (Some(open), _) => Some(open),
            (None, Some(c)) => Some(Marker::Close { start: c }),
            (None, None) => None,
        }
    }

    async fn insert<D: Document>(&mut self, document: &D, kind: UnitKind, language: &str) -> Result<()> {
        let index = document.insert_unit(self.current, kind, language).await?;
        document.set_unit_role_tag(index, Role::Assistant).await?;
        tracing::debug!("[SEGMENT] New {} unit at {}", kind.as_str(), index);
        self.current = index;
        self.state = match kind {
            UnitKind::Code => SegmentState::InCode,
            UnitKind::Prose => SegmentState::InProse,
        };
        Ok(())
    }

    async fn append<D: Document>(&mut self, document: &D, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        if self.state == SegmentState::Undetermined {
            self.insert(document, UnitKind::Prose, "markdown").await?;
        }
        document.append_text(self.current, text).await
    }

    /// Applies one coalesced fragment to the document.
    pub async fn process_fragment<D: Document>(&mut self, document: &D, fragment: &str) -> Result<()> {
        let mut rest = fragment;
        while let Some(marker) = self.next_marker(rest) {
            match marker {
                Marker::Open { start, end, language } => {
                    self.append(document, &rest[..start]).await?;
                    self.insert(document, UnitKind::Code, language).await?;
                    rest = &rest[end..];
                }
                Marker::Close { start } => {
                    self.append(document, &rest[..start]).await?;
                    self.insert(document, UnitKind::Prose, "markdown").await?;
                    rest = &rest[start + CLOSE_FENCE.len()..];
                }
            }
        }
        self.append(document, rest).await
    }

    /// Removes a trailing unit left empty by the stream and steps back one unit.
    pub async fn cleanup_trailing<D: Document>(&mut self, document: &D) -> Result<()> {
        if self.state == SegmentState::Undetermined {
            return Ok(());
        }
        let text = document.unit_text(self.current).await?;
        if is_blank(&text) {
            tracing::debug!("[SEGMENT] Deleting empty trailing unit {}", self.current);
            document.delete_unit(self.current..self.current + 1).await?;
            self.current = self.current.saturating_sub(1);
            self.state = SegmentState::Undetermined;
        }
        Ok(())
    }

    /// Consumes units until a finish signal. Tool-call deltas are only handed
    /// back when the stream finished with `tool_calls`; any other reason drops them.
    pub async fn drive<D: Document, O: Operator>(
        &mut self,
        rx: &mut mpsc::Receiver<Result<StreamUnit>>,
        document: &D,
        operator: &O,
    ) -> Result<DriveOutcome> {
        let mut coalescer = ChunkCoalescer::new();
        let mut receiving = false;
        let mut tool_calls: Vec<ToolCallDelta> = Vec::new();

        loop {
            let (units, exhausted) = match rx.recv().await {
                Some(Ok(unit)) => (coalescer.push(unit), false),
                Some(Err(e)) => return Err(e),
                None => (coalescer.finish(), true),
            };

            for unit in units {
                match unit {
                    StreamUnit::TextFragment(text) => {
                        if !receiving {
                            operator.progress(RECEIVING_TOKENS);
                            receiving = true;
                        }
                        self.process_fragment(document, &text).await?;
                    }
                    StreamUnit::ToolCallDeltaBatch(batch) => {
                        tracing::debug!("[SEGMENT] Holding {} tool call delta(s)", batch.len());
                        tool_calls.extend(batch);
                    }
                    StreamUnit::FinishSignal(reason) => {
                        self.cleanup_trailing(document).await?;
                        return Ok(settle(reason, tool_calls));
                    }
                }
            }

            if exhausted {
                tracing::warn!("[SEGMENT] Stream ended without a finish signal, treating as length");
                self.cleanup_trailing(document).await?;
                return Ok(settle(FinishReason::Length, tool_calls));
            }
        }
    }
}

fn settle(reason: FinishReason, tool_calls: Vec<ToolCallDelta>) -> DriveOutcome {
    if tool_calls.is_empty() {
        return DriveOutcome::Finished(reason);
    }
    if reason == FinishReason::ToolsCall {
        tracing::info!("[SEGMENT] Stream paused for {} tool call delta(s)", tool_calls.len());
        return DriveOutcome::ToolCalls(tool_calls);
    }
    tracing::warn!(
        "[SEGMENT] Dropping {} pending tool call delta(s) after {} finish",
        tool_calls.len(),
        reason
    );
    DriveOutcome::Finished(reason)
}
