//! Chunk coalescing
//!
//! Providers often split a word (or a fence marker) over several fragments.
//! Fragments without any separator are held back until one arrives, so the
//! segmenter sees fence markers whole. Tool-call deltas are merged by index and
//! released as one batch.

use crate::tool_calls::ToolCallAccumulator;
use crate::types::StreamUnit;

const SEPARATORS: &[char] = &['\n', ' ', '-', '<', '>', '(', ')', ',', '.', '\'', '"'];

/// A fragment is word-internal when it contains no separator at all.
pub fn is_word_internal(text: &str) -> bool {
    !text.contains(SEPARATORS)
}

#[derive(Default)]
pub struct ChunkCoalescer {
    buffer: String,
    tools: ToolCallAccumulator,
}

impl ChunkCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: StreamUnit) -> Vec<StreamUnit> {
        let mut out = Vec::new();
        match unit {
            StreamUnit::TextFragment(text) => {
                if is_word_internal(&text) {
                    self.buffer.push_str(&text);
                    return out;
                }
                self.flush_tools(&mut out);
                let mut merged = std::mem::take(&mut self.buffer);
                merged.push_str(&text);
                out.push(StreamUnit::TextFragment(merged));
            }
            StreamUnit::ToolCallDeltaBatch(deltas) => {
                // Text held back so far precedes these deltas.
                if self.tools.is_empty() {
                    self.flush_text(&mut out);
                }
                tracing::trace!("[COALESCE] Absorbing {} tool-call deltas", deltas.len());
                self.tools.push(&deltas);
            }
            StreamUnit::FinishSignal(reason) => {
                self.flush_tools(&mut out);
                self.flush_text(&mut out);
                out.push(StreamUnit::FinishSignal(reason));
            }
        }
        out
    }

    /// End of sequence without a signal: release whatever is held.
    pub fn finish(&mut self) -> Vec<StreamUnit> {
        let mut out = Vec::new();
        self.flush_tools(&mut out);
        self.flush_text(&mut out);
        out
    }

    fn flush_text(&mut self, out: &mut Vec<StreamUnit>) {
        if !self.buffer.is_empty() {
            out.push(StreamUnit::TextFragment(std::mem::take(&mut self.buffer)));
        }
    }

    fn flush_tools(&mut self, out: &mut Vec<StreamUnit>) {
        if !self.tools.is_empty() {
            out.push(StreamUnit::ToolCallDeltaBatch(self.tools.take_merged()));
        }
    }
}
