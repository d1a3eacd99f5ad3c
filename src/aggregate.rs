//! Reconstruction of complete turns from incremental stream chunks.
//!
//! Content fragments join into final text in arrival order. Tool-call
//! fragments accumulate under the most recently seen call id: a fragment
//! carrying a *new* id finalizes the previous accumulator and starts a fresh
//! one, id-less fragments extend the current accumulator, and stream end
//! finalizes whatever is open. Token accounting is approximate (one token
//! per chunk) until a chunk carries authoritative usage totals, which
//! replace the estimate.

use crate::traits::{FinishReason, StreamChunk, ToolCall};

/// A fully materialized turn reconstructed from a chunk stream.
#[derive(Debug, Clone)]
pub struct AggregatedTurn {
    /// Joined content text in arrival order.
    pub text: String,
    /// Finalized tool calls in the order their ids first appeared.
    pub tool_calls: Vec<ToolCall>,
    /// First finish reason reported by the stream, if any.
    pub finish_reason: Option<FinishReason>,
    /// Tokens consumed: authoritative when the stream reported usage,
    /// a per-chunk estimate otherwise.
    pub tokens_consumed: usize,
}

/// Tool call being accumulated from argument fragments.
struct PendingToolCall {
    id: String,
    name: Option<String>,
    fragments: Vec<String>,
}

impl PendingToolCall {
    fn finalize(self) -> ToolCall {
        ToolCall::function(
            self.id,
            self.name.unwrap_or_default(),
            self.fragments.concat(),
        )
    }
}

/// Accumulator over a stream of [`StreamChunk`]s.
#[derive(Default)]
pub struct StreamAggregator {
    content: Vec<String>,
    completed: Vec<ToolCall>,
    pending: Option<PendingToolCall>,
    finish_reason: Option<FinishReason>,
    tokens_consumed: usize,
}

impl StreamAggregator {
    /// Fresh aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulated state.
    pub fn feed(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Content(text) => {
                self.tokens_consumed += 1;
                self.content.push(text);
            }
            StreamChunk::ToolCallDelta {
                id,
                name,
                arguments,
            } => {
                self.tokens_consumed += 1;
                let starts_new_call = match (&self.pending, &id) {
                    (Some(pending), Some(new_id)) => pending.id != *new_id,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if starts_new_call {
                    if let Some(new_id) = id {
                        self.flush_pending();
                        self.pending = Some(PendingToolCall {
                            id: new_id,
                            name,
                            fragments: vec![arguments.unwrap_or_default()],
                        });
                    }
                } else if let Some(pending) = &mut self.pending {
                    if pending.name.is_none() {
                        pending.name = name;
                    }
                    if let Some(fragment) = arguments {
                        pending.fragments.push(fragment);
                    }
                }
                // An id-less fragment with no open accumulator has nothing to
                // attach to and is dropped.
            }
            StreamChunk::Usage { total_tokens } => {
                self.tokens_consumed = total_tokens;
            }
            StreamChunk::Finished { reason } => {
                self.tokens_consumed += 1;
                if self.finish_reason.is_none() {
                    self.finish_reason = Some(reason);
                }
            }
        }
    }

    fn flush_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.completed.push(pending.finalize());
        }
    }

    /// Finalize any open accumulator and return the materialized turn.
    pub fn finish(mut self) -> AggregatedTurn {
        self.flush_pending();
        AggregatedTurn {
            text: self.content.concat(),
            tool_calls: self.completed,
            finish_reason: self.finish_reason,
            tokens_consumed: self.tokens_consumed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> StreamChunk {
        StreamChunk::ToolCallDelta {
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: arguments.map(String::from),
        }
    }

    #[test]
    fn test_content_joins_in_arrival_order() {
        let mut agg = StreamAggregator::new();
        agg.feed(StreamChunk::Content("Hel".to_string()));
        agg.feed(StreamChunk::Content("lo, ".to_string()));
        agg.feed(StreamChunk::Content("world".to_string()));

        let turn = agg.finish();
        assert_eq!(turn.text, "Hello, world");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_split_arguments_reassemble() {
        let mut agg = StreamAggregator::new();
        agg.feed(delta(Some("a"), Some("f"), Some("{\"x\":1")));
        agg.feed(delta(None, None, Some("}")));

        let turn = agg.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "a");
        assert_eq!(turn.tool_calls[0].name(), "f");
        assert_eq!(turn.tool_calls[0].arguments(), "{\"x\":1}");
    }

    #[test]
    fn test_new_id_flushes_prior_accumulator() {
        let mut agg = StreamAggregator::new();
        agg.feed(delta(Some("a"), Some("first"), Some("{}")));
        agg.feed(delta(Some("b"), Some("second"), Some("{\"y\"")));
        agg.feed(delta(None, None, Some(":2}")));

        let turn = agg.finish();
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(turn.tool_calls[0].id, "a");
        assert_eq!(turn.tool_calls[0].arguments(), "{}");
        assert_eq!(turn.tool_calls[1].id, "b");
        assert_eq!(turn.tool_calls[1].arguments(), "{\"y\":2}");
    }

    #[test]
    fn test_repeated_id_appends() {
        let mut agg = StreamAggregator::new();
        agg.feed(delta(Some("a"), Some("f"), Some("{\"x\"")));
        agg.feed(delta(Some("a"), None, Some(":1}")));

        let turn = agg.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].arguments(), "{\"x\":1}");
    }

    #[test]
    fn test_late_name_fills_in() {
        let mut agg = StreamAggregator::new();
        agg.feed(delta(Some("a"), None, Some("{")));
        agg.feed(delta(None, Some("late"), Some("}")));

        let turn = agg.finish();
        assert_eq!(turn.tool_calls[0].name(), "late");
    }

    #[test]
    fn test_orphan_fragment_is_dropped() {
        let mut agg = StreamAggregator::new();
        agg.feed(delta(None, None, Some("{\"lost\":true}")));
        let turn = agg.finish();
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn test_usage_replaces_estimate() {
        let mut agg = StreamAggregator::new();
        agg.feed(StreamChunk::Content("a".to_string()));
        agg.feed(StreamChunk::Content("b".to_string()));
        agg.feed(StreamChunk::Content("c".to_string()));
        agg.feed(StreamChunk::Usage { total_tokens: 42 });

        let turn = agg.finish();
        assert_eq!(turn.tokens_consumed, 42);
    }

    #[test]
    fn test_estimate_counts_one_per_chunk() {
        let mut agg = StreamAggregator::new();
        agg.feed(StreamChunk::Content("a".to_string()));
        agg.feed(StreamChunk::Content("b".to_string()));
        agg.feed(StreamChunk::Finished {
            reason: FinishReason::Stop,
        });

        let turn = agg.finish();
        assert_eq!(turn.tokens_consumed, 3);
    }

    #[test]
    fn test_first_finish_reason_wins() {
        let mut agg = StreamAggregator::new();
        agg.feed(StreamChunk::Finished {
            reason: FinishReason::ToolCalls,
        });
        agg.feed(StreamChunk::Finished {
            reason: FinishReason::Stop,
        });

        let turn = agg.finish();
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn test_mixed_content_and_tool_calls() {
        let mut agg = StreamAggregator::new();
        agg.feed(StreamChunk::Content("Let me check.".to_string()));
        agg.feed(delta(Some("a"), Some("lookup"), Some("{\"q\":\"rust\"}")));
        agg.feed(StreamChunk::Finished {
            reason: FinishReason::ToolCalls,
        });

        let turn = agg.finish();
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.finish_reason, Some(FinishReason::ToolCalls));
    }
}
