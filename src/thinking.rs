//! Splits streamed model text into answer content and thinking content.
//!
//! Thinking segments are delimited in-band by [`THINK_START`] and
//! [`THINK_END`]. Markers may be cut anywhere by chunk boundaries, so the
//! parser keeps a residual tail between calls and only emits text that can
//! no longer turn out to be part of a marker.

use crate::constants::{THINK_END, THINK_START, THINK_TAIL_LEN};
use crate::str_utils::split_keep_tail;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingDelta {
    pub content: String,
    pub thinking: String,
}

impl ThinkingDelta {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.thinking.is_empty()
    }
}

/// Parses one buffer and returns the deltas plus the residual buffer that
/// must be prepended to the next chunk.
pub fn parse_thinking_chunk(buffer: &str) -> (ThinkingDelta, String) {
    let mut pending = buffer;
    let mut delta = ThinkingDelta::default();

    while !pending.is_empty() {
        let start = pending.find(THINK_START);
        let end = pending.find(THINK_END);

        match (start, end) {
            (None, None) => {
                let (emit, tail) = split_keep_tail(pending, THINK_TAIL_LEN);
                delta.content.push_str(emit);
                pending = tail;
                break;
            }
            (Some(s), e) if e.map_or(true, |e| s < e) => {
                delta.content.push_str(&pending[..s]);
                match e {
                    Some(e) => {
                        let body_start = s + THINK_START.len();
                        // "__THINK__THINK_END__" overlaps: the pair is empty
                        if e > body_start {
                            delta.thinking.push_str(&pending[body_start..e]);
                        }
                        pending = &pending[e + THINK_END.len()..];
                    }
                    None => {
                        // incomplete pair, wait for the end marker
                        pending = &pending[s..];
                        break;
                    }
                }
            }
            (_, Some(e)) => {
                // Orphaned end marker: its start was consumed by an earlier call.
                delta.thinking.push_str(&pending[..e]);
                pending = &pending[e + THINK_END.len()..];
            }
            _ => break,
        }
    }

    (delta, pending.to_string())
}

/// End-of-stream flush: strip any marker text and treat the rest as content.
pub fn flush_thinking_buffer(buffer: &str) -> String {
    buffer.replace(THINK_START, "").replace(THINK_END, "")
}

/// Stateful wrapper that threads the residual buffer between chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingParser {
    pending: String,
}

impl ThinkingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> ThinkingDelta {
        self.pending.push_str(chunk);
        let (delta, rest) = parse_thinking_chunk(&self.pending);
        self.pending = rest;
        delta
    }

    /// Flushes the residual as content. The parser is empty afterwards.
    pub fn finish(&mut self) -> String {
        flush_thinking_buffer(&std::mem::take(&mut self.pending))
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> ThinkingDelta {
        let mut parser = ThinkingParser::new();
        let mut total = ThinkingDelta::default();
        for chunk in chunks {
            let delta = parser.feed(chunk);
            total.content.push_str(&delta.content);
            total.thinking.push_str(&delta.thinking);
        }
        total.content.push_str(&parser.finish());
        total
    }

    #[test]
    fn single_shot_routes_pair_to_thinking() {
        let out = run(&["A__THINK__B__THINK_END__C"]);
        assert_eq!(out.content, "AC");
        assert_eq!(out.thinking, "B");
    }

    #[test]
    fn start_marker_split_across_chunks() {
        let out = run(&["A__THI", "NK__B__THINK_END__C"]);
        assert_eq!(out.content, "AC");
        assert_eq!(out.thinking, "B");
    }

    #[test]
    fn incomplete_pair_is_retained() {
        let (delta, rest) = parse_thinking_chunk("hello __THINK__partial reasoning");
        assert_eq!(delta.content, "hello ");
        assert!(delta.thinking.is_empty());
        assert_eq!(rest, "__THINK__partial reasoning");
    }

    #[test]
    fn plain_text_keeps_marker_sized_tail() {
        let text = "x".repeat(50);
        let (delta, rest) = parse_thinking_chunk(&text);
        assert_eq!(delta.content.len(), 50 - THINK_TAIL_LEN);
        assert_eq!(rest.len(), THINK_TAIL_LEN);
    }

    #[test]
    fn orphaned_end_marker_closes_thinking() {
        let (delta, rest) = parse_thinking_chunk("still reasoning__THINK_END__the answer");
        assert_eq!(delta.thinking, "still reasoning");
        assert_eq!(delta.content, "");
        assert_eq!(rest, "the answer");
    }

    #[test]
    fn flush_strips_dangling_markers() {
        assert_eq!(flush_thinking_buffer("__THINK__half"), "half");
        assert_eq!(flush_thinking_buffer("tail__THINK_END__"), "tail");
        let out = run(&["answer __THINK__never closed"]);
        assert_eq!(out.content, "answer never closed");
        assert!(out.thinking.is_empty());
    }

    #[test]
    fn multibyte_text_is_never_split_inside_a_char() {
        let text = "提案内容を生成しています。少々お待ちください。";
        let out = run(&[text]);
        assert_eq!(out.content, text);
    }

    #[test]
    fn overlapping_markers_yield_empty_thinking() {
        let out = run(&["a__THINK__THINK_END__b"]);
        assert_eq!(out.content, "ab");
        assert!(out.thinking.is_empty());
    }

    #[test]
    fn any_chunking_matches_single_shot() {
        let text = "intro __THINK__reasoning 思考 step__THINK_END__answer part one, \
                    __THINK__second thought__THINK_END__ and the 結論.";
        let whole = run(&[text]);
        assert_eq!(
            whole.content,
            "intro answer part one,  and the 結論."
        );
        assert_eq!(whole.thinking, "reasoning 思考 stepsecond thought");

        let cuts: Vec<usize> = text.char_indices().map(|(i, _)| i).skip(1).collect();
        for (n, &a) in cuts.iter().enumerate() {
            assert_eq!(run(&[&text[..a], &text[a..]]), whole, "cut at {}", a);
            for &b in cuts.iter().skip(n + 1).step_by(7) {
                let out = run(&[&text[..a], &text[a..b], &text[b..]]);
                assert_eq!(out, whole, "cuts at {} and {}", a, b);
            }
        }
    }

    #[test]
    fn parser_state_serializes() {
        let mut parser = ThinkingParser::new();
        parser.feed("abc__THI");
        let json = serde_json::to_string(&parser).unwrap();
        let mut restored: ThinkingParser = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.pending(), "abc__THI");
        let delta = restored.feed("NK__x__THINK_END__");
        assert_eq!(delta.thinking, "x");
    }
}
