//! Sentence segmentation for token-streamed replies.
//!
//! Chunks accumulate in a buffer; as soon as the buffer ends with terminal
//! punctuation (optionally closing a quote) the sentence is handed off for
//! synthesis, so speech starts before the model has finished generating.

use once_cell::sync::Lazy;
use regex::Regex;

static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[.!?]+["']?\s*$"#).expect("sentence pattern compiles"));

/// Accumulates streamed text chunks and yields speakable sentences.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns a completed sentence when the buffer now ends
    /// with terminal punctuation.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);
        if !SENTENCE_END.is_match(&self.buffer) {
            return None;
        }
        let sentence = self.buffer.trim().to_string();
        self.buffer.clear();
        if sentence.is_empty() {
            None
        } else {
            Some(sentence)
        }
    }

    /// Drain whatever remains after the stream ends, punctuated or not.
    pub fn flush(&mut self) -> Option<String> {
        let tail = self.buffer.trim().to_string();
        self.buffer.clear();
        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }
}
