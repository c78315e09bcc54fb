//! Approximate token accounting.
//!
//! Counts follow a gpt-4o-like tokenizer closely enough for input-box feedback
//! and post-hoc usage records. Nothing downstream treats them as exact.

use unicode_segmentation::UnicodeSegmentation;

use crate::core::message::{Message, Role, Usage};

/// ASCII characters folded into one token for alphanumeric runs.
const CHARS_PER_PIECE: usize = 6;
/// Framing cost of one chat message (`<|start|>`, role, `<|end|>`).
const TOKENS_PER_MESSAGE: u32 = 3;
const TOKENS_PER_ROLE: u32 = 1;
/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Content tokens for one message. Framing overhead is excluded so empty
    /// text is always zero.
    pub fn estimate(&self, _role: Role, text: &str) -> u32 {
        count_text(text)
    }

    /// Tokens for a whole request: system prompt, messages, and reply priming.
    pub fn estimate_conversation<'a, I>(&self, system_prompt: &str, messages: I) -> u32
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut total = 0u32;
        if !system_prompt.trim().is_empty() {
            total = total.saturating_add(framed(count_text(system_prompt)));
        }
        for message in messages {
            if !message.has_content() {
                continue;
            }
            total = total.saturating_add(framed(self.estimate(message.role, &message.content)));
        }
        if total == 0 {
            return 0;
        }
        total.saturating_add(REPLY_PRIMING_TOKENS)
    }

    /// Usage record for a finished turn: the prompt side is every text that
    /// went out, the completion side is the reply.
    pub fn estimate_usage<'a, I>(&self, prompt_parts: I, completion: &str) -> Usage
    where
        I: IntoIterator<Item = &'a str>,
    {
        let prompt_tokens = prompt_parts
            .into_iter()
            .map(count_text)
            .fold(0u32, |acc, n| acc.saturating_add(n));
        Usage::new(prompt_tokens, count_text(completion))
    }
}

fn framed(content_tokens: u32) -> u32 {
    content_tokens
        .saturating_add(TOKENS_PER_MESSAGE)
        .saturating_add(TOKENS_PER_ROLE)
}

fn count_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let mut tokens = 0usize;
    for word in text.split_word_bounds() {
        if word.chars().all(char::is_whitespace) {
            // Runs of spaces merge into the following word piece; newlines
            // are tokens of their own.
            tokens += word.matches('\n').count();
            continue;
        }
        if word.is_ascii() {
            if word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                tokens += word.len().div_ceil(CHARS_PER_PIECE);
            } else {
                tokens += word.chars().count();
            }
        } else {
            tokens += word.graphemes(true).count();
        }
    }

    u32::try_from(tokens).unwrap_or(u32::MAX)
}
