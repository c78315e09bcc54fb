//! Choosing which prior messages travel with a request.

use crate::core::message::Message;
use crate::core::tokens::TokenEstimator;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextSelector;

impl ContextSelector {
    pub fn new() -> Self {
        Self
    }

    /// Ordered subsequence of `messages` to submit as history.
    ///
    /// Everything before the last context break is out of reach regardless of
    /// budget. Of what remains, breaks and blank messages are dropped and the
    /// last `budget_count` survive in their original order.
    pub fn select(&self, messages: &[Message], budget_count: usize) -> Vec<Message> {
        if budget_count == 0 {
            return Vec::new();
        }

        let window = after_last_break(messages);
        let candidates: Vec<&Message> = window.iter().filter(|m| m.has_content()).collect();
        let skip = candidates.len().saturating_sub(budget_count);

        candidates.into_iter().skip(skip).cloned().collect()
    }

    /// History that was settled when `message_id` was written: everything
    /// strictly before it that is not part of an in-flight turn.
    ///
    /// Returns `None` when the id is not in `messages`.
    pub fn history_before(&self, messages: &[Message], message_id: &str) -> Option<Vec<Message>> {
        let position = messages.iter().position(|m| m.id == message_id)?;
        Some(
            messages[..position]
                .iter()
                .filter(|m| !m.status.is_transient())
                .cloned()
                .collect(),
        )
    }

    /// How many history messages the next request would carry.
    pub fn effective_context_count(&self, messages: &[Message], budget_count: usize) -> usize {
        if budget_count == 0 {
            return 0;
        }
        after_last_break(messages)
            .iter()
            .filter(|m| m.has_content())
            .count()
            .min(budget_count)
    }

    /// Diagnostic token count for the system prompt plus selected history.
    pub fn estimate_history_tokens(
        &self,
        estimator: &TokenEstimator,
        system_prompt: &str,
        messages: &[Message],
        budget_count: usize,
    ) -> u32 {
        let selected = self.select(messages, budget_count);
        estimator.estimate_conversation(system_prompt, &selected)
    }
}

fn after_last_break(messages: &[Message]) -> &[Message] {
    // Position, not timestamp: several breaks can share one.
    match messages.iter().rposition(Message::is_context_break) {
        Some(index) => &messages[index + 1..],
        None => messages,
    }
}
