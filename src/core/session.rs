//! One streaming exchange for one assistant message.
//!
//! A session moves its message `pending → sending → success | paused | error`
//! and commits every transition to the [`MessageStore`]. Streamed text lands in
//! memory chunk by chunk and becomes durable with the next transition (or
//! checkpoint), so a crash mid-stream keeps whatever was last committed.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{publish_commit, NotificationBus, TopicEvent};
use crate::core::message::{MessageId, MessagePatch, MessageStatus, TopicId, Usage};
use crate::core::provider::{CompletionRequest, CompletionStream, ProviderClient, StreamEvent};
use crate::core::store::{Commit, MessageStore, StoreError};
use crate::core::tokens::TokenEstimator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Persist partial content every N chunks. Zero persists only on status
    /// transitions.
    pub checkpoint_every: usize,
}

/// Everything a session needs to issue its request, prepared by the
/// controller before the session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    pub topic_id: TopicId,
    /// The assistant message this session writes.
    pub message_id: MessageId,
    /// The user message being answered.
    pub reply_to: MessageId,
    pub request: CompletionRequest,
    /// Texts counted as prompt tokens on success: system prompt, selected
    /// context, and the user message.
    pub prompt_parts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub content: String,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}

enum StreamEnd {
    Completed,
    Cancelled,
    Failed(String),
}

pub struct CompletionSession {
    plan: SessionPlan,
    cancel: CancellationToken,
    store: Arc<MessageStore>,
    bus: Arc<dyn NotificationBus>,
    estimator: TokenEstimator,
    settings: SessionSettings,
    content: String,
    reported_usage: Option<Usage>,
}

impl CompletionSession {
    pub fn new(
        plan: SessionPlan,
        store: Arc<MessageStore>,
        bus: Arc<dyn NotificationBus>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            plan,
            cancel: CancellationToken::new(),
            store,
            bus,
            estimator: TokenEstimator::new(),
            settings,
            content: String::new(),
            reported_usage: None,
        }
    }

    /// Handle for requesting a pause. Cancelling it only affects this session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the exchange to a terminal state. Never fails: every problem ends
    /// up as a message status plus a published event.
    pub async fn run(mut self, provider: Arc<dyn ProviderClient>) -> SessionOutcome {
        let message_id = self.plan.message_id.clone();

        if let Err(err) = self.transition(MessagePatch::status(MessageStatus::Sending)) {
            // Message vanished (topic cleared or removed) before we started.
            warn!(topic_id = %self.plan.topic_id, %message_id, error = %err, "session could not start");
            self.bus.publish(
                &self.plan.topic_id,
                TopicEvent::SessionFinished {
                    message_id: message_id.clone(),
                    status: MessageStatus::Error,
                },
            );
            return SessionOutcome {
                message_id,
                status: MessageStatus::Error,
                content: String::new(),
                usage: None,
                error: Some(err.to_string()),
            };
        }
        self.bus.publish(
            &self.plan.topic_id,
            TopicEvent::SessionStarted {
                message_id: message_id.clone(),
            },
        );
        debug!(topic_id = %self.plan.topic_id, %message_id, reply_to = %self.plan.reply_to, "session started");

        let end = match self.connect(provider.as_ref()).await {
            Ok(stream) => self.consume(stream).await,
            Err(end) => end,
        };

        self.finish(end)
    }

    async fn connect(&self, provider: &dyn ProviderClient) -> Result<CompletionStream, StreamEnd> {
        if self.cancel.is_cancelled() {
            return Err(StreamEnd::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamEnd::Cancelled),
            result = provider.stream_completion(self.plan.request.clone(), self.cancel.child_token()) => {
                result.map_err(|err| StreamEnd::Failed(err.to_string()))
            }
        }
    }

    async fn consume(&mut self, mut stream: CompletionStream) -> StreamEnd {
        let mut chunks_since_checkpoint = 0usize;

        loop {
            // Pause wins over a chunk that is already waiting.
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                event = stream.next() => event,
            };

            match event {
                None => return StreamEnd::Completed,
                Some(StreamEvent::Delta(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    self.append(&delta);
                    chunks_since_checkpoint += 1;
                    if self.settings.checkpoint_every > 0
                        && chunks_since_checkpoint >= self.settings.checkpoint_every
                    {
                        chunks_since_checkpoint = 0;
                        self.checkpoint();
                    }
                }
                Some(StreamEvent::Usage(usage)) => self.reported_usage = Some(usage),
                Some(StreamEvent::Error(error)) => return StreamEnd::Failed(error),
            }
        }
    }

    fn append(&mut self, delta: &str) {
        self.content.push_str(delta);
        let topic_id = &self.plan.topic_id;
        match self
            .store
            .append_content(topic_id, &self.plan.message_id, delta)
        {
            Ok(()) => self.bus.publish(
                topic_id,
                TopicEvent::ChunkAppended {
                    message_id: self.plan.message_id.clone(),
                    delta: delta.to_string(),
                },
            ),
            // The local buffer still holds the text; the final commit fails
            // the same way and is logged there.
            Err(err) => debug!(%topic_id, error = %err, "dropping streamed chunk"),
        }
    }

    fn checkpoint(&self) {
        match self.store.flush(&self.plan.topic_id) {
            Ok(commit) => publish_commit(self.bus.as_ref(), &self.plan.topic_id, &commit),
            Err(err) => debug!(topic_id = %self.plan.topic_id, error = %err, "checkpoint skipped"),
        }
    }

    fn transition(&self, patch: MessagePatch) -> Result<Commit, StoreError> {
        let status = patch.status;
        let commit = self
            .store
            .update_one(&self.plan.topic_id, &self.plan.message_id, patch)?;
        publish_commit(self.bus.as_ref(), &self.plan.topic_id, &commit);
        if let Some(status) = status {
            self.bus.publish(
                &self.plan.topic_id,
                TopicEvent::MessageUpdated {
                    message_id: self.plan.message_id.clone(),
                    status,
                },
            );
        }
        Ok(commit)
    }

    fn finish(self, end: StreamEnd) -> SessionOutcome {
        let (status, usage, error) = match end {
            StreamEnd::Completed => {
                let usage = self.reported_usage.unwrap_or_else(|| {
                    self.estimator.estimate_usage(
                        self.plan.prompt_parts.iter().map(String::as_str),
                        &self.content,
                    )
                });
                (MessageStatus::Success, Some(usage), None)
            }
            StreamEnd::Cancelled => (MessageStatus::Paused, None, None),
            StreamEnd::Failed(error) => (MessageStatus::Error, None, Some(error)),
        };

        let mut patch = MessagePatch::status(status).with_content(self.content.clone());
        if let Some(usage) = usage {
            patch = patch.with_usage(usage);
        }
        if let Some(error) = &error {
            patch = patch.with_error(error.clone());
        }

        if let Err(err) = self.transition(patch) {
            warn!(topic_id = %self.plan.topic_id, message_id = %self.plan.message_id, error = %err, "failed to record session result");
        }

        match status {
            MessageStatus::Error => {
                warn!(topic_id = %self.plan.topic_id, message_id = %self.plan.message_id, error = error.as_deref().unwrap_or_default(), "completion failed")
            }
            _ => {
                info!(topic_id = %self.plan.topic_id, message_id = %self.plan.message_id, status = status.as_str(), chars = self.content.len(), "session finished")
            }
        }

        self.bus.publish(
            &self.plan.topic_id,
            TopicEvent::SessionFinished {
                message_id: self.plan.message_id.clone(),
                status,
            },
        );

        SessionOutcome {
            message_id: self.plan.message_id,
            status,
            content: self.content,
            usage,
            error,
        }
    }
}
