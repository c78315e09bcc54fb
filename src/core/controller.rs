//! Entry point for user intents on one topic.
//!
//! The controller validates requests, writes the user turn and reply
//! placeholder, and hands the exchange to a [`CompletionSession`] running on
//! its own task. At most one session is active per topic, tracked in a
//! [`SessionRegistry`] shared by every controller over the same store; the
//! entry is reserved synchronously so two racing sends cannot both start.
//!
//! Starting a session spawns a task, so `send`, `resend` and
//! `edit_and_resend` must be called from within a Tokio runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::context::ContextSelector;
use crate::core::events::{publish_commit, NotificationBus, TopicEvent};
use crate::core::library::{welcome_message, Assistant};
use crate::core::message::{
    Attachment, Message, MessageId, MessagePatch, MessageStatus, Role, TopicId, Usage,
};
use crate::core::provider::{CompletionRequest, PromptMessage, PromptRole, ProviderClient};
use crate::core::session::{CompletionSession, SessionPlan, SessionSettings};
use crate::core::store::{Commit, MessageStore, StoreError};
use crate::core::tokens::TokenEstimator;

pub const DEFAULT_PAUSE_GRACE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("a reply is still being generated")]
    SessionActive,

    #[error("message {0} not found")]
    UnknownMessage(MessageId),

    #[error("message {0} has not finished yet")]
    NotTerminal(MessageId),

    #[error("message {0} cannot be resent")]
    NotResendable(MessageId),

    #[error("topic {0} is not available")]
    TopicUnavailable(TopicId),
}

/// Input-box diagnostics for text that has not been sent yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEstimate {
    pub input_tokens: u32,
    /// History messages the next request would carry.
    pub context_count: usize,
    pub history_tokens: u32,
}

/// Ids of a started exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    pub stream_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearContext {
    Appended(MessageId),
    /// A reply was streaming; it was paused and no marker was written.
    PausedActiveSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub checkpoint_every: usize,
    /// How long `clear_messages` waits for a paused session to settle.
    pub pause_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: 0,
            pause_grace: DEFAULT_PAUSE_GRACE,
        }
    }
}

#[derive(Clone)]
pub struct ControllerDeps {
    pub store: Arc<MessageStore>,
    pub provider: Arc<dyn ProviderClient>,
    pub bus: Arc<dyn NotificationBus>,
    /// Must be shared by every controller over `store`.
    pub sessions: SessionRegistry,
    /// Used when the assistant does not name a model.
    pub default_model: String,
    pub stream: StreamSettings,
}

struct ActiveSession {
    stream_id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct ActiveSessions {
    next_stream_id: u64,
    by_topic: HashMap<TopicId, ActiveSession>,
}

impl ActiveSessions {
    fn is_active(&self, topic_id: &str) -> bool {
        self.by_topic.contains_key(topic_id)
    }
}

/// Sessions currently streaming, keyed by topic.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<ActiveSessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, topic_id: &str) -> bool {
        self.lock().is_active(topic_id)
    }

    fn lock(&self) -> MutexGuard<'_, ActiveSessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `topic_id` if `stream_id` still owns it.
    fn release(&self, topic_id: &str, stream_id: u64) {
        let mut sessions = self.lock();
        if sessions
            .by_topic
            .get(topic_id)
            .is_some_and(|active| active.stream_id == stream_id)
        {
            sessions.by_topic.remove(topic_id);
        }
    }
}

/// A session reserved under the slot lock, started once the lock is gone.
struct Prepared {
    turn: Turn,
    events: Vec<TopicEvent>,
    session: CompletionSession,
    done: watch::Sender<bool>,
}

fn note_commit(events: &mut Vec<TopicEvent>, commit: Commit) {
    if let Commit::InMemoryOnly { reason } = commit {
        events.push(TopicEvent::PersistenceDegraded { reason });
    }
}

pub struct ConversationController {
    topic_id: TopicId,
    assistant: Assistant,
    model: String,
    store: Arc<MessageStore>,
    provider: Arc<dyn ProviderClient>,
    bus: Arc<dyn NotificationBus>,
    selector: ContextSelector,
    estimator: TokenEstimator,
    stream: StreamSettings,
    sessions: SessionRegistry,
}

impl ConversationController {
    pub fn new(topic_id: &str, assistant: Assistant, deps: ControllerDeps) -> Self {
        let model = assistant
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(deps.default_model);
        Self {
            topic_id: topic_id.to_string(),
            assistant,
            model,
            store: deps.store,
            provider: deps.provider,
            bus: deps.bus,
            selector: ContextSelector::new(),
            estimator: TokenEstimator::new(),
            stream: deps.stream,
            sessions: deps.sessions,
        }
    }

    /// Load the topic (creating it with a welcome message if it was never
    /// saved) and build a controller for it.
    ///
    /// Replies left `pending` or `sending` by an interrupted run are settled
    /// as `paused` with their content kept, unless a session on this topic is
    /// still streaming.
    pub fn open(
        topic_id: &str,
        assistant: Assistant,
        deps: ControllerDeps,
    ) -> Result<Self, StoreError> {
        match deps.store.open_topic(topic_id) {
            Ok(()) => {
                let sessions = deps.sessions.lock();
                if !sessions.is_active(topic_id) {
                    settle_interrupted(&deps.store, deps.bus.as_ref(), topic_id)?;
                }
            }
            Err(StoreError::TopicNotFound(_)) => {
                let commit = deps
                    .store
                    .create_topic(topic_id, vec![welcome_message(topic_id, &assistant.id)])?;
                if !commit.is_durable() {
                    warn!(topic_id, "new topic kept in memory only");
                }
            }
            Err(err) => return Err(err),
        }
        Ok(Self::new(topic_id, assistant, deps))
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub fn assistant(&self) -> &Assistant {
        &self.assistant
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.get_all(&self.topic_id).unwrap_or_default()
    }

    /// True while any controller streams a reply on this topic.
    pub fn is_generating(&self) -> bool {
        self.sessions.is_active(&self.topic_id)
    }

    fn slot(&self) -> MutexGuard<'_, ActiveSessions> {
        self.sessions.lock()
    }

    fn unavailable(&self) -> ValidationError {
        ValidationError::TopicUnavailable(self.topic_id.clone())
    }

    fn reject(&self, err: ValidationError) -> ValidationError {
        debug!(topic_id = %self.topic_id, error = %err, "request rejected");
        self.bus
            .publish(&self.topic_id, TopicEvent::Rejected(err.clone()));
        err
    }

    /// Commit a user turn and start streaming its reply.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn send(&self, raw_text: &str, attachments: Vec<Attachment>) -> Result<Turn, ValidationError> {
        if raw_text.trim().is_empty() {
            return Err(self.reject(ValidationError::EmptyMessage));
        }
        let runtime = Handle::current();
        let prepared = {
            let mut slot = self.slot();
            self.prepare_send(&mut slot, raw_text, attachments)
        };
        self.launch(&runtime, prepared)
    }

    fn prepare_send(
        &self,
        slot: &mut ActiveSessions,
        raw_text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Prepared, ValidationError> {
        if slot.is_active(&self.topic_id) {
            return Err(ValidationError::SessionActive);
        }

        let history: Vec<Message> = self
            .store
            .get_all(&self.topic_id)
            .map_err(|_| self.unavailable())?
            .into_iter()
            .filter(|m| !m.status.is_transient())
            .collect();
        let context = self
            .selector
            .select(&history, self.assistant.settings.context_count);

        let mut user = Message::user(&self.topic_id, &self.assistant.id, raw_text);
        user.attachments = attachments;
        user.status = MessageStatus::Success;
        user.usage = Some(self.user_usage(raw_text));
        let placeholder = Message::assistant_placeholder(
            &self.topic_id,
            &self.assistant.id,
            Some(self.model.clone()),
        );
        let reply_id = placeholder.id.clone();

        let mut events = Vec::new();
        for message in [user.clone(), placeholder] {
            let message_id = message.id.clone();
            let commit = self
                .store
                .append_placeholder(&self.topic_id, message)
                .map_err(|_| self.unavailable())?;
            note_commit(&mut events, commit);
            events.push(TopicEvent::MessageAppended { message_id });
        }

        Ok(self.prepare_session(slot, &user, &reply_id, context, events))
    }

    /// Regenerate a finished reply in place. A user message id targets the
    /// reply that follows it.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn resend(&self, message_id: &str) -> Result<Turn, ValidationError> {
        let runtime = Handle::current();
        let prepared = {
            let mut slot = self.slot();
            self.prepare_resend(&mut slot, message_id, None)
        };
        self.launch(&runtime, prepared)
    }

    /// Replace a user message's text, keeping its id, and regenerate its reply.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn edit_and_resend(&self, message_id: &str, text: &str) -> Result<Turn, ValidationError> {
        if text.trim().is_empty() {
            return Err(self.reject(ValidationError::EmptyMessage));
        }
        let runtime = Handle::current();
        let prepared = {
            let mut slot = self.slot();
            self.prepare_resend(&mut slot, message_id, Some(text))
        };
        self.launch(&runtime, prepared)
    }

    fn prepare_resend(
        &self,
        slot: &mut ActiveSessions,
        target_id: &str,
        edit: Option<&str>,
    ) -> Result<Prepared, ValidationError> {
        if slot.is_active(&self.topic_id) {
            return Err(ValidationError::SessionActive);
        }

        let messages = self
            .store
            .get_all(&self.topic_id)
            .map_err(|_| self.unavailable())?;
        let (user_pos, reply_pos) = resolve_turn(&messages, target_id)?;
        if edit.is_some() && messages[user_pos].id != target_id {
            return Err(ValidationError::NotResendable(target_id.to_string()));
        }
        let reply = &messages[reply_pos];
        if !reply.is_terminal() {
            return Err(ValidationError::NotTerminal(reply.id.clone()));
        }

        let mut events = Vec::new();
        let mut user = messages[user_pos].clone();
        if let Some(text) = edit {
            let patch = MessagePatch::edit(text).with_usage(self.user_usage(text));
            let commit = self
                .store
                .update_one(&self.topic_id, &user.id, patch)
                .map_err(|_| self.unavailable())?;
            note_commit(&mut events, commit);
            user.content = text.to_string();
            events.push(TopicEvent::MessageUpdated {
                message_id: user.id.clone(),
                status: MessageStatus::Success,
            });
        }

        // Same selection `send` made when this turn was first written.
        let history = self
            .selector
            .history_before(&messages, &user.id)
            .unwrap_or_default();
        let context = self
            .selector
            .select(&history, self.assistant.settings.context_count);

        let mut reopen = MessagePatch::reopen(MessageStatus::Pending);
        reopen.model_id = Some(self.model.clone());
        let commit = self
            .store
            .update_one(&self.topic_id, &reply.id, reopen)
            .map_err(|_| self.unavailable())?;
        note_commit(&mut events, commit);
        events.push(TopicEvent::MessageUpdated {
            message_id: reply.id.clone(),
            status: MessageStatus::Pending,
        });

        Ok(self.prepare_session(slot, &user, &reply.id, context, events))
    }

    fn prepare_session(
        &self,
        slot: &mut ActiveSessions,
        user: &Message,
        reply_id: &str,
        context: Vec<Message>,
        events: Vec<TopicEvent>,
    ) -> Prepared {
        let mut messages = Vec::with_capacity(context.len() + 2);
        let mut prompt_parts = Vec::with_capacity(context.len() + 2);
        if !self.assistant.prompt.trim().is_empty() {
            messages.push(PromptMessage::new(PromptRole::System, &self.assistant.prompt));
            prompt_parts.push(self.assistant.prompt.clone());
        }
        for message in &context {
            messages.push(PromptMessage::new(message.role.into(), &message.content));
            prompt_parts.push(message.content.clone());
        }
        messages.push(PromptMessage::new(PromptRole::User, &user.content));
        prompt_parts.push(user.content.clone());

        let settings = self.assistant.settings;
        let plan = SessionPlan {
            topic_id: self.topic_id.clone(),
            message_id: reply_id.to_string(),
            reply_to: user.id.clone(),
            request: CompletionRequest {
                model: self.model.clone(),
                messages,
                temperature: settings.temperature,
                max_tokens: settings.max_tokens_limit(),
            },
            prompt_parts,
        };
        let session = CompletionSession::new(
            plan,
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            SessionSettings {
                checkpoint_every: self.stream.checkpoint_every,
            },
        );

        let (done_tx, done_rx) = watch::channel(false);
        slot.next_stream_id += 1;
        let stream_id = slot.next_stream_id;
        slot.by_topic.insert(
            self.topic_id.clone(),
            ActiveSession {
                stream_id,
                cancel: session.cancel_token(),
                done: done_rx,
            },
        );
        info!(
            topic_id = %self.topic_id,
            stream_id,
            model = %self.model,
            context = context.len(),
            "starting completion"
        );

        Prepared {
            turn: Turn {
                user_message_id: user.id.clone(),
                assistant_message_id: reply_id.to_string(),
                stream_id,
            },
            events,
            session,
            done: done_tx,
        }
    }

    fn launch(
        &self,
        runtime: &Handle,
        prepared: Result<Prepared, ValidationError>,
    ) -> Result<Turn, ValidationError> {
        let Prepared {
            turn,
            events,
            session,
            done,
        } = prepared.map_err(|err| self.reject(err))?;

        for event in events {
            self.bus.publish(&self.topic_id, event);
        }

        let sessions = self.sessions.clone();
        let provider = Arc::clone(&self.provider);
        let topic_id = self.topic_id.clone();
        let stream_id = turn.stream_id;
        runtime.spawn(async move {
            let outcome = session.run(provider).await;
            // A newer session may already own the entry.
            sessions.release(&topic_id, stream_id);
            debug!(stream_id, status = outcome.status.as_str(), "stream settled");
            let _ = done.send(true);
        });

        Ok(turn)
    }

    /// Ask the active session to stop. Returns `false` when nothing streams.
    pub fn pause(&self) -> bool {
        let slot = self.slot();
        match slot.by_topic.get(&self.topic_id) {
            Some(active) => {
                active.cancel.cancel();
                info!(topic_id = %self.topic_id, stream_id = active.stream_id, "pause requested");
                true
            }
            None => false,
        }
    }

    /// Start a fresh context. While a reply streams this only pauses it.
    pub fn clear_context(&self) -> Result<ClearContext, ValidationError> {
        let appended = {
            let slot = self.slot();
            if let Some(active) = slot.by_topic.get(&self.topic_id) {
                active.cancel.cancel();
                info!(topic_id = %self.topic_id, stream_id = active.stream_id, "clear context paused the active reply");
                return Ok(ClearContext::PausedActiveSession);
            }
            let marker = Message::context_break(&self.topic_id, &self.assistant.id);
            let marker_id = marker.id.clone();
            self.store
                .append_placeholder(&self.topic_id, marker)
                .map(|commit| (marker_id, commit))
        };

        let (marker_id, commit) = appended.map_err(|_| self.reject(self.unavailable()))?;
        publish_commit(self.bus.as_ref(), &self.topic_id, &commit);
        self.bus.publish(
            &self.topic_id,
            TopicEvent::MessageAppended {
                message_id: marker_id.clone(),
            },
        );
        debug!(topic_id = %self.topic_id, "context cleared");
        Ok(ClearContext::Appended(marker_id))
    }

    /// Drop every message of the topic and start over from a welcome message.
    /// An active reply is paused first and given `pause_grace` to settle.
    pub async fn clear_messages(&self) -> Result<MessageId, ValidationError> {
        let pending = {
            let slot = self.slot();
            slot.by_topic.get(&self.topic_id).map(|active| {
                active.cancel.cancel();
                active.done.clone()
            })
        };
        if let Some(mut done) = pending {
            let settled = tokio::time::timeout(self.stream.pause_grace, done.wait_for(|d| *d))
                .await
                .is_ok();
            if !settled {
                warn!(topic_id = %self.topic_id, "reply still running while clearing messages");
            }
        }

        let welcome = welcome_message(&self.topic_id, &self.assistant.id);
        let welcome_id = welcome.id.clone();
        let commit = self
            .store
            .replace_all(&self.topic_id, vec![welcome])
            .map_err(|_| self.reject(self.unavailable()))?;
        publish_commit(self.bus.as_ref(), &self.topic_id, &commit);
        self.bus.publish(&self.topic_id, TopicEvent::MessagesReplaced);
        info!(topic_id = %self.topic_id, "messages cleared");
        Ok(welcome_id)
    }

    /// Token diagnostics for `text` against the current history.
    pub fn estimate_input(&self, text: &str) -> InputEstimate {
        let history: Vec<Message> = self
            .messages()
            .into_iter()
            .filter(|m| !m.status.is_transient())
            .collect();
        let budget = self.assistant.settings.context_count;
        let estimate = InputEstimate {
            input_tokens: self.estimator.estimate(Role::User, text),
            context_count: self.selector.effective_context_count(&history, budget),
            history_tokens: self.selector.estimate_history_tokens(
                &self.estimator,
                &self.assistant.prompt,
                &history,
                budget,
            ),
        };
        self.bus
            .publish(&self.topic_id, TopicEvent::TokenEstimate(estimate));
        estimate
    }

    /// Estimated usage recorded on a user message: its text as prompt.
    fn user_usage(&self, text: &str) -> Usage {
        self.estimator.estimate_usage([text], "")
    }

    /// Resolve once no session is active.
    pub async fn wait_idle(&self) {
        let done = self
            .slot()
            .by_topic
            .get(&self.topic_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|d| *d).await;
        }
    }
}

/// Settle replies that were still streaming when the topic was last saved.
fn settle_interrupted(
    store: &MessageStore,
    bus: &dyn NotificationBus,
    topic_id: &str,
) -> Result<(), StoreError> {
    let stranded: Vec<MessageId> = store
        .get_all(topic_id)?
        .into_iter()
        .filter(|m| m.is_assistant() && m.status.is_transient())
        .map(|m| m.id)
        .collect();
    for message_id in stranded {
        let commit = store.update_one(
            topic_id,
            &message_id,
            MessagePatch::status(MessageStatus::Paused),
        )?;
        publish_commit(bus, topic_id, &commit);
        bus.publish(
            topic_id,
            TopicEvent::MessageUpdated {
                message_id: message_id.clone(),
                status: MessageStatus::Paused,
            },
        );
        info!(topic_id, %message_id, "settled interrupted reply as paused");
    }
    Ok(())
}

/// Positions of the user message and its reply for a resend target.
fn resolve_turn(messages: &[Message], target_id: &str) -> Result<(usize, usize), ValidationError> {
    let not_resendable = || ValidationError::NotResendable(target_id.to_string());
    let position = messages
        .iter()
        .position(|m| m.id == target_id)
        .ok_or_else(|| ValidationError::UnknownMessage(target_id.to_string()))?;
    let target = &messages[position];
    if target.is_context_break() {
        return Err(not_resendable());
    }

    let is_turn = |m: &Message| m.is_user() && !m.is_context_break();
    if target.is_user() {
        match messages.get(position + 1) {
            Some(next) if next.is_assistant() => Ok((position, position + 1)),
            _ => Err(not_resendable()),
        }
    } else {
        match position.checked_sub(1) {
            Some(previous) if is_turn(&messages[previous]) => Ok((previous, position)),
            _ => Err(not_resendable()),
        }
    }
}
