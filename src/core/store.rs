//! Per-topic message lists, the single source of truth for a conversation.
//!
//! Every operation on a topic runs under one lock, so commits for that topic
//! are applied and persisted in the order they were issued. Writes always land
//! in memory first; a failing [`PersistenceAdapter`] only downgrades the result
//! to [`Commit::InMemoryOnly`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::core::message::{Message, MessageId, MessagePatch, TopicId};
use crate::core::persistence::{PersistenceAdapter, PersistenceError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("topic {0} not found")]
    TopicNotFound(TopicId),

    #[error("topic {0} already exists")]
    TopicExists(TopicId),

    #[error("message {message_id} not found in topic {topic_id}")]
    MessageNotFound {
        topic_id: TopicId,
        message_id: MessageId,
    },

    #[error("message {0} appears more than once")]
    DuplicateMessage(MessageId),

    #[error("message {0} is finished and can no longer change")]
    Frozen(MessageId),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Durability of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    Durable,
    /// Applied in memory; the backing store refused it. Memory stays
    /// authoritative until a later write succeeds.
    InMemoryOnly { reason: String },
}

impl Commit {
    pub fn is_durable(&self) -> bool {
        matches!(self, Commit::Durable)
    }
}

#[derive(Debug, Default)]
struct TopicMessages {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
    /// In-memory changes not yet handed to persistence.
    dirty: bool,
}

impl TopicMessages {
    fn from_messages(messages: Vec<Message>) -> Result<Self, StoreError> {
        let mut index = HashMap::with_capacity(messages.len());
        for (position, message) in messages.iter().enumerate() {
            if index.insert(message.id.clone(), position).is_some() {
                return Err(StoreError::DuplicateMessage(message.id.clone()));
            }
        }
        Ok(Self {
            messages,
            index,
            dirty: false,
        })
    }

    fn get_mut(&mut self, topic_id: &str, message_id: &str) -> Result<&mut Message, StoreError> {
        let position = *self
            .index
            .get(message_id)
            .ok_or_else(|| StoreError::MessageNotFound {
                topic_id: topic_id.to_string(),
                message_id: message_id.to_string(),
            })?;
        Ok(&mut self.messages[position])
    }
}

pub struct MessageStore {
    topics: Mutex<HashMap<TopicId, TopicMessages>>,
    persistence: Arc<dyn PersistenceAdapter>,
    degraded: AtomicBool,
}

impl MessageStore {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            persistence,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.persistence
    }

    /// True while the last persistence attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TopicId, TopicMessages>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, topic_id: &str, entry: &mut TopicMessages) -> Commit {
        match self.persistence.save(topic_id, &entry.messages) {
            Ok(()) => {
                entry.dirty = false;
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(topic_id, "message persistence recovered");
                }
                Commit::Durable
            }
            Err(err) => {
                entry.dirty = true;
                self.degraded.store(true, Ordering::Release);
                warn!(topic_id, error = %err, "message persistence failed; keeping changes in memory");
                Commit::InMemoryOnly {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn contains_topic(&self, topic_id: &str) -> bool {
        self.lock().contains_key(topic_id)
    }

    pub fn create_topic(
        &self,
        topic_id: &str,
        messages: Vec<Message>,
    ) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        if topics.contains_key(topic_id) {
            return Err(StoreError::TopicExists(topic_id.to_string()));
        }
        let mut entry = TopicMessages::from_messages(messages)?;
        let commit = self.persist(topic_id, &mut entry);
        topics.insert(topic_id.to_string(), entry);
        debug!(topic_id, "topic created");
        Ok(commit)
    }

    /// Load a topic from persistence unless it is already open.
    pub fn open_topic(&self, topic_id: &str) -> Result<(), StoreError> {
        let mut topics = self.lock();
        if topics.contains_key(topic_id) {
            return Ok(());
        }
        let messages = self
            .persistence
            .load(topic_id)?
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        topics.insert(topic_id.to_string(), TopicMessages::from_messages(messages)?);
        Ok(())
    }

    pub fn remove_topic(&self, topic_id: &str) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        if topics.remove(topic_id).is_none() {
            return Err(StoreError::TopicNotFound(topic_id.to_string()));
        }
        match self.persistence.remove(topic_id) {
            Ok(()) => Ok(Commit::Durable),
            Err(err) => {
                warn!(topic_id, error = %err, "failed to remove persisted topic");
                Ok(Commit::InMemoryOnly {
                    reason: err.to_string(),
                })
            }
        }
    }

    pub fn get_all(&self, topic_id: &str) -> Result<Vec<Message>, StoreError> {
        self.lock()
            .get(topic_id)
            .map(|entry| entry.messages.clone())
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))
    }

    pub fn get_one(&self, topic_id: &str, message_id: &str) -> Result<Message, StoreError> {
        let topics = self.lock();
        let entry = topics
            .get(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        entry
            .index
            .get(message_id)
            .map(|&position| entry.messages[position].clone())
            .ok_or_else(|| StoreError::MessageNotFound {
                topic_id: topic_id.to_string(),
                message_id: message_id.to_string(),
            })
    }

    /// Atomically swap the whole list for a topic.
    pub fn replace_all(&self, topic_id: &str, messages: Vec<Message>) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        let slot = topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        // Validate before touching the live entry.
        let mut entry = TopicMessages::from_messages(messages)?;
        let commit = self.persist(topic_id, &mut entry);
        *slot = entry;
        Ok(commit)
    }

    /// Append a message at the end of the topic. Used for placeholders as well
    /// as finished user messages and context breaks.
    pub fn append_placeholder(&self, topic_id: &str, message: Message) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        let entry = topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        if entry.index.contains_key(&message.id) {
            return Err(StoreError::DuplicateMessage(message.id));
        }
        entry.index.insert(message.id.clone(), entry.messages.len());
        entry.messages.push(message);
        Ok(self.persist(topic_id, entry))
    }

    pub fn update_one(
        &self,
        topic_id: &str,
        message_id: &str,
        patch: MessagePatch,
    ) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        let entry = topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        let message = entry.get_mut(topic_id, message_id)?;
        if message.is_terminal() && patch.touches_content_or_status() && !patch.reopen {
            return Err(StoreError::Frozen(message_id.to_string()));
        }
        patch.apply(message);
        Ok(self.persist(topic_id, entry))
    }

    /// Append streamed text to an in-flight message without persisting it.
    /// The next [`Self::update_one`] or [`Self::flush`] makes it durable.
    pub fn append_content(
        &self,
        topic_id: &str,
        message_id: &str,
        delta: &str,
    ) -> Result<(), StoreError> {
        let mut topics = self.lock();
        let entry = topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        let message = entry.get_mut(topic_id, message_id)?;
        if message.is_terminal() {
            return Err(StoreError::Frozen(message_id.to_string()));
        }
        message.content.push_str(delta);
        entry.dirty = true;
        Ok(())
    }

    /// Persist pending in-memory changes for a topic, if any.
    pub fn flush(&self, topic_id: &str) -> Result<Commit, StoreError> {
        let mut topics = self.lock();
        let entry = topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound(topic_id.to_string()))?;
        if !entry.dirty {
            return Ok(Commit::Durable);
        }
        Ok(self.persist(topic_id, entry))
    }
}
