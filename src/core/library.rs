//! Assistants and the topics they own.
//!
//! Messages live in the [`MessageStore`]; the library keeps the metadata that
//! ties a topic to its assistant, plus an optional JSON index so topic names
//! survive restarts.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::message::{new_id, AssistantId, Message, TopicId};
use crate::core::persistence::PersistenceError;
use crate::core::store::{Commit, MessageStore, StoreError};

pub const DEFAULT_CONTEXT_COUNT: usize = 5;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TOPIC_NAME: &str = "Default Topic";
pub const WELCOME_MESSAGE: &str = "Hello! How can I help you today?";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantSettings {
    pub context_count: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub enable_max_tokens: bool,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            context_count: DEFAULT_CONTEXT_COUNT,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            enable_max_tokens: false,
        }
    }
}

impl AssistantSettings {
    /// The `max_tokens` to send, if the limit is switched on.
    pub fn max_tokens_limit(&self) -> Option<u32> {
        self.enable_max_tokens.then_some(self.max_tokens)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assistant {
    pub id: AssistantId,
    pub name: String,
    /// System instruction sent ahead of every request. May be empty.
    pub prompt: String,
    pub model: Option<String>,
    pub settings: AssistantSettings,
    /// Owned topics, oldest first.
    pub topics: Vec<TopicId>,
}

impl Assistant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prompt: prompt.into(),
            model: None,
            settings: AssistantSettings::default(),
            topics: Vec::new(),
        }
    }

    pub fn default_assistant() -> Self {
        Self::new("default", "Default Assistant", "")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub assistant_id: AssistantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Topic {
    pub fn new(assistant_id: &str, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            assistant_id: assistant_id.to_string(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The greeting every topic starts with.
pub fn welcome_message(topic_id: &str, assistant_id: &str) -> Message {
    Message::assistant_text(topic_id, assistant_id, WELCOME_MESSAGE)
}

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("assistant {0} not found")]
    AssistantNotFound(AssistantId),

    #[error("topic {0} not found")]
    TopicNotFound(TopicId),

    #[error("failed to access topic index {path}: {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topic index {path}: {source}")]
    IndexFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TopicIndex {
    #[serde(default)]
    topics: Vec<Topic>,
}

pub struct Library {
    assistants: Vec<Assistant>,
    topics: HashMap<TopicId, Topic>,
    store: Arc<MessageStore>,
    index_path: Option<PathBuf>,
}

impl Library {
    pub fn new(store: Arc<MessageStore>, assistants: Vec<Assistant>) -> Self {
        let assistants = if assistants.is_empty() {
            vec![Assistant::default_assistant()]
        } else {
            assistants
        };
        Self {
            assistants,
            topics: HashMap::new(),
            store,
            index_path: None,
        }
    }

    /// Build a library backed by a topic index file. A missing file is an
    /// empty index; topics of unknown assistants are skipped.
    pub fn load(
        store: Arc<MessageStore>,
        assistants: Vec<Assistant>,
        index_path: impl Into<PathBuf>,
    ) -> Result<Self, LibraryError> {
        let index_path = index_path.into();
        let mut library = Self::new(store, assistants);

        let index = match fs::read_to_string(&index_path) {
            Ok(contents) => serde_json::from_str::<TopicIndex>(&contents).map_err(|source| {
                LibraryError::IndexFormat {
                    path: index_path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TopicIndex::default(),
            Err(source) => {
                return Err(LibraryError::Index {
                    path: index_path,
                    source,
                })
            }
        };

        for topic in index.topics {
            match library.assistant_mut(&topic.assistant_id) {
                Some(assistant) => {
                    assistant.topics.push(topic.id.clone());
                    library.topics.insert(topic.id.clone(), topic);
                }
                None => {
                    warn!(topic_id = %topic.id, assistant_id = %topic.assistant_id, "skipping topic of unknown assistant")
                }
            }
        }

        library.index_path = Some(index_path);
        Ok(library)
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn assistants(&self) -> &[Assistant] {
        &self.assistants
    }

    pub fn assistant(&self, assistant_id: &str) -> Option<&Assistant> {
        self.assistants.iter().find(|a| a.id == assistant_id)
    }

    fn assistant_mut(&mut self, assistant_id: &str) -> Option<&mut Assistant> {
        self.assistants.iter_mut().find(|a| a.id == assistant_id)
    }

    pub fn topic(&self, topic_id: &str) -> Option<&Topic> {
        self.topics.get(topic_id)
    }

    /// Topics of one assistant, oldest first.
    pub fn topics(&self, assistant_id: &str) -> Vec<&Topic> {
        self.assistant(assistant_id)
            .map(|assistant| {
                assistant
                    .topics
                    .iter()
                    .filter_map(|id| self.topics.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create a topic seeded with the welcome message.
    pub fn add_topic(&mut self, assistant_id: &str, name: &str) -> Result<Topic, LibraryError> {
        if self.assistant(assistant_id).is_none() {
            return Err(LibraryError::AssistantNotFound(assistant_id.to_string()));
        }
        let name = if name.trim().is_empty() {
            DEFAULT_TOPIC_NAME
        } else {
            name.trim()
        };
        let topic = Topic::new(assistant_id, name);
        let commit = self
            .store
            .create_topic(&topic.id, vec![welcome_message(&topic.id, assistant_id)])?;
        if !commit.is_durable() {
            warn!(topic_id = %topic.id, "new topic kept in memory only");
        }
        self.attach_topic(topic.clone())?;
        debug!(topic_id = %topic.id, assistant_id, "topic added");
        Ok(topic)
    }

    /// Register metadata for a topic whose messages already exist.
    pub fn attach_topic(&mut self, topic: Topic) -> Result<(), LibraryError> {
        let assistant = self
            .assistant_mut(&topic.assistant_id)
            .ok_or_else(|| LibraryError::AssistantNotFound(topic.assistant_id.clone()))?;
        if !assistant.topics.contains(&topic.id) {
            assistant.topics.push(topic.id.clone());
        }
        self.topics.insert(topic.id.clone(), topic);
        self.save_index()
    }

    pub fn touch_topic(&mut self, topic_id: &str) -> Result<(), LibraryError> {
        let topic = self
            .topics
            .get_mut(topic_id)
            .ok_or_else(|| LibraryError::TopicNotFound(topic_id.to_string()))?;
        topic.updated_at = Utc::now();
        self.save_index()
    }

    pub fn rename_topic(&mut self, topic_id: &str, name: &str) -> Result<(), LibraryError> {
        let topic = self
            .topics
            .get_mut(topic_id)
            .ok_or_else(|| LibraryError::TopicNotFound(topic_id.to_string()))?;
        topic.name = name.to_string();
        topic.updated_at = Utc::now();
        self.save_index()
    }

    /// Remove a topic and its messages. The metadata is kept when the
    /// messages could not be removed, so the delete can be retried.
    pub fn delete_topic(&mut self, topic_id: &str) -> Result<(), LibraryError> {
        if !self.topics.contains_key(topic_id) {
            return Err(LibraryError::TopicNotFound(topic_id.to_string()));
        }
        self.remove_messages(topic_id)?;
        self.forget_topic(topic_id);
        debug!(topic_id, "topic deleted");
        self.save_index()
    }

    /// Remove an assistant together with all of its topics.
    ///
    /// Stops at the first topic whose messages cannot be removed. Topics
    /// removed before that stay removed; the assistant and the rest remain.
    pub fn delete_assistant(&mut self, assistant_id: &str) -> Result<Assistant, LibraryError> {
        let topic_ids = self
            .assistant(assistant_id)
            .map(|assistant| assistant.topics.clone())
            .ok_or_else(|| LibraryError::AssistantNotFound(assistant_id.to_string()))?;
        for topic_id in &topic_ids {
            if let Err(err) = self.remove_messages(topic_id) {
                warn!(assistant_id, %topic_id, error = %err, "assistant delete stopped");
                if let Err(index_err) = self.save_index() {
                    warn!(error = %index_err, "failed to save topic index");
                }
                return Err(err);
            }
            self.forget_topic(topic_id);
        }

        let position = self
            .assistants
            .iter()
            .position(|a| a.id == assistant_id)
            .ok_or_else(|| LibraryError::AssistantNotFound(assistant_id.to_string()))?;
        let mut assistant = self.assistants.remove(position);
        assistant.topics = topic_ids;
        debug!(assistant_id, topics = assistant.topics.len(), "assistant deleted");
        self.save_index()?;
        Ok(assistant)
    }

    fn forget_topic(&mut self, topic_id: &str) {
        if let Some(topic) = self.topics.remove(topic_id) {
            if let Some(assistant) = self.assistant_mut(&topic.assistant_id) {
                assistant.topics.retain(|id| id != topic_id);
            }
        }
    }

    /// Remove a topic's messages from memory and disk. Fails unless the
    /// persisted copy is gone.
    fn remove_messages(&self, topic_id: &str) -> Result<(), LibraryError> {
        if self.store.contains_topic(topic_id) {
            if let Commit::InMemoryOnly { reason } = self.store.remove_topic(topic_id)? {
                return Err(PersistenceError::Unavailable(reason).into());
            }
        } else {
            self.store.persistence().remove(topic_id)?;
        }
        Ok(())
    }

    fn save_index(&self) -> Result<(), LibraryError> {
        let Some(path) = &self.index_path else {
            return Ok(());
        };
        let mut topics: Vec<Topic> = self.topics.values().cloned().collect();
        topics.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        write_index(path, &TopicIndex { topics })
    }
}

fn write_index(path: &Path, index: &TopicIndex) -> Result<(), LibraryError> {
    let io_err = |source| LibraryError::Index {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let contents = serde_json::to_vec_pretty(index).map_err(|source| LibraryError::IndexFormat {
        path: path.to_path_buf(),
        source,
    })?;
    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(io_err)?;
    temp_file.write_all(&contents).map_err(io_err)?;
    temp_file.as_file_mut().sync_all().map_err(io_err)?;
    temp_file.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}
