//! Durable backing for [`crate::core::store::MessageStore`].
//!
//! Adapters map a topic id to its ordered message list and only ever replace
//! that list as a whole.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::message::{Message, TopicId};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode topic {topic_id}: {source}")]
    Encode {
        topic_id: TopicId,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid topic id {0:?}")]
    InvalidTopicId(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub trait PersistenceAdapter: Send + Sync {
    /// `Ok(None)` when nothing was ever saved for the topic.
    fn load(&self, topic_id: &str) -> Result<Option<Vec<Message>>, PersistenceError>;

    /// Replace the whole list atomically. Readers see the old list or the new
    /// one, never a mix.
    fn save(&self, topic_id: &str, messages: &[Message]) -> Result<(), PersistenceError>;

    fn remove(&self, topic_id: &str) -> Result<(), PersistenceError>;

    fn topic_ids(&self) -> Result<Vec<TopicId>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    topics: Mutex<HashMap<TopicId, Vec<Message>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn load(&self, topic_id: &str) -> Result<Option<Vec<Message>>, PersistenceError> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(topics.get(topic_id).cloned())
    }

    fn save(&self, topic_id: &str, messages: &[Message]) -> Result<(), PersistenceError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.insert(topic_id.to_string(), messages.to_vec());
        Ok(())
    }

    fn remove(&self, topic_id: &str) -> Result<(), PersistenceError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.remove(topic_id);
        Ok(())
    }

    fn topic_ids(&self) -> Result<Vec<TopicId>, PersistenceError> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<TopicId> = topics.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

const TOPIC_FILE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct TopicFile {
    version: u32,
    topic_id: TopicId,
    messages: Vec<Message>,
}

/// One pretty-printed JSON file per topic inside a directory.
#[derive(Debug, Clone)]
pub struct JsonDirPersistence {
    dir: PathBuf,
}

impl JsonDirPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn topic_path(&self, topic_id: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !topic_id.is_empty()
            && topic_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistenceError::InvalidTopicId(topic_id.to_string()));
        }
        Ok(self.dir.join(format!("{topic_id}.json")))
    }

    fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl PersistenceAdapter for JsonDirPersistence {
    fn load(&self, topic_id: &str) -> Result<Option<Vec<Message>>, PersistenceError> {
        let path = self.topic_path(topic_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&path, err)),
        };
        let file: TopicFile = serde_json::from_str(&contents)
            .map_err(|source| PersistenceError::Decode { path, source })?;
        Ok(Some(file.messages))
    }

    fn save(&self, topic_id: &str, messages: &[Message]) -> Result<(), PersistenceError> {
        let path = self.topic_path(topic_id)?;
        fs::create_dir_all(&self.dir).map_err(|err| Self::io_error(&self.dir, err))?;

        let file = TopicFile {
            version: TOPIC_FILE_VERSION,
            topic_id: topic_id.to_string(),
            messages: messages.to_vec(),
        };
        let contents =
            serde_json::to_vec_pretty(&file).map_err(|source| PersistenceError::Encode {
                topic_id: topic_id.to_string(),
                source,
            })?;

        // Same directory as the target so the rename stays atomic.
        let mut temp_file =
            NamedTempFile::new_in(&self.dir).map_err(|err| Self::io_error(&self.dir, err))?;
        temp_file
            .write_all(&contents)
            .map_err(|err| Self::io_error(temp_file.path(), err))?;
        temp_file
            .as_file_mut()
            .sync_all()
            .map_err(|err| Self::io_error(&path, err))?;
        temp_file
            .persist(&path)
            .map_err(|err| Self::io_error(&path, err.error))?;
        Ok(())
    }

    fn remove(&self, topic_id: &str) -> Result<(), PersistenceError> {
        let path = self.topic_path(topic_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&path, err)),
        }
    }

    fn topic_ids(&self) -> Result<Vec<TopicId>, PersistenceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_error(&self.dir, err)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Self::io_error(&self.dir, err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(topic_id: &str) -> Vec<Message> {
        vec![
            Message::assistant_text(topic_id, "a", "welcome"),
            Message::context_break(topic_id, "a"),
        ]
    }

    #[test]
    fn json_dir_round_trips_a_topic() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence = JsonDirPersistence::new(temp_dir.path().join("topics"));

        assert!(persistence.load("topic-1").expect("load").is_none());

        let messages = sample("topic-1");
        persistence.save("topic-1", &messages).expect("save");

        let loaded = persistence.load("topic-1").expect("load").expect("present");
        assert_eq!(loaded, messages);
        assert_eq!(persistence.topic_ids().expect("ids"), vec!["topic-1"]);
    }

    #[test]
    fn json_dir_save_replaces_previous_list() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence = JsonDirPersistence::new(temp_dir.path());

        persistence.save("t", &sample("t")).expect("first save");
        let shorter = vec![Message::assistant_text("t", "a", "only")];
        persistence.save("t", &shorter).expect("second save");

        assert_eq!(persistence.load("t").expect("load"), Some(shorter));
    }

    #[test]
    fn json_dir_rejects_path_like_ids() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence = JsonDirPersistence::new(temp_dir.path());

        let err = persistence.save("../escape", &[]).expect_err("should reject");
        assert!(matches!(err, PersistenceError::InvalidTopicId(_)));
    }

    #[test]
    fn json_dir_remove_is_idempotent() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence = JsonDirPersistence::new(temp_dir.path());

        persistence.save("t", &sample("t")).expect("save");
        persistence.remove("t").expect("remove");
        persistence.remove("t").expect("remove again");
        assert!(persistence.load("t").expect("load").is_none());
    }

    #[test]
    fn json_dir_reports_corrupt_files() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::write(temp_dir.path().join("bad.json"), "{not json").expect("write");
        let persistence = JsonDirPersistence::new(temp_dir.path());

        let err = persistence.load("bad").expect_err("should fail");
        assert!(matches!(err, PersistenceError::Decode { .. }));
    }

    #[test]
    fn missing_directory_lists_no_topics() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence = JsonDirPersistence::new(temp_dir.path().join("absent"));
        assert!(persistence.topic_ids().expect("ids").is_empty());
    }

    #[test]
    fn memory_persistence_lists_sorted_ids() {
        let persistence = MemoryPersistence::new();
        persistence.save("b", &[]).expect("save");
        persistence.save("a", &[]).expect("save");
        assert_eq!(persistence.topic_ids().expect("ids"), vec!["a", "b"]);
    }
}
