use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::message::{Message, TopicId};
use crate::core::persistence::{MemoryPersistence, PersistenceAdapter, PersistenceError};
use crate::core::provider::{
    CompletionRequest, CompletionStream, ProviderClient, ProviderError, StreamEvent,
};

/// In-memory persistence that can be told to fail every call or to make
/// saves slow.
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    inner: MemoryPersistence,
    failing: AtomicBool,
    save_delay: Mutex<Duration>,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Block each later `save` for `delay`.
    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn saved(&self, topic_id: &str) -> Option<Vec<Message>> {
        self.inner.load(topic_id).ok().flatten()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("disk unplugged".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PersistenceAdapter for FlakyPersistence {
    fn load(&self, topic_id: &str) -> Result<Option<Vec<Message>>, PersistenceError> {
        self.check()?;
        self.inner.load(topic_id)
    }

    fn save(&self, topic_id: &str, messages: &[Message]) -> Result<(), PersistenceError> {
        self.check()?;
        let delay = *self.save_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.inner.save(topic_id, messages)
    }

    fn remove(&self, topic_id: &str) -> Result<(), PersistenceError> {
        self.check()?;
        self.inner.remove(topic_id)
    }

    fn topic_ids(&self) -> Result<Vec<TopicId>, PersistenceError> {
        self.check()?;
        self.inner.topic_ids()
    }
}

enum Script {
    Events(Vec<StreamEvent>),
    Feed(mpsc::UnboundedReceiver<StreamEvent>),
}

/// Provider that answers each request with the next queued script and
/// remembers every request it saw. Requests beyond the queue get an empty
/// stream.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// One response made of the given text chunks.
    pub fn immediate<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_events(
            chunks
                .into_iter()
                .map(|chunk| StreamEvent::Delta(chunk.into()))
                .collect(),
        )
    }

    pub fn with_events(events: Vec<StreamEvent>) -> Self {
        let provider = Self::new();
        provider.push_events(events);
        provider
    }

    /// One response whose events are released through the returned sender.
    /// Dropping the sender ends the stream.
    pub fn manual() -> (Self, mpsc::UnboundedSender<StreamEvent>) {
        let provider = Self::new();
        let feed = provider.push_manual();
        (provider, feed)
    }

    pub fn push_events(&self, events: Vec<StreamEvent>) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Script::Events(events));
    }

    pub fn push_manual(&self) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(Script::Feed(rx));
        tx
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        self.requests.lock().expect("requests lock").push(request);
        let script = self.scripts.lock().expect("scripts lock").pop_front();
        Ok(match script {
            Some(Script::Events(events)) => futures_util::stream::iter(events).boxed(),
            Some(Script::Feed(rx)) => {
                futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|event| (event, rx))
                })
                .boxed()
            }
            None => futures_util::stream::empty().boxed(),
        })
    }
}

/// Provider whose connection attempt always fails.
pub struct FailingProvider {
    reason: String,
}

impl FailingProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ProviderClient for FailingProvider {
    async fn stream_completion(
        &self,
        _request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        Err(ProviderError::Transport(self.reason.clone()))
    }
}
