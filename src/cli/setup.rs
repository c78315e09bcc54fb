//! Wiring shared by the subcommands: config, storage, provider and the
//! controller for the selected topic.

use std::error::Error;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cli::RunOptions;
use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::core::controller::{ControllerDeps, ConversationController, SessionRegistry};
use crate::core::events::NotificationHub;
use crate::core::library::{Assistant, Library, Topic, DEFAULT_TOPIC_NAME};
use crate::core::persistence::{JsonDirPersistence, PersistenceAdapter};
use crate::core::provider::openai::OpenAiCompatibleClient;
use crate::core::provider::ProviderClient;
use crate::core::store::MessageStore;
use crate::utils::url::is_http_url;

const TOPICS_DIR: &str = "topics";
const TOPIC_INDEX_FILE: &str = "topics.json";

/// Everything loaded from disk for one run.
pub struct Workspace {
    pub config: Config,
    pub library: Library,
    pub hub: NotificationHub,
    pub sessions: SessionRegistry,
}

impl Workspace {
    pub fn open() -> Result<Self, Box<dyn Error>> {
        let config = Config::load()?;
        let data_dir = config.resolve_data_dir()?;
        debug!(data_dir = %path_display(&data_dir), "opening workspace");

        let persistence: Arc<dyn PersistenceAdapter> =
            Arc::new(JsonDirPersistence::new(data_dir.join(TOPICS_DIR)));
        Self::with_persistence(config, persistence, Some(data_dir.join(TOPIC_INDEX_FILE)))
    }

    /// Build a workspace over any persistence. Without an index path the
    /// topic list lives only in memory.
    pub fn with_persistence(
        config: Config,
        persistence: Arc<dyn PersistenceAdapter>,
        index_path: Option<std::path::PathBuf>,
    ) -> Result<Self, Box<dyn Error>> {
        let store = Arc::new(MessageStore::new(persistence));
        let library = match index_path {
            Some(path) => Library::load(store, config.assistants(), path)?,
            None => Library::new(store, config.assistants()),
        };
        Ok(Self {
            config,
            library,
            hub: NotificationHub::new(),
            sessions: SessionRegistry::new(),
        })
    }

    /// Pick the assistant and topic named by `options`, creating a new topic
    /// when none was requested.
    pub fn select(&mut self, options: &RunOptions) -> Result<(Assistant, Topic), Box<dyn Error>> {
        let requested_topic = match options.topic.as_deref() {
            Some(topic_id) => Some(
                self.library
                    .topic(topic_id)
                    .cloned()
                    .ok_or_else(|| format!("Unknown topic '{topic_id}'. Run `chatpipe topics` to list them."))?,
            ),
            None => None,
        };

        let assistant_id = match (&options.assistant, &requested_topic) {
            (Some(requested), _) => self
                .config
                .resolve_assistant(Some(requested))
                .map(|assistant| assistant.id)
                .ok_or_else(|| format!("Unknown assistant '{requested}'"))?,
            (None, Some(topic)) => topic.assistant_id.clone(),
            (None, None) => self
                .config
                .resolve_assistant(None)
                .map(|assistant| assistant.id)
                .ok_or("No assistant configured")?,
        };

        let mut assistant = self
            .library
            .assistant(&assistant_id)
            .cloned()
            .ok_or_else(|| format!("Unknown assistant '{assistant_id}'"))?;
        if let Some(model) = &options.model {
            assistant.model = Some(model.clone());
        }

        let topic = match requested_topic {
            Some(topic) if topic.assistant_id != assistant.id => {
                return Err(format!(
                    "Topic '{}' belongs to assistant '{}'",
                    topic.id, topic.assistant_id
                )
                .into())
            }
            Some(topic) => topic,
            None => self.library.add_topic(&assistant.id, DEFAULT_TOPIC_NAME)?,
        };
        info!(assistant_id = %assistant.id, topic_id = %topic.id, "conversation selected");
        Ok((assistant, topic))
    }

    pub fn controller(
        &self,
        assistant: Assistant,
        topic: &Topic,
        provider: Arc<dyn ProviderClient>,
    ) -> Result<ConversationController, Box<dyn Error>> {
        let deps = ControllerDeps {
            store: Arc::clone(self.library.store()),
            provider,
            bus: Arc::new(self.hub.clone()),
            sessions: self.sessions.clone(),
            default_model: self.config.provider.model.clone(),
            stream: self.config.stream.settings(),
        };
        Ok(ConversationController::open(&topic.id, assistant, deps)?)
    }
}

/// Provider client for the configured endpoint.
pub fn build_provider(config: &Config) -> Result<Arc<dyn ProviderClient>, Box<dyn Error>> {
    let base_url = &config.provider.base_url;
    if !is_http_url(base_url) {
        return Err(format!("Invalid provider base_url '{base_url}'").into());
    }
    let client = OpenAiCompatibleClient::from_env(base_url.as_str(), &config.provider.api_key_env)?;
    Ok(Arc::new(client))
}
