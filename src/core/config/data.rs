use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::controller::{StreamSettings, DEFAULT_PAUSE_GRACE};
use crate::core::library::{Assistant, AssistantSettings};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key. Keys are never stored here.
    pub api_key_env: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Persist partial replies every N chunks; 0 disables checkpoints.
    pub checkpoint_every: usize,
    pub pause_grace_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: 0,
            pause_grace_ms: u64::try_from(DEFAULT_PAUSE_GRACE.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl StreamConfig {
    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            checkpoint_every: self.checkpoint_every,
            pause_grace: Duration::from_millis(self.pause_grace_ms),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AssistantConfig {
    pub id: String,
    pub name: Option<String>,
    /// System prompt
    #[serde(default)]
    pub prompt: String,
    pub model: Option<String>,
    pub context_count: Option<usize>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub enable_max_tokens: Option<bool>,
}

impl AssistantConfig {
    pub fn to_assistant(&self) -> Assistant {
        let defaults = AssistantSettings::default();
        let mut assistant = Assistant::new(
            self.id.clone(),
            self.name.clone().unwrap_or_else(|| self.id.clone()),
            self.prompt.clone(),
        );
        assistant.model = self.model.clone();
        assistant.settings = AssistantSettings {
            context_count: self.context_count.unwrap_or(defaults.context_count),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            enable_max_tokens: self.enable_max_tokens.unwrap_or(defaults.enable_max_tokens),
        };
        assistant
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Where topics are stored. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Assistant used when `--assistant` is not given
    pub default_assistant: Option<String>,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub assistants: Vec<AssistantConfig>,
}

impl Config {
    /// Configured assistants, or the built-in default when none are listed.
    pub fn assistants(&self) -> Vec<Assistant> {
        if self.assistants.is_empty() {
            return vec![Assistant::default_assistant()];
        }
        self.assistants
            .iter()
            .map(AssistantConfig::to_assistant)
            .collect()
    }

    /// Pick an assistant by id (case-insensitive), falling back to
    /// `default_assistant` and then to the first one configured.
    pub fn resolve_assistant(&self, requested: Option<&str>) -> Option<Assistant> {
        let assistants = self.assistants();
        let wanted = requested.or(self.default_assistant.as_deref());
        match wanted {
            Some(id) => assistants
                .into_iter()
                .find(|a| a.id.eq_ignore_ascii_case(id)),
            None => assistants.into_iter().next(),
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.local/share/chatpipe` → `~/.local/share/chatpipe`
/// - Windows: paths are shown unchanged
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
