use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MessageId = String;
pub type TopicId = String;
pub type AssistantId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_user(self) -> bool {
        self == Role::User
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle of a message.
///
/// User messages pass through `Sending` only transiently and are committed as
/// `Success`. Assistant replies start as `Pending`, stream while `Sending`, and
/// end in one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Pending,
    Success,
    Paused,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Success | MessageStatus::Paused | MessageStatus::Error
        )
    }

    /// `Sending` and `Pending` messages belong to a turn still in flight and
    /// are never offered as history.
    pub fn is_transient(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Pending => "pending",
            MessageStatus::Success => "success",
            MessageStatus::Paused => "paused",
            MessageStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    /// Partition marker written by "clear context". Carries no content.
    ContextBreak,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// File metadata carried alongside a user message. Reading the file is the
/// caller's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub topic_id: TopicId,
    pub assistant_id: AssistantId,
    pub status: MessageStatus,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Message {
    fn base(
        role: Role,
        status: MessageStatus,
        topic_id: &str,
        assistant_id: &str,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            topic_id: topic_id.to_string(),
            assistant_id: assistant_id.to_string(),
            status,
            kind: MessageKind::Text,
            created_at: Utc::now(),
            usage: None,
            model_id: None,
            error: None,
            attachments: Vec::new(),
        }
    }

    /// A user turn. Created `Sending`; the controller commits it as `Success`.
    pub fn user(topic_id: &str, assistant_id: &str, content: impl Into<String>) -> Self {
        Self::base(
            Role::User,
            MessageStatus::Sending,
            topic_id,
            assistant_id,
            content,
        )
    }

    /// Empty assistant reply waiting for its session.
    pub fn assistant_placeholder(
        topic_id: &str,
        assistant_id: &str,
        model_id: Option<String>,
    ) -> Self {
        let mut message = Self::base(
            Role::Assistant,
            MessageStatus::Pending,
            topic_id,
            assistant_id,
            String::new(),
        );
        message.model_id = model_id;
        message
    }

    /// Finished assistant message, used for the welcome greeting.
    pub fn assistant_text(topic_id: &str, assistant_id: &str, content: impl Into<String>) -> Self {
        Self::base(
            Role::Assistant,
            MessageStatus::Success,
            topic_id,
            assistant_id,
            content,
        )
    }

    pub fn context_break(topic_id: &str, assistant_id: &str) -> Self {
        let mut message = Self::base(
            Role::User,
            MessageStatus::Success,
            topic_id,
            assistant_id,
            String::new(),
        );
        message.kind = MessageKind::ContextBreak;
        message
    }

    pub fn is_context_break(&self) -> bool {
        self.kind == MessageKind::ContextBreak
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this message can be shown as chat content or offered as context.
    pub fn has_content(&self) -> bool {
        !self.is_context_break() && !self.content.trim().is_empty()
    }
}

/// Partial update applied by [`crate::core::store::MessageStore::update_one`].
///
/// `None` fields are left untouched. `reopen` marks the edit-and-resend path,
/// the only way a terminal message may change again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub usage: Option<Usage>,
    pub model_id: Option<String>,
    pub error: Option<Option<String>>,
    pub reopen: bool,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    /// Reset a terminal message so a new session can rewrite it in place.
    pub fn reopen(status: MessageStatus) -> Self {
        Self {
            content: Some(String::new()),
            status: Some(status),
            error: Some(None),
            reopen: true,
            ..Default::default()
        }
    }

    /// Replace the text of a finished user message.
    pub fn edit(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            status: Some(MessageStatus::Success),
            error: Some(None),
            reopen: true,
            ..Default::default()
        }
    }

    pub fn touches_content_or_status(&self) -> bool {
        self.content.is_some() || self.status.is_some()
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content.clone_from(content);
        }
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(usage) = self.usage {
            message.usage = Some(usage);
        }
        if let Some(model_id) = &self.model_id {
            message.model_id = Some(model_id.clone());
        }
        if let Some(error) = &self.error {
            message.error.clone_from(error);
        }
        if self.reopen {
            message.usage = None;
        }
    }
}
