//! Interactive line-based chat.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use crate::cli::setup::{build_provider, Workspace};
use crate::cli::RunOptions;
use crate::core::controller::{ClearContext, ConversationController, Turn, ValidationError};
use crate::core::events::TopicEvent;
use crate::core::library::{Topic, DEFAULT_TOPIC_NAME};
use crate::core::message::{Message, MessageStatus};
use crate::utils::logging::TranscriptLog;

const USER_LABEL: &str = "You";

const HELP_TEXT: &str = "\
Commands:
  /clear          start a new context (history before it is not sent)
  /reset          delete every message in this topic
  /retry          regenerate the last reply
  /edit <text>    replace your last message and regenerate
  /tokens <text>  estimate the prompt size for a message
  /log [file]     start logging to a file, or toggle logging
  /status         show the assistant, model, topic and logging state
  /quit           leave (Ctrl+D works too)
Ctrl+C pauses a streaming reply.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    Empty,
    Message(&'a str),
    ClearContext,
    Reset,
    Retry,
    Edit(&'a str),
    Tokens(&'a str),
    Log(Option<&'a str>),
    Status,
    Help,
    Quit,
}

/// Interpret one input line. Unknown slash commands are sent as text.
pub fn parse_repl_command(input: &str) -> ReplCommand<'_> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return ReplCommand::Message(trimmed);
    };

    let mut parts = rest.splitn(2, ' ');
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

    match name.to_ascii_lowercase().as_str() {
        "clear" => ReplCommand::ClearContext,
        "reset" => ReplCommand::Reset,
        "retry" => ReplCommand::Retry,
        "edit" => ReplCommand::Edit(arg.unwrap_or_default()),
        "tokens" => ReplCommand::Tokens(arg.unwrap_or_default()),
        "log" => ReplCommand::Log(arg),
        "status" => ReplCommand::Status,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        _ => ReplCommand::Message(trimmed),
    }
}

pub async fn run_chat(options: RunOptions) -> Result<(), Box<dyn Error>> {
    let mut workspace = Workspace::open()?;
    let provider = build_provider(&workspace.config)?;
    let (assistant, topic) = workspace.select(&options)?;
    let controller = workspace.controller(assistant, &topic, provider)?;
    let (_subscription, mut events) = workspace.hub.subscribe_channel(&topic.id);
    let mut transcript = TranscriptLog::new(options.log.clone())?;

    println!(
        "chatpipe · {} · {} · topic {} ({})",
        controller.assistant().name,
        controller.model(),
        topic.name,
        topic.id
    );
    println!("Type /help for commands.\n");
    print_history(&controller.messages());

    let mut session = ChatSession {
        workspace: &mut workspace,
        topic,
        controller: &controller,
        events: &mut events,
        transcript: &mut transcript,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        match parse_repl_command(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            command => session.handle(command).await?,
        }
    }
    Ok(())
}

struct ChatSession<'a> {
    workspace: &'a mut Workspace,
    topic: Topic,
    controller: &'a ConversationController,
    events: &'a mut UnboundedReceiver<TopicEvent>,
    transcript: &'a mut TranscriptLog,
}

impl ChatSession<'_> {
    async fn handle(&mut self, command: ReplCommand<'_>) -> Result<(), Box<dyn Error>> {
        match command {
            ReplCommand::Empty | ReplCommand::Quit => {}
            ReplCommand::Message(text) => {
                let started = self.controller.send(text, Vec::new());
                if let Some(reply) = self.follow(started).await? {
                    self.note(self.transcript.log_turn(USER_LABEL, text, &reply.content));
                }
            }
            ReplCommand::Retry => {
                let started = match last_resendable(&self.controller.messages()) {
                    Some(message_id) => self.controller.resend(&message_id),
                    None => {
                        eprintln!("Nothing to retry yet.");
                        return Ok(());
                    }
                };
                if self.follow(started).await?.is_some() {
                    self.rewrite_transcript();
                }
            }
            ReplCommand::Edit(text) => {
                let last_user = self
                    .controller
                    .messages()
                    .iter()
                    .rev()
                    .find(|message| message.is_user() && !message.is_context_break())
                    .map(|message| message.id.clone());
                let Some(message_id) = last_user else {
                    eprintln!("No message to edit yet.");
                    return Ok(());
                };
                let started = self.controller.edit_and_resend(&message_id, text);
                if self.follow(started).await?.is_some() {
                    self.rewrite_transcript();
                }
            }
            ReplCommand::ClearContext => match self.controller.clear_context() {
                Ok(ClearContext::Appended(_)) => {
                    println!("── new context ──\n");
                    self.note(self.transcript.log_message("## New context"));
                }
                Ok(ClearContext::PausedActiveSession) => println!("⏸  Paused the running reply."),
                Err(err) => eprintln!("⚠️  {err}"),
            },
            ReplCommand::Reset => match self.controller.clear_messages().await {
                Ok(_) => {
                    let renamed = self
                        .workspace
                        .library
                        .rename_topic(&self.topic.id, DEFAULT_TOPIC_NAME);
                    self.note(renamed);
                    self.topic.name = DEFAULT_TOPIC_NAME.to_string();
                    self.rewrite_transcript();
                    println!("Conversation cleared.\n");
                    print_history(&self.controller.messages());
                }
                Err(err) => eprintln!("⚠️  {err}"),
            },
            ReplCommand::Tokens(text) => {
                let estimate = self.controller.estimate_input(text);
                println!(
                    "~{} tokens for this message, ~{} tokens across {} history messages",
                    estimate.input_tokens, estimate.history_tokens, estimate.context_count
                );
            }
            ReplCommand::Log(Some(path)) => {
                match self.transcript.set_log_file(PathBuf::from(path)) {
                    Ok(message) => {
                        println!("{message}");
                        self.rewrite_transcript();
                    }
                    Err(err) => eprintln!("❌ Logging error: {err}"),
                }
            }
            ReplCommand::Log(None) => match self.transcript.toggle_logging("Logging paused") {
                Ok(message) => println!("{message}"),
                Err(err) => eprintln!("❌ {err}"),
            },
            ReplCommand::Status => println!("{}\n", self.status_line()),
            ReplCommand::Help => println!("{HELP_TEXT}\n"),
        }
        Ok(())
    }

    /// Stream a started turn to stdout. Returns the settled reply, or `None`
    /// when the request was rejected.
    async fn follow(
        &mut self,
        started: Result<Turn, ValidationError>,
    ) -> Result<Option<Message>, Box<dyn Error>> {
        let turn = match started {
            Ok(turn) => turn,
            Err(err) => {
                eprintln!("⚠️  {err}");
                return Ok(None);
            }
        };
        let reply = stream_reply(self.controller, self.events, &turn).await?;
        report_outcome(&reply);
        let touched = self.workspace.library.touch_topic(&self.topic.id);
        self.note(touched);
        Ok(Some(reply))
    }

    fn status_line(&self) -> String {
        format!(
            "{} · {} · topic {} ({}) · logging {}",
            self.controller.assistant().name,
            self.controller.model(),
            self.topic.name,
            self.topic.id,
            self.transcript.status_string()
        )
    }

    fn rewrite_transcript(&mut self) {
        let result = self
            .transcript
            .rewrite(&self.controller.messages(), USER_LABEL);
        self.note(result);
    }

    fn note<T, E: std::fmt::Display>(&self, result: Result<T, E>) {
        if let Err(err) = result {
            warn!(topic_id = %self.topic.id, "{err}");
            eprintln!("⚠️  {err}");
        }
    }
}

/// Print chunks of `turn`'s reply as they arrive until its session settles.
/// Ctrl+C pauses the reply; what was streamed so far is kept.
pub(crate) async fn stream_reply(
    controller: &ConversationController,
    events: &mut UnboundedReceiver<TopicEvent>,
    turn: &Turn,
) -> Result<Message, Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TopicEvent::ChunkAppended { message_id, delta })
                    if message_id == turn.assistant_message_id =>
                {
                    write!(stdout, "{delta}")?;
                    stdout.flush()?;
                }
                Some(TopicEvent::SessionFinished { message_id, .. })
                    if message_id == turn.assistant_message_id =>
                {
                    break;
                }
                Some(TopicEvent::PersistenceDegraded { reason }) => {
                    eprintln!("\n⚠️  Changes kept in memory only: {reason}");
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                controller.pause();
            }
        }
    }
    writeln!(stdout)?;
    controller.wait_idle().await;

    controller
        .messages()
        .into_iter()
        .find(|message| message.id == turn.assistant_message_id)
        .ok_or_else(|| "Reply was removed while streaming".into())
}

pub(crate) fn report_outcome(reply: &Message) {
    match reply.status {
        MessageStatus::Paused => eprintln!("⏸  Paused"),
        MessageStatus::Error => eprintln!(
            "❌ {}",
            reply.error.as_deref().unwrap_or("The reply failed")
        ),
        _ => {}
    }
}

fn print_history(messages: &[Message]) {
    for message in messages {
        if message.is_context_break() {
            println!("── new context ──");
        } else if message.is_user() {
            println!("> {}", message.content);
        } else {
            println!("{}", message.content);
            report_outcome(message);
        }
        println!();
    }
}

/// The message `/retry` regenerates: the last one that is not a context break.
fn last_resendable(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|message| !message.is_context_break())
        .map(|message| message.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::controller::{ControllerDeps, SessionRegistry, StreamSettings};
    use crate::core::events::NotificationHub;
    use crate::core::library::Assistant;
    use crate::core::persistence::MemoryPersistence;
    use crate::core::store::MessageStore;
    use crate::utils::test_utils::ScriptedProvider;
    use std::sync::Arc;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse_repl_command("  hello  "), ReplCommand::Message("hello"));
        assert_eq!(parse_repl_command("   "), ReplCommand::Empty);
    }

    #[test]
    fn slash_commands_parse_with_arguments() {
        assert_eq!(parse_repl_command("/clear"), ReplCommand::ClearContext);
        assert_eq!(parse_repl_command("/RESET"), ReplCommand::Reset);
        assert_eq!(parse_repl_command("/retry"), ReplCommand::Retry);
        assert_eq!(
            parse_repl_command("/edit  fixed wording "),
            ReplCommand::Edit("fixed wording")
        );
        assert_eq!(parse_repl_command("/edit"), ReplCommand::Edit(""));
        assert_eq!(parse_repl_command("/tokens hi"), ReplCommand::Tokens("hi"));
        assert_eq!(parse_repl_command("/log"), ReplCommand::Log(None));
        assert_eq!(
            parse_repl_command("/log chat.md"),
            ReplCommand::Log(Some("chat.md"))
        );
        assert_eq!(parse_repl_command("/exit"), ReplCommand::Quit);
        assert_eq!(parse_repl_command("/help"), ReplCommand::Help);
        assert_eq!(parse_repl_command("/status"), ReplCommand::Status);
    }

    #[test]
    fn unknown_command_is_sent_verbatim() {
        assert_eq!(
            parse_repl_command("/shrug ok"),
            ReplCommand::Message("/shrug ok")
        );
    }

    #[test]
    fn retry_skips_context_breaks() {
        let reply = Message::assistant_text("t", "a", "Hi");
        let messages = vec![
            Message::user("t", "a", "Hello"),
            reply.clone(),
            Message::context_break("t", "a"),
        ];
        assert_eq!(last_resendable(&messages), Some(reply.id));
        assert_eq!(last_resendable(&[Message::context_break("t", "a")]), None);
    }

    #[tokio::test]
    async fn stream_reply_returns_settled_message() {
        let hub = NotificationHub::new();
        let deps = ControllerDeps {
            store: Arc::new(MessageStore::new(Arc::new(MemoryPersistence::new()))),
            provider: Arc::new(ScriptedProvider::immediate(["Hi", " there"])),
            bus: Arc::new(hub.clone()),
            sessions: SessionRegistry::new(),
            default_model: "test-model".into(),
            stream: StreamSettings::default(),
        };
        let controller =
            ConversationController::open("t", Assistant::default_assistant(), deps).expect("open");
        let (_subscription, mut events) = hub.subscribe_channel("t");

        let turn = controller.send("Hello", Vec::new()).expect("send");
        let reply = stream_reply(&controller, &mut events, &turn)
            .await
            .expect("reply");

        assert_eq!(reply.id, turn.assistant_message_id);
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.status, MessageStatus::Success);
        assert!(!controller.is_generating());
    }
}
