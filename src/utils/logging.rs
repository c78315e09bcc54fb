use crate::core::message::Message;
use std::error::Error;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the tracing filter directive.
pub const LOG_FILTER_ENV: &str = "CHATPIPE_LOG";

/// Install the global tracing subscriber. Diagnostics go to `log_file` when
/// given, otherwise to stderr, filtered by `CHATPIPE_LOG` (default `warn`).
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, stderr_layer) = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => (None, Some(fmt::layer().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;
    Ok(())
}

/// Plain-text transcript of a conversation, appended turn by turn.
pub struct TranscriptLog {
    file_path: Option<PathBuf>,
    is_active: bool,
}

impl TranscriptLog {
    /// Starts active when a path is given.
    pub fn new(log_file: Option<PathBuf>) -> Result<Self, Box<dyn Error>> {
        if let Some(path) = &log_file {
            test_file_access(path)?;
        }
        Ok(TranscriptLog {
            is_active: log_file.is_some(),
            file_path: log_file,
        })
    }

    pub fn set_log_file(&mut self, path: PathBuf) -> Result<String, Box<dyn Error>> {
        test_file_access(&path)?;
        let message = format!("Logging enabled to: {}", path.display());
        self.file_path = Some(path);
        self.is_active = true;
        Ok(message)
    }

    pub fn toggle_logging(&mut self, pause_message: &str) -> Result<String, Box<dyn Error>> {
        match &self.file_path {
            Some(path) => {
                let shown = path.display().to_string();
                if self.is_active {
                    // Mark the gap before going quiet.
                    self.log_message(&format!("## {pause_message}"))?;
                    self.is_active = false;
                    Ok(format!("Logging paused (file: {shown})"))
                } else {
                    self.is_active = true;
                    Ok(format!("Logging resumed to: {shown}"))
                }
            }
            None => Err("No log file specified. Use /log <filename> to enable logging first.".into()),
        }
    }

    pub fn log_message(&self, content: &str) -> Result<(), Box<dyn Error>> {
        let Some(path) = self.active_path() else {
            return Ok(());
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        write_block(&mut writer, content)?;
        writer.flush()?;
        Ok(())
    }

    /// Append one finished exchange.
    pub fn log_turn(&self, user_label: &str, user: &str, reply: &str) -> Result<(), Box<dyn Error>> {
        self.log_message(&format!("{user_label}: {user}"))?;
        if !reply.is_empty() {
            self.log_message(reply)?;
        }
        Ok(())
    }

    pub fn status_string(&self) -> String {
        let name = |path: &PathBuf| {
            path.file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned()
        };
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), true) => format!("active ({})", name(path)),
            (Some(path), false) => format!("paused ({})", name(path)),
        }
    }

    /// Replace the file with a fresh rendering of `messages`, used after the
    /// history changed underneath the log (resend, edit, clear).
    pub fn rewrite(&self, messages: &[Message], user_label: &str) -> Result<(), Box<dyn Error>> {
        let Some(path) = self.active_path() else {
            return Ok(());
        };
        let parent = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        // Same directory so the final rename is atomic.
        let mut temp_file = NamedTempFile::new_in(parent)?;
        for message in messages {
            if message.is_context_break() {
                write_block(&mut temp_file, "## New context")?;
            } else if message.is_user() {
                write_block(&mut temp_file, &format!("{user_label}: {}", message.content))?;
            } else if !message.content.is_empty() {
                write_block(&mut temp_file, &message.content)?;
            }
        }
        temp_file.flush()?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(path)?;
        Ok(())
    }

    fn active_path(&self) -> Option<&Path> {
        self.file_path
            .as_deref()
            .filter(|_| self.is_active)
    }
}

fn write_block<W: Write>(writer: &mut W, content: &str) -> std::io::Result<()> {
    for line in content.lines() {
        writeln!(writer, "{line}")?;
    }
    // Blank line between entries
    writeln!(writer)
}

fn test_file_access(path: &Path) -> Result<(), Box<dyn Error>> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::MessageStatus;
    use tempfile::TempDir;

    fn user(content: &str) -> Message {
        let mut message = Message::user("t", "a", content);
        message.status = MessageStatus::Success;
        message
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let log = TranscriptLog::new(None).expect("log");
        assert_eq!(log.status_string(), "disabled");
        log.log_message("ignored").expect("noop");
    }

    #[test]
    fn turns_are_appended_with_spacing() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("chat.log");
        let log = TranscriptLog::new(Some(path.clone())).expect("log");

        log.log_turn("You", "Hello", "Hi there!\nHow can I help?")
            .expect("log turn");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "You: Hello\n\nHi there!\nHow can I help?\n\n");
        assert_eq!(log.status_string(), "active (chat.log)");
    }

    #[test]
    fn toggling_writes_marker_and_pauses() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("chat.log");
        let mut log = TranscriptLog::new(Some(path.clone())).expect("log");

        let paused = log.toggle_logging("Logging paused").expect("toggle");
        log.log_message("not recorded").expect("noop");
        let resumed = log.toggle_logging("unused").expect("toggle");

        assert!(paused.starts_with("Logging paused"));
        assert!(resumed.starts_with("Logging resumed"));
        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "## Logging paused\n\n");
    }

    #[test]
    fn toggle_without_file_is_an_error() {
        let mut log = TranscriptLog::new(None).expect("log");
        assert!(log.toggle_logging("x").is_err());
    }

    #[test]
    fn rewrite_replaces_file_contents() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("chat.log");
        let log = TranscriptLog::new(Some(path.clone())).expect("log");
        log.log_turn("You", "old question", "old answer").expect("log");

        let messages = vec![
            Message::assistant_text("t", "a", "Welcome"),
            user("new question"),
            Message::context_break("t", "a"),
            Message::assistant_placeholder("t", "a", None),
        ];
        log.rewrite(&messages, "You").expect("rewrite");

        let contents = std::fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "Welcome\n\nYou: new question\n\n## New context\n\n");
    }
}
