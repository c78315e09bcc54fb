//! Command-line interface parsing and dispatch.
//!
//! `chatpipe` with no subcommand opens an interactive chat on a fresh topic
//! of the default assistant. `say` runs a single exchange and exits.

pub mod chat;
pub mod say;
pub mod setup;
pub mod topics;

#[cfg(test)]
mod tests;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::config::data::path_display;
use crate::core::config::Config;
use crate::core::message::Role;
use crate::core::tokens::TokenEstimator;
use crate::utils::logging::init_tracing;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_SHA"),
    ", built ",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "chatpipe")]
#[command(about = "Streamed chat conversations with OpenAI-compatible models")]
#[command(version, long_version = LONG_VERSION)]
#[command(
    long_about = "chatpipe keeps conversations as topics on disk and streams replies \
from any OpenAI-compatible endpoint.\n\n\
Configuration lives in config.toml under the platform config directory; the API key \
is read from the environment variable named by provider.api_key_env (OPENAI_API_KEY \
by default).\n\n\
Diagnostics are filtered with CHATPIPE_LOG (for example CHATPIPE_LOG=debug)."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Assistant id from the config file
    #[arg(short = 'a', long, global = true)]
    pub assistant: Option<String>,

    /// Continue an existing topic instead of starting a new one
    #[arg(short = 't', long, global = true)]
    pub topic: Option<String>,

    /// Model override for this run
    #[arg(short = 'm', long, global = true)]
    pub model: Option<String>,

    /// Append the conversation transcript to this file
    #[arg(short = 'l', long, global = true)]
    pub log: Option<PathBuf>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long, global = true, value_name = "FILE")]
    pub debug_log: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Send one message and print the streamed reply
    Say {
        /// Message text; words are joined with spaces
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        prompt: Vec<String>,
    },
    /// List assistants and their topics
    Topics,
    /// Write a default config.toml to the platform config directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Estimate the prompt tokens of a message
    Estimate {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
}

/// Selection shared by every subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub assistant: Option<String>,
    pub topic: Option<String>,
    pub model: Option<String>,
    pub log: Option<PathBuf>,
}

impl Args {
    fn split(self) -> (Option<Commands>, RunOptions, Option<PathBuf>) {
        let options = RunOptions {
            assistant: self.assistant,
            topic: self.topic,
            model: self.model,
            log: self.log,
        };
        (self.command, options, self.debug_log)
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let (command, options, debug_log) = Args::parse().split();
    init_tracing(debug_log.as_deref())?;

    match command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat::run_chat(options).await,
        Commands::Say { prompt } => {
            if prompt.is_empty() {
                eprintln!("Usage: chatpipe say <prompt>");
                std::process::exit(1);
            }
            say::run_say(&prompt.join(" "), options).await
        }
        Commands::Topics => topics::list_topics(),
        Commands::Init { force } => init_config(force),
        Commands::Estimate { text } => {
            let text = text.join(" ");
            let tokens = TokenEstimator::new().estimate(Role::User, &text);
            println!("{tokens}");
            Ok(())
        }
    }
}

fn init_config(force: bool) -> Result<(), Box<dyn Error>> {
    let config_path = Config::get_config_path()?;
    if Config::init_at(&config_path, force)? {
        println!("Wrote {}", path_display(&config_path));
    } else {
        println!(
            "{} already exists; pass --force to overwrite it",
            path_display(&config_path)
        );
    }
    Ok(())
}
