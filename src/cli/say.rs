use std::error::Error;
use std::sync::Arc;

use crate::cli::chat::{report_outcome, stream_reply};
use crate::cli::setup::{build_provider, Workspace};
use crate::cli::RunOptions;
use crate::core::config::Config;
use crate::core::message::MessageStatus;
use crate::core::persistence::MemoryPersistence;
use crate::utils::logging::TranscriptLog;

/// Send a single prompt and stream the reply to stdout.
///
/// Without `--topic` the exchange runs on a throwaway in-memory topic and
/// nothing is written to the data directory.
pub async fn run_say(prompt: &str, options: RunOptions) -> Result<(), Box<dyn Error>> {
    let mut workspace = if options.topic.is_some() {
        Workspace::open()?
    } else {
        Workspace::with_persistence(Config::load()?, Arc::new(MemoryPersistence::new()), None)?
    };
    let provider = build_provider(&workspace.config)?;
    let (assistant, topic) = workspace.select(&options)?;
    let controller = workspace.controller(assistant, &topic, provider)?;
    let (_subscription, mut events) = workspace.hub.subscribe_channel(&topic.id);

    let turn = controller.send(prompt, Vec::new())?;
    let reply = stream_reply(&controller, &mut events, &turn).await?;
    report_outcome(&reply);

    if options.topic.is_some() {
        workspace.library.touch_topic(&topic.id)?;
    }
    TranscriptLog::new(options.log)?.log_turn("You", prompt.trim(), &reply.content)?;

    if reply.status == MessageStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}
