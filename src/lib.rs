//! chatpipe drives streamed chat conversations against OpenAI-compatible
//! completion endpoints.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns conversation state: the message store and its persistence,
//!   context selection, token estimates, the completion sessions that stream
//!   replies, and the controller that turns user actions into sessions.
//! - [`api`] defines the wire payloads spoken to `chat/completions`.
//! - [`cli`] parses arguments and runs the interactive and one-shot commands.
//! - [`utils`] holds logging, transcript and URL helpers.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
