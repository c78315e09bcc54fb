//! Streaming client for OpenAI-compatible `chat/completions` endpoints.

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CompletionRequest, CompletionStream, ProviderClient, ProviderError, StreamEvent,
};
use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::message::Usage;
use crate::utils::url::construct_api_url;

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Read the key from `api_key_env`.
    pub fn from_env(base_url: impl Into<String>, api_key_env: &str) -> Result<Self, ProviderError> {
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey(api_key_env.to_string()))?;
        Ok(Self::new(base_url, api_key))
    }
}

fn to_chat_request(request: &CompletionRequest) -> ChatRequest {
    ChatRequest {
        model: request.model.clone(),
        messages: request
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect(),
        stream: true,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        let chat_url = construct_api_url(&self.base_url, "chat/completions");
        let body = to_chat_request(&request);
        debug!(model = %body.model, messages = body.messages.len(), "opening completion stream");

        let send = self
            .client
            .post(chat_url)
            .header("Content-Type", "application/json")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ProviderError::Transport("request cancelled".to_string()));
            }
            result = send => result.map_err(|e| ProviderError::Transport(e.to_string()))?,
        };

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ProviderError::Api(format_api_error(&error_text)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_sse(response, tx, cancel));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Forward SSE events until `[DONE]`, an error, cancellation, or the consumer
/// dropping the stream.
async fn pump_sse(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.closed() => return,
            next = stream.next() => next,
        };

        match next {
            None => break,
            Some(Ok(bytes)) => {
                if decoder.feed(&bytes, &tx) {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(StreamEvent::Error(format!("Stream interrupted: {err}")));
                return;
            }
        }
    }

    decoder.finish(&tx);
}

/// Splits a response body into `data:` lines and turns them into events.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    saw_finish_reason: bool,
}

impl SseDecoder {
    /// Returns `true` once the stream is finished.
    fn feed(&mut self, bytes: &[u8], tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
        self.buffer.extend_from_slice(bytes);

        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            let done = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(line) => {
                    let line = line.trim().to_string();
                    self.process_line(&line, tx)
                }
                Err(err) => {
                    warn!("invalid UTF-8 in completion stream: {err}");
                    let _ = tx.send(StreamEvent::Error(format!(
                        "Stream contained invalid UTF-8: {err}"
                    )));
                    true
                }
            };
            self.buffer.drain(..=newline_pos);
            if done {
                return true;
            }
        }
        false
    }

    /// The body closed before `[DONE]`. A trailing line without a newline is
    /// still decoded; a stream that never reported a finish reason is
    /// reported as cut off.
    fn finish(mut self, tx: &mpsc::UnboundedSender<StreamEvent>) {
        if !self.buffer.is_empty() {
            self.buffer.push(b'\n');
            if self.feed(&[], tx) {
                return;
            }
        }
        if !self.saw_finish_reason {
            warn!("completion stream closed before [DONE]");
            let _ = tx.send(StreamEvent::Error("Stream ended before [DONE]".to_string()));
        }
    }

    /// Returns `true` once the stream is finished.
    fn process_line(&mut self, line: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
        line.strip_prefix("data:")
            .map(str::trim_start)
            .map(|payload| self.handle_data_payload(payload, tx))
            .unwrap_or(false)
    }

    fn handle_data_payload(&mut self, payload: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
        if payload == "[DONE]" {
            return true;
        }

        match serde_json::from_str::<ChatResponse>(payload) {
            Ok(response) => {
                for choice in &response.choices {
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            let _ = tx.send(StreamEvent::Delta(content.clone()));
                        }
                    }
                    if let Some(reason) = &choice.finish_reason {
                        debug!(finish_reason = %reason, "completion finished");
                        self.saw_finish_reason = true;
                    }
                }
                if let Some(usage) = response.usage {
                    let _ = tx.send(StreamEvent::Usage(Usage::new(
                        usage.prompt_tokens,
                        usage.completion_tokens,
                    )));
                }
                false
            }
            Err(_) => {
                if payload.trim().is_empty() {
                    return false;
                }
                let _ = tx.send(StreamEvent::Error(format_api_error(payload)));
                true
            }
        }
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))?;

    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(collapsed)
}

/// Human-readable summary of an error body, keeping the raw payload below a
/// one-line headline.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error: <empty response>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let pretty = serde_json::to_string_pretty(&json_value).unwrap_or_else(|_| trimmed.into());
        return match extract_error_summary(&json_value).filter(|s| !s.is_empty()) {
            Some(summary) => format!("API Error: {summary}\n```json\n{pretty}\n```"),
            None => format!("API Error:\n```json\n{pretty}\n```"),
        };
    }

    format!("API Error:\n```\n{trimmed}\n```")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{PromptMessage, PromptRole};

    fn collect(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn data_lines_with_and_without_space_are_parsed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();

        assert!(!decoder.process_line(
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            &tx
        ));
        assert!(!decoder.process_line(
            r#"data:{"choices":[{"delta":{"content":" world"}}]}"#,
            &tx
        ));
        assert!(decoder.process_line("data:[DONE]", &tx));

        assert_eq!(
            collect(&mut rx),
            vec![
                StreamEvent::Delta("Hello".into()),
                StreamEvent::Delta(" world".into())
            ]
        );
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();
        assert!(!decoder.process_line(": keep-alive", &tx));
        assert!(!decoder.process_line("event: message", &tx));
        assert!(!decoder.process_line("", &tx));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn usage_chunks_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;

        assert!(!decoder.process_line(line, &tx));

        assert_eq!(
            rx.try_recv().expect("usage"),
            StreamEvent::Usage(Usage::new(12, 3))
        );
    }

    #[test]
    fn error_payloads_end_the_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();
        let line = r#"data: {"error":{"message":"internal   server error"}}"#;

        assert!(decoder.process_line(line, &tx));

        match rx.try_recv().expect("error") {
            StreamEvent::Error(text) => {
                assert!(text.starts_with("API Error: internal server error\n```json\n"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();

        assert!(!decoder.feed(b"data: {\"choices\":[{\"delta\":{\"con", &tx));
        assert!(rx.try_recv().is_err());
        assert!(!decoder.feed(b"tent\":\"Hi\"}}]}\n\n", &tx));
        assert!(decoder.feed(b"data: [DONE]\n", &tx));

        assert_eq!(collect(&mut rx), vec![StreamEvent::Delta("Hi".into())]);
    }

    #[test]
    fn body_closing_without_done_is_an_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();

        assert!(!decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hal\"}}]}\n", &tx));
        decoder.finish(&tx);

        assert_eq!(
            collect(&mut rx),
            vec![
                StreamEvent::Delta("Hal".into()),
                StreamEvent::Error("Stream ended before [DONE]".into())
            ]
        );
    }

    #[test]
    fn body_closing_after_finish_reason_is_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();

        assert!(!decoder.feed(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":null}]}\n",
            &tx
        ));
        // Last line arrives without a trailing newline.
        assert!(!decoder.feed(
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
            &tx
        ));
        decoder.finish(&tx);

        assert_eq!(collect(&mut rx), vec![StreamEvent::Delta("ok".into())]);
    }

    #[test]
    fn invalid_utf8_ends_the_stream_with_an_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut decoder = SseDecoder::default();

        assert!(decoder.feed(b"data: \xff\xfe\n", &tx));

        match collect(&mut rx).as_slice() {
            [StreamEvent::Error(text)] => assert!(text.starts_with("Stream contained invalid UTF-8")),
            other => panic!("expected one error, got {other:?}"),
        }
    }

    #[test]
    fn format_api_error_variants() {
        assert_eq!(
            format_api_error(r#"{"status":"failed"}"#),
            "API Error:\n```json\n{\n  \"status\": \"failed\"\n}\n```"
        );
        assert_eq!(
            format_api_error("upstream timeout"),
            "API Error:\n```\nupstream timeout\n```"
        );
        assert_eq!(format_api_error("   "), "API Error: <empty response>");
        assert!(format_api_error(r#"{"message":"quota exceeded"}"#)
            .starts_with("API Error: quota exceeded"));
    }

    #[test]
    fn chat_request_carries_roles_and_sampling() {
        let request = CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![
                PromptMessage::new(PromptRole::System, "be brief"),
                PromptMessage::new(PromptRole::User, "hi"),
            ],
            temperature: 0.3,
            max_tokens: Some(128),
        };

        let json = serde_json::to_value(to_chat_request(&request)).expect("serialize");

        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 128);
    }

    #[test]
    fn missing_api_key_is_reported() {
        let result = OpenAiCompatibleClient::from_env(
            "https://api.example.com/v1",
            "CHATPIPE_TEST_KEY_THAT_IS_NOT_SET",
        );
        assert!(matches!(result, Err(ProviderError::MissingApiKey(_))));
    }
}
