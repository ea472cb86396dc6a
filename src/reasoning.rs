use crate::actions::tool_schemas;
use crate::prompts::intent_guard_prompt;
use crate::session::{ActionRequest, ContentBlock, Turn};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as EventSourceError, Event as SseEvent, EventSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ========================= Config =========================

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub multiplier: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: Duration::from_secs(1),
            min_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.multiplier
            .saturating_mul(exp)
            .max(self.min_wait)
            .min(self.max_wait)
    }
}

#[derive(Clone, Debug)]
pub struct ReasoningConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub guard_model: String,
    pub beta: String,
    pub max_tokens: u32,
    pub viewport: (u32, u32),
    pub retry: RetryPolicy,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.anthropic.com/v1".into(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".into(),
            guard_model: "claude-haiku-4-5-20251001".into(),
            beta: "computer-use-2025-01-24".into(),
            max_tokens: 4096,
            viewport: (1280, 800),
            retry: RetryPolicy::default(),
        }
    }
}

// ========================= Errors =========================

#[derive(Debug, Error, Clone)]
pub enum CallError {
    #[error("missing api key")]
    MissingApiKey,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("service error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl CallError {
    /// Rate limits, server-side failures and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited(_) | CallError::Server { .. } | CallError::Network(_)
        )
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.chars().take(300).collect());
        match status {
            429 => CallError::RateLimited(message),
            500..=599 => CallError::Server { status, message },
            _ => CallError::Rejected { status, message },
        }
    }

    fn from_stream_error(kind: &str, message: String) -> Self {
        match kind {
            "rate_limit_error" => CallError::RateLimited(message),
            "overloaded_error" => CallError::Server { status: 529, message },
            "api_error" => CallError::Server { status: 500, message },
            _ => CallError::Rejected { status: 400, message: format!("{kind}: {message}") },
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_body() {
            CallError::Network(e.to_string())
        } else {
            CallError::Transport(e.to_string())
        }
    }
}

// ========================= Responses =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl ModelResponse {
    pub fn action_requests(&self) -> Vec<ActionRequest> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ActionRequest(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    OnTopic,
    OffTopic,
}

impl Intent {
    pub fn parse(reply: &str) -> Self {
        if reply.trim().to_lowercase().contains("off_topic") {
            Intent::OffTopic
        } else {
            Intent::OnTopic
        }
    }
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Streams narration into `on_text` as it arrives; the structured response
    /// is returned once the stream completes.
    async fn stream(
        &self,
        history: &[Turn],
        system_prompt: &str,
        on_text: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<ModelResponse, CallError>;
}

#[async_trait]
pub trait IntentGuard: Send + Sync {
    async fn classify(&self, message: &str) -> Result<Intent, CallError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllGuard;

#[async_trait]
impl IntentGuard for AllowAllGuard {
    async fn classify(&self, _message: &str) -> Result<Intent, CallError> {
        Ok(Intent::OnTopic)
    }
}

// ========================= Stream Decoding =========================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {},
    ContentBlockStart { index: usize, content_block: StartBlock },
    ContentBlockDelta { index: usize, delta: Delta },
    ContentBlockStop {},
    MessageDelta { delta: MessageDeltaBody },
    MessageStop {},
    Ping {},
    Error { error: StreamErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

enum Partial {
    Text(String),
    Request { id: String, name: String, json: String },
    Skipped,
}

/// Accumulates stream events into the final structured response.
#[derive(Default)]
pub struct ResponseBuilder {
    blocks: Vec<Partial>,
    stop_reason: Option<StopReason>,
    stopped: bool,
}

impl ResponseBuilder {
    /// Feeds one SSE `data` payload.
    pub fn feed(&mut self, data: &str, on_text: &mut (dyn for<'t> FnMut(&'t str) + Send)) -> Result<(), CallError> {
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| CallError::Protocol(format!("bad stream event: {e}")))?;
        match event {
            StreamEvent::ContentBlockStart { index, content_block } => {
                let partial = match content_block {
                    StartBlock::Text { text } => {
                        if !text.is_empty() {
                            on_text(&text);
                        }
                        Partial::Text(text)
                    }
                    StartBlock::ToolUse { id, name } => Partial::Request { id, name, json: String::new() },
                    StartBlock::Other => Partial::Skipped,
                };
                while self.blocks.len() <= index {
                    self.blocks.push(Partial::Skipped);
                }
                self.blocks[index] = partial;
            }
            StreamEvent::ContentBlockDelta { index, delta } => match (self.blocks.get_mut(index), delta) {
                (Some(Partial::Text(buf)), Delta::TextDelta { text }) => {
                    on_text(&text);
                    buf.push_str(&text);
                }
                (Some(Partial::Request { json, .. }), Delta::InputJsonDelta { partial_json }) => {
                    json.push_str(&partial_json);
                }
                _ => {}
            },
            StreamEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
            }
            StreamEvent::MessageStop {} => self.stopped = true,
            StreamEvent::Error { error } => {
                return Err(CallError::from_stream_error(&error.kind, error.message));
            }
            StreamEvent::MessageStart {}
            | StreamEvent::ContentBlockStop {}
            | StreamEvent::Ping {}
            | StreamEvent::Unknown => {}
        }
        Ok(())
    }

    pub fn finish(self) -> Result<ModelResponse, CallError> {
        if !self.stopped {
            return Err(CallError::Network("stream ended before message_stop".into()));
        }
        let content = self
            .blocks
            .into_iter()
            .filter_map(|partial| match partial {
                Partial::Text(text) if text.trim().is_empty() => None,
                Partial::Text(text) => Some(ContentBlock::Text { text }),
                Partial::Request { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json).unwrap_or_else(|e| {
                            // usually a max_tokens cut; validation rejects the empty input later
                            warn!(%id, "unparseable tool input: {e}");
                            json!({})
                        })
                    };
                    Some(ContentBlock::ActionRequest(ActionRequest { id, name, input }))
                }
                Partial::Skipped => None,
            })
            .collect();
        Ok(ModelResponse {
            content,
            stop_reason: self.stop_reason.unwrap_or(StopReason::EndTurn),
        })
    }
}

// ========================= Anthropic Client =========================

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct MessageReply {
    #[serde(default)]
    content: Vec<ReplyBlock>,
}

#[derive(Debug, Deserialize)]
struct ReplyBlock {
    #[serde(default)]
    text: String,
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: ReasoningConfig,
}

impl AnthropicClient {
    pub fn new(cfg: ReasoningConfig) -> Result<Self, CallError> {
        if cfg.api_key.is_empty() {
            return Err(CallError::MissingApiKey);
        }
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, cfg })
    }

    fn request_body(&self, history: &[Turn], system_prompt: &str) -> Value {
        json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            // one cacheable block: the prompt is large and static for the session
            "system": [{
                "type": "text",
                "text": system_prompt,
                "cache_control": {"type": "ephemeral"},
            }],
            "tools": tool_schemas(self.cfg.viewport),
            "messages": history,
            "stream": true,
        })
    }

    async fn stream_once(
        &self,
        body: &Value,
        on_text: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<ModelResponse, CallError> {
        let request = self
            .http
            .post(format!("{}/messages", self.cfg.api_base))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", &self.cfg.beta)
            .json(body);
        let mut events =
            EventSource::new(request).map_err(|e| CallError::Transport(e.to_string()))?;

        let mut builder = ResponseBuilder::default();
        let outcome = loop {
            match events.next().await {
                Some(Ok(SseEvent::Open)) => {}
                Some(Ok(SseEvent::Message(message))) => {
                    if let Err(e) = builder.feed(&message.data, on_text) {
                        break Err(e);
                    }
                }
                // a closed body is the normal end of a message; finish() decides if it was complete
                None | Some(Err(EventSourceError::StreamEnded)) => break Ok(()),
                Some(Err(EventSourceError::InvalidStatusCode(status, resp))) => {
                    let text = resp.text().await.unwrap_or_default();
                    break Err(CallError::from_status(status.as_u16(), &text));
                }
                Some(Err(EventSourceError::Transport(e))) => break Err(e.into()),
                Some(Err(e)) => break Err(CallError::Protocol(e.to_string())),
            }
        };
        // the source reconnects on its own if polled again
        events.close();
        outcome?;
        builder.finish()
    }
}

#[async_trait]
impl Reasoner for AnthropicClient {
    async fn stream(
        &self,
        history: &[Turn],
        system_prompt: &str,
        on_text: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<ModelResponse, CallError> {
        let body = self.request_body(history, system_prompt);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut delivered = false;
            let mut forward = |t: &str| {
                delivered = true;
                on_text(t);
            };
            let result = self.stream_once(&body, &mut forward).await;
            match result {
                Ok(response) => {
                    info!(
                        attempt,
                        stop_reason = ?response.stop_reason,
                        blocks = response.content.len(),
                        "model response complete"
                    );
                    return Ok(response);
                }
                // narration already reached the user; replaying it would duplicate speech
                Err(e) if e.is_transient() && !delivered && attempt < self.cfg.retry.max_attempts => {
                    let wait = self.cfg.retry.backoff(attempt);
                    warn!(attempt, wait_ms = wait.as_millis() as u64, "transient model failure: {e}");
                    sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl IntentGuard for AnthropicClient {
    async fn classify(&self, message: &str) -> Result<Intent, CallError> {
        let body = json!({
            "model": self.cfg.guard_model,
            "max_tokens": 10,
            "messages": [{"role": "user", "content": intent_guard_prompt(message)}],
        });
        let resp = self
            .http
            .post(format!("{}/messages", self.cfg.api_base))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(CallError::from_status(status.as_u16(), &text));
        }
        let reply: MessageReply = serde_json::from_str(&text)
            .map_err(|e| CallError::Protocol(format!("guard reply: {e}")))?;
        let label = reply.content.first().map(|b| b.text.as_str()).unwrap_or_default();
        debug!(label, "intent classified");
        Ok(Intent::parse(label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use axum::http::{header, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TOOL_STREAM: &str = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"stop_reason":null}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}

event: ping
data: {"type": "ping"}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Opening the"}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" menu."}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"computer","input":{}}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"action\": \"left_"}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"click\", \"coordinate\": [5, 6]}"}}

event: content_block_stop
data: {"type":"content_block_stop","index":1}

event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"output_tokens":20}}

event: message_stop
data: {"type":"message_stop"}

"#;

    /// Feeds every `data:` line of a recorded stream through the builder.
    fn decode(raw: &str) -> (Result<ModelResponse, CallError>, String) {
        let mut builder = ResponseBuilder::default();
        let mut narrated = String::new();
        let mut on_text = |t: &str| narrated.push_str(t);
        for data in raw.lines().filter_map(|l| l.strip_prefix("data: ")) {
            if let Err(e) = builder.feed(data, &mut on_text) {
                return (Err(e), narrated);
            }
        }
        (builder.finish(), narrated)
    }

    #[test]
    fn assembles_text_and_tool_use() {
        let (resp, narrated) = decode(TOOL_STREAM);
        let resp = resp.unwrap();
        assert_eq!(narrated, "Opening the menu.");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.content.len(), 2);
        let requests = resp.action_requests();
        assert_eq!(requests[0].id, "toolu_1");
        assert_eq!(requests[0].input, json!({"action": "left_click", "coordinate": [5, 6]}));
    }

    #[test]
    fn truncated_tool_input_becomes_empty_object() {
        let raw = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t\",\"name\":\"computer\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"action\\\": \\\"ty\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let (resp, _) = decode(raw);
        let resp = resp.unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
        assert_eq!(resp.action_requests()[0].input, json!({}));
    }

    #[test]
    fn stream_errors_are_classified() {
        let raw = "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let (resp, _) = decode(raw);
        assert!(resp.unwrap_err().is_transient());

        let raw = "data: {\"type\":\"error\",\"error\":{\"type\":\"invalid_request_error\",\"message\":\"bad\"}}\n\n";
        let (resp, _) = decode(raw);
        assert!(!resp.unwrap_err().is_transient());

        let (resp, _) = decode("data: {\"type\":\"message_start\",\"message\":{}}\n\n");
        assert!(matches!(resp, Err(CallError::Network(_))));
    }

    #[test]
    fn status_classification() {
        assert!(CallError::from_status(429, "").is_transient());
        assert!(CallError::from_status(529, "").is_transient());
        let e = CallError::from_status(401, r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#);
        assert!(!e.is_transient());
        assert!(e.to_string().contains("invalid x-api-key"));
    }

    #[test]
    fn backoff_grows_and_is_clamped() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(5), Duration::from_secs(16));
        assert_eq!(p.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn intent_parsing() {
        assert_eq!(Intent::parse(" OFF_TOPIC"), Intent::OffTopic);
        assert_eq!(Intent::parse("on_topic"), Intent::OnTopic);
        assert_eq!(Intent::parse(""), Intent::OnTopic);
    }

    async fn scripted_server(script: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let script = Arc::new(script);
        let app = Router::new().route(
            "/v1/messages",
            post(move || {
                let counter = counter.clone();
                let script = script.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let (status, body) = script[n.min(script.len() - 1)];
                    (
                        StatusCode::from_u16(status).unwrap(),
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        body,
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v1"), hits)
    }

    fn client(api_base: String) -> AnthropicClient {
        AnthropicClient::new(ReasoningConfig {
            api_base,
            api_key: "test-key".into(),
            retry: RetryPolicy {
                min_wait: Duration::from_millis(5),
                max_wait: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            ..ReasoningConfig::default()
        })
        .unwrap()
    }

    fn history() -> Vec<Turn> {
        vec![Turn {
            role: Role::User,
            content: vec![ContentBlock::Text { text: "hello".into() }],
        }]
    }

    #[tokio::test]
    async fn retries_rate_limits_then_streams() {
        let (base, hits) = scripted_server(vec![
            (429, r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#),
            (200, TOOL_STREAM),
        ])
        .await;
        let mut narrated = String::new();
        let resp = client(base)
            .stream(&history(), "system", &mut |t: &str| narrated.push_str(t))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(narrated, "Opening the menu.");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn cut_stream_is_retried_before_narration() {
        let (base, hits) = scripted_server(vec![
            (200, "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}\n\n"),
            (200, TOOL_STREAM),
        ])
        .await;
        let mut narrated = String::new();
        let resp = client(base)
            .stream(&history(), "system", &mut |t: &str| narrated.push_str(t))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(narrated, "Opening the menu.");
        assert_eq!(resp.action_requests().len(), 1);
    }

    #[tokio::test]
    async fn fatal_failures_are_not_retried() {
        let (base, hits) = scripted_server(vec![(
            401,
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        )])
        .await;
        let err = client(base)
            .stream(&history(), "system", &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Rejected { status: 401, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (base, hits) = scripted_server(vec![(500, "boom")]).await;
        let err = client(base)
            .stream(&history(), "system", &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn guard_reads_single_word_label() {
        let (base, _) = scripted_server(vec![(
            200,
            r#"{"id":"m","type":"message","role":"assistant","content":[{"type":"text","text":"off_topic"}]}"#,
        )])
        .await;
        assert_eq!(client(base).classify("write me a poem").await.unwrap(), Intent::OffTopic);
    }
}
