//! HTTP/SSE transport around the agent.

use crate::actions::{Surface, SurfaceError};
use crate::agent::Agent;
use crate::config::ServerConfig;
use crate::events::{self, AgentEvent, Pacer, ReadingPacer, RunHooks};
use crate::narration::{spawn_relay, SpeechPacer};
use crate::reasoning::{IntentGuard, Reasoner};
use crate::session::SessionStore;
use crate::stt::SpeechRecognizer;
use crate::tts::SpeechSynthesizer;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

pub struct AppState<S, R, G>
where
    S: Surface,
    R: Reasoner,
    G: IntentGuard,
{
    pub agent: Arc<Agent<S, R, G>>,
    pub sessions: SessionStore,
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
}

impl<S, R, G> Clone for AppState<S, R, G>
where
    S: Surface,
    R: Reasoner,
    G: IntentGuard,
{
    fn clone(&self) -> Self {
        Self {
            agent: self.agent.clone(),
            sessions: self.sessions.clone(),
            speech: self.speech.clone(),
            recognizer: self.recognizer.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default = "default_session")]
    pub session_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_session() -> String {
    "default".into()
}

#[derive(Debug, Deserialize)]
pub struct NavigateRequest {
    pub url: String,
}

pub struct ApiError(SurfaceError);

impl From<SurfaceError> for ApiError {
    fn from(e: SurfaceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("browser request failed: {}", self.0);
        (StatusCode::BAD_GATEWAY, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub fn router<S, R, G>(state: AppState<S, R, G>) -> Router
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    Router::new()
        .route("/chat", post(chat::<S, R, G>))
        .route("/navigate", post(navigate::<S, R, G>))
        .route("/screenshot", get(screenshot::<S, R, G>))
        .route("/transcribe", post(transcribe::<S, R, G>))
        .route("/health", get(health))
        .route("/sessions/{id}", delete(close_session::<S, R, G>))
        .with_state(state)
}

pub async fn serve<S, R, G>(state: AppState<S, R, G>, cfg: &ServerConfig) -> anyhow::Result<()>
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    let sessions = state.sessions.clone();
    let max_idle = cfg.session_idle;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            sessions.evict_idle(max_idle).await;
        }
    });

    let app = router(state).layer(cors_layer(&cfg.cors_origins));
    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    info!(addr = %cfg.bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn chat<S, R, G>(
    State(state): State<AppState<S, R, G>>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    info!(session = %req.session_id, chars = req.message.chars().count(), "chat request");
    let slot = state.sessions.get_or_create(&req.session_id, req.url.as_deref()).await;
    // stops the session's previous loop; its state lock is released once it has wound down
    let cancel = slot.begin_run().await;

    let (sink, stream) = events::channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let relay = spawn_relay(stream, out_tx.clone(), state.speech.clone());
    let pacer: Box<dyn Pacer> = match state.speech {
        Some(_) => Box::new(SpeechPacer::new(sink.clone())),
        None => Box::new(ReadingPacer::default()),
    };
    let hooks = RunHooks { events: sink, pacer };

    let agent = state.agent.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut session = slot.lock().await;
        if let Some(url) = req.url {
            session.target_url = url;
        }
        agent.respond(&mut session, &req.message, &hooks, &token).await;
        drop(session);
        slot.touch().await;
        // closing the event channel lets the relay finish pending speech
        drop(hooks);
        if let Err(e) = relay.await {
            error!("narration relay failed: {e}");
        }
        let _ = out_tx.send(AgentEvent::End);
    });

    // a client that goes away cancels its run
    let guard = cancel.drop_guard();
    let stream = UnboundedReceiverStream::new(out_rx).map(move |ev| {
        let _held = &guard;
        let data = serde_json::to_string(&ev).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn navigate<S, R, G>(
    State(state): State<AppState<S, R, G>>,
    Json(req): Json<NavigateRequest>,
) -> Result<Json<Value>, ApiError>
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    let shot = state.agent.navigate(&req.url).await?;
    Ok(Json(json!({ "screenshot": shot.data })))
}

async fn screenshot<S, R, G>(State(state): State<AppState<S, R, G>>) -> Result<Json<Value>, ApiError>
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    let shot = state.agent.screenshot().await?;
    Ok(Json(json!({ "screenshot": shot.data })))
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn transcribe<S, R, G>(State(state): State<AppState<S, R, G>>, mut form: Multipart) -> Response
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    let Some(recognizer) = state.recognizer.clone() else {
        return failure(StatusCode::SERVICE_UNAVAILABLE, "speech recognition is not configured");
    };
    let mut upload = None;
    loop {
        match form.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => {
                let content_type = field.content_type().unwrap_or("audio/webm").to_string();
                match field.bytes().await {
                    Ok(bytes) => upload = Some((bytes, content_type)),
                    Err(e) => return failure(StatusCode::BAD_REQUEST, &e.to_string()),
                }
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => return failure(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    }
    let Some((audio, content_type)) = upload.filter(|(audio, _)| !audio.is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "empty audio file");
    };
    match recognizer.transcribe(audio.to_vec(), &content_type).await {
        Ok(Some(transcript)) => Json(json!({ "transcript": transcript })).into_response(),
        Ok(None) => failure(StatusCode::INTERNAL_SERVER_ERROR, "transcription failed"),
        Err(e) => {
            error!("transcription failed: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "transcription failed")
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn close_session<S, R, G>(State(state): State<AppState<S, R, G>>, Path(id): Path<String>) -> StatusCode
where
    S: Surface + 'static,
    R: Reasoner + 'static,
    G: IntentGuard + 'static,
{
    if state.sessions.close(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::agent::AgentConfig;
    use crate::reasoning::{AllowAllGuard, CallError, ModelResponse, StopReason};
    use crate::session::{ContentBlock, Screenshot, Turn};
    use crate::tts::SpeechError;
    use async_trait::async_trait;
    use reqwest::multipart::{Form, Part};

    struct StillSurface;

    #[async_trait]
    impl Surface for StillSurface {
        async fn screenshot(&self) -> Result<Screenshot, SurfaceError> {
            Ok(Screenshot::jpeg(b"frame"))
        }
        async fn perform(&self, _action: &Action) -> Result<(), SurfaceError> {
            Ok(())
        }
        async fn query_page(&self, _expression: &str) -> Result<String, SurfaceError> {
            Ok(String::new())
        }
        async fn navigate(&self, url: &str) -> Result<Screenshot, SurfaceError> {
            if url.is_empty() {
                return Err(SurfaceError::Browser("empty url".into()));
            }
            Ok(Screenshot::jpeg(url.as_bytes()))
        }
    }

    struct Greeter;

    #[async_trait]
    impl Reasoner for Greeter {
        async fn stream(
            &self,
            _history: &[Turn],
            _system_prompt: &str,
            on_text: &mut (dyn for<'t> FnMut(&'t str) + Send),
        ) -> Result<ModelResponse, CallError> {
            on_text("Welcome aboard.");
            Ok(ModelResponse {
                content: vec![ContentBlock::Text { text: "Welcome aboard.".into() }],
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    struct Scribe;

    #[async_trait]
    impl SpeechRecognizer for Scribe {
        async fn transcribe(&self, audio: Vec<u8>, content_type: &str) -> Result<Option<String>, SpeechError> {
            Ok(Some(format!("{} bytes of {content_type}", audio.len())))
        }
    }

    async fn spawn_app() -> (String, SessionStore) {
        spawn_app_with(None).await
    }

    async fn spawn_app_with(recognizer: Option<Arc<dyn SpeechRecognizer>>) -> (String, SessionStore) {
        let agent = Agent::new(Arc::new(StillSurface), Greeter, AllowAllGuard, AgentConfig::default());
        let sessions = SessionStore::new();
        let state = AppState {
            agent: Arc::new(agent),
            sessions: sessions.clone(),
            speech: None,
            recognizer,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{addr}"), sessions)
    }

    fn sse_payloads(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn chat_streams_events_and_ends() {
        let (base, sessions) = spawn_app().await;
        let body = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&json!({"message": "hello", "session_id": "s1", "url": "https://example.com"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let events = sse_payloads(&body);
        assert_eq!(events.first().unwrap()["type"], "screenshot");
        assert!(events.contains(&json!({"type": "token", "content": "Welcome aboard."})));
        assert_eq!(events.last().unwrap(), &json!({"type": "end"}));

        let slot = sessions.get("s1").await.unwrap();
        let session = slot.lock().await;
        assert_eq!(session.target_url, "https://example.com");
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn browser_and_session_routes() {
        let (base, sessions) = spawn_app().await;
        let http = reqwest::Client::new();

        let health: Value = http.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
        assert_eq!(health, json!({"status": "ok"}));

        let shot: Value = http.get(format!("{base}/screenshot")).send().await.unwrap().json().await.unwrap();
        assert_eq!(shot["screenshot"], Screenshot::jpeg(b"frame").data);

        let failed = http
            .post(format!("{base}/navigate"))
            .json(&json!({"url": ""}))
            .send()
            .await
            .unwrap();
        assert_eq!(failed.status(), reqwest::StatusCode::BAD_GATEWAY);

        sessions.get_or_create("s2", None).await;
        let closed = http.delete(format!("{base}/sessions/s2")).send().await.unwrap();
        assert_eq!(closed.status(), reqwest::StatusCode::NO_CONTENT);
        let missing = http.delete(format!("{base}/sessions/s2")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    fn clip(bytes: &'static [u8]) -> Form {
        Form::new().part("file", Part::bytes(bytes).file_name("clip.ogg").mime_str("audio/ogg").unwrap())
    }

    #[tokio::test]
    async fn transcribe_is_unavailable_without_a_recognizer() {
        let (base, _) = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/transcribe"))
            .multipart(clip(b"OggS"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn transcribe_returns_the_transcript() {
        let (base, _) = spawn_app_with(Some(Arc::new(Scribe))).await;
        let http = reqwest::Client::new();

        let body: Value = http
            .post(format!("{base}/transcribe"))
            .multipart(clip(b"OggS"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"transcript": "4 bytes of audio/ogg"}));

        let empty = http
            .post(format!("{base}/transcribe"))
            .multipart(clip(b""))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
