use anyhow::Result;
use screen_operator::server::{self, AppState};
use screen_operator::stt::{ElevenLabsScribe, SpeechRecognizer};
use screen_operator::tts::{ElevenLabs, SpeechSynthesizer};
use screen_operator::{Agent, AnthropicClient, Browser, SessionStore, Settings};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    let browser = Arc::new(Browser::start(settings.browser.clone()).await?);
    if let Err(e) = browser.goto(&settings.server.start_url).await {
        warn!("could not open start page: {e}");
    }

    let client = AnthropicClient::new(settings.reasoning.clone())?;
    let agent = Agent::new(browser, client.clone(), client, settings.agent.clone());

    let (speech, recognizer): (Option<Arc<dyn SpeechSynthesizer>>, Option<Arc<dyn SpeechRecognizer>>) =
        if settings.speech.enabled() {
            (
                Some(Arc::new(ElevenLabs::new(settings.speech.clone())?)),
                Some(Arc::new(ElevenLabsScribe::new(settings.speech.clone())?)),
            )
        } else {
            info!("speech disabled; narration is paced by reading time and /transcribe is unavailable");
            (None, None)
        };

    let state = AppState {
        agent: Arc::new(agent),
        sessions: SessionStore::new(),
        speech,
        recognizer,
    };
    server::serve(state, &settings.server).await
}
