use crate::tts::{SpeechConfig, SpeechError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcript of `audio`, or `None` when nothing was recognised.
    async fn transcribe(&self, audio: Vec<u8>, content_type: &str) -> Result<Option<String>, SpeechError>;
}

fn upload_name(content_type: &str) -> &'static str {
    match content_type {
        "audio/ogg" => "audio.ogg",
        "audio/mp4" => "audio.mp4",
        "audio/wav" => "audio.wav",
        "audio/mpeg" => "audio.mp3",
        _ => "audio.webm",
    }
}

#[derive(Debug, Deserialize)]
struct Transcript {
    #[serde(default)]
    text: String,
}

#[derive(Clone)]
pub struct ElevenLabsScribe {
    http: Client,
    cfg: SpeechConfig,
}

impl ElevenLabsScribe {
    pub fn new(cfg: SpeechConfig) -> Result<Self, SpeechError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, cfg })
    }
}

#[async_trait]
impl SpeechRecognizer for ElevenLabsScribe {
    async fn transcribe(&self, audio: Vec<u8>, content_type: &str) -> Result<Option<String>, SpeechError> {
        if audio.is_empty() {
            return Ok(None);
        }
        let bytes = audio.len();
        let file = Part::bytes(audio)
            .file_name(upload_name(content_type))
            .mime_str(content_type)?;
        let form = Form::new()
            .text("model_id", self.cfg.stt_model.clone())
            .part("file", file);
        let resp = self
            .http
            .post(format!("{}/speech-to-text", self.cfg.api_base))
            .header("xi-api-key", &self.cfg.api_key)
            .multipart(form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            return Err(SpeechError::Status { status: status.as_u16(), body });
        }
        let transcript: Transcript = resp.json().await?;
        let text = transcript.text.trim();
        info!(bytes, chars = text.chars().count(), "speech transcribed");
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}
