use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("speech service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("speech request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Audio bytes for `text`, or `None` when there is nothing to say.
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, SpeechError>;
}

#[derive(Clone, Debug)]
pub struct SpeechConfig {
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub stt_model: String,
    pub api_base: String,
}

impl SpeechConfig {
    pub fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: "TxGEqnHWrfWFTfGW9XjX".into(),
            model_id: "eleven_turbo_v2_5".into(),
            stt_model: "scribe_v2".into(),
            api_base: "https://api.elevenlabs.io/v1".into(),
        }
    }
}

#[derive(Clone)]
pub struct ElevenLabs {
    http: Client,
    cfg: SpeechConfig,
}

impl ElevenLabs {
    pub fn new(cfg: SpeechConfig) -> Result<Self, SpeechError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, cfg })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabs {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, SpeechError> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let url = format!("{}/text-to-speech/{}/stream", self.cfg.api_base, self.cfg.voice_id);
        let body = json!({
            "text": text,
            "model_id": self.cfg.model_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75,
                "style": 0.15,
                "use_speaker_boost": true,
            },
            "output_format": "mp3_44100_128",
        });
        let resp = self
            .http
            .post(url)
            .header("xi-api-key", &self.cfg.api_key)
            .header("Accept", "audio/mpeg")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            return Err(SpeechError::Status { status: status.as_u16(), body });
        }
        let audio = resp.bytes().await?.to_vec();
        info!(bytes = audio.len(), chars = text.chars().count(), "speech generated");
        Ok(Some(audio))
    }
}
