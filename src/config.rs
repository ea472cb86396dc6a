//! Process configuration, read from the environment (and `.env` when present).

use crate::agent::AgentConfig;
use crate::browser::BrowserConfig;
use crate::reasoning::{ReasoningConfig, RetryPolicy};
use crate::tts::SpeechConfig;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    pub start_url: String,
    pub session_idle: Duration,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub reasoning: ReasoningConfig,
    pub agent: AgentConfig,
    pub browser: BrowserConfig,
    pub speech: SpeechConfig,
    pub server: ServerConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        // a missing .env is normal outside development
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let viewport = match var("OPERATOR_VIEWPORT") {
            Some(raw) => parse_viewport(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "OPERATOR_VIEWPORT",
                value: raw.clone(),
                reason: "expected WIDTHxHEIGHT".into(),
            })?,
            None => (1280, 800),
        };

        let reasoning_defaults = ReasoningConfig::default();
        let retry_defaults = RetryPolicy::default();
        let reasoning = ReasoningConfig {
            api_base: var("ANTHROPIC_BASE_URL")
                .map(|b| b.trim_end_matches('/').to_string())
                .unwrap_or(reasoning_defaults.api_base),
            api_key: var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: var("OPERATOR_MODEL").unwrap_or(reasoning_defaults.model),
            guard_model: var("OPERATOR_GUARD_MODEL").unwrap_or(reasoning_defaults.guard_model),
            beta: var("ANTHROPIC_COMPUTER_USE_BETA").unwrap_or(reasoning_defaults.beta),
            max_tokens: parsed(&var, "OPERATOR_MAX_TOKENS", reasoning_defaults.max_tokens)?,
            viewport,
            retry: RetryPolicy {
                max_attempts: parsed(&var, "OPERATOR_RETRY_ATTEMPTS", retry_defaults.max_attempts)?.max(1),
                min_wait: Duration::from_millis(parsed(&var, "OPERATOR_RETRY_MIN_MS", 2000)?),
                max_wait: Duration::from_millis(parsed(&var, "OPERATOR_RETRY_MAX_MS", 30_000)?),
                ..retry_defaults
            },
        };

        let agent_defaults = AgentConfig::default();
        let mut agent = AgentConfig {
            max_iterations: parsed(&var, "OPERATOR_MAX_ITERATIONS", agent_defaults.max_iterations)?,
            max_history_pairs: parsed(&var, "OPERATOR_MAX_HISTORY_PAIRS", agent_defaults.max_history_pairs)?.max(1),
            executor: agent_defaults.executor,
        };
        agent.executor.viewport = viewport;

        let browser = BrowserConfig {
            headless: match var("OPERATOR_HEADLESS") {
                Some(raw) => parse_bool(&raw).ok_or(ConfigError::Invalid {
                    key: "OPERATOR_HEADLESS",
                    value: raw.clone(),
                    reason: "expected true or false".into(),
                })?,
                None => true,
            },
            viewport,
            ws_url: var("CHROME_WS_URL"),
            user_agent: var("OPERATOR_USER_AGENT"),
        };

        let speech_defaults = SpeechConfig::default();
        let speech = SpeechConfig {
            api_key: var("ELEVENLABS_API_KEY").unwrap_or_default(),
            voice_id: var("ELEVENLABS_VOICE_ID").unwrap_or(speech_defaults.voice_id),
            model_id: var("ELEVENLABS_MODEL_ID").unwrap_or(speech_defaults.model_id),
            stt_model: var("ELEVENLABS_STT_MODEL").unwrap_or(speech_defaults.stt_model),
            api_base: speech_defaults.api_base,
        };

        let server = ServerConfig {
            bind: parsed(&var, "OPERATOR_BIND", SocketAddr::from(([127, 0, 0, 1], 8000)))?,
            cors_origins: var("CORS_ORIGINS")
                .unwrap_or_else(|| "http://localhost:5173,http://127.0.0.1:5173".into())
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            start_url: var("DEMO_START_URL").unwrap_or_else(|| "about:blank".into()),
            session_idle: Duration::from_secs(parsed(&var, "OPERATOR_SESSION_IDLE_SECS", 1800)?),
        };

        Ok(Self { reasoning, agent, browser, speech, server })
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

pub fn parse_viewport(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.split_once(['x', 'X'])?;
    let w = w.trim().parse().ok().filter(|w: &u32| *w > 0)?;
    let h = h.trim().parse().ok().filter(|h: &u32| *h > 0)?;
    Some((w, h))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.agent.max_iterations, 15);
        assert_eq!(s.agent.max_history_pairs, 5);
        assert_eq!(s.reasoning.retry.max_attempts, 3);
        assert_eq!(s.reasoning.retry.min_wait, Duration::from_secs(2));
        assert_eq!(s.reasoning.viewport, (1280, 800));
        assert!(s.browser.headless);
        assert!(!s.speech.enabled());
        assert_eq!(s.server.bind.port(), 8000);
        assert_eq!(s.server.cors_origins.len(), 2);
        assert_eq!(s.server.start_url, "about:blank");
        assert_eq!(s.speech.stt_model, "scribe_v2");
    }

    #[test]
    fn overrides_flow_into_every_layer() {
        let s = settings(&[
            ("OPERATOR_VIEWPORT", "1440x900"),
            ("OPERATOR_MAX_ITERATIONS", "4"),
            ("OPERATOR_HEADLESS", "false"),
            ("ANTHROPIC_BASE_URL", "http://localhost:9000/v1/"),
            ("ELEVENLABS_API_KEY", "el-key"),
            ("CORS_ORIGINS", "https://a.test, ,https://b.test"),
            ("OPERATOR_BIND", "0.0.0.0:9100"),
        ])
        .unwrap();
        assert_eq!(s.browser.viewport, (1440, 900));
        assert_eq!(s.agent.executor.viewport, (1440, 900));
        assert_eq!(s.reasoning.viewport, (1440, 900));
        assert_eq!(s.agent.max_iterations, 4);
        assert!(!s.browser.headless);
        assert_eq!(s.reasoning.api_base, "http://localhost:9000/v1");
        assert!(s.speech.enabled());
        assert_eq!(s.server.cors_origins, vec!["https://a.test", "https://b.test"]);
        assert_eq!(s.server.bind.port(), 9100);
    }

    #[test]
    fn malformed_values_are_reported() {
        let err = settings(&[("OPERATOR_MAX_ITERATIONS", "many")]).unwrap_err();
        assert!(err.to_string().contains("OPERATOR_MAX_ITERATIONS"));
        assert!(settings(&[("OPERATOR_VIEWPORT", "wide")]).is_err());
        assert!(settings(&[("OPERATOR_HEADLESS", "maybe")]).is_err());
    }

    #[test]
    fn zero_counts_are_raised_to_one() {
        let s = settings(&[("OPERATOR_MAX_HISTORY_PAIRS", "0"), ("OPERATOR_RETRY_ATTEMPTS", "0")]).unwrap();
        assert_eq!(s.agent.max_history_pairs, 1);
        assert_eq!(s.reasoning.retry.max_attempts, 1);
    }

    #[test]
    fn viewport_parsing() {
        assert_eq!(parse_viewport("800X600"), Some((800, 600)));
        assert_eq!(parse_viewport("0x600"), None);
        assert_eq!(parse_viewport("800"), None);
    }
}
