pub mod actions;
pub mod agent;
pub mod browser;
pub mod config;
pub mod events;
pub mod history;
pub mod narration;
pub mod prompts;
pub mod reasoning;
pub mod server;
pub mod session;
pub mod stt;
pub mod tts;

pub use agent::{Agent, AgentConfig, AgentError};
pub use browser::{Browser, BrowserConfig};
pub use config::Settings;
pub use events::{AgentEvent, RunHooks};
pub use reasoning::{AnthropicClient, ReasoningConfig};
pub use session::{Session, SessionStore};
