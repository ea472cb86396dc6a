use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::debug;

/// Everything the loop tells the outside world, in order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Token { content: String },
    ToolStart { content: String },
    Screenshot { content: String },
    CursorMove { x: i64, y: i64 },
    Audio { content: String },
    End,
}

impl AgentEvent {
    pub fn token(text: impl Into<String>) -> Self {
        AgentEvent::Token { content: text.into() }
    }

    pub fn tool_start(action: &str) -> Self {
        AgentEvent::ToolStart { content: format!("Action: {action}") }
    }
}

pub(crate) enum Envelope {
    Event(AgentEvent),
    /// Resolved by the consumer once everything sent before it has been handled.
    Barrier(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}

impl EventSink {
    pub fn emit(&self, event: AgentEvent) {
        if self.tx.send(Envelope::Event(event)).is_err() {
            debug!("event dropped: consumer gone");
        }
    }

    /// Waits until the consumer has caught up with every event emitted so far.
    /// Returns immediately if the consumer is gone.
    pub async fn barrier(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Envelope::Barrier(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

impl EventStream {
    /// Next event; barriers are acknowledged as they pass.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            match self.rx.recv().await? {
                Envelope::Event(ev) => return Some(ev),
                Envelope::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    pub(crate) async fn recv_envelope(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

// ========================= Pacing =========================

/// Invoked once per iteration, after narration and before the first action,
/// so spoken or read narration can finish before the screen changes.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn before_actions(&self, narrated_chars: usize);
}

/// Approximates reading time when nothing is spoken aloud.
#[derive(Clone, Debug)]
pub struct ReadingPacer {
    pub chars_per_sec: f64,
    pub max_delay: Duration,
}

impl Default for ReadingPacer {
    fn default() -> Self {
        // ~150 words per minute
        Self {
            chars_per_sec: 12.5,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReadingPacer {
    pub fn delay_for(&self, narrated_chars: usize) -> Duration {
        if narrated_chars == 0 || self.chars_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(narrated_chars as f64 / self.chars_per_sec).min(self.max_delay)
    }
}

#[async_trait]
impl Pacer for ReadingPacer {
    async fn before_actions(&self, narrated_chars: usize) {
        let delay = self.delay_for(narrated_chars);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoPacing;

#[async_trait]
impl Pacer for NoPacing {
    async fn before_actions(&self, _narrated_chars: usize) {}
}

/// What a single run reports into.
pub struct RunHooks {
    pub events: EventSink,
    pub pacer: Box<dyn Pacer>,
}

impl RunHooks {
    pub fn new(events: EventSink, pacer: impl Pacer + 'static) -> Self {
        Self {
            events,
            pacer: Box::new(pacer),
        }
    }
}
