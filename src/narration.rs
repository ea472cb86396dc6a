//! Turns streamed narration into speech and holds actions back until the
//! speech for everything narrated so far has been produced.

use crate::events::{AgentEvent, EventSink, EventStream, Envelope, Pacer};
use crate::tts::SpeechSynthesizer;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Clause breaks only flush once the buffer is at least this long.
pub const CLAUSE_FLUSH_MIN_CHARS: usize = 60;

pub fn is_sentence_end(buf: &str) -> bool {
    matches!(buf.trim_end().chars().last(), Some('.' | '!' | '?'))
}

pub fn is_clause_break(buf: &str) -> bool {
    let trimmed = buf.trim_end();
    buf[trimmed.len()..].contains('\n')
        || matches!(trimmed.chars().last(), Some(',' | ';' | ':' | '\u{2014}' | '-'))
}

#[derive(Debug, Default)]
pub struct SentenceChunker {
    buf: String,
}

impl SentenceChunker {
    /// Buffers `text`; returns a chunk once a sentence or a long clause is complete.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buf.push_str(text);
        let ready = is_sentence_end(&self.buf)
            || (self.buf.chars().count() >= CLAUSE_FLUSH_MIN_CHARS && is_clause_break(&self.buf));
        if ready {
            self.take()
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Option<String> {
        let chunk = self.buf.trim().to_string();
        self.buf.clear();
        (!chunk.is_empty()).then_some(chunk)
    }
}

struct SpeechWorker {
    queue: mpsc::UnboundedSender<String>,
    pending: Arc<watch::Sender<usize>>,
    handle: JoinHandle<()>,
}

impl SpeechWorker {
    fn spawn(speech: Arc<dyn SpeechSynthesizer>, out: mpsc::UnboundedSender<AgentEvent>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<String>();
        let pending = Arc::new(watch::channel(0usize).0);
        let counter = pending.clone();
        let handle = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                match speech.synthesize(&text).await {
                    Ok(Some(audio)) => {
                        let _ = out.send(AgentEvent::Audio { content: B64.encode(audio) });
                    }
                    Ok(None) => {}
                    Err(e) => error!("speech worker: {e}"),
                }
                counter.send_modify(|n| *n = n.saturating_sub(1));
            }
        });
        Self { queue, pending, handle }
    }

    fn say(&self, text: String) {
        debug!(chars = text.chars().count(), "queued for speech");
        self.pending.send_modify(|n| *n += 1);
        if self.queue.send(text).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    async fn idle(&self) {
        let mut rx = self.pending.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn finish(self) {
        drop(self.queue);
        if let Err(e) = self.handle.await {
            error!("speech worker stopped abnormally: {e}");
        }
    }
}

/// Forwards the loop's events to `out`. With a synthesizer, narration is
/// chunked into speech and barriers wait for the speech queue to drain.
pub fn spawn_relay(
    stream: EventStream,
    out: mpsc::UnboundedSender<AgentEvent>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
) -> JoinHandle<()> {
    tokio::spawn(relay(stream, out, speech))
}

async fn relay(
    mut stream: EventStream,
    out: mpsc::UnboundedSender<AgentEvent>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
) {
    let Some(speech) = speech else {
        while let Some(ev) = stream.recv().await {
            let _ = out.send(ev);
        }
        return;
    };

    let worker = SpeechWorker::spawn(speech, out.clone());
    let mut chunker = SentenceChunker::default();
    while let Some(envelope) = stream.recv_envelope().await {
        match envelope {
            Envelope::Event(AgentEvent::Token { content }) => {
                let ready = chunker.push(&content);
                let _ = out.send(AgentEvent::Token { content });
                if let Some(chunk) = ready {
                    worker.say(chunk);
                }
            }
            Envelope::Event(ev @ AgentEvent::ToolStart { .. }) => {
                // speak during the action rather than after it
                if let Some(chunk) = chunker.take() {
                    worker.say(chunk);
                }
                let _ = out.send(ev);
            }
            Envelope::Event(ev) => {
                let _ = out.send(ev);
            }
            Envelope::Barrier(ack) => {
                if let Some(chunk) = chunker.take() {
                    worker.say(chunk);
                }
                worker.idle().await;
                let _ = ack.send(());
            }
        }
    }
    if let Some(chunk) = chunker.take() {
        worker.say(chunk);
    }
    worker.finish().await;
}

/// Speak-then-act pacing: waits for the relay to voice everything narrated so far.
#[derive(Clone)]
pub struct SpeechPacer {
    events: EventSink,
}

impl SpeechPacer {
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Pacer for SpeechPacer {
    async fn before_actions(&self, _narrated_chars: usize) {
        self.events.barrier().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::channel;
    use crate::tts::SpeechError;

    struct EchoSpeech;

    #[async_trait]
    impl SpeechSynthesizer for EchoSpeech {
        async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>, SpeechError> {
            Ok(Some(text.as_bytes().to_vec()))
        }
    }

    fn audio_of(text: &str) -> AgentEvent {
        AgentEvent::Audio { content: B64.encode(text) }
    }

    #[test]
    fn sentence_and_clause_boundaries() {
        assert!(is_sentence_end("Done. "));
        assert!(is_sentence_end("Really?"));
        assert!(!is_sentence_end("Almost"));
        assert!(is_clause_break("first part,"));
        assert!(is_clause_break("a line\n"));
        assert!(is_clause_break("wait \u{2014} "));
        assert!(!is_clause_break("plain words"));
    }

    #[test]
    fn chunker_flushes_sentences_and_long_clauses() {
        let mut c = SentenceChunker::default();
        assert_eq!(c.push("Let me open"), None);
        assert_eq!(c.push(" the menu. "), Some("Let me open the menu.".into()));

        // a short clause waits for more text
        assert_eq!(c.push("First,"), None);
        let long = " then we scroll all the way down to the pricing table and compare,";
        assert_eq!(c.push(long), Some(format!("First,{long}").trim().to_string()));

        assert_eq!(c.push("   "), None);
        assert_eq!(c.take(), None);
    }

    #[tokio::test]
    async fn relay_speaks_before_barrier_resolves() {
        let (sink, stream) = channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let relay = spawn_relay(stream, out_tx, Some(Arc::new(EchoSpeech)));

        sink.emit(AgentEvent::token("Hello there."));
        sink.emit(AgentEvent::token(" Next I click"));
        SpeechPacer::new(sink.clone()).before_actions(24).await;

        let mut seen = Vec::new();
        while let Ok(ev) = out_rx.try_recv() {
            seen.push(ev);
        }
        assert!(seen.contains(&AgentEvent::token("Hello there.")));
        assert!(seen.contains(&audio_of("Hello there.")));
        assert!(seen.contains(&audio_of("Next I click")));

        sink.emit(AgentEvent::tool_start("left_click"));
        drop(sink);
        relay.await.unwrap();
        let mut rest = Vec::new();
        while let Ok(ev) = out_rx.try_recv() {
            rest.push(ev);
        }
        assert_eq!(rest, vec![AgentEvent::tool_start("left_click")]);
    }

    #[tokio::test]
    async fn relay_without_speech_forwards_in_order() {
        let (sink, stream) = channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let relay = spawn_relay(stream, out_tx, None);
        sink.emit(AgentEvent::token("a"));
        sink.emit(AgentEvent::CursorMove { x: 1, y: 2 });
        drop(sink);
        relay.await.unwrap();
        assert_eq!(out_rx.recv().await, Some(AgentEvent::token("a")));
        assert_eq!(out_rx.recv().await, Some(AgentEvent::CursorMove { x: 1, y: 2 }));
        assert_eq!(out_rx.recv().await, None);
    }
}
