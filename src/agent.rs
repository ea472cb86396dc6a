use crate::actions::{request_label, ActionExecutor, ActionOutcome, ExecutorConfig, Point, Surface, SurfaceError};
use crate::events::{AgentEvent, RunHooks};
use crate::history;
use crate::prompts::{system_prompt, REJECTION};
use crate::reasoning::{CallError, Intent, IntentGuard, Reasoner, StopReason};
use crate::session::{ActionRequest, ActionResult, ContentBlock, Screenshot, Session, Turn};
use futures::FutureExt;
use nanoid::nanoid;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const CANCELLED: &str = "Action cancelled by user";

// ========================= Core Types =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub max_history_pairs: usize,
    pub executor: ExecutorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            max_history_pairs: 5,
            executor: ExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AgentError {
    #[error("{0}")]
    Call(#[from] CallError),
    #[error("{0}")]
    Surface(#[from] SurfaceError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// What the user hears instead of narration when a run fails.
    pub fn apology(&self) -> String {
        format!("Sorry, an error occurred: {self}")
    }
}

// ========================= Agent Core =========================

pub struct Agent<S, R, G>
where
    S: Surface,
    R: Reasoner,
    G: IntentGuard,
{
    surface: Arc<S>,
    // one browser is shared by every session; actions from different runs must not interleave
    surface_busy: Mutex<()>,
    executor: ActionExecutor<S>,
    reasoner: R,
    guard: G,
    cfg: AgentConfig,
}

impl<S, R, G> Agent<S, R, G>
where
    S: Surface,
    R: Reasoner,
    G: IntentGuard,
{
    pub fn new(surface: Arc<S>, reasoner: R, guard: G, cfg: AgentConfig) -> Self {
        let executor = ActionExecutor::new(surface.clone(), cfg.executor.clone());
        Self {
            surface,
            surface_busy: Mutex::new(()),
            executor,
            reasoner,
            guard,
            cfg,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Navigates the shared surface, waiting for any action in flight.
    pub async fn navigate(&self, url: &str) -> Result<Screenshot, SurfaceError> {
        let _busy = self.surface_busy.lock().await;
        self.surface.navigate(url).await
    }

    pub async fn screenshot(&self) -> Result<Screenshot, SurfaceError> {
        let _busy = self.surface_busy.lock().await;
        self.surface.screenshot().await
    }

    async fn refresh_url(&self, session: &mut Session) {
        match self.surface.current_url().await {
            Ok(url) if !url.is_empty() => session.current_url = url,
            Ok(_) => {}
            Err(e) => debug!("current url unavailable: {e}"),
        }
    }

    /// Like [`Agent::run`], but a failed run is turned into an apology that is
    /// streamed as narration and returned. History stays valid either way.
    pub async fn respond(
        &self,
        session: &mut Session,
        user_message: &str,
        hooks: &RunHooks,
        cancel: &CancellationToken,
    ) -> String {
        match self.run(session, user_message, hooks, cancel).await {
            Ok(text) => text,
            Err(e) => {
                error!(session = %session.id, "run failed: {e}");
                let apology = e.apology();
                hooks.events.emit(AgentEvent::token(apology.as_str()));
                apology
            }
        }
    }

    /// Runs one user message to completion and returns the collected narration.
    pub async fn run(
        &self,
        session: &mut Session,
        user_message: &str,
        hooks: &RunHooks,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let run_id = nanoid!(10);
        let span = info_span!("run", session = %session.id, run = %run_id);
        self.run_inner(session, user_message, hooks, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        session: &mut Session,
        user_message: &str,
        hooks: &RunHooks,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        if let Err(violations) = history::validate(&session.messages) {
            for v in &violations {
                warn!("history violation on entry: {v}");
            }
        }
        if cancel.is_cancelled() {
            info!("cancelled before start");
            return Ok(String::new());
        }

        // guarding
        let verdict = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(String::new()),
            verdict = self.guard.classify(user_message) => verdict,
        };
        match verdict {
            Ok(Intent::OffTopic) => {
                info!("message rejected by intent guard");
                hooks.events.emit(AgentEvent::token(REJECTION));
                return Ok(REJECTION.to_string());
            }
            Ok(Intent::OnTopic) => {}
            Err(e) => warn!("intent guard unavailable, continuing: {e}"),
        }

        // drafting
        let shot = self.screenshot().await?;
        hooks.events.emit(AgentEvent::Screenshot { content: shot.data.clone() });
        session.last_screenshot = Some(shot.clone());
        self.refresh_url(session).await;
        if history::repair_trailing_orphan(&mut session.messages) {
            warn!("dropped unanswered action requests left by an interrupted run");
        }
        session.messages.push(Turn::user(vec![
            ContentBlock::Text { text: user_message.to_string() },
            ContentBlock::Image { source: shot },
        ]));
        session.messages = history::truncate(std::mem::take(&mut session.messages), self.cfg.max_history_pairs);

        let system = system_prompt(session);
        let mut collected: Vec<String> = Vec::new();
        let mut iteration = 0;
        loop {
            if iteration >= self.cfg.max_iterations {
                warn!(max = self.cfg.max_iterations, "iteration ceiling reached");
                break;
            }
            iteration += 1;
            if cancel.is_cancelled() {
                info!(iteration, "cancelled at iteration boundary");
                break;
            }
            info!(iteration, turns = session.messages.len(), "reasoning");

            // streaming
            let mut narrated = 0usize;
            let mut on_text = |t: &str| {
                narrated += t.chars().count();
                hooks.events.emit(AgentEvent::token(t));
            };
            let streamed = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = self.reasoner.stream(&session.messages, &system, &mut on_text) => Some(response),
            };
            let Some(response) = streamed else {
                info!(iteration, "cancelled while streaming; response discarded");
                break;
            };
            let response = response?;

            // classifying
            let requests = response.action_requests();
            collected.extend(response.texts().map(str::to_string));
            if response.content.is_empty() {
                info!(iteration, "empty response");
                break;
            }
            let stop_reason = response.stop_reason;
            session.messages.push(Turn::assistant(response.content));
            if requests.is_empty() {
                info!(iteration, ?stop_reason, "narration complete");
                break;
            }
            if stop_reason == StopReason::EndTurn {
                // requests alongside a natural stop are treated as noise
                let dropped = session
                    .messages
                    .last_mut()
                    .map(history::strip_action_requests)
                    .unwrap_or_default();
                if session.messages.last().is_some_and(|t| t.content.is_empty()) {
                    session.messages.pop();
                }
                warn!(iteration, dropped, "action requests discarded on end_turn");
                break;
            }

            // acting
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = hooks.pacer.before_actions(narrated) => {}
            }
            let (results, failure) = self.act(session, &requests, hooks, cancel).await;
            self.refresh_url(session).await;
            session
                .messages
                .push(Turn::user(results.into_iter().map(ContentBlock::ActionResult).collect()));
            if let Some(msg) = failure {
                return Err(AgentError::Internal(msg));
            }
        }

        Ok(collected.join("\n"))
    }

    /// Executes `requests` in order and answers every one of them: executed,
    /// failed, cancelled, or abandoned after a panic. The second value carries
    /// the panic message, if any.
    async fn act(
        &self,
        session: &mut Session,
        requests: &[ActionRequest],
        hooks: &RunHooks,
        cancel: &CancellationToken,
    ) -> (Vec<ActionResult>, Option<String>) {
        let mut results = Vec::with_capacity(requests.len());
        let mut failure = None;
        let events = &hooks.events;
        let on_cursor = |p: Point| events.emit(AgentEvent::CursorMove { x: p.x, y: p.y });

        for request in requests {
            if cancel.is_cancelled() {
                info!(completed = results.len(), total = requests.len(), "cancelled between actions");
                break;
            }
            let label = request_label(request);
            events.emit(AgentEvent::tool_start(label));

            let busy = self.surface_busy.lock().await;
            let outcome = AssertUnwindSafe(self.executor.execute(request, &on_cursor))
                .catch_unwind()
                .await;
            drop(busy);
            match outcome {
                Ok(Ok(ActionOutcome::Screenshot(shot))) => {
                    events.emit(AgentEvent::Screenshot { content: shot.data.clone() });
                    session.last_screenshot = Some(shot.clone());
                    results.push(ActionResult::image(&request.id, shot));
                }
                Ok(Ok(ActionOutcome::Text(text))) => {
                    results.push(ActionResult::text(&request.id, text));
                }
                Ok(Err(e)) => {
                    warn!(action = label, "action failed: {e}");
                    results.push(ActionResult::error(&request.id, format!("Error: {e}")));
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(action = label, "action panicked: {msg}");
                    failure = Some(msg);
                    break;
                }
            }
        }

        let filler = match &failure {
            Some(msg) => format!("Error: {msg}"),
            None => CANCELLED.to_string(),
        };
        for request in &requests[results.len()..] {
            results.push(ActionResult::error(&request.id, filler.as_str()));
        }
        (results, failure)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "action panicked".to_string())
}
