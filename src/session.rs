use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

// ========================= Conversation Record =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A captured frame, serialized in the model's `source` shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    #[serde(rename = "type")]
    pub encoding: String,
    pub media_type: String,
    pub data: String,
}

impl Screenshot {
    pub fn from_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            encoding: "base64".into(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Self::from_base64("image/jpeg", B64.encode(bytes))
    }

    pub fn png(bytes: &[u8]) -> Self {
        Self::from_base64("image/png", B64.encode(bytes))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultContent {
    Text { text: String },
    Image { source: Screenshot },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub tool_use_id: String,
    pub content: Vec<ResultContent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ActionResult {
    pub fn image(request_id: &str, shot: Screenshot) -> Self {
        Self {
            tool_use_id: request_id.to_string(),
            content: vec![ResultContent::Image { source: shot }],
            is_error: false,
        }
    }

    pub fn text(request_id: &str, text: impl Into<String>) -> Self {
        Self {
            tool_use_id: request_id.to_string(),
            content: vec![ResultContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn error(request_id: &str, message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(request_id, message)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: Screenshot },
    #[serde(rename = "tool_use")]
    ActionRequest(ActionRequest),
    #[serde(rename = "tool_result")]
    ActionResult(ActionResult),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Turn {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    pub fn action_requests(&self) -> impl Iterator<Item = &ActionRequest> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ActionRequest(r) => Some(r),
            _ => None,
        })
    }

    pub fn action_results(&self) -> impl Iterator<Item = &ActionResult> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ActionResult(r) => Some(r),
            _ => None,
        })
    }

    pub fn has_action_requests(&self) -> bool {
        self.action_requests().next().is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Turn>,
    pub target_url: String,
    pub current_url: String,
    pub demo_stage: String,
    pub last_screenshot: Option<Screenshot>,
}

impl Session {
    pub fn new(id: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            target_url: target_url.into(),
            current_url: String::new(),
            demo_stage: "greeting".into(),
            last_screenshot: None,
        }
    }
}

// ========================= Session Store =========================

/// One live session: its conversation record plus the token of the loop
/// currently allowed to mutate it.
pub struct SessionSlot {
    state: Arc<Mutex<Session>>,
    active: Mutex<ActiveRun>,
    // state of a closed session with the same id whose loop may still be winding down
    predecessor: Option<Weak<Mutex<Session>>>,
}

struct ActiveRun {
    token: CancellationToken,
    touched: Instant,
}

impl SessionSlot {
    fn new(session: Session, predecessor: Option<Weak<Mutex<Session>>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(session)),
            active: Mutex::new(ActiveRun {
                token: CancellationToken::new(),
                touched: Instant::now(),
            }),
            predecessor,
        }
    }

    /// Cancels whichever loop currently owns the session and hands out the
    /// token for the next one. Pair with [`SessionSlot::lock`], which only
    /// resolves once the cancelled loop has released the state.
    pub async fn begin_run(&self) -> CancellationToken {
        let mut active = self.active.lock().await;
        active.token.cancel();
        active.token = CancellationToken::new();
        active.touched = Instant::now();
        active.token.clone()
    }

    pub async fn lock(&self) -> OwnedMutexGuard<Session> {
        if let Some(previous) = self.predecessor.as_ref().and_then(Weak::upgrade) {
            drop(previous.lock().await);
        }
        self.state.clone().lock_owned().await
    }

    pub async fn cancel(&self) {
        self.active.lock().await.token.cancel();
    }

    /// Restarts the idle clock; called when a run finishes.
    pub async fn touch(&self) {
        self.active.lock().await.touched = Instant::now();
    }

    fn is_running(&self) -> bool {
        self.state.try_lock().is_err()
    }

    async fn idle_for(&self) -> Duration {
        self.active.lock().await.touched.elapsed()
    }
}

#[derive(Default)]
struct Slots {
    live: HashMap<String, Arc<SessionSlot>>,
    retired: HashMap<String, Weak<Mutex<Session>>>,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    slots: Arc<Mutex<Slots>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session recreated under the id of a closed one does not get its
    /// state until the closed session's loop has stopped.
    pub async fn get_or_create(&self, id: &str, target_url: Option<&str>) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.live.get(id) {
            return slot.clone();
        }
        slots.retired.retain(|_, state| state.strong_count() > 0);
        let predecessor = slots.retired.remove(id);
        info!(session = id, "session created");
        let slot = Arc::new(SessionSlot::new(
            Session::new(id, target_url.unwrap_or_default()),
            predecessor,
        ));
        slots.live.insert(id.to_string(), slot.clone());
        slot
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.lock().await.live.get(id).cloned()
    }

    /// Removes the session, stops its loop and waits for it to release the
    /// state. Returns false if it was unknown.
    pub async fn close(&self, id: &str) -> bool {
        let slot = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.live.remove(id) else {
                return false;
            };
            slots.retired.insert(id.to_string(), Arc::downgrade(&slot.state));
            slot
        };
        slot.cancel().await;
        drop(slot.lock().await);
        info!(session = id, "session closed");
        true
    }

    /// Drops sessions idle for at least `max_idle`. Sessions with a loop in
    /// flight are never evicted.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut slots = self.slots.lock().await;
        let mut stale = Vec::new();
        for (id, slot) in slots.live.iter() {
            if !slot.is_running() && slot.idle_for().await >= max_idle {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            if let Some(slot) = slots.live.remove(id) {
                slot.cancel().await;
            }
        }
        if !stale.is_empty() {
            info!(evicted = stale.len(), "idle sessions evicted");
        }
        stale.len()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocks_serialize_to_wire_shape() {
        let turn = Turn::assistant(vec![
            ContentBlock::Text { text: "Opening settings.".into() },
            ContentBlock::ActionRequest(ActionRequest {
                id: "toolu_1".into(),
                name: "computer".into(),
                input: json!({"action": "left_click", "coordinate": [10, 20]}),
            }),
        ]);
        let v = serde_json::to_value(&turn).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][1]["type"], "tool_use");
        assert_eq!(v["content"][1]["id"], "toolu_1");
        assert_eq!(v["content"][1]["input"]["action"], "left_click");

        let results = Turn::user(vec![
            ContentBlock::ActionResult(ActionResult::image("toolu_1", Screenshot::jpeg(b"abc"))),
            ContentBlock::ActionResult(ActionResult::error("toolu_2", "Error: boom")),
        ]);
        let v = serde_json::to_value(&results).unwrap();
        assert_eq!(v["content"][0]["type"], "tool_result");
        assert_eq!(v["content"][0]["content"][0]["source"]["type"], "base64");
        assert!(v["content"][0].get("is_error").is_none());
        assert_eq!(v["content"][1]["is_error"], true);

        let back: Turn = serde_json::from_value(v).unwrap();
        assert_eq!(back, results);
    }

    #[tokio::test]
    async fn begin_run_cancels_previous_token() {
        let store = SessionStore::new();
        let slot = store.get_or_create("s1", Some("https://example.com")).await;
        let first = slot.begin_run().await;
        let second = slot.begin_run().await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(slot.lock().await.target_url, "https://example.com");
    }

    #[tokio::test]
    async fn close_cancels_and_evicts() {
        let store = SessionStore::new();
        let slot = store.get_or_create("s1", None).await;
        let token = slot.begin_run().await;
        assert!(store.close("s1").await);
        assert!(token.is_cancelled());
        assert!(store.is_empty().await);
        assert!(!store.close("s1").await);
    }

    #[tokio::test]
    async fn recreated_session_waits_for_closed_loop() {
        let store = SessionStore::new();
        let slot = store.get_or_create("s1", None).await;
        let token = slot.begin_run().await;
        let running = slot.lock().await;

        let closing = tokio::spawn({
            let store = store.clone();
            async move { store.close("s1").await }
        });
        token.cancelled().await;
        // the close cannot complete while the old loop still holds the state
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closing.is_finished());

        let fresh = store.get_or_create("s1", None).await;
        fresh.begin_run().await;
        let early = tokio::time::timeout(Duration::from_millis(50), fresh.lock()).await;
        assert!(early.is_err());

        drop(running);
        assert!(closing.await.unwrap());
        let state = tokio::time::timeout(Duration::from_secs(1), fresh.lock()).await.unwrap();
        assert!(state.messages.is_empty());
    }

    #[tokio::test]
    async fn running_sessions_are_not_evicted() {
        let store = SessionStore::new();
        let slot = store.get_or_create("busy", None).await;
        store.get_or_create("idle", None).await;
        let guard = slot.lock().await;
        assert_eq!(store.evict_idle(Duration::ZERO).await, 1);
        assert!(store.get("busy").await.is_some());
        drop(guard);
        slot.touch().await;
        assert_eq!(store.evict_idle(Duration::from_secs(60)).await, 0);
    }

    #[tokio::test]
    async fn evict_idle_removes_stale_sessions() {
        let store = SessionStore::new();
        store.get_or_create("a", None).await;
        store.get_or_create("b", None).await;
        assert_eq!(store.evict_idle(Duration::ZERO).await, 2);
        assert_eq!(store.len().await, 0);
    }
}
