use crate::session::{ActionRequest, Screenshot};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

pub const COMPUTER_TOOL: &str = "computer";
pub const PAGE_QUERY_TOOL: &str = "page_query";
pub const PAGE_QUERY_LIMIT: usize = 2000;

// ========================= Vocabulary =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Click { at: Point, button: MouseButton },
    DoubleClick { at: Point },
    Move { to: Point },
    TypeText { text: String },
    KeyCombo { combo: String },
    Scroll { at: Option<Point>, direction: ScrollDirection, notches: u32 },
    Drag { from: Option<Point>, to: Point },
    Wait { duration: Duration },
    PageQuery { expression: String },
    Probe,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { button: MouseButton::Left, .. } => "click",
            Action::Click { button: MouseButton::Right, .. } => "right-click",
            Action::Click { button: MouseButton::Middle, .. } => "middle-click",
            Action::DoubleClick { .. } => "double-click",
            Action::Move { .. } => "move",
            Action::TypeText { .. } => "type-text",
            Action::KeyCombo { .. } => "key-combo",
            Action::Scroll { .. } => "scroll",
            Action::Drag { .. } => "drag",
            Action::Wait { .. } => "wait",
            Action::PageQuery { .. } => "page-query",
            Action::Probe => "no-op-probe",
        }
    }

    /// Validates a model request against the shape of the action it names.
    pub fn from_request(request: &ActionRequest) -> Result<Self, ActionError> {
        match request.name.as_str() {
            PAGE_QUERY_TOOL => {
                let expression = request
                    .input
                    .get("expression")
                    .and_then(Value::as_str)
                    .filter(|e| !e.trim().is_empty())
                    .ok_or_else(|| invalid(PAGE_QUERY_TOOL, "missing `expression`"))?;
                Ok(Action::PageQuery { expression: expression.to_string() })
            }
            COMPUTER_TOOL => Self::from_computer_input(&request.input),
            other => Err(invalid(other, "unknown tool")),
        }
    }

    fn from_computer_input(input: &Value) -> Result<Self, ActionError> {
        let input: ComputerInput = serde_json::from_value(input.clone())
            .map_err(|e| invalid(COMPUTER_TOOL, &format!("malformed input: {e}")))?;
        let name = input.action.as_str();
        let target = || {
            input
                .coordinate
                .map(|[x, y]| Point::new(x, y))
                .ok_or_else(|| invalid(name, "missing `coordinate`"))
        };
        let text = || {
            input
                .text
                .clone()
                .ok_or_else(|| invalid(name, "missing `text`"))
        };

        let action = match name {
            "left_click" => Action::Click { at: target()?, button: MouseButton::Left },
            "right_click" => Action::Click { at: target()?, button: MouseButton::Right },
            "middle_click" => Action::Click { at: target()?, button: MouseButton::Middle },
            "double_click" => Action::DoubleClick { at: target()? },
            "mouse_move" => Action::Move { to: target()? },
            "type" => Action::TypeText { text: text()? },
            "key" => Action::KeyCombo { combo: map_key_combo(&text()?) },
            "scroll" => Action::Scroll {
                at: input.coordinate.map(|[x, y]| Point::new(x, y)),
                direction: input.scroll_direction.unwrap_or(ScrollDirection::Down),
                notches: input.scroll_amount.unwrap_or(3),
            },
            "left_click_drag" => Action::Drag {
                from: input.start_coordinate.map(|[x, y]| Point::new(x, y)),
                to: target()?,
            },
            "wait" => {
                let secs = input.duration.unwrap_or(2.0).clamp(0.5, 5.0);
                Action::Wait { duration: Duration::from_secs_f64(secs) }
            }
            "screenshot" | "cursor_position" => Action::Probe,
            "" => return Err(invalid(COMPUTER_TOOL, "missing `action`")),
            other => return Err(invalid(other, "unsupported action")),
        };
        Ok(action)
    }
}

#[derive(Debug, Deserialize)]
struct ComputerInput {
    #[serde(default)]
    action: String,
    coordinate: Option<[i64; 2]>,
    start_coordinate: Option<[i64; 2]>,
    text: Option<String>,
    scroll_direction: Option<ScrollDirection>,
    scroll_amount: Option<u32>,
    duration: Option<f64>,
}

fn invalid(action: &str, reason: &str) -> ActionError {
    ActionError::Invalid {
        action: action.to_string(),
        reason: reason.to_string(),
    }
}

/// Short name for a request, as shown to the user while it runs.
pub fn request_label(request: &ActionRequest) -> &str {
    if request.name == PAGE_QUERY_TOOL {
        return PAGE_QUERY_TOOL;
    }
    request
        .input
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Tool definitions sent with every reasoning request.
pub fn tool_schemas(viewport: (u32, u32)) -> Vec<Value> {
    vec![
        json!({
            "type": "computer_20250124",
            "name": COMPUTER_TOOL,
            "display_width_px": viewport.0,
            "display_height_px": viewport.1,
        }),
        json!({
            "name": PAGE_QUERY_TOOL,
            "description": "Evaluate a JavaScript expression on the current page to read text, count elements, or inspect page state. Returns the result as a string (max 2000 chars). Use it when text is hard to read from screenshots or exact values matter.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "JavaScript expression to evaluate, e.g. 'document.title'."
                    }
                },
                "required": ["expression"]
            }
        }),
    ]
}

// ========================= Keys =========================

/// Maps xdotool-style key names onto DOM key names, modifier combos included.
pub fn map_key_combo(combo: &str) -> String {
    combo
        .split('+')
        .map(|part| map_key(part.trim()))
        .collect::<Vec<_>>()
        .join("+")
}

fn map_key(key: &str) -> String {
    let mapped = match key.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => "Control",
        "alt" => "Alt",
        "shift" => "Shift",
        "meta" | "super" | "cmd" | "command" => "Meta",
        _ => match key {
            "Return" | "KP_Enter" => "Enter",
            "BackSpace" => "Backspace",
            "space" => " ",
            "Esc" => "Escape",
            "Up" => "ArrowUp",
            "Down" => "ArrowDown",
            "Left" => "ArrowLeft",
            "Right" => "ArrowRight",
            "Page_Up" | "Prior" => "PageUp",
            "Page_Down" | "Next" => "PageDown",
            other => other,
        },
    };
    mapped.to_string()
}

// ========================= Cursor Path =========================

/// Eased (smoothstep) intermediate positions from `from` to `to`, ending on `to`.
pub fn cursor_path(from: Point, to: Point, steps: u32) -> Vec<Point> {
    let steps = steps.max(1);
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            let eased = t * t * (3.0 - 2.0 * t);
            Point::new(
                (from.x as f64 + (to.x - from.x) as f64 * eased) as i64,
                (from.y as f64 + (to.y - from.y) as f64 * eased) as i64,
            )
        })
        .collect()
}

// ========================= Browser Surface =========================

#[derive(Debug, Error, Clone)]
pub enum SurfaceError {
    #[error("browser not started")]
    NotStarted,
    #[error("browser error: {0}")]
    Browser(String),
    #[error("page evaluation failed: {0}")]
    Evaluation(String),
}

/// The live screen the agent operates on. Only one action runs against it at a time.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn screenshot(&self) -> Result<Screenshot, SurfaceError>;
    async fn perform(&self, action: &Action) -> Result<(), SurfaceError>;
    async fn query_page(&self, expression: &str) -> Result<String, SurfaceError>;
    async fn navigate(&self, url: &str) -> Result<Screenshot, SurfaceError>;

    /// Address of the page currently shown; empty when the surface cannot tell.
    async fn current_url(&self) -> Result<String, SurfaceError> {
        Ok(String::new())
    }
}

// ========================= Executor =========================

#[derive(Debug, Error, Clone)]
pub enum ActionError {
    #[error("invalid action `{action}`: {reason}")]
    Invalid { action: String, reason: String },
    #[error("action `{action}` failed: {source}")]
    Execution {
        action: &'static str,
        #[source]
        source: SurfaceError,
    },
    #[error("screenshot after `{action}` failed: {source}")]
    Capture {
        action: &'static str,
        #[source]
        source: SurfaceError,
    },
}

#[derive(Debug)]
pub enum ActionOutcome {
    Screenshot(Screenshot),
    Text(String),
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub viewport: (u32, u32),
    pub cursor_steps: u32,
    pub drag_steps: u32,
    pub cursor_step_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            viewport: (1280, 800),
            cursor_steps: 6,
            drag_steps: 8,
            cursor_step_delay: Duration::from_millis(50),
        }
    }
}

pub struct ActionExecutor<S: Surface> {
    surface: std::sync::Arc<S>,
    cursor: Mutex<Point>,
    cfg: ExecutorConfig,
}

impl<S: Surface> ActionExecutor<S> {
    pub fn new(surface: std::sync::Arc<S>, cfg: ExecutorConfig) -> Self {
        let centre = Point::new(cfg.viewport.0 as i64 / 2, cfg.viewport.1 as i64 / 2);
        Self {
            surface,
            cursor: Mutex::new(centre),
            cfg,
        }
    }

    pub fn cursor(&self) -> Point {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_cursor(&self, p: Point) {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = p;
    }

    fn centre(&self) -> Point {
        Point::new(self.cfg.viewport.0 as i64 / 2, self.cfg.viewport.1 as i64 / 2)
    }

    async fn glide(&self, to: Point, steps: u32, on_cursor: &(dyn Fn(Point) + Send + Sync)) {
        for p in cursor_path(self.cursor(), to, steps) {
            on_cursor(p);
            if !self.cfg.cursor_step_delay.is_zero() {
                sleep(self.cfg.cursor_step_delay).await;
            }
        }
        self.set_cursor(to);
    }

    pub async fn execute(
        &self,
        request: &ActionRequest,
        on_cursor: &(dyn Fn(Point) + Send + Sync),
    ) -> Result<ActionOutcome, ActionError> {
        let mut action = Action::from_request(request)?;
        let name = action.name();
        debug!(action = name, id = %request.id, "executing action");

        match &mut action {
            Action::PageQuery { expression } => {
                let text = self
                    .surface
                    .query_page(expression)
                    .await
                    .map_err(|source| ActionError::Execution { action: name, source })?;
                return Ok(ActionOutcome::Text(text.chars().take(PAGE_QUERY_LIMIT).collect()));
            }
            Action::Wait { duration } => sleep(*duration).await,
            Action::Probe => {}
            Action::TypeText { .. } | Action::KeyCombo { .. } => self.perform(&action, name).await?,
            Action::Scroll { at, .. } => {
                let target = at.unwrap_or_else(|| self.centre());
                *at = Some(target);
                self.glide(target, self.cfg.cursor_steps, on_cursor).await;
                self.perform(&action, name).await?;
            }
            Action::Drag { from, to } => {
                let start = from.unwrap_or(*to);
                let end = *to;
                *from = Some(start);
                self.glide(start, self.cfg.cursor_steps, on_cursor).await;
                self.glide(end, self.cfg.drag_steps, on_cursor).await;
                self.perform(&action, name).await?;
            }
            Action::Click { at, .. } | Action::DoubleClick { at } | Action::Move { to: at } => {
                self.glide(*at, self.cfg.cursor_steps, on_cursor).await;
                self.perform(&action, name).await?;
            }
        }

        let shot = self
            .surface
            .screenshot()
            .await
            .map_err(|source| ActionError::Capture { action: name, source })?;
        Ok(ActionOutcome::Screenshot(shot))
    }

    async fn perform(&self, action: &Action, name: &'static str) -> Result<(), ActionError> {
        self.surface
            .perform(action)
            .await
            .map_err(|source| ActionError::Execution { action: name, source })
    }
}
