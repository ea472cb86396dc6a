use crate::actions::{Action, MouseButton as Button, Point, ScrollDirection, Surface, SurfaceError};
use crate::session::Screenshot;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::layout;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: (u32, u32),
    /// Attach to an already running browser instead of launching one.
    pub ws_url: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: (1280, 800),
            ws_url: None,
            user_agent: None,
        }
    }
}

pub struct Browser {
    page: Page,
    viewport: (u32, u32),
    cursor: Mutex<Point>,
    _browser: OxideBrowser,
}

fn cdp<E: std::fmt::Display>(e: E) -> SurfaceError {
    SurfaceError::Browser(e.to_string())
}

impl Browser {
    pub async fn start(cfg: BrowserConfig) -> Result<Self, SurfaceError> {
        let (browser, mut handler) = match &cfg.ws_url {
            Some(ws) => OxideBrowser::connect(ws.clone()).await.map_err(cdp)?,
            None => {
                let mut builder = chromiumoxide::browser::BrowserConfig::builder()
                    .window_size(cfg.viewport.0, cfg.viewport.1);
                if !cfg.headless {
                    builder = builder.with_head();
                }
                // unique profile per launch avoids the ProcessSingleton lock on quick restarts
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                let mut profile_dir: PathBuf = std::env::temp_dir();
                profile_dir.push(format!("screen-operator-profile-{}-{}", std::process::id(), ts));
                builder = builder
                    .user_data_dir(profile_dir)
                    .arg("--no-first-run")
                    .arg("--no-default-browser-check");
                let bcfg = builder.build().map_err(SurfaceError::Browser)?;
                OxideBrowser::launch(bcfg).await.map_err(cdp)?
            }
        };
        tokio::spawn(async move {
            while let Some(_ev) = handler.next().await {}
        });

        let page = browser.new_page("about:blank").await.map_err(cdp)?;
        if let Some(ua) = &cfg.user_agent {
            page.set_user_agent(ua.clone()).await.map_err(cdp)?;
        }
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.viewport.0 as i64)
            .height(cfg.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(SurfaceError::Browser)?;
        page.execute(metrics).await.map_err(cdp)?;

        info!(viewport = ?cfg.viewport, attached = cfg.ws_url.is_some(), "browser ready");
        Ok(Self {
            page,
            viewport: cfg.viewport,
            cursor: Mutex::new(Point::new(cfg.viewport.0 as i64 / 2, cfg.viewport.1 as i64 / 2)),
            _browser: browser,
        })
    }

    pub async fn goto(&self, url: &str) -> Result<(), SurfaceError> {
        self.page.goto(url).await.map_err(cdp)?;
        self.page.wait_for_navigation().await.map_err(cdp)?;
        sleep(Duration::from_millis(1000)).await;
        self.inject_cursor().await;
        sleep(Duration::from_millis(1000)).await;
        self.dismiss_popups().await;
        Ok(())
    }

    pub async fn url(&self) -> Result<String, SurfaceError> {
        Ok(self.page.url().await.map_err(cdp)?.unwrap_or_default())
    }

    async fn eval(&self, js: impl Into<String>) -> Result<Value, SurfaceError> {
        let result = self
            .page
            .evaluate(js.into())
            .await
            .map_err(|e| SurfaceError::Evaluation(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    // ---- overlay helpers; failures here never fail an action ----

    async fn inject_cursor(&self) {
        let at = *self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let js = format!("{CURSOR_JS}\n(() => {{ const c = document.getElementById('operator-cursor'); if (c) {{ c.style.left = '{}px'; c.style.top = '{}px'; }} }})()", at.x, at.y);
        if let Err(e) = self.eval(js).await {
            debug!("cursor injection skipped: {e}");
        }
    }

    async fn place_cursor(&self, at: Point) {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner()) = at;
        let js = format!(
            "(() => {{ const c = document.getElementById('operator-cursor'); if (c) {{ c.style.left = '{}px'; c.style.top = '{}px'; }} }})()",
            at.x, at.y
        );
        let _ = self.eval(js).await;
    }

    async fn dismiss_popups(&self) {
        if let Err(e) = self.eval(DISMISS_POPUPS_JS).await {
            debug!("popup dismissal skipped: {e}");
        }
    }

    async fn set_cursor_visible(&self, visible: bool) {
        let display = if visible { "" } else { "none" };
        let js = format!(
            "(() => {{ const c = document.getElementById('operator-cursor'); if (c) c.style.display = '{display}'; }})()"
        );
        let _ = self.eval(js).await;
    }

    // ---- input primitives ----

    async fn mouse(
        &self,
        kind: DispatchMouseEventType,
        at: Point,
        button: MouseButton,
        clicks: i64,
    ) -> Result<(), SurfaceError> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(at.x as f64)
            .y(at.y as f64)
            .button(button)
            .click_count(clicks)
            .build()
            .map_err(SurfaceError::Browser)?;
        self.page.execute(cmd).await.map_err(cdp)?;
        Ok(())
    }

    async fn move_to(&self, at: Point) -> Result<(), SurfaceError> {
        self.page
            .move_mouse(layout::Point { x: at.x as f64, y: at.y as f64 })
            .await
            .map_err(cdp)?;
        self.place_cursor(at).await;
        Ok(())
    }

    async fn click(&self, at: Point, button: MouseButton, clicks: i64) -> Result<(), SurfaceError> {
        self.move_to(at).await?;
        sleep(Duration::from_millis(100)).await;
        for n in 1..=clicks {
            self.mouse(DispatchMouseEventType::MousePressed, at, button.clone(), n).await?;
            self.mouse(DispatchMouseEventType::MouseReleased, at, button.clone(), n).await?;
        }
        sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn wheel(&self, at: Point, direction: ScrollDirection, notches: u32) -> Result<(), SurfaceError> {
        self.move_to(at).await?;
        let px = notches as f64 * 100.0;
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0.0, -px),
            ScrollDirection::Down => (0.0, px),
            ScrollDirection::Left => (-px, 0.0),
            ScrollDirection::Right => (px, 0.0),
        };
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(at.x as f64)
            .y(at.y as f64)
            .delta_x(dx)
            .delta_y(dy)
            .build()
            .map_err(SurfaceError::Browser)?;
        self.page.execute(cmd).await.map_err(cdp)?;
        sleep(Duration::from_millis(300)).await;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), SurfaceError> {
        for ch in text.chars() {
            self.page
                .execute(InsertTextParams { text: ch.to_string() })
                .await
                .map_err(cdp)?;
            sleep(Duration::from_millis(50)).await;
        }
        sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn press(&self, combo: &str) -> Result<(), SurfaceError> {
        let mut modifiers = 0i64;
        let mut key = combo;
        for part in combo.split('+') {
            match part {
                "Alt" => modifiers |= 1,
                "Control" => modifiers |= 2,
                "Meta" => modifiers |= 4,
                "Shift" => modifiers |= 8,
                other => key = other,
            }
        }
        // a bare "+" or " " combo is itself the key
        if key.is_empty() {
            key = combo;
        }
        let code = virtual_key_code(key);
        let text = match key {
            "Enter" => Some("\r".to_string()),
            k if k.chars().count() == 1 && modifiers & !8 == 0 => Some(k.to_string()),
            _ => None,
        };

        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key)
            .modifiers(modifiers);
        if let Some(code) = code {
            down = down.windows_virtual_key_code(code);
        }
        if let Some(text) = text {
            down = down.text(text);
        }
        self.page
            .execute(down.build().map_err(SurfaceError::Browser)?)
            .await
            .map_err(cdp)?;

        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .modifiers(modifiers)
            .build()
            .map_err(SurfaceError::Browser)?;
        self.page.execute(up).await.map_err(cdp)?;
        sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn drag(&self, from: Point, to: Point) -> Result<(), SurfaceError> {
        self.move_to(from).await?;
        sleep(Duration::from_millis(100)).await;
        self.mouse(DispatchMouseEventType::MousePressed, from, MouseButton::Left, 1).await?;
        for p in crate::actions::cursor_path(from, to, 20) {
            self.page
                .move_mouse(layout::Point { x: p.x as f64, y: p.y as f64 })
                .await
                .map_err(cdp)?;
        }
        self.place_cursor(to).await;
        self.mouse(DispatchMouseEventType::MouseReleased, to, MouseButton::Left, 1).await?;
        sleep(Duration::from_millis(350)).await;
        Ok(())
    }

    async fn capture(&self) -> Result<Vec<u8>, SurfaceError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(80)
            .build();
        self.page.screenshot(params).await.map_err(cdp)
    }
}

#[async_trait]
impl Surface for Browser {
    async fn current_url(&self) -> Result<String, SurfaceError> {
        self.url().await
    }

    async fn screenshot(&self) -> Result<Screenshot, SurfaceError> {
        // the caller draws its own cursor; keep ours out of the frame
        self.set_cursor_visible(false).await;
        let taken = self.capture().await;
        self.set_cursor_visible(true).await;
        let bytes = match taken {
            Ok(bytes) => bytes,
            Err(e) if e.to_string().contains("0 width") || e.to_string().contains("0 height") => {
                warn!("empty viewport on capture; resetting metrics and retrying once");
                let metrics = SetDeviceMetricsOverrideParams::builder()
                    .width(self.viewport.0 as i64)
                    .height(self.viewport.1 as i64)
                    .device_scale_factor(1.0)
                    .mobile(false)
                    .build()
                    .map_err(SurfaceError::Browser)?;
                self.page.execute(metrics).await.map_err(cdp)?;
                sleep(Duration::from_millis(50)).await;
                self.capture().await?
            }
            Err(e) => return Err(e),
        };
        Ok(Screenshot::jpeg(&bytes))
    }

    async fn perform(&self, action: &Action) -> Result<(), SurfaceError> {
        match action {
            Action::Click { at, button } => {
                let button = match button {
                    Button::Left => MouseButton::Left,
                    Button::Right => MouseButton::Right,
                    Button::Middle => MouseButton::Middle,
                };
                self.click(*at, button, 1).await
            }
            Action::DoubleClick { at } => self.click(*at, MouseButton::Left, 2).await,
            Action::Move { to } => {
                self.move_to(*to).await?;
                sleep(Duration::from_millis(100)).await;
                Ok(())
            }
            Action::TypeText { text } => self.type_text(text).await,
            Action::KeyCombo { combo } => self.press(combo).await,
            Action::Scroll { at, direction, notches } => {
                let centre = Point::new(self.viewport.0 as i64 / 2, self.viewport.1 as i64 / 2);
                self.wheel(at.unwrap_or(centre), *direction, *notches).await
            }
            Action::Drag { from, to } => self.drag(from.unwrap_or(*to), *to).await,
            Action::Wait { duration } => {
                sleep(*duration).await;
                Ok(())
            }
            Action::PageQuery { .. } | Action::Probe => Ok(()),
        }
    }

    async fn query_page(&self, expression: &str) -> Result<String, SurfaceError> {
        let value = self.eval(expression).await?;
        Ok(match value {
            Value::String(s) => s,
            Value::Null => "None".to_string(),
            other => other.to_string(),
        })
    }

    async fn navigate(&self, url: &str) -> Result<Screenshot, SurfaceError> {
        let url = normalize_url(url);
        info!(%url, "navigating");
        self.goto(&url).await?;
        self.screenshot().await
    }
}

/// Prepends `https://` when the scheme is missing.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.starts_with("http://") || url.starts_with("https://") || url.starts_with("about:") {
        return url.to_string();
    }
    format!("https://{url}")
}

fn virtual_key_code(key: &str) -> Option<i64> {
    let code = match key {
        "Backspace" => 8,
        "Tab" => 9,
        "Enter" => 13,
        "Escape" => 27,
        " " => 32,
        "PageUp" => 33,
        "PageDown" => 34,
        "End" => 35,
        "Home" => 36,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Delete" => 46,
        k if k.len() == 1 && k.as_bytes()[0].is_ascii_alphanumeric() => {
            k.as_bytes()[0].to_ascii_uppercase() as i64
        }
        _ => return None,
    };
    Some(code)
}

const CURSOR_JS: &str = r#"
(() => {
  if (document.getElementById('operator-cursor')) return;
  const cursor = document.createElement('div');
  cursor.id = 'operator-cursor';
  Object.assign(cursor.style, {
    width: '18px', height: '18px', position: 'fixed', zIndex: '2147483647',
    pointerEvents: 'none', borderRadius: '50%', background: 'rgba(0,0,0,0.75)',
    border: '2px solid white', transition: 'left 0.08s linear, top 0.08s linear',
  });
  document.body.appendChild(cursor);
  const style = document.createElement('style');
  style.textContent = '* { cursor: none !important; }';
  document.head.appendChild(style);
  document.addEventListener('mousemove', (e) => {
    cursor.style.left = e.clientX + 'px';
    cursor.style.top = e.clientY + 'px';
  });
})()
"#;

const DISMISS_POPUPS_JS: &str = r#"
(() => {
  const selectors = ['.cookieConsent button', '#cookieConsent button', 'button.acceptAll',
    'button.acceptCookies', '[data-testid="cookie-accept"]', '.cookie-popup button',
    '.notification .close', '.popupWrapper .close', '#bannerClose', '.modal .close'];
  for (const sel of selectors) {
    try { document.querySelectorAll(sel).forEach(el => el.click()); } catch (e) {}
  }
  for (const btn of document.querySelectorAll('button, a.button, [role="button"]')) {
    const text = (btn.textContent || '').trim().toLowerCase();
    if (['accept', 'accept all', 'got it', 'i accept', 'ok'].includes(text)) {
      try { btn.click(); } catch (e) {}
    }
  }
})()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_get_a_scheme() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("  http://a.b "), "http://a.b");
        assert_eq!(normalize_url("https://a.b/c"), "https://a.b/c");
        assert_eq!(normalize_url("about:blank"), "about:blank");
        assert_eq!(normalize_url(""), "");
    }

    #[test]
    fn key_codes_cover_navigation_and_letters() {
        assert_eq!(virtual_key_code("Enter"), Some(13));
        assert_eq!(virtual_key_code("a"), Some(65));
        assert_eq!(virtual_key_code("7"), Some(55));
        assert_eq!(virtual_key_code("F13"), None);
    }
}
