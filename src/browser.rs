//! Local Chromium page driven over CDP, usable as a [`Sandbox`] for
//! development without a remote desktop. The sandbox id is ignored: one
//! process drives one page.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::AgentError;
use crate::grounding::{MouseButton, PrimitiveAction, ScrollDirection};
use crate::planner::{Sandbox, Screenshot};

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    pub start_url: String,
    /// Pixels per scroll notch.
    pub scroll_step: i64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            width: 1280,
            height: 800,
            start_url: "about:blank".into(),
            scroll_step: 100,
        }
    }
}

pub struct ChromiumSandbox {
    page: Page,
    cfg: BrowserConfig,
    _browser: OxideBrowser,
}

impl ChromiumSandbox {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // unique profile per run; chromium locks a shared one
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("sandbox-agent-profile-{}-{}", std::process::id(), nanoid::nanoid!(8)));
        std::fs::create_dir_all(&profile_dir)?;
        let bcfg = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .build()
            .map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser.new_page(cfg.start_url.as_str()).await?;
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(cfg.width as i64)
            .height(cfg.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        page.execute(metrics).await?;
        Ok(Self { page, cfg, _browser: browser })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn mouse(&self, x: i64, y: i64, button: CdpButton, clicks: i64, kind: DispatchMouseEventType) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x as f64)
            .y(y as f64)
            .button(button)
            .click_count(clicks)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn click(&self, x: i64, y: i64, button: CdpButton, clicks: i64) -> Result<()> {
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        self.mouse(x, y, button.clone(), clicks, DispatchMouseEventType::MousePressed).await?;
        self.mouse(x, y, button, clicks, DispatchMouseEventType::MouseReleased).await
    }

    async fn drag(&self, from: (i64, i64), to: (i64, i64)) -> Result<()> {
        self.page.move_mouse(Point { x: from.0 as f64, y: from.1 as f64 }).await?;
        self.mouse(from.0, from.1, CdpButton::Left, 1, DispatchMouseEventType::MousePressed).await?;
        self.page.move_mouse(Point { x: to.0 as f64, y: to.1 as f64 }).await?;
        self.mouse(to.0, to.1, CdpButton::Left, 1, DispatchMouseEventType::MouseReleased).await
    }

    async fn scroll(&self, x: i64, y: i64, direction: ScrollDirection, amount: i64) -> Result<()> {
        let d = amount * self.cfg.scroll_step;
        let (dx, dy) = match direction {
            ScrollDirection::Up => (0, -d),
            ScrollDirection::Down => (0, d),
            ScrollDirection::Left => (-d, 0),
            ScrollDirection::Right => (d, 0),
        };
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x as f64)
            .y(y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams::new(text)).await?;
        Ok(())
    }

    /// Presses the modifiers in order, then releases them in reverse.
    async fn hotkey(&self, keys: &[String]) -> Result<()> {
        let mut modifiers = 0i64;
        for key in keys {
            modifiers |= modifier_bit(key);
            self.key(key, DispatchKeyEventType::KeyDown, modifiers).await?;
        }
        for key in keys.iter().rev() {
            self.key(key, DispatchKeyEventType::KeyUp, modifiers).await?;
            modifiers &= !modifier_bit(key);
        }
        Ok(())
    }

    async fn key(&self, key: &str, kind: DispatchKeyEventType, modifiers: i64) -> Result<()> {
        let key = cdp_key(key);
        let cmd = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key(key.clone())
            .code(key)
            .modifiers(modifiers)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(false).build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn run(&self, action: &PrimitiveAction) -> Result<()> {
        match action {
            PrimitiveAction::Click { x, y, button } => self.click(*x, *y, cdp_button(*button), 1).await,
            PrimitiveAction::DoubleClick { x, y } => self.click(*x, *y, CdpButton::Left, 2).await,
            PrimitiveAction::Drag { from, to } => self.drag(*from, *to).await,
            PrimitiveAction::Hotkey { keys } => self.hotkey(keys).await,
            PrimitiveAction::Type { text } => self.type_text(text).await,
            PrimitiveAction::Scroll { x, y, direction, amount } => self.scroll(*x, *y, *direction, *amount).await,
            PrimitiveAction::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
        }
    }
}

fn cdp_button(b: MouseButton) -> CdpButton {
    match b {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
    }
}

fn modifier_bit(key: &str) -> i64 {
    match key.to_ascii_lowercase().as_str() {
        "alt" => 1,
        "ctrl" | "control" => 2,
        "meta" | "cmd" | "win" => 4,
        "shift" => 8,
        _ => 0,
    }
}

fn cdp_key(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "enter" | "return" => "Enter".into(),
        "esc" | "escape" => "Escape".into(),
        "tab" => "Tab".into(),
        "backspace" => "Backspace".into(),
        "delete" => "Delete".into(),
        "space" => " ".into(),
        "ctrl" | "control" => "Control".into(),
        "alt" => "Alt".into(),
        "shift" => "Shift".into(),
        "meta" | "cmd" | "win" => "Meta".into(),
        "up" | "arrowup" => "ArrowUp".into(),
        "down" | "arrowdown" => "ArrowDown".into(),
        "left" | "arrowleft" => "ArrowLeft".into(),
        "right" | "arrowright" => "ArrowRight".into(),
        _ => key.to_string(),
    }
}

#[async_trait]
impl Sandbox for ChromiumSandbox {
    async fn screenshot(&self, _sandbox_id: &str) -> Result<Screenshot, AgentError> {
        let png = self.screenshot_png().await.map_err(|e| AgentError::Sandbox(e.to_string()))?;
        Ok(Screenshot {
            width: self.cfg.width,
            height: self.cfg.height,
            image_url: format!("data:image/png;base64,{}", STANDARD.encode(png)),
        })
    }

    async fn execute(&self, _sandbox_id: &str, action: &PrimitiveAction) -> Result<(), AgentError> {
        debug!(?action, "executing in browser");
        self.run(action).await.map_err(|e| AgentError::Sandbox(e.to_string()))
    }
}
