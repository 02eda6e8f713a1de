use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::grounding::{MouseButton, PrimitiveAction, ScrollDirection};
use crate::planner::{Sandbox, Screenshot};

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub endpoint: String, // e.g. "https://api.lybic.cn"
    pub org_id: String,   // env LYBIC_ORG_ID
    pub api_key: String,  // env LYBIC_API_KEY
    pub timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            endpoint: env::var("LYBIC_API_ENDPOINT").unwrap_or_else(|_| "https://api.lybic.cn".into()),
            org_id: env::var("LYBIC_ORG_ID").unwrap_or_default(),
            api_key: env::var("LYBIC_API_KEY").unwrap_or_default(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandbox {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default = "default_max_life")]
    pub max_life_seconds: u64,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_max_life() -> u64 {
    3600
}

pub const DEFAULT_SHAPE: &str = "beijing-2c-4g-cpu";

impl Default for CreateSandbox {
    fn default() -> Self {
        Self { name: None, shape: None, max_life_seconds: default_max_life(), project_id: None }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxDetails {
    pub sandbox_id: String,
    pub shape: Option<String>,
    pub os: Option<String>,
    pub hardware_accelerated_encoding: Option<bool>,
    pub virtualization: Option<String>,
    pub architecture: Option<String>,
}

impl SandboxDetails {
    fn from_api(v: &Value) -> Result<Self> {
        let sb = v.get("sandbox").unwrap_or(v);
        let id = sb
            .get("id")
            .and_then(Value::as_str)
            .context("sandbox response has no id")?;
        let shape = v.get("shape").or_else(|| sb.get("shape"));
        let text = |key: &str| shape.and_then(|s| s.get(key)).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            sandbox_id: id.to_string(),
            shape: sb
                .get("shapeName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| text("name")),
            os: text("os"),
            hardware_accelerated_encoding: shape
                .and_then(|s| s.get("hardwareAcceleratedEncoding"))
                .and_then(Value::as_bool),
            virtualization: text("virtualization"),
            architecture: text("architecture"),
        })
    }
}

#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    async fn create(&self, req: &CreateSandbox) -> Result<SandboxDetails, AgentError>;
}

/// Client for the remote sandbox service's REST API.
#[derive(Clone)]
pub struct SandboxClient {
    http: Client,
    cfg: SandboxConfig,
}

impl SandboxClient {
    pub fn new(cfg: SandboxConfig) -> Result<Self> {
        if cfg.org_id.is_empty() || cfg.api_key.is_empty() {
            bail!("LYBIC_ORG_ID / LYBIC_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/orgs/{}/sandboxes{}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.org_id,
            path
        )
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req.header("x-api-key", &self.cfg.api_key).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("sandbox service error {}: {}", status, text);
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).context("failed to parse sandbox service JSON")
    }

    pub async fn create_sandbox(&self, req: &CreateSandbox) -> Result<SandboxDetails> {
        let body = json!({
            "name": req.name.clone().unwrap_or_else(|| "sandbox".into()),
            "shape": req.shape.as_deref().unwrap_or(DEFAULT_SHAPE),
            "maxLifeSeconds": req.max_life_seconds,
            "projectId": req.project_id,
        });
        let created = self.send(self.http.post(self.url("")).json(&body)).await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .context("create response has no id")?
            .to_string();
        info!(sandbox_id = %id, "sandbox created");
        self.get_sandbox(&id).await
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxDetails> {
        let v = self.send(self.http.get(self.url(&format!("/{sandbox_id}")))).await?;
        SandboxDetails::from_api(&v)
    }

    pub async fn preview(&self, sandbox_id: &str) -> Result<Screenshot> {
        let v = self
            .send(self.http.post(self.url(&format!("/{sandbox_id}/preview"))))
            .await?;
        parse_preview(&v)
    }

    pub async fn execute_action(&self, sandbox_id: &str, action: &PrimitiveAction) -> Result<()> {
        let body = json!({
            "action": wire_action(action),
            "includeScreenShot": false,
            "includeCursorPosition": false,
        });
        debug!(sandbox_id, body = %body, "sandbox action");
        self.send(
            self.http
                .post(self.url(&format!("/{sandbox_id}/actions/computer-use")))
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

fn parse_preview(v: &Value) -> Result<Screenshot> {
    let url = v
        .get("screenShot")
        .and_then(Value::as_str)
        .context("preview has no screenShot")?;
    let cursor = v.get("cursorPosition").context("preview has no cursorPosition")?;
    let dim = |k: &str| cursor.get(k).and_then(Value::as_u64).map(|n| n as u32);
    Ok(Screenshot {
        width: dim("screenWidth").context("preview has no screenWidth")?,
        height: dim("screenHeight").context("preview has no screenHeight")?,
        image_url: url.to_string(),
    })
}

fn px(v: i64) -> Value {
    json!({ "type": "px", "value": v })
}

fn button_code(b: MouseButton) -> u8 {
    match b {
        MouseButton::Left => 1,
        MouseButton::Right => 2,
        MouseButton::Middle => 4,
    }
}

/// Computer-use action JSON understood by the sandbox service.
pub fn wire_action(action: &PrimitiveAction) -> Value {
    match action {
        PrimitiveAction::Click { x, y, button } => json!({
            "type": "mouse:click", "x": px(*x), "y": px(*y), "button": button_code(*button),
        }),
        PrimitiveAction::DoubleClick { x, y } => json!({
            "type": "mouse:doubleClick", "x": px(*x), "y": px(*y), "button": 1,
        }),
        PrimitiveAction::Drag { from, to } => json!({
            "type": "mouse:drag",
            "startX": px(from.0), "startY": px(from.1),
            "endX": px(to.0), "endY": px(to.1),
        }),
        PrimitiveAction::Hotkey { keys } => json!({ "type": "keyboard:hotkey", "keys": keys.join("+") }),
        PrimitiveAction::Type { text } => json!({ "type": "keyboard:type", "content": text }),
        PrimitiveAction::Scroll { x, y, direction, amount } => {
            let (dx, dy) = match direction {
                ScrollDirection::Up => (0, -amount),
                ScrollDirection::Down => (0, *amount),
                ScrollDirection::Left => (-amount, 0),
                ScrollDirection::Right => (*amount, 0),
            };
            json!({
                "type": "mouse:scroll", "x": px(*x), "y": px(*y),
                "stepVertical": dy, "stepHorizontal": dx,
            })
        }
        PrimitiveAction::Wait { ms } => json!({ "type": "wait", "duration": ms }),
    }
}

#[async_trait]
impl Sandbox for SandboxClient {
    async fn screenshot(&self, sandbox_id: &str) -> Result<Screenshot, AgentError> {
        self.preview(sandbox_id).await.map_err(|e| AgentError::Sandbox(e.to_string()))
    }

    async fn execute(&self, sandbox_id: &str, action: &PrimitiveAction) -> Result<(), AgentError> {
        self.execute_action(sandbox_id, action)
            .await
            .map_err(|e| AgentError::Sandbox(e.to_string()))
    }
}

#[async_trait]
impl SandboxProvisioner for SandboxClient {
    async fn create(&self, req: &CreateSandbox) -> Result<SandboxDetails, AgentError> {
        self.create_sandbox(req).await.map_err(|e| AgentError::Sandbox(e.to_string()))
    }
}
