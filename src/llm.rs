use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::debug;

use crate::context::Message;
use crate::error::AgentError;
use crate::planner::Inference;

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub api_base: String,    // e.g. "https://ark.cn-beijing.volces.com/api/v3"
    pub api_key: String,     // env ARK_API_KEY
    pub model: String,       // e.g. "doubao-1-5-ui-tars-250428"
    pub thinking: String,    // "disabled" | "enabled" | ""
    pub timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ARK_BASE_URL").unwrap_or_else(|_| "https://ark.cn-beijing.volces.com/api/v3".into()),
            api_key: env::var("ARK_API_KEY").unwrap_or_default(),
            model: env::var("ARK_MODEL").unwrap_or_else(|_| "doubao-1-5-ui-tars-250428".into()),
            thinking: env::var("ARK_THINKING").unwrap_or_else(|_| "disabled".into()),
            timeout: Duration::from_secs(120),
        }
    }
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    cfg: ChatConfig,
}

impl ChatClient {
    pub fn new(cfg: ChatConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("ARK_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.cfg
    }

    fn request_body(&self, messages: &[Message]) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
        });
        if !self.cfg.thinking.is_empty() {
            body["thinking"] = json!({ "type": self.cfg.thinking });
        }
        body
    }

    pub async fn chat(&self, messages: &[Message]) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.request_body(messages))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse completion JSON")?;
        Self::parse_completion(&v)
    }

    fn parse_completion(v: &Value) -> Result<String> {
        let content = v
            .pointer("/choices/0/message/content")
            .and_then(|x| x.as_str())
            .context("completion has no message content")?;
        if let Some(usage) = v.get("usage") {
            debug!(usage = %usage, "completion usage");
        }
        // some models wrap the reply in code fences
        Ok(content.replace("```", ""))
    }
}

#[async_trait]
impl Inference for ChatClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, AgentError> {
        self.chat(messages).await.map_err(|e| AgentError::Inference(e.to_string()))
    }
}
