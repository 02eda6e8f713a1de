use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    System,
    Grounding,
    #[serde(rename = "manager_planner")]
    ManagerPlanner,
    Error,
}

/// One streamed unit of task progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub needs_human: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ProgressEvent {
    pub fn new(task_id: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            cancelled: false,
            done: false,
            needs_human: false,
            error: None,
        }
    }

    pub fn cancelled(mut self) -> Self {
        self.cancelled = true;
        self
    }

    pub fn done(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn needs_human(mut self) -> Self {
        self.needs_human = true;
        self
    }

    pub fn with_error(mut self, err: impl Into<String>) -> Self {
        self.error = Some(err.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.cancelled || self.done || self.needs_human || self.error.is_some()
    }

    /// `data: {json}\n\n` framing.
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("data: {}\n\n", json)
    }
}

/// Language of the human-readable status messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    #[default]
    Zh,
    En,
}

impl Lang {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" | "en-us" | "english" => Lang::En,
            _ => Lang::Zh,
        }
    }

    pub(crate) fn start(self) -> &'static str {
        match self {
            Lang::Zh => "开始",
            Lang::En => "Start",
        }
    }

    pub(crate) fn cancelled(self) -> &'static str {
        match self {
            Lang::Zh => "任务已取消",
            Lang::En => "Task cancelled",
        }
    }

    pub(crate) fn execution_problem(self) -> &'static str {
        match self {
            Lang::Zh => "任务执行遇到问题，请稍后重试",
            Lang::En => "Task execution encountered a problem, please try again later.",
        }
    }

    pub(crate) fn context_restored(self) -> &'static str {
        match self {
            Lang::Zh => "上下文已恢复，继续对话...",
            Lang::En => "Context restored, continuing conversation...",
        }
    }

    pub(crate) fn budget_exhausted(self) -> &'static str {
        match self {
            Lang::Zh => "已达到最大步数",
            Lang::En => "Step budget exhausted",
        }
    }
}
