use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{ConversationContext, Message};
use crate::error::AgentError;
use crate::event::{Lang, ProgressEvent, Stage};
use crate::grounding::{parse_call, PrimitiveAction};
use crate::recall::LongTermMemory;
use crate::store::TaskStore;

// ========================= Collaborators =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    /// URL or `data:` URI handed to the model as-is.
    pub image_url: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn screenshot(&self, sandbox_id: &str) -> Result<Screenshot, AgentError>;
    async fn execute(&self, sandbox_id: &str, action: &PrimitiveAction) -> Result<(), AgentError>;
}

#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, AgentError>;
}

#[async_trait]
pub trait ActionGrounder: Send + Sync {
    /// Turns one extracted action (the text after `Action:`) into input
    /// actions for a screen of the given size.
    async fn ground(&self, action: &str, screen: (u32, u32)) -> Result<Vec<PrimitiveAction>, AgentError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub sandbox: Arc<dyn Sandbox>,
    pub inference: Arc<dyn Inference>,
    pub grounder: Arc<dyn ActionGrounder>,
    pub memory: Arc<dyn LongTermMemory>,
}

// ========================= Response parsing =========================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub thought: String,
    pub action: Option<String>,
}

/// Splits a `Thought: ... / Action: ...` reply. The first `Action:` line wins;
/// unlabeled lines continue whichever section came before them.
pub fn parse_response(text: &str) -> ParsedResponse {
    enum Section {
        None,
        Thought,
        Action,
    }
    let mut section = Section::None;
    let mut thought: Vec<&str> = Vec::new();
    let mut action: Option<String> = None;

    for line in text.trim().lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("Thought:") {
            section = Section::Thought;
            let rest = rest.trim();
            if !rest.is_empty() {
                thought.push(rest);
            }
        } else if let Some(rest) = line.strip_prefix("Action:") {
            if action.is_some() {
                section = Section::None;
                continue;
            }
            section = Section::Action;
            action = Some(rest.trim().to_string());
        } else {
            match section {
                Section::Thought => thought.push(line),
                Section::Action => {
                    if let Some(a) = action.as_mut() {
                        a.push('\n');
                        a.push_str(line);
                    }
                }
                Section::None => {}
            }
        }
    }

    ParsedResponse {
        thought: thought.join("\n"),
        action: action.filter(|a| !a.is_empty()),
    }
}

/// Closed set of directives the loop reacts to. Everything that is not a
/// control directive is grounded into input actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionDirective {
    Finish { content: Option<String> },
    CallUser,
    Output { content: Option<String> },
    SaveMemory { content: Option<String> },
    Fail { reason: Option<String> },
    Primitive(String),
}

impl ActionDirective {
    pub fn parse(action: &str) -> Self {
        let action = action.trim();
        let lead: String = action
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let content = || {
            parse_call(action)
                .ok()
                .and_then(|c| c.arg_or_first("content").map(str::to_string))
        };
        match lead.as_str() {
            "finished" => ActionDirective::Finish { content: content() },
            "call_user" => ActionDirective::CallUser,
            "output" => ActionDirective::Output { content: content() },
            "save_memory" => ActionDirective::SaveMemory { content: content() },
            "failed" => ActionDirective::Fail { reason: content() },
            _ => ActionDirective::Primitive(action.to_string()),
        }
    }
}

// ========================= Outcome =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Finished { output: Option<String> },
    NeedsHuman { message: String },
    Failed { reason: String },
    Cancelled,
    Error { message: String },
    BudgetExhausted,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub steps: usize,
    pub actions: usize,
    pub time_ms: u128,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: TaskOutcome,
    pub metrics: RunMetrics,
}

// ========================= Planner =========================

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub max_steps: usize,
    /// Storage is polled for cancellation every N iterations.
    pub cancel_check_interval: usize,
    pub capture_attempts: u32,
    pub capture_backoff: Duration,
    pub settle_delay: Duration,
    pub lang: Lang,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            cancel_check_interval: 3,
            capture_attempts: 3,
            capture_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_millis(1500),
            lang: Lang::default(),
        }
    }
}

pub type SharedContext = Arc<Mutex<ConversationContext>>;

pub struct Planner {
    task_id: String,
    sandbox_id: String,
    session_id: String,
    collab: Collaborators,
    store: Option<Arc<dyn TaskStore>>,
    context: SharedContext,
    cancel: CancellationToken,
    recalled: Vec<String>,
    cfg: PlannerConfig,
}

impl Planner {
    pub fn new(
        task_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        collab: Collaborators,
        context: SharedContext,
        cfg: PlannerConfig,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            session_id: task_id.clone(),
            task_id,
            sandbox_id: sandbox_id.into(),
            collab,
            store: None,
            context,
            cancel: CancellationToken::new(),
            recalled: Vec::new(),
            cfg,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Facts recalled at prompt setup, announced on start.
    pub fn with_recalled(mut self, memories: Vec<String>) -> Self {
        self.recalled = memories;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn context(&self) -> SharedContext {
        self.context.clone()
    }

    /// Drives the loop to a terminal outcome. Never fails: errors are turned
    /// into an `Error` event and [`TaskOutcome::Error`].
    pub async fn run(&self, events: &mpsc::Sender<ProgressEvent>) -> RunReport {
        let start = Instant::now();
        let mut metrics = RunMetrics::default();
        let outcome = match self.run_steps(events, &mut metrics).await {
            Ok(o) => o,
            Err(_) if self.cancel.is_cancelled() => self.cancelled(events).await,
            Err(err) => {
                error!(task_id = %self.task_id, error = %err, "task execution failed");
                let ev = self
                    .event(Stage::Error, format!("❌ {}", self.cfg.lang.execution_problem()))
                    .with_error(err.to_string());
                self.emit(events, ev).await;
                TaskOutcome::Error { message: err.to_string() }
            }
        };
        metrics.time_ms = start.elapsed().as_millis();
        info!(task_id = %self.task_id, outcome = ?outcome, steps = metrics.steps, "task loop finished");
        RunReport { outcome, metrics }
    }

    async fn run_steps(
        &self,
        events: &mpsc::Sender<ProgressEvent>,
        metrics: &mut RunMetrics,
    ) -> Result<TaskOutcome, AgentError> {
        self.emit(events, self.event(Stage::System, self.cfg.lang.start())).await;
        if !self.recalled.is_empty() {
            let list: Vec<String> = self.recalled.iter().map(|m| format!("- {m}")).collect();
            let msg = format!("📝 Loaded memories:\n{}", list.join("\n"));
            self.emit(events, self.event(Stage::System, msg)).await;
        }

        let interval = self.cfg.cancel_check_interval.max(1);
        for step in 0..self.cfg.max_steps {
            metrics.steps = step + 1;
            if self.check_cancellation(step % interval == 0).await {
                return Ok(self.cancelled(events).await);
            }

            let shot = self.capture().await?;
            if self.check_cancellation(false).await {
                return Ok(self.cancelled(events).await);
            }

            let response = self.infer(&shot).await?;
            let ParsedResponse { thought, action } = parse_response(&response);
            let Some(action) = action else {
                debug!(task_id = %self.task_id, step, "no action returned, skipping");
                continue;
            };
            info!(task_id = %self.task_id, step, action = %action, "agent step");

            match ActionDirective::parse(&action) {
                ActionDirective::Finish { content } => {
                    let msg = format!("✅ {thought}\n\nAction: {action}");
                    self.emit(events, self.event(Stage::Grounding, msg)).await;
                    let done = self.event(Stage::System, "Task completed successfully!").done();
                    self.emit(events, done).await;
                    return Ok(TaskOutcome::Finished { output: content });
                }
                ActionDirective::CallUser => {
                    let msg = format!("👤 Calling user for help\n\n{thought}");
                    let ev = self.event(Stage::System, msg.clone()).needs_human();
                    self.emit(events, ev).await;
                    return Ok(TaskOutcome::NeedsHuman { message: msg });
                }
                ActionDirective::Output { .. } => {
                    self.context.lock().await.capture_output();
                    let msg = format!("💾 Output saved: {thought}");
                    self.emit(events, self.event(Stage::System, msg)).await;
                }
                ActionDirective::SaveMemory { content } => {
                    let fact = content.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| thought.clone());
                    if let Err(e) = self.collab.memory.remember(&self.session_id, &nanoid!(), &fact).await {
                        warn!(task_id = %self.task_id, error = %e, "failed to save memory");
                    }
                    let msg = format!("🧠 Memory saved: {fact}");
                    self.emit(events, self.event(Stage::System, msg)).await;
                }
                ActionDirective::Fail { reason } => {
                    let msg = format!("❌ Task failed: {thought}\n\nAction: {action}");
                    self.emit(events, self.event(Stage::Error, msg)).await;
                    let reason = reason.filter(|r| !r.trim().is_empty()).unwrap_or(thought);
                    return Ok(TaskOutcome::Failed { reason });
                }
                ActionDirective::Primitive(directive) => {
                    if self.check_cancellation(false).await {
                        return Ok(self.cancelled(events).await);
                    }
                    let actions = self
                        .collab
                        .grounder
                        .ground(&directive, (shot.width, shot.height))
                        .await?;
                    if self.cancel.is_cancelled() {
                        return Ok(self.cancelled(events).await);
                    }
                    if !thought.is_empty() {
                        let msg = format!("💭 Thought: {thought}");
                        self.emit(events, self.event(Stage::ManagerPlanner, msg)).await;
                    }
                    self.execute(events, &action, &actions).await?;
                    metrics.actions += actions.len();

                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.settle_delay) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }

        let msg = self.cfg.lang.budget_exhausted();
        self.emit(events, self.event(Stage::System, msg)).await;
        Ok(TaskOutcome::BudgetExhausted)
    }

    async fn execute(
        &self,
        events: &mpsc::Sender<ProgressEvent>,
        directive: &str,
        actions: &[PrimitiveAction],
    ) -> Result<(), AgentError> {
        if let [single] = actions {
            let msg = format!("🎯 Executing action: {directive}");
            self.emit(events, self.event(Stage::Grounding, msg)).await;
            return self.collab.sandbox.execute(&self.sandbox_id, single).await;
        }
        let total = actions.len();
        for (idx, action) in actions.iter().enumerate() {
            let msg = format!("🎯 Executing action {}/{}: {:?}", idx + 1, total, action);
            self.emit(events, self.event(Stage::Grounding, msg)).await;
            self.collab.sandbox.execute(&self.sandbox_id, action).await?;
        }
        Ok(())
    }

    async fn capture(&self) -> Result<Screenshot, AgentError> {
        let attempts = self.cfg.capture_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.collab.sandbox.screenshot(&self.sandbox_id).await {
                Ok(shot) => {
                    debug!(task_id = %self.task_id, width = shot.width, height = shot.height, "screenshot captured");
                    return Ok(shot);
                }
                Err(e) if attempt < attempts => {
                    warn!(task_id = %self.task_id, attempt, error = %e, "screenshot attempt failed");
                    tokio::time::sleep(self.cfg.capture_backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn infer(&self, shot: &Screenshot) -> Result<String, AgentError> {
        let messages = {
            let mut ctx = self.context.lock().await;
            ctx.push_screenshot(shot.image_url.clone());
            ctx.prune();
            ctx.messages()
        };
        let reply = self.collab.inference.complete(&messages).await?;
        self.context.lock().await.push_assistant(reply.clone());
        Ok(reply)
    }

    /// In-memory token first; the store is consulted only when `poll_store`.
    async fn check_cancellation(&self, poll_store: bool) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if !poll_store {
            return false;
        }
        let Some(store) = &self.store else {
            return false;
        };
        match store.check_cancel_requested(&self.task_id).await {
            Ok(true) => {
                self.cancel.cancel();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "error checking cancellation status");
                false
            }
        }
    }

    async fn cancelled(&self, events: &mpsc::Sender<ProgressEvent>) -> TaskOutcome {
        info!(task_id = %self.task_id, "task cancelled");
        let ev = self
            .event(Stage::System, format!("🚫 {}", self.cfg.lang.cancelled()))
            .cancelled();
        self.emit(events, ev).await;
        TaskOutcome::Cancelled
    }

    fn event(&self, stage: Stage, message: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(&self.task_id, stage, message)
    }

    async fn emit(&self, events: &mpsc::Sender<ProgressEvent>, ev: ProgressEvent) {
        // a closed receiver is the runner's business
        let _ = events.send(ev).await;
    }
}
