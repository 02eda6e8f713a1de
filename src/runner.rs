//! Task lifecycle around the planning loop: create or resume the record,
//! resolve the sandbox, build the prompt, drive the loop while forwarding
//! its events, snapshot the context periodically and write the final status.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{ConversationContext, Message, WindowLimits};
use crate::error::{AgentError, StoreResult};
use crate::event::{Lang, ProgressEvent, Stage};
use crate::grounding::UiTarsGrounder;
use crate::llm::{ChatClient, ChatConfig};
use crate::planner::{ActionGrounder, Collaborators, Planner, PlannerConfig, RunReport, SharedContext, TaskOutcome};
use crate::prompts;
use crate::recall::LongTermMemory;
use crate::registry::{ActiveTask, TaskRegistry};
use crate::sandbox::{CreateSandbox, SandboxClient, SandboxConfig, SandboxDetails, SandboxProvisioner};
use crate::store::{CancelCallback, CancelOutcome, ListFilter, TaskRecord, TaskStatus, TaskStore, TaskUpdate};

/// Per-request overrides for the sandbox service credentials.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
}

/// Upper bound on a caller-supplied step budget.
pub const MAX_STEPS_LIMIT: u32 = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub instruction: String,
    #[serde(default)]
    pub user_system_prompt: Option<String>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub continue_context: bool,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub authentication: Option<Authentication>,
    #[serde(default)]
    pub ark_apikey: Option<String>,
}

impl TaskRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self { instruction: instruction.into(), ..Default::default() }
    }

    /// Requested step budget, or `default`, clamped to `1..=MAX_STEPS_LIMIT`.
    pub fn step_budget(&self, default: u32) -> u32 {
        self.max_steps.unwrap_or(default).clamp(1, MAX_STEPS_LIMIT)
    }

    /// Copy without credentials, as stored in `request_data`.
    fn redacted(&self) -> Self {
        Self { authentication: None, ark_apikey: None, ..self.clone() }
    }
}

/// Builds the collaborators for one task from the request's credentials.
pub trait CollaboratorFactory: Send + Sync {
    fn collaborators(&self, auth: Option<&Authentication>, llm_key: Option<&str>) -> Result<Collaborators, AgentError>;

    fn provisioner(&self, auth: Option<&Authentication>) -> Result<Arc<dyn SandboxProvisioner>, AgentError>;
}

/// Remote sandbox service + chat-completions model + local UI-TARS grounding.
pub struct ServiceFactory {
    pub chat: ChatConfig,
    pub sandbox: SandboxConfig,
    pub grounder: Arc<dyn ActionGrounder>,
    pub memory: Arc<dyn LongTermMemory>,
}

impl ServiceFactory {
    pub fn new(memory: Arc<dyn LongTermMemory>) -> Self {
        Self {
            chat: ChatConfig::default(),
            sandbox: SandboxConfig::default(),
            grounder: Arc::new(UiTarsGrounder::default()),
            memory,
        }
    }

    fn sandbox_client(&self, auth: Option<&Authentication>) -> Result<SandboxClient, AgentError> {
        let mut cfg = self.sandbox.clone();
        if let Some(a) = auth {
            if let Some(k) = a.api_key.as_ref().filter(|s| !s.is_empty()) {
                cfg.api_key = k.clone();
            }
            if let Some(o) = a.org_id.as_ref().filter(|s| !s.is_empty()) {
                cfg.org_id = o.clone();
            }
            if let Some(e) = a.api_endpoint.as_ref().filter(|s| !s.is_empty()) {
                cfg.endpoint = e.clone();
            }
        }
        SandboxClient::new(cfg).map_err(|e| AgentError::Sandbox(e.to_string()))
    }
}

impl CollaboratorFactory for ServiceFactory {
    fn collaborators(&self, auth: Option<&Authentication>, llm_key: Option<&str>) -> Result<Collaborators, AgentError> {
        let mut chat = self.chat.clone();
        if let Some(k) = llm_key.filter(|k| !k.is_empty()) {
            chat.api_key = k.to_string();
        }
        let inference = ChatClient::new(chat).map_err(|e| AgentError::Inference(e.to_string()))?;
        Ok(Collaborators {
            sandbox: Arc::new(self.sandbox_client(auth)?),
            inference: Arc::new(inference),
            grounder: self.grounder.clone(),
            memory: self.memory.clone(),
        })
    }

    fn provisioner(&self, auth: Option<&Authentication>) -> Result<Arc<dyn SandboxProvisioner>, AgentError> {
        Ok(Arc::new(self.sandbox_client(auth)?))
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub planner: PlannerConfig,
    pub limits: WindowLimits,
    pub system_prompt: String,
    /// Context is snapshotted to the store every N progress events.
    pub context_save_every: usize,
    pub recall_limit: usize,
    pub default_max_steps: u32,
}

impl RunnerConfig {
    pub fn for_lang(lang: Lang) -> Self {
        Self {
            planner: PlannerConfig { lang, ..PlannerConfig::default() },
            limits: WindowLimits::default(),
            system_prompt: prompts::system_prompt(lang).to_string(),
            context_save_every: 5,
            recall_limit: 3,
            default_max_steps: 50,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::for_lang(Lang::default())
    }
}

/// A streamed run: progress events until the task ends, then the channel
/// closes.
pub struct TaskHandle {
    pub task_id: String,
    pub sandbox_id: String,
    pub events: mpsc::Receiver<ProgressEvent>,
    pub join: JoinHandle<RunReport>,
}

struct Opened {
    task_id: String,
    sandbox_id: Option<String>,
    persisted: Option<Vec<Message>>,
    max_steps: u32,
}

struct Prepared {
    task_id: String,
    sandbox_id: String,
    collab: Collaborators,
    context: SharedContext,
    recalled: Vec<String>,
    restored: bool,
    max_steps: u32,
}

#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: TaskRegistry,
    factory: Arc<dyn CollaboratorFactory>,
    cfg: Arc<RunnerConfig>,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: TaskRegistry,
        factory: Arc<dyn CollaboratorFactory>,
        cfg: RunnerConfig,
    ) -> Self {
        Self { store, registry, factory, cfg: Arc::new(cfg) }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.cfg
    }

    /// Runs a task and streams its progress. Setup failures are returned
    /// before any event is produced.
    pub async fn start(&self, req: TaskRequest) -> Result<TaskHandle, AgentError> {
        let opened = self.open(&req, TaskStatus::Running).await?;
        let task_id = opened.task_id.clone();
        let prepared = match self.prepare(&req, opened).await {
            Ok(p) => p,
            Err(e) => {
                self.abort(&task_id, &e).await;
                return Err(e);
            }
        };
        let sandbox_id = prepared.sandbox_id.clone();
        let (tx, rx) = mpsc::channel(64);
        let runner = self.clone();
        let join = tokio::spawn(async move { runner.execute(prepared, Some(tx)).await });
        Ok(TaskHandle { task_id, sandbox_id, events: rx, join })
    }

    /// Records the task as pending and runs it in the background.
    pub async fn submit(&self, req: TaskRequest) -> Result<String, AgentError> {
        let opened = self.open(&req, TaskStatus::Pending).await?;
        let task_id = opened.task_id.clone();
        let runner = self.clone();
        tokio::spawn(async move {
            let task_id = opened.task_id.clone();
            if let Err(e) = runner.store.update(&task_id, TaskUpdate::status(TaskStatus::Running)).await {
                warn!(task_id = %task_id, error = %e, "failed to mark task running");
            }
            match runner.prepare(&req, opened).await {
                Ok(prepared) => {
                    runner.execute(prepared, None).await;
                }
                Err(e) => runner.abort(&task_id, &e).await,
            }
        });
        info!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Requests cancellation through the store, then flips the local flag if
    /// the task runs here.
    pub async fn cancel(&self, task_id: &str) -> StoreResult<CancelOutcome> {
        let outcome = self.store.request_cancel(task_id).await?;
        self.registry.cancel(task_id);
        Ok(outcome)
    }

    pub async fn cancel_all(&self) -> StoreResult<usize> {
        let n = self.store.request_cancel_all().await?;
        let local = self.registry.cancel_all();
        info!(requested = n, local, "cancellation requested for all tasks");
        Ok(n)
    }

    pub async fn status(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        self.store.get(task_id).await
    }

    pub async fn list(&self, filter: ListFilter) -> StoreResult<Vec<TaskRecord>> {
        self.store.list(filter).await
    }

    pub fn active_tasks(&self) -> Vec<ActiveTask> {
        self.registry.snapshot()
    }

    pub async fn create_sandbox(
        &self,
        auth: Option<&Authentication>,
        req: &CreateSandbox,
    ) -> Result<SandboxDetails, AgentError> {
        self.factory.provisioner(auth)?.create(req).await
    }

    async fn open(&self, req: &TaskRequest, status: TaskStatus) -> Result<Opened, AgentError> {
        let max_steps = req.step_budget(self.cfg.default_max_steps);
        if req.continue_context {
            if let Some(id) = req.task_id.as_deref() {
                if let Some(rec) = self.store.get(id).await? {
                    let mut update = TaskUpdate::resume(&req.instruction);
                    if let Some(sb) = req.sandbox_id.as_deref() {
                        update = update.sandbox(sb);
                    }
                    self.store.update(id, update).await?;
                    info!(task_id = id, "resuming task");
                    return Ok(Opened {
                        task_id: id.to_string(),
                        sandbox_id: req.sandbox_id.clone().or_else(|| rec.sandbox_id().map(str::to_string)),
                        persisted: rec.llm_context,
                        max_steps,
                    });
                }
                debug!(task_id = id, "task to resume not found, starting fresh");
            }
        }

        let task_id = nanoid!();
        let mut rec = TaskRecord::new(&task_id, status, &req.instruction, max_steps)
            .with_request(serde_json::to_value(req.redacted()).unwrap_or_default());
        if let Some(sb) = req.sandbox_id.as_deref() {
            rec = rec.with_sandbox(sb);
        }
        self.store.create(rec).await?;
        Ok(Opened { task_id, sandbox_id: req.sandbox_id.clone(), persisted: None, max_steps })
    }

    async fn prepare(&self, req: &TaskRequest, opened: Opened) -> Result<Prepared, AgentError> {
        let Opened { task_id, sandbox_id, persisted, max_steps } = opened;
        let collab = self
            .factory
            .collaborators(req.authentication.as_ref(), req.ark_apikey.as_deref())?;

        let sandbox_id = match sandbox_id {
            Some(id) => id,
            None => {
                let provisioner = self.factory.provisioner(req.authentication.as_ref())?;
                let details = provisioner.create(&CreateSandbox::default()).await?;
                self.store
                    .update(&task_id, TaskUpdate::default().sandbox(&details.sandbox_id))
                    .await?;
                details.sandbox_id
            }
        };

        let mut recalled = Vec::new();
        let (context, restored) = match persisted.filter(|p| !p.is_empty()) {
            Some(messages) => {
                let mut ctx = ConversationContext::restore(messages, self.cfg.limits);
                ctx.push(Message::user(&req.instruction));
                (ctx, true)
            }
            None => {
                recalled = match collab
                    .memory
                    .recall(&task_id, &req.instruction, self.cfg.recall_limit)
                    .await
                {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "memory recall failed");
                        Vec::new()
                    }
                };
                let mut ctx = ConversationContext::new(self.cfg.limits);
                ctx.setup_prompt(
                    &self.cfg.system_prompt,
                    req.user_system_prompt.as_deref(),
                    &recalled,
                    &req.instruction,
                );
                (ctx, false)
            }
        };

        Ok(Prepared {
            task_id,
            sandbox_id,
            collab,
            context: Arc::new(Mutex::new(context)),
            recalled,
            restored,
            max_steps,
        })
    }

    async fn execute(&self, prepared: Prepared, out: Option<mpsc::Sender<ProgressEvent>>) -> RunReport {
        let Prepared { task_id, sandbox_id, collab, context, recalled, restored, max_steps } = prepared;
        let token = CancellationToken::new();
        let _registration = self.registry.register(&task_id, &sandbox_id, token.clone());
        let _subscription = self
            .store
            .subscribe_cancel(&task_id, CancelCallback::token(token.clone()));

        let mut out = out;
        if restored {
            let msg = format!("🔄 {}", self.cfg.planner.lang.context_restored());
            forward(&mut out, &token, ProgressEvent::new(&task_id, Stage::System, msg)).await;
        }

        let cfg = PlannerConfig { max_steps: max_steps as usize, ..self.cfg.planner.clone() };
        let planner = Planner::new(&task_id, &sandbox_id, collab, context.clone(), cfg)
            .with_store(self.store.clone())
            .with_cancel_token(token.clone())
            .with_recalled(recalled);

        let (tx, mut rx) = mpsc::channel(64);
        let mut seen = 0usize;
        let report = {
            let mut run = pin!(planner.run(&tx));
            loop {
                let watch = out.clone();
                let closed = async move {
                    match watch {
                        Some(o) => o.closed().await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    report = &mut run => break report,
                    Some(ev) = rx.recv() => {
                        seen += 1;
                        forward(&mut out, &token, ev).await;
                        if seen % self.cfg.context_save_every.max(1) == 0 {
                            self.snapshot(&task_id, &sandbox_id, &context).await;
                        }
                    }
                    _ = closed => {
                        info!(task_id = %task_id, "client disconnected, cancelling task");
                        token.cancel();
                        out = None;
                    }
                }
            }
        };
        while let Ok(ev) = rx.try_recv() {
            forward(&mut out, &token, ev).await;
        }

        self.finalize(&task_id, &context, &report).await;
        report
    }

    async fn snapshot(&self, task_id: &str, sandbox_id: &str, context: &SharedContext) {
        let messages = context.lock().await.to_persisted();
        let update = TaskUpdate::default().context(messages).sandbox(sandbox_id);
        match self.store.update(task_id, update).await {
            Ok(_) => debug!(task_id, "context snapshot saved"),
            Err(e) => warn!(task_id, error = %e, "failed to save context snapshot"),
        }
    }

    async fn finalize(&self, task_id: &str, context: &SharedContext, report: &RunReport) {
        let messages = context.lock().await.to_persisted();
        if let Err(e) = self.store.save_llm_context(task_id, messages).await {
            error!(task_id, error = %e, "failed to save context");
        }

        let stats = json!({
            "steps": report.metrics.steps,
            "actions": report.metrics.actions,
            "time_ms": report.metrics.time_ms as u64,
        });
        let update = match &report.outcome {
            TaskOutcome::Finished { output } => {
                let u = TaskUpdate::status(TaskStatus::Finished);
                match output {
                    Some(o) => u.finished_output(o),
                    None => u,
                }
            }
            TaskOutcome::BudgetExhausted => TaskUpdate::status(TaskStatus::Finished),
            TaskOutcome::NeedsHuman { message } => {
                TaskUpdate::status(TaskStatus::HumanIntervention).finished_output(message)
            }
            TaskOutcome::Failed { reason } => TaskUpdate::status(TaskStatus::Failed).final_state(reason),
            TaskOutcome::Cancelled => TaskUpdate::status(TaskStatus::Cancelled),
            TaskOutcome::Error { message } => TaskUpdate::status(TaskStatus::Error).final_state(message),
        }
        .statistics(stats);

        match self.store.update(task_id, update).await {
            Ok(true) => info!(task_id, outcome = ?report.outcome, "task finalized"),
            Ok(false) => warn!(task_id, "task vanished before finalization"),
            Err(e) => error!(task_id, error = %e, "failed to finalize task"),
        }
    }

    /// Setup failed before the loop started.
    async fn abort(&self, task_id: &str, err: &AgentError) {
        error!(task_id, error = %err, "task setup failed");
        let update = TaskUpdate::status(TaskStatus::Error).final_state(err.to_string());
        if let Err(e) = self.store.update(task_id, update).await {
            error!(task_id, error = %e, "failed to record setup failure");
        }
    }
}

/// Hands an event to the caller; a gone caller cancels the task.
async fn forward(out: &mut Option<mpsc::Sender<ProgressEvent>>, token: &CancellationToken, ev: ProgressEvent) {
    let Some(tx) = out.as_ref() else {
        return;
    };
    if tx.send(ev).await.is_err() {
        info!("progress receiver dropped, cancelling task");
        token.cancel();
        *out = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_data_has_no_credentials() {
        let req = TaskRequest {
            authentication: Some(Authentication { api_key: Some("secret".into()), ..Default::default() }),
            ark_apikey: Some("k".into()),
            ..TaskRequest::new("open the browser")
        };
        let v = serde_json::to_value(req.redacted()).unwrap();
        assert_eq!(v["instruction"], "open the browser");
        assert!(v["authentication"].is_null());
        assert!(v["ark_apikey"].is_null());
    }

    #[test]
    fn step_budget_is_bounded() {
        let mut req = TaskRequest::new("x");
        assert_eq!(req.step_budget(50), 50);
        req.max_steps = Some(u32::MAX);
        assert_eq!(req.step_budget(50), MAX_STEPS_LIMIT);
        req.max_steps = Some(0);
        assert_eq!(req.step_budget(50), 1);
    }

    #[test]
    fn request_accepts_minimal_json() {
        let req: TaskRequest = serde_json::from_str(r#"{"instruction": "hi"}"#).unwrap();
        assert!(!req.continue_context);
        assert_eq!(req.max_steps, None);
    }
}
