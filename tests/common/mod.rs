#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sandbox_agent::context::Message;
use sandbox_agent::error::{AgentError, StoreError, StoreResult};
use sandbox_agent::event::ProgressEvent;
use sandbox_agent::grounding::{PrimitiveAction, UiTarsGrounder};
use sandbox_agent::planner::{Collaborators, Inference, PlannerConfig, RunReport, Sandbox, Screenshot};
use sandbox_agent::recall::{InMemoryRecall, LongTermMemory};
use sandbox_agent::registry::TaskRegistry;
use sandbox_agent::runner::{Authentication, CollaboratorFactory, RunnerConfig, TaskHandle, TaskRunner};
use sandbox_agent::sandbox::{CreateSandbox, SandboxDetails, SandboxProvisioner};
use sandbox_agent::store::{
    CancelCallback, CancelOutcome, CancelSubscription, InMemoryTaskStore, ListFilter, TaskRecord, TaskStore,
    TaskUpdate,
};
use sandbox_agent::Lang;

/// 1000x1000 display so grid coordinates equal pixels.
#[derive(Default)]
pub struct FakeSandbox {
    pub failures_left: AtomicUsize,
    pub captures: AtomicUsize,
    pub executed: Mutex<Vec<(String, PrimitiveAction)>>,
}

impl FakeSandbox {
    pub fn failing(times: usize) -> Self {
        Self { failures_left: AtomicUsize::new(times), ..Default::default() }
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().len()
    }

    pub fn actions(&self) -> Vec<PrimitiveAction> {
        self.executed.lock().iter().map(|(_, a)| a.clone()).collect()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn screenshot(&self, _sandbox_id: &str) -> Result<Screenshot, AgentError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AgentError::Sandbox("display unreachable".into()));
        }
        Ok(Screenshot { width: 1000, height: 1000, image_url: "data:image/png;base64,AAAA".into() })
    }

    async fn execute(&self, sandbox_id: &str, action: &PrimitiveAction) -> Result<(), AgentError> {
        self.executed.lock().push((sandbox_id.to_string(), action.clone()));
        Ok(())
    }
}

/// Replays scripted replies, then repeats the fallback forever.
pub struct ScriptedInference {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    pub calls: AtomicUsize,
    pub last_request: Mutex<Vec<Message>>,
}

impl ScriptedInference {
    pub fn new(replies: &[&str], fallback: &str) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            fallback: fallback.to_string(),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(Vec::new()),
        }
    }

    pub fn then_finish(replies: &[&str]) -> Self {
        Self::new(replies, "Thought: done\nAction: finished(content='done')")
    }
}

#[async_trait]
impl Inference for ScriptedInference {
    async fn complete(&self, messages: &[Message]) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = messages.to_vec();
        let next = self.replies.lock().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Returns the same facts for every session.
pub struct FixedMemory(pub Vec<String>);

#[async_trait]
impl LongTermMemory for FixedMemory {
    async fn recall(&self, _session: &str, _query: &str, limit: usize) -> Result<Vec<String>, AgentError> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }

    async fn remember(&self, _session: &str, _key: &str, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    pub created: AtomicUsize,
}

#[async_trait]
impl SandboxProvisioner for FakeProvisioner {
    async fn create(&self, _req: &CreateSandbox) -> Result<SandboxDetails, AgentError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SandboxDetails { sandbox_id: format!("sb-new-{n}"), ..Default::default() })
    }
}

pub struct FakeFactory {
    pub sandbox: Arc<FakeSandbox>,
    pub inference: Arc<ScriptedInference>,
    pub memory: Arc<dyn LongTermMemory>,
    pub provisioner: Arc<FakeProvisioner>,
}

impl FakeFactory {
    pub fn new(sandbox: FakeSandbox, inference: ScriptedInference) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            inference: Arc::new(inference),
            memory: Arc::new(InMemoryRecall::new()),
            provisioner: Arc::new(FakeProvisioner::default()),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = memory;
        self
    }
}

impl CollaboratorFactory for FakeFactory {
    fn collaborators(&self, _auth: Option<&Authentication>, _llm_key: Option<&str>) -> Result<Collaborators, AgentError> {
        Ok(Collaborators {
            sandbox: self.sandbox.clone(),
            inference: self.inference.clone(),
            grounder: Arc::new(UiTarsGrounder::default()),
            memory: self.memory.clone(),
        })
    }

    fn provisioner(&self, _auth: Option<&Authentication>) -> Result<Arc<dyn SandboxProvisioner>, AgentError> {
        Ok(self.provisioner.clone())
    }
}

/// In-memory store whose writes and cancellation polls can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryTaskStore,
    /// Fails updates that carry no status change (context snapshots).
    pub fail_snapshots: AtomicBool,
    /// Fails every update.
    pub fail_updates: AtomicBool,
    pub fail_checks: AtomicBool,
    pub failed_writes: AtomicUsize,
    pub failed_checks: AtomicUsize,
}

impl FlakyStore {
    fn backend_down(counter: &AtomicUsize) -> StoreError {
        counter.fetch_add(1, Ordering::SeqCst);
        StoreError::Backend("connection reset".into())
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, record: TaskRecord) -> StoreResult<()> {
        self.inner.create(record).await
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        self.inner.get(task_id).await
    }

    async fn update(&self, task_id: &str, update: TaskUpdate) -> StoreResult<bool> {
        let snapshot = update.status.is_none();
        if self.fail_updates.load(Ordering::SeqCst) || (snapshot && self.fail_snapshots.load(Ordering::SeqCst)) {
            return Err(Self::backend_down(&self.failed_writes));
        }
        self.inner.update(task_id, update).await
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        self.inner.delete(task_id).await
    }

    async fn list(&self, filter: ListFilter) -> StoreResult<Vec<TaskRecord>> {
        self.inner.list(filter).await
    }

    async fn count_active(&self) -> StoreResult<usize> {
        self.inner.count_active().await
    }

    async fn cleanup(&self, older_than: ChronoDuration) -> StoreResult<usize> {
        self.inner.cleanup(older_than).await
    }

    async fn request_cancel(&self, task_id: &str) -> StoreResult<CancelOutcome> {
        self.inner.request_cancel(task_id).await
    }

    async fn check_cancel_requested(&self, task_id: &str) -> StoreResult<bool> {
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(Self::backend_down(&self.failed_checks));
        }
        self.inner.check_cancel_requested(task_id).await
    }

    fn subscribe_cancel(&self, task_id: &str, callback: CancelCallback) -> Option<CancelSubscription> {
        self.inner.subscribe_cancel(task_id, callback)
    }
}

pub fn fast_config() -> RunnerConfig {
    let mut cfg = RunnerConfig::for_lang(Lang::En);
    cfg.planner = PlannerConfig {
        capture_backoff: Duration::from_millis(1),
        settle_delay: Duration::from_millis(1),
        lang: Lang::En,
        ..PlannerConfig::default()
    };
    cfg.system_prompt = "You are a GUI agent.".into();
    cfg
}

pub fn runner(store: Arc<dyn TaskStore>, factory: Arc<FakeFactory>, cfg: RunnerConfig) -> TaskRunner {
    TaskRunner::new(store, TaskRegistry::new(), factory, cfg)
}

/// Collects every streamed event, then the final report.
pub async fn drain(mut handle: TaskHandle) -> (Vec<ProgressEvent>, RunReport) {
    let mut events = Vec::new();
    while let Some(ev) = handle.events.recv().await {
        events.push(ev);
    }
    let report = handle.join.await.expect("runner task panicked");
    (events, report)
}

pub fn messages(events: &[ProgressEvent]) -> Vec<&str> {
    events.iter().map(|e| e.message.as_str()).collect()
}
