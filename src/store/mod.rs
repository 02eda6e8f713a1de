//! Durable task records and the cross-process cancellation protocol.
//!
//! Any process sharing the backend can call [`TaskStore::request_cancel`];
//! the process actually running the task learns about it either through a
//! push subscription (when the backend has one) or by polling
//! [`TaskStore::check_cancel_requested`]. Polling is the ground truth; push
//! only shortens the delay.

pub mod memory;
pub mod notify;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::context::Message;
use crate::error::{StoreError, StoreResult};

pub use memory::InMemoryTaskStore;
pub use notify::{CancelCallback, CancelListeners, CancelSubscription};
#[cfg(feature = "postgres")]
pub use postgres::PgTaskStore;

/// Channel every backend publishes cancellation notices on. The payload is
/// the bare task id.
pub const CANCEL_CHANNEL: &str = "task_cancel";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
    Error,
    Cancelled,
    HumanIntervention,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::HumanIntervention => "human_intervention",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// `pending -> running -> terminal`; `pending` may also end directly.
    /// A terminal task may only go back to `running` when it is resumed.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, _) => true,
            (Running, Pending) => false,
            (Running, _) => true,
            (_, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "finished" => TaskStatus::Finished,
            "error" => TaskStatus::Error,
            "cancelled" => TaskStatus::Cancelled,
            "human_intervention" => TaskStatus::HumanIntervention,
            "failed" => TaskStatus::Failed,
            other => return Err(StoreError::Backend(format!("unknown task status {other:?}"))),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub query: String,
    pub max_steps: u32,
    pub final_state: Option<String>,
    pub execution_statistics: Option<Value>,
    pub sandbox_info: Option<Value>,
    pub request_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_output: Option<String>,
    pub llm_context: Option<Vec<Message>>,
    pub cancel_requested: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, status: TaskStatus, query: impl Into<String>, max_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status,
            query: query.into(),
            max_steps,
            final_state: None,
            execution_statistics: None,
            sandbox_info: None,
            request_data: None,
            created_at: now,
            updated_at: now,
            finished_output: None,
            llm_context: None,
            cancel_requested: false,
            cancelled_at: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox_id: &str) -> Self {
        self.sandbox_info = Some(sandbox_info(sandbox_id));
        self
    }

    pub fn with_request(mut self, request: Value) -> Self {
        self.request_data = Some(request);
        self
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_info.as_ref()?.get("sandbox_id")?.as_str()
    }
}

pub fn sandbox_info(sandbox_id: &str) -> Value {
    serde_json::json!({ "sandbox_id": sandbox_id })
}

/// Partial update; `None` fields are left alone. Last writer wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub query: Option<String>,
    pub max_steps: Option<u32>,
    pub final_state: Option<String>,
    pub finished_output: Option<String>,
    pub execution_statistics: Option<Value>,
    pub sandbox_info: Option<Value>,
    pub llm_context: Option<Vec<Message>>,
    /// Clears `cancel_requested`/`cancelled_at`; used when resuming.
    pub reset_cancel: bool,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    /// Back to `running` for a continued conversation.
    pub fn resume(query: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            query: Some(query.into()),
            reset_cancel: true,
            ..Default::default()
        }
    }

    pub fn final_state(mut self, s: impl Into<String>) -> Self {
        self.final_state = Some(s.into());
        self
    }

    pub fn finished_output(mut self, s: impl Into<String>) -> Self {
        self.finished_output = Some(s.into());
        self
    }

    pub fn statistics(mut self, v: Value) -> Self {
        self.execution_statistics = Some(v);
        self
    }

    pub fn sandbox(mut self, sandbox_id: &str) -> Self {
        self.sandbox_info = Some(sandbox_info(sandbox_id));
        self
    }

    pub fn context(mut self, messages: Vec<Message>) -> Self {
        self.llm_context = Some(messages);
        self
    }

    /// Applies the update in place, enforcing the status machine.
    pub fn apply(self, rec: &mut TaskRecord) -> StoreResult<()> {
        if let Some(next) = self.status {
            if !rec.status.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    task_id: rec.task_id.clone(),
                    from: rec.status,
                    to: next,
                });
            }
            rec.status = next;
        }
        if let Some(q) = self.query {
            rec.query = q;
        }
        if let Some(m) = self.max_steps {
            rec.max_steps = m;
        }
        if let Some(s) = self.final_state {
            rec.final_state = Some(s);
        }
        if let Some(s) = self.finished_output {
            rec.finished_output = Some(s);
        }
        if let Some(v) = self.execution_statistics {
            rec.execution_statistics = Some(v);
        }
        if let Some(v) = self.sandbox_info {
            rec.sandbox_info = Some(v);
        }
        if let Some(c) = self.llm_context {
            rec.llm_context = Some(c);
        }
        if self.reset_cancel {
            rec.cancel_requested = false;
            rec.cancelled_at = None;
        }
        rec.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Flag newly set.
    Requested,
    /// Flag was already set; the running task has not wound down yet.
    AlreadyRequested,
    /// Task already reached `cancelled`.
    AlreadyCancelled,
}

impl CancelOutcome {
    pub fn already_cancelled(self) -> bool {
        matches!(self, CancelOutcome::AlreadyCancelled)
    }
}

/// Decides the cancellation result for a record in `status`. `Ok(None)` means
/// the record should be flagged.
pub(crate) fn cancel_precheck(
    task_id: &str,
    status: TaskStatus,
    already_flagged: bool,
) -> StoreResult<Option<CancelOutcome>> {
    match status {
        TaskStatus::Cancelled => Ok(Some(CancelOutcome::AlreadyCancelled)),
        s if s.is_terminal() => Err(StoreError::NotCancellable { task_id: task_id.to_string(), status: s }),
        _ if already_flagged => Ok(Some(CancelOutcome::AlreadyRequested)),
        _ => Ok(None),
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, record: TaskRecord) -> StoreResult<()>;

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>>;

    /// Returns `false` when the task does not exist.
    async fn update(&self, task_id: &str, update: TaskUpdate) -> StoreResult<bool>;

    async fn delete(&self, task_id: &str) -> StoreResult<bool>;

    /// Newest first.
    async fn list(&self, filter: ListFilter) -> StoreResult<Vec<TaskRecord>>;

    async fn count_active(&self) -> StoreResult<usize>;

    /// Removes terminal records created before `now - older_than`.
    async fn cleanup(&self, older_than: Duration) -> StoreResult<usize>;

    async fn request_cancel(&self, task_id: &str) -> StoreResult<CancelOutcome>;

    async fn check_cancel_requested(&self, task_id: &str) -> StoreResult<bool>;

    async fn save_llm_context(&self, task_id: &str, messages: Vec<Message>) -> StoreResult<bool> {
        self.update(task_id, TaskUpdate::default().context(messages)).await
    }

    async fn get_llm_context(&self, task_id: &str) -> StoreResult<Option<Vec<Message>>> {
        Ok(self.get(task_id).await?.and_then(|t| t.llm_context))
    }

    /// Flags every pending or running task; returns how many were newly
    /// flagged.
    async fn request_cancel_all(&self) -> StoreResult<usize> {
        let mut ids = BTreeSet::new();
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            let filter = ListFilter { status: Some(status), ..Default::default() };
            ids.extend(self.list(filter).await?.into_iter().map(|t| t.task_id));
        }
        let mut n = 0;
        for id in ids {
            if let Ok(CancelOutcome::Requested) = self.request_cancel(&id).await {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Push delivery of cancellation notices, if the backend has it. The
    /// subscription unregisters itself on drop.
    fn subscribe_cancel(&self, _task_id: &str, _callback: CancelCallback) -> Option<CancelSubscription> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Finished));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Finished.can_transition_to(Error));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(Cancelled.can_transition_to(Running));
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Finished,
            TaskStatus::Error,
            TaskStatus::Cancelled,
            TaskStatus::HumanIntervention,
            TaskStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
            assert_eq!(serde_json::to_value(s).unwrap(), s.as_str());
        }
    }

    #[test]
    fn precheck_rules() {
        assert!(matches!(
            cancel_precheck("t", TaskStatus::Finished, false),
            Err(StoreError::NotCancellable { .. })
        ));
        assert!(matches!(cancel_precheck("t", TaskStatus::Error, false), Err(_)));
        assert_eq!(
            cancel_precheck("t", TaskStatus::Cancelled, true).unwrap(),
            Some(CancelOutcome::AlreadyCancelled)
        );
        assert_eq!(
            cancel_precheck("t", TaskStatus::Running, true).unwrap(),
            Some(CancelOutcome::AlreadyRequested)
        );
        assert_eq!(cancel_precheck("t", TaskStatus::Pending, false).unwrap(), None);
    }
}
