//! Process-local [`TaskStore`]. Cancellation notices are delivered to
//! subscribers synchronously from `request_cancel`.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{
    cancel_precheck, CancelCallback, CancelListeners, CancelOutcome, CancelSubscription, ListFilter,
    TaskRecord, TaskStore, TaskUpdate,
};
use crate::error::{StoreError, StoreResult};

pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskRecord>>,
    listeners: CancelListeners,
    push: bool,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self { tasks: RwLock::new(HashMap::new()), listeners: CancelListeners::new(), push: true }
    }

    /// Poll-only store, as a backend without notifications behaves.
    pub fn without_push() -> Self {
        Self { push: false, ..Self::new() }
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, record: TaskRecord) -> StoreResult<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id));
        }
        debug!(task_id = %record.task_id, status = %record.status, "task created");
        tasks.insert(record.task_id.clone(), record);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> StoreResult<Option<TaskRecord>> {
        Ok(self.tasks.read().get(task_id).cloned())
    }

    async fn update(&self, task_id: &str, update: TaskUpdate) -> StoreResult<bool> {
        let mut tasks = self.tasks.write();
        let Some(rec) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        update.apply(rec)?;
        Ok(true)
    }

    async fn delete(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.tasks.write().remove(task_id).is_some())
    }

    async fn list(&self, filter: ListFilter) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read();
        let mut out: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        let iter = out.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    async fn count_active(&self) -> StoreResult<usize> {
        Ok(self.tasks.read().values().filter(|t| t.status.is_active()).count())
    }

    async fn cleanup(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff = Utc::now() - older_than;
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.created_at < cutoff));
        let removed = before - tasks.len();
        info!(removed, "cleaned up old tasks");
        Ok(removed)
    }

    async fn request_cancel(&self, task_id: &str) -> StoreResult<CancelOutcome> {
        let outcome = {
            let mut tasks = self.tasks.write();
            let rec = tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            match cancel_precheck(task_id, rec.status, rec.cancel_requested)? {
                Some(CancelOutcome::AlreadyCancelled) => return Ok(CancelOutcome::AlreadyCancelled),
                Some(o) => o,
                None => {
                    let now = Utc::now();
                    rec.cancel_requested = true;
                    rec.cancelled_at.get_or_insert(now);
                    rec.updated_at = now;
                    CancelOutcome::Requested
                }
            }
        };
        info!(task_id, ?outcome, "cancellation requested");
        if self.push {
            self.listeners.dispatch(task_id).await;
        }
        Ok(outcome)
    }

    async fn check_cancel_requested(&self, task_id: &str) -> StoreResult<bool> {
        Ok(self.tasks.read().get(task_id).map(|t| t.cancel_requested).unwrap_or(false))
    }

    fn subscribe_cancel(&self, task_id: &str, callback: CancelCallback) -> Option<CancelSubscription> {
        self.push.then(|| self.listeners.register(task_id, callback))
    }
}
