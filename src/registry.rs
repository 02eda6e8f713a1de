//! Tasks running in this process. Not persisted: after a restart, orphaned
//! tasks are only reachable through the task store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct Entry {
    sandbox_id: String,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveTask {
    pub task_id: String,
    pub sandbox_id: String,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    tasks: HashMap<String, Entry>,
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the task; the returned guard removes it again when dropped.
    pub fn register(&self, task_id: &str, sandbox_id: &str, cancel: CancellationToken) -> Registration {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.tasks.insert(
            task_id.to_string(),
            Entry { sandbox_id: sandbox_id.to_string(), cancel, started_at: Utc::now(), generation },
        );
        debug!(task_id, sandbox_id, "task registered");
        Registration { registry: self.clone(), task_id: task_id.to_string(), generation }
    }

    fn deregister(&self, task_id: &str, generation: u64) {
        let mut inner = self.inner.lock();
        // a resumed run of the same id may have replaced this entry
        if inner.tasks.get(task_id).map(|e| e.generation) == Some(generation) {
            inner.tasks.remove(task_id);
            debug!(task_id, "task deregistered");
        }
    }

    /// Flips the local cancellation flag. Returns whether the task runs here.
    pub fn cancel(&self, task_id: &str) -> bool {
        let inner = self.inner.lock();
        match inner.tasks.get(task_id) {
            Some(e) => {
                e.cancel.cancel();
                info!(task_id, "task cancelled in local instance");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let inner = self.inner.lock();
        for e in inner.tasks.values() {
            e.cancel.cancel();
        }
        inner.tasks.len()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().tasks.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ActiveTask> {
        let inner = self.inner.lock();
        let mut out: Vec<ActiveTask> = inner
            .tasks
            .iter()
            .map(|(id, e)| ActiveTask {
                task_id: id.clone(),
                sandbox_id: e.sandbox_id.clone(),
                cancelled: e.cancel.is_cancelled(),
                started_at: e.started_at,
            })
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}

pub struct Registration {
    registry: TaskRegistry,
    task_id: String,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.task_id, self.generation);
    }
}
