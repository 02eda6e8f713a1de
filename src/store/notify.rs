use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback fired when a cancellation notice for a task arrives.
#[derive(Clone)]
pub enum CancelCallback {
    Sync(Arc<dyn Fn(&str) + Send + Sync>),
    Async(Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl CancelCallback {
    pub fn sync(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        CancelCallback::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        CancelCallback::Async(Arc::new(move |id| Box::pin(f(id))))
    }

    /// Cancels `token` when fired.
    pub fn token(token: CancellationToken) -> Self {
        Self::sync(move |_| token.cancel())
    }

    async fn fire(&self, task_id: &str) {
        match self {
            CancelCallback::Sync(f) => f(task_id),
            CancelCallback::Async(f) => f(task_id.to_string()).await,
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    by_task: HashMap<String, Vec<(u64, CancelCallback)>>,
}

/// Per-task callbacks invoked by a backend's notification listener.
#[derive(Clone, Default)]
pub struct CancelListeners {
    inner: Arc<Mutex<Inner>>,
}

impl CancelListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str, callback: CancelCallback) -> CancelSubscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_task.entry(task_id.to_string()).or_default().push((id, callback));
        debug!(task_id, "registered cancel listener");
        CancelSubscription { listeners: self.clone(), task_id: task_id.to_string(), id }
    }

    /// Drops one callback, or every callback of the task when `id` is `None`.
    pub fn unregister(&self, task_id: &str, id: Option<u64>) {
        let mut inner = self.inner.lock();
        match id {
            Some(id) => {
                if let Some(list) = inner.by_task.get_mut(task_id) {
                    list.retain(|(i, _)| *i != id);
                    if list.is_empty() {
                        inner.by_task.remove(task_id);
                    }
                }
            }
            None => {
                inner.by_task.remove(task_id);
            }
        }
        debug!(task_id, "unregistered cancel listener");
    }

    pub fn count(&self, task_id: &str) -> usize {
        self.inner.lock().by_task.get(task_id).map(Vec::len).unwrap_or(0)
    }

    /// Fires every callback registered for `task_id`; returns how many ran.
    pub async fn dispatch(&self, task_id: &str) -> usize {
        let callbacks: Vec<CancelCallback> = self
            .inner
            .lock()
            .by_task
            .get(task_id)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for cb in &callbacks {
            cb.fire(task_id).await;
        }
        callbacks.len()
    }
}

/// Unregisters its callback when dropped.
pub struct CancelSubscription {
    listeners: CancelListeners,
    task_id: String,
    id: u64,
}

impl CancelSubscription {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for CancelSubscription {
    fn drop(&mut self) {
        self.listeners.unregister(&self.task_id, Some(self.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sync_and_async_callbacks_fire_for_their_task_only() {
        let listeners = CancelListeners::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let _a = listeners.register("t1", CancelCallback::sync(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        let _b = listeners.register("t1", CancelCallback::from_async(move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(10, Ordering::SeqCst);
            }
        }));

        assert_eq!(listeners.dispatch("t2").await, 0);
        assert_eq!(listeners.dispatch("t1").await, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters() {
        let listeners = CancelListeners::new();
        let token = CancellationToken::new();
        let sub = listeners.register("t", CancelCallback::token(token.clone()));
        assert_eq!(listeners.count("t"), 1);
        drop(sub);
        assert_eq!(listeners.count("t"), 0);
        listeners.dispatch("t").await;
        assert!(!token.is_cancelled());
    }
}
