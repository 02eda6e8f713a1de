use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use sandbox_agent::error::StoreError;
use sandbox_agent::store::{
    CancelCallback, CancelOutcome, InMemoryTaskStore, ListFilter, TaskRecord, TaskStatus, TaskStore, TaskUpdate,
};

async fn seeded(statuses: &[(&str, TaskStatus)]) -> InMemoryTaskStore {
    let store = InMemoryTaskStore::new();
    for (id, status) in statuses {
        store.create(TaskRecord::new(*id, *status, "q", 50)).await.unwrap();
    }
    store
}

#[tokio::test]
async fn repeated_cancel_is_idempotent() {
    let store = seeded(&[("t", TaskStatus::Running)]).await;

    assert_eq!(store.request_cancel("t").await.unwrap(), CancelOutcome::Requested);
    let first = store.get("t").await.unwrap().unwrap();
    assert!(first.cancel_requested);
    assert!(first.cancelled_at.is_some());

    let again = store.request_cancel("t").await.unwrap();
    assert_eq!(again, CancelOutcome::AlreadyRequested);
    assert!(!again.already_cancelled());
    let second = store.get("t").await.unwrap().unwrap();
    assert_eq!(second.cancelled_at, first.cancelled_at);
    assert!(store.check_cancel_requested("t").await.unwrap());
}

#[tokio::test]
async fn cancelled_task_reports_already_cancelled() {
    let store = seeded(&[("t", TaskStatus::Running)]).await;
    store.request_cancel("t").await.unwrap();
    store.update("t", TaskUpdate::status(TaskStatus::Cancelled)).await.unwrap();
    assert!(store.request_cancel("t").await.unwrap().already_cancelled());
}

#[tokio::test]
async fn terminal_tasks_reject_cancellation_untouched() {
    let store = seeded(&[
        ("done", TaskStatus::Finished),
        ("broken", TaskStatus::Error),
        ("gave-up", TaskStatus::Failed),
        ("human", TaskStatus::HumanIntervention),
    ])
    .await;

    for id in ["done", "broken", "gave-up", "human"] {
        let before = store.get(id).await.unwrap().unwrap();
        let err = store.request_cancel(id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotCancellable { .. }), "{id}: {err}");
        assert_eq!(store.get(id).await.unwrap().unwrap(), before);
    }
    assert!(matches!(store.request_cancel("missing").await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn push_subscription_cancels_token() {
    let store = seeded(&[("t", TaskStatus::Running), ("other", TaskStatus::Running)]).await;
    let token = CancellationToken::new();
    let sub = store.subscribe_cancel("t", CancelCallback::token(token.clone())).unwrap();
    assert_eq!(sub.task_id(), "t");

    store.request_cancel("other").await.unwrap();
    assert!(!token.is_cancelled());
    store.request_cancel("t").await.unwrap();
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn dropped_subscription_stops_delivery() {
    let store = seeded(&[("t", TaskStatus::Running)]).await;
    let token = CancellationToken::new();
    drop(store.subscribe_cancel("t", CancelCallback::token(token.clone())));
    store.request_cancel("t").await.unwrap();
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn poll_only_store_has_no_push() {
    let store = InMemoryTaskStore::without_push();
    store.create(TaskRecord::new("t", TaskStatus::Running, "q", 50)).await.unwrap();
    assert!(store.subscribe_cancel("t", CancelCallback::sync(|_| {})).is_none());
    store.request_cancel("t").await.unwrap();
    assert!(store.check_cancel_requested("t").await.unwrap());
}

#[tokio::test]
async fn async_callbacks_are_awaited() {
    let store = seeded(&[("t", TaskStatus::Pending)]).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = store
        .subscribe_cancel(
            "t",
            CancelCallback::from_async(move |id| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(id);
                }
            }),
        )
        .unwrap();
    store.request_cancel("t").await.unwrap();
    assert_eq!(rx.try_recv().unwrap(), "t");
}

#[tokio::test]
async fn cancel_all_flags_only_active_tasks() {
    let store = seeded(&[
        ("p", TaskStatus::Pending),
        ("r", TaskStatus::Running),
        ("f", TaskStatus::Finished),
    ])
    .await;
    assert_eq!(store.request_cancel_all().await.unwrap(), 2);
    assert!(store.check_cancel_requested("p").await.unwrap());
    assert!(store.check_cancel_requested("r").await.unwrap());
    assert!(!store.check_cancel_requested("f").await.unwrap());
}

#[tokio::test]
async fn cancel_all_counts_only_newly_flagged_tasks() {
    let store = seeded(&[("p", TaskStatus::Pending), ("r", TaskStatus::Running)]).await;
    store.request_cancel("r").await.unwrap();
    assert_eq!(store.request_cancel_all().await.unwrap(), 1);
    assert_eq!(store.request_cancel_all().await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_removes_only_old_terminal_tasks() {
    let store = InMemoryTaskStore::new();
    let old = Utc::now() - Duration::days(10);
    for (id, status, created) in [
        ("old-done", TaskStatus::Finished, old),
        ("old-running", TaskStatus::Running, old),
        ("new-done", TaskStatus::Finished, Utc::now()),
    ] {
        let mut rec = TaskRecord::new(id, status, "q", 50);
        rec.created_at = created;
        store.create(rec).await.unwrap();
    }

    assert_eq!(store.cleanup(Duration::days(7)).await.unwrap(), 1);
    assert!(store.get("old-done").await.unwrap().is_none());
    assert!(store.get("old-running").await.unwrap().is_some());
    assert!(store.get("new-done").await.unwrap().is_some());
}

#[tokio::test]
async fn list_is_newest_first_and_paginated() {
    let store = InMemoryTaskStore::new();
    let base = Utc::now();
    for (i, status) in [TaskStatus::Finished, TaskStatus::Running, TaskStatus::Finished, TaskStatus::Error]
        .into_iter()
        .enumerate()
    {
        let mut rec = TaskRecord::new(format!("t{i}"), status, "q", 50);
        rec.created_at = base + Duration::seconds(i as i64);
        store.create(rec).await.unwrap();
    }

    let ids = |v: Vec<TaskRecord>| v.into_iter().map(|t| t.task_id).collect::<Vec<_>>();
    let all = store.list(ListFilter::default()).await.unwrap();
    assert_eq!(ids(all), vec!["t3", "t2", "t1", "t0"]);

    let page = store.list(ListFilter { limit: Some(2), offset: 1, ..Default::default() }).await.unwrap();
    assert_eq!(ids(page), vec!["t2", "t1"]);

    let finished = store
        .list(ListFilter { status: Some(TaskStatus::Finished), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(ids(finished), vec!["t2", "t0"]);
    assert_eq!(store.count_active().await.unwrap(), 1);
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let store = seeded(&[("t", TaskStatus::Finished)]).await;
    let err = store.update("t", TaskUpdate::status(TaskStatus::Error)).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { from: TaskStatus::Finished, to: TaskStatus::Error, .. }));
    assert!(!store.update("missing", TaskUpdate::status(TaskStatus::Running)).await.unwrap());
    assert!(store.update("t", TaskUpdate::resume("again")).await.unwrap());
}

#[tokio::test]
async fn duplicate_create_fails() {
    let store: Arc<dyn TaskStore> = Arc::new(seeded(&[("t", TaskStatus::Pending)]).await);
    let err = store.create(TaskRecord::new("t", TaskStatus::Pending, "q", 1)).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
    assert!(store.delete("t").await.unwrap());
    assert!(!store.delete("t").await.unwrap());
}
