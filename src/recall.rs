//! Long-term memory: facts saved with `save_memory(...)` and recalled into the
//! prompt of later tasks in the same session.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::AgentError;

#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn recall(&self, session: &str, query: &str, limit: usize) -> Result<Vec<String>, AgentError>;
    async fn remember(&self, session: &str, key: &str, text: &str) -> Result<(), AgentError>;
}

pub struct NoopMemory;

#[async_trait]
impl LongTermMemory for NoopMemory {
    async fn recall(&self, _session: &str, _query: &str, _limit: usize) -> Result<Vec<String>, AgentError> {
        Ok(Vec::new())
    }

    async fn remember(&self, _session: &str, _key: &str, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Process-local memory ranked by token overlap with the query.
#[derive(Default)]
pub struct InMemoryRecall {
    facts: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl InMemoryRecall {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl LongTermMemory for InMemoryRecall {
    async fn recall(&self, session: &str, query: &str, limit: usize) -> Result<Vec<String>, AgentError> {
        let q = tokens(query);
        let facts = self.facts.lock();
        let Some(entries) = facts.get(session) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, usize, &str)> = entries
            .iter()
            .enumerate()
            .map(|(i, (_, text))| {
                let t = tokens(text);
                let score = q.iter().filter(|w| t.contains(w)).count();
                (score, i, text.as_str())
            })
            .filter(|(score, _, _)| *score > 0)
            .collect();
        // best score first, newest first on ties
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored.into_iter().take(limit).map(|(_, _, t)| t.to_string()).collect())
    }

    async fn remember(&self, session: &str, key: &str, text: &str) -> Result<(), AgentError> {
        self.facts
            .lock()
            .entry(session.to_string())
            .or_default()
            .push((key.to_string(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recall_is_session_scoped_and_ranked() {
        let m = InMemoryRecall::new();
        m.remember("s1", "a", "user prefers dark mode in settings").await.unwrap();
        m.remember("s1", "b", "wallpaper is blue").await.unwrap();
        m.remember("s2", "c", "open settings quickly").await.unwrap();

        let got = m.recall("s1", "open settings", 3).await.unwrap();
        assert_eq!(got, vec!["user prefers dark mode in settings".to_string()]);
        assert!(m.recall("s3", "settings", 3).await.unwrap().is_empty());
    }
}
