//! Trace Store
//!
//! Keeps the most recent query traces in memory for the history endpoints.

use crate::observability::trace::QueryTrace;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// In-memory trace store
#[derive(Clone)]
pub struct TraceStore {
    traces: Arc<RwLock<VecDeque<QueryTrace>>>,
    capacity: usize,
}

impl TraceStore {
    /// Keeps at most `capacity` traces, evicting the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            traces: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self, trace: QueryTrace) {
        if let Ok(mut traces) = self.traces.write() {
            while traces.len() >= self.capacity {
                traces.pop_front();
            }
            traces.push_back(trace);
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<QueryTrace> {
        self.traces
            .read()
            .ok()
            .and_then(|traces| traces.iter().find(|t| &t.id == id).cloned())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<QueryTrace> {
        match self.traces.read() {
            Ok(traces) => traces.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.traces.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut traces) = self.traces.write() {
            traces.clear();
        }
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::trace::TraceRecorder;

    fn trace(question: &str) -> QueryTrace {
        TraceRecorder::new(question, "db", None).assemble(Vec::new(), None, None, None)
    }

    #[test]
    fn test_bounded_history_newest_first() {
        let store = TraceStore::new(2);
        let first = trace("one");
        let first_id = first.id;
        store.store(first);
        store.store(trace("two"));
        store.store(trace("three"));

        assert_eq!(store.count(), 2);
        assert!(store.get(&first_id).is_none());
        let questions: Vec<String> = store.recent(10).into_iter().map(|t| t.question).collect();
        assert_eq!(questions, vec!["three", "two"]);
    }

    #[test]
    fn test_lookup_and_clear() {
        let store = TraceStore::default();
        let t = trace("q");
        let id = t.id;
        store.store(t);
        assert_eq!(store.get(&id).map(|t| t.question), Some("q".to_string()));
        store.clear();
        assert_eq!(store.count(), 0);
    }
}
