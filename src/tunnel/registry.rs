//! Task registry
//!
//! Concurrent map from task id to live HTTP task, shared between the read
//! loop (insert, lookup, terminal close) and each task's own exit path
//! (remove). The lock is never held across I/O or a call into a task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::http_task::HttpTask;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<u32, Arc<HttpTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: u32) -> Option<Arc<HttpTask>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Replaces any prior binding; the read loop only inserts after
    /// confirming absence.
    pub fn insert(&self, id: u32, task: Arc<HttpTask>) {
        self.tasks.write().insert(id, task);
    }

    pub fn remove(&self, id: u32) {
        self.tasks.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the registry and close every task once. Tasks are closed after
    /// the lock is released.
    pub fn close_all(&self) {
        let drained: Vec<Arc<HttpTask>> = {
            let mut tasks = self.tasks.write();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in drained {
            task.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;
    use std::time::Duration;

    fn make_task(id: u32) -> Arc<HttpTask> {
        let (near, _far) = tokio::io::duplex(64);
        let (task, _read) = HttpTask::new(id, near.into_stream(), None, Duration::ZERO);
        task
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = TaskRegistry::new();
        assert!(registry.get(7).is_none());

        registry.insert(7, make_task(7));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(7).unwrap().id(), 7);

        registry.remove(7);
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn close_all_drains_and_closes_each_task_once() {
        let registry = TaskRegistry::new();
        let a = make_task(1);
        let b = make_task(2);
        registry.insert(1, a.clone());
        registry.insert(2, b.clone());

        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());

        // A second sweep is a no-op.
        registry.close_all();
        assert!(registry.is_empty());
    }
}
