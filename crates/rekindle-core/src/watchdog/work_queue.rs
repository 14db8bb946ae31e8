// Copyright (C) 2025 The Rekindle Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keyed work queue: items sharing a key run one after another, distinct keys run in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

type Queues = HashMap<String, VecDeque<BoxFuture<'static, ()>>>;

#[derive(Clone, Default)]
pub(crate) struct WorkQueue {
    queues: Arc<Mutex<Queues>>,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `work` to the queue of `key`, starting a drain task if the key is idle.
    pub(crate) async fn enqueue(&self, key: impl Into<String>, work: BoxFuture<'static, ()>) {
        let key = key.into();
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(&key) {
            queue.push_back(work);
            return;
        }

        queues.insert(key.clone(), VecDeque::from([work]));
        drop(queues);

        let queues = self.queues.clone();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut queues = queues.lock().await;
                    let Some(queue) = queues.get_mut(&key) else {
                        break;
                    };
                    match queue.pop_front() {
                        Some(work) => work,
                        None => {
                            // Removed under the lock, so a concurrent enqueue starts a fresh worker.
                            queues.remove(&key);
                            break;
                        }
                    }
                };
                next.await;
            }
        });
    }

    #[cfg(test)]
    async fn active_keys(&self) -> usize {
        self.queues.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn record(log: &Arc<StdMutex<Vec<String>>>, entry: String, delay_ms: u64) -> BoxFuture<'static, ()> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(format!("start {entry}"));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(format!("end {entry}"));
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_same_key_runs_sequentially() {
        let queue = WorkQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue("a", record(&log, "1".into(), 30)).await;
        queue.enqueue("a", record(&log, "2".into(), 0)).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(queue.active_keys().await, 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_in_parallel() {
        let queue = WorkQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue("a", record(&log, "a".into(), 50)).await;
        queue.enqueue("b", record(&log, "b".into(), 50)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let log = log.lock().unwrap();
            assert!(log.contains(&"start a".to_string()));
            assert!(log.contains(&"start b".to_string()));
            assert!(!log.iter().any(|e| e.starts_with("end")));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_key_is_reusable_after_drain() {
        let queue = WorkQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue("a", record(&log, "1".into(), 0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue("a", record(&log, "2".into(), 0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(log.lock().unwrap().len(), 4);
        assert_eq!(queue.active_keys().await, 0);
    }
}
