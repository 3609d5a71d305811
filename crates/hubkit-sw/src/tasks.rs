//! Background work the worker must finish before it can be considered idle.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Registry of spawned tasks, the counterpart of `event.waitUntil(promise)`.
#[derive(Debug, Clone, Default)]
pub struct WaitUntil {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and keep its handle until it finishes or the next
    /// [`settle`](Self::settle).
    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut handles = self.handles.lock().await;
        reap(&mut handles).await;
        handles.push(handle);
    }

    /// Number of tasks still running.
    pub async fn pending(&self) -> usize {
        let mut handles = self.handles.lock().await;
        reap(&mut handles).await;
        handles.len()
    }

    /// Await every registered task, including ones registered while settling.
    /// Returns how many tasks were awaited.
    pub async fn settle(&self) -> usize {
        let mut settled = 0;
        loop {
            let batch: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task did not complete");
                }
                settled += 1;
            }
        }
        if settled > 0 {
            debug!(settled, "Background tasks settled");
        }
        settled
    }
}

/// Drop handles of finished tasks, reporting any that panicked.
async fn reap(handles: &mut Vec<JoinHandle<()>>) {
    if !handles.iter().any(JoinHandle::is_finished) {
        return;
    }
    let (finished, running): (Vec<_>, Vec<_>) =
        std::mem::take(handles).into_iter().partition(|h| h.is_finished());
    *handles = running;
    for handle in finished {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task did not complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_settle_waits_for_all() {
        let tasks = WaitUntil::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            tasks
                .spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        assert_eq!(tasks.pending().await, 3);
        assert_eq!(tasks.settle().await, 3);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending().await, 0);
    }

    #[tokio::test]
    async fn test_settle_survives_panicking_task() {
        let tasks = WaitUntil::new();
        tasks.spawn(async { panic!("revalidation blew up") }).await;
        assert_eq!(tasks.settle().await, 1);
        assert_eq!(tasks.pending().await, 0);
    }

    #[tokio::test]
    async fn test_finished_tasks_are_dropped() {
        let tasks = WaitUntil::new();
        for i in 0..500 {
            tasks.spawn(async {}).await;
            tokio::task::yield_now().await;
            if i % 100 == 99 {
                assert!(tasks.handles.lock().await.len() < 10);
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(tasks.pending().await, 0);
        assert!(tasks.handles.lock().await.is_empty());
        assert_eq!(tasks.settle().await, 0);
    }

    #[tokio::test]
    async fn test_reap_keeps_running_tasks() {
        let tasks = WaitUntil::new();
        tasks
            .spawn(tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await;
        tasks.spawn(async {}).await;
        tokio::task::yield_now().await;

        assert_eq!(tasks.pending().await, 1);
        assert_eq!(tasks.settle().await, 1);
    }

    #[tokio::test]
    async fn test_settle_empty() {
        assert_eq!(WaitUntil::new().settle().await, 0);
    }
}
