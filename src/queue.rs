use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, OwnedMutexGuard, oneshot};

use crate::models::SandboxRun;
use crate::validator::ValidatedSubmission;

/// A submission waiting for a sandbox worker
pub struct RunMessage {
    pub run_id: String,
    pub submission: ValidatedSubmission,
    pub responder: oneshot::Sender<anyhow::Result<SandboxRun>>,
    /// Held until the run is committed, so runs of one incident never overlap
    pub guard: OwnedMutexGuard<()>,
}

pub struct RunQueue {
    queue: Mutex<VecDeque<RunMessage>>,
    notify: Notify,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, message: RunMessage) {
        self.queue.lock().await.push_back(message);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> RunMessage {
        loop {
            if let Some(message) = self.queue.lock().await.pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

/// One async lock per incident id
///
/// Entries nobody holds or waits on are pruned on the next acquisition.
#[derive(Default)]
pub struct IncidentLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IncidentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other submission for `incident_id` is in flight
    pub async fn acquire(&self, incident_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(incident_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::OneLanguageConfig;

    impl RunQueue {
        async fn len(&self) -> usize {
            self.queue.lock().await.len()
        }
    }

    impl IncidentLocks {
        /// Number of incidents with a submission in flight or waiting
        fn tracked(&self) -> usize {
            self.locks
                .lock()
                .values()
                .filter(|lock| Arc::strong_count(lock) > 1)
                .count()
        }
    }

    fn message(id: &str, guard: OwnedMutexGuard<()>) -> (RunMessage, oneshot::Receiver<anyhow::Result<SandboxRun>>) {
        let (tx, rx) = oneshot::channel();
        let message = RunMessage {
            run_id: id.to_string(),
            submission: ValidatedSubmission {
                incident_id: format!("incident-{id}"),
                snippet: "echo ok\n".to_string(),
                language: OneLanguageConfig {
                    name: "shell".to_string(),
                    file_name: "snippet.sh".to_string(),
                    command: vec!["/bin/sh".to_string(), "%INPUT%".to_string()],
                },
            },
            responder: tx,
            guard,
        };
        (message, rx)
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let locks = IncidentLocks::new();
        let queue = RunQueue::new();
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (m, rx) = message(id, locks.acquire(id).await);
            receivers.push(rx);
            queue.push(m).await;
        }
        assert_eq!(queue.len().await, 3);
        assert_eq!(queue.pop().await.run_id, "a");
        assert_eq!(queue.pop().await.run_id, "b");
        assert_eq!(queue.pop().await.run_id, "c");
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(RunQueue::new());
        let locks = IncidentLocks::new();

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.run_id })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        let (m, _rx) = message("late", locks.acquire("late").await);
        queue.push(m).await;
        assert_eq!(popper.await.unwrap(), "late");
    }

    #[tokio::test]
    async fn same_incident_is_serialized() {
        let locks = Arc::new(IncidentLocks::new());
        let first = locks.acquire("inc-1").await;

        let second = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("inc-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        // A different incident is not blocked.
        let other = tokio::time::timeout(Duration::from_millis(100), locks.acquire("inc-2")).await;
        assert!(other.is_ok());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let locks = IncidentLocks::new();
        let guard = locks.acquire("x").await;
        assert_eq!(locks.tracked(), 1);
        drop(guard);
        assert_eq!(locks.tracked(), 0);

        let _guard = locks.acquire("y").await;
        assert_eq!(locks.locks.lock().len(), 1);
    }
}
