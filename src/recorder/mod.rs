//! Asynchronous violation recording
//!
//! Denials are recorded off the request path through a bounded in-memory
//! queue drained by a background worker. When the queue is full the oldest
//! entry is dropped (and counted) rather than blocking the caller; a failed
//! batch insert is retried once and then dropped. The request path never
//! waits on the database.

use crate::domain::NewViolation;
use crate::repository::ViolationRepository;
use metrics::counter;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Max rows per insert batch
const BATCH_SIZE: usize = 64;
/// Pause before the single retry of a failed batch
const RETRY_DELAY: Duration = Duration::from_millis(200);

struct QueueInner {
    queue: Mutex<VecDeque<NewViolation>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closing: AtomicBool,
}

/// Cheap handle for enqueuing violations from the hot path.
#[derive(Clone)]
pub struct RecorderHandle {
    inner: Arc<QueueInner>,
}

impl RecorderHandle {
    /// Enqueue a violation without blocking. If the queue is at capacity the
    /// oldest queued entry is dropped and counted.
    pub fn record(&self, violation: NewViolation) {
        if self.inner.closing.load(Ordering::Relaxed) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("ratekeeper_violations_dropped_total", "reason" => "shutdown").increment(1);
            return;
        }

        {
            let mut queue = self.inner.queue.lock().expect("violation queue poisoned");
            if queue.len() >= self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("ratekeeper_violations_dropped_total", "reason" => "queue_full")
                    .increment(1);
            }
            queue.push_back(violation);
        }
        self.inner.notify.notify_one();
    }

    /// Violations dropped so far (queue overflow, persistence failure, shutdown)
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Current queue depth
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().expect("violation queue poisoned").len()
    }

    /// Ask the worker to drain the queue and exit.
    pub fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }
}

/// Background worker that persists queued violations.
pub struct ViolationRecorder<R: ViolationRepository> {
    repo: Arc<R>,
    inner: Arc<QueueInner>,
}

impl<R: ViolationRepository> ViolationRecorder<R> {
    pub fn new(repo: Arc<R>, capacity: usize) -> (RecorderHandle, Self) {
        let inner = Arc::new(QueueInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(BATCH_SIZE))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        });
        (
            RecorderHandle {
                inner: inner.clone(),
            },
            Self { repo, inner },
        )
    }

    /// Worker loop. Runs until `shutdown()` and the queue is drained.
    pub async fn run(self) {
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                if self.inner.closing.load(Ordering::Relaxed) {
                    debug!("violation recorder drained, exiting");
                    return;
                }
                self.inner.notify.notified().await;
                continue;
            }
            self.persist(batch).await;
        }
    }

    fn take_batch(&self) -> Vec<NewViolation> {
        let mut queue = self.inner.queue.lock().expect("violation queue poisoned");
        let count = queue.len().min(BATCH_SIZE);
        queue.drain(..count).collect()
    }

    async fn persist(&self, batch: Vec<NewViolation>) {
        match self.repo.insert_batch(&batch).await {
            Ok(()) => {
                counter!("ratekeeper_violations_recorded_total").increment(batch.len() as u64);
            }
            Err(e) => {
                warn!(
                    batch = batch.len(),
                    error = %e,
                    "violation batch insert failed, retrying once"
                );
                tokio::time::sleep(RETRY_DELAY).await;
                if let Err(e) = self.repo.insert_batch(&batch).await {
                    self.inner
                        .dropped
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    counter!("ratekeeper_violations_dropped_total", "reason" => "persistence")
                        .increment(batch.len() as u64);
                    warn!(
                        batch = batch.len(),
                        error = %e,
                        "violation batch dropped after retry"
                    );
                } else {
                    counter!("ratekeeper_violations_recorded_total")
                        .increment(batch.len() as u64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Severity, RESPONSE_BLOCKED};
    use crate::error::AppError;
    use crate::repository::violation::MockViolationRepository;
    use chrono::Utc;
    use uuid::Uuid;

    fn violation(endpoint: &str) -> NewViolation {
        let now = Utc::now();
        NewViolation {
            tenant_id: Uuid::new_v4(),
            user_id: None,
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            rate_limit: 100,
            request_count: 101,
            client_ip: "10.0.0.1".to_string(),
            user_agent: None,
            violation_time: now,
            window_start: now,
            window_end: now,
            retry_after_seconds: 60,
            severity: Severity::Low,
            automated_response: RESPONSE_BLOCKED.to_string(),
        }
    }

    #[tokio::test]
    async fn test_record_enqueues() {
        let (handle, _recorder) =
            ViolationRecorder::new(Arc::new(MockViolationRepository::new()), 16);
        handle.record(violation("GET:/a"));
        handle.record(violation("GET:/b"));
        assert_eq!(handle.queue_len(), 2);
        assert_eq!(handle.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let (handle, recorder) =
            ViolationRecorder::new(Arc::new(MockViolationRepository::new()), 3);
        for endpoint in ["GET:/1", "GET:/2", "GET:/3", "GET:/4"] {
            handle.record(violation(endpoint));
        }

        assert_eq!(handle.queue_len(), 3);
        assert_eq!(handle.dropped_count(), 1);

        // The oldest entry is the one that was dropped
        let batch = recorder.take_batch();
        assert_eq!(batch[0].endpoint, "GET:/2");
        assert_eq!(batch.last().unwrap().endpoint, "GET:/4");
    }

    #[tokio::test]
    async fn test_worker_persists_and_drains_on_shutdown() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();

        let mut mock = MockViolationRepository::new();
        mock.expect_insert_batch().returning(move |batch| {
            sink.lock().unwrap().extend(batch.iter().cloned());
            Ok(())
        });

        let (handle, recorder) = ViolationRecorder::new(Arc::new(mock), 16);
        let worker = tokio::spawn(recorder.run());

        handle.record(violation("GET:/a"));
        handle.record(violation("GET:/b"));
        handle.shutdown();
        worker.await.unwrap();

        assert_eq!(recorded.lock().unwrap().len(), 2);
        assert_eq!(handle.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_drops_after_one_retry() {
        let mut mock = MockViolationRepository::new();
        mock.expect_insert_batch()
            .times(2)
            .returning(|_| Err(AppError::Internal(anyhow::anyhow!("db down"))));

        let (handle, recorder) = ViolationRecorder::new(Arc::new(mock), 16);
        let worker = tokio::spawn(recorder.run());

        handle.record(violation("GET:/a"));
        handle.shutdown();
        worker.await.unwrap();

        assert_eq!(handle.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_record_after_shutdown_is_dropped() {
        let (handle, _recorder) =
            ViolationRecorder::new(Arc::new(MockViolationRepository::new()), 16);
        handle.shutdown();
        handle.record(violation("GET:/a"));
        assert_eq!(handle.queue_len(), 0);
        assert_eq!(handle.dropped_count(), 1);
    }
}
