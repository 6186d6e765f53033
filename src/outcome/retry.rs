use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{OutcomeRecord, OutcomeSink};

/// A record whose append failed on the response path.
#[derive(Debug, Clone)]
pub struct PendingAppend {
    pub record: OutcomeRecord,
    /// Failed attempts so far, including the inline one.
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

impl PendingAppend {
    /// Time since the inline append failed.
    pub fn pending_ms(&self) -> i64 {
        (Utc::now() - self.queued_at).num_milliseconds().max(0)
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Background retry queue for outcome-log appends.
///
/// The router never waits on it: a failed append is queued and a retry
/// task is spawned. Each record gets `max_attempts` background attempts,
/// `delay` apart, before it is dropped with an error log.
pub struct RetryQueue {
    pending: Mutex<VecDeque<PendingAppend>>,
    max_size: usize,
    delay: Duration,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(max_size: usize, delay: Duration, max_attempts: u32) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_size,
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue a record whose inline append failed.
    pub async fn enqueue(&self, record: OutcomeRecord) -> anyhow::Result<()> {
        let mut queue = self.pending.lock().await;
        if queue.len() >= self.max_size {
            anyhow::bail!(
                "Outcome retry queue full ({}/{}); dropping record for directive {}",
                queue.len(),
                self.max_size,
                record.directive_id
            );
        }
        queue.push_back(PendingAppend {
            record,
            attempts: 1,
            queued_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Try every queued append once. The queue lock is not held while
    /// writing.
    pub async fn flush(&self, sink: &Arc<dyn OutcomeSink>) -> FlushReport {
        let batch: Vec<PendingAppend> = self.pending.lock().await.drain(..).collect();
        let mut report = FlushReport::default();
        let mut requeue = Vec::new();

        for mut item in batch {
            let writer = Arc::clone(sink);
            let record = item.record.clone();
            let result = tokio::task::spawn_blocking(move || writer.append(&record))
                .await
                .map_err(anyhow::Error::from)
                .and_then(|r| r);

            match result {
                Ok(()) => {
                    report.written += 1;
                    tracing::info!(
                        directive_id = %item.record.directive_id,
                        attempts = item.attempts + 1,
                        pending_ms = item.pending_ms(),
                        "Outcome record written on retry"
                    );
                }
                Err(e) => {
                    item.attempts += 1;
                    // One inline attempt plus `max_attempts` background ones.
                    if item.attempts > self.max_attempts {
                        report.dropped += 1;
                        tracing::error!(
                            directive_id = %item.record.directive_id,
                            attempts = item.attempts,
                            pending_ms = item.pending_ms(),
                            error = %e,
                            "Outcome record dropped after retries"
                        );
                    } else {
                        report.requeued += 1;
                        tracing::warn!(
                            directive_id = %item.record.directive_id,
                            attempts = item.attempts,
                            error = %e,
                            "Outcome log retry failed"
                        );
                        requeue.push(item);
                    }
                }
            }
        }

        if !requeue.is_empty() {
            let mut queue = self.pending.lock().await;
            for item in requeue.into_iter().rev() {
                queue.push_front(item);
            }
        }
        report
    }

    /// Spawn a task that flushes after `delay`, repeating until the queue
    /// drains or every record has used its attempts.
    pub fn schedule(self: &Arc<Self>, sink: Arc<dyn OutcomeSink>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..queue.max_attempts {
                tokio::time::sleep(queue.delay).await;
                queue.flush(&sink).await;
                if queue.is_empty().await {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{outcome_record, FlakySink};

    #[tokio::test]
    async fn flush_writes_after_transient_failure() {
        let sink = Arc::new(FlakySink::failing_first(1));
        let queue = RetryQueue::new(16, Duration::from_millis(1), 3);
        queue.enqueue(outcome_record("plan", Utc::now())).await.unwrap();

        let dyn_sink: Arc<dyn OutcomeSink> = sink.clone();
        let first = queue.flush(&dyn_sink).await;
        assert_eq!(first.requeued, 1);
        let second = queue.flush(&dyn_sink).await;
        assert_eq!(second.written, 1);
        assert!(queue.is_empty().await);
        assert_eq!(sink.written().len(), 1);
    }

    #[tokio::test]
    async fn record_is_dropped_after_max_attempts() {
        let sink: Arc<dyn OutcomeSink> = Arc::new(FlakySink::always_failing());
        let queue = RetryQueue::new(16, Duration::from_millis(1), 2);
        queue.enqueue(outcome_record("plan", Utc::now())).await.unwrap();

        assert_eq!(queue.flush(&sink).await.requeued, 1);
        assert_eq!(queue.flush(&sink).await.dropped, 1);
        assert!(queue.is_empty().await);
    }

    #[test]
    fn pending_age_is_measured_from_enqueue() {
        let item = PendingAppend {
            record: outcome_record("plan", Utc::now()),
            attempts: 1,
            queued_at: Utc::now() - chrono::Duration::seconds(3),
        };
        assert!(item.pending_ms() >= 3_000);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let queue = RetryQueue::new(1, Duration::from_millis(1), 1);
        queue.enqueue(outcome_record("a", Utc::now())).await.unwrap();
        assert!(queue.enqueue(outcome_record("b", Utc::now())).await.is_err());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn scheduled_retry_drains_queue() {
        let sink = Arc::new(FlakySink::failing_first(1));
        let queue = Arc::new(RetryQueue::new(16, Duration::from_millis(5), 3));
        queue.enqueue(outcome_record("plan", Utc::now())).await.unwrap();

        queue.schedule(sink.clone()).await.unwrap();
        assert!(queue.is_empty().await);
        assert_eq!(sink.written().len(), 1);
    }
}
