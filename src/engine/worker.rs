//! Queue worker: drains the delivery queue in small batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, info, warn};

use crate::config::QueueConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::mailer::Mailer;
use crate::model::{FailureOutcome, QueuedNotification};
use crate::telemetry::{metrics, spans};

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A previous cycle in this process is still running.
    AlreadyRunning,
    /// No send capability is configured.
    NotConfigured,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub skipped: Option<SkipReason>,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Reclaimed by another worker before this one got to send them.
    pub lost: usize,
}

impl CycleReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Clears the running flag when a cycle ends, however it ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct QueueWorker {
    db: Arc<Db>,
    mailer: Option<Arc<dyn Mailer>>,
    config: QueueConfig,
    running: AtomicBool,
}

impl QueueWorker {
    pub fn new(db: Arc<Db>, mailer: Option<Arc<dyn Mailer>>, config: QueueConfig) -> Self {
        Self {
            db,
            mailer,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim up to `batch_size` rows and deliver them in order.
    ///
    /// Overlapping calls on the same worker return immediately with
    /// [`SkipReason::AlreadyRunning`]. Without a mailer nothing is claimed.
    /// Each row's lease is renewed right before its send, so a slow batch
    /// never lets another worker take a row mid-send. A store failure ends
    /// the cycle with an error; rows already claimed become available again
    /// when their lease runs out, or fail if that was their last attempt.
    pub async fn process_once(&self, batch_size: i64) -> Result<CycleReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("queue cycle already running, skipping");
            return Ok(CycleReport::skipped(SkipReason::AlreadyRunning));
        }
        let _guard = CycleGuard(&self.running);

        let Some(mailer) = self.mailer.as_deref() else {
            debug!("mail transport not configured, skipping queue cycle");
            return Ok(CycleReport::skipped(SkipReason::NotConfigured));
        };

        let lease = chrono::Duration::from_std(self.config.lease)
            .map_err(|e| Error::Config(format!("queue lease out of range: {e}")))?;
        let batch = self.db.claim_batch(batch_size, Utc::now(), lease).await?;
        self.deliver_batch(mailer, &batch, lease).await
    }

    async fn deliver_batch(
        &self,
        mailer: &dyn Mailer,
        batch: &[QueuedNotification],
        lease: chrono::Duration,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            claimed: batch.len(),
            ..CycleReport::default()
        };

        for row in batch {
            match self.db.renew_lease(row, Utc::now() + lease).await {
                Ok(()) => {}
                Err(Error::InvalidTransition { .. }) => {
                    warn!(notification_id = %row.notification_id, "claim lost before send, skipping");
                    report.lost += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let span = spans::start_delivery_span(&row.notification_id, row.attempts);
            let outcome = self.deliver(mailer, row).instrument(span.clone()).await;
            spans::record_state_transition(&span, "processing", outcome_label(&outcome));
            match outcome {
                Ok(Delivery::Sent) => report.sent += 1,
                Ok(Delivery::Retry) => report.retried += 1,
                Ok(Delivery::Failed) => report.failed += 1,
                Err(e) if e.is_dependency_unavailable() => return Err(e),
                Err(e) => {
                    warn!(notification_id = %row.notification_id, error = %e, "recording delivery outcome failed");
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                lost = report.lost,
                "queue cycle finished"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, mailer: &dyn Mailer, row: &QueuedNotification) -> Result<Delivery> {
        let sent = tokio::time::timeout(
            self.config.send_timeout,
            mailer.send(&row.to_address, &row.subject, &row.body),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout(format!(
                "send exceeded {:?}",
                self.config.send_timeout
            )))
        });

        let now = Utc::now();
        let span = tracing::Span::current();
        match sent {
            Ok(message_id) => {
                self.db.mark_sent(row, Some(&message_id), now).await?;
                spans::record_outcome(&span, "sent");
                metrics::deliveries().add(1, &[KeyValue::new("outcome", "sent")]);
                debug!(notification_id = %row.notification_id, message_id = %message_id, "notification sent");
                Ok(Delivery::Sent)
            }
            Err(send_error) => {
                let base_delay = chrono::Duration::from_std(self.config.retry_base_delay)
                    .map_err(|e| Error::Config(format!("retry delay out of range: {e}")))?;
                let outcome = self
                    .db
                    .mark_failed(row, &send_error.to_string(), now, base_delay)
                    .await?;
                match outcome {
                    FailureOutcome::Retry { scheduled_for } => {
                        spans::record_outcome(&span, "retry");
                        metrics::deliveries().add(1, &[KeyValue::new("outcome", "retry")]);
                        warn!(
                            notification_id = %row.notification_id,
                            attempt = row.attempts,
                            retry_at = %scheduled_for,
                            error = %send_error,
                            "delivery failed, will retry"
                        );
                        Ok(Delivery::Retry)
                    }
                    FailureOutcome::Exhausted => {
                        spans::record_outcome(&span, "failed");
                        metrics::deliveries().add(1, &[KeyValue::new("outcome", "failed")]);
                        warn!(
                            notification_id = %row.notification_id,
                            attempts = row.attempts,
                            error = %send_error,
                            "delivery failed permanently"
                        );
                        Ok(Delivery::Failed)
                    }
                }
            }
        }
    }
}

enum Delivery {
    Sent,
    Retry,
    Failed,
}

fn outcome_label(outcome: &Result<Delivery>) -> &'static str {
    match outcome {
        Ok(Delivery::Sent) => "sent",
        Ok(Delivery::Retry) => "pending",
        Ok(Delivery::Failed) => "failed",
        Err(_) => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NeverCalled;

    #[async_trait]
    impl Mailer for NeverCalled {
        async fn send(&self, _to: &str, _subject: &str, _html: &str) -> Result<String> {
            panic!("mailer must not be called");
        }
    }

    fn lazy_db() -> Arc<Db> {
        Arc::new(Db::connect_lazy("postgres://unused@localhost:1/none").unwrap())
    }

    #[tokio::test]
    async fn unconfigured_worker_skips_without_touching_the_store() {
        let worker = QueueWorker::new(lazy_db(), None, QueueConfig::default());
        let report = worker.process_once(10).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::NotConfigured));
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let worker = QueueWorker::new(lazy_db(), Some(Arc::new(NeverCalled)), QueueConfig::default());
        worker.running.store(true, Ordering::Release);
        let report = worker.process_once(10).await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::AlreadyRunning));
        // The skipped call must not clear a flag it did not set.
        assert!(worker.is_running());
    }
}
