//! Poller: finds due enrollments and advances them on a worker pool.

use std::sync::Arc;
use std::time::Duration;

use outreach_core::AppConfig;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::engine::SequenceEngine;
use crate::types::DueRunReport;

const RETENTION_SWEEP_SECS: u64 = 3600;

impl SequenceEngine {
    /// One poller cycle. Advances up to `batch_size` due enrollments with at
    /// most `max_concurrency` in flight. A failing enrollment is counted and
    /// logged; it never stops the rest of the batch. Safe to call
    /// concurrently: an enrollment already being advanced is skipped.
    pub async fn run_due_actions(&self) -> DueRunReport {
        let now = self.clock.now();
        let due = self.store.due_enrollments(now, self.settings.batch_size);
        let mut report = DueRunReport::default();
        if due.is_empty() {
            return report;
        }
        debug!(count = due.len(), "Processing due enrollments");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut tasks = JoinSet::new();
        for enrollment_id in due {
            let engine = self.clone();
            let sem = semaphore.clone();
            tasks.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                (enrollment_id, engine.advance(enrollment_id).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(advance))) => {
                    report.sent += advance.emails_sent;
                    if advance.error.is_some() {
                        report.errors += 1;
                    } else if advance.skipped {
                        report.skipped += 1;
                    } else {
                        report.processed += 1;
                    }
                }
                Ok((enrollment_id, Err(err))) => {
                    report.errors += 1;
                    warn!(enrollment_id = %enrollment_id, error = %err, "Advance failed");
                }
                Err(join_err) => {
                    report.errors += 1;
                    error!(error = %join_err, "Advance task aborted");
                }
            }
        }

        metrics::counter!("sequences.due_processed").increment(u64::from(report.processed));
        metrics::counter!("sequences.emails_sent").increment(u64::from(report.sent));
        metrics::counter!("sequences.step_errors").increment(u64::from(report.errors));
        metrics::counter!("sequences.skipped").increment(u64::from(report.skipped));
        info!(
            processed = report.processed,
            sent = report.sent,
            errors = report.errors,
            skipped = report.skipped,
            "Due actions run"
        );
        report
    }
}

/// Background driver for the poller, A/B evaluation and activity retention.
pub struct SequenceScheduler {
    engine: SequenceEngine,
    poll_interval: Duration,
    ab_interval: Duration,
    activity_retention_days: u32,
}

impl SequenceScheduler {
    pub fn new(engine: SequenceEngine, config: &AppConfig) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_secs(config.scheduler.poll_interval_secs.max(1)),
            ab_interval: Duration::from_secs(config.scheduler.ab_evaluation_interval_secs.max(1)),
            activity_retention_days: config.retention.activity_days,
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped. The
    /// batch in progress when shutdown arrives is finished first.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_secs = self.poll_interval.as_secs(),
                ab_secs = self.ab_interval.as_secs(),
                "Sequence scheduler started"
            );
            let mut poll = tokio::time::interval(self.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ab = tokio::time::interval(self.ab_interval);
            ab.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut retention = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
            retention.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        self.engine.run_due_actions().await;
                    }
                    _ = ab.tick() => {
                        let decisions = self.engine.evaluate_ab_tests();
                        debug!(evaluated = decisions.len(), "A/B tests evaluated");
                    }
                    _ = retention.tick() => {
                        if self.activity_retention_days > 0 {
                            let cutoff = self.engine.now()
                                - chrono::Duration::days(i64::from(self.activity_retention_days));
                            self.engine.prune_activities(cutoff);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sequence scheduler stopped");
        })
    }
}
