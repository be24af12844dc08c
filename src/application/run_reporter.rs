//! Run summary construction and delivery

use tracing::warn;
use uuid::Uuid;

use super::crawl_pipeline::CrawlSummary;
use crate::domain::{FailureBreakdown, RunStats};
use crate::infrastructure::RunNotifier;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub struct RunReporter {
    run_id: Uuid,
    cost_per_gb_usd: f64,
    notifier: Box<dyn RunNotifier>,
}

impl RunReporter {
    pub fn new(cost_per_gb_usd: f64, notifier: Box<dyn RunNotifier>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cost_per_gb_usd,
            notifier,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn build_stats(&self, summary: &CrawlSummary) -> RunStats {
        let counters = summary.counters;
        let duration_secs = (summary.finished_at - summary.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;

        // Throughput covers this process only, not the resumed baseline
        let scraped_now = counters
            .listings_succeeded
            .saturating_sub(summary.baseline.listings_succeeded);
        let listings_per_minute = if duration_secs > 0.0 {
            scraped_now as f64 / (duration_secs / 60.0)
        } else {
            0.0
        };

        RunStats {
            run_id: self.run_id,
            start_page: summary.start_page,
            end_page: summary.end_page,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            duration_secs,
            outcome: summary.outcome.clone(),
            resumable: summary.outcome.is_resumable(),
            counters,
            failures: FailureBreakdown::from(&counters),
            failed_pages: summary.failed_pages.clone(),
            success_rate: counters.success_rate(),
            phone_success_rate: counters.phone_success_rate(),
            listings_per_minute,
            estimated_cost_usd: counters.bytes_received as f64 / BYTES_PER_GIB * self.cost_per_gb_usd,
        }
    }

    /// Build the summary and hand it to the notifier.
    ///
    /// A notifier failure is logged and otherwise ignored.
    pub async fn report(&self, summary: &CrawlSummary) -> RunStats {
        let stats = self.build_stats(summary);
        if let Err(e) = self.notifier.notify(&stats).await {
            warn!("Run summary could not be delivered: {:#}", e);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CrawlCounters, RunOutcome};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier(Arc<AtomicUsize>);

    #[async_trait]
    impl RunNotifier for FailingNotifier {
        async fn notify(&self, _stats: &RunStats) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("webhook unreachable")
        }
    }

    fn summary(outcome: RunOutcome) -> CrawlSummary {
        let started_at = Utc::now();
        let counters = CrawlCounters {
            listings_succeeded: 150,
            listings_failed: 50,
            phone_succeeded: 90,
            phone_failed: 10,
            bytes_received: 512 * 1024 * 1024,
            blocked: 30,
            timeouts: 20,
            ..CrawlCounters::default()
        };
        CrawlSummary {
            start_page: 1,
            end_page: 10,
            started_at,
            finished_at: started_at + Duration::seconds(120),
            outcome,
            counters,
            baseline: CrawlCounters {
                listings_succeeded: 50,
                ..CrawlCounters::default()
            },
            failed_pages: vec![4],
        }
    }

    #[test]
    fn stats_are_derived_from_counters() {
        let reporter = RunReporter::new(8.0, Box::new(crate::infrastructure::LogNotifier));
        let stats = reporter.build_stats(&summary(RunOutcome::Completed));

        assert_eq!(stats.run_id, reporter.run_id());
        assert!((stats.duration_secs - 120.0).abs() < f64::EPSILON);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert!((stats.phone_success_rate - 0.9).abs() < 1e-9);
        assert!((stats.listings_per_minute - 50.0).abs() < 1e-9);
        assert!((stats.estimated_cost_usd - 4.0).abs() < 1e-9);
        assert_eq!(stats.failures.blocked, 30);
        assert_eq!(stats.failures.timeout, 20);
        assert!(!stats.resumable);
    }

    #[test]
    fn interrupted_runs_are_resumable() {
        let reporter = RunReporter::new(8.0, Box::new(crate::infrastructure::LogNotifier));
        let stats = reporter.build_stats(&summary(RunOutcome::Interrupted { resume_page: 5 }));
        assert!(stats.resumable);
        assert_eq!(stats.outcome.exit_code(), 130);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_report() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reporter = RunReporter::new(8.0, Box::new(FailingNotifier(Arc::clone(&calls))));
        let stats = reporter.report(&summary(RunOutcome::Completed)).await;
        assert!(stats.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
