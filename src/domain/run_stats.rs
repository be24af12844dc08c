use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::checkpoint::CrawlCounters;

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Interrupted { resume_page: u32 },
    Failed { error: String, resume_page: u32 },
}

impl RunOutcome {
    /// Interrupted and failed runs can be continued from their checkpoint
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Completed)
    }

    /// Process exit status for the binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Interrupted { .. } => 130,
            Self::Failed { .. } => 1,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Interrupted { resume_page } => {
                write!(f, "interrupted (resume at page {resume_page})")
            }
            Self::Failed { error, resume_page } => {
                write!(f, "failed: {error} (resume at page {resume_page})")
            }
        }
    }
}

/// Failure counts per category, copied out of the counters for the summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBreakdown {
    pub blocked: u64,
    pub timeout: u64,
    pub transport: u64,
    pub http_status: u64,
    pub parse_mismatch: u64,
}

impl From<&CrawlCounters> for FailureBreakdown {
    fn from(counters: &CrawlCounters) -> Self {
        Self {
            blocked: counters.blocked,
            timeout: counters.timeouts,
            transport: counters.transport_errors,
            http_status: counters.http_errors,
            parse_mismatch: counters.parse_mismatches,
        }
    }
}

/// Terminal summary of one run, produced exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub start_page: u32,
    pub end_page: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outcome: RunOutcome,
    pub resumable: bool,
    pub counters: CrawlCounters,
    pub failures: FailureBreakdown,
    pub failed_pages: Vec<u32>,
    pub success_rate: f64,
    pub phone_success_rate: f64,
    pub listings_per_minute: f64,
    pub estimated_cost_usd: f64,
}

impl RunStats {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// One-line human summary for logs and chat notifications
    pub fn headline(&self) -> String {
        format!(
            "Crawl {} for pages {}-{}: {} listings ({} new, {} updated), {} failed, \
             phones {:.0}%, {:.1} MB, ~${:.2}",
            self.outcome,
            self.start_page,
            self.end_page,
            self.counters.listings_succeeded,
            self.counters.inserted,
            self.counters.updated,
            self.counters.listings_failed,
            self.phone_success_rate * 100.0,
            self.counters.bytes_received as f64 / (1024.0 * 1024.0),
            self.estimated_cost_usd,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Interrupted { resume_page: 4 }.exit_code(), 130);
        let failed = RunOutcome::Failed {
            error: "disk full".into(),
            resume_page: 4,
        };
        assert_eq!(failed.exit_code(), 1);
        assert!(failed.is_resumable());
        assert!(!RunOutcome::Completed.is_resumable());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(RunOutcome::Interrupted { resume_page: 7 }).unwrap();
        assert_eq!(json["status"], "interrupted");
        assert_eq!(json["resume_page"], 7);
    }
}
