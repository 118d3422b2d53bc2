//! Domain rows shared by the materializer, scheduler and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowmeshError, Result};

/// Bucket owning an entity. Pure function of the id so every worker agrees
/// without coordination.
pub fn bucket_of(entity_id: i64, bucket_count: u32) -> u32 {
    (entity_id.rem_euclid(bucket_count as i64)) as u32
}

/// How a workflow (or a job overriding its workflow) is triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSpec {
    /// Standard 5-field Unix cron expression.
    Cron(String),
    /// Fire every N seconds.
    FixedInterval(u64),
    /// Only fired explicitly by an operator.
    Manual,
    /// Fired by an external API caller.
    Api,
}

impl TriggerSpec {
    /// Parse the (type, value) string pair used on the wire and in the
    /// admin CLI.
    pub fn parse(trigger_type: &str, trigger_value: &str) -> Result<Self> {
        match trigger_type {
            "cron" => Ok(TriggerSpec::Cron(trigger_value.to_string())),
            "interval" => {
                let secs: u64 = trigger_value.parse().map_err(|_| {
                    FlowmeshError::InvalidTrigger(format!(
                        "interval value must be seconds, got '{trigger_value}'"
                    ))
                })?;
                Ok(TriggerSpec::FixedInterval(secs))
            }
            "manual" => Ok(TriggerSpec::Manual),
            "api" => Ok(TriggerSpec::Api),
            other => Err(FlowmeshError::InvalidTrigger(format!(
                "unknown trigger type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Draft,
    Online,
    Offline,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "draft"),
            WorkflowStatus::Online => write!(f, "online"),
            WorkflowStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A named DAG of jobs. Mutated only by admin operations, never by
/// workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub trigger: TriggerSpec,
    pub status: WorkflowStatus,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff_ms: 1_000,
        }
    }
}

/// One DAG node. Immutable for the lifetime of any run referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    /// Executable handler reference, run by the dispatcher.
    pub handler: String,
    /// Overrides the workflow trigger when present.
    pub trigger: Option<TriggerSpec>,
    pub priority: i32,
    pub retry: RetryPolicy,
}

/// Design-time dependency: `job_id` depends on `parent_job_id`. Scoped to
/// one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub job_id: i64,
    pub parent_job_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    /// Terminal statuses never transition again except through RERUN/RETRY.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }

    /// Statuses eligible for RERUN reset.
    pub fn is_rerunnable(self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Waiting => write!(f, "waiting"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = FlowmeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(RunStatus::Waiting),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "timed_out" => Ok(RunStatus::TimedOut),
            other => Err(FlowmeshError::Internal(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Per-trigger materialization of a workflow. The id is derived from the
/// broadcast event, so every worker agrees on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub workflow_id: i64,
    pub bucket_id: u32,
    pub status: RunStatus,
    pub trigger_time: DateTime<Utc>,
    /// Operation that created this run (online or manual trigger).
    pub op: String,
}

/// Per-trigger materialization of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub workflow_run_id: i64,
    pub workflow_id: i64,
    pub job_id: i64,
    pub bucket_id: u32,
    pub status: RunStatus,
    pub priority: i32,
    pub retry_count: u32,
    /// None while the run is deferred behind unfinished parents; the real
    /// trigger time is computed when the last parent completes.
    pub trigger_time: Option<DateTime<Utc>>,
    pub op: String,
}

/// Run-scoped dependency: parent references are JobRun ids, not Job ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunDependency {
    pub id: i64,
    pub workflow_run_id: i64,
    pub job_run_id: i64,
    pub parent_run_id: i64,
}

/// A time-bounded claim by one worker over one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketLease {
    pub bucket_id: u32,
    pub owner: String,
    pub leased_at: DateTime<Utc>,
}

impl BucketLease {
    pub fn new(bucket_id: u32, owner: String) -> Self {
        Self {
            bucket_id,
            owner,
            leased_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, addr: &str) -> bool {
        self.owner == addr
    }

    pub fn is_expired(&self, abandon_threshold_ms: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.leased_at);
        age.num_milliseconds() >= abandon_threshold_ms as i64
    }

    pub fn renewed(&self) -> Self {
        Self {
            bucket_id: self.bucket_id,
            owner: self.owner.clone(),
            leased_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_of_is_stable_and_in_range() {
        assert_eq!(bucket_of(0, 1024), 0);
        assert_eq!(bucket_of(1024, 1024), 0);
        assert_eq!(bucket_of(1025, 1024), 1);
        for id in [i64::MAX, i64::MIN, -1, 7_777_777] {
            assert!(bucket_of(id, 1024) < 1024);
        }
    }

    #[test]
    fn trigger_spec_parse_round_trip() {
        assert_eq!(
            TriggerSpec::parse("cron", "0 2 * * *").unwrap(),
            TriggerSpec::Cron("0 2 * * *".to_string())
        );
        assert_eq!(
            TriggerSpec::parse("interval", "300").unwrap(),
            TriggerSpec::FixedInterval(300)
        );
        assert_eq!(TriggerSpec::parse("manual", "").unwrap(), TriggerSpec::Manual);
        assert!(TriggerSpec::parse("interval", "soon").is_err());
        assert!(TriggerSpec::parse("hourly", "").is_err());
    }

    #[test]
    fn run_status_terminal_and_rerunnable() {
        assert!(!RunStatus::Waiting.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_rerunnable());
        assert!(RunStatus::TimedOut.is_rerunnable());
        assert!(!RunStatus::Completed.is_rerunnable());
    }

    #[test]
    fn run_status_display_parse_round_trip() {
        for status in [
            RunStatus::Waiting,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::TimedOut,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn lease_expiry_uses_threshold() {
        let mut lease = BucketLease::new(3, "10.0.0.1:7450".to_string());
        assert!(!lease.is_expired(30_000));
        lease.leased_at = Utc::now() - chrono::Duration::seconds(60);
        assert!(lease.is_expired(30_000));
        assert!(!lease.renewed().is_expired(30_000));
    }
}
