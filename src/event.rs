//! Lifecycle events broadcast to every worker.
//!
//! An event is immutable once published and carries a full snapshot of the
//! workflow structure as of broadcast time, never a live reference. Every
//! worker consumes every event independently; the deterministic run ids
//! make duplicate delivery harmless.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlowmeshError, Result};
use crate::model::{DependencyEdge, RunStatus};
use crate::proto;

/// Structure snapshot shipped with ONLINE and MANUAL_TRIGGER events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub workflow_id: i64,
    pub job_ids: Vec<i64>,
    pub dependencies: Vec<DependencyEdge>,
}

/// Operation carried by a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleOp {
    /// Workflow went online; materialize a run per its trigger spec.
    Online(TriggerSnapshot),
    /// Operator fired the workflow once, immediately.
    ManualTrigger(TriggerSnapshot),
    /// Workflow taken offline; drop not-yet-fired registrations.
    Offline { workflow_id: i64 },
    /// Cancel one workflow run's still-active job runs.
    Kill { workflow_run_id: i64 },
    /// Reset failed/cancelled/timed-out job runs of one workflow run back
    /// to waiting.
    Rerun {
        workflow_id: i64,
        workflow_run_id: i64,
        /// (job_run_id, job_id) pairs; each worker resets the slice whose
        /// buckets it owns.
        runs: Vec<(i64, i64)>,
    },
    /// Reset one job run back to waiting.
    Retry {
        job_run_id: i64,
        job_id: i64,
        bucket_id: u32,
    },
    /// A job run reached a terminal status; dependents on other workers
    /// observe parent completion through this.
    RunCompleted {
        job_run_id: i64,
        workflow_run_id: i64,
        status: RunStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Globally unique; run ids are derived from it.
    pub event_id: String,
    pub timestamp_ms: i64,
    pub op: LifecycleOp,
}

impl LifecycleEvent {
    pub fn new(op: LifecycleOp) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            op,
        }
    }

    pub fn online(snapshot: TriggerSnapshot) -> Self {
        Self::new(LifecycleOp::Online(snapshot))
    }

    pub fn manual_trigger(snapshot: TriggerSnapshot) -> Self {
        Self::new(LifecycleOp::ManualTrigger(snapshot))
    }

    pub fn offline(workflow_id: i64) -> Self {
        Self::new(LifecycleOp::Offline { workflow_id })
    }

    pub fn kill(workflow_run_id: i64) -> Self {
        Self::new(LifecycleOp::Kill { workflow_run_id })
    }

    pub fn run_completed(job_run_id: i64, workflow_run_id: i64, status: RunStatus) -> Self {
        Self::new(LifecycleOp::RunCompleted {
            job_run_id,
            workflow_run_id,
            status,
        })
    }
}

// ============================================================================
// Proto conversions
// ============================================================================

fn snapshot_to_proto(s: &TriggerSnapshot) -> proto::TriggerSnapshotProto {
    proto::TriggerSnapshotProto {
        workflow_id: s.workflow_id,
        job_ids: s.job_ids.clone(),
        dependencies: s
            .dependencies
            .iter()
            .map(|d| proto::DependencyEdgeProto {
                job_id: d.job_id,
                parent_job_id: d.parent_job_id,
            })
            .collect(),
    }
}

fn snapshot_from_proto(p: proto::TriggerSnapshotProto) -> TriggerSnapshot {
    TriggerSnapshot {
        workflow_id: p.workflow_id,
        job_ids: p.job_ids,
        dependencies: p
            .dependencies
            .into_iter()
            .map(|d| DependencyEdge {
                job_id: d.job_id,
                parent_job_id: d.parent_job_id,
            })
            .collect(),
    }
}

pub fn event_to_proto(event: &LifecycleEvent) -> proto::LifecycleEventProto {
    use proto::lifecycle_event_proto::Op;

    let op = match &event.op {
        LifecycleOp::Online(s) => Op::Online(snapshot_to_proto(s)),
        LifecycleOp::ManualTrigger(s) => Op::ManualTrigger(snapshot_to_proto(s)),
        LifecycleOp::Offline { workflow_id } => Op::Offline(proto::OfflineOpProto {
            workflow_id: *workflow_id,
        }),
        LifecycleOp::Kill { workflow_run_id } => Op::Kill(proto::KillOpProto {
            workflow_run_id: *workflow_run_id,
        }),
        LifecycleOp::Rerun {
            workflow_id,
            workflow_run_id,
            runs,
        } => Op::Rerun(proto::RerunOpProto {
            workflow_id: *workflow_id,
            workflow_run_id: *workflow_run_id,
            runs: runs
                .iter()
                .map(|(job_run_id, job_id)| proto::RerunRunProto {
                    job_run_id: *job_run_id,
                    job_id: *job_id,
                })
                .collect(),
        }),
        LifecycleOp::Retry {
            job_run_id,
            job_id,
            bucket_id,
        } => Op::Retry(proto::RetryOpProto {
            job_run_id: *job_run_id,
            job_id: *job_id,
            bucket_id: *bucket_id,
        }),
        LifecycleOp::RunCompleted {
            job_run_id,
            workflow_run_id,
            status,
        } => Op::RunCompleted(proto::RunCompletedOpProto {
            job_run_id: *job_run_id,
            workflow_run_id: *workflow_run_id,
            status: status.to_string(),
        }),
    };

    proto::LifecycleEventProto {
        event_id: event.event_id.clone(),
        timestamp_ms: event.timestamp_ms,
        op: Some(op),
    }
}

pub fn event_from_proto(p: proto::LifecycleEventProto) -> Result<LifecycleEvent> {
    use proto::lifecycle_event_proto::Op;

    let op = match p.op {
        Some(Op::Online(s)) => LifecycleOp::Online(snapshot_from_proto(s)),
        Some(Op::ManualTrigger(s)) => LifecycleOp::ManualTrigger(snapshot_from_proto(s)),
        Some(Op::Offline(o)) => LifecycleOp::Offline {
            workflow_id: o.workflow_id,
        },
        Some(Op::Kill(k)) => LifecycleOp::Kill {
            workflow_run_id: k.workflow_run_id,
        },
        Some(Op::Rerun(r)) => LifecycleOp::Rerun {
            workflow_id: r.workflow_id,
            workflow_run_id: r.workflow_run_id,
            runs: r
                .runs
                .into_iter()
                .map(|run| (run.job_run_id, run.job_id))
                .collect(),
        },
        Some(Op::Retry(r)) => LifecycleOp::Retry {
            job_run_id: r.job_run_id,
            job_id: r.job_id,
            bucket_id: r.bucket_id,
        },
        Some(Op::RunCompleted(c)) => LifecycleOp::RunCompleted {
            job_run_id: c.job_run_id,
            workflow_run_id: c.workflow_run_id,
            status: c.status.parse()?,
        },
        None => {
            return Err(FlowmeshError::Internal(
                "lifecycle event missing op".to_string(),
            ))
        }
    };

    Ok(LifecycleEvent {
        event_id: p.event_id,
        timestamp_ms: p.timestamp_ms,
        op,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> TriggerSnapshot {
        TriggerSnapshot {
            workflow_id: 11,
            job_ids: vec![1, 2, 3],
            dependencies: vec![
                DependencyEdge {
                    job_id: 3,
                    parent_job_id: 1,
                },
                DependencyEdge {
                    job_id: 3,
                    parent_job_id: 2,
                },
            ],
        }
    }

    #[test]
    fn event_ids_are_unique() {
        let a = LifecycleEvent::offline(1);
        let b = LifecycleEvent::offline(1);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn proto_round_trip_preserves_trigger_snapshot() {
        let event = LifecycleEvent::manual_trigger(sample_snapshot());
        let restored = event_from_proto(event_to_proto(&event)).unwrap();
        assert_eq!(restored, event);
    }

    #[test]
    fn proto_round_trip_preserves_run_ops() {
        let kill = LifecycleEvent::kill(987);
        assert_eq!(event_from_proto(event_to_proto(&kill)).unwrap(), kill);

        let rerun = LifecycleEvent::new(LifecycleOp::Rerun {
            workflow_id: 11,
            workflow_run_id: 987,
            runs: vec![(101, 1), (102, 2)],
        });
        assert_eq!(event_from_proto(event_to_proto(&rerun)).unwrap(), rerun);

        let completed = LifecycleEvent::run_completed(101, 987, RunStatus::Completed);
        assert_eq!(
            event_from_proto(event_to_proto(&completed)).unwrap(),
            completed
        );
    }

    #[test]
    fn proto_without_op_is_rejected() {
        let p = proto::LifecycleEventProto {
            event_id: "evt".to_string(),
            timestamp_ms: 0,
            op: None,
        };
        assert!(event_from_proto(p).is_err());
    }
}
