//! Run materializer.
//!
//! Consumes lifecycle events and materializes the slice of runs this
//! worker owns. Run ids are derived deterministically from the event, so
//! every worker agrees on them without coordination, redelivery is
//! idempotent, and two workers racing over a bucket at worst both attempt
//! the same insert-if-absent.
//!
//! Ownership rules:
//! - the WorkflowRun row is created by the owner of bucket(workflow_id);
//! - each JobRun row is created by the owner of bucket(job_id), regardless
//!   of who owns the workflow's own bucket;
//! - run-scoped dependency rows follow the child run's owner.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::bucket::BucketManager;
use crate::error::Result;
use crate::event::{LifecycleEvent, LifecycleOp, TriggerSnapshot};
use crate::ident::{deterministic_id, IdGenerator};
use crate::model::{bucket_of, JobRun, RunDependency, RunStatus, WorkflowRun};
use crate::schedule::{job_trigger_time, workflow_trigger_time};
use crate::scheduler::SchedulerMessage;
use crate::store::RunStore;

pub struct RunMaterializer {
    store: Arc<dyn RunStore>,
    buckets: Arc<BucketManager>,
    scheduler_tx: mpsc::Sender<SchedulerMessage>,
    id_gen: Arc<IdGenerator>,
}

impl RunMaterializer {
    pub fn new(
        store: Arc<dyn RunStore>,
        buckets: Arc<BucketManager>,
        scheduler_tx: mpsc::Sender<SchedulerMessage>,
        id_gen: Arc<IdGenerator>,
    ) -> Self {
        Self {
            store,
            buckets,
            scheduler_tx,
            id_gen,
        }
    }

    /// Handle one broadcast event. Errors here mean the event could not be
    /// fully applied; materialization fails closed and relies on
    /// at-least-once redelivery or the bucket backlog scan to catch up.
    pub async fn handle_event(&self, event: &LifecycleEvent) -> Result<()> {
        tracing::info!(event_id = %event.event_id, "Handling lifecycle event");

        match &event.op {
            LifecycleOp::Online(snapshot) => {
                self.handle_trigger(&event.event_id, snapshot, "ONLINE").await
            }
            LifecycleOp::ManualTrigger(snapshot) => {
                self.handle_trigger(&event.event_id, snapshot, "MANUAL_TRIGGER")
                    .await
            }
            LifecycleOp::Offline { workflow_id } => self.handle_offline(*workflow_id).await,
            LifecycleOp::Kill { workflow_run_id } => self.handle_kill(*workflow_run_id).await,
            LifecycleOp::Rerun {
                workflow_run_id,
                runs,
                ..
            } => self.handle_rerun(*workflow_run_id, runs).await,
            LifecycleOp::Retry {
                job_run_id,
                bucket_id,
                ..
            } => self.handle_retry(*job_run_id, *bucket_id).await,
            LifecycleOp::RunCompleted {
                job_run_id,
                workflow_run_id,
                status,
            } => {
                self.handle_run_completed(*job_run_id, *workflow_run_id, *status)
                    .await
            }
        }
    }

    async fn handle_trigger(
        &self,
        event_id: &str,
        snapshot: &TriggerSnapshot,
        op: &str,
    ) -> Result<()> {
        let bucket_count = self.buckets.bucket_count();
        let workflow_id = snapshot.workflow_id;
        let workflow_run_id = deterministic_id(event_id, workflow_id);
        let workflow_bucket = bucket_of(workflow_id, bucket_count);
        let is_workflow_owner = self.buckets.owns(workflow_bucket).await;

        let Some(workflow) = self.store.get_workflow(workflow_id).await? else {
            tracing::warn!(workflow_id, "Workflow not found, skipping trigger");
            return Ok(());
        };

        let wf_trigger_time = workflow_trigger_time(&workflow.trigger, Utc::now())?;

        // Every worker can derive every run id, but only materializes the
        // jobs whose buckets it owns.
        let mut my_job_ids = Vec::new();
        for &job_id in &snapshot.job_ids {
            if self.buckets.owns(bucket_of(job_id, bucket_count)).await {
                my_job_ids.push(job_id);
            }
        }

        if my_job_ids.is_empty() && !is_workflow_owner {
            tracing::debug!(workflow_id, "No owned slice of this trigger, skipping");
            return Ok(());
        }

        let run_id_of = |job_id: i64| deterministic_id(event_id, job_id);

        if is_workflow_owner {
            let inserted = self
                .store
                .insert_workflow_run_if_absent(WorkflowRun {
                    id: workflow_run_id,
                    workflow_id,
                    bucket_id: workflow_bucket,
                    status: RunStatus::Waiting,
                    trigger_time: wf_trigger_time,
                    op: op.to_string(),
                })
                .await?;
            if inserted {
                tracing::info!(workflow_run_id, workflow_id, "Created workflow run");
            }
        }

        let jobs_with_dependency: std::collections::HashSet<i64> = snapshot
            .dependencies
            .iter()
            .map(|dep| dep.job_id)
            .collect();

        let mut run_dependencies = Vec::new();
        let mut registrations = Vec::new();

        for &job_id in &my_job_ids {
            let job_run_id = run_id_of(job_id);
            let Some(job) = self.store.get_job(job_id).await? else {
                tracing::warn!(job_id, "Job definition missing, skipping run");
                continue;
            };

            let trigger_time = job_trigger_time(
                job.trigger.as_ref(),
                wf_trigger_time,
                jobs_with_dependency.contains(&job_id),
            )?;

            let run = JobRun {
                id: job_run_id,
                workflow_run_id,
                workflow_id,
                job_id,
                bucket_id: bucket_of(job_id, bucket_count),
                status: RunStatus::Waiting,
                priority: if job.priority != 0 {
                    job.priority
                } else {
                    workflow.priority
                },
                retry_count: 0,
                trigger_time,
                op: op.to_string(),
            };

            let inserted = self.store.insert_job_run_if_absent(run.clone()).await?;
            if !inserted {
                // Duplicate delivery or the other owner won the insert;
                // only re-register when the stored run is still waiting.
                match self.store.get_job_run(job_run_id).await? {
                    Some(existing) if existing.status == RunStatus::Waiting => {}
                    _ => continue,
                }
            }

            let parent_run_ids: Vec<i64> = snapshot
                .dependencies
                .iter()
                .filter(|dep| dep.job_id == job_id)
                .map(|dep| run_id_of(dep.parent_job_id))
                .collect();

            for &parent_run_id in &parent_run_ids {
                run_dependencies.push(RunDependency {
                    id: self.id_gen.next_id()?,
                    workflow_run_id,
                    job_run_id,
                    parent_run_id,
                });
            }

            registrations.push(SchedulerMessage::Register {
                run,
                parent_run_ids,
                job: Some(job),
            });
        }

        if !run_dependencies.is_empty() {
            self.store.insert_run_dependencies(run_dependencies).await?;
        }

        let my_job_count = registrations.len();
        for msg in registrations {
            if self.scheduler_tx.send(msg).await.is_err() {
                tracing::warn!("Scheduler channel closed, registration dropped");
            }
        }

        tracing::info!(
            workflow_id,
            workflow_run_id,
            my_job_count,
            is_workflow_owner,
            trigger_time = %wf_trigger_time,
            "Trigger event materialized"
        );
        Ok(())
    }

    /// OFFLINE creates no rows; the scheduler drops every not-yet-fired
    /// registration of the workflow.
    async fn handle_offline(&self, workflow_id: i64) -> Result<()> {
        tracing::info!(workflow_id, "Handling workflow offline");
        if self
            .scheduler_tx
            .send(SchedulerMessage::CancelWorkflow { workflow_id })
            .await
            .is_err()
        {
            tracing::warn!("Scheduler channel closed, offline dropped");
        }
        Ok(())
    }

    /// KILL cancels only this worker's owned, still-active runs of the
    /// target workflow run.
    async fn handle_kill(&self, workflow_run_id: i64) -> Result<()> {
        let owned = self.buckets.owned_buckets().await;
        if owned.is_empty() {
            return Ok(());
        }

        let runs = self
            .store
            .select_job_runs_by_workflow_run(workflow_run_id)
            .await?;

        let mut cancelled = 0usize;
        for run in runs {
            if !owned.contains(&run.bucket_id) {
                continue;
            }
            let updated = self
                .store
                .update_job_run_status_if(
                    run.id,
                    &[RunStatus::Waiting, RunStatus::Running],
                    RunStatus::Cancelled,
                    None,
                )
                .await?;
            if updated {
                cancelled += 1;
            }
            if self
                .scheduler_tx
                .send(SchedulerMessage::Cancel { run_id: run.id })
                .await
                .is_err()
            {
                tracing::warn!("Scheduler channel closed, cancel dropped");
            }
        }

        tracing::info!(workflow_run_id, cancelled, "Handled kill event");
        Ok(())
    }

    /// RERUN resets this worker's slice of failed/cancelled/timed-out
    /// runs back to waiting and re-registers them.
    async fn handle_rerun(&self, workflow_run_id: i64, runs: &[(i64, i64)]) -> Result<()> {
        let bucket_count = self.buckets.bucket_count();
        let mut reset = 0usize;

        for &(job_run_id, job_id) in runs {
            let bucket_id = bucket_of(job_id, bucket_count);
            if !self.buckets.owns(bucket_id).await {
                continue;
            }
            if self.reset_and_register(job_run_id).await? {
                reset += 1;
            }
        }

        tracing::info!(workflow_run_id, reset, "Handled rerun event");
        Ok(())
    }

    /// RETRY resets a single owned run back to waiting.
    async fn handle_retry(&self, job_run_id: i64, bucket_id: u32) -> Result<()> {
        if !self.buckets.owns(bucket_id).await {
            return Ok(());
        }
        let reset = self.reset_and_register(job_run_id).await?;
        tracing::info!(job_run_id, reset, "Handled retry event");
        Ok(())
    }

    async fn reset_and_register(&self, job_run_id: i64) -> Result<bool> {
        let updated = self
            .store
            .update_job_run_status_if(
                job_run_id,
                &[RunStatus::Failed, RunStatus::Cancelled, RunStatus::TimedOut],
                RunStatus::Waiting,
                Some(0),
            )
            .await?;
        if !updated {
            return Ok(false);
        }

        let Some(mut run) = self.store.get_job_run(job_run_id).await? else {
            return Ok(false);
        };
        // Re-fire immediately; the original schedule already elapsed.
        run.trigger_time = Some(Utc::now());

        let parent_ids = self.store.get_parent_run_ids(job_run_id).await?;
        let mut pending = Vec::new();
        for parent_id in parent_ids {
            match self.store.get_job_run(parent_id).await? {
                Some(parent) if parent.status == RunStatus::Completed => {}
                _ => pending.push(parent_id),
            }
        }

        if self
            .scheduler_tx
            .send(SchedulerMessage::Register {
                run,
                parent_run_ids: pending,
                job: None,
            })
            .await
            .is_err()
        {
            tracing::warn!("Scheduler channel closed, rerun registration dropped");
        }
        Ok(true)
    }

    /// A run somewhere reached a terminal status: feed dependency gating,
    /// and roll the workflow run status up if this worker owns it.
    async fn handle_run_completed(
        &self,
        job_run_id: i64,
        workflow_run_id: i64,
        status: RunStatus,
    ) -> Result<()> {
        if self
            .scheduler_tx
            .send(SchedulerMessage::ParentCompleted {
                parent_run_id: job_run_id,
                status,
            })
            .await
            .is_err()
        {
            tracing::warn!("Scheduler channel closed, completion dropped");
        }

        let Some(workflow_run) = self.store.get_workflow_run(workflow_run_id).await? else {
            return Ok(());
        };
        if !self.buckets.owns(workflow_run.bucket_id).await {
            return Ok(());
        }

        let runs = self
            .store
            .select_job_runs_by_workflow_run(workflow_run_id)
            .await?;
        if runs.is_empty() {
            return Ok(());
        }

        if runs.iter().all(|run| run.status.is_terminal()) {
            let final_status = if runs
                .iter()
                .any(|run| matches!(run.status, RunStatus::Failed | RunStatus::TimedOut))
            {
                RunStatus::Failed
            } else if runs.iter().any(|run| run.status == RunStatus::Cancelled) {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            };
            let updated = self
                .store
                .update_workflow_run_status_if(
                    workflow_run_id,
                    &[RunStatus::Waiting, RunStatus::Running],
                    final_status,
                )
                .await?;
            if updated {
                tracing::info!(workflow_run_id, status = %final_status, "Workflow run finished");
            }
        } else {
            // First terminal observation: the workflow run is live.
            let _ = self
                .store
                .update_workflow_run_status_if(
                    workflow_run_id,
                    &[RunStatus::Waiting],
                    RunStatus::Running,
                )
                .await?;
        }

        Ok(())
    }
}
