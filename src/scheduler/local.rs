//! Local scheduler: one task per worker, partitioned internally by bucket.
//!
//! Scheduling is local, execution is distributed: each worker only
//! schedules runs in buckets it owns, and decisions never consult a
//! central node. State lives inside the scheduler task and is only
//! touched through its message channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Dispatcher, FireRequest};
use crate::model::{Job, JobRun, RetryPolicy, RunStatus};
use crate::scheduler::queue::TriggerQueue;
use crate::store::RunStore;

/// Messages driving the scheduler task.
#[derive(Debug)]
pub enum SchedulerMessage {
    /// Register a materialized run with its unsatisfied parent run ids.
    Register {
        run: JobRun,
        parent_run_ids: Vec<i64>,
        job: Option<Job>,
    },
    /// A parent run somewhere in the cluster reached a terminal status.
    ParentCompleted {
        parent_run_id: i64,
        status: RunStatus,
    },
    /// The dispatcher reported this locally fired run finished.
    RunFinished { run_id: i64, status: RunStatus },
    /// Cancel one registration; no-op when unknown or already terminal.
    Cancel { run_id: i64 },
    /// Drop every not-yet-fired registration of a workflow.
    CancelWorkflow { workflow_id: i64 },
    /// Ownership gained: load and register the bucket's waiting backlog.
    BucketAcquired { bucket_id: u32 },
    /// Ownership revoked: drop the bucket's registrations, no side effects.
    BucketLost { bucket_id: u32 },
}

struct RunEntry {
    run: JobRun,
    /// Parent run ids not yet observed Completed.
    parents_pending: HashSet<i64>,
    handler: String,
    retry: RetryPolicy,
}

pub struct LocalScheduler {
    store: Arc<dyn RunStore>,
    dispatcher: Arc<dyn Dispatcher>,
    job_timeout_secs: u64,

    runs: HashMap<i64, RunEntry>,
    queue: TriggerQueue,
    /// bucketId -> run ids, for fast cleanup on bucket loss.
    bucket_index: HashMap<u32, HashSet<i64>>,
    /// workflowId -> run ids, for fast cancel on workflow offline.
    workflow_index: HashMap<i64, HashSet<i64>>,
    /// parent run id -> waiting child run ids.
    downstream_index: HashMap<i64, HashSet<i64>>,
    /// Parent completions observed before the child registered, so a
    /// completion broadcast racing a registration is never lost.
    completed_parents: HashSet<i64>,
}

impl LocalScheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        dispatcher: Arc<dyn Dispatcher>,
        job_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            job_timeout_secs,
            runs: HashMap::new(),
            queue: TriggerQueue::new(),
            bucket_index: HashMap::new(),
            workflow_index: HashMap::new(),
            downstream_index: HashMap::new(),
            completed_parents: HashSet::new(),
        }
    }

    /// Scheduler loop. Fires due runs on every tick and processes
    /// registration and completion messages in arrival order.
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<SchedulerMessage>,
        tick_interval: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = messages.recv() => {
                    self.handle_message(msg).await;
                }
                _ = tick.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(registered = self.runs.len(), "Scheduler shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Register {
                run,
                parent_run_ids,
                job,
            } => self.register(run, parent_run_ids, job).await,
            SchedulerMessage::ParentCompleted {
                parent_run_id,
                status,
            } => self.on_parent_completed(parent_run_id, status).await,
            SchedulerMessage::RunFinished { run_id, status } => {
                self.on_run_finished(run_id, status);
            }
            SchedulerMessage::Cancel { run_id } => self.cancel(run_id).await,
            SchedulerMessage::CancelWorkflow { workflow_id } => {
                self.cancel_workflow(workflow_id).await;
            }
            SchedulerMessage::BucketAcquired { bucket_id } => {
                self.load_bucket(bucket_id).await;
            }
            SchedulerMessage::BucketLost { bucket_id } => self.drop_bucket(bucket_id),
        }
    }

    async fn register(&mut self, run: JobRun, parent_run_ids: Vec<i64>, job: Option<Job>) {
        if self.runs.contains_key(&run.id) {
            tracing::debug!(run_id = run.id, "Run already registered, skipping");
            return;
        }

        let (handler, retry) = match job {
            Some(job) => (job.handler, job.retry),
            None => match self.store.get_job(run.job_id).await {
                Ok(Some(job)) => (job.handler, job.retry),
                Ok(None) => {
                    tracing::warn!(run_id = run.id, job_id = run.job_id, "Job definition missing");
                    return;
                }
                Err(e) => {
                    tracing::warn!(run_id = run.id, error = %e, "Failed to load job, skipping");
                    return;
                }
            },
        };

        // Observations that arrived before this registration still count.
        let parents_pending: HashSet<i64> = parent_run_ids
            .iter()
            .copied()
            .filter(|id| !self.completed_parents.contains(id))
            .collect();

        for &parent_id in &parents_pending {
            self.downstream_index
                .entry(parent_id)
                .or_default()
                .insert(run.id);
        }
        self.bucket_index
            .entry(run.bucket_id)
            .or_default()
            .insert(run.id);
        self.workflow_index
            .entry(run.workflow_id)
            .or_default()
            .insert(run.id);

        tracing::debug!(
            run_id = run.id,
            job_id = run.job_id,
            bucket_id = run.bucket_id,
            pending_parents = parents_pending.len(),
            "Registered run"
        );

        let entry = RunEntry {
            run,
            parents_pending,
            handler,
            retry,
        };

        if entry.parents_pending.is_empty() {
            self.enqueue_ready(entry);
        } else {
            self.runs.insert(entry.run.id, entry);
        }
    }

    /// Queue a run whose dependency set is satisfied. A deferred trigger
    /// time resolves to now; an explicit future time is honored.
    fn enqueue_ready(&mut self, mut entry: RunEntry) {
        let now = Utc::now();
        let trigger_time = match entry.run.trigger_time {
            Some(t) if t > now => t,
            _ => now,
        };
        entry.run.trigger_time = Some(trigger_time);
        self.queue
            .push(entry.run.id, trigger_time, entry.run.priority);
        self.runs.insert(entry.run.id, entry);
    }

    async fn on_parent_completed(&mut self, parent_run_id: i64, status: RunStatus) {
        // Only success unblocks children; dependents of a failed or
        // cancelled parent stay blocked.
        if status != RunStatus::Completed {
            // Mark the local copy terminal if we hold the parent.
            if let Some(entry) = self.runs.get_mut(&parent_run_id) {
                entry.run.status = status;
            }
            return;
        }

        self.completed_parents.insert(parent_run_id);
        if let Some(entry) = self.runs.get_mut(&parent_run_id) {
            entry.run.status = RunStatus::Completed;
        }

        let Some(children) = self.downstream_index.remove(&parent_run_id) else {
            return;
        };

        for child_id in children {
            let Some(entry) = self.runs.get_mut(&child_id) else {
                continue;
            };
            entry.parents_pending.remove(&parent_run_id);
            if entry.parents_pending.is_empty() && entry.run.status == RunStatus::Waiting {
                tracing::debug!(run_id = child_id, "Dependencies satisfied, queueing");
                if let Some(entry) = self.runs.remove(&child_id) {
                    self.enqueue_ready(entry);
                }
            }
        }
    }

    fn on_run_finished(&mut self, run_id: i64, status: RunStatus) {
        if let Some(entry) = self.runs.get_mut(&run_id) {
            entry.run.status = status;
            if status.is_terminal() {
                self.cleanup_run(run_id);
            }
        }
    }

    async fn cancel(&mut self, run_id: i64) {
        let Some(entry) = self.runs.get(&run_id) else {
            // Cancelling an unknown or already completed run is a no-op.
            return;
        };

        match entry.run.status {
            RunStatus::Waiting => {
                let updated = self
                    .store
                    .update_job_run_status_if(
                        run_id,
                        &[RunStatus::Waiting],
                        RunStatus::Cancelled,
                        None,
                    )
                    .await
                    .unwrap_or(false);
                tracing::info!(run_id, updated, "Cancelled waiting run");
                self.cleanup_run(run_id);
            }
            RunStatus::Running => {
                // The dispatcher stops the handler; the completion report
                // finishes the bookkeeping.
                self.dispatcher.cancel(run_id).await;
            }
            _ => {}
        }
    }

    async fn cancel_workflow(&mut self, workflow_id: i64) {
        let Some(run_ids) = self.workflow_index.get(&workflow_id).cloned() else {
            tracing::debug!(workflow_id, "No local runs for offlined workflow");
            return;
        };

        let mut cancelled = 0usize;
        for run_id in run_ids {
            let Some(entry) = self.runs.get(&run_id) else {
                continue;
            };
            // Offline drops not-yet-fired registrations only; running
            // work is left to finish.
            if entry.run.status == RunStatus::Waiting {
                let _ = self
                    .store
                    .update_job_run_status_if(
                        run_id,
                        &[RunStatus::Waiting],
                        RunStatus::Cancelled,
                        None,
                    )
                    .await;
                self.cleanup_run(run_id);
                cancelled += 1;
            }
        }
        tracing::info!(workflow_id, cancelled, "Dropped registrations for offlined workflow");
    }

    /// Ownership gained: re-register the bucket's waiting backlog from the
    /// store (recovery scan).
    async fn load_bucket(&mut self, bucket_id: u32) {
        let buckets: HashSet<u32> = [bucket_id].into_iter().collect();
        let backlog = match self.store.select_waiting_job_runs_by_buckets(&buckets).await {
            Ok(runs) => runs,
            Err(e) => {
                tracing::warn!(bucket_id, error = %e, "Failed to load bucket backlog");
                return;
            }
        };

        tracing::info!(bucket_id, runs = backlog.len(), "Loading bucket backlog");
        for run in backlog {
            let parent_ids = self
                .store
                .get_parent_run_ids(run.id)
                .await
                .unwrap_or_default();

            // Parents may have completed while nobody owned this bucket.
            let mut pending = Vec::new();
            for parent_id in parent_ids {
                match self.store.get_job_run(parent_id).await {
                    Ok(Some(parent)) if parent.status == RunStatus::Completed => {}
                    _ => pending.push(parent_id),
                }
            }

            self.register(run, pending, None).await;
        }
    }

    /// Ownership revoked: drop registrations without touching the store.
    /// Whoever acquires the bucket re-registers from its backlog.
    fn drop_bucket(&mut self, bucket_id: u32) {
        let Some(run_ids) = self.bucket_index.remove(&bucket_id) else {
            return;
        };
        tracing::info!(bucket_id, runs = run_ids.len(), "Dropping registrations for lost bucket");
        for run_id in run_ids {
            if let Some(entry) = self.runs.remove(&run_id) {
                if let Some(ids) = self.workflow_index.get_mut(&entry.run.workflow_id) {
                    ids.remove(&run_id);
                }
                for parent_id in entry.parents_pending {
                    if let Some(children) = self.downstream_index.get_mut(&parent_id) {
                        children.remove(&run_id);
                    }
                }
            }
        }
    }

    fn cleanup_run(&mut self, run_id: i64) {
        if let Some(entry) = self.runs.remove(&run_id) {
            if let Some(ids) = self.bucket_index.get_mut(&entry.run.bucket_id) {
                ids.remove(&run_id);
            }
            if let Some(ids) = self.workflow_index.get_mut(&entry.run.workflow_id) {
                ids.remove(&run_id);
            }
            for parent_id in entry.parents_pending {
                if let Some(children) = self.downstream_index.get_mut(&parent_id) {
                    children.remove(&run_id);
                }
            }
        }
    }

    /// Fire every queued run whose trigger time has elapsed. The
    /// Waiting -> Running transition is guarded in the store, so during a
    /// double-ownership window exactly one worker wins the fire.
    async fn fire_due(&mut self, now: DateTime<Utc>) {
        while let Some(queued) = self.queue.pop_due(now) {
            let Some(entry) = self.runs.get(&queued.run_id) else {
                continue; // stale entry for a dropped registration
            };
            if entry.run.status != RunStatus::Waiting || !entry.parents_pending.is_empty() {
                continue;
            }

            let won = self
                .store
                .update_job_run_status_if(
                    queued.run_id,
                    &[RunStatus::Waiting],
                    RunStatus::Running,
                    None,
                )
                .await
                .unwrap_or(false);

            if !won {
                // Lost the race to another owner, or the run was cancelled
                // out from under us.
                tracing::debug!(run_id = queued.run_id, "Fire guard lost, dropping registration");
                self.cleanup_run(queued.run_id);
                continue;
            }

            let Some(entry) = self.runs.get_mut(&queued.run_id) else {
                continue;
            };
            entry.run.status = RunStatus::Running;

            tracing::info!(
                run_id = queued.run_id,
                job_id = entry.run.job_id,
                bucket_id = entry.run.bucket_id,
                "Firing run"
            );

            let request = FireRequest {
                job_run_id: entry.run.id,
                workflow_run_id: entry.run.workflow_run_id,
                job_id: entry.run.job_id,
                handler: entry.handler.clone(),
                timeout_secs: self.job_timeout_secs,
                retry: entry.retry,
            };
            self.dispatcher.fire(request).await;
        }
    }

    #[cfg(test)]
    fn registered_count(&self) -> usize {
        self.runs.len()
    }
}
