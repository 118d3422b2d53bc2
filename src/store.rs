//! Persistence collaborator.
//!
//! The core never assumes a storage engine, only these operation
//! contracts: insert-if-absent keyed by deterministic ids, conditional
//! (expected-status) updates, and bulk selects by owner bucket. Those
//! three are what make the double-ownership window safe without locks.
//!
//! `MemoryStore` is the in-process implementation used by the node when no
//! database is configured and by every integration test. Cluster
//! deployments share one logical store between workers.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::{
    BucketLease, DependencyEdge, Job, JobRun, RunDependency, RunStatus, Workflow, WorkflowRun,
    WorkflowStatus,
};

#[async_trait]
pub trait RunStore: Send + Sync {
    // ---- workflow / job definitions -------------------------------------

    /// Persist a workflow with its jobs and edges in one shot. Callers
    /// must have validated the DAG first.
    async fn put_workflow(
        &self,
        workflow: Workflow,
        jobs: Vec<Job>,
        dependencies: Vec<DependencyEdge>,
    ) -> Result<()>;

    async fn get_workflow(&self, workflow_id: i64) -> Result<Option<Workflow>>;

    async fn update_workflow_status(&self, workflow_id: i64, status: WorkflowStatus)
        -> Result<bool>;

    async fn get_jobs(&self, workflow_id: i64) -> Result<Vec<Job>>;

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>>;

    async fn get_dependencies(&self, workflow_id: i64) -> Result<Vec<DependencyEdge>>;

    // ---- run instances ---------------------------------------------------

    /// Returns false when the row already existed (duplicate delivery or
    /// the other side of a double-ownership window).
    async fn insert_workflow_run_if_absent(&self, run: WorkflowRun) -> Result<bool>;

    async fn insert_job_run_if_absent(&self, run: JobRun) -> Result<bool>;

    async fn insert_run_dependencies(&self, deps: Vec<RunDependency>) -> Result<()>;

    async fn get_workflow_run(&self, run_id: i64) -> Result<Option<WorkflowRun>>;

    async fn get_job_run(&self, run_id: i64) -> Result<Option<JobRun>>;

    /// Conditional update: only applies when the current status is in
    /// `expected`. `retry_count` overwrites the counter when present.
    async fn update_job_run_status_if(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        status: RunStatus,
        retry_count: Option<u32>,
    ) -> Result<bool>;

    async fn update_workflow_run_status_if(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        status: RunStatus,
    ) -> Result<bool>;

    async fn select_job_runs_by_workflow_run(&self, workflow_run_id: i64) -> Result<Vec<JobRun>>;

    /// Waiting runs in the given buckets, used when a bucket is acquired
    /// and its backlog must be re-registered.
    async fn select_waiting_job_runs_by_buckets(
        &self,
        buckets: &HashSet<u32>,
    ) -> Result<Vec<JobRun>>;

    /// Parent JobRun ids of one run, from the run-scoped dependency table.
    async fn get_parent_run_ids(&self, job_run_id: i64) -> Result<Vec<i64>>;

    // ---- bucket leases ---------------------------------------------------

    /// Mirror of the in-memory lease table, used only for restart
    /// affinity, never for correctness.
    async fn upsert_lease(&self, lease: BucketLease) -> Result<()>;

    async fn delete_lease(&self, bucket_id: u32) -> Result<()>;

    async fn delete_leases_by_owner(&self, owner: &str) -> Result<()>;

    async fn select_buckets_by_owner(&self, owner: &str) -> Result<Vec<u32>>;

    async fn select_all_leases(&self) -> Result<Vec<BucketLease>>;
}

#[derive(Default)]
struct MemoryInner {
    workflows: HashMap<i64, Workflow>,
    jobs: HashMap<i64, Job>,
    dependencies: HashMap<i64, Vec<DependencyEdge>>,
    workflow_runs: HashMap<i64, WorkflowRun>,
    job_runs: HashMap<i64, JobRun>,
    run_dependencies: Vec<RunDependency>,
    leases: HashMap<u32, BucketLease>,
}

/// In-memory `RunStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of materialized rows, used by idempotence tests.
    pub async fn run_row_count(&self) -> (usize, usize, usize) {
        let inner = self.inner.read().await;
        (
            inner.workflow_runs.len(),
            inner.job_runs.len(),
            inner.run_dependencies.len(),
        )
    }

    /// Number of workflow definitions, used by validation-then-persist
    /// tests.
    pub async fn workflow_count(&self) -> usize {
        self.inner.read().await.workflows.len()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn put_workflow(
        &self,
        workflow: Workflow,
        jobs: Vec<Job>,
        dependencies: Vec<DependencyEdge>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.dependencies.insert(workflow.id, dependencies);
        for job in jobs {
            inner.jobs.insert(job.id, job);
        }
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: i64) -> Result<Option<Workflow>> {
        Ok(self.inner.read().await.workflows.get(&workflow_id).cloned())
    }

    async fn update_workflow_status(
        &self,
        workflow_id: i64,
        status: WorkflowStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.workflows.get_mut(&workflow_id) {
            Some(workflow) => {
                workflow.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_jobs(&self, workflow_id: i64) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.workflow_id == workflow_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&job_id).cloned())
    }

    async fn get_dependencies(&self, workflow_id: i64) -> Result<Vec<DependencyEdge>> {
        Ok(self
            .inner
            .read()
            .await
            .dependencies
            .get(&workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_workflow_run_if_absent(&self, run: WorkflowRun) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.workflow_runs.contains_key(&run.id) {
            return Ok(false);
        }
        inner.workflow_runs.insert(run.id, run);
        Ok(true)
    }

    async fn insert_job_run_if_absent(&self, run: JobRun) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.job_runs.contains_key(&run.id) {
            return Ok(false);
        }
        inner.job_runs.insert(run.id, run);
        Ok(true)
    }

    async fn insert_run_dependencies(&self, deps: Vec<RunDependency>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for dep in deps {
            let exists = inner
                .run_dependencies
                .iter()
                .any(|d| d.job_run_id == dep.job_run_id && d.parent_run_id == dep.parent_run_id);
            if !exists {
                inner.run_dependencies.push(dep);
            }
        }
        Ok(())
    }

    async fn get_workflow_run(&self, run_id: i64) -> Result<Option<WorkflowRun>> {
        Ok(self.inner.read().await.workflow_runs.get(&run_id).cloned())
    }

    async fn get_job_run(&self, run_id: i64) -> Result<Option<JobRun>> {
        Ok(self.inner.read().await.job_runs.get(&run_id).cloned())
    }

    async fn update_job_run_status_if(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        status: RunStatus,
        retry_count: Option<u32>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.job_runs.get_mut(&run_id) {
            Some(run) if expected.contains(&run.status) => {
                run.status = status;
                if let Some(count) = retry_count {
                    run.retry_count = count;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_workflow_run_status_if(
        &self,
        run_id: i64,
        expected: &[RunStatus],
        status: RunStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.workflow_runs.get_mut(&run_id) {
            Some(run) if expected.contains(&run.status) => {
                run.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn select_job_runs_by_workflow_run(&self, workflow_run_id: i64) -> Result<Vec<JobRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<JobRun> = inner
            .job_runs
            .values()
            .filter(|r| r.workflow_run_id == workflow_run_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn select_waiting_job_runs_by_buckets(
        &self,
        buckets: &HashSet<u32>,
    ) -> Result<Vec<JobRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<JobRun> = inner
            .job_runs
            .values()
            .filter(|r| r.status == RunStatus::Waiting && buckets.contains(&r.bucket_id))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }

    async fn get_parent_run_ids(&self, job_run_id: i64) -> Result<Vec<i64>> {
        let inner = self.inner.read().await;
        Ok(inner
            .run_dependencies
            .iter()
            .filter(|d| d.job_run_id == job_run_id)
            .map(|d| d.parent_run_id)
            .collect())
    }

    async fn upsert_lease(&self, lease: BucketLease) -> Result<()> {
        self.inner.write().await.leases.insert(lease.bucket_id, lease);
        Ok(())
    }

    async fn delete_lease(&self, bucket_id: u32) -> Result<()> {
        self.inner.write().await.leases.remove(&bucket_id);
        Ok(())
    }

    async fn delete_leases_by_owner(&self, owner: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .leases
            .retain(|_, lease| lease.owner != owner);
        Ok(())
    }

    async fn select_buckets_by_owner(&self, owner: &str) -> Result<Vec<u32>> {
        let inner = self.inner.read().await;
        let mut buckets: Vec<u32> = inner
            .leases
            .values()
            .filter(|lease| lease.owner == owner)
            .map(|lease| lease.bucket_id)
            .collect();
        buckets.sort_unstable();
        Ok(buckets)
    }

    async fn select_all_leases(&self) -> Result<Vec<BucketLease>> {
        Ok(self.inner.read().await.leases.values().cloned().collect())
    }
}
