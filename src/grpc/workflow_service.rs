use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::dag;
use crate::event::{LifecycleEvent, TriggerSnapshot};
use crate::ident::IdGenerator;
use crate::model::{DependencyEdge, Job, RetryPolicy, TriggerSpec, Workflow, WorkflowStatus};
use crate::proto;
use crate::proto::workflow_service_server::WorkflowService;
use crate::schedule::validate_cron;
use crate::store::RunStore;
use crate::transport::EventPublisher;

/// Admin surface. Thin wrapper: validates, persists, publishes lifecycle
/// events; all scheduling decisions happen in the workers' cores.
pub struct WorkflowServiceImpl {
    store: Arc<dyn RunStore>,
    publisher: Arc<dyn EventPublisher>,
    id_gen: Arc<IdGenerator>,
}

impl WorkflowServiceImpl {
    pub fn new(
        store: Arc<dyn RunStore>,
        publisher: Arc<dyn EventPublisher>,
        id_gen: Arc<IdGenerator>,
    ) -> Self {
        Self {
            store,
            publisher,
            id_gen,
        }
    }

    fn parse_trigger(trigger_type: &str, trigger_value: &str) -> Result<TriggerSpec, Status> {
        let spec = TriggerSpec::parse(trigger_type, trigger_value)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        if let TriggerSpec::Cron(expr) = &spec {
            validate_cron(expr).map_err(|e| Status::invalid_argument(e.to_string()))?;
        }
        Ok(spec)
    }

    async fn snapshot_of(&self, workflow_id: i64) -> Result<TriggerSnapshot, Status> {
        let jobs = self
            .store
            .get_jobs(workflow_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        let dependencies = self
            .store
            .get_dependencies(workflow_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(TriggerSnapshot {
            workflow_id,
            job_ids: jobs.iter().map(|job| job.id).collect(),
            dependencies,
        })
    }

    async fn publish(&self, event: LifecycleEvent) -> Result<proto::ActionResponse, Status> {
        let event_id = event.event_id.clone();
        self.publisher
            .publish(event)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(proto::ActionResponse {
            success: true,
            error: String::new(),
            event_id,
        })
    }
}

#[tonic::async_trait]
impl WorkflowService for WorkflowServiceImpl {
    async fn create_workflow(
        &self,
        request: Request<proto::CreateWorkflowRequest>,
    ) -> Result<Response<proto::CreateWorkflowResponse>, Status> {
        let req = request.into_inner();
        let spec = req
            .workflow
            .ok_or_else(|| Status::invalid_argument("workflow spec missing"))?;

        let trigger = Self::parse_trigger(&spec.trigger_type, &spec.trigger_value)?;

        let workflow_id = self
            .id_gen
            .next_id()
            .map_err(|e| Status::internal(e.to_string()))?;

        let mut jobs = Vec::with_capacity(req.jobs.len());
        let mut job_ids = Vec::with_capacity(req.jobs.len());
        for job_spec in &req.jobs {
            let job_id = self
                .id_gen
                .next_id()
                .map_err(|e| Status::internal(e.to_string()))?;
            let job_trigger = if job_spec.trigger_type.is_empty() {
                None
            } else {
                Some(Self::parse_trigger(
                    &job_spec.trigger_type,
                    &job_spec.trigger_value,
                )?)
            };
            jobs.push(Job {
                id: job_id,
                workflow_id,
                name: job_spec.name.clone(),
                handler: job_spec.handler.clone(),
                trigger: job_trigger,
                priority: job_spec.priority,
                retry: RetryPolicy {
                    max_attempts: job_spec.max_attempts,
                    backoff_ms: job_spec.backoff_ms,
                },
            });
            job_ids.push(job_id);
        }

        // Request edges reference jobs by index; translate to ids.
        let mut dependencies = Vec::with_capacity(req.dependencies.len());
        for edge in &req.dependencies {
            let job_id = job_ids
                .get(edge.job_id as usize)
                .copied()
                .ok_or_else(|| Status::invalid_argument("edge job index out of range"))?;
            let parent_job_id = job_ids
                .get(edge.parent_job_id as usize)
                .copied()
                .ok_or_else(|| Status::invalid_argument("edge parent index out of range"))?;
            dependencies.push(DependencyEdge {
                job_id,
                parent_job_id,
            });
        }

        // Validation-then-persist: nothing is written when the DAG is
        // rejected.
        if let Err(e) = dag::validate(&job_ids, &dependencies) {
            return Ok(Response::new(proto::CreateWorkflowResponse {
                success: false,
                error: e.to_string(),
                workflow_id: 0,
                job_ids: Vec::new(),
            }));
        }

        let workflow = Workflow {
            id: workflow_id,
            name: spec.name,
            trigger,
            status: WorkflowStatus::Draft,
            priority: spec.priority,
        };
        self.store
            .put_workflow(workflow, jobs, dependencies)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        tracing::info!(workflow_id, jobs = job_ids.len(), "Workflow created");
        Ok(Response::new(proto::CreateWorkflowResponse {
            success: true,
            error: String::new(),
            workflow_id,
            job_ids,
        }))
    }

    async fn online_workflow(
        &self,
        request: Request<proto::WorkflowActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let workflow_id = request.into_inner().workflow_id;
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| Status::not_found(format!("workflow {workflow_id}")))?;

        let snapshot = self.snapshot_of(workflow_id).await?;
        // Edges may have changed since creation; reject cycles before any
        // status flip or broadcast.
        dag::validate(&snapshot.job_ids, &snapshot.dependencies)
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        if workflow.status != WorkflowStatus::Online {
            self.store
                .update_workflow_status(workflow_id, WorkflowStatus::Online)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
        }

        let response = self.publish(LifecycleEvent::online(snapshot)).await?;
        Ok(Response::new(response))
    }

    async fn offline_workflow(
        &self,
        request: Request<proto::WorkflowActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let workflow_id = request.into_inner().workflow_id;
        let exists = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .is_some();
        if !exists {
            return Err(Status::not_found(format!("workflow {workflow_id}")));
        }

        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Offline)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let response = self.publish(LifecycleEvent::offline(workflow_id)).await?;
        Ok(Response::new(response))
    }

    async fn trigger_workflow(
        &self,
        request: Request<proto::WorkflowActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let workflow_id = request.into_inner().workflow_id;
        let exists = self
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .is_some();
        if !exists {
            return Err(Status::not_found(format!("workflow {workflow_id}")));
        }

        let snapshot = self.snapshot_of(workflow_id).await?;
        dag::validate(&snapshot.job_ids, &snapshot.dependencies)
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        let response = self
            .publish(LifecycleEvent::manual_trigger(snapshot))
            .await?;
        Ok(Response::new(response))
    }

    async fn kill_run(
        &self,
        request: Request<proto::RunActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let workflow_run_id = request.into_inner().workflow_run_id;
        let exists = self
            .store
            .get_workflow_run(workflow_run_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .is_some();
        if !exists {
            return Err(Status::not_found(format!("workflow run {workflow_run_id}")));
        }

        let response = self.publish(LifecycleEvent::kill(workflow_run_id)).await?;
        Ok(Response::new(response))
    }

    async fn rerun_run(
        &self,
        request: Request<proto::RunActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let workflow_run_id = request.into_inner().workflow_run_id;
        let workflow_run = self
            .store
            .get_workflow_run(workflow_run_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| Status::not_found(format!("workflow run {workflow_run_id}")))?;

        let job_runs = self
            .store
            .select_job_runs_by_workflow_run(workflow_run_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let runs: Vec<(i64, i64)> = job_runs
            .iter()
            .filter(|run| run.status.is_rerunnable())
            .map(|run| (run.id, run.job_id))
            .collect();
        if runs.is_empty() {
            return Err(Status::failed_precondition(
                "workflow run has no failed, cancelled or timed-out job runs",
            ));
        }

        let event = LifecycleEvent::new(crate::event::LifecycleOp::Rerun {
            workflow_id: workflow_run.workflow_id,
            workflow_run_id,
            runs,
        });
        let response = self.publish(event).await?;
        Ok(Response::new(response))
    }

    async fn retry_job_run(
        &self,
        request: Request<proto::JobRunActionRequest>,
    ) -> Result<Response<proto::ActionResponse>, Status> {
        let job_run_id = request.into_inner().job_run_id;
        let job_run = self
            .store
            .get_job_run(job_run_id)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .ok_or_else(|| Status::not_found(format!("job run {job_run_id}")))?;

        if !job_run.status.is_rerunnable() {
            return Err(Status::failed_precondition(format!(
                "job run {job_run_id} is {}, not retryable",
                job_run.status
            )));
        }

        let event = LifecycleEvent::new(crate::event::LifecycleOp::Retry {
            job_run_id,
            job_id: job_run.job_id,
            bucket_id: job_run.bucket_id,
        });
        let response = self.publish(event).await?;
        Ok(Response::new(response))
    }
}
