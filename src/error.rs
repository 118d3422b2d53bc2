use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowmeshError {
    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Edge references unknown job: {0}")]
    MissingNode(i64),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(i64),

    #[error("Workflow run not found: {0}")]
    WorkflowRunNotFound(i64),

    #[error("Job run not found: {0}")]
    JobRunNotFound(i64),

    #[error("Invalid trigger spec: {0}")]
    InvalidTrigger(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FlowmeshError>;
