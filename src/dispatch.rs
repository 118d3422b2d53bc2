//! Execution dispatcher collaborator.
//!
//! The scheduler hands a fire request to the dispatcher and gets a
//! completion report back on a channel. Retry policy belongs to the
//! dispatcher, not the scheduling core: a report only arrives once the
//! attempt budget is spent or the run succeeded/was cancelled.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::{RetryPolicy, RunStatus};

#[derive(Debug, Clone)]
pub struct FireRequest {
    pub job_run_id: i64,
    pub workflow_run_id: i64,
    pub job_id: i64,
    /// Executable handler reference from the job definition.
    pub handler: String,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub job_run_id: i64,
    pub workflow_run_id: i64,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Attempts consumed beyond the first.
    pub retry_count: u32,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Start executing a run. Must not block the scheduler; completion
    /// arrives asynchronously on the report channel.
    async fn fire(&self, request: FireRequest);

    /// Externally triggered stop. Cancelling an unknown or already
    /// finished run is a no-op.
    async fn cancel(&self, job_run_id: i64);
}

/// Runs job handlers as local processes via `sh -c`.
pub struct ProcessDispatcher {
    reports_tx: mpsc::Sender<CompletionReport>,
    running: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl ProcessDispatcher {
    pub fn new(reports_tx: mpsc::Sender<CompletionReport>) -> Self {
        Self {
            reports_tx,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn run_attempt(handler: &str, timeout: Duration) -> AttemptOutcome {
        let child = Command::new("sh")
            .arg("-c")
            .arg(handler)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    AttemptOutcome::Success {
                        exit_code: output.status.code(),
                    }
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                    AttemptOutcome::Failed {
                        exit_code: output.status.code(),
                        error: if stderr.is_empty() {
                            format!("exit code {:?}", output.status.code())
                        } else {
                            stderr
                        },
                    }
                }
            }
            Ok(Err(e)) => AttemptOutcome::Failed {
                exit_code: None,
                error: e.to_string(),
            },
            Err(_) => AttemptOutcome::TimedOut,
        }
    }
}

enum AttemptOutcome {
    Success { exit_code: Option<i32> },
    Failed { exit_code: Option<i32>, error: String },
    TimedOut,
}

#[async_trait]
impl Dispatcher for ProcessDispatcher {
    async fn fire(&self, request: FireRequest) {
        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(request.job_run_id, token.clone());

        let reports_tx = self.reports_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let timeout = Duration::from_secs(request.timeout_secs.max(1));
            let max_attempts = request.retry.max_attempts + 1;
            let mut report: Option<CompletionReport> = None;

            for attempt in 0..max_attempts {
                if attempt > 0 {
                    // Jitter keeps a burst of failures from retrying in
                    // lockstep.
                    let base = request.retry.backoff_ms.max(1);
                    let jitter = rand::random::<u64>() % (base / 2 + 1);
                    let backoff = Duration::from_millis(base + jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.cancelled() => {}
                    }
                }
                if token.is_cancelled() {
                    report = Some(CompletionReport {
                        job_run_id: request.job_run_id,
                        workflow_run_id: request.workflow_run_id,
                        status: RunStatus::Cancelled,
                        exit_code: None,
                        error: Some("cancelled".to_string()),
                        retry_count: attempt,
                    });
                    break;
                }

                tracing::info!(
                    job_run_id = request.job_run_id,
                    job_id = request.job_id,
                    attempt,
                    "Executing job handler"
                );

                let outcome = tokio::select! {
                    outcome = Self::run_attempt(&request.handler, timeout) => outcome,
                    _ = token.cancelled() => {
                        report = Some(CompletionReport {
                            job_run_id: request.job_run_id,
                            workflow_run_id: request.workflow_run_id,
                            status: RunStatus::Cancelled,
                            exit_code: None,
                            error: Some("cancelled".to_string()),
                            retry_count: attempt,
                        });
                        break;
                    }
                };

                match outcome {
                    AttemptOutcome::Success { exit_code } => {
                        report = Some(CompletionReport {
                            job_run_id: request.job_run_id,
                            workflow_run_id: request.workflow_run_id,
                            status: RunStatus::Completed,
                            exit_code,
                            error: None,
                            retry_count: attempt,
                        });
                        break;
                    }
                    AttemptOutcome::Failed { exit_code, error } => {
                        tracing::warn!(
                            job_run_id = request.job_run_id,
                            attempt,
                            error = %error,
                            "Job attempt failed"
                        );
                        report = Some(CompletionReport {
                            job_run_id: request.job_run_id,
                            workflow_run_id: request.workflow_run_id,
                            status: RunStatus::Failed,
                            exit_code,
                            error: Some(error),
                            retry_count: attempt,
                        });
                    }
                    AttemptOutcome::TimedOut => {
                        tracing::warn!(
                            job_run_id = request.job_run_id,
                            attempt,
                            timeout_secs = request.timeout_secs,
                            "Job attempt timed out"
                        );
                        report = Some(CompletionReport {
                            job_run_id: request.job_run_id,
                            workflow_run_id: request.workflow_run_id,
                            status: RunStatus::TimedOut,
                            exit_code: None,
                            error: Some("handler timed out".to_string()),
                            retry_count: attempt,
                        });
                    }
                }
            }

            running.lock().await.remove(&request.job_run_id);

            if let Some(report) = report {
                if reports_tx.send(report).await.is_err() {
                    tracing::warn!(
                        job_run_id = request.job_run_id,
                        "Completion channel closed, report dropped"
                    );
                }
            }
        });
    }

    async fn cancel(&self, job_run_id: i64) {
        if let Some(token) = self.running.lock().await.get(&job_run_id) {
            tracing::info!(job_run_id, "Cancelling running job");
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(handler: &str, max_attempts: u32) -> FireRequest {
        FireRequest {
            job_run_id: 101,
            workflow_run_id: 900,
            job_id: 1,
            handler: handler.to_string(),
            timeout_secs: 5,
            retry: RetryPolicy {
                max_attempts,
                backoff_ms: 10,
            },
        }
    }

    #[tokio::test]
    async fn successful_handler_reports_completed() {
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = ProcessDispatcher::new(tx);
        dispatcher.fire(request("true", 0)).await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.retry_count, 0);
    }

    #[tokio::test]
    async fn failing_handler_retries_then_reports_failed() {
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = ProcessDispatcher::new(tx);
        dispatcher.fire(request("false", 2)).await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.retry_count, 2, "two retries after the first attempt");
    }

    #[tokio::test]
    async fn cancel_stops_a_running_handler() {
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = ProcessDispatcher::new(tx);
        dispatcher.fire(request("sleep 30", 0)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        dispatcher.cancel(101).await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_unknown_run_is_a_noop() {
        let (tx, _rx) = mpsc::channel(8);
        let dispatcher = ProcessDispatcher::new(tx);
        dispatcher.cancel(999).await;
    }

    #[tokio::test]
    async fn short_timeout_reports_timed_out() {
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = ProcessDispatcher::new(tx);
        let mut req = request("sleep 30", 0);
        req.timeout_secs = 1;
        dispatcher.fire(req).await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.status, RunStatus::TimedOut);
    }
}
