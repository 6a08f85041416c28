/// Execution Flow - one request from the queue to a terminal event
///
/// **Lifecycle:**
/// 1. Decode the request; anything else on the queue is dead-lettered
/// 2. Pre-create empty log artifacts and announce the start
/// 3. Stage the source as a single-file archive
/// 4. Create, populate and start the sandbox container
/// 5. Poll status and logs under one overall deadline, appending new output
/// 6. Kill on timeout and collect the remaining output, classify, announce
///    the outcome
/// 7. Remove the container on every path once it exists
///
/// A failure anywhere after decoding rejects the request and reports
/// `INTERNAL_ERROR`. Nothing here panics the worker loop.
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ces_common::events::INTERNAL_ERROR_EXIT_CODE;
use ces_common::types::SOURCE_FILE_NAME;
use ces_common::{
    DeliveryId, DomainError, ExecutionEvent, ExecutionId, FinishedEvent, LogsPath, QueueError,
    ReceiveQueue, ReceivedMessage, RequestedEvent, SendQueue, StartedEvent,
};
use tempfile::TempPath;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::archive::pack_single_file;
use crate::classifier::classify;
use crate::config::WorkerConfig;
use crate::demux::ContainerLogs;
use crate::engine::{ContainerEngine, ContainerStatus, EngineError, SandboxParams};
use crate::storage::{ArtifactStore, StorageError};

/// Rejected requests are dead-lettered, never redelivered
const REQUEUE_REJECTED: bool = false;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("{operation} failed with engine status {status}")]
    EngineStatus { operation: &'static str, status: u16 },
    #[error("engine created a container without an id")]
    MissingContainerId,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("scratch file error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("archive task failed: {0}")]
    Archive(#[from] tokio::task::JoinError),
}

fn ensure_success(operation: &'static str, status: u16) -> Result<(), FlowError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(FlowError::EngineStatus { operation, status })
    }
}

/// How the monitoring phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    InTime { exit_code: Option<i64> },
    TimedOut,
}

/// Scratch copies of the source; deleted when dropped
struct StagedSource {
    _source: TempPath,
    archive: TempPath,
}

pub struct ExecutionFlow {
    config: Arc<WorkerConfig>,
    engine: Arc<dyn ContainerEngine>,
    requests: Arc<dyn ReceiveQueue>,
    responses: Arc<dyn SendQueue>,
    store: Arc<dyn ArtifactStore>,
}

impl ExecutionFlow {
    pub fn new(
        config: Arc<WorkerConfig>,
        engine: Arc<dyn ContainerEngine>,
        requests: Arc<dyn ReceiveQueue>,
        responses: Arc<dyn SendQueue>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            engine,
            requests,
            responses,
            store,
        }
    }

    /// Wait for the next request.
    pub async fn receive(&self) -> Result<ReceivedMessage, QueueError> {
        self.requests.receive().await
    }

    /// Drive one delivery to a settled state. Never fails; problems are
    /// logged and turned into a rejection plus an `INTERNAL_ERROR` event.
    pub async fn handle(&self, message: ReceivedMessage) {
        let request = match ExecutionEvent::decode(&message.content) {
            Ok(ExecutionEvent::Requested(request)) => request,
            Ok(other) => {
                warn!(
                    execution_id = %other.id(),
                    kind = other.kind(),
                    "Unexpected event on request queue"
                );
                self.reject(message.delivery_id).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode request");
                self.reject(message.delivery_id).await;
                return;
            }
        };

        let id = request.id;
        match self.process(&request).await {
            Ok(()) => {
                if let Err(e) = self.requests.acknowledge(message.delivery_id).await {
                    warn!(execution_id = %id, error = %e, "Failed to acknowledge request");
                }
            }
            Err(e) => {
                error!(execution_id = %id, error = %e, "Execution failed");
                self.reject(message.delivery_id).await;
                let event = FinishedEvent::internal_error(id, Utc::now());
                if let Err(e) = self.publish(event.into()).await {
                    warn!(execution_id = %id, error = %e, "Failed to report internal error");
                }
            }
        }
    }

    async fn process(&self, request: &RequestedEvent) -> Result<(), FlowError> {
        let id = request.id;
        let logs_path = LogsPath::for_execution(id);

        self.create_empty_artifacts(id, &logs_path).await?;
        self.publish(
            StartedEvent {
                id,
                created_at: Utc::now(),
                logs_path: logs_path.clone(),
            }
            .into(),
        )
        .await?;
        info!(execution_id = %id, "Execution started");

        let staged = self.stage_source(request).await?;
        let container_id = self.create_container(id, source_file_name(request)).await?;

        let outcome = self
            .run_container(id, &container_id, staged, &logs_path)
            .await;
        self.remove_container(id, &container_id).await;
        outcome
    }

    async fn create_empty_artifacts(
        &self,
        id: ExecutionId,
        logs_path: &LogsPath,
    ) -> Result<(), FlowError> {
        let empty = self.scratch_file(id, "empty")?;
        for key in logs_path.all() {
            self.store.upload(self.bucket(), &empty, key).await?;
        }
        Ok(())
    }

    async fn stage_source(&self, request: &RequestedEvent) -> Result<StagedSource, FlowError> {
        let source = self.scratch_file(request.id, "source")?;
        self.store
            .download(self.bucket(), &request.source_code_path, &source)
            .await?;

        let archive = self.scratch_file(request.id, "archive")?;
        let (from, to) = (source.to_path_buf(), archive.to_path_buf());
        let entry_name = source_file_name(request).to_string();
        tokio::task::spawn_blocking(move || pack_single_file(&from, &entry_name, &to)).await??;

        debug!(execution_id = %request.id, "Source staged");
        Ok(StagedSource {
            _source: source,
            archive,
        })
    }

    async fn create_container(&self, id: ExecutionId, file_name: &str) -> Result<String, FlowError> {
        let runner = &self.config.runner;
        let params = SandboxParams {
            image: runner.image.clone(),
            cmd: vec![file_name.to_string()],
            working_dir: runner.work_dir.clone(),
            limits: self.config.sandbox.clone(),
        };

        let response = self.engine.create_container(&params).await?;
        ensure_success("create container", response.status)?;
        let container_id = response
            .container_id
            .ok_or(FlowError::MissingContainerId)?;

        debug!(execution_id = %id, container_id = %container_id, "Container created");
        Ok(container_id)
    }

    async fn run_container(
        &self,
        id: ExecutionId,
        container_id: &str,
        staged: StagedSource,
        logs_path: &LogsPath,
    ) -> Result<(), FlowError> {
        let response = self
            .engine
            .copy_archive(container_id, &staged.archive, &self.config.runner.work_dir)
            .await?;
        drop(staged);
        ensure_success("copy archive", response.status)?;

        let response = self.engine.start_container(container_id).await?;
        ensure_success("start container", response.status)?;
        debug!(execution_id = %id, container_id, "Container started");

        let mut cursor = None;
        let completion = self
            .monitor(id, container_id, logs_path, &mut cursor)
            .await?;
        let (finished_in_time, exit_code) = match completion {
            Completion::InTime { exit_code } => (true, exit_code),
            Completion::TimedOut => {
                warn!(execution_id = %id, container_id, "Execution timed out");
                let exit_code = self.kill_and_settle(id, container_id).await?;
                self.collect_remaining_logs(id, container_id, logs_path, cursor)
                    .await?;
                (false, exit_code)
            }
        };

        let classification = classify(finished_in_time, exit_code);
        let finished = FinishedEvent::new(
            id,
            Utc::now(),
            classification.state,
            exit_code.unwrap_or(INTERNAL_ERROR_EXIT_CODE),
            classification.failure_reason,
        )?;
        self.publish(finished.into()).await?;

        info!(
            execution_id = %id,
            state = %classification.state,
            failure_reason = %classification.failure_reason,
            exit_code = ?exit_code,
            "Execution finished"
        );
        Ok(())
    }

    /// Poll until the container is final or the deadline passes.
    ///
    /// The deadline covers engine calls and sleeps. An append that has begun
    /// always runs to completion so the three artifacts stay in step.
    async fn monitor(
        &self,
        id: ExecutionId,
        container_id: &str,
        logs_path: &LogsPath,
        cursor: &mut Option<DateTime<Utc>>,
    ) -> Result<Completion, FlowError> {
        let runner = &self.config.runner;
        let deadline = Instant::now() + runner.execution_timeout;

        loop {
            let poll = self.engine.inspect_container(container_id);
            let inspect = match timeout_at(deadline, poll).await {
                Ok(inspect) => inspect?,
                Err(_) => return Ok(Completion::TimedOut),
            };
            let status = inspect.container_status.ok_or(FlowError::EngineStatus {
                operation: "inspect container",
                status: inspect.status,
            })?;

            let fetch = self.engine.container_logs(container_id, *cursor);
            let logs = match timeout_at(deadline, fetch).await {
                Ok(logs) => logs?,
                Err(_) => return Ok(Completion::TimedOut),
            };
            if logs.is_success() {
                self.append_logs(id, logs_path, &logs.logs).await?;
                *cursor = logs.logs.last_timestamp;
            } else if status != ContainerStatus::NotFound {
                return Err(FlowError::EngineStatus {
                    operation: "container logs",
                    status: logs.status,
                });
            }

            if status.is_final() {
                return Ok(Completion::InTime {
                    exit_code: inspect.exit_code,
                });
            }
            if timeout_at(deadline, sleep(runner.logs_poll_interval))
                .await
                .is_err()
            {
                return Ok(Completion::TimedOut);
            }
        }
    }

    /// One last read after a kill for output written since the last poll.
    async fn collect_remaining_logs(
        &self,
        id: ExecutionId,
        container_id: &str,
        logs_path: &LogsPath,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<(), FlowError> {
        let logs = self.engine.container_logs(container_id, cursor).await?;
        if logs.is_success() {
            self.append_logs(id, logs_path, &logs.logs).await?;
        } else {
            warn!(
                execution_id = %id,
                container_id,
                status = logs.status,
                "Logs unavailable after kill"
            );
        }
        Ok(())
    }

    /// Kill, then wait up to the grace period for the exit code.
    async fn kill_and_settle(
        &self,
        id: ExecutionId,
        container_id: &str,
    ) -> Result<Option<i64>, FlowError> {
        let response = self.engine.kill_container(container_id).await?;
        if !response.is_success() {
            warn!(execution_id = %id, container_id, status = response.status, "Kill refused");
        }

        let runner = &self.config.runner;
        let settling = async {
            loop {
                let inspect = self.engine.inspect_container(container_id).await?;
                if inspect.container_status.is_some_and(|status| status.is_final()) {
                    return Ok::<_, FlowError>(inspect.exit_code);
                }
                sleep(runner.logs_poll_interval).await;
            }
        };

        match timeout(runner.kill_grace, settling).await {
            Ok(exit_code) => exit_code,
            Err(_) => {
                warn!(execution_id = %id, container_id, "Killed container did not settle");
                Ok(None)
            }
        }
    }

    async fn append_logs(
        &self,
        id: ExecutionId,
        logs_path: &LogsPath,
        logs: &ContainerLogs,
    ) -> Result<(), FlowError> {
        if logs.is_empty() {
            return Ok(());
        }
        let merged = logs.merged();
        let targets = [
            (&logs_path.all_path, merged.as_str()),
            (&logs_path.stdout_path, logs.stdout.as_str()),
            (&logs_path.stderr_path, logs.stderr.as_str()),
        ];
        for (key, content) in targets {
            if !content.is_empty() {
                self.append_artifact(id, key, content).await?;
            }
        }
        Ok(())
    }

    async fn append_artifact(
        &self,
        id: ExecutionId,
        key: &str,
        content: &str,
    ) -> Result<(), FlowError> {
        let local = self.scratch_file(id, "logs")?;
        self.store.download(self.bucket(), key, &local).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&local)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        self.store.upload(self.bucket(), &local, key).await?;
        Ok(())
    }

    async fn remove_container(&self, id: ExecutionId, container_id: &str) {
        match self.engine.remove_container(container_id).await {
            Ok(response) if response.is_success() => {
                debug!(execution_id = %id, container_id, "Container removed");
            }
            Ok(response) => {
                warn!(
                    execution_id = %id,
                    container_id,
                    status = response.status,
                    "Container removal refused"
                );
            }
            Err(e) => {
                warn!(execution_id = %id, container_id, error = %e, "Failed to remove container");
            }
        }
    }

    async fn publish(&self, event: ExecutionEvent) -> Result<(), FlowError> {
        let content = event.encode()?;
        self.responses.send(&content).await?;
        debug!(execution_id = %event.id(), kind = event.kind(), "Event published");
        Ok(())
    }

    async fn reject(&self, delivery_id: DeliveryId) {
        if let Err(e) = self.requests.reject(delivery_id, REQUEUE_REJECTED).await {
            warn!(%delivery_id, error = %e, "Failed to reject request");
        }
    }

    fn bucket(&self) -> &str {
        &self.config.storage.bucket
    }

    fn scratch_file(&self, id: ExecutionId, label: &str) -> Result<TempPath, FlowError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", id, label))
            .tempfile_in(&self.config.storage.scratch_dir)?;
        Ok(file.into_temp_path())
    }
}

/// Name the source is stored and run under inside the container
fn source_file_name(request: &RequestedEvent) -> &str {
    Path::new(&request.source_code_path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(SOURCE_FILE_NAME)
}
