/// Container Engine - Abstraction over the container daemon
///
/// **Core Responsibility:**
/// Drive a sandbox container through its lifecycle and read its output.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to talk to the daemon (socket, HTTP, wire formats)
/// - Engine does NOT decide what a non-2xx status means for an execution
/// - Every call reports the daemon's status code; the flow judges it
///
/// Transport failures (socket unreachable, malformed frames, bad JSON) are
/// errors. Daemon refusals are ordinary responses with a non-2xx status.
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::demux::{ContainerLogs, DemuxError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine transport error: {0}")]
    Transport(#[from] hyper::Error),
    #[error("invalid engine request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("invalid engine payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed log stream: {0}")]
    Demux(#[from] DemuxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Restarting,
    Running,
    Removing,
    Paused,
    Exited,
    Dead,
    NotFound,
}

impl ContainerStatus {
    /// The container will not produce further output
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::NotFound
        )
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Status-only response (ping, start, copy, kill, remove)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResponse {
    pub status: u16,
}

impl EngineResponse {
    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerResponse {
    pub status: u16,
    /// Present on success
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLogsResponse {
    pub status: u16,
    pub logs: ContainerLogs,
}

impl ContainerLogsResponse {
    pub fn is_success(&self) -> bool {
        is_success(self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectContainerResponse {
    pub status: u16,
    /// `NotFound` on 404, absent on any other failure
    pub container_status: Option<ContainerStatus>,
    /// Only reported once the container is final
    pub exit_code: Option<i64>,
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxParams {
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub limits: SandboxConfig,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<EngineResponse, EngineError>;

    async fn create_container(
        &self,
        params: &SandboxParams,
    ) -> Result<CreateContainerResponse, EngineError>;

    async fn start_container(&self, id: &str) -> Result<EngineResponse, EngineError>;

    /// Extract a tar archive into `destination` inside the container
    async fn copy_archive(
        &self,
        id: &str,
        archive: &Path,
        destination: &str,
    ) -> Result<EngineResponse, EngineError>;

    /// Log chunks strictly newer than `since`
    async fn container_logs(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ContainerLogsResponse, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<InspectContainerResponse, EngineError>;

    async fn kill_container(&self, id: &str) -> Result<EngineResponse, EngineError>;

    async fn remove_container(&self, id: &str) -> Result<EngineResponse, EngineError>;
}
