/// Docker Engine client over the local unix socket
///
/// Log reads take the raw multiplexed stream with timestamps and cut it by
/// `since`; request and response bodies use the bollard models.
///
/// One connection per call.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerStateStatusEnum, HostConfig,
    HostConfigCgroupnsModeEnum, ResourcesUlimits,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::debug;

use crate::demux::{demultiplex, ContainerLogs};
use crate::engine::{
    ContainerEngine, ContainerLogsResponse, ContainerStatus, CreateContainerResponse,
    EngineError, EngineResponse, InspectContainerResponse, SandboxParams,
};

const API_VERSION: &str = "v1.41";
const NO_NEW_PRIVILEGES: &str = "no-new-privileges";
const TAR_CONTENT_TYPE: &str = "application/x-tar";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<(&'static str, Bytes)>,
    ) -> Result<(u16, Bytes), EngineError> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(format!("/{}{}", API_VERSION, path))
            .header(HOST, "docker");
        let body = match body {
            Some((content_type, body)) => {
                builder = builder.header(CONTENT_TYPE, content_type);
                body
            }
            None => Bytes::new(),
        };
        let request = builder.body(Full::new(body))?;

        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Engine connection closed with error");
            }
        });

        let response = sender.send_request(request).await?;
        let status = response.status().as_u16();
        let body = response.into_body().collect().await?.to_bytes();

        debug!(%method, path, status, "Engine call");
        Ok((status, body))
    }

    async fn status_only(&self, method: Method, path: &str) -> Result<EngineResponse, EngineError> {
        let (status, _) = self.call(method, path, None).await?;
        Ok(EngineResponse { status })
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn ping(&self) -> Result<EngineResponse, EngineError> {
        self.status_only(Method::GET, "/_ping").await
    }

    async fn create_container(
        &self,
        params: &SandboxParams,
    ) -> Result<CreateContainerResponse, EngineError> {
        let body = serde_json::to_vec(&container_config(params))?;
        let (status, body) = self
            .call(
                Method::POST,
                "/containers/create",
                Some((JSON_CONTENT_TYPE, Bytes::from(body))),
            )
            .await?;

        let container_id = if (200..300).contains(&status) {
            let created: ContainerCreateResponse = serde_json::from_slice(&body)?;
            Some(created.id)
        } else {
            None
        };
        Ok(CreateContainerResponse {
            status,
            container_id,
        })
    }

    async fn start_container(&self, id: &str) -> Result<EngineResponse, EngineError> {
        self.status_only(Method::POST, &format!("/containers/{}/start", id))
            .await
    }

    async fn copy_archive(
        &self,
        id: &str,
        archive: &Path,
        destination: &str,
    ) -> Result<EngineResponse, EngineError> {
        let tar = tokio::fs::read(archive).await?;
        let path = format!(
            "/containers/{}/archive?path={}",
            id,
            urlencoding::encode(destination)
        );
        let (status, _) = self
            .call(
                Method::PUT,
                &path,
                Some((TAR_CONTENT_TYPE, Bytes::from(tar))),
            )
            .await?;
        Ok(EngineResponse { status })
    }

    async fn container_logs(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<ContainerLogsResponse, EngineError> {
        let mut path = format!(
            "/containers/{}/logs?tail=all&stdout=1&stderr=1&timestamps=true",
            id
        );
        if let Some(since) = since {
            path.push_str("&since=");
            path.push_str(&since_param(since));
        }

        let (status, body) = self.call(Method::GET, &path, None).await?;
        let logs = if (200..300).contains(&status) {
            demultiplex(body, since)?
        } else {
            ContainerLogs::empty(since)
        };
        Ok(ContainerLogsResponse { status, logs })
    }

    async fn inspect_container(&self, id: &str) -> Result<InspectContainerResponse, EngineError> {
        let (status, body) = self
            .call(Method::GET, &format!("/containers/{}/json", id), None)
            .await?;
        parse_inspect(status, &body)
    }

    async fn kill_container(&self, id: &str) -> Result<EngineResponse, EngineError> {
        self.status_only(Method::POST, &format!("/containers/{}/kill", id))
            .await
    }

    async fn remove_container(&self, id: &str) -> Result<EngineResponse, EngineError> {
        self.status_only(Method::DELETE, &format!("/containers/{}?force=true", id))
            .await
    }
}

/// Create body with every isolation setting applied
fn container_config(params: &SandboxParams) -> Config<String> {
    let limits = &params.limits;
    let cgroupns_mode = match limits.cgroupns_mode.as_str() {
        "private" => HostConfigCgroupnsModeEnum::PRIVATE,
        "host" => HostConfigCgroupnsModeEnum::HOST,
        _ => HostConfigCgroupnsModeEnum::EMPTY,
    };

    Config {
        image: Some(params.image.clone()),
        cmd: Some(params.cmd.clone()),
        working_dir: Some(params.working_dir.clone()),
        host_config: Some(HostConfig {
            cap_drop: Some(limits.cap_drop.clone()),
            security_opt: Some(vec![NO_NEW_PRIVILEGES.to_string()]),
            cgroupns_mode: Some(cgroupns_mode),
            network_mode: Some(limits.network_mode.clone()),
            cpuset_cpus: Some(limits.cpuset_cpus.clone()),
            cpu_quota: Some(limits.cpu_quota),
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_swap_bytes),
            kernel_memory_tcp: Some(limits.kernel_memory_tcp_bytes),
            pids_limit: Some(limits.pids_limit),
            ipc_mode: Some(limits.ipc_mode.clone()),
            ulimits: Some(vec![
                ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(limits.nofile_soft),
                    hard: Some(limits.nofile_hard),
                },
                ResourcesUlimits {
                    name: Some("nproc".to_string()),
                    soft: Some(limits.nproc_soft),
                    hard: Some(limits.nproc_hard),
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `<seconds>.<nanoseconds>` with the fraction zero padded to nine digits
fn since_param(since: DateTime<Utc>) -> String {
    format!("{}.{:09}", since.timestamp(), since.timestamp_subsec_nanos())
}

fn parse_inspect(status: u16, body: &[u8]) -> Result<InspectContainerResponse, EngineError> {
    if status == 404 {
        return Ok(InspectContainerResponse {
            status,
            container_status: Some(ContainerStatus::NotFound),
            exit_code: None,
        });
    }
    if !(200..300).contains(&status) {
        return Ok(InspectContainerResponse {
            status,
            container_status: None,
            exit_code: None,
        });
    }

    let inspect: ContainerInspectResponse = serde_json::from_slice(body)?;
    let state = inspect.state.unwrap_or_default();
    let container_status = match state.status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        Some(ContainerStateStatusEnum::EMPTY) | None => ContainerStatus::NotFound,
    };
    let exit_code = if container_status.is_final() {
        state.exit_code
    } else {
        None
    };

    Ok(InspectContainerResponse {
        status,
        container_status: Some(container_status),
        exit_code,
    })
}
