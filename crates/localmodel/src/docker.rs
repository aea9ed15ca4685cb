//! [`ContainerEngine`] backed by the local Docker daemon.
//!
//! Container lifecycle goes through the Docker API (`bollard`); image build and
//! push shell out to the `docker` CLI so BuildKit and credential helpers behave
//! exactly as they do for the user.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerStateStatusEnum, DeviceRequest, HostConfig, PortBinding};
use bollard::Docker;
use futures::TryStreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerHandle, ContainerStatus, RunRequest};
use crate::error::{LocalModelError, Result};

const STOP_GRACE_SECS: i64 = 10;
const BUILD_OUTPUT_TAIL: usize = 20;

pub struct DockerEngine {
    docker: Docker,
    cli: String,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| LocalModelError::transport("connecting to the Docker daemon", e))?;
        Ok(Self {
            docker,
            cli: "docker".to_string(),
        })
    }

    /// Uses a different CLI binary (`podman`, a wrapper script) for build/push.
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| LocalModelError::transport("pinging the Docker daemon", e))?;
        Ok(())
    }

    async fn cli(&self, args: &[String], what: &str) -> Result<()> {
        debug!(cli = %self.cli, ?args, "running container CLI");
        let mut child = Command::new(&self.cli)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LocalModelError::Build(format!("failed to spawn {}: {e}", self.cli)))?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "localmodel::docker", "{line}");
                }
            })
        });

        let mut tail: Vec<String> = Vec::new();
        if let Some(err) = child.stderr.take() {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "localmodel::docker", "{line}");
                tail.push(line);
                if tail.len() > BUILD_OUTPUT_TAIL {
                    tail.remove(0);
                }
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stdout {
            let _ = task.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(LocalModelError::Build(format!(
                "{what} exited with {status}:\n{}",
                tail.join("\n")
            )))
        }
    }

    /// Host port the engine assigned to `port_key`.
    async fn published_port(&self, id: &str, port_key: &str) -> Result<u16> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| LocalModelError::transport("inspecting container ports", e))?;

        let bound = inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(port_key))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|p| p.parse::<u16>().ok());

        match bound {
            Some(port) => Ok(port),
            None => {
                // Exited before the port was published.
                let logs = self.logs(id).await.unwrap_or_default();
                Err(LocalModelError::ContainerFailedToStart {
                    reason: format!("no host port was published for {port_key}"),
                    logs: crate::logs::tail(&logs, crate::endpoint::FAILURE_LOG_TAIL),
                })
            }
        }
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 404, .. })
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            ContainerStatus::Exited
        }
        _ => ContainerStatus::Unknown,
    }
}

fn device_requests(req: &RunRequest) -> Option<Vec<DeviceRequest>> {
    let gpu = req.gpu.as_ref()?;
    let capabilities = if gpu.capabilities.is_empty() {
        vec![vec!["gpu".to_string()]]
    } else {
        gpu.capabilities.clone()
    };
    Some(vec![DeviceRequest {
        driver: Some("nvidia".to_string()),
        count: gpu.count,
        device_ids: (!gpu.device_ids.is_empty()).then(|| gpu.device_ids.clone()),
        capabilities: Some(capabilities),
        ..Default::default()
    }])
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &Path,
        tag: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args = vec![
            "build".to_string(),
            "--file".to_string(),
            dockerfile.display().to_string(),
            "--tag".to_string(),
            tag.to_string(),
        ];
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(context_dir.display().to_string());

        info!(tag = %tag, context = %context_dir.display(), "building image");
        self.cli(&args, "image build").await
    }

    async fn push_image(&self, tag: &str) -> Result<()> {
        info!(tag = %tag, "pushing image");
        self.cli(&["push".to_string(), tag.to_string()], "image push").await
    }

    async fn image_digest(&self, tag: &str) -> Result<Option<String>> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => Ok(image.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(LocalModelError::transport(format!("inspecting image {tag}"), e)),
        }
    }

    async fn run(&self, req: &RunRequest) -> Result<ContainerHandle> {
        let port_key = format!("{}/tcp", req.container_port);
        let host_port = if req.host_port == 0 {
            String::new()
        } else {
            req.host_port.to_string()
        };

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port),
            }]),
        );

        let host_config = HostConfig {
            binds: Some(req.volumes.iter().map(|v| v.bind_spec()).collect()),
            port_bindings: Some(port_bindings),
            device_requests: device_requests(req),
            ..Default::default()
        };

        let config = Config {
            image: Some(req.image.clone()),
            entrypoint: (!req.command.is_empty()).then(|| req.command.clone()),
            cmd: (!req.args.is_empty()).then(|| req.args.clone()),
            env: Some(req.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            exposed_ports: Some(HashMap::from([(port_key.clone(), HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        info!(name = %req.name, image = %req.image, container_port = req.container_port, "starting container");

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: req.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| LocalModelError::transport(format!("creating container from {}", req.image), e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.stop(&created.id).await;
            return Err(LocalModelError::transport("starting container", e));
        }

        let resolved = if req.host_port != 0 {
            req.host_port
        } else {
            // Every failure past start releases the container before returning.
            match self.published_port(&created.id, &port_key).await {
                Ok(port) => port,
                Err(e) => {
                    let _ = self.stop(&created.id).await;
                    return Err(e);
                }
            }
        };

        debug!(container_id = %created.id, host_port = resolved, "container started");

        Ok(ContainerHandle {
            id: created.id,
            host_port: resolved,
            volumes: req.volumes.clone(),
            env: req.env.clone(),
        })
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(map_status(inspect.state.and_then(|s| s.status))),
            Err(e) if is_not_found(&e) => Ok(ContainerStatus::Exited),
            Err(e) => Err(LocalModelError::transport("inspecting container status", e)),
        }
    }

    async fn logs(&self, id: &str) -> Result<Vec<String>> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );

        let mut raw: Vec<u8> = Vec::new();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| LocalModelError::transport("reading container logs", e))?
        {
            raw.extend_from_slice(&chunk.into_bytes());
        }

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            if is_not_found(&e) {
                return Ok(());
            }
            // 304: already stopped.
            debug!(container_id = %id, "stop returned: {e}");
        }

        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                debug!(container_id = %id, "container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => {
                warn!(container_id = %id, "failed to remove container: {e}");
                Err(LocalModelError::transport("removing container", e))
            }
        }
    }
}
