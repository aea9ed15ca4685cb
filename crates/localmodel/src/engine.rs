use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    /// `host:container[:ro]`, the engine's bind syntax.
    pub fn bind_spec(&self) -> String {
        let mut s = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            s.push_str(":ro");
        }
        s
    }
}

/// Accelerators to attach. `count = -1` asks for every device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuRequest {
    pub count: Option<i64>,
    pub device_ids: Vec<String>,
    pub capabilities: Vec<Vec<String>>,
}

/// Everything the engine needs to start one detached serving container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub container_port: u16,
    /// 0 lets the engine pick a free host port.
    pub host_port: u16,
    pub gpu: Option<GpuRequest>,
}

/// A started container. Owned by exactly one endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    /// Host port bound to the serving port, resolved after start.
    pub host_port: u16,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
}

/// Host container runtime.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &Path,
        tag: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    async fn push_image(&self, tag: &str) -> Result<()>;

    /// Engine-assigned image id, `None` when the image is unknown locally.
    async fn image_digest(&self, tag: &str) -> Result<Option<String>>;

    async fn run(&self, req: &RunRequest) -> Result<ContainerHandle>;

    async fn status(&self, id: &str) -> Result<ContainerStatus>;

    /// Full combined stdout/stderr, one entry per line.
    async fn logs(&self, id: &str) -> Result<Vec<String>>;

    /// Stops and removes the container. Succeeds if it is already gone.
    async fn stop(&self, id: &str) -> Result<()>;
}
