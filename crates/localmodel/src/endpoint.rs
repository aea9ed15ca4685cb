//! A serving container running on this host.
//!
//! [`LocalEndpoint::open`] starts the container, waits for it to run and to
//! answer its health route, and hands back an endpoint that reproduces the
//! managed predict/health surface. The container is released on `stop`, on a
//! failed `open`, and (best effort) when the endpoint is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use modelserver::{
    ADC_ENV_VAR, AIP_HEALTH_ROUTE, AIP_HTTP_PORT, AIP_PREDICT_ROUTE, AIP_STORAGE_URI, GCS_SCHEME,
    RESERVED_ENV_PREFIX,
};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::{credential_mount, resolve_credentials, CREDENTIAL_MOUNT_PATH};
use crate::engine::{ContainerEngine, ContainerHandle, ContainerStatus, GpuRequest, RunRequest};
use crate::error::{LocalModelError, Result};
use crate::logs::{tail, LogCursor};
use crate::readiness::{wait_until_healthy, wait_until_running, GateFailure, ReadinessConfig};
use crate::spec::ContainerSpec;

/// Lines of container output attached to a readiness failure.
pub const FAILURE_LOG_TAIL: usize = 50;

#[derive(Clone, Debug, Default)]
pub struct EndpointOptions {
    /// Must use the `gs://` scheme when set.
    pub artifact_uri: Option<String>,
    pub credential_path: Option<PathBuf>,
    /// 0 lets the engine pick a free port.
    pub host_port: u16,
    pub readiness: ReadinessConfig,
    /// Per-request timeout for predict and health calls.
    pub request_timeout: Option<Duration>,
    pub gpu: Option<GpuRequest>,
    pub container_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    New,
    Starting,
    Ready,
    Stopping,
    Released,
    Failed,
}

impl EndpointState {
    /// Whether a container may still be alive in this state.
    fn holds_container(self) -> bool {
        matches!(
            self,
            EndpointState::Starting | EndpointState::Ready | EndpointState::Stopping
        )
    }
}

/// Body of a predict call: inline bytes or a file read at call time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PredictInput {
    Body(Bytes),
    File(PathBuf),
}

impl PredictInput {
    /// Exactly one of `request` and `request_file`.
    pub fn from_parts(request: Option<&[u8]>, request_file: Option<&Path>) -> Result<Self> {
        match (request, request_file) {
            (Some(body), None) => Ok(PredictInput::Body(Bytes::copy_from_slice(body))),
            (None, Some(path)) => Ok(PredictInput::File(path.to_path_buf())),
            _ => Err(LocalModelError::config("exactly one of request and request_file must be given")),
        }
    }

    async fn into_body(self) -> Result<Bytes> {
        match self {
            PredictInput::Body(body) => Ok(body),
            PredictInput::File(path) => {
                if !path.is_file() {
                    return Err(LocalModelError::config(format!(
                        "request_file {} does not exist",
                        path.display()
                    )));
                }
                Ok(Bytes::from(tokio::fs::read(&path).await?))
            }
        }
    }
}

/// Raw answer from the container. Status codes are passed through untouched.
#[derive(Clone, Debug)]
pub struct EndpointResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl EndpointResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| LocalModelError::transport("decoding endpoint response", e))
    }

    async fn read(context: &str, resp: reqwest::Response) -> Result<Self> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| LocalModelError::transport(context, e))?;
        Ok(Self { status, headers, body })
    }
}

/// Translates a spec and endpoint options into the engine's run request.
///
/// `lookup` reads the host environment; only the application-default
/// credentials variable is consulted.
pub fn run_request<F>(spec: &ContainerSpec, opts: &EndpointOptions, lookup: F) -> Result<RunRequest>
where
    F: Fn(&str) -> Option<String>,
{
    let artifact_uri = opts.artifact_uri.clone().unwrap_or_default();
    if !artifact_uri.is_empty() && !artifact_uri.starts_with(GCS_SCHEME) {
        return Err(LocalModelError::config(format!(
            "artifact_uri must start with {GCS_SCHEME}, got {artifact_uri:?}"
        )));
    }

    let credentials = resolve_credentials(opts.credential_path.as_deref(), lookup)?;

    let mut env = BTreeMap::new();
    for (key, value) in spec.env() {
        if key.starts_with(RESERVED_ENV_PREFIX) {
            warn!(key = %key, "ignoring user env var in the reserved {RESERVED_ENV_PREFIX} namespace");
            continue;
        }
        env.insert(key.clone(), value.clone());
    }
    let port = spec.serving_port();
    env.insert(AIP_HTTP_PORT.to_string(), port.to_string());
    env.insert(AIP_HEALTH_ROUTE.to_string(), spec.health_route().to_string());
    env.insert(AIP_PREDICT_ROUTE.to_string(), spec.predict_route().to_string());
    env.insert(AIP_STORAGE_URI.to_string(), artifact_uri);

    let mut volumes = Vec::new();
    if let Some(host) = credentials {
        env.insert(ADC_ENV_VAR.to_string(), CREDENTIAL_MOUNT_PATH.to_string());
        volumes.push(credential_mount(&host));
    }

    let name = opts
        .container_name
        .clone()
        .unwrap_or_else(|| format!("cpr-local-{}", uuid::Uuid::new_v4().simple()));

    Ok(RunRequest {
        name,
        image: spec.image_uri().to_string(),
        command: spec.command().to_vec(),
        args: spec.args().to_vec(),
        env,
        volumes,
        container_port: port,
        host_port: opts.host_port,
        gpu: opts.gpu.clone(),
    })
}

/// Runs `request` on the engine unless `cancel` fires first. A container that
/// comes up after cancellation is stopped in the background.
async fn start_container(
    engine: Arc<dyn ContainerEngine>,
    request: RunRequest,
    cancel: &CancellationToken,
) -> Result<ContainerHandle> {
    let mut run = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(&request).await }
    });

    tokio::select! {
        joined = &mut run => {
            joined.map_err(|e| LocalModelError::transport("starting container", e))?
        }
        _ = cancel.cancelled() => {
            tokio::spawn(async move {
                if let Ok(Ok(handle)) = run.await {
                    debug!(container_id = %handle.id, "releasing container started after cancellation");
                    if let Err(e) = engine.stop(&handle.id).await {
                        warn!(container_id = %handle.id, "failed to release late container: {e}");
                    }
                }
            });
            Err(LocalModelError::Cancelled("starting the container".into()))
        }
    }
}

pub struct LocalEndpoint {
    spec: ContainerSpec,
    opts: EndpointOptions,
    engine: Arc<dyn ContainerEngine>,
    client: reqwest::Client,
    handle: Option<ContainerHandle>,
    state: EndpointState,
    log_cursor: Mutex<LogCursor>,
}

impl fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("image", &self.spec.image_uri())
            .field("container_id", &self.container_id())
            .field("host_port", &self.host_port())
            .field("state", &self.state)
            .finish()
    }
}

impl LocalEndpoint {
    pub async fn open(
        engine: Arc<dyn ContainerEngine>,
        spec: ContainerSpec,
        opts: EndpointOptions,
    ) -> Result<Self> {
        Self::open_with_cancel(engine, spec, opts, CancellationToken::new()).await
    }

    /// Like [`open`](Self::open), but readiness polling stops as soon as
    /// `cancel` fires and the container is released.
    pub async fn open_with_cancel(
        engine: Arc<dyn ContainerEngine>,
        spec: ContainerSpec,
        opts: EndpointOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let request = run_request(&spec, &opts, |key| std::env::var(key).ok())?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LocalModelError::transport("building HTTP client", e))?;

        let mut endpoint = LocalEndpoint {
            spec,
            opts,
            engine,
            client,
            handle: None,
            state: EndpointState::New,
            log_cursor: Mutex::new(LogCursor::default()),
        };

        endpoint.state = EndpointState::Starting;
        info!(image = %request.image, name = %request.name, "starting local endpoint");
        let handle = match start_container(Arc::clone(&endpoint.engine), request, &cancel).await {
            Ok(handle) => handle,
            Err(e) => {
                endpoint.state = EndpointState::Failed;
                return Err(e);
            }
        };
        debug!(container_id = %handle.id, host_port = handle.host_port, "container started");
        endpoint.handle = Some(handle);

        match endpoint.await_ready(&cancel).await {
            Ok(()) => {
                endpoint.state = EndpointState::Ready;
                info!(
                    container_id = ?endpoint.container_id(),
                    host_port = ?endpoint.host_port(),
                    "local endpoint ready"
                );
                Ok(endpoint)
            }
            Err(e) => {
                warn!("local endpoint failed to become ready: {e}");
                endpoint.release(EndpointState::Failed).await;
                Err(e)
            }
        }
    }

    /// Opens an endpoint, runs `f` against it and stops it, whatever `f`
    /// returned.
    pub async fn scoped<T, F>(
        engine: Arc<dyn ContainerEngine>,
        spec: ContainerSpec,
        opts: EndpointOptions,
        f: F,
    ) -> Result<T>
    where
        F: for<'a> FnOnce(&'a LocalEndpoint) -> BoxFuture<'a, Result<T>>,
    {
        let mut endpoint = Self::open(engine, spec, opts).await?;
        let out = f(&endpoint).await;
        let stopped = endpoint.stop().await;
        let value = out?;
        stopped?;
        Ok(value)
    }

    async fn await_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Err(LocalModelError::config("endpoint has no container"));
        };
        let cfg = self.opts.readiness;

        if let Err(failure) = wait_until_running(self.engine.as_ref(), &handle.id, cfg, cancel).await {
            return Err(self.readiness_error(&handle.id, failure, true).await);
        }

        let url = self.url(self.spec.health_route())?;
        if let Err(failure) = wait_until_healthy(&self.client, &url, cfg, cancel).await {
            return Err(self.readiness_error(&handle.id, failure, false).await);
        }
        Ok(())
    }

    async fn readiness_error(&self, id: &str, failure: GateFailure, starting: bool) -> LocalModelError {
        if failure == GateFailure::Cancelled {
            return LocalModelError::Cancelled("waiting for the container to become ready".into());
        }
        let logs = match self.engine.logs(id).await {
            Ok(lines) => tail(&lines, FAILURE_LOG_TAIL),
            Err(e) => {
                debug!(container_id = %id, "could not read container logs: {e}");
                Vec::new()
            }
        };
        let reason = failure.describe();
        if starting {
            LocalModelError::ContainerFailedToStart { reason, logs }
        } else {
            LocalModelError::ContainerNotHealthy { reason, logs }
        }
    }

    /// Stops the container and moves to `final_state`. Stop errors are logged;
    /// on failure the endpoint stays in `Stopping` so `Drop` retries.
    async fn release(&mut self, final_state: EndpointState) -> bool {
        let Some(id) = self.container_id().map(str::to_string) else {
            self.state = final_state;
            return true;
        };
        if final_state == EndpointState::Released {
            self.state = EndpointState::Stopping;
        }
        match self.engine.stop(&id).await {
            Ok(()) => {
                info!(container_id = %id, "container released");
                self.state = final_state;
                true
            }
            Err(e) => {
                warn!(container_id = %id, "failed to release container: {e}");
                self.state = EndpointState::Stopping;
                false
            }
        }
    }

    /// Sends `request` or the contents of `request_file` to the predict route.
    pub async fn predict(
        &self,
        request: Option<&[u8]>,
        request_file: Option<&Path>,
        headers: Option<&HeaderMap>,
    ) -> Result<EndpointResponse> {
        let body = PredictInput::from_parts(request, request_file)?.into_body().await?;
        self.ensure_ready()?;

        let url = self.url(self.spec.predict_route())?;
        let mut call = self.client.post(&url).body(body);
        if let Some(headers) = headers {
            call = call.headers(headers.clone());
        }
        if let Some(timeout) = self.opts.request_timeout {
            call = call.timeout(timeout);
        }

        let context = format!("POST {url}");
        let resp = call
            .send()
            .await
            .map_err(|e| LocalModelError::transport(context.clone(), e))?;
        EndpointResponse::read(&context, resp).await
    }

    pub async fn run_health_check(&self) -> Result<EndpointResponse> {
        self.ensure_ready()?;

        let url = self.url(self.spec.health_route())?;
        let mut call = self.client.get(&url);
        if let Some(timeout) = self.opts.request_timeout {
            call = call.timeout(timeout);
        }

        let context = format!("GET {url}");
        let resp = call
            .send()
            .await
            .map_err(|e| LocalModelError::transport(context.clone(), e))?;
        EndpointResponse::read(&context, resp).await
    }

    pub async fn get_container_status(&self) -> Result<ContainerStatus> {
        match self.container_id() {
            Some(id) => self.engine.status(id).await,
            None => Ok(ContainerStatus::Unknown),
        }
    }

    /// Writes new container log lines to stdout. Returns how many were printed.
    pub async fn print_container_logs(&self, show_all: bool) -> Result<usize> {
        let lines = self.fetch_logs().await?;
        let mut out = std::io::stdout().lock();
        self.emit_logs(&lines, show_all, &mut out)
    }

    pub async fn print_container_logs_to<W: Write>(&self, out: &mut W, show_all: bool) -> Result<usize> {
        let lines = self.fetch_logs().await?;
        self.emit_logs(&lines, show_all, out)
    }

    /// Prints logs only when the container is no longer running.
    pub async fn print_container_logs_if_not_running(&self, show_all: bool) -> Result<usize> {
        if self.get_container_status().await? == ContainerStatus::Running {
            return Ok(0);
        }
        self.print_container_logs(show_all).await
    }

    async fn fetch_logs(&self) -> Result<Vec<String>> {
        match self.container_id() {
            Some(id) => self.engine.logs(id).await,
            None => Ok(Vec::new()),
        }
    }

    fn emit_logs<W: Write>(&self, lines: &[String], show_all: bool, out: &mut W) -> Result<usize> {
        let mut cursor = self.log_cursor.lock().unwrap_or_else(|p| p.into_inner());
        let fresh = cursor.select(lines, show_all);
        for line in fresh {
            writeln!(out, "{line}")?;
        }
        out.flush()?;
        Ok(fresh.len())
    }

    /// Stops and removes the container. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.state.holds_container() {
            return Ok(());
        }
        if self.release(EndpointState::Released).await {
            Ok(())
        } else {
            Err(LocalModelError::transport(
                "stopping container",
                format!("container {:?} is still held", self.container_id()),
            ))
        }
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.opts
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.id.as_str())
    }

    /// Host port the serving port is published on.
    pub fn host_port(&self) -> Option<u16> {
        self.handle.as_ref().map(|h| h.host_port)
    }

    pub fn container(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == EndpointState::Ready {
            Ok(())
        } else {
            Err(LocalModelError::config(format!(
                "endpoint is not ready (state {:?})",
                self.state
            )))
        }
    }

    fn url(&self, route: &str) -> Result<String> {
        let port = self
            .host_port()
            .ok_or_else(|| LocalModelError::config("endpoint has no published port"))?;
        Ok(format!("http://localhost:{port}{route}"))
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        if !self.state.holds_container() {
            return;
        }
        let Some(id) = self.container_id().map(str::to_string) else {
            return;
        };
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                debug!(container_id = %id, "releasing container from drop");
                rt.spawn(async move {
                    if let Err(e) = engine.stop(&id).await {
                        warn!(container_id = %id, "failed to release dropped endpoint: {e}");
                    }
                });
            }
            Err(_) => warn!(container_id = %id, "endpoint dropped outside a runtime; container left running"),
        }
    }
}
