//! In-process stand-in for the container engine.
//!
//! Each "container" is a real `ModelServer` bound to 127.0.0.1, configured
//! from the `AIP_*` env the endpoint computed, so the whole env/route/port
//! contract is exercised without Docker.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use localmodel::{
    ContainerEngine, ContainerHandle, ContainerStatus, LocalModelError, ReadinessConfig, Result,
    RunRequest, SDK_DIR,
};
use modelserver::{DefaultHandler, LoadOptions, ModelServer, Predictor, PredictorError, ServerConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// What the serving process inside a fake container does.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Loads the echo predictor and serves.
    Serve,
    /// Dies before it ever runs.
    ExitImmediately,
    /// Serves but never loads, so health stays 503.
    NeverHealthy,
    /// Sleeps before binding its port.
    DelayedBind(Duration),
}

/// Wraps `instances` into `predictions`. Prints `ALIVE` when loaded.
pub struct Echo {
    logs: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Predictor for Echo {
    async fn load(&mut self, _artifact_uri: &str, _opts: &LoadOptions) -> modelserver::Result<()> {
        self.logs.lock().unwrap().push("ALIVE".to_string());
        Ok(())
    }

    async fn predict(&self, input: Value) -> std::result::Result<Value, PredictorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let instances = input
            .get("instances")
            .cloned()
            .ok_or_else(|| PredictorError::InvalidInput("missing \"instances\"".into()))?;
        Ok(json!({ "predictions": instances }))
    }
}

struct FakeContainer {
    task: Option<JoinHandle<()>>,
    host_port: u16,
    logs: Arc<Mutex<Vec<String>>>,
    exited: bool,
}

#[derive(Clone, Debug)]
pub struct BuildCall {
    pub context_dir: PathBuf,
    /// Staged `Cargo.toml`, read while the context still exists.
    pub manifest: String,
    pub sdk_staged: bool,
    pub dockerfile: String,
    pub tag: String,
    pub labels: BTreeMap<String, String>,
}

pub struct FakeEngine {
    behavior: Behavior,
    run_delay: Duration,
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    pub predict_calls: Arc<AtomicUsize>,
    pub runs: Mutex<Vec<RunRequest>>,
    pub stopped: Mutex<Vec<String>>,
    pub builds: Mutex<Vec<BuildCall>>,
    pub pushed: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Self::with_run_delay(behavior, Duration::ZERO)
    }

    /// Engine whose `run` takes `delay` before the container exists.
    pub fn with_run_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            run_delay: delay,
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            predict_calls: Arc::new(AtomicUsize::new(0)),
            runs: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            builds: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
        })
    }

    pub fn last_id(&self) -> Option<String> {
        let n = self.next_id.load(Ordering::SeqCst);
        (n > 0).then(|| format!("fake-{}", n - 1))
    }

    /// Host port the container was published on, kept after it is stopped.
    pub fn host_port(&self, id: &str) -> Option<u16> {
        self.containers.lock().unwrap().get(id).map(|c| c.host_port)
    }

    pub fn was_stopped(&self, id: &str) -> bool {
        self.stopped.lock().unwrap().iter().any(|s| s == id)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build_image(
        &self,
        context_dir: &Path,
        dockerfile: &Path,
        tag: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let dockerfile = std::fs::read_to_string(dockerfile)?;
        let manifest = std::fs::read_to_string(context_dir.join("Cargo.toml"))?;
        let sdk_staged = context_dir.join(SDK_DIR).join("src/lib.rs").is_file()
            && context_dir.join(SDK_DIR).join("Cargo.toml").is_file();
        self.builds.lock().unwrap().push(BuildCall {
            context_dir: context_dir.to_path_buf(),
            manifest,
            sdk_staged,
            dockerfile,
            tag: tag.to_string(),
            labels: labels.clone(),
        });
        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<()> {
        self.pushed.lock().unwrap().push(tag.to_string());
        Ok(())
    }

    async fn image_digest(&self, tag: &str) -> Result<Option<String>> {
        let known = self.builds.lock().unwrap().iter().any(|b| b.tag == tag);
        Ok(known.then(|| "sha256:fake".to_string()))
    }

    async fn run(&self, req: &RunRequest) -> Result<ContainerHandle> {
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        self.runs.lock().unwrap().push(req.clone());
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));

        let config = ServerConfig::from_lookup(|key| req.env.get(key).cloned())
            .map_err(|e| LocalModelError::config(e.to_string()))?;
        let listener = TcpListener::bind(("127.0.0.1", req.host_port)).await?;
        let host_port = listener.local_addr()?.port();
        let logs = Arc::new(Mutex::new(vec![format!(
            "serving {} on container port {}",
            config.predict_route, config.http_port
        )]));

        let mut container = FakeContainer {
            task: None,
            host_port,
            logs: Arc::clone(&logs),
            exited: false,
        };

        match self.behavior {
            Behavior::Serve => {
                let server = ModelServer::new(config);
                let predictor = Echo {
                    logs: Arc::clone(&logs),
                    calls: Arc::clone(&self.predict_calls),
                };
                server
                    .load(predictor, &LoadOptions::default(), DefaultHandler::new)
                    .await
                    .map_err(|e| LocalModelError::config(e.to_string()))?;
                container.task = Some(tokio::spawn(async move {
                    let _ = server.serve(listener).await;
                }));
            }
            Behavior::NeverHealthy => {
                let server = ModelServer::new(config);
                container.task = Some(tokio::spawn(async move {
                    let _ = server.serve(listener).await;
                }));
            }
            Behavior::ExitImmediately => {
                drop(listener);
                logs.lock().unwrap().push("fatal: model artifact missing".to_string());
                container.exited = true;
            }
            Behavior::DelayedBind(delay) => {
                drop(listener);
                logs.lock().unwrap().push(format!("sleeping {delay:?} before bind"));
                let server = ModelServer::new(config);
                container.task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Ok(listener) = TcpListener::bind(("127.0.0.1", host_port)).await {
                        let _ = server.serve(listener).await;
                    }
                }));
            }
        }

        self.containers.lock().unwrap().insert(id.clone(), container);
        Ok(ContainerHandle {
            id,
            host_port,
            volumes: req.volumes.clone(),
            env: req.env.clone(),
        })
    }

    async fn status(&self, id: &str) -> Result<ContainerStatus> {
        let containers = self.containers.lock().unwrap();
        let Some(c) = containers.get(id) else {
            return Ok(ContainerStatus::Exited);
        };
        let running = !c.exited && c.task.as_ref().is_some_and(|t| !t.is_finished());
        Ok(if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Exited
        })
    }

    async fn logs(&self, id: &str) -> Result<Vec<String>> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .get(id)
            .map(|c| c.logs.lock().unwrap().clone())
            .unwrap_or_default())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let task = {
            let mut containers = self.containers.lock().unwrap();
            match containers.get_mut(id) {
                Some(c) => {
                    c.exited = true;
                    c.task.take()
                }
                None => None,
            }
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

pub fn fast_readiness(timeout: Duration) -> ReadinessConfig {
    ReadinessConfig {
        timeout,
        interval: Duration::from_millis(20),
    }
}

/// True if nothing listens on `port` any more.
pub async fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}
