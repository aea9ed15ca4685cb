//! Two-gate readiness check for a freshly started container.
//!
//! Gate A waits for the engine to report the container running; gate B waits
//! for the health route to answer 2xx. Both poll at `interval` until `timeout`
//! and stop as soon as the cancellation token fires.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{ContainerEngine, ContainerStatus};

pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READINESS_TIMEOUT,
            interval: DEFAULT_READINESS_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFailure {
    Rejected(String),
    TimedOut(Duration),
    Cancelled,
}

impl GateFailure {
    pub fn describe(&self) -> String {
        match self {
            GateFailure::Rejected(reason) => reason.clone(),
            GateFailure::TimedOut(t) => format!("timed out after {t:?}"),
            GateFailure::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Sleeps until the next poll, never past `deadline`.
async fn pause(deadline: Instant, interval: Duration, cancel: &CancellationToken) -> Result<(), GateFailure> {
    let next = std::cmp::min(Instant::now() + interval, deadline);
    tokio::select! {
        _ = cancel.cancelled() => Err(GateFailure::Cancelled),
        _ = sleep_until(next) => Ok(()),
    }
}

/// Gate A.
pub async fn wait_until_running(
    engine: &dyn ContainerEngine,
    container_id: &str,
    cfg: ReadinessConfig,
    cancel: &CancellationToken,
) -> Result<(), GateFailure> {
    let deadline = Instant::now() + cfg.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(GateFailure::Cancelled);
        }
        match engine.status(container_id).await {
            Ok(ContainerStatus::Running) => return Ok(()),
            Ok(ContainerStatus::Exited) => {
                return Err(GateFailure::Rejected("container exited before it was running".into()))
            }
            Ok(other) => debug!(container_id = %container_id, status = other.as_str(), "waiting for container"),
            Err(e) => debug!(container_id = %container_id, "status poll failed: {e}"),
        }
        if Instant::now() >= deadline {
            return Err(GateFailure::TimedOut(cfg.timeout));
        }
        pause(deadline, cfg.interval, cancel).await?;
    }
}

/// Gate B. Non-2xx answers and connection errors count as "not yet".
pub async fn wait_until_healthy(
    client: &reqwest::Client,
    health_url: &str,
    cfg: ReadinessConfig,
    cancel: &CancellationToken,
) -> Result<(), GateFailure> {
    let deadline = Instant::now() + cfg.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let check = client.get(health_url).timeout(remaining.max(Duration::from_millis(1)));

        tokio::select! {
            _ = cancel.cancelled() => return Err(GateFailure::Cancelled),
            res = check.send() => match res {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!(url = %health_url, status = %resp.status(), "health not ready"),
                Err(e) => debug!(url = %health_url, "health check failed: {e}"),
            },
        }

        if Instant::now() >= deadline {
            return Err(GateFailure::TimedOut(cfg.timeout));
        }
        pause(deadline, cfg.interval, cancel).await?;
    }
}
