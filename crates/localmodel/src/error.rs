use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum LocalModelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Container failed to start: {reason}{}", render_tail(.logs))]
    ContainerFailedToStart { reason: String, logs: Vec<String> },

    #[error("Container is not healthy: {reason}{}", render_tail(.logs))]
    ContainerNotHealthy { reason: String, logs: Vec<String> },

    #[error("Transport error ({context}): {source}")]
    Transport {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LocalModelError>;

impl LocalModelError {
    pub fn config(msg: impl Into<String>) -> Self {
        LocalModelError::Config(msg.into())
    }

    pub fn transport<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        LocalModelError::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Container log tail attached to a readiness failure.
    pub fn container_logs(&self) -> &[String] {
        match self {
            LocalModelError::ContainerFailedToStart { logs, .. }
            | LocalModelError::ContainerNotHealthy { logs, .. } => logs,
            _ => &[],
        }
    }
}

fn render_tail(logs: &[String]) -> String {
    if logs.is_empty() {
        return String::new();
    }
    format!(
        "\nContainer logs (last {} lines):\n{}",
        logs.len(),
        logs.join("\n")
    )
}
