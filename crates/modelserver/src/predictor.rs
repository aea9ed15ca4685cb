use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::Result;
use crate::security::{SecurityWarning, TracingWarnings, WarningSink};

/// Failure raised from inside a predictor's processing steps.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("Invalid prediction input: {0}")]
    InvalidInput(String),

    #[error("Prediction failed: {0}")]
    Failed(String),

    #[error("Predictor error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

/// User-supplied prediction routine.
///
/// `load` is called exactly once, before the server accepts traffic, with the
/// value of `AIP_STORAGE_URI` (empty when there is no artifact).
#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    async fn load(&mut self, artifact_uri: &str, opts: &LoadOptions) -> Result<()>;

    async fn preprocess(&self, input: Value) -> std::result::Result<Value, PredictorError> {
        Ok(input)
    }

    async fn predict(&self, instances: Value) -> std::result::Result<Value, PredictorError>;

    async fn postprocess(&self, output: Value) -> std::result::Result<Value, PredictorError> {
        Ok(output)
    }
}

/// Options handed to [`Predictor::load`].
#[derive(Clone)]
pub struct LoadOptions {
    /// Extensions (without the dot) a predictor may deserialize.
    pub allowed_extensions: Option<BTreeSet<String>>,
    pub warnings: Arc<dyn WarningSink>,
    unrestricted_warned: Arc<AtomicBool>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self {
            allowed_extensions: None,
            warnings: Arc::new(TracingWarnings),
            unrestricted_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_extensions = Some(
            extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
        );
        self
    }

    pub fn with_warnings(mut self, sink: Arc<dyn WarningSink>) -> Self {
        self.warnings = sink;
        self
    }

    /// Emits [`SecurityWarning::Unrestricted`] when no allow-list is set.
    /// Fires at most once per options value (clones share the flag).
    pub fn warn_if_unrestricted(&self) -> bool {
        if self.allowed_extensions.is_some() {
            return false;
        }
        if self.unrestricted_warned.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.warnings.emit(SecurityWarning::Unrestricted);
        true
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("allowed_extensions", &self.allowed_extensions)
            .finish_non_exhaustive()
    }
}

pub(crate) fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}
