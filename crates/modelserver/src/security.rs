//! Guard rails around model deserialization.
//!
//! Pickle-family formats execute arbitrary code while loading. A predictor
//! that reads model files goes through [`ModelFileGuard`] so the allow-list is
//! explicit and unsafe formats are always reported.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::{Result, ServerError};
use crate::predictor::{normalize_extension, LoadOptions};

/// Extensions whose loaders can execute code embedded in the file.
pub const UNSAFE_EXTENSIONS: &[&str] = &["joblib", "pkl", "pickle"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecurityWarning {
    /// `allowed_extensions` was not set.
    Unrestricted,
    /// A file is about to be read by a code-executing deserializer.
    UnsafeDeserializer { path: PathBuf, extension: String },
}

impl fmt::Display for SecurityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityWarning::Unrestricted => write!(
                f,
                "No allowed_extensions were given: model files will be loaded with every default \
                 deserializer, and deserializing untrusted files can execute arbitrary code"
            ),
            SecurityWarning::UnsafeDeserializer { path, extension } => write!(
                f,
                "Loading {} with the {extension} deserializer, which can execute arbitrary code; \
                 only load files from trusted sources",
                path.display()
            ),
        }
    }
}

pub trait WarningSink: Send + Sync {
    fn emit(&self, warning: SecurityWarning);
}

/// Default sink: `tracing::warn!` on target `modelserver::security`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingWarnings;

impl WarningSink for TracingWarnings {
    fn emit(&self, warning: SecurityWarning) {
        warn!(target: "modelserver::security", "{warning}");
    }
}

/// Keeps every warning in memory; also forwards to tracing.
#[derive(Debug, Default)]
pub struct CollectedWarnings {
    seen: Mutex<Vec<SecurityWarning>>,
}

impl CollectedWarnings {
    pub fn snapshot(&self) -> Vec<SecurityWarning> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl WarningSink for CollectedWarnings {
    fn emit(&self, warning: SecurityWarning) {
        TracingWarnings.emit(warning.clone());
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(warning);
    }
}

/// Decides which model files a predictor may open.
pub struct ModelFileGuard {
    allowed: BTreeSet<String>,
    opts: LoadOptions,
}

impl ModelFileGuard {
    /// `defaults` is the predictor's own extension set, used when the caller
    /// did not pass `allowed_extensions`.
    pub fn new(opts: &LoadOptions, defaults: &[&str]) -> Self {
        opts.warn_if_unrestricted();
        let allowed = match &opts.allowed_extensions {
            Some(list) => list.clone(),
            None => defaults.iter().map(|e| normalize_extension(e)).collect(),
        };
        Self {
            allowed,
            opts: opts.clone(),
        }
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    /// Checks `path` against the allow-list and returns its extension.
    pub fn admit(&self, path: &Path) -> Result<String> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .unwrap_or_default();

        if !self.allowed.contains(&ext) {
            return Err(ServerError::config(format!(
                "Refusing to load {}: extension {ext:?} is not in allowed_extensions {:?}",
                path.display(),
                self.allowed
            )));
        }

        if UNSAFE_EXTENSIONS.contains(&ext.as_str()) {
            self.opts.warnings.emit(SecurityWarning::UnsafeDeserializer {
                path: path.to_path_buf(),
                extension: ext.clone(),
            });
        }
        Ok(ext)
    }

    /// Finds `<dir>/<stem>.<ext>` for the first allowed extension that exists,
    /// in `preference` order, and admits it.
    pub fn find_model_file(&self, dir: &Path, stem: &str, preference: &[&str]) -> Result<PathBuf> {
        for ext in preference.iter().map(|e| normalize_extension(e)) {
            if !self.allowed.contains(&ext) {
                continue;
            }
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.is_file() {
                self.admit(&candidate)?;
                return Ok(candidate);
            }
        }
        Err(ServerError::config(format!(
            "No model file named {stem}.{{{}}} found in {}",
            preference.join(","),
            dir.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collecting(opts: LoadOptions) -> (LoadOptions, Arc<CollectedWarnings>) {
        let sink = Arc::new(CollectedWarnings::default());
        (opts.with_warnings(sink.clone()), sink)
    }

    #[test]
    fn guard_without_allow_list_warns_once_and_uses_defaults() {
        let (opts, sink) = collecting(LoadOptions::new());
        let guard = ModelFileGuard::new(&opts, &["joblib", "pkl"]);
        let _again = ModelFileGuard::new(&opts, &["joblib", "pkl"]);

        assert_eq!(sink.snapshot(), vec![SecurityWarning::Unrestricted]);
        assert!(guard.allowed().contains("pkl"));
    }

    #[test]
    fn disallowed_extension_is_config_error() {
        let (opts, _sink) = collecting(LoadOptions::new().with_allowed_extensions(["json"]));
        let guard = ModelFileGuard::new(&opts, &["pkl"]);
        let err = guard.admit(Path::new("/models/model.pkl")).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
        assert!(guard.admit(Path::new("/models/model.json")).is_ok());
    }

    #[test]
    fn pickle_family_warns_even_when_allowed() {
        let (opts, sink) = collecting(LoadOptions::new().with_allowed_extensions(["pkl", "joblib"]));
        let guard = ModelFileGuard::new(&opts, &[]);

        guard.admit(Path::new("m/model.PKL")).unwrap();
        guard.admit(Path::new("m/model.joblib")).unwrap();

        let seen = sink.snapshot();
        assert_eq!(seen.len(), 2);
        assert!(seen
            .iter()
            .all(|w| matches!(w, SecurityWarning::UnsafeDeserializer { .. })));
    }

    #[test]
    fn find_model_file_respects_preference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.pkl"), b"x").unwrap();
        std::fs::write(dir.path().join("model.json"), b"{}").unwrap();

        let (opts, _sink) = collecting(LoadOptions::new().with_allowed_extensions(["json", "pkl"]));
        let guard = ModelFileGuard::new(&opts, &[]);
        let found = guard
            .find_model_file(dir.path(), "model", &["json", "pkl"])
            .unwrap();
        assert_eq!(found, dir.path().join("model.json"));

        let missing = guard.find_model_file(dir.path(), "weights", &["json"]);
        assert!(missing.is_err());
    }
}
