use std::path::{Path, PathBuf};

use modelserver::ADC_ENV_VAR;
use tracing::debug;

use crate::engine::VolumeMount;
use crate::error::{LocalModelError, Result};

/// Where a resolved host credential file appears inside the container.
pub const CREDENTIAL_MOUNT_PATH: &str = "/tmp/keys/cred_key.json";

/// Picks the host credential file to mount, if any.
///
/// An explicit path must exist. Otherwise the application-default-credentials
/// variable is consulted through `lookup`; a set variable that points nowhere
/// is an error, an unset one means "no credentials".
pub fn resolve_credentials<F>(explicit: Option<&Path>, lookup: F) -> Result<Option<PathBuf>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(LocalModelError::config(format!(
                "credential_path {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    match lookup(ADC_ENV_VAR).filter(|v| !v.trim().is_empty()) {
        Some(value) => {
            let path = PathBuf::from(value);
            if !path.exists() {
                return Err(LocalModelError::config(format!(
                    "{ADC_ENV_VAR} is set to {} but the file does not exist",
                    path.display()
                )));
            }
            Ok(Some(path))
        }
        None => {
            debug!("no credentials resolved; container starts without a credential mount");
            Ok(None)
        }
    }
}

/// Read-only bind of `host` at [`CREDENTIAL_MOUNT_PATH`].
pub fn credential_mount(host: &Path) -> VolumeMount {
    VolumeMount {
        host_path: host.to_path_buf(),
        container_path: CREDENTIAL_MOUNT_PATH.to_string(),
        read_only: true,
    }
}
