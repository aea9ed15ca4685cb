//! Turns a user crate into a serving image.
//!
//! The user source directory is a Cargo package that depends on `modelserver`.
//! If it has no `src/bin/cpr_entrypoint.rs`, one is generated that launches a
//! model server around the referenced predictor and handler. The crate is
//! staged into a scratch build context together with the `modelserver` SDK
//! (see [`crate::context`]) and a Dockerfile is rendered next to it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use modelserver::DEFAULT_HTTP_PORT;
use tracing::{debug, info};

use crate::catalog::ContainerCatalog;
use crate::context;
use crate::engine::ContainerEngine;
use crate::error::{LocalModelError, Result};

pub const ENTRYPOINT_BIN: &str = "cpr_entrypoint";
pub const ENTRYPOINT_FILE: &str = "src/bin/cpr_entrypoint.rs";
pub const CONTAINER_WORKDIR: &str = "/usr/app";
pub const INSTALLED_ENTRYPOINT: &str = "/usr/local/bin/cpr_entrypoint";
pub const DEFAULT_BASE_IMAGE: &str = "rust:1-slim-bookworm";
pub const DEFAULT_HANDLER: &str = "modelserver::DefaultHandler";
pub const PLAN_DIGEST_LABEL: &str = "cpr.plan-digest";

/// Cargo binary shipped at a fixed location in first-party prediction images.
pub const FIRST_PARTY_CARGO: &str = "/usr/local/cargo/bin/cargo";

#[derive(Clone, Debug, Default)]
pub struct BuildOptions {
    pub base_image: Option<String>,
    /// Cargo manifest, relative to the source directory, fetched in its own layer.
    pub requirements: Option<PathBuf>,
    /// Rust path of the predictor type, e.g. `my_model::Identity`.
    pub predictor: Option<String>,
    /// Rust path of the handler type. Defaults to [`DEFAULT_HANDLER`].
    pub handler: Option<String>,
    pub serving_port: Option<u16>,
    pub labels: BTreeMap<String, String>,
}

/// How the image's build steps invoke the toolchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub cargo: &'static str,
    pub locked: bool,
}

impl Toolchain {
    pub fn for_base_image(base_image: &str, catalog: &dyn ContainerCatalog) -> Self {
        if catalog.is_prediction_image(base_image) {
            Toolchain {
                cargo: FIRST_PARTY_CARGO,
                locked: true,
            }
        } else {
            Toolchain {
                cargo: "cargo",
                locked: false,
            }
        }
    }

    fn invoke(&self, args: &str) -> String {
        let locked = if self.locked { " --locked" } else { "" };
        format!("{} {args}{locked}", self.cargo)
    }
}

/// Deterministic description of the image. Identical inputs render an
/// identical Dockerfile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildPlan {
    pub base_image: String,
    pub toolchain: Toolchain,
    /// Forward-slash path relative to the work directory.
    pub requirements: Option<String>,
    pub serving_port: u16,
}

impl BuildPlan {
    pub fn dockerfile(&self) -> String {
        let mut lines = vec![
            format!("FROM {}", self.base_image),
            String::new(),
            "ENV CARGO_TERM_COLOR=never".to_string(),
            format!("ENV CARGO_TARGET_DIR={CONTAINER_WORKDIR}/target"),
            format!("WORKDIR {CONTAINER_WORKDIR}"),
            format!("COPY . {CONTAINER_WORKDIR}"),
        ];
        if let Some(manifest) = &self.requirements {
            lines.push(format!(
                "RUN {}",
                self.toolchain.invoke(&format!("fetch --manifest-path {manifest}"))
            ));
        }
        lines.push(format!(
            "RUN {}",
            self.toolchain
                .invoke(&format!("build --release --bin {ENTRYPOINT_BIN}"))
        ));
        lines.push(format!(
            "RUN install -m 0755 {CONTAINER_WORKDIR}/target/release/{ENTRYPOINT_BIN} {INSTALLED_ENTRYPOINT}"
        ));
        lines.push(String::new());
        lines.push(format!("EXPOSE {}", self.serving_port));
        lines.push(format!("ENTRYPOINT [\"{INSTALLED_ENTRYPOINT}\"]"));
        lines.push(String::new());
        lines.join("\n")
    }

    /// blake3 over the Dockerfile, the entrypoint source and the staged manifest.
    pub fn digest(&self, entrypoint_source: &str, manifest: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.dockerfile().as_bytes());
        hasher.update(b"\n");
        hasher.update(entrypoint_source.as_bytes());
        hasher.update(b"\n");
        hasher.update(manifest.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltImage {
    pub tag: String,
    pub serving_port: u16,
    pub plan_digest: String,
    /// Engine image id, when the engine reports one.
    pub digest: Option<String>,
}

pub struct ImageBuilder<'a> {
    engine: &'a dyn ContainerEngine,
    catalog: &'a dyn ContainerCatalog,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, catalog: &'a dyn ContainerCatalog) -> Self {
        Self { engine, catalog }
    }

    pub fn plan(&self, src: &Path, opts: &BuildOptions) -> Result<BuildPlan> {
        let base_image = opts
            .base_image
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string());
        let requirements = opts
            .requirements
            .as_deref()
            .map(|r| requirements_path(src, r))
            .transpose()?;

        Ok(BuildPlan {
            toolchain: Toolchain::for_base_image(&base_image, self.catalog),
            base_image,
            requirements,
            serving_port: opts.serving_port.unwrap_or(DEFAULT_HTTP_PORT),
        })
    }

    pub async fn build(&self, src: &Path, output_image: &str, opts: &BuildOptions) -> Result<BuiltImage> {
        if !src.is_dir() {
            return Err(LocalModelError::config(format!(
                "source directory {} does not exist",
                src.display()
            )));
        }
        if output_image.trim().is_empty() {
            return Err(LocalModelError::config("output image must not be empty"));
        }

        let plan = self.plan(src, opts)?;
        ensure_entrypoint(src, opts.predictor.as_deref(), opts.handler.as_deref())?;
        let entrypoint_source = std::fs::read_to_string(src.join(ENTRYPOINT_FILE))?;

        let scratch = std::env::temp_dir().join(format!("cpr-build-{}", uuid::Uuid::new_v4().simple()));
        let built = self
            .build_in(&scratch, src, output_image, opts, &plan, &entrypoint_source)
            .await;
        let _ = std::fs::remove_dir_all(&scratch);
        let plan_digest = built?;

        let digest = self.engine.image_digest(output_image).await?;
        info!(tag = %output_image, plan_digest = %plan_digest, "image built");

        Ok(BuiltImage {
            tag: output_image.to_string(),
            serving_port: plan.serving_port,
            plan_digest,
            digest,
        })
    }

    async fn build_in(
        &self,
        scratch: &Path,
        src: &Path,
        output_image: &str,
        opts: &BuildOptions,
        plan: &BuildPlan,
        entrypoint_source: &str,
    ) -> Result<String> {
        let context_dir = scratch.join("context");
        let manifest = {
            let (src, context_dir) = (src.to_path_buf(), context_dir.clone());
            tokio::task::spawn_blocking(move || context::stage(&src, &context_dir))
                .await
                .map_err(|e| LocalModelError::config(format!("staging task failed: {e}")))??
        };
        let plan_digest = plan.digest(entrypoint_source, &manifest);

        let dockerfile = scratch.join("Dockerfile");
        std::fs::write(&dockerfile, plan.dockerfile())?;
        debug!(dockerfile = %dockerfile.display(), "build plan written");

        let mut labels = opts.labels.clone();
        labels.insert(PLAN_DIGEST_LABEL.to_string(), plan_digest.clone());

        self.engine
            .build_image(&context_dir, &dockerfile, output_image, &labels)
            .await?;
        Ok(plan_digest)
    }
}

/// Writes the entrypoint unless the file already exists. Returns whether a
/// file was written.
pub fn ensure_entrypoint(src: &Path, predictor: Option<&str>, handler: Option<&str>) -> Result<bool> {
    let path = src.join(ENTRYPOINT_FILE);
    if path.exists() {
        debug!(path = %path.display(), "keeping existing entrypoint");
        return Ok(false);
    }

    let predictor = predictor.ok_or_else(|| {
        LocalModelError::config(format!(
            "a predictor is required when {} has no {ENTRYPOINT_FILE}",
            src.display()
        ))
    })?;
    let handler = handler.unwrap_or(DEFAULT_HANDLER);
    check_type_path("predictor", predictor)?;
    check_type_path("handler", handler)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, entrypoint_source(predictor, handler))?;
    info!(path = %path.display(), predictor, handler, "entrypoint generated");
    Ok(true)
}

pub fn entrypoint_source(predictor: &str, handler: &str) -> String {
    format!(
        "// Generated by localmodel. Delete this file to regenerate it.\n\
         \n\
         fn main() -> std::process::ExitCode {{\n    \
             modelserver::launch({predictor}::default, {handler}::new)\n\
         }}\n"
    )
}

/// `ident(::ident)*`, nothing else.
fn check_type_path(what: &str, path: &str) -> Result<()> {
    let ok = !path.is_empty()
        && path.split("::").all(|seg| {
            let mut chars = seg.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        });
    if ok {
        Ok(())
    } else {
        Err(LocalModelError::config(format!(
            "{what} must be a Rust type path like my_crate::MyType, got {path:?}"
        )))
    }
}

fn requirements_path(src: &Path, requirements: &Path) -> Result<String> {
    let relative = if requirements.is_absolute() {
        requirements.strip_prefix(src).map_err(|_| {
            LocalModelError::config(format!(
                "requirements {} must live inside {}",
                requirements.display(),
                src.display()
            ))
        })?
    } else {
        requirements
    };

    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(LocalModelError::config(format!(
            "requirements {} must live inside {}",
            requirements.display(),
            src.display()
        )));
    }
    if !src.join(relative).is_file() {
        return Err(LocalModelError::config(format!(
            "requirements file {} does not exist",
            src.join(relative).display()
        )));
    }

    Ok(relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/"))
}
