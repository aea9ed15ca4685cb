use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::build::{BuildOptions, ImageBuilder};
use crate::catalog::{ContainerCatalog, PrebuiltCatalog};
use crate::endpoint::{EndpointOptions, LocalEndpoint};
use crate::engine::ContainerEngine;
use crate::error::{LocalModelError, Result};
use crate::spec::ContainerSpec;

/// A serving image plus the spec the platform needs to run it.
///
/// Owns no containers itself; each deploy opens a fresh [`LocalEndpoint`].
#[derive(Clone)]
pub struct LocalModel {
    spec: ContainerSpec,
    engine: Arc<dyn ContainerEngine>,
    source_image_digest: Option<String>,
    plan_digest: Option<String>,
}

impl std::fmt::Debug for LocalModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalModel")
            .field("spec", &self.spec)
            .field("source_image_digest", &self.source_image_digest)
            .field("plan_digest", &self.plan_digest)
            .finish()
    }
}

impl LocalModel {
    /// Builds `output_image` from the crate at `src` and wraps it with the
    /// default routes and the serving port the image exposes.
    pub async fn build_cpr_model(
        engine: Arc<dyn ContainerEngine>,
        src: impl AsRef<Path>,
        output_image: &str,
        opts: BuildOptions,
    ) -> Result<Self> {
        Self::build_cpr_model_with_catalog(engine, &PrebuiltCatalog::default(), src, output_image, opts).await
    }

    pub async fn build_cpr_model_with_catalog(
        engine: Arc<dyn ContainerEngine>,
        catalog: &dyn ContainerCatalog,
        src: impl AsRef<Path>,
        output_image: &str,
        opts: BuildOptions,
    ) -> Result<Self> {
        let built = ImageBuilder::new(engine.as_ref(), catalog)
            .build(src.as_ref(), output_image, &opts)
            .await?;
        let spec = ContainerSpec::builder(built.tag.clone())
            .port(built.serving_port)
            .build()?;

        Ok(Self {
            spec,
            engine,
            source_image_digest: built.digest,
            plan_digest: Some(built.plan_digest),
        })
    }

    /// Wraps an image that already exists.
    pub fn from_spec(engine: Arc<dyn ContainerEngine>, spec: ContainerSpec) -> Self {
        Self {
            spec,
            engine,
            source_image_digest: None,
            plan_digest: None,
        }
    }

    pub fn container_spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn source_image_digest(&self) -> Option<&str> {
        self.source_image_digest.as_deref()
    }

    pub fn plan_digest(&self) -> Option<&str> {
        self.plan_digest.as_deref()
    }

    pub async fn deploy_to_local_endpoint(&self, opts: EndpointOptions) -> Result<LocalEndpoint> {
        LocalEndpoint::open(Arc::clone(&self.engine), self.spec.clone(), opts).await
    }

    /// Deploys, runs `f`, and always stops the endpoint afterwards.
    pub async fn deploy_scoped<T, F>(&self, opts: EndpointOptions, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a LocalEndpoint) -> BoxFuture<'a, Result<T>>,
    {
        LocalEndpoint::scoped(Arc::clone(&self.engine), self.spec.clone(), opts, f).await
    }

    /// Pushes the image to the registry named in its URI.
    pub async fn push_image(&self) -> Result<()> {
        let image = self.spec.image_uri();
        if registry_host(image).is_none() {
            return Err(LocalModelError::config(format!(
                "image {image} has no registry host; tag it as <registry>/<repository>:<tag> before pushing"
            )));
        }
        self.engine.push_image(image).await?;
        info!(image = %image, "image pushed");
        Ok(())
    }
}

/// First path segment when it names a registry (`host.tld`, `host:port` or
/// `localhost`).
pub fn registry_host(image_uri: &str) -> Option<&str> {
    let (first, _) = image_uri.split_once('/')?;
    (first == "localhost" || first.contains('.') || first.contains(':')).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_hosts() {
        assert_eq!(
            registry_host("us-docker.pkg.dev/proj/repo/identity:1"),
            Some("us-docker.pkg.dev")
        );
        assert_eq!(registry_host("localhost:5000/identity:1"), Some("localhost:5000"));
        assert_eq!(registry_host("localhost/identity"), Some("localhost"));
        assert_eq!(registry_host("identity:1"), None);
        assert_eq!(registry_host("library/identity:1"), None);
    }
}
