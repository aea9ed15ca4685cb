//! Local run: build the identity model image, serve it in a container, and
//! talk to it exactly like the managed endpoint would.
//!
//! Environment:
//!   CPR_SRC         crate to package (default: ../identity-model)
//!   CPR_IMAGE       output tag (default: cpr-identity:local)
//!   CPR_SKIP_BUILD  set to reuse an existing CPR_IMAGE
//!   CPR_HOST_PORT   host port to publish on (default: any free port)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use localmodel::{
    BuildOptions, ContainerEngine, ContainerSpec, DockerEngine, EndpointOptions, LocalModel,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let src = std::env::var("CPR_SRC")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../identity-model"));
    let image = std::env::var("CPR_IMAGE").unwrap_or_else(|_| "cpr-identity:local".to_string());
    let host_port = match std::env::var("CPR_HOST_PORT") {
        Ok(v) => v.parse::<u16>().context("CPR_HOST_PORT must be a port number")?,
        Err(_) => 0,
    };

    let docker = DockerEngine::connect().context("Docker is required for the local run")?;
    docker.ping().await.context("Docker daemon is not answering")?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(docker);

    println!("📦 Step 1: Package the model");
    println!("   ─────────────────────────");
    let model = if std::env::var_os("CPR_SKIP_BUILD").is_some() {
        println!("   Reusing image {image}");
        LocalModel::from_spec(engine, ContainerSpec::new(image.as_str())?)
    } else {
        let opts = BuildOptions {
            predictor: Some("identity_model::IdentityPredictor".into()),
            ..Default::default()
        };
        let model = LocalModel::build_cpr_model(engine, &src, &image, opts)
            .await
            .with_context(|| format!("building {image} from {}", src.display()))?;
        println!("   Built {image}");
        if let Some(digest) = model.source_image_digest() {
            println!("   Image digest: {digest}");
        }
        model
    };
    println!();

    println!("🚀 Step 2: Start a local endpoint");
    println!("   ───────────────────────────────");
    let mut endpoint = model
        .deploy_to_local_endpoint(EndpointOptions {
            host_port,
            ..Default::default()
        })
        .await
        .context("local endpoint did not become ready")?;
    let port = endpoint.host_port().unwrap_or_default();
    info!(port, container = ?endpoint.container_id(), "endpoint ready");
    println!("   Listening on http://localhost:{port}\n");

    println!("🔍 Step 3: Predict");
    println!("   ────────────────");
    let body = br#"{"instances":[[1,2,3]]}"#;
    let resp = endpoint.predict(Some(body), None, None).await?;
    println!("   Request:  {}", String::from_utf8_lossy(body));
    println!("   Status:   {}", resp.status);
    println!("   Response: {}\n", resp.text());

    let health = endpoint.run_health_check().await?;
    println!("   Health:   {}\n", health.status);

    println!("📜 Step 4: Container logs");
    println!("   ──────────────────────");
    let printed = endpoint.print_container_logs(false).await?;
    println!("   ({printed} lines)\n");

    endpoint.stop().await?;
    println!("✓ Container released");
    Ok(())
}
