//! Process entrypoint used by generated `cpr_entrypoint` binaries.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::handler::Handler;
use crate::predictor::{LoadOptions, Predictor};
use crate::server::ModelServer;

/// Runs a model server for the predictor and handler built by the two
/// factories. Exits non-zero on any startup failure.
pub fn launch<P, H, FP, FH>(make_predictor: FP, make_handler: FH) -> ExitCode
where
    P: Predictor,
    H: Handler,
    FP: FnOnce() -> P,
    FH: FnOnce(Arc<P>) -> H,
{
    dotenvy::dotenv().ok();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(make_predictor(), LoadOptions::default(), make_handler)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("model server failed: {e:#}");
            eprintln!("model server failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Config from env, then `load`, then bind and serve. Strictly in that order.
pub async fn run<P, H, FH>(predictor: P, opts: LoadOptions, make_handler: FH) -> anyhow::Result<()>
where
    P: Predictor,
    H: Handler,
    FH: FnOnce(Arc<P>) -> H,
{
    let config = ServerConfig::from_env().context("invalid serving environment")?;

    let server = ModelServer::new(config);
    server
        .load(predictor, &opts, make_handler)
        .await
        .context("predictor load failed")?;

    server.start().await.context("model server stopped")?;
    Ok(())
}
