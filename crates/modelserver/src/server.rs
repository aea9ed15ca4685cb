use std::sync::{Arc, OnceLock};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::handler::{Handler, PredictionRequest};
use crate::predictor::{LoadOptions, Predictor};

type SharedState = Arc<ServerState>;

struct ServerState {
    handler: OnceLock<Arc<dyn Handler>>,
}

/// HTTP front for one loaded predictor.
///
/// Health answers 503 until a handler is installed, which happens only after
/// [`Predictor::load`] returned.
#[derive(Clone)]
pub struct ModelServer {
    config: ServerConfig,
    state: SharedState,
}

impl ModelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(ServerState {
                handler: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.state.handler.get().is_some()
    }

    /// Loads `predictor` from the configured storage URI and installs the
    /// handler built around it.
    pub async fn load<P, H, F>(&self, mut predictor: P, opts: &LoadOptions, make_handler: F) -> Result<()>
    where
        P: Predictor,
        H: Handler,
        F: FnOnce(Arc<P>) -> H,
    {
        if self.is_loaded() {
            return Err(ServerError::config("a predictor is already loaded in this server"));
        }

        info!(storage_uri = %self.config.storage_uri, "loading predictor");
        opts.warn_if_unrestricted();
        predictor.load(&self.config.storage_uri, opts).await?;

        self.install(make_handler(Arc::new(predictor)))?;
        info!("predictor loaded");
        Ok(())
    }

    pub fn install<H: Handler>(&self, handler: H) -> Result<()> {
        self.state
            .handler
            .set(Arc::new(handler))
            .map_err(|_| ServerError::config("a predictor is already loaded in this server"))
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.health_route, get(health))
            .route(&self.config.predict_route, post(predict))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(
            %addr,
            predict_route = %self.config.predict_route,
            health_route = %self.config.health_route,
            "model server listening"
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Binds `0.0.0.0:AIP_HTTP_PORT` and serves until the process ends.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }
}

async fn health(State(state): State<SharedState>) -> Response {
    if state.handler.get().is_some() {
        (StatusCode::OK, Json(serde_json::json!({}))).into_response()
    } else {
        ServerError::NotReady.into_response()
    }
}

async fn predict(State(state): State<SharedState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(handler) = state.handler.get().cloned() else {
        return ServerError::NotReady.into_response();
    };

    match handler.handle(PredictionRequest::new(headers, body)).await {
        Ok(resp) => resp.into_response(),
        Err(e) => {
            warn!(status = %e.status(), "predict failed: {e}");
            e.into_response()
        }
    }
}
