use std::sync::Arc;

use async_trait::async_trait;
use modelserver::{
    CollectedWarnings, DefaultHandler, LoadOptions, ModelServer, Predictor, PredictorError, Result,
    SecurityWarning, ServerConfig, ServerError,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Wraps `instances` into `predictions` unchanged.
#[derive(Default)]
struct Identity {
    loaded_from: Option<String>,
}

#[async_trait]
impl Predictor for Identity {
    async fn load(&mut self, artifact_uri: &str, _opts: &LoadOptions) -> Result<()> {
        self.loaded_from = Some(artifact_uri.to_string());
        Ok(())
    }

    async fn predict(&self, input: Value) -> std::result::Result<Value, PredictorError> {
        let instances = input
            .get("instances")
            .cloned()
            .ok_or_else(|| PredictorError::InvalidInput("missing \"instances\"".into()))?;
        Ok(json!({ "predictions": instances }))
    }
}

struct FailingLoad;

#[async_trait]
impl Predictor for FailingLoad {
    async fn load(&mut self, _artifact_uri: &str, _opts: &LoadOptions) -> Result<()> {
        Err(ServerError::config("model.bin not found"))
    }

    async fn predict(&self, input: Value) -> std::result::Result<Value, PredictorError> {
        Ok(input)
    }
}

fn config(predict: &str, health: &str) -> ServerConfig {
    ServerConfig {
        http_port: 0,
        health_route: health.to_string(),
        predict_route: predict.to_string(),
        storage_uri: "gs://bucket/model".to_string(),
    }
}

async fn spawn(server: &ModelServer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("http://{addr}")
}

async fn loaded_identity(predict: &str, health: &str) -> String {
    let server = ModelServer::new(config(predict, health));
    server
        .load(Identity::default(), &LoadOptions::default(), DefaultHandler::new)
        .await
        .unwrap();
    spawn(&server).await
}

#[tokio::test]
async fn health_is_503_until_loaded() {
    let server = ModelServer::new(config("/predict", "/health"));
    let base = spawn(&server).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 503);

    let resp = client
        .post(format!("{base}/predict"))
        .header("content-type", "application/json")
        .body(r#"{"instances":[1]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    server
        .load(Identity::default(), &LoadOptions::default(), DefaultHandler::new)
        .await
        .unwrap();

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn identity_predict_round_trip() {
    let base = loaded_identity("/predict", "/health").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .header("content-type", "application/json")
        .header("accept", "application/json")
        .body(r#"{"instances":[[1,2,3]]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"predictions": [[1, 2, 3]]}));
}

#[tokio::test]
async fn unsupported_content_type_is_400_naming_json() {
    let base = loaded_identity("/predict", "/health").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .header("content-type", "text/csv")
        .body("1,2,3")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("application/json"), "{detail}");
}

#[tokio::test]
async fn malformed_json_is_400() {
    let base = loaded_identity("/predict", "/health").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .header("content-type", "application/json")
        .body("{\"instances\": [")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn predictor_error_is_500_with_detail() {
    let base = loaded_identity("/predict", "/health").await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/predict"))
        .header("content-type", "application/json")
        .body(r#"{"rows": [1]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("instances"));
}

#[tokio::test]
async fn custom_routes_are_honoured() {
    let base = loaded_identity("/v1/models/m:predict", "/v1/models/m").await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/v1/models/m")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/v1/models/m:predict"))
        .header("content-type", "application/json")
        .body(r#"{"instances":["a"]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn load_failure_leaves_server_unloaded() {
    let server = ModelServer::new(config("/predict", "/health"));
    let err = server
        .load(FailingLoad, &LoadOptions::default(), DefaultHandler::new)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::Config(_)));
    assert!(!server.is_loaded());
}

#[tokio::test]
async fn second_load_is_rejected() {
    let server = ModelServer::new(config("/predict", "/health"));
    server
        .load(Identity::default(), &LoadOptions::default(), DefaultHandler::new)
        .await
        .unwrap();
    let again = server
        .load(Identity::default(), &LoadOptions::default(), DefaultHandler::new)
        .await;
    assert!(again.is_err());
}

#[tokio::test]
async fn load_without_allow_list_warns_exactly_once() {
    let sink = Arc::new(CollectedWarnings::default());
    let opts = LoadOptions::default().with_warnings(sink.clone());
    let server = ModelServer::new(config("/predict", "/health"));

    server
        .load(Identity::default(), &opts, DefaultHandler::new)
        .await
        .unwrap();
    assert_eq!(sink.snapshot(), vec![SecurityWarning::Unrestricted]);

    let restricted_sink = Arc::new(CollectedWarnings::default());
    let restricted = LoadOptions::default()
        .with_warnings(restricted_sink.clone())
        .with_allowed_extensions(["json"]);
    ModelServer::new(config("/predict", "/health"))
        .load(Identity::default(), &restricted, DefaultHandler::new)
        .await
        .unwrap();
    assert!(restricted_sink.snapshot().is_empty());
}

#[tokio::test]
async fn failed_unrestricted_load_still_warns() {
    let sink = Arc::new(CollectedWarnings::default());
    let opts = LoadOptions::default().with_warnings(sink.clone());
    let server = ModelServer::new(config("/predict", "/health"));

    let res = server.load(FailingLoad, &opts, DefaultHandler::new).await;
    assert!(res.is_err());
    assert!(!server.is_loaded());
    assert_eq!(sink.snapshot(), vec![SecurityWarning::Unrestricted]);
}
