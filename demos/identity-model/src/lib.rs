//! Smallest possible custom prediction routine: returns its instances as
//! predictions.

use async_trait::async_trait;
use modelserver::{LoadOptions, Predictor, PredictorError, Result};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default)]
pub struct IdentityPredictor {
    artifact_uri: Option<String>,
}

#[async_trait]
impl Predictor for IdentityPredictor {
    async fn load(&mut self, artifact_uri: &str, _opts: &LoadOptions) -> Result<()> {
        if !artifact_uri.is_empty() {
            info!(artifact_uri, "identity model has no artifacts to fetch");
            self.artifact_uri = Some(artifact_uri.to_string());
        }
        // Marker line for log tailing.
        println!("ALIVE");
        Ok(())
    }

    async fn predict(&self, input: Value) -> std::result::Result<Value, PredictorError> {
        let instances = input
            .get("instances")
            .cloned()
            .ok_or_else(|| PredictorError::InvalidInput("request body must contain \"instances\"".into()))?;
        Ok(json!({ "predictions": instances }))
    }
}
