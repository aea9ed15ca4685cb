use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use crate::error::Result;
use crate::predictor::Predictor;
use crate::serializer::{JsonSerializer, Serializer};

/// One inbound predict call.
#[derive(Clone, Debug)]
pub struct PredictionRequest {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub accept: Option<String>,
    pub headers: HeaderMap,
}

impl PredictionRequest {
    pub fn new(headers: HeaderMap, body: Bytes) -> Self {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            content_type: text(header::CONTENT_TYPE),
            accept: text(header::ACCEPT),
            body,
            headers,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PredictionResponse {
    pub body: Vec<u8>,
    pub media_type: String,
    pub status: StatusCode,
}

impl IntoResponse for PredictionResponse {
    fn into_response(self) -> Response {
        let content_type = HeaderValue::from_str(&self.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static(crate::serializer::APPLICATION_JSON));
        (self.status, [(header::CONTENT_TYPE, content_type)], self.body).into_response()
    }
}

/// Turns a request into a response. Errors become 4xx/5xx on the wire.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: PredictionRequest) -> Result<PredictionResponse>;
}

/// Deserialize, preprocess, predict, postprocess, serialize.
pub struct DefaultHandler<P, S = JsonSerializer> {
    predictor: Arc<P>,
    serializer: S,
}

impl<P: Predictor> DefaultHandler<P, JsonSerializer> {
    pub fn new(predictor: Arc<P>) -> Self {
        Self::with_serializer(predictor, JsonSerializer)
    }
}

impl<P: Predictor, S: Serializer> DefaultHandler<P, S> {
    pub fn with_serializer(predictor: Arc<P>, serializer: S) -> Self {
        Self {
            predictor,
            serializer,
        }
    }

    pub fn predictor(&self) -> &Arc<P> {
        &self.predictor
    }
}

#[async_trait]
impl<P: Predictor, S: Serializer> Handler for DefaultHandler<P, S> {
    async fn handle(&self, req: PredictionRequest) -> Result<PredictionResponse> {
        let input = self
            .serializer
            .deserialize(&req.body, req.content_type.as_deref())?;

        let mid = self.predictor.preprocess(input).await?;
        let out = self.predictor.predict(mid).await?;
        let output = self.predictor.postprocess(out).await?;

        let (body, media_type) = self.serializer.serialize(&output, req.accept.as_deref())?;
        Ok(PredictionResponse {
            body,
            media_type,
            status: StatusCode::OK,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use crate::predictor::{LoadOptions, PredictorError};
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Predictor for Echo {
        async fn load(&mut self, _uri: &str, _opts: &LoadOptions) -> Result<()> {
            Ok(())
        }

        async fn predict(&self, instances: Value) -> std::result::Result<Value, PredictorError> {
            Ok(instances)
        }
    }

    struct Exploding;

    #[async_trait]
    impl Predictor for Exploding {
        async fn load(&mut self, _uri: &str, _opts: &LoadOptions) -> Result<()> {
            Ok(())
        }

        async fn predict(&self, _instances: Value) -> std::result::Result<Value, PredictorError> {
            Err(PredictorError::Failed("matrix is singular".into()))
        }
    }

    fn request(content_type: &str, accept: Option<&str>, body: &'static [u8]) -> PredictionRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        if let Some(a) = accept {
            headers.insert(header::ACCEPT, HeaderValue::from_str(a).unwrap());
        }
        PredictionRequest::new(headers, Bytes::from_static(body))
    }

    #[tokio::test]
    async fn identity_pipeline_reproduces_input() {
        let handler = DefaultHandler::new(Arc::new(Echo));
        let resp = handler
            .handle(request("application/json", Some("application/json"), br#"{"instances": [[1, 2, 3]]}"#))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.media_type, "application/json");
        let v: Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(v, json!({"instances": [[1, 2, 3]]}));
    }

    #[tokio::test]
    async fn unsupported_content_type_is_bad_request() {
        let handler = DefaultHandler::new(Arc::new(Echo));
        let err = handler.handle(request("text/csv", None, b"1,2,3")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_accept_is_bad_request() {
        let handler = DefaultHandler::new(Arc::new(Echo));
        let err = handler
            .handle(request("application/json", Some("text/csv"), b"[1]"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn predictor_failure_is_server_error() {
        let handler = DefaultHandler::new(Arc::new(Exploding));
        let err = handler
            .handle(request("application/json", None, b"[1]"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Predictor(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("matrix is singular"));
    }
}
