use serde_json::Value;

use crate::error::{Result, ServerError};

pub const APPLICATION_JSON: &str = "application/json";

const MAX_ECHOED_INPUT: usize = 256;

/// Converts request bytes to prediction input and prediction output back to bytes.
pub trait Serializer: Send + Sync + 'static {
    fn supported_media_types(&self) -> &[&'static str];

    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Result<Value>;

    /// Encodes `value` for `accept`. Returns the bytes and the media type written.
    fn serialize(&self, value: &Value, accept: Option<&str>) -> Result<(Vec<u8>, String)>;
}

/// Accepts and emits `application/json` only.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    fn unsupported(&self, what: &str, media_type: &str) -> ServerError {
        ServerError::BadRequest {
            message: format!("Unsupported {what} {media_type:?}: unsupported media type"),
            supported: self.supported(),
        }
    }

    fn supported(&self) -> Vec<String> {
        self.supported_media_types().iter().map(|s| s.to_string()).collect()
    }
}

impl Serializer for JsonSerializer {
    fn supported_media_types(&self) -> &[&'static str] {
        &[APPLICATION_JSON]
    }

    fn deserialize(&self, body: &[u8], content_type: Option<&str>) -> Result<Value> {
        let content_type = content_type.unwrap_or(APPLICATION_JSON);
        if essence(content_type) != APPLICATION_JSON {
            return Err(self.unsupported("content type", content_type));
        }

        serde_json::from_slice(body).map_err(|e| ServerError::BadRequest {
            message: format!(
                "JSON deserialization failed ({e}) for input: {}",
                echo(body)
            ),
            supported: self.supported(),
        })
    }

    fn serialize(&self, value: &Value, accept: Option<&str>) -> Result<(Vec<u8>, String)> {
        let media_type = match accept {
            None => APPLICATION_JSON.to_string(),
            Some(accept) => negotiate(accept, self.supported_media_types())
                .ok_or_else(|| self.unsupported("accept type", accept))?
                .to_string(),
        };

        let bytes = serde_json::to_vec(value).map_err(|e| ServerError::BadRequest {
            message: format!("JSON serialization failed: {e}"),
            supported: self.supported(),
        })?;
        Ok((bytes, media_type))
    }
}

/// `type/subtype` without parameters, lower-cased.
pub fn essence(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Picks the first supported media type an `Accept` header allows.
pub fn negotiate<'a>(accept: &str, supported: &[&'a str]) -> Option<&'a str> {
    for candidate in accept.split(',').map(essence) {
        if candidate.is_empty() {
            continue;
        }
        if candidate == "*/*" {
            return supported.first().copied();
        }
        if let Some(hit) = supported.iter().find(|s| **s == candidate) {
            return Some(*hit);
        }
        if let Some(major) = candidate.strip_suffix("/*") {
            if let Some(hit) = supported.iter().find(|s| s.split('/').next() == Some(major)) {
                return Some(*hit);
            }
        }
    }
    None
}

fn echo(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() > MAX_ECHOED_INPUT {
        let cut: String = text.chars().take(MAX_ECHOED_INPUT).collect();
        format!("{cut}...")
    } else {
        text.into_owned()
    }
}
