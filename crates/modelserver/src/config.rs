use std::net::{Ipv4Addr, SocketAddr};

use crate::error::{Result, ServerError};

pub const AIP_HTTP_PORT: &str = "AIP_HTTP_PORT";
pub const AIP_HEALTH_ROUTE: &str = "AIP_HEALTH_ROUTE";
pub const AIP_PREDICT_ROUTE: &str = "AIP_PREDICT_ROUTE";
pub const AIP_STORAGE_URI: &str = "AIP_STORAGE_URI";
/// Application-default-credentials variable.
pub const ADC_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Environment variables with this prefix are reserved for the serving contract.
pub const RESERVED_ENV_PREFIX: &str = "AIP_";

pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_PREDICT_ROUTE: &str = "/predict";
pub const DEFAULT_HEALTH_ROUTE: &str = "/health";

/// Serving configuration, read once from the environment at process start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub http_port: u16,
    pub health_route: String,
    pub predict_route: String,
    /// Empty when no artifact was supplied.
    pub storage_uri: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Result<String> {
            lookup(key).ok_or_else(|| ServerError::config(format!("Missing required env var: {key}")))
        };

        let raw_port = get(AIP_HTTP_PORT)?;
        let health_route = get(AIP_HEALTH_ROUTE)?;
        let predict_route = get(AIP_PREDICT_ROUTE)?;
        let storage_uri = lookup(AIP_STORAGE_URI).unwrap_or_default();

        let http_port: u16 = raw_port.trim().parse().map_err(|_| {
            ServerError::config(format!("{AIP_HTTP_PORT} must be a TCP port number, got {raw_port:?}"))
        })?;

        validate_routes(&predict_route, &health_route)?;

        Ok(Self {
            http_port,
            health_route,
            predict_route,
            storage_uri,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.http_port))
    }
}

/// Routes must be absolute HTTP paths and must differ.
pub fn validate_routes(predict_route: &str, health_route: &str) -> Result<()> {
    for (name, route) in [(AIP_PREDICT_ROUTE, predict_route), (AIP_HEALTH_ROUTE, health_route)] {
        if !route.starts_with('/') {
            return Err(ServerError::config(format!(
                "{name} must be an absolute path starting with '/', got {route:?}"
            )));
        }
    }
    if predict_route == health_route {
        return Err(ServerError::config(format!(
            "predict and health routes must differ (both are {predict_route:?})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn reads_all_variables() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            (AIP_HTTP_PORT, "8081"),
            (AIP_HEALTH_ROUTE, "/ping"),
            (AIP_PREDICT_ROUTE, "/infer"),
            (AIP_STORAGE_URI, "gs://bucket/model"),
        ]))
        .unwrap();
        assert_eq!(cfg.http_port, 8081);
        assert_eq!(cfg.health_route, "/ping");
        assert_eq!(cfg.predict_route, "/infer");
        assert_eq!(cfg.storage_uri, "gs://bucket/model");
        assert_eq!(cfg.bind_addr().to_string(), "0.0.0.0:8081");
    }

    #[test]
    fn storage_uri_defaults_to_empty() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            (AIP_HTTP_PORT, "8080"),
            (AIP_HEALTH_ROUTE, "/health"),
            (AIP_PREDICT_ROUTE, "/predict"),
        ]))
        .unwrap();
        assert_eq!(cfg.storage_uri, "");
    }

    #[test]
    fn each_missing_required_var_is_named() {
        let all = [
            (AIP_HTTP_PORT, "8080"),
            (AIP_HEALTH_ROUTE, "/health"),
            (AIP_PREDICT_ROUTE, "/predict"),
        ];
        for skip in 0..all.len() {
            let pairs: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, p)| *p)
                .collect();
            let err = ServerConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, ServerError::Config(_)));
            assert!(err.to_string().contains(all[skip].0), "{err}");
        }
    }

    #[test]
    fn rejects_bad_port_and_routes() {
        let err = ServerConfig::from_lookup(lookup(&[
            (AIP_HTTP_PORT, "http"),
            (AIP_HEALTH_ROUTE, "/health"),
            (AIP_PREDICT_ROUTE, "/predict"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(AIP_HTTP_PORT));

        assert!(validate_routes("predict", "/health").is_err());
        assert!(validate_routes("/same", "/same").is_err());
        assert!(validate_routes("/predict", "/health").is_ok());
    }
}
