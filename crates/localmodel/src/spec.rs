use std::collections::BTreeMap;

use modelserver::{DEFAULT_HEALTH_ROUTE, DEFAULT_HTTP_PORT, DEFAULT_PREDICT_ROUTE};
use serde::Serialize;

use crate::error::{LocalModelError, Result};

/// How the managed platform drives a serving container: image plus the HTTP
/// route and port contract. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    image_uri: String,
    predict_route: String,
    health_route: String,
    command: Vec<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    ports: Vec<u16>,
}

impl ContainerSpec {
    /// Spec with the default routes and port.
    pub fn new(image_uri: impl Into<String>) -> Result<Self> {
        Self::builder(image_uri).build()
    }

    pub fn builder(image_uri: impl Into<String>) -> ContainerSpecBuilder {
        ContainerSpecBuilder {
            image_uri: image_uri.into(),
            predict_route: DEFAULT_PREDICT_ROUTE.to_string(),
            health_route: DEFAULT_HEALTH_ROUTE.to_string(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
        }
    }

    pub fn image_uri(&self) -> &str {
        &self.image_uri
    }

    pub fn predict_route(&self) -> &str {
        &self.predict_route
    }

    pub fn health_route(&self) -> &str {
        &self.health_route
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// The port the server binds inside the container (`AIP_HTTP_PORT`).
    pub fn serving_port(&self) -> u16 {
        self.ports.first().copied().unwrap_or(DEFAULT_HTTP_PORT)
    }
}

#[derive(Clone, Debug)]
pub struct ContainerSpecBuilder {
    image_uri: String,
    predict_route: String,
    health_route: String,
    command: Vec<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    ports: Vec<u16>,
}

impl ContainerSpecBuilder {
    pub fn predict_route(mut self, route: impl Into<String>) -> Self {
        self.predict_route = route.into();
        self
    }

    pub fn health_route(mut self, route: impl Into<String>) -> Self {
        self.health_route = route.into();
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn build(self) -> Result<ContainerSpec> {
        if self.image_uri.trim().is_empty() {
            return Err(LocalModelError::config("container image URI must not be empty"));
        }
        modelserver::validate_routes(&self.predict_route, &self.health_route)
            .map_err(|e| LocalModelError::config(e.to_string()))?;

        let ports = if self.ports.is_empty() {
            vec![DEFAULT_HTTP_PORT]
        } else {
            self.ports
        };
        if ports.contains(&0) {
            return Err(LocalModelError::config("container ports must be non-zero"));
        }

        Ok(ContainerSpec {
            image_uri: self.image_uri,
            predict_route: self.predict_route,
            health_route: self.health_route,
            command: self.command,
            args: self.args,
            env: self.env,
            ports,
        })
    }
}
