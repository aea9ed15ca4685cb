//! Local Custom Prediction Routine pipeline.
//!
//! Builds a serving image from a user crate ([`ImageBuilder`]), runs it on the
//! host container engine ([`LocalEndpoint`]) and exercises the same predict and
//! health surface the managed endpoint exposes.

pub mod build;
pub mod catalog;
pub mod context;
pub mod credentials;
pub mod docker;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod logs;
pub mod model;
pub mod readiness;
pub mod spec;

pub use build::*;
pub use catalog::*;
pub use context::{SDK_CRATE, SDK_DIR};
pub use credentials::*;
pub use docker::DockerEngine;
pub use endpoint::*;
pub use engine::*;
pub use error::*;
pub use logs::LogCursor;
pub use model::*;
pub use readiness::ReadinessConfig;
pub use spec::*;
