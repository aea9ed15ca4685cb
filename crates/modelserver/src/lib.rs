//! In-process model server for Custom Prediction Routines.
//!
//! A user [`Predictor`] is loaded once, bound to a [`Handler`] and served over
//! HTTP on the predict and health routes named by the `AIP_*` environment.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod handler;
pub mod launch;
pub mod predictor;
pub mod security;
pub mod serializer;
pub mod server;

pub use artifacts::*;
pub use config::*;
pub use error::*;
pub use handler::*;
pub use launch::{launch, run};
pub use predictor::*;
pub use security::*;
pub use serializer::*;
pub use server::*;
