//! Core engine for podroid.
//!
//! This crate ties the registry client, the image cache, the container state
//! store, and the proot runtime together into the `Engine`: the API behind
//! every CLI command. It also holds the container lifecycle state machine,
//! the `config.toml` settings, and the interrupt flag checked between
//! long-running steps.

pub mod concurrency;
pub mod config;
pub mod engine;
pub mod lifecycle;
mod pull;

pub use concurrency::{install_signal_handler, shutdown_requested, StoreLock};
pub use config::{RuntimeSettings, Settings};
pub use engine::Engine;
pub use lifecycle::validate_transition;

use podroid_registry::RegistryError;
use podroid_runtime::RuntimeError;
use podroid_schema::SchemaError;
use podroid_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("image error: {0}")]
    Image(#[from] SchemaError),
    #[error("image error: {0}")]
    ImageStore(StoreError),
    #[error("registry error: {0}")]
    Registry(RegistryError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("container {0} is running; stop it first or use --force")]
    ContainerRunning(String),
    #[error("rootfs of container {0} is missing; remove and recreate it")]
    RootfsMissing(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("interrupted")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Archive and lookup failures are about the image the operator named, not
// the store itself, and report as image errors.
impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Schema(inner) => Self::Image(inner),
            e @ (StoreError::InvalidArchive(_)
            | StoreError::Layer { .. }
            | StoreError::ImageNotFound(_)) => Self::ImageStore(e),
            e => Self::Store(e),
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Schema(inner) => Self::Image(inner),
            e => Self::Registry(e),
        }
    }
}
