//! OCI distribution client for podroid.
//!
//! This crate talks to OCI/Docker v2 registries: it answers `401` bearer and
//! basic challenges, fetches manifests with the full multi-format `Accept`
//! header, resolves multi-platform indexes to the host architecture, and
//! streams blobs to disk while verifying their sha256 digests. Transient
//! failures are retried with bounded exponential backoff.

pub mod auth;
pub mod client;
pub mod config;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{RawManifest, RegistryClient, ResolvedManifest};
pub use config::{Credentials, RegistryConfig};

use podroid_schema::SchemaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[error("authentication failed for {registry}: {reason}")]
    Auth { registry: String, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl RegistryError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Network { .. } => true,
            RegistryError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
