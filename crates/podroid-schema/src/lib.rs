//! Image references, digests, manifests, and platform selection for podroid.
//!
//! This crate defines the schema layer shared by the registry client, the
//! image cache, and the engine: `ImageReference` parsing, validated
//! `Digest` values, parse-and-validate of OCI/Docker registry manifests into
//! a tagged `ManifestKind`, the multi-architecture `ManifestResolver`, and
//! the `manifest.json` record of Docker-save archives.

pub mod archive;
pub mod digest;
pub mod image_config;
pub mod manifest;
pub mod platform;
pub mod reference;
pub mod types;

pub use archive::{normalize_member_name, parse_archive_manifest, ArchiveImage};
pub use digest::Digest;
pub use image_config::{ContainerConfig, ImageConfig};
pub use manifest::{
    parse_manifest, Compression, Descriptor, ImageIndex, ImageManifest, ManifestKind, Platform,
    MANIFEST_ACCEPT,
};
pub use platform::{architectures_match, host_machine, normalize_architecture, ManifestResolver};
pub use reference::{ImageReference, Selector};
pub use types::{ContainerId, ShortId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid digest '{0}': expected sha256:<64 lowercase hex characters>")]
    InvalidDigest(String),
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("no image found for architecture '{requested}' in manifest list. Available architectures: {}", .available.join(", "))]
    ArchitectureMismatch {
        requested: String,
        available: Vec<String>,
    },
    #[error("invalid Docker image archive: {0}")]
    InvalidArchive(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_mismatch_lists_everything() {
        let e = SchemaError::ArchitectureMismatch {
            requested: "arm64".to_owned(),
            available: vec!["amd64".to_owned(), "s390x".to_owned()],
        };
        let msg = e.to_string();
        assert!(msg.contains("'arm64'"));
        assert!(msg.contains("amd64, s390x"));
    }

    #[test]
    fn invalid_archive_display() {
        let e = SchemaError::InvalidArchive("missing manifest.json".to_owned());
        assert_eq!(
            e.to_string(),
            "invalid Docker image archive: missing manifest.json"
        );
    }

    #[test]
    fn invalid_reference_display() {
        let e = SchemaError::InvalidReference {
            reference: "Bad Ref".to_owned(),
            reason: "whitespace".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Bad Ref"));
        assert!(msg.contains("whitespace"));
    }
}
