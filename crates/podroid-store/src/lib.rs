//! On-disk state for podroid: image cache, rootfs assembly, container records.
//!
//! This crate provides the storage layer: `StoreLayout` for the directory
//! structure, `RootfsBuilder` for applying image layers with whiteout
//! semantics, `ImageCache` for the content-keyed `.tar.gz` cache and its
//! `.info` sidecars, `LocalImageLoader` for importing `docker save`
//! archives, and `ContainerStore` for the lock-guarded `containers.json`.

pub mod cache;
pub mod containers;
pub mod layout;
pub mod loader;
pub mod lock;
pub mod rootfs;

pub use cache::{
    cache_key, sanitize_image_name, CacheEntry, ImageCache, ImageSource, PendingImage,
};
pub use containers::{
    validate_container_name, Container, ContainerStatus, ContainerStore, RunArgs,
};
pub use layout::StoreLayout;
pub use loader::LocalImageLoader;
pub use lock::StoreLock;
pub use rootfs::{unpack_rootfs, write_rootfs_archive, RootfsBuilder};

use podroid_schema::SchemaError;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` through a synced temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid Docker image archive: {0}")]
    InvalidArchive(String),
    #[error("failed to extract layer {layer}: {reason}")]
    Layer { layer: String, reason: String },
    #[error("permission denied at {}: {reason}", .path.display())]
    Permission { path: PathBuf, reason: String },
    #[error("no such container: {0}")]
    ContainerNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container id prefix '{prefix}' is ambiguous ({matches} matches)")]
    AmbiguousId { prefix: String, matches: usize },
    #[error("invalid container name: {0}")]
    InvalidName(String),
    #[error("name '{name}' is already used by container {existing_id}")]
    NameConflict { name: String, existing_id: String },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
}
