use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of a podroid store.
///
/// ```text
/// <root>/
///   images/<key>.tar.gz, images/<key>.tar.gz.info
///   containers/<id>/{container.pid, container.log, rootfs/, writable/}
///   staging/
///   containers.json, containers.lock, .lock, config.toml
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    #[inline]
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    #[inline]
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.containers_dir().join(id)
    }

    /// Scratch space for downloads, layer spooling and rootfs builds.
    /// Lives on the same filesystem as the rest of the store so results
    /// can be renamed into place.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.root.join("containers.json")
    }

    #[inline]
    pub fn state_lock(&self) -> PathBuf {
        self.root.join("containers.lock")
    }

    /// Store-wide lock serializing image cache publication.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        for dir in [self.images_dir(), self.containers_dir(), self.staging_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    StoreError::Permission {
                        path: dir.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    StoreError::Io(e)
                }
            })?;
        }
        Ok(())
    }
}
