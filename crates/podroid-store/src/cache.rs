use crate::layout::StoreLayout;
use crate::{fsync_dir, write_atomic, StoreError};
use chrono::{Local, Utc};
use podroid_schema::ImageConfig;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

const ARCHIVE_SUFFIX: &str = ".tar.gz";
const SIDECAR_SUFFIX: &str = ".info";
const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    Local,
    Registry,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Registry => f.write_str("registry"),
        }
    }
}

/// Sidecar record stored next to every cached archive as `<archive>.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub image_url: String,
    pub cache_path: PathBuf,
    #[serde(default)]
    pub content_hash: String,
    pub created_time: i64,
    pub created_time_str: String,
    pub source: ImageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_tar: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageConfig>,
}

impl CacheEntry {
    pub fn short_hash(&self) -> &str {
        &self.content_hash[..self.content_hash.len().min(12)]
    }
}

/// What a caller knows about an archive before it is published.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub image_url: String,
    pub content_hash: String,
    pub source: ImageSource,
    pub original_tar: Option<PathBuf>,
    pub config: Option<ImageConfig>,
}

/// Replace `:` and `/` with `_` and drop `<` and `>`.
pub fn sanitize_image_name(image_url: &str) -> String {
    image_url
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .map(|c| if c == ':' || c == '/' { '_' } else { c })
        .collect()
}

pub fn cache_key(image_url: &str, content_hash: &str) -> String {
    let prefix = &content_hash[..content_hash.len().min(HASH_PREFIX_LEN)];
    format!("{}_{prefix}", sanitize_image_name(image_url))
}

fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Content-keyed archive cache under `<store>/images/`.
pub struct ImageCache {
    layout: StoreLayout,
}

impl ImageCache {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    /// A temp file in the staging directory, deleted unless published.
    pub fn staging_file(&self) -> Result<NamedTempFile, StoreError> {
        let dir = self.layout.staging_dir();
        fs::create_dir_all(&dir)?;
        Ok(tempfile::Builder::new()
            .prefix("image-")
            .suffix(ARCHIVE_SUFFIX)
            .tempfile_in(dir)?)
    }

    /// Move a staged archive into the cache and write its sidecar.
    ///
    /// Publishing the same name and content again replaces the entry in
    /// place with a fresh timestamp. Entries for the same name under other
    /// keys are removed afterwards.
    pub fn publish(
        &self,
        staged: NamedTempFile,
        pending: PendingImage,
    ) -> Result<CacheEntry, StoreError> {
        let images_dir = self.layout.images_dir();
        fs::create_dir_all(&images_dir)?;

        let key = cache_key(&pending.image_url, &pending.content_hash);
        let cache_path = images_dir.join(format!("{key}{ARCHIVE_SUFFIX}"));

        staged.as_file().sync_all()?;
        staged
            .persist(&cache_path)
            .map_err(|e| StoreError::Io(e.error))?;

        let now = Utc::now();
        let entry = CacheEntry {
            image_url: pending.image_url,
            cache_path: cache_path.clone(),
            content_hash: pending.content_hash,
            created_time: now.timestamp(),
            created_time_str: now
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            source: pending.source,
            original_tar: pending.original_tar,
            config: pending.config,
        };
        write_atomic(
            &sidecar_path(&cache_path),
            &serde_json::to_vec_pretty(&entry)?,
        )?;
        fsync_dir(&images_dir)?;

        for stale in self.entries_for(&entry.image_url)? {
            if stale.cache_path != cache_path {
                debug!("dropping superseded cache entry {}", stale.cache_path.display());
                remove_entry_files(&stale.cache_path)?;
            }
        }

        info!("cached {} as {key}", entry.image_url);
        Ok(entry)
    }

    /// The newest entry recorded for `image_url`, if any.
    pub fn lookup(&self, image_url: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .entries_for(image_url)?
            .into_iter()
            .filter(|e| e.cache_path.is_file())
            .max_by_key(|e| e.created_time))
    }

    /// All readable entries, sorted by image name.
    pub fn list(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let dir = self.layout.images_dir();
        let read = match fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in read {
            let path = item?.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX));
            if !is_sidecar {
                continue;
            }
            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CacheEntry>(&bytes)?))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("skipping unreadable sidecar {}: {e}", path.display()),
            }
        }
        entries.sort_by(|a, b| {
            a.image_url
                .cmp(&b.image_url)
                .then(a.created_time.cmp(&b.created_time))
        });
        Ok(entries)
    }

    /// Delete every entry recorded for `image_url`. Returns how many were removed.
    pub fn remove(&self, image_url: &str) -> Result<usize, StoreError> {
        let entries = self.entries_for(image_url)?;
        if entries.is_empty() {
            return Err(StoreError::ImageNotFound(image_url.to_owned()));
        }
        for entry in &entries {
            remove_entry_files(&entry.cache_path)?;
        }
        fsync_dir(&self.layout.images_dir())?;
        info!("removed {} cache entr(ies) for {image_url}", entries.len());
        Ok(entries.len())
    }

    fn entries_for(&self, image_url: &str) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.image_url == image_url)
            .collect())
    }
}

fn remove_entry_files(archive: &Path) -> Result<(), StoreError> {
    for path in [archive.to_path_buf(), sidecar_path(archive)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
