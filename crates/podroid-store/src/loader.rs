//! Import of `docker save` archives into the image cache.

use crate::cache::{CacheEntry, ImageCache, ImageSource, PendingImage};
use crate::layout::StoreLayout;
use crate::rootfs::RootfsBuilder;
use crate::StoreError;
use flate2::read::GzDecoder;
use podroid_schema::archive::ARCHIVE_MANIFEST;
use podroid_schema::{normalize_member_name, parse_archive_manifest, ArchiveImage, ImageConfig};
use sha2::{Digest as _, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

type ArchiveReader = tar::Archive<Box<dyn Read>>;

fn open_archive(path: &Path) -> Result<ArchiveReader, StoreError> {
    let mut reader = BufReader::new(File::open(path)?);
    let inner: Box<dyn Read> = if reader.fill_buf()?.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(tar::Archive::new(inner))
}

fn corrupt(e: &io::Error) -> StoreError {
    StoreError::InvalidArchive(format!("corrupt tar archive: {e}"))
}

fn member_name(entry: &tar::Entry<'_, Box<dyn Read>>) -> Result<String, StoreError> {
    let path = entry.path().map_err(|e| corrupt(&e))?;
    let name = path.to_string_lossy();
    Ok(normalize_member_name(name.trim_end_matches('/')).to_owned())
}

pub struct LocalImageLoader {
    cache: ImageCache,
}

impl LocalImageLoader {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            cache: ImageCache::new(layout),
        }
    }

    /// Check that `path` is a usable Docker-save archive.
    ///
    /// Requires `manifest.json`, its `Config` member, and every member listed
    /// in `Layers`.
    pub fn validate_structure(path: &Path) -> Result<ArchiveImage, StoreError> {
        let mut archive = open_archive(path).map_err(|e| match e {
            StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                StoreError::InvalidArchive(format!("{} does not exist", path.display()))
            }
            e => e,
        })?;
        let mut members = HashSet::new();
        let mut manifest = None;

        for entry in archive.entries().map_err(|e| corrupt(&e))? {
            let mut entry = entry.map_err(|e| corrupt(&e))?;
            let name = member_name(&entry)?;
            if name == ARCHIVE_MANIFEST {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(|e| corrupt(&e))?;
                manifest = Some(bytes);
            }
            members.insert(name);
        }

        let manifest = manifest.ok_or_else(|| {
            StoreError::InvalidArchive(format!("{ARCHIVE_MANIFEST} not found in archive"))
        })?;
        Ok(parse_archive_manifest(&manifest, &members)?)
    }

    /// Validate and copy an archive into the cache.
    ///
    /// The cache key is derived from the image name and the SHA-256 of the
    /// raw archive bytes, so loading the same file again refreshes the
    /// existing entry.
    pub fn load_image(&self, path: &Path) -> Result<CacheEntry, StoreError> {
        let image = Self::validate_structure(path)?;
        let image_url = image.image_name();
        debug!("importing {} as {image_url}", path.display());

        let mut staged = self.cache.staging_file()?;
        let mut src = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            staged.write_all(&buf[..n])?;
        }
        let content_hash = hex::encode(hasher.finalize());

        let config = match read_member(path, &image.config) {
            Ok(Some(bytes)) => match ImageConfig::from_json(&bytes) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    warn!("image config {} is not usable: {e}", image.config);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("failed to read image config {}: {e}", image.config);
                None
            }
        };

        let original_tar = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let entry = self.cache.publish(
            staged,
            PendingImage {
                image_url,
                content_hash,
                source: ImageSource::Local,
                original_tar: Some(original_tar),
                config,
            },
        )?;
        info!("loaded image {}", entry.image_url);
        Ok(entry)
    }

    /// Apply an archive's layers, in `Layers` order, onto `builder`.
    ///
    /// Layers that appear in the stream in order are applied directly.
    /// The rest, and any member `Layers` names more than once, are spooled
    /// to `staging_dir` until their last turn.
    pub fn materialize(
        archive_path: &Path,
        builder: &mut RootfsBuilder,
        staging_dir: &Path,
    ) -> Result<ArchiveImage, StoreError> {
        let image = Self::validate_structure(archive_path)?;
        let wanted: HashSet<&str> = image.layers.iter().map(String::as_str).collect();
        let mut spooled: HashMap<String, NamedTempFile> = HashMap::new();
        let mut next = 0;

        let mut archive = open_archive(archive_path)?;
        for entry in archive.entries().map_err(|e| corrupt(&e))? {
            let mut entry = entry.map_err(|e| corrupt(&e))?;
            let name = member_name(&entry)?;
            if !wanted.contains(name.as_str()) {
                continue;
            }

            let needed_later = image.layers.iter().skip(next + 1).any(|l| *l == name);
            if image.layers.get(next) == Some(&name) && !needed_later {
                builder.apply_layer(&mut entry, &layer_label(&image, next))?;
                next += 1;
            } else {
                let mut tmp = tempfile::Builder::new()
                    .prefix("layer-")
                    .tempfile_in(staging_dir)?;
                io::copy(&mut entry, &mut tmp)?;
                spooled.insert(name, tmp);
            }

            while let Some(layer) = image.layers.get(next) {
                let Some(tmp) = spooled.get_mut(layer) else {
                    break;
                };
                tmp.as_file_mut().rewind()?;
                builder.apply_layer(tmp.as_file(), &layer_label(&image, next))?;
                next += 1;
                if !image.layers[next..].contains(layer) {
                    spooled.remove(layer);
                }
            }
        }

        if next != image.layers.len() {
            return Err(StoreError::InvalidArchive(format!(
                "layer file '{}' could not be applied",
                image.layers[next]
            )));
        }
        Ok(image)
    }
}

fn layer_label(image: &ArchiveImage, index: usize) -> String {
    format!("{} ({}/{})", image.layers[index], index + 1, image.layers.len())
}

fn read_member(path: &Path, member: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let mut archive = open_archive(path)?;
    for entry in archive.entries().map_err(|e| corrupt(&e))? {
        let mut entry = entry.map_err(|e| corrupt(&e))?;
        if member_name(&entry)? == member {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(Some(bytes));
        }
    }
    Ok(None)
}
