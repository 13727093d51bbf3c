//! Registry pull: resolve the manifest, fetch config and layers, assemble the
//! rootfs in staging, and publish it to the image cache.

use crate::concurrency::{shutdown_requested, StoreLock};
use crate::CoreError;
use podroid_registry::RegistryClient;
use podroid_schema::{architectures_match, ImageConfig, ImageReference, ManifestResolver};
use podroid_store::{
    write_rootfs_archive, CacheEntry, ImageCache, ImageSource, PendingImage, RootfsBuilder,
    StoreLayout,
};
use std::fs;
use tracing::{debug, info, warn};

pub(crate) struct Puller<'a> {
    pub registry: &'a RegistryClient,
    pub resolver: &'a ManifestResolver,
    pub layout: &'a StoreLayout,
    pub cache: &'a ImageCache,
}

impl Puller<'_> {
    pub fn pull(&self, image: &str, progress: &dyn Fn(&str)) -> Result<CacheEntry, CoreError> {
        let reference = ImageReference::parse(image)?;
        progress(&format!("resolving {reference}"));
        let resolved = self.registry.resolve(&reference, self.resolver)?;
        let manifest = &resolved.manifest;
        info!(
            "pulling {reference}: manifest {}, {} layer(s)",
            resolved.digest.short(),
            manifest.layers.len()
        );

        let config_blob = self.registry.fetch_blob(&reference, &manifest.config.digest)?;
        let config = match ImageConfig::from_json(&config_blob) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("ignoring unreadable image config {}: {e}", manifest.config.digest);
                None
            }
        };
        if let Some(arch) = config.as_ref().and_then(|c| c.architecture.as_deref()) {
            if !architectures_match(arch, self.resolver.architecture()) {
                warn!(
                    "{reference} is built for {arch}, host is {}",
                    self.resolver.architecture()
                );
            }
        }

        self.layout.initialize()?;
        let work = tempfile::Builder::new()
            .prefix("pull-")
            .tempdir_in(self.layout.staging_dir())?;
        let mut builder = RootfsBuilder::new(work.path().join("rootfs"))?;

        let total = manifest.layers.len();
        for (i, layer) in manifest.layers.iter().enumerate() {
            if shutdown_requested() {
                return Err(CoreError::Interrupted);
            }
            progress(&format!(
                "layer {}/{total}: downloading {}",
                i + 1,
                layer.digest.short()
            ));
            let blob = work.path().join(format!("layer-{i}"));
            let size = self
                .registry
                .download_blob(&reference, &layer.digest, layer.size, &blob)?;
            debug!("layer {} ({size} bytes) downloaded", layer.digest.short());

            progress(&format!("layer {}/{total}: extracting", i + 1));
            builder.apply_layer_file(&blob, &layer.digest.to_string())?;
            fs::remove_file(&blob)?;
        }
        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }

        progress("packing rootfs");
        let staged = self.cache.staging_file()?;
        write_rootfs_archive(builder.root(), staged.as_file())?;

        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let entry = self.cache.publish(
            staged,
            PendingImage {
                image_url: image.to_owned(),
                content_hash: resolved.digest.hex().to_owned(),
                source: ImageSource::Registry,
                original_tar: None,
                config,
            },
        )?;
        Ok(entry)
    }
}
