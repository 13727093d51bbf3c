use crate::concurrency::StoreLock;
use crate::config::Settings;
use crate::lifecycle::validate_transition;
use crate::pull::Puller;
use crate::CoreError;
use chrono::Utc;
use podroid_registry::RegistryClient;
use podroid_runtime::{
    exit_code, is_alive, parse_env, prepare_writable_dirs, read_pid_file, remove_pid_file,
    select_runtime, terminate, BindMount, ContainerRuntime, LaunchConfig,
};
use podroid_schema::{ImageConfig, ManifestResolver};
use podroid_store::{
    unpack_rootfs, CacheEntry, Container, ContainerStatus, ContainerStore, ImageCache, ImageSource,
    LocalImageLoader, RootfsBuilder, RunArgs, StoreLayout,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The operations behind every podroid command.
///
/// Images live in the cache as packed rootfs archives (registry pulls) or as
/// the original `docker save` tarball (local imports). Each container gets
/// its own copy of the rootfs, a state record, and a directory for its PID
/// file, log, and writable binds.
pub struct Engine {
    layout: StoreLayout,
    settings: Settings,
    cache: ImageCache,
    loader: LocalImageLoader,
    containers: ContainerStore,
    registry: RegistryClient,
    resolver: ManifestResolver,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Engine {
    /// An engine for the store at `store_root`, configured from its
    /// `config.toml`.
    pub fn new(store_root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(store_root);
        let settings = Settings::load(&layout.config_file())?;
        Self::with_settings(layout.root(), settings)
    }

    pub fn with_settings(
        store_root: impl Into<PathBuf>,
        settings: Settings,
    ) -> Result<Self, CoreError> {
        let runtime = select_runtime(&settings.runtime.backend, &settings.runtime.proot)?;
        Ok(Self::with_runtime(store_root, settings, Arc::from(runtime)))
    }

    pub fn with_runtime(
        store_root: impl Into<PathBuf>,
        settings: Settings,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let layout = StoreLayout::new(store_root);
        Self {
            cache: ImageCache::new(&layout),
            loader: LocalImageLoader::new(&layout),
            containers: ContainerStore::new(&layout),
            registry: RegistryClient::new(settings.registry.clone()),
            resolver: ManifestResolver::for_host(),
            runtime,
            settings,
            layout,
        }
    }

    /// Select manifests for another architecture than the host's.
    #[must_use]
    pub fn with_resolver(mut self, resolver: ManifestResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    // Images

    /// Pull `image` from its registry into the cache, replacing any earlier
    /// pull of the same name.
    pub fn pull(&self, image: &str, progress: &dyn Fn(&str)) -> Result<CacheEntry, CoreError> {
        let puller = Puller {
            registry: &self.registry,
            resolver: &self.resolver,
            layout: &self.layout,
            cache: &self.cache,
        };
        puller.pull(image, progress)
    }

    /// Import a `docker save` archive.
    pub fn load(&self, archive: &Path) -> Result<CacheEntry, CoreError> {
        info!("loading image archive {}", archive.display());
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        Ok(self.loader.load_image(archive)?)
    }

    pub fn images(&self) -> Result<Vec<CacheEntry>, CoreError> {
        Ok(self.cache.list()?)
    }

    /// Drop `image` from the cache. Containers created from it keep their
    /// own rootfs.
    pub fn rmi(&self, image: &str) -> Result<usize, CoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let removed = self.cache.remove(image)?;
        info!("removed cached image {image}");
        Ok(removed)
    }

    fn ensure_image(&self, image: &str, progress: &dyn Fn(&str)) -> Result<CacheEntry, CoreError> {
        if let Some(entry) = self.cache.lookup(image)? {
            debug!("using cached {image} ({})", entry.short_hash());
            return Ok(entry);
        }
        info!("{image} is not cached, pulling");
        self.pull(image, progress)
    }

    // Containers

    /// Create a container from `image`, pulling it first when it is not
    /// cached, and give it its own rootfs.
    pub fn create(
        &self,
        image: &str,
        name: Option<&str>,
        run_args: RunArgs,
        progress: &dyn Fn(&str),
    ) -> Result<Container, CoreError> {
        for bind in &run_args.binds {
            BindMount::parse(bind)?;
        }
        if let Some(name) = name {
            self.containers.check_name(name)?;
        }
        self.layout.initialize()?;
        let entry = self.ensure_image(image, progress)?;
        let container = self.containers.create(name, image, run_args)?;

        progress("preparing rootfs");
        if let Err(e) = self.materialize(&entry, &container) {
            if let Err(cleanup) = self.containers.remove(container.id.as_str()) {
                warn!("failed to clean up container {}: {cleanup}", container.id.short());
            }
            return Err(e);
        }
        info!("created container {} from {image}", container.display_name());
        Ok(container)
    }

    fn materialize(&self, entry: &CacheEntry, container: &Container) -> Result<(), CoreError> {
        let rootfs = container.rootfs_dir();
        let staging = self.layout.staging_dir();
        match entry.source {
            ImageSource::Registry => unpack_rootfs(&entry.cache_path, &rootfs, &staging)?,
            ImageSource::Local => {
                fs::create_dir_all(&staging)?;
                let work = tempfile::Builder::new()
                    .prefix("rootfs-")
                    .tempdir_in(&staging)?;
                let mut builder = RootfsBuilder::new(work.path().join("rootfs"))?;
                LocalImageLoader::materialize(&entry.cache_path, &mut builder, &staging)?;
                fs::rename(builder.root(), &rootfs)?;
            }
        }
        Ok(())
    }

    /// Create and start. A foreground container has exited by the time this
    /// returns; its record carries the exit code.
    pub fn run(
        &self,
        image: &str,
        name: Option<&str>,
        run_args: RunArgs,
        progress: &dyn Fn(&str),
    ) -> Result<Container, CoreError> {
        let container = self.create(image, name, run_args, progress)?;
        self.launch(container)
    }

    pub fn start(&self, container: &str) -> Result<Container, CoreError> {
        let id = self.containers.resolve(container)?;
        let current = self.refresh(self.containers.get(&id)?)?;
        validate_transition(current.status, ContainerStatus::Running)?;
        self.launch(current)
    }

    /// Stop the container when it is running, then start it again.
    pub fn restart(&self, container: &str) -> Result<Container, CoreError> {
        let id = self.containers.resolve(container)?;
        let current = self.refresh(self.containers.get(&id)?)?;
        let current = if current.status == ContainerStatus::Running {
            self.stop(&id)?
        } else {
            current
        };
        validate_transition(current.status, ContainerStatus::Running)?;
        self.launch(current)
    }

    fn launch(&self, container: Container) -> Result<Container, CoreError> {
        let id = container.id.to_string();
        if !container.rootfs_dir().is_dir() {
            return Err(CoreError::RootfsMissing(container.display_name()));
        }
        let image_config = self
            .cache
            .lookup(&container.image)?
            .and_then(|e| e.config)
            .unwrap_or_default();
        let config = self.launch_config(&container, &image_config)?;

        let mut child = self.runtime.launch(&config)?;
        let pid = child.id();
        let recorded = self.containers.update(&id, |c| -> Result<(), CoreError> {
            validate_transition(c.status, ContainerStatus::Running)?;
            c.status = ContainerStatus::Running;
            c.pid = Some(pid);
            c.exit_code = None;
            c.started_at = Some(Utc::now());
            c.finished_at = None;
            Ok(())
        });
        let running = match recorded {
            Ok(c) => c,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = remove_pid_file(&config.pid_file());
                return Err(e);
            }
        };
        info!(
            "started container {} with {} (pid {pid})",
            running.display_name(),
            self.runtime.name()
        );

        if !config.detach {
            let status = child.wait()?;
            return self.record_exit(&running, exit_code(status));
        }

        std::thread::sleep(self.settings.runtime.startup_grace());
        if let Some(status) = child.try_wait()? {
            let code = exit_code(status);
            warn!(
                "container {} exited during startup with code {code}",
                running.display_name()
            );
            return self.record_exit(&running, code);
        }
        if read_pid_file(&config.pid_file()).is_none() {
            warn!("pid file {} is empty after launch", config.pid_file().display());
        }
        Ok(running)
    }

    fn launch_config(
        &self,
        container: &Container,
        image: &ImageConfig,
    ) -> Result<LaunchConfig, CoreError> {
        let args = &container.run_args;
        let rootfs = container.rootfs_dir();
        let mut config = LaunchConfig::new(&rootfs, &container.container_dir);

        config.command = if args.command.is_empty() {
            image.default_command()
        } else {
            args.command.clone()
        };
        config.env = parse_env(image.env());
        config.env.extend(parse_env(&args.env));
        config.workdir = args
            .workdir
            .clone()
            .or_else(|| image.working_dir().map(str::to_owned));
        config.fake_root = args.fake_root;
        config.detach = args.detach;

        config.binds = prepare_writable_dirs(
            &rootfs,
            &container.writable_dir(),
            &self.settings.runtime.writable_dirs,
        )?;
        for bind in &args.binds {
            config.binds.push(BindMount::parse(bind)?);
        }
        Ok(config)
    }

    fn record_exit(&self, container: &Container, code: i32) -> Result<Container, CoreError> {
        remove_pid_file(&container.pid_file())?;
        self.containers
            .update(container.id.as_str(), |c| -> Result<(), CoreError> {
                // A concurrent stop already settled the record.
                if c.status == ContainerStatus::Running {
                    c.status = ContainerStatus::Exited;
                    c.pid = None;
                    c.exit_code = Some(code);
                    c.finished_at = Some(Utc::now());
                }
                Ok(())
            })
    }

    /// SIGTERM, then SIGKILL after the configured timeout.
    pub fn stop(&self, container: &str) -> Result<Container, CoreError> {
        let id = self.containers.resolve(container)?;
        let current = self.refresh(self.containers.get(&id)?)?;
        validate_transition(current.status, ContainerStatus::Stopped)?;

        if let Some(pid) = current.pid {
            info!("stopping container {} (pid {pid})", current.display_name());
            terminate(
                pid,
                current.run_args.detach,
                self.settings.runtime.stop_timeout(),
            )?;
        }
        remove_pid_file(&current.pid_file())?;
        self.containers.update(&id, |c| -> Result<(), CoreError> {
            validate_transition(c.status, ContainerStatus::Stopped)?;
            c.status = ContainerStatus::Stopped;
            c.pid = None;
            c.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Delete a container's directory and record. A running container is
    /// refused unless `force`, which stops it first.
    pub fn rm(&self, container: &str, force: bool) -> Result<Container, CoreError> {
        let id = self.containers.resolve(container)?;
        let mut current = self.refresh(self.containers.get(&id)?)?;
        if current.status == ContainerStatus::Running {
            if !force {
                return Err(CoreError::ContainerRunning(current.display_name()));
            }
            current = self.stop(&id)?;
        }
        validate_transition(current.status, ContainerStatus::Removed)?;
        let removed = self.containers.remove(&id)?;
        info!("removed container {}", removed.display_name());
        Ok(removed)
    }

    /// Containers, oldest first. Running records whose process is gone are
    /// moved to `exited` on the way.
    pub fn ps(&self, all: bool) -> Result<Vec<Container>, CoreError> {
        let mut out = Vec::new();
        for container in self.containers.list()? {
            let container = self.refresh(container)?;
            if all || container.status == ContainerStatus::Running {
                out.push(container);
            }
        }
        Ok(out)
    }

    /// Output of a detached container. Empty when it never logged.
    pub fn logs(&self, container: &str) -> Result<String, CoreError> {
        let id = self.containers.resolve(container)?;
        let record = self.containers.get(&id)?;
        match fs::read(record.log_file()) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn inspect(&self, container: &str) -> Result<Container, CoreError> {
        let id = self.containers.resolve(container)?;
        self.refresh(self.containers.get(&id)?)
    }

    fn refresh(&self, container: Container) -> Result<Container, CoreError> {
        if container.status != ContainerStatus::Running || container.pid.is_some_and(is_alive) {
            return Ok(container);
        }
        debug!(
            "container {} is no longer running",
            container.display_name()
        );
        remove_pid_file(&container.pid_file())?;
        self.containers
            .update(container.id.as_str(), |c| -> Result<(), CoreError> {
                if c.status == ContainerStatus::Running {
                    validate_transition(c.status, ContainerStatus::Exited)?;
                    c.status = ContainerStatus::Exited;
                    c.pid = None;
                    c.finished_at = Some(Utc::now());
                }
                Ok(())
            })
    }
}
