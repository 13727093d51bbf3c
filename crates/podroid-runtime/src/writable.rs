//! Host-writable stand-ins for image paths the container must write to.
//!
//! On restricted hosts some paths of an extracted rootfs cannot be written by
//! the emulated root (package manager state, caches, logs, temp dirs). Each
//! such path gets a directory under `<container>/writable/`, seeded once from
//! the image's copy, and bound over the original.

use crate::launch::BindMount;
use crate::RuntimeError;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_WRITABLE_DIRS: &[&str] = &[
    "/tmp",
    "/var/tmp",
    "/var/cache",
    "/var/log",
    "/var/lib/apt/lists",
    "/var/lib/dpkg",
    "/var/cache/apk",
    "/run",
];

fn permission_error(path: &Path, e: &io::Error) -> RuntimeError {
    RuntimeError::Permission {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Create (and on first use, seed) one writable directory per entry of
/// `dirs`, returning the bind mounts to apply.
pub fn prepare_writable_dirs(
    rootfs: &Path,
    writable_root: &Path,
    dirs: &[String],
) -> Result<Vec<BindMount>, RuntimeError> {
    let mut binds = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let Some(rel) = relative_container_path(dir) else {
            warn!("ignoring writable directory '{dir}': not a plain absolute path");
            continue;
        };
        let host = writable_root.join(&rel);
        if !host.is_dir() {
            create_seeded(rootfs, &rel, &host).map_err(|e| permission_error(&host, &e))?;
        }
        binds.push(BindMount::new(host, Path::new("/").join(&rel)));
    }
    Ok(binds)
}

/// Build `host` beside its final location and rename it into place, so an
/// interrupted seed never leaves a half-filled directory behind.
fn create_seeded(rootfs: &Path, rel: &Path, host: &Path) -> io::Result<()> {
    let parent = host.parent().unwrap_or(host);
    fs::create_dir_all(parent)?;
    let staged = tempfile::Builder::new()
        .prefix(".seed-")
        .tempdir_in(parent)?;
    if let Some(image_copy) = real_dir_in_rootfs(rootfs, rel) {
        debug!("seeding {} from image", host.display());
        seed(&image_copy, staged.path())?;
    }
    fs::rename(staged.path(), host)
}

fn relative_container_path(dir: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(dir).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(c) => rel.push(c),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    (!rel.as_os_str().is_empty()).then_some(rel)
}

/// `rootfs/rel` when it and every ancestor below the rootfs are real
/// directories. Symlinks inside an image point into the container's view of
/// the filesystem and must not be followed on the host.
fn real_dir_in_rootfs(rootfs: &Path, rel: &Path) -> Option<PathBuf> {
    let mut current = rootfs.to_path_buf();
    for component in rel.components() {
        current.push(component);
        let meta = fs::symlink_metadata(&current).ok()?;
        if !meta.is_dir() {
            return None;
        }
    }
    Some(current)
}

fn seed(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ft = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            seed(&entry.path(), &target)?;
        } else if ft.is_symlink() {
            match std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        } else if ft.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
