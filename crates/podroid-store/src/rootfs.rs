//! Rootfs assembly from image layers.
//!
//! Layers are applied bottom to top into a directory the caller owns (a
//! staging directory in practice). Union-filesystem whiteouts are honoured:
//!
//! - `.wh.<name>` deletes `<name>` from lower layers and is never written.
//! - `.wh..wh..opq` hides everything lower layers put in its directory,
//!   while keeping what the current layer writes there, wherever the marker
//!   sits in the layer's tar stream.

use crate::StoreError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub struct RootfsBuilder {
    root: PathBuf,
    layers_applied: usize,
}

impl RootfsBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            layers_applied: 0,
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn layers_applied(&self) -> usize {
        self.layers_applied
    }

    pub fn apply_layer_file(&mut self, path: &Path, label: &str) -> Result<(), StoreError> {
        let file = File::open(path).map_err(|e| self.layer_error(label, &e))?;
        self.apply_layer(file, label)
    }

    /// Apply one layer, plain or gzip-compressed (detected by magic bytes).
    ///
    /// `label` identifies the layer in errors: a digest or a position.
    pub fn apply_layer<R: Read>(&mut self, reader: R, label: &str) -> Result<(), StoreError> {
        debug!("applying layer {label} onto {}", self.root.display());
        let mut reader = BufReader::new(reader);
        let gzip = reader
            .fill_buf()
            .map_err(|e| self.layer_error(label, &e))?
            .starts_with(&GZIP_MAGIC);

        let result = if gzip {
            self.apply_tar(GzDecoder::new(reader))
        } else {
            self.apply_tar(reader)
        };
        result.map_err(|e| self.layer_error(label, &e))?;

        self.layers_applied += 1;
        Ok(())
    }

    fn layer_error(&self, label: &str, e: &io::Error) -> StoreError {
        if e.kind() == io::ErrorKind::PermissionDenied {
            StoreError::Permission {
                path: self.root.clone(),
                reason: format!("layer {label}: {e}"),
            }
        } else {
            StoreError::Layer {
                layer: label.to_owned(),
                reason: e.to_string(),
            }
        }
    }

    fn apply_tar<R: Read>(&self, reader: R) -> io::Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(false);
        archive.set_overwrite(true);

        // Paths this layer has written, with their ancestors.
        let mut written: HashSet<PathBuf> = HashSet::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(rel) = normalize_entry_path(&entry.path()?) else {
                continue;
            };
            let file_name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

            if file_name == WHITEOUT_OPAQUE {
                if self.inside_root(&parent) && self.ensure_real_dir(&parent)? {
                    debug!("opaque directory /{}", parent.display());
                    self.clear_lower_entries(&parent, &written)?;
                }
                continue;
            }
            if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                let target = parent.join(target);
                if !written.contains(&target) && self.inside_root(&target) {
                    debug!("whiteout /{}", target.display());
                    remove_path(&self.root.join(&target))?;
                }
                continue;
            }

            let entry_type = entry.header().entry_type();
            if matches!(
                entry_type,
                tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo
            ) {
                debug!("skipping special file /{}", rel.display());
                continue;
            }

            let dest = self.root.join(&rel);
            if self.inside_root(&rel) {
                replace_existing(&dest, entry_type.is_dir())?;
            }
            if !entry.unpack_in(&self.root)? {
                warn!("refusing to extract {} outside the rootfs", rel.display());
                continue;
            }
            ensure_owner_access(&dest)?;
            mark_written(&mut written, &rel);
        }
        Ok(())
    }

    /// Make `root/dir` a real directory, replacing a lower-layer symlink or
    /// file of that name. False when nothing is there yet.
    fn ensure_real_dir(&self, dir: &Path) -> io::Result<bool> {
        let path = self.root.join(dir);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(true),
            Ok(_) => {
                debug!("replacing /{} with an opaque directory", dir.display());
                remove_path(&path)?;
                fs::create_dir(&path)?;
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove everything under `dir` that the current layer did not write.
    fn clear_lower_entries(&self, dir: &Path, written: &HashSet<PathBuf>) -> io::Result<()> {
        let read = match fs::read_dir(self.root.join(dir)) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for child in read {
            let child = child?;
            let rel = dir.join(child.file_name());
            if written.contains(&rel) {
                if child.file_type()?.is_dir() {
                    self.clear_lower_entries(&rel, written)?;
                }
            } else {
                remove_path(&child.path())?;
            }
        }
        Ok(())
    }

    /// True when no ancestor of `rel` below the root is a symlink, so
    /// operating on `root/rel` cannot leave the tree.
    fn inside_root(&self, rel: &Path) -> bool {
        let mut current = self.root.clone();
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => return false,
                Ok(_) => {}
                Err(_) => return true,
            }
        }
        true
    }
}

/// Reduce a member path to plain components. `None` for the root entry and
/// for anything climbing out with `..`.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn mark_written(written: &mut HashSet<PathBuf>, rel: &Path) {
    let mut current = Some(rel);
    while let Some(path) = current {
        if path.as_os_str().is_empty() || !written.insert(path.to_path_buf()) {
            break;
        }
        current = path.parent();
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Clear the way for a new entry: directories merge into directories,
/// anything else replaces whatever was there.
fn replace_existing(dest: &Path, entry_is_dir: bool) -> io::Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() && entry_is_dir => Ok(()),
        Ok(_) => remove_path(dest),
        Err(_) => Ok(()),
    }
}

/// Directories must stay `u+rwx` and files `u+r` for an unprivileged owner
/// to apply later layers and pack the tree.
fn ensure_owner_access(dest: &Path) -> io::Result<()> {
    let Ok(meta) = fs::symlink_metadata(dest) else {
        return Ok(());
    };
    let mode = meta.permissions().mode();
    let wanted = if meta.is_dir() {
        mode | 0o700
    } else if meta.is_file() {
        mode | 0o400
    } else {
        return Ok(());
    };
    if wanted != mode {
        fs::set_permissions(dest, fs::Permissions::from_mode(wanted))?;
    }
    Ok(())
}

/// Stream `source_dir` as a gzip tarball into `writer`.
///
/// Entries are sorted; symlinks are stored as links; ownership is recorded
/// as 0:0. Sockets and other special files are skipped.
pub fn write_rootfs_archive<W: Write>(source_dir: &Path, writer: W) -> Result<W, StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
    ar.follow_symlinks(false);

    for (rel_path, full_path) in &entries {
        let meta = match full_path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {rel_path}: metadata error: {e}");
                continue;
            }
        };
        let ft = meta.file_type();
        if ft.is_file() {
            let mut header = make_header(&meta, tar::EntryType::Regular);
            header.set_size(meta.len());
            ar.append_data(&mut header, rel_path, File::open(full_path)?)?;
        } else if ft.is_dir() {
            let mut header = make_header(&meta, tar::EntryType::Directory);
            header.set_size(0);
            ar.append_data(&mut header, format!("{rel_path}/"), io::empty())?;
        } else if ft.is_symlink() {
            let target = fs::read_link(full_path)?;
            let mut header = make_header(&meta, tar::EntryType::Symlink);
            header.set_size(0);
            ar.append_link(&mut header, rel_path, &target)?;
        } else {
            warn!("skipping unsupported file type: {rel_path}");
        }
    }

    Ok(ar.into_inner()?.finish()?)
}

/// Materialize a packed rootfs at `target`, going through `staging_dir` so
/// that `target` only ever appears complete.
pub fn unpack_rootfs(archive: &Path, target: &Path, staging_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(staging_dir)?;
    let tmp = tempfile::Builder::new()
        .prefix("rootfs-")
        .tempdir_in(staging_dir)?;

    let label = archive.display().to_string();
    let mut reader = BufReader::new(File::open(archive)?);
    let gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let unpacked = if gzip {
        unpack_all(GzDecoder::new(reader), tmp.path())
    } else {
        unpack_all(reader, tmp.path())
    };
    unpacked.map_err(|e| StoreError::Layer {
        layer: label,
        reason: e.to_string(),
    })?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_path(target)?;
    fs::rename(tmp.path(), target)?;
    Ok(())
}

fn unpack_all<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(true);
    ar.set_unpack_xattrs(false);
    ar.unpack(dest)
}

/// Recursively collect (relative_path, full_path) pairs from a directory tree.
fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .to_string();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            result.push((rel.clone(), full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

fn make_header(meta: &fs::Metadata, entry_type: tar::EntryType) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(meta.mtime().max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode() & 0o7777);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Item<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str, u32),
        Symlink(&'a str, &'a str),
        Char(&'a str),
    }

    fn layer(items: &[Item<'_>]) -> Vec<u8> {
        let mut b = tar::Builder::new(Vec::new());
        for item in items {
            let mut h = tar::Header::new_gnu();
            match item {
                Item::File(path, data) => {
                    h.set_entry_type(tar::EntryType::Regular);
                    h.set_size(data.len() as u64);
                    h.set_mode(0o644);
                    b.append_data(&mut h, path, *data).unwrap();
                }
                Item::Dir(path, mode) => {
                    h.set_entry_type(tar::EntryType::Directory);
                    h.set_size(0);
                    h.set_mode(*mode);
                    b.append_data(&mut h, path, io::empty()).unwrap();
                }
                Item::Symlink(path, target) => {
                    h.set_entry_type(tar::EntryType::Symlink);
                    h.set_size(0);
                    h.set_mode(0o777);
                    b.append_link(&mut h, path, target).unwrap();
                }
                Item::Char(path) => {
                    h.set_entry_type(tar::EntryType::Char);
                    h.set_size(0);
                    h.set_mode(0o666);
                    b.append_data(&mut h, path, io::empty()).unwrap();
                }
            }
        }
        b.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn build(layers: &[Vec<u8>]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rootfs");
        let mut builder = RootfsBuilder::new(&root).unwrap();
        for (i, data) in layers.iter().enumerate() {
            builder.apply_layer(data.as_slice(), &format!("#{i}")).unwrap();
        }
        assert_eq!(builder.layers_applied(), layers.len());
        (dir, root)
    }

    #[test]
    fn whiteout_removes_lower_file() {
        let l1 = layer(&[
            Item::File("foo.txt", b"foo"),
            Item::File("bar.txt", b"bar"),
        ]);
        let l2 = layer(&[Item::File(".wh.foo.txt", b"")]);
        let (_dir, root) = build(&[l1, l2]);

        assert!(!root.join("foo.txt").exists());
        assert!(!root.join(".wh.foo.txt").exists());
        assert_eq!(fs::read(root.join("bar.txt")).unwrap(), b"bar");
    }

    #[test]
    fn whiteout_removes_lower_directory_recursively() {
        let l1 = layer(&[
            Item::Dir("etc/", 0o755),
            Item::Dir("etc/conf.d/", 0o755),
            Item::File("etc/conf.d/a", b"a"),
        ]);
        let l2 = layer(&[Item::File("etc/.wh.conf.d", b"")]);
        let (_dir, root) = build(&[l1, l2]);
        assert!(root.join("etc").is_dir());
        assert!(!root.join("etc/conf.d").exists());
    }

    #[test]
    fn opaque_marker_after_entries_keeps_current_layer() {
        let l1 = layer(&[
            Item::Dir("d/", 0o755),
            Item::File("d/old", b"old"),
            Item::Dir("d/sub/", 0o755),
            Item::File("d/sub/old", b"old"),
        ]);
        let l2 = layer(&[
            Item::File("d/new", b"new"),
            Item::File("d/sub/new", b"new"),
            Item::File("d/.wh..wh..opq", b""),
        ]);
        let (_dir, root) = build(&[l1, l2]);

        assert!(!root.join("d/old").exists());
        assert!(!root.join("d/sub/old").exists());
        assert_eq!(fs::read(root.join("d/new")).unwrap(), b"new");
        assert_eq!(fs::read(root.join("d/sub/new")).unwrap(), b"new");
        assert!(!root.join("d/.wh..wh..opq").exists());
    }

    #[test]
    fn opaque_marker_first_clears_then_writes() {
        let l1 = layer(&[Item::File("d/old", b"old")]);
        let l2 = layer(&[Item::File("d/.wh..wh..opq", b""), Item::File("d/new", b"new")]);
        let (_dir, root) = build(&[l1, l2]);
        assert!(!root.join("d/old").exists());
        assert!(root.join("d/new").exists());
    }

    #[test]
    fn gzip_layers_are_detected() {
        let l1 = gzip(&layer(&[Item::File("a.txt", b"zipped")]));
        let l2 = layer(&[Item::File("b.txt", b"plain")]);
        let (_dir, root) = build(&[l1, l2]);
        assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"zipped");
        assert_eq!(fs::read(root.join("b.txt")).unwrap(), b"plain");
    }

    #[test]
    fn upper_layer_overwrites_and_changes_kind() {
        let l1 = layer(&[
            Item::File("x", b"file"),
            Item::Dir("y/", 0o755),
            Item::File("y/inner", b"i"),
            Item::File("z", b"one"),
        ]);
        let l2 = layer(&[
            Item::Dir("x/", 0o755),
            Item::File("y", b"now a file"),
            Item::File("z", b"two"),
        ]);
        let (_dir, root) = build(&[l1, l2]);
        assert!(root.join("x").is_dir());
        assert_eq!(fs::read(root.join("y")).unwrap(), b"now a file");
        assert_eq!(fs::read(root.join("z")).unwrap(), b"two");
    }

    #[test]
    fn special_files_are_skipped() {
        let l1 = layer(&[Item::Char("dev/null"), Item::File("ok", b"1")]);
        let (_dir, root) = build(&[l1]);
        assert!(!root.join("dev/null").exists());
        assert!(root.join("ok").exists());
    }

    #[test]
    fn read_only_directories_stay_writable_for_owner() {
        let l1 = layer(&[Item::Dir("ro/", 0o555), Item::File("ro/a", b"a")]);
        let l2 = layer(&[Item::File("ro/b", b"b")]);
        let (_dir, root) = build(&[l1, l2]);
        let mode = fs::metadata(root.join("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o700, 0o700);
        assert!(root.join("ro/b").exists());
    }

    #[test]
    fn symlinks_survive_and_are_not_followed_by_whiteouts() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("victim"), b"keep").unwrap();
        let target = outside.path().to_str().unwrap().to_owned();

        let l1 = layer(&[Item::Symlink("escape", &target), Item::Symlink("sh", "busybox")]);
        let l2 = layer(&[Item::File("escape/.wh.victim", b"")]);
        let (_dir, root) = build(&[l1, l2]);

        assert!(outside.path().join("victim").exists());
        assert_eq!(fs::read_link(root.join("sh")).unwrap(), Path::new("busybox"));
    }

    #[test]
    fn opaque_marker_under_symlink_stays_in_rootfs() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("victim"), b"keep").unwrap();
        let target = outside.path().to_str().unwrap().to_owned();

        let l1 = layer(&[Item::Symlink("d", &target)]);
        let l2 = layer(&[Item::File("d/.wh..wh..opq", b"")]);
        let (_dir, root) = build(&[l1, l2]);

        assert_eq!(fs::read(outside.path().join("victim")).unwrap(), b"keep");
        let meta = fs::symlink_metadata(root.join("d")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(fs::read_dir(root.join("d")).unwrap().count(), 0);
    }

    #[test]
    fn parent_traversal_is_refused() {
        let mut b = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_old();
        let name = b"../evil.txt";
        h.as_old_mut().name[..name.len()].copy_from_slice(name);
        h.set_entry_type(tar::EntryType::Regular);
        h.set_size(4);
        h.set_mode(0o644);
        h.set_cksum();
        b.append(&h, &b"evil"[..]).unwrap();
        let data = b.into_inner().unwrap();

        let (dir, root) = build(&[data]);
        assert!(!dir.path().join("evil.txt").exists());
        assert!(root.is_dir());
    }

    #[test]
    fn corrupt_layer_names_the_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = RootfsBuilder::new(dir.path().join("r")).unwrap();
        // Valid gzip header, then a deflate block with the reserved type.
        let mut data = vec![0x1f, 0x8b, 0x08, 0x00];
        data.extend([0xffu8; 64]);
        let err = builder
            .apply_layer(data.as_slice(), "sha256:deadbeef")
            .unwrap_err();
        assert!(err.to_string().contains("sha256:deadbeef"), "{err}");
        assert_eq!(builder.layers_applied(), 0);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("hello.txt"), "hello world").unwrap();
        fs::create_dir_all(src.path().join("subdir/empty")).unwrap();
        fs::write(src.path().join("subdir/nested.txt"), "nested").unwrap();
        std::os::unix::fs::symlink("hello.txt", src.path().join("link")).unwrap();

        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("image.tar.gz");
        write_rootfs_archive(src.path(), File::create(&archive).unwrap()).unwrap();

        let mut magic = [0u8; 2];
        File::open(&archive).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(magic, GZIP_MAGIC);

        let target = work.path().join("containers/c1/rootfs");
        unpack_rootfs(&archive, &target, &work.path().join("staging")).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("hello.txt")).unwrap(),
            "hello world"
        );
        assert_eq!(
            fs::read_to_string(target.join("subdir/nested.txt")).unwrap(),
            "nested"
        );
        assert!(target.join("subdir/empty").is_dir());
        assert_eq!(fs::read_link(target.join("link")).unwrap(), Path::new("hello.txt"));
        assert_eq!(fs::read_dir(work.path().join("staging")).unwrap().count(), 0);
    }
}
