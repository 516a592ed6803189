//! Layer tarballs: creation, filesystem diffs and application.
//!
//! Layers are uncompressed tar archives written deterministically: entries
//! are sorted by path, timestamps are zero and ownership is numeric. The same
//! inputs therefore always hash to the same digest.
//!
//! Deletions are recorded as whiteout entries (`.wh.<name>`) next to the
//! removed path; `.wh..wh..opq` marks a directory whose lower contents are
//! hidden.

use crate::builder::context::normalize;
use crate::error::{Result, StrataError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Prefix marking a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout hiding everything below a directory in lower layers.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Numeric owner recorded in layer headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Owner {
    pub uid: u64,
    pub gid: u64,
}

/// A finished layer tarball, not yet moved to its final location.
#[derive(Debug)]
pub struct LayerBlob {
    pub file: NamedTempFile,
    /// `sha256:<hex>` of the tarball bytes
    pub digest: String,
    pub size: u64,
}

enum Content {
    Dir,
    File(PathBuf),
    Bytes(Vec<u8>),
    Symlink(PathBuf),
}

struct PendingEntry {
    content: Content,
    mode: u32,
    owner: Owner,
}

/// Collects entries and writes them as a deterministic tarball.
///
/// Entries may be added in any order; later additions for the same path
/// replace earlier ones. Missing parent directories are added as root-owned
/// `0755` directories.
pub struct LayerWriter {
    dir: PathBuf,
    entries: BTreeMap<String, PendingEntry>,
}

impl LayerWriter {
    /// Creates a writer whose temp file will live in `dir`.
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), entries: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add_dir(&mut self, path: &str, mode: u32, owner: Owner) {
        self.insert(path, PendingEntry { content: Content::Dir, mode, owner });
    }

    /// Adds a regular file whose bytes are read from `source` at write time.
    pub fn add_file(&mut self, path: &str, source: &Path, mode: u32, owner: Owner) {
        self.insert(path, PendingEntry { content: Content::File(source.to_path_buf()), mode, owner });
    }

    pub fn add_bytes(&mut self, path: &str, data: Vec<u8>, mode: u32, owner: Owner) {
        self.insert(path, PendingEntry { content: Content::Bytes(data), mode, owner });
    }

    pub fn add_symlink(&mut self, path: &str, target: &Path, owner: Owner) {
        self.insert(path, PendingEntry { content: Content::Symlink(target.to_path_buf()), mode: 0o777, owner });
    }

    /// Records the deletion of `path`.
    pub fn add_whiteout(&mut self, path: &str) {
        let path = clean(path);
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (format!("{}/", parent), name),
            None => (String::new(), path.as_str()),
        };
        let whiteout = format!("{}{}{}", parent, WHITEOUT_PREFIX, name);
        self.insert(&whiteout, PendingEntry { content: Content::Bytes(Vec::new()), mode: 0o644, owner: Owner::default() });
    }

    fn insert(&mut self, path: &str, entry: PendingEntry) {
        let path = clean(path);
        if path.is_empty() {
            return;
        }
        let mut parent = Path::new(&path).parent();
        while let Some(p) = parent.filter(|p| !p.as_os_str().is_empty()) {
            self.entries.entry(p.to_string_lossy().to_string()).or_insert(PendingEntry {
                content: Content::Dir,
                mode: 0o755,
                owner: Owner::default(),
            });
            parent = p.parent();
        }
        // An explicit entry replaces an implicit parent directory
        self.entries.insert(path, entry);
    }

    /// Writes the tarball and returns it with its digest.
    pub fn finish(self) -> Result<LayerBlob> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StrataError::io(&self.dir, e))?;
        let file = NamedTempFile::new_in(&self.dir).map_err(|e| StrataError::io(&self.dir, e))?;
        let mut builder = tar::Builder::new(HashingWriter::new(file));
        builder.mode(tar::HeaderMode::Deterministic);

        for (path, entry) in &self.entries {
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(entry.owner.uid);
            header.set_gid(entry.owner.gid);
            header.set_mode(entry.mode);

            let result = match &entry.content {
                Content::Dir => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, format!("{}/", path), io::empty())
                }
                Content::Bytes(data) => {
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, path, data.as_slice())
                }
                Content::File(source) => {
                    let file = File::open(source).map_err(|e| StrataError::io(source, e))?;
                    let len = file.metadata().map_err(|e| StrataError::io(source, e))?.len();
                    header.set_entry_type(EntryType::Regular);
                    header.set_size(len);
                    builder.append_data(&mut header, path, file.take(len))
                }
                Content::Symlink(target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target)
                }
            };
            result.map_err(|e| StrataError::io(path, e))?;
        }

        let writer = builder.into_inner().map_err(|e| StrataError::io(&self.dir, e))?;
        let (mut file, digest, size) = writer.finish();
        file.flush().map_err(|e| StrataError::io(file.path(), e))?;

        debug!(digest = %digest, size, entries = self.entries.len(), "Layer written");
        Ok(LayerBlob { file, digest, size })
    }
}

/// Write adapter that hashes and counts everything passing through.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, hasher: Sha256::new(), written: 0 }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, format!("sha256:{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Relative form of an in-image path; empty if it names the root.
fn clean(path: &str) -> String {
    normalize(path).map(|p| p.to_string_lossy().to_string()).unwrap_or_default()
}

/// Computes the `sha256:<hex>` digest of a file.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| StrataError::io(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| StrataError::io(path, e))?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Snapshots and diffs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeKind {
    File,
    Dir,
    Symlink(PathBuf),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeMeta {
    kind: NodeKind,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime_ns: i128,
    ctime_ns: i128,
    ino: u64,
}

/// Metadata of every path under a root filesystem.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    nodes: BTreeMap<PathBuf, NodeMeta>,
}

impl Snapshot {
    /// Walks `root` without following symlinks.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                StrataError::io(path, e.into())
            })?;
            let meta = entry.metadata().map_err(|e| StrataError::io(entry.path(), e.into()))?;
            let ft = meta.file_type();
            let kind = if ft.is_symlink() {
                NodeKind::Symlink(std::fs::read_link(entry.path()).map_err(|e| StrataError::io(entry.path(), e))?)
            } else if ft.is_dir() {
                NodeKind::Dir
            } else if ft.is_file() {
                NodeKind::File
            } else {
                NodeKind::Other
            };
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
            nodes.insert(
                rel,
                NodeMeta {
                    kind,
                    mode: meta.mode() & 0o7777,
                    uid: meta.uid(),
                    gid: meta.gid(),
                    size: meta.len(),
                    mtime_ns: meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128,
                    ctime_ns: meta.ctime() as i128 * 1_000_000_000 + meta.ctime_nsec() as i128,
                    ino: meta.ino(),
                },
            );
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A change between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(PathBuf),
    Modified(PathBuf),
    Deleted(PathBuf),
}

/// Lists changes from `before` to `after`, sorted by path.
///
/// A deleted directory is reported once; its children are implied.
/// Directories whose only change is their own timestamps are not reported,
/// since that is the side effect of a child changing.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();

    for (path, meta) in &after.nodes {
        match before.nodes.get(path) {
            None => changes.push(Change::Added(path.clone())),
            Some(old) if old.kind != meta.kind => changes.push(Change::Modified(path.clone())),
            Some(old) if meta.kind == NodeKind::Dir => {
                if old.mode != meta.mode || old.uid != meta.uid || old.gid != meta.gid {
                    changes.push(Change::Modified(path.clone()));
                }
            }
            Some(old) if old != meta => changes.push(Change::Modified(path.clone())),
            Some(_) => {}
        }
    }

    let mut deleted: Vec<&PathBuf> = before.nodes.keys().filter(|p| !after.nodes.contains_key(*p)).collect();
    deleted.sort();
    let mut last_deleted_dir: Option<&PathBuf> = None;
    for path in deleted {
        if last_deleted_dir.is_some_and(|dir| path.starts_with(dir)) {
            continue;
        }
        if before.nodes.get(path).is_some_and(|m| m.kind == NodeKind::Dir) {
            last_deleted_dir = Some(path);
        }
        changes.push(Change::Deleted(path.clone()));
    }

    changes.sort_by(|a, b| change_path(a).cmp(change_path(b)));
    changes
}

fn change_path(change: &Change) -> &Path {
    match change {
        Change::Added(p) | Change::Modified(p) | Change::Deleted(p) => p,
    }
}

/// Writes the difference between two snapshots of `root` as a layer.
///
/// Returns `None` when nothing changed.
pub fn write_diff_layer(root: &Path, before: &Snapshot, after: &Snapshot, tmp_dir: &Path) -> Result<Option<LayerBlob>> {
    let changes = diff(before, after);
    if changes.is_empty() {
        return Ok(None);
    }

    let mut writer = LayerWriter::new(tmp_dir);
    let mut parents: BTreeSet<PathBuf> = BTreeSet::new();

    for change in &changes {
        match change {
            Change::Deleted(path) => writer.add_whiteout(&path.to_string_lossy()),
            Change::Added(path) | Change::Modified(path) => {
                let Some(meta) = after.nodes.get(path) else { continue };
                add_node(&mut writer, root, path, meta);
            }
        }
        parents.extend(change_path(change).ancestors().skip(1).filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf));
    }

    // Parent directories carry their real metadata rather than defaults
    for parent in parents {
        if let Some(meta) = after.nodes.get(&parent) {
            if changes.iter().all(|c| change_path(c) != parent) {
                add_node(&mut writer, root, &parent, meta);
            }
        }
    }

    writer.finish().map(Some)
}

fn add_node(writer: &mut LayerWriter, root: &Path, path: &Path, meta: &NodeMeta) {
    let name = path.to_string_lossy();
    let owner = Owner { uid: meta.uid as u64, gid: meta.gid as u64 };
    match &meta.kind {
        NodeKind::Dir => writer.add_dir(&name, meta.mode, owner),
        NodeKind::File => writer.add_file(&name, &root.join(path), meta.mode, owner),
        NodeKind::Symlink(target) => writer.add_symlink(&name, target, owner),
        NodeKind::Other => debug!(path = %name, "Skipping special file in layer diff"),
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Applies a layer tarball on top of `rootfs`.
///
/// Whiteouts remove the named path; an entry whose type differs from the
/// existing path replaces it. Ownership is restored only when running as root.
pub fn apply_layer(tar_path: &Path, rootfs: &Path) -> Result<()> {
    let file = File::open(tar_path).map_err(|e| StrataError::io(tar_path, e))?;
    apply_layer_from(file, rootfs, &tar_path.display().to_string())
}

/// Applies a layer read from any reader. `label` names it in errors.
pub fn apply_layer_from<R: Read>(reader: R, rootfs: &Path, label: &str) -> Result<()> {
    let apply_err = |reason: String| StrataError::LayerApplyFailed { digest: label.to_string(), reason };

    std::fs::create_dir_all(rootfs).map_err(|e| StrataError::io(rootfs, e))?;
    let mut archive = Archive::new(reader);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_ownerships(is_root());

    let entries = archive.entries().map_err(|e| apply_err(format!("Failed to read tar entries: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| apply_err(format!("Corrupt tar entry: {}", e)))?;
        let rel = entry.path().map_err(|e| apply_err(e.to_string()))?.into_owned();
        let Some(rel) = normalize(&rel.to_string_lossy()) else {
            return Err(apply_err(format!("entry {} escapes the root filesystem", rel.display())));
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let name = rel.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let parent = rel.parent().map(|p| rootfs.join(p)).unwrap_or_else(|| rootfs.to_path_buf());

        if name == OPAQUE_WHITEOUT {
            clear_dir(&parent).map_err(|e| StrataError::io(&parent, e))?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            remove_path(&parent.join(hidden)).map_err(|e| StrataError::io(parent.join(hidden), e))?;
            continue;
        }

        let target = rootfs.join(&rel);
        let entry_type = entry.header().entry_type();
        if let Ok(existing) = std::fs::symlink_metadata(&target) {
            let replacing_dir = existing.is_dir() && entry_type != EntryType::Directory;
            let dir_over_file = !existing.is_dir() && entry_type == EntryType::Directory;
            if replacing_dir || dir_over_file || existing.file_type().is_symlink() {
                remove_path(&target).map_err(|e| StrataError::io(&target, e))?;
            }
        }

        if let Err(e) = entry.unpack_in(rootfs) {
            match entry_type {
                EntryType::Regular | EntryType::Directory | EntryType::Symlink => {
                    return Err(apply_err(format!("{}: {}", rel.display(), e)));
                }
                // Device nodes and similar need privileges the builder may not have
                _ => warn!(path = %rel.display(), error = %e, "Skipping unpackable layer entry"),
            }
        }
    }

    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                remove_path(&entry?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// True when the process has an effective uid of 0.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Permission bits of a path, or `default` if it cannot be read.
pub fn mode_of(path: &Path, default: u32) -> u32 {
    std::fs::symlink_metadata(path).map(|m| m.permissions().mode() & 0o7777).unwrap_or(default)
}

/// Lists the paths in a layer tarball, in archive order.
pub fn list_entries(tar_path: &Path) -> Result<Vec<String>> {
    let file = File::open(tar_path).map_err(|e| StrataError::io(tar_path, e))?;
    let mut archive = Archive::new(file);
    let mut names = Vec::new();
    for entry in archive.entries().map_err(|e| StrataError::io(tar_path, e))? {
        let entry = entry.map_err(|e| StrataError::io(tar_path, e))?;
        let path = entry.path().map_err(|e| StrataError::io(tar_path, e))?;
        names.push(path.to_string_lossy().to_string());
    }
    Ok(names)
}
