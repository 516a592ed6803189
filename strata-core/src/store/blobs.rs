//! Content-addressable storage for layer tarballs.
//!
//! Blobs are stored by the SHA256 digest of their bytes, so identical layers
//! produced by different builds are stored once.
//!
//! ```text
//! blobs/
//! ├── sha256/
//! │   ├── a1b2c3...  # layer tarball (named by digest)
//! │   └── ...
//! └── tmp/           # in-flight writes
//! ```
//!
//! Writes go to `tmp/` and are renamed into place without clobbering, so a
//! reader never sees a partial blob and concurrent writers of the same
//! content are harmless.

use crate::error::{Result, StrataError};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Digest and size of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: String,
    pub size: u64,
}

/// Blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) a blob store.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let blobs_dir = base_dir.join("sha256");
        let tmp_dir = base_dir.join("tmp");

        fs::create_dir_all(&blobs_dir).map_err(|e| StrataError::io(&blobs_dir, e))?;
        fs::create_dir_all(&tmp_dir).map_err(|e| StrataError::io(&tmp_dir, e))?;

        Ok(Self { blobs_dir, tmp_dir })
    }

    /// Path a blob is (or would be) stored at.
    pub fn path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(digest.strip_prefix("sha256:").unwrap_or(digest))
    }

    /// Check if a blob exists.
    pub fn contains(&self, digest: &str) -> bool {
        self.path(digest).is_file()
    }

    /// Size of a stored blob.
    pub fn size(&self, digest: &str) -> Result<u64> {
        let path = self.path(digest);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StrataError::BlobNotFound { digest: digest.to_string() })
            }
            Err(e) => Err(StrataError::io(path, e)),
        }
    }

    /// Streams `reader` into the store and returns the digest of its bytes.
    pub fn ingest<R: Read>(&self, mut reader: R) -> Result<BlobInfo> {
        let mut file = NamedTempFile::new_in(&self.tmp_dir).map_err(|e| StrataError::io(&self.tmp_dir, e))?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StrataError::io(file.path(), e)),
            };
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).map_err(|e| StrataError::io(file.path(), e))?;
            size += n as u64;
        }
        file.as_file().sync_all().map_err(|e| StrataError::io(file.path(), e))?;

        let digest = format!("sha256:{:x}", hasher.finalize());
        self.persist(file, &digest)?;
        Ok(BlobInfo { digest, size })
    }

    /// Copies a file into the store, checking it hashes to `expected`.
    ///
    /// On a mismatch nothing is stored and [`StrataError::BlobCorrupt`] is
    /// returned.
    pub fn import_file(&self, source: &Path, expected: &str) -> Result<BlobInfo> {
        if self.contains(expected) {
            debug!(digest = %expected, "Blob already exists");
            return Ok(BlobInfo { digest: expected.to_string(), size: self.size(expected)? });
        }

        let file = File::open(source).map_err(|e| StrataError::io(source, e))?;
        let mut tmp = NamedTempFile::new_in(&self.tmp_dir).map_err(|e| StrataError::io(&self.tmp_dir, e))?;
        let mut hashing = HashingReader { inner: file, hasher: Sha256::new() };
        let size = io::copy(&mut hashing, &mut tmp).map_err(|e| StrataError::io(source, e))?;

        let actual = format!("sha256:{:x}", hashing.hasher.finalize());
        if actual != expected {
            return Err(StrataError::BlobCorrupt { digest: expected.to_string(), actual });
        }

        self.persist(tmp, expected)?;
        debug!(digest = %expected, size, "Imported blob");
        Ok(BlobInfo { digest: actual, size })
    }

    fn persist(&self, file: NamedTempFile, digest: &str) -> Result<()> {
        let path = self.path(digest);
        match file.persist_noclobber(&path) {
            Ok(_) => {
                debug!(digest = %digest, "Stored new blob");
                Ok(())
            }
            // Same digest, same bytes
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StrataError::io(path, e.error)),
        }
    }

    /// Opens a blob for reading.
    pub fn open(&self, digest: &str) -> Result<File> {
        let path = self.path(digest);
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StrataError::BlobNotFound { digest: digest.to_string() },
            _ => StrataError::io(path, e),
        })
    }

    /// Lists every stored blob.
    pub fn list(&self) -> Result<Vec<BlobInfo>> {
        let mut blobs = Vec::new();
        for entry in fs::read_dir(&self.blobs_dir).map_err(|e| StrataError::io(&self.blobs_dir, e))? {
            let entry = entry.map_err(|e| StrataError::io(&self.blobs_dir, e))?;
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            blobs.push(BlobInfo {
                digest: format!("sha256:{}", entry.file_name().to_string_lossy()),
                size: meta.len(),
            });
        }
        blobs.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(blobs)
    }

    /// Get the total size of all blobs.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|b| b.size).sum())
    }

    /// Removes a blob. Missing blobs are not an error.
    pub fn remove(&self, digest: &str) -> Result<()> {
        let path = self.path(digest);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(path, e)),
        }
    }

    /// Garbage collect unreferenced blobs.
    ///
    /// Returns the number of blobs removed.
    pub fn gc(&self, referenced: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for blob in self.list()? {
            if referenced.contains(&blob.digest) {
                continue;
            }
            if let Err(e) = self.remove(&blob.digest) {
                warn!(digest = %blob.digest, error = %e, "Failed to remove unreferenced blob");
                continue;
            }
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Garbage collected unreferenced blobs");
        }
        Ok(removed)
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
