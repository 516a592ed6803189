//! Build context: the directory COPY and ADD read from.
//!
//! Handles `.dockerignore`, source pattern matching and content digests.
//! Every path handed out stays inside the context root. Symlinks in the
//! context are copied as links; a source path may pass through a symlinked
//! directory only if it resolves inside the root.

use globset::{GlobBuilder, GlobMatcher};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Errors raised while reading the build context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("{path}: no such file or directory in build context")]
    Missing { path: String },

    #[error("{path}: path is outside the build context")]
    OutsideContext { path: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ContextError + '_ {
    move |source| ContextError::Io { path: path.to_path_buf(), source }
}

/// Kind of a context entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink(PathBuf),
}

/// A file, directory or symlink found in the context.
#[derive(Debug, Clone)]
pub struct ContextEntry {
    /// Path relative to the matched source (or its file name for files)
    pub rel: PathBuf,
    /// Absolute path on the host
    pub abs: PathBuf,
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
    pub size: u64,
}

/// A COPY/ADD source after pattern matching.
#[derive(Debug, Clone)]
pub struct MatchedSource {
    /// Path relative to the context root ("" for the root itself)
    pub rel: PathBuf,
    pub abs: PathBuf,
    pub is_dir: bool,
}

impl MatchedSource {
    /// File name used when the source lands inside a destination directory.
    pub fn file_name(&self) -> String {
        self.rel.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    }
}

/// One `.dockerignore` rule.
#[derive(Debug, Clone)]
struct IgnoreRule {
    matcher: GlobMatcher,
    negated: bool,
}

/// Build context rooted at a directory.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    ignore: Vec<IgnoreRule>,
}

impl BuildContext {
    /// Opens a context directory and loads its `.dockerignore`.
    pub fn open(root: &Path) -> Result<Self, ContextError> {
        let root = root.canonicalize().map_err(io_err(root))?;
        if !root.is_dir() {
            return Err(ContextError::Missing { path: root.display().to_string() });
        }

        let ignore_path = root.join(".dockerignore");
        let ignore = if ignore_path.exists() {
            let content = std::fs::read_to_string(&ignore_path).map_err(io_err(&ignore_path))?;
            parse_ignore(&content)?
        } else {
            Vec::new()
        };

        Ok(Self { root, ignore })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True if `.dockerignore` excludes `rel` (or one of its parents).
    ///
    /// Rules apply in order and the last matching rule wins.
    pub fn is_ignored(&self, rel: &Path) -> bool {
        let mut ignored = false;
        for rule in &self.ignore {
            let matched = rel.ancestors().filter(|p| !p.as_os_str().is_empty()).any(|p| rule.matcher.is_match(p));
            if matched {
                ignored = !rule.negated;
            }
        }
        ignored
    }

    /// Resolves one COPY/ADD source to the context paths it names.
    ///
    /// Absolute sources are taken relative to the context root. Wildcard
    /// sources must match at least one entry.
    pub fn match_source(&self, source: &str) -> Result<Vec<MatchedSource>, ContextError> {
        let cleaned = normalize(source).ok_or_else(|| ContextError::OutsideContext { path: source.to_string() })?;

        if has_wildcard(source) {
            let pattern = cleaned.to_string_lossy().to_string();
            let matcher = compile(&pattern)?;
            let mut matches: Vec<MatchedSource> = Vec::new();

            for entry in WalkDir::new(&self.root).min_depth(1).follow_links(false).sort_by_file_name() {
                let entry = entry.map_err(|e| ContextError::Io {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
                    source: e.into(),
                })?;
                let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path()).to_path_buf();
                if !matcher.is_match(&rel) || self.is_ignored(&rel) {
                    continue;
                }
                // A directory match already covers its children
                if matches.iter().any(|m| m.is_dir && rel.starts_with(&m.rel)) {
                    continue;
                }
                matches.push(MatchedSource {
                    is_dir: entry.file_type().is_dir(),
                    abs: entry.path().to_path_buf(),
                    rel,
                });
            }

            if matches.is_empty() {
                return Err(ContextError::Missing { path: source.to_string() });
            }
            return Ok(matches);
        }

        let abs = self.resolve_parent(&cleaned, source)?;
        let meta = match std::fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::Missing { path: source.to_string() });
            }
            Err(e) => return Err(ContextError::Io { path: abs, source: e }),
        };

        if !cleaned.as_os_str().is_empty() && self.is_ignored(&cleaned) {
            return Err(ContextError::Missing { path: source.to_string() });
        }

        Ok(vec![MatchedSource { rel: cleaned, abs, is_dir: meta.is_dir() }])
    }

    /// Host path of `rel` with its parent directories resolved.
    ///
    /// The final component is left alone so a symlink source is copied as a
    /// link. Parents that resolve outside the root are rejected.
    fn resolve_parent(&self, rel: &Path, source: &str) -> Result<PathBuf, ContextError> {
        let (Some(parent), Some(name)) = (rel.parent(), rel.file_name()) else {
            return Ok(self.root.join(rel));
        };
        if parent.as_os_str().is_empty() {
            return Ok(self.root.join(rel));
        }

        let unresolved = self.root.join(parent);
        let real = match unresolved.canonicalize() {
            Ok(real) => real,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContextError::Missing { path: source.to_string() });
            }
            Err(e) => return Err(ContextError::Io { path: unresolved, source: e }),
        };
        if !real.starts_with(&self.root) {
            return Err(ContextError::OutsideContext { path: source.to_string() });
        }
        Ok(real.join(name))
    }

    /// Lists what a matched source contributes, in sorted order.
    ///
    /// For a directory these are its non-ignored descendants relative to it
    /// (the directory itself is not included); for anything else it is the
    /// single entry, named by its file name.
    pub fn entries(&self, source: &MatchedSource) -> Result<Vec<ContextEntry>, ContextError> {
        if !source.is_dir {
            let mut entry = self.entry_at(&source.abs)?;
            entry.rel = PathBuf::from(source.file_name());
            return Ok(vec![entry]);
        }

        let mut included: BTreeMap<PathBuf, ContextEntry> = BTreeMap::new();
        let mut ignored_dirs: BTreeMap<PathBuf, ContextEntry> = BTreeMap::new();

        for item in WalkDir::new(&source.abs).min_depth(1).follow_links(false).sort_by_file_name() {
            let item = item.map_err(|e| ContextError::Io {
                path: e.path().map(Path::to_path_buf).unwrap_or_else(|| source.abs.clone()),
                source: e.into(),
            })?;
            let rel_to_root = item.path().strip_prefix(&self.root).unwrap_or(item.path());
            let mut entry = self.entry_at(item.path())?;
            entry.rel = item.path().strip_prefix(&source.abs).unwrap_or(item.path()).to_path_buf();

            if !self.is_ignored(rel_to_root) {
                included.insert(entry.rel.clone(), entry);
            } else if entry.kind == EntryKind::Dir {
                // Kept aside in case an exception rule re-includes a child
                ignored_dirs.insert(entry.rel.clone(), entry);
            }
        }

        let parents: Vec<PathBuf> = included
            .keys()
            .flat_map(|p| p.ancestors().skip(1).map(Path::to_path_buf).collect::<Vec<_>>())
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        for parent in parents {
            if let Some(dir) = ignored_dirs.remove(&parent) {
                included.insert(parent, dir);
            }
        }

        Ok(included.into_values().collect())
    }

    fn entry_at(&self, abs: &Path) -> Result<ContextEntry, ContextError> {
        let meta = std::fs::symlink_metadata(abs).map_err(io_err(abs))?;
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink(std::fs::read_link(abs).map_err(io_err(abs))?)
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        Ok(ContextEntry {
            rel: PathBuf::new(),
            abs: abs.to_path_buf(),
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mode: meta.permissions().mode() & 0o7777,
            kind,
        })
    }

    /// Content digest of a set of matched sources.
    ///
    /// Covers paths, kinds, permission bits, symlink targets and file bytes.
    /// Timestamps are excluded so a fresh checkout of the same files hashes
    /// the same.
    pub fn digest_sources(&self, sources: &[MatchedSource]) -> Result<String, ContextError> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        for source in sources {
            hasher.update(b"source\0");
            hasher.update(source.rel.to_string_lossy().as_bytes());
            hasher.update([0, source.is_dir as u8]);

            for entry in self.entries(source)? {
                hasher.update(entry.rel.to_string_lossy().as_bytes());
                hasher.update([0]);
                hasher.update(entry.mode.to_le_bytes());
                match &entry.kind {
                    EntryKind::Dir => hasher.update(b"d"),
                    EntryKind::Symlink(target) => {
                        hasher.update(b"l");
                        hasher.update(target.to_string_lossy().as_bytes());
                    }
                    EntryKind::File => {
                        hasher.update(b"f");
                        hasher.update(entry.size.to_le_bytes());
                        let mut file = std::fs::File::open(&entry.abs).map_err(io_err(&entry.abs))?;
                        loop {
                            let n = file.read(&mut buf).map_err(io_err(&entry.abs))?;
                            if n == 0 {
                                break;
                            }
                            hasher.update(&buf[..n]);
                        }
                    }
                }
                hasher.update([0]);
            }
        }

        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}

fn parse_ignore(content: &str) -> Result<Vec<IgnoreRule>, ContextError> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (negated, pattern) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        let Some(cleaned) = normalize(pattern) else {
            // Patterns above the root can never match anything inside it
            continue;
        };
        if cleaned.as_os_str().is_empty() {
            continue;
        }
        rules.push(IgnoreRule { matcher: compile(&cleaned.to_string_lossy())?, negated });
    }
    Ok(rules)
}

fn compile(pattern: &str) -> Result<GlobMatcher, ContextError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .backslash_escape(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| ContextError::InvalidPattern { pattern: pattern.to_string(), reason: e.to_string() })
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Lexically normalizes a context-relative path.
///
/// Leading `/` is dropped. Returns `None` if `..` climbs above the root.
pub fn normalize(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn app_context() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "requirements.txt", "flask==2.0\n");
        write(dir.path(), "main.py", "print('hi')\n");
        write(dir.path(), "pkg/util.py", "X = 1\n");
        write(dir.path(), "pkg/data/blob.bin", "data");
        dir
    }

    fn names(entries: &[ContextEntry]) -> Vec<String> {
        entries.iter().map(|e| e.rel.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./a/../b"), Some(PathBuf::from("b")));
        assert_eq!(normalize("/etc/passwd"), Some(PathBuf::from("etc/passwd")));
        assert_eq!(normalize("."), Some(PathBuf::new()));
        assert_eq!(normalize("../secret"), None);
        assert_eq!(normalize("a/../../b"), None);
    }

    #[test]
    fn test_match_literal_file() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();

        let matches = ctx.match_source("requirements.txt").unwrap();
        assert_eq!(matches.len(), 1);
        assert!(!matches[0].is_dir);
        assert_eq!(matches[0].file_name(), "requirements.txt");
    }

    #[test]
    fn test_match_missing_and_escaping() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();

        assert!(matches!(ctx.match_source("nope.txt"), Err(ContextError::Missing { .. })));
        assert!(matches!(ctx.match_source("*.rs"), Err(ContextError::Missing { .. })));
        assert!(matches!(ctx.match_source("../outside"), Err(ContextError::OutsideContext { .. })));
    }

    #[test]
    fn test_symlinked_parent_outside_context_is_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "outside/secret.txt", "TOP SECRET");
        let root = temp.path().join("ctx");
        write(&root, "app/main.py", "print('hi')\n");
        std::os::unix::fs::symlink(temp.path().join("outside"), root.join("link")).unwrap();
        std::os::unix::fs::symlink("app", root.join("inner")).unwrap();

        let ctx = BuildContext::open(&root).unwrap();
        assert!(matches!(ctx.match_source("link/secret.txt"), Err(ContextError::OutsideContext { .. })));
        assert!(matches!(ctx.match_source("/link/../link/secret.txt"), Err(ContextError::OutsideContext { .. })));

        // A link that stays inside the context is fine
        let matched = ctx.match_source("inner/main.py").unwrap();
        assert_eq!(std::fs::read_to_string(&matched[0].abs).unwrap(), "print('hi')\n");

        // The link itself is matched without being followed
        let link = ctx.match_source("link").unwrap();
        assert!(!link[0].is_dir);
        assert!(matches!(ctx.entries(&link[0]).unwrap()[0].kind, EntryKind::Symlink(_)));
    }

    #[test]
    fn test_match_wildcard() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();

        let matches = ctx.match_source("*.py").unwrap();
        let rels: Vec<_> = matches.iter().map(|m| m.rel.clone()).collect();
        assert_eq!(rels, vec![PathBuf::from("main.py")]);

        let matches = ctx.match_source("pkg/*").unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_directory_entries_sorted() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();

        let root = &ctx.match_source(".").unwrap()[0];
        assert!(root.is_dir);
        let entries = ctx.entries(root).unwrap();
        assert_eq!(
            names(&entries),
            vec!["main.py", "pkg", "pkg/data", "pkg/data/blob.bin", "pkg/util.py", "requirements.txt"]
        );
    }

    #[test]
    fn test_dockerignore_with_exception() {
        let dir = app_context();
        write(dir.path(), ".dockerignore", "# build junk\npkg\n!pkg/util.py\n*.txt\n");
        let ctx = BuildContext::open(dir.path()).unwrap();

        assert!(ctx.is_ignored(Path::new("pkg/data/blob.bin")));
        assert!(!ctx.is_ignored(Path::new("pkg/util.py")));
        assert!(ctx.is_ignored(Path::new("requirements.txt")));

        let root = &ctx.match_source(".").unwrap()[0];
        let entries = ctx.entries(root).unwrap();
        assert_eq!(names(&entries), vec![".dockerignore", "main.py", "pkg", "pkg/util.py"]);

        assert!(matches!(ctx.match_source("requirements.txt"), Err(ContextError::Missing { .. })));
    }

    #[test]
    fn test_dockerignore_double_star() {
        let dir = app_context();
        write(dir.path(), "a/b/__pycache__/x.pyc", "");
        write(dir.path(), ".dockerignore", "**/__pycache__\n");
        let ctx = BuildContext::open(dir.path()).unwrap();

        assert!(ctx.is_ignored(Path::new("a/b/__pycache__/x.pyc")));
        assert!(!ctx.is_ignored(Path::new("a/b")));
    }

    #[test]
    fn test_digest_tracks_content_not_mtime() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let sources = ctx.match_source("requirements.txt").unwrap();

        let first = ctx.digest_sources(&sources).unwrap();
        // Rewriting identical bytes bumps mtime but not the digest
        write(dir.path(), "requirements.txt", "flask==2.0\n");
        assert_eq!(ctx.digest_sources(&sources).unwrap(), first);

        write(dir.path(), "requirements.txt", "flask==2.1\n");
        assert_ne!(ctx.digest_sources(&sources).unwrap(), first);
    }

    #[test]
    fn test_digest_of_directory_sees_nested_change() {
        let dir = app_context();
        let ctx = BuildContext::open(dir.path()).unwrap();
        let sources = ctx.match_source(".").unwrap();

        let first = ctx.digest_sources(&sources).unwrap();
        write(dir.path(), "pkg/data/blob.bin", "changed");
        assert_ne!(ctx.digest_sources(&sources).unwrap(), first);
    }
}
