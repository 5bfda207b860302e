//! Sandboxed filesystem roots
//!
//! Topic directories are named by user-supplied ids and resource URLs join
//! user-supplied names against the topic root, so every path the domain code
//! touches goes through a [`RootDir`]: a handle for one directory that
//! interprets all paths relative to itself and rejects any path that would
//! escape it after cleaning. Domain code acquires a handle once and never
//! re-derives paths by string concatenation.

use crate::error::{Error, Result};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// A directory handle with all operations confined to it.
///
/// Cloning is cheap; clones share the same base path.
#[derive(Clone, Debug)]
pub struct RootDir {
    base: Arc<PathBuf>,
}

impl RootDir {
    /// Open a root at `path`, creating the directory (mode 0755) if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        create_dir_0755(path)?;
        Ok(Self {
            base: Arc::new(path.to_path_buf()),
        })
    }

    /// The directory this root is confined to.
    pub fn name(&self) -> &Path {
        &self.base
    }

    /// Resolve a relative path inside the sandbox.
    ///
    /// Rejects absolute paths and any component that is not a normal name
    /// (so `..` can never climb out, regardless of how many plain components
    /// precede it).
    fn resolve(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        if rel.is_absolute() {
            return Err(Error::PathEscape(rel.to_path_buf()));
        }
        let mut out = (*self.base).clone();
        for comp in rel.components() {
            match comp {
                Component::Normal(name) => out.push(name),
                Component::CurDir => {}
                _ => return Err(Error::PathEscape(rel.to_path_buf())),
            }
        }
        Ok(out)
    }

    /// Open (creating if missing) a sub-directory as its own sandboxed root.
    pub fn open_sub(&self, rel: impl AsRef<Path>) -> Result<RootDir> {
        let dir = self.resolve(rel)?;
        create_dir_0755(&dir)?;
        Ok(RootDir {
            base: Arc::new(dir),
        })
    }

    /// List the entries of the root itself.
    pub fn read_dir(&self) -> Result<Vec<fs::DirEntry>> {
        self.read_dir_at(".")
    }

    /// List the entries of a sub-path.
    pub fn read_dir_at(&self, rel: impl AsRef<Path>) -> Result<Vec<fs::DirEntry>> {
        let dir = self.resolve(rel)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Absolute path of the root, for the rare operations that must cross the
    /// sandbox boundary (e.g. a child-process working directory).
    pub fn abs_path(&self) -> PathBuf {
        (*self.base).clone()
    }

    /// Absolute path of a sub-path; still escape-checked.
    pub fn abs_path_of(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        self.resolve(rel)
    }

    /// Whether a sub-path exists. Escaping paths report `false`.
    pub fn is_exist(&self, rel: impl AsRef<Path>) -> bool {
        self.resolve(rel).map(|p| p.exists()).unwrap_or(false)
    }

    /// Read a whole file into memory.
    pub fn read_all(&self, rel: impl AsRef<Path>) -> Result<Vec<u8>> {
        Ok(fs::read(self.resolve(rel)?)?)
    }

    /// Write a whole file (mode 0644), creating the parent directory if
    /// needed and truncating any previous content.
    pub fn write_all(&self, rel: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            create_dir_0755(parent)?;
        }
        fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    /// Open a buffered reader over a file.
    pub fn open_reader(&self, rel: impl AsRef<Path>) -> Result<BufReader<fs::File>> {
        Ok(BufReader::new(fs::File::open(self.resolve(rel)?)?))
    }

    /// Open a truncating writer over a file (mode 0644), creating the parent
    /// directory if needed.
    pub fn open_writer(&self, rel: impl AsRef<Path>) -> Result<fs::File> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            create_dir_0755(parent)?;
        }
        let file = fs::File::create(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o644))?;
        }
        Ok(file)
    }

    /// Stream a file line by line, stopping early when `f` returns `false`.
    ///
    /// `f` receives each line (without terminator) and its zero-based index.
    pub fn every_line(
        &self,
        rel: impl AsRef<Path>,
        mut f: impl FnMut(&str, usize) -> bool,
    ) -> Result<()> {
        let reader = self.open_reader(rel)?;
        for (i, line) in reader.lines().enumerate() {
            if !f(&line?, i) {
                break;
            }
        }
        Ok(())
    }

    /// Remove a sub-path recursively if it exists.
    pub fn remove_all(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.resolve(rel)?;
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn create_dir_0755(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn temp_root() -> (tempfile::TempDir, RootDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_parent_components_are_rejected() {
        let (_dir, root) = temp_root();
        for bad in ["../etc/passwd", "a/../../b", "..", "a/b/../../../c"] {
            match root.read_all(bad) {
                Err(Error::PathEscape(_)) => {}
                other => panic!("{bad:?} should be a path escape, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_absolute_paths_are_rejected() {
        let (_dir, root) = temp_root();
        match root.read_all("/etc/passwd") {
            Err(Error::PathEscape(_)) => {}
            other => panic!("absolute path should be rejected, got {other:?}"),
        }
    }

    #[test]
    fn test_write_read_roundtrip_creates_parent() {
        let (_dir, root) = temp_root();
        root.write_all("attachments/pic.jpg", b"bytes").unwrap();
        assert!(root.is_exist("attachments/pic.jpg"));
        assert_eq!(root.read_all("attachments/pic.jpg").unwrap(), b"bytes");
    }

    #[test]
    fn test_write_truncates_previous_content() {
        let (_dir, root) = temp_root();
        root.write_all("f.txt", b"long old content").unwrap();
        root.write_all("f.txt", b"new").unwrap();
        assert_eq!(root.read_all("f.txt").unwrap(), b"new");
    }

    #[test]
    fn test_open_sub_is_itself_sandboxed() {
        let (_dir, root) = temp_root();
        let sub = root.open_sub("12345").unwrap();
        sub.write_all("post.md", b"# title").unwrap();
        assert!(root.is_exist("12345/post.md"));
        match sub.read_all("../other") {
            Err(Error::PathEscape(_)) => {}
            other => panic!("sub-root must not climb out, got {other:?}"),
        }
    }

    #[test]
    fn test_every_line_early_stop() {
        let (_dir, root) = temp_root();
        root.write_all("lines.txt", b"a\nb\nc\nd").unwrap();
        let mut seen = Vec::new();
        root.every_line("lines.txt", |line, i| {
            seen.push((i, line.to_string()));
            i < 1
        })
        .unwrap();
        assert_eq!(seen, vec![(0, "a".to_string()), (1, "b".to_string())]);
    }

    #[test]
    fn test_is_exist_false_for_escape() {
        let (_dir, root) = temp_root();
        assert!(!root.is_exist("../outside"));
    }
}
