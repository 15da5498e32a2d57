// src/filesystem/cas.rs

//! Content-addressable storage for file contents
//!
//! Contents are stored by their SHA-256 digest at `{root}/{first2}/{rest}`.
//! The store is append-only: a digest always names the same bytes, so an
//! existing object is never rewritten.

use crate::error::{Error, Result};
use crate::hash::{self, Digest};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Content-addressed blob store
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            debug!("Created content store directory: {:?}", root);
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `content` and return its digest; a no-op when already present
    pub fn store(&self, content: &[u8]) -> Result<Digest> {
        let digest = Digest::of(content);
        let path = self.hash_to_path(&digest);

        if path.exists() {
            debug!("Content already stored: {}", digest);
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Unique temp name so two writers of the same object never share a file
        let parent = path.parent().unwrap_or(&self.root);
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!("Stored content: {} ({} bytes)", digest, content.len());
        Ok(digest)
    }

    /// Store a stream, verifying it against `expected` when given
    ///
    /// The stream is hashed while it is spooled to a temporary file under
    /// the store root; nothing is kept when the digest does not match.
    pub fn store_reader<R: Read>(&self, reader: R, expected: Option<&Digest>) -> Result<Digest> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let (actual, size) = hash::sha256_reader(Tee {
            reader,
            sink: temp.as_file_mut(),
        })?;

        if let Some(expected) = expected {
            if actual != expected.as_str() {
                return Err(Error::InvalidRequest(format!(
                    "content digest mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        let digest = Digest::new(actual)?;
        let path = self.hash_to_path(&digest);
        if path.exists() {
            debug!("Content already stored: {}", digest);
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;

        debug!("Stored streamed content: {} ({} bytes)", digest, size);
        Ok(digest)
    }

    /// Path of the object named by `digest`
    ///
    /// Fails with [`Error::ContentNotFound`] when the object is absent.
    pub fn locate(&self, digest: &Digest) -> Result<PathBuf> {
        let path = self.hash_to_path(digest);
        if !path.is_file() {
            return Err(Error::ContentNotFound(digest.to_string()));
        }
        Ok(path)
    }

    /// Size in bytes of a located object
    pub fn size(&self, path: &Path) -> Result<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ContentNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read an object back, verifying its digest
    pub fn retrieve(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.locate(digest)?;
        let content = fs::read(&path)?;

        let computed = hash::sha256(&content);
        if computed != digest.as_str() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Hash mismatch: expected {}, got {}", digest, computed),
            )));
        }

        debug!("Retrieved content: {} ({} bytes)", digest, content.len());
        Ok(content)
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.hash_to_path(digest).is_file()
    }

    /// Storage path for a digest: `{root}/ab/c123...`
    pub fn hash_to_path(&self, digest: &Digest) -> PathBuf {
        let (prefix, suffix) = digest.as_str().split_at(2);
        self.root.join(prefix).join(suffix)
    }
}

/// Copies everything read through it into `sink`
struct Tee<R, W> {
    reader: R,
    sink: W,
}

impl<R: Read, W: Write> Read for Tee<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.sink.write_all(&buf[..n])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let content = b"Test content for the store";
        let digest = store.store(content).unwrap();

        let retrieved = store.retrieve(&digest).unwrap();
        assert_eq!(content, retrieved.as_slice());
    }

    #[test]
    fn test_store_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let first = store.store(b"same bytes").unwrap();
        let second = store.store(b"same bytes").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_layout_uses_two_char_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let digest = store.store(b"Hello, World!").unwrap();
        assert_eq!(
            digest.as_str(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
        let path = store.hash_to_path(&digest);
        assert!(path.ends_with("df/fd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"));
    }

    #[test]
    fn test_locate_and_size() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let digest = store.store(b"12345").unwrap();
        let path = store.locate(&digest).unwrap();
        assert_eq!(store.size(&path).unwrap(), 5);
    }

    #[test]
    fn test_missing_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let digest = Digest::of(b"never stored");
        assert!(!store.exists(&digest));
        assert!(matches!(store.locate(&digest), Err(Error::ContentNotFound(_))));
        assert!(matches!(store.retrieve(&digest), Err(Error::ContentNotFound(_))));
    }

    #[test]
    fn test_store_reader_verifies_digest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let wrong = Digest::of(b"other");
        let result = store.store_reader(&b"payload"[..], Some(&wrong));
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let right = Digest::of(b"payload");
        assert_eq!(store.store_reader(&b"payload"[..], Some(&right)).unwrap(), right);
    }

    #[test]
    fn test_store_reader_streams_large_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let digest = store.store_reader(content.as_slice(), None).unwrap();
        assert_eq!(digest, Digest::of(&content));
        assert_eq!(store.retrieve(&digest).unwrap(), content);

        // Storing the same stream again keeps the single object
        assert_eq!(store.store_reader(content.as_slice(), Some(&digest)).unwrap(), digest);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rejected_stream_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(temp_dir.path()).unwrap();

        let wrong = Digest::of(b"other");
        assert!(store.store_reader(&b"payload"[..], Some(&wrong)).is_err());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
        assert!(!store.exists(&Digest::of(b"payload")));
    }
}
