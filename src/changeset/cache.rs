// src/changeset/cache.rs

//! Fingerprint-keyed change-set cache
//!
//! Each entry is an artifact (`{fp[0:2]}/{fp[2:]}.ccs`) plus a JSON sidecar
//! (`.json`) recording its size and auxiliary lists. Both are written to a
//! temp file and renamed into place, sidecar last: an entry exists exactly
//! when its sidecar does, so readers never see a partial artifact.
//!
//! No lock is held while building. Two requests may build the same entry at
//! once; each publishes a complete file and the last rename wins.

use super::builder::BuiltChangeSet;
use super::fingerprint::Fingerprint;
use super::NeededFile;
use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A published change set and what the client must fetch elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size: u64,
    pub troves_needed: Vec<TroveTuple>,
    pub files_needed: Vec<NeededFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    #[serde(default)]
    troves_needed: Vec<TroveTuple>,
    #[serde(default)]
    files_needed: Vec<NeededFile>,
    /// Troves embedded in the artifact
    #[serde(default)]
    embedded: Vec<TroveTuple>,
}

/// Write `bytes` to `path` through a temp file in the same directory
fn publish(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("cache path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write an uncacheable change set under `tmp_dir`
pub fn write_temporary(tmp_dir: &Path, built: &BuiltChangeSet) -> Result<CacheEntry> {
    fs::create_dir_all(tmp_dir)?;
    let bytes = built.changeset.to_cbor()?;
    let mut temp = tempfile::Builder::new()
        .prefix("cs-")
        .suffix(".ccs")
        .tempfile_in(tmp_dir)?;
    temp.write_all(&bytes)?;
    let (_, path) = temp.keep().map_err(|e| Error::Io(e.error))?;

    Ok(CacheEntry {
        path,
        size: bytes.len() as u64,
        troves_needed: built.troves_needed.clone(),
        files_needed: built.files_needed.clone(),
    })
}

/// Change-set cache rooted at one directory
#[derive(Debug)]
pub struct ChangeSetCache {
    root: PathBuf,
    builds: AtomicU64,
}

impl ChangeSetCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            builds: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let (prefix, rest) = fingerprint.as_str().split_at(2);
        self.root.join(prefix).join(format!("{rest}.ccs"))
    }

    fn sidecar_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.artifact_path(fingerprint).with_extension("json")
    }

    /// Published entry for `fingerprint`, if any
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let sidecar = match fs::read(self.sidecar_path(fingerprint)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sidecar: Sidecar = match serde_json::from_slice(&sidecar) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                warn!("Ignoring unreadable cache sidecar for {}: {}", fingerprint, e);
                return Ok(None);
            }
        };

        let path = self.artifact_path(fingerprint);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(CacheEntry {
            path,
            size: sidecar.size,
            troves_needed: sidecar.troves_needed,
            files_needed: sidecar.files_needed,
        }))
    }

    /// Publish a built change set under `fingerprint`
    pub fn put(&self, fingerprint: &Fingerprint, built: &BuiltChangeSet) -> Result<CacheEntry> {
        let bytes = built.changeset.to_cbor()?;
        let sidecar = Sidecar {
            size: bytes.len() as u64,
            troves_needed: built.troves_needed.clone(),
            files_needed: built.files_needed.clone(),
            embedded: built.embedded.clone(),
        };

        let path = self.artifact_path(fingerprint);
        publish(&path, &bytes)?;
        publish(&self.sidecar_path(fingerprint), &serde_json::to_vec(&sidecar)?)?;
        debug!("Cached change set {} ({} bytes)", fingerprint, sidecar.size);

        Ok(CacheEntry {
            path,
            size: sidecar.size,
            troves_needed: sidecar.troves_needed,
            files_needed: sidecar.files_needed,
        })
    }

    /// Return the entry for `fingerprint`, building and publishing on a miss
    pub fn get_or_build<F>(&self, fingerprint: &Fingerprint, build: F) -> Result<CacheEntry>
    where
        F: FnOnce() -> Result<BuiltChangeSet>,
    {
        if let Some(entry) = self.get(fingerprint)? {
            debug!("Change set cache hit: {}", fingerprint);
            return Ok(entry);
        }
        self.builds.fetch_add(1, Ordering::Relaxed);
        let built = build()?;
        self.put(fingerprint, &built)
    }

    /// Number of builds run through [`ChangeSetCache::get_or_build`]
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Drop every entry that embedded one of `troves`
    ///
    /// Stale entries already stop matching once a trove's info changes; this
    /// only reclaims their space. Returns the number of entries removed.
    pub fn invalidate(&self, troves: &[TroveTuple]) -> Result<usize> {
        if troves.is_empty() {
            return Ok(0);
        }
        let targets: HashSet<&TroveTuple> = troves.iter().collect();
        let mut removed = 0;

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable cache entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let Ok(sidecar) = fs::read(path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<Sidecar>(&bytes).map_err(Error::from))
            else {
                continue;
            };
            if !sidecar.embedded.iter().any(|t| targets.contains(t)) {
                continue;
            }

            remove_if_present(path)?;
            remove_if_present(&path.with_extension("ccs"))?;
            removed += 1;
        }

        if removed > 0 {
            debug!("Invalidated {} cached change set(s)", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeSet, TroveChange};
    use tempfile::TempDir;

    fn fingerprint(seed: &str) -> Fingerprint {
        Fingerprint::for_test(seed)
    }

    fn built(name: &str) -> BuiltChangeSet {
        let trove = TroveTuple::new(name, "/a.example.com@rpl:devel/1.0-1-1", "");
        let mut changeset = ChangeSet::new();
        changeset.troves.push(TroveChange::new(trove.clone()));
        BuiltChangeSet {
            changeset,
            troves_needed: vec![TroveTuple::new("bar", "/b.example.com@rpl:devel/1-1-1", "")],
            files_needed: Vec::new(),
            embedded: vec![trove],
        }
    }

    #[test]
    fn test_miss_then_hit_builds_once() {
        let dir = TempDir::new().unwrap();
        let cache = ChangeSetCache::new(dir.path()).unwrap();
        let fp = fingerprint("foo");

        let first = cache.get_or_build(&fp, || Ok(built("foo"))).unwrap();
        let second = cache
            .get_or_build(&fp, || panic!("should not rebuild"))
            .unwrap();

        assert_eq!(cache.builds(), 1);
        assert_eq!(first, second);
        assert_eq!(second.troves_needed.len(), 1);
        assert_eq!(fs::metadata(&second.path).unwrap().len(), second.size);
    }

    #[test]
    fn test_missing_sidecar_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let cache = ChangeSetCache::new(dir.path()).unwrap();
        let fp = fingerprint("foo");
        let entry = cache.put(&fp, &built("foo")).unwrap();

        fs::remove_file(entry.path.with_extension("json")).unwrap();
        assert!(cache.get(&fp).unwrap().is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let cache = ChangeSetCache::new(dir.path()).unwrap();
        let fp = fingerprint("foo");
        cache.put(&fp, &built("foo")).unwrap();
        let second = cache.put(&fp, &built("foo")).unwrap();
        assert_eq!(cache.get(&fp).unwrap(), Some(second));
    }

    #[test]
    fn test_invalidate_removes_matching_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ChangeSetCache::new(dir.path()).unwrap();
        let foo = fingerprint("foo");
        let bar = fingerprint("bar");
        cache.put(&foo, &built("foo")).unwrap();
        cache.put(&bar, &built("bar")).unwrap();

        let target = TroveTuple::new("foo", "/a.example.com@rpl:devel/1.0-1-1", "");
        assert_eq!(cache.invalidate(&[target]).unwrap(), 1);
        assert!(cache.get(&foo).unwrap().is_none());
        assert!(cache.get(&bar).unwrap().is_some());
    }

    #[test]
    fn test_write_temporary() {
        let dir = TempDir::new().unwrap();
        let entry = write_temporary(dir.path(), &built("foo")).unwrap();
        assert!(entry.path.starts_with(dir.path()));
        let cs = ChangeSet::read_from(&entry.path).unwrap();
        assert_eq!(cs.troves.len(), 1);
    }
}
