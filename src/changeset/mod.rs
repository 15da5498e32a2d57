// src/changeset/mod.rs

//! Change sets: serialized deltas between trove identities
//!
//! A change set is the unit clients fetch ([`builder`], [`cache`]) and commit
//! ([`crate::commit`]). On disk it is a CBOR document.

pub mod builder;
pub mod cache;
pub mod fingerprint;

pub use builder::{BuiltChangeSet, ChangeSetBuilder};
pub use cache::{CacheEntry, ChangeSetCache};
pub use fingerprint::Fingerprint;

use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Current change-set format version
pub const FORMAT_VERSION: u8 = 1;

/// A requested delta: from `old` (or nothing) to `new`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub old: Option<TroveTuple>,
    pub new: TroveTuple,
    /// Ship the new trove whole instead of as a diff
    #[serde(default)]
    pub absolute: bool,
}

impl Job {
    pub fn fresh(new: TroveTuple) -> Self {
        Self {
            old: None,
            new,
            absolute: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.new.name
    }

    /// Canonical form: plain versions, canonical flavors, matching names
    pub fn normalize(&self) -> Result<Job> {
        let new = self.new.identity()?;
        let old = match &self.old {
            Some(old) => {
                if old.name != new.name {
                    return Err(Error::InvalidRequest(format!(
                        "job mixes troves {} and {}",
                        old.name, new.name
                    )));
                }
                Some(old.identity()?)
            }
            None => None,
        };
        Ok(Job {
            old,
            new,
            absolute: self.absolute || self.old.is_none(),
        })
    }
}

/// Options shared by every job of a `getChangeSet` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobFlags {
    /// Follow containment edges into referenced troves
    #[serde(default)]
    pub recurse: bool,
    #[serde(default)]
    pub with_files: bool,
    #[serde(default)]
    pub with_file_contents: bool,
}

/// Whether `trove` lives on a label served by this repository
///
/// An empty `server_names` list treats every label as local.
pub fn hosted_locally(trove: &TroveTuple, server_names: &[String]) -> bool {
    if server_names.is_empty() {
        return true;
    }
    match trove.parsed_version() {
        Ok(version) => {
            let host = version.branch.label().host();
            server_names.iter().any(|name| name == host)
        }
        Err(_) => false,
    }
}

/// A containment edge carried by a trove
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TroveRef {
    pub trove: TroveTuple,
    #[serde(default)]
    pub weak: bool,
}

/// A file carried by a trove
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub file_id: String,
    pub file_version: String,
    pub sha256: String,
    pub size: u64,
    #[serde(default)]
    pub mode: u32,
}

/// One trove's part of a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveChange {
    /// New identity; the version may be frozen (with timestamps)
    pub trove: TroveTuple,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_version: Option<String>,
    #[serde(default)]
    pub absolute: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default)]
    pub references: Vec<TroveRef>,
    /// New or changed files (all files when absolute)
    #[serde(default)]
    pub files: Vec<FileChange>,
    /// Paths dropped relative to the old trove
    #[serde(default)]
    pub removed_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigs: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_info: Option<Vec<u8>>,
}

impl TroveChange {
    pub fn new(trove: TroveTuple) -> Self {
        Self {
            trove,
            old_version: None,
            absolute: true,
            source_name: None,
            references: Vec::new(),
            files: Vec::new(),
            removed_files: Vec::new(),
            sigs: None,
            metadata: None,
            build_info: None,
        }
    }
}

/// A file whose contents live on another repository
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NeededFile {
    pub trove: TroveTuple,
    pub path: String,
    pub file_id: String,
    pub file_version: String,
}

/// File contents shipped inside a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub sha256: String,
    pub data: Vec<u8>,
}

/// A serialized change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub format_version: u8,
    /// Troves the change set was requested for
    #[serde(default)]
    pub primary: Vec<TroveTuple>,
    #[serde(default)]
    pub troves: Vec<TroveChange>,
    /// Troves this change set turns into removal tombstones
    #[serde(default)]
    pub removed: Vec<TroveTuple>,
    #[serde(default)]
    pub contents: Vec<FileContents>,
}

impl Default for ChangeSet {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            primary: Vec::new(),
            troves: Vec::new(),
            removed: Vec::new(),
            contents: Vec::new(),
        }
    }
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode to CBOR bytes
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode from CBOR bytes
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let cs: ChangeSet = ciborium::from_reader(data)?;
        if cs.format_version != FORMAT_VERSION {
            return Err(Error::InvalidRequest(format!(
                "unsupported change set format {}",
                cs.format_version
            )));
        }
        Ok(cs)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_cbor(&fs::read(path)?)
    }

    /// Write to `path`, returning the byte count
    pub fn write_to(&self, path: &Path) -> Result<u64> {
        let bytes = self.to_cbor()?;
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(bytes.len() as u64)
    }

    /// Contents for `sha256`, if shipped
    pub fn contents_for(&self, sha256: &str) -> Option<&[u8]> {
        self.contents
            .iter()
            .find(|c| c.sha256 == sha256)
            .map(|c| c.data.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(version: &str) -> TroveTuple {
        TroveTuple::new("foo", format!("/a.example.com@rpl:devel/{version}"), "[ssl]")
    }

    #[test]
    fn test_job_normalize_strips_timestamps() {
        let job = Job {
            old: Some(tuple("1000.000:1.0-1-1")),
            new: tuple("2000.000:1.1-1-1"),
            absolute: false,
        };
        let normalized = job.normalize().unwrap();
        assert_eq!(normalized.new.version, "/a.example.com@rpl:devel/1.1-1-1");
        assert_eq!(
            normalized.old.unwrap().version,
            "/a.example.com@rpl:devel/1.0-1-1"
        );
        assert!(!normalized.absolute);
    }

    #[test]
    fn test_fresh_job_is_absolute() {
        let job = Job {
            old: None,
            new: tuple("1.0-1-1"),
            absolute: false,
        };
        assert!(job.normalize().unwrap().absolute);
    }

    #[test]
    fn test_job_rejects_mixed_names() {
        let mut old = tuple("1.0-1-1");
        old.name = "bar".to_string();
        let job = Job {
            old: Some(old),
            new: tuple("1.1-1-1"),
            absolute: false,
        };
        assert!(matches!(job.normalize(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_cbor_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cs.ccs");

        let mut cs = ChangeSet::new();
        let mut trove = TroveChange::new(tuple("1.0-1-1"));
        trove.files.push(FileChange {
            path: "/usr/bin/foo".to_string(),
            file_id: "f".repeat(40),
            file_version: "/a.example.com@rpl:devel/1.0-1-1".to_string(),
            sha256: "0".repeat(64),
            size: 3,
            mode: 0o755,
        });
        cs.troves.push(trove);
        cs.contents.push(FileContents {
            sha256: "0".repeat(64),
            data: b"abc".to_vec(),
        });

        let size = cs.write_to(&path).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());
        let back = ChangeSet::read_from(&path).unwrap();
        assert_eq!(back, cs);
        assert_eq!(back.contents_for(&"0".repeat(64)), Some(&b"abc"[..]));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let mut cs = ChangeSet::new();
        cs.format_version = 99;
        let bytes = cs.to_cbor().unwrap();
        assert!(ChangeSet::from_cbor(&bytes).is_err());
    }
}
