// src/server/context.rs
//! Per-call context handed to operation handlers
//!
//! A context lives for exactly one attempt of one call. Side effects that
//! must only happen once the transaction is durable (notification, cache
//! sweeps, removal of consumed uploads) are recorded here and applied by
//! the call loop after commit.
//!
//! Files written for the caller (manifests, uncached change sets) go into
//! the attempt's [`Scratch`] list. A failed attempt deletes them; after a
//! successful call the transport owns them and removes them once served.

use crate::auth::Authorizer;
use crate::error::{Error, Result};
use crate::server::{RepositoryServer, ServerConfig};
use crate::trove::TroveTuple;
use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Work deferred until the call's transaction has committed
#[derive(Debug, Default)]
pub struct Effects {
    /// Troves handed to the commit notifier
    pub committed: Vec<TroveTuple>,
    /// Troves whose cached change sets are swept
    pub invalidate: Vec<TroveTuple>,
    /// Scratch files deleted after success
    pub cleanup: Vec<PathBuf>,
}

/// Files handed to the caller by one attempt
#[derive(Debug, Default)]
pub struct Scratch(RefCell<Vec<PathBuf>>);

impl Scratch {
    fn push(&self, path: PathBuf) {
        self.0.borrow_mut().push(path);
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.0.borrow().clone()
    }

    /// Delete every file of a failed attempt, returning how many were removed
    pub fn discard(self) -> usize {
        let mut removed = 0;
        for path in self.0.into_inner() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}

pub struct CallContext<'c> {
    pub conn: &'c Connection,
    pub auth: &'c Authorizer<'c>,
    /// Protocol version negotiated for this call
    pub protocol: u32,
    pub server: &'c RepositoryServer,
    effects: RefCell<Effects>,
    scratch: &'c Scratch,
}

impl<'c> CallContext<'c> {
    pub fn new(
        conn: &'c Connection,
        auth: &'c Authorizer<'c>,
        protocol: u32,
        server: &'c RepositoryServer,
        scratch: &'c Scratch,
    ) -> Self {
        Self {
            conn,
            auth,
            protocol,
            server,
            effects: RefCell::new(Effects::default()),
            scratch,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.server.config
    }

    pub fn server_names(&self) -> &[String] {
        &self.server.config.server_names
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.server.config.tmp_dir
    }

    pub fn record_commit(&self, troves: &[TroveTuple]) {
        self.effects.borrow_mut().committed.extend_from_slice(troves);
    }

    pub fn invalidate(&self, troves: &[TroveTuple]) {
        self.effects.borrow_mut().invalidate.extend_from_slice(troves);
    }

    pub fn cleanup(&self, path: PathBuf) {
        self.effects.borrow_mut().cleanup.push(path);
    }

    /// Record a file written for the caller
    pub fn hand_out(&self, path: PathBuf) {
        self.scratch.push(path);
    }

    pub fn into_effects(self) -> Effects {
        self.effects.into_inner()
    }
}

/// Decode handler parameters; a missing parameter object counts as empty
pub fn params<T: DeserializeOwned>(value: Value) -> Result<T> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| Error::InvalidRequest(format!("bad parameters: {e}")))
}

/// Encode a handler result
pub fn reply<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Write a `path size` manifest for the caller's file server
///
/// Returns the manifest location.
pub fn write_manifest(tmp_dir: &Path, entries: &[(PathBuf, u64)]) -> Result<PathBuf> {
    fs::create_dir_all(tmp_dir)?;
    let mut temp = tempfile::Builder::new()
        .prefix("manifest-")
        .suffix(".txt")
        .tempfile_in(tmp_dir)?;
    for (path, size) in entries {
        writeln!(temp, "{} {}", path.display(), size)?;
    }
    let (_, path) = temp.keep().map_err(|e| Error::Io(e.error))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        label: Option<String>,
    }

    #[test]
    fn test_params_accepts_null() {
        let sample: Sample = params(Value::Null).unwrap();
        assert!(sample.label.is_none());
    }

    #[test]
    fn test_params_rejects_wrong_shape() {
        let err = params::<Sample>(serde_json::json!({"label": 7})).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_discard_removes_handed_out_files() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = Scratch::default();
        let manifest = write_manifest(dir.path(), &[]).unwrap();
        scratch.push(manifest.clone());
        scratch.push(dir.path().join("already-gone"));

        assert_eq!(scratch.paths().len(), 2);
        assert_eq!(scratch.discard(), 1);
        assert!(!manifest.exists());
    }

    #[test]
    fn test_manifest_lines() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![(PathBuf::from("/x/a"), 3), (PathBuf::from("/x/b"), 10)];
        let path = write_manifest(dir.path(), &entries).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "/x/a 3\n/x/b 10\n");
    }
}
