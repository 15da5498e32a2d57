// src/commit/mod.rs

//! Commit pipeline
//!
//! A commit applies one change set inside the caller's transaction:
//!
//! 1. permission checks for every trove introduced or removed
//! 2. file contents shipped in the change set go to the content store
//! 3. instances, references, files and info blocks are inserted under a
//!    single new `changed` value
//!
//! Nothing here retries. Lock conflicts propagate unchanged so the call loop
//! can rerun the whole call.

pub mod notify;
pub mod signature;

pub use notify::{CommandNotifier, CommitNotifier, NoopNotifier};

use crate::auth::{Access, Authorizer};
use crate::changeset::{ChangeSet, TroveChange, hosted_locally};
use crate::db;
use crate::db::models::{
    BranchEntry, InfoType, Instance, TroveFileEntry, TroveInfo, TroveReference, TroveState,
};
use crate::error::{Error, Result};
use crate::filesystem::ContentStore;
use crate::hash::Digest;
use crate::trove::TroveTuple;
use crate::version::Version;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of upload files allocated by [`prepare_upload`]
const UPLOAD_PREFIX: &str = "upload-";

/// Flags of a commit call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOptions {
    /// Commit issued by a mirroring client
    pub mirror: bool,
    /// Stage the troves hidden until `presentHiddenTroves`
    pub hidden: bool,
}

/// What a successful commit changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Identities of the inserted troves
    pub committed: Vec<TroveTuple>,
    /// Identities of troves turned into removal tombstones
    pub removed: Vec<TroveTuple>,
    /// The `changed` value stamped on every row of this commit
    pub changed: i64,
}

/// Applies change sets against one connection
pub struct CommitPipeline<'a> {
    conn: &'a Connection,
    auth: &'a Authorizer<'a>,
    store: &'a ContentStore,
    server_names: &'a [String],
}

impl<'a> CommitPipeline<'a> {
    pub fn new(
        conn: &'a Connection,
        auth: &'a Authorizer<'a>,
        store: &'a ContentStore,
        server_names: &'a [String],
    ) -> Self {
        Self {
            conn,
            auth,
            store,
            server_names,
        }
    }

    fn check_permissions(&self, cs: &ChangeSet, options: CommitOptions) -> Result<(Vec<TroveTuple>, Vec<TroveTuple>)> {
        if options.hidden && !(self.auth.auth_check(false, true)? || self.auth.is_admin()?) {
            return Err(Error::InsufficientPermission);
        }
        if options.mirror {
            self.auth.require_mirror()?;
        }

        let added = cs
            .troves
            .iter()
            .map(|t| t.trove.identity())
            .collect::<Result<Vec<_>>>()?;
        let removed = cs
            .removed
            .iter()
            .map(TroveTuple::identity)
            .collect::<Result<Vec<_>>>()?;

        self.auth.require_troves(&added, Access::Write)?;
        self.auth.require_troves(&removed, Access::Write)?;
        self.auth.require_troves(&removed, Access::Remove)?;
        Ok((added, removed))
    }

    /// Apply `cs` in the current transaction
    pub fn commit(&self, cs: &ChangeSet, options: CommitOptions) -> Result<CommitOutcome> {
        let (added, removed) = self.check_permissions(cs, options)?;
        if added.is_empty() && removed.is_empty() {
            return Err(Error::commit_failed("change set is empty"));
        }

        for contents in &cs.contents {
            let digest = Digest::new(contents.sha256.clone())?;
            self.store.store_reader(contents.data.as_slice(), Some(&digest))?;
        }

        let changed = db::next_change(self.conn)?;
        let state = if options.hidden {
            TroveState::Hidden
        } else {
            TroveState::Normal
        };

        for (change, identity) in cs.troves.iter().zip(&added) {
            self.insert_trove(change, identity, state, changed)?;
        }
        for identity in &removed {
            self.mark_removed(identity, changed)?;
        }

        info!(
            "Committed {} trove(s), removed {} ({}), changed={}",
            added.len(),
            removed.len(),
            if options.hidden { "hidden" } else { "visible" },
            changed
        );
        Ok(CommitOutcome {
            committed: added,
            removed,
            changed,
        })
    }

    fn insert_trove(&self, change: &TroveChange, identity: &TroveTuple, state: TroveState, changed: i64) -> Result<()> {
        if Instance::find(self.conn, identity)?.is_some() {
            return Err(Error::commit_failed(format!("{identity} already exists")));
        }

        let mut version = Version::parse(&change.trove.version)?;
        if version.timestamps.is_empty() {
            version = version.with_timestamps(vec![signature::now_millis()]);
        }
        let branch_id = BranchEntry::insert_or_get(self.conn, &version.branch)?;

        let mut instance = Instance::new(&version, &identity.name, &identity.flavor, branch_id);
        instance.state = state;
        instance.changed = changed;
        instance.source_name = change.source_name.clone();
        let instance_id = instance.insert(self.conn)?;

        for reference in &change.references {
            TroveReference::new(instance_id, reference.trove.identity()?, reference.weak).insert(self.conn)?;
        }

        for file in self.file_list(change, identity)? {
            TroveFileEntry { instance_id, ..file }.insert(self.conn)?;
        }

        let blocks = [
            (InfoType::Sigs, &change.sigs),
            (InfoType::Metadata, &change.metadata),
            (InfoType::BuildInfo, &change.build_info),
        ];
        for (info_type, data) in blocks {
            if let Some(data) = data {
                TroveInfo::new(instance_id, info_type, data.clone(), changed).upsert(self.conn)?;
            }
        }

        debug!("Inserted {} as {}", identity, state.as_str());
        Ok(())
    }

    /// Full file list of the new trove, merging a relative change onto its old trove
    fn file_list(&self, change: &TroveChange, identity: &TroveTuple) -> Result<Vec<TroveFileEntry>> {
        let mut files: BTreeMap<String, TroveFileEntry> = BTreeMap::new();

        if !change.absolute {
            let old_version = change
                .old_version
                .as_deref()
                .ok_or_else(|| Error::commit_failed(format!("relative change for {identity} names no old version")))?;
            let old = TroveTuple::new(&identity.name, old_version, &identity.flavor).identity()?;
            let old_instance = Instance::find(self.conn, &old)?
                .filter(|i| i.state == TroveState::Normal)
                .ok_or_else(|| Error::CommitFailed {
                    reason: format!("old trove {old} is not present"),
                    cause: Some(Box::new(Error::missing(&old.name, Some(old.version.clone())))),
                })?;
            let old_id = old_instance
                .id
                .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;
            for file in TroveFileEntry::find_for_instance(self.conn, old_id)? {
                files.insert(file.path.clone(), file);
            }
            for path in &change.removed_files {
                files.remove(path);
            }
        }

        for file in &change.files {
            let file_trove = TroveTuple::new(&identity.name, &file.file_version, "");
            let digest = Digest::new(file.sha256.clone())?;
            if hosted_locally(&file_trove, self.server_names) && !self.store.exists(&digest) {
                return Err(Error::CommitFailed {
                    reason: format!("contents of {} in {} were not shipped", file.path, identity),
                    cause: Some(Box::new(Error::ContentNotFound(file.sha256.clone()))),
                });
            }
            files.insert(
                file.path.clone(),
                TroveFileEntry {
                    instance_id: 0,
                    path: file.path.clone(),
                    file_id: file.file_id.clone(),
                    file_version: file.file_version.clone(),
                    sha256: file.sha256.clone(),
                    size: file.size as i64,
                    mode: file.mode,
                },
            );
        }

        Ok(files.into_values().collect())
    }

    fn mark_removed(&self, identity: &TroveTuple, changed: i64) -> Result<()> {
        let mut instance = Instance::find(self.conn, identity)?
            .filter(|i| i.state != TroveState::Removed)
            .ok_or_else(|| Error::missing(&identity.name, Some(identity.version.clone())))?;
        instance.set_state(self.conn, TroveState::Removed, changed)?;
        debug!("Marked {} removed", identity);
        Ok(())
    }
}

/// Publish every hidden trove; needs mirror or admin rights
pub fn present_hidden_troves(conn: &Connection, auth: &Authorizer<'_>) -> Result<Vec<TroveTuple>> {
    if !(auth.auth_check(false, true)? || auth.is_admin()?) {
        return Err(Error::InsufficientPermission);
    }

    let hidden = Instance::find_by_state(conn, TroveState::Hidden)?;
    if hidden.is_empty() {
        return Ok(Vec::new());
    }

    let changed = db::next_change(conn)?;
    let mut published = Vec::with_capacity(hidden.len());
    for mut instance in hidden {
        instance.set_state(conn, TroveState::Normal, changed)?;
        published.push(instance.tuple());
    }
    info!("Published {} hidden trove(s), changed={}", published.len(), changed);
    Ok(published)
}

/// Replace a trove's metadata block; returns the trove's identity
pub fn update_metadata(conn: &Connection, auth: &Authorizer<'_>, trove: &TroveTuple, metadata: &[u8]) -> Result<TroveTuple> {
    let identity = trove.identity()?;
    auth.require_troves(std::slice::from_ref(&identity), Access::Write)?;

    let instance = Instance::find(conn, &identity)?
        .filter(|i| i.state == TroveState::Normal)
        .ok_or_else(|| Error::missing(&identity.name, Some(identity.version.clone())))?;
    let instance_id = instance
        .id
        .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;

    TroveInfo::lock_for_update(conn, instance_id, InfoType::Metadata)?;
    let changed = db::next_change(conn)?;
    TroveInfo::new(instance_id, InfoType::Metadata, metadata.to_vec(), changed).upsert(conn)?;
    info!("Updated metadata of {}", identity);
    Ok(identity)
}

/// Allocate an upload location under `tmp_dir`, returning its name
pub fn prepare_upload(tmp_dir: &Path) -> Result<String> {
    fs::create_dir_all(tmp_dir)?;
    let file = tempfile::Builder::new()
        .prefix(UPLOAD_PREFIX)
        .suffix(".ccs")
        .tempfile_in(tmp_dir)?;
    let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Config(format!("unusable upload path {}", path.display())))
}

/// Resolve an upload name from [`prepare_upload`] to its path
pub fn upload_path(tmp_dir: &Path, name: &str) -> Result<PathBuf> {
    let valid = name.starts_with(UPLOAD_PREFIX)
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..");
    if !valid {
        return Err(Error::InvalidRequest(format!("invalid upload name {name}")));
    }
    Ok(tmp_dir.join(name))
}

/// Read and parse an uploaded change set
pub fn read_upload(tmp_dir: &Path, name: &str) -> Result<ChangeSet> {
    let path = upload_path(tmp_dir, name)?;
    let bytes = fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::InvalidRequest(format!("no upload named {name}")),
        _ => Error::Io(e),
    })?;
    ChangeSet::from_cbor(&bytes).map_err(|e| Error::CommitFailed {
        reason: format!("unreadable change set {name}"),
        cause: Some(Box::new(e)),
    })
}
