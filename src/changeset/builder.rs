// src/changeset/builder.rs

//! Materializes change sets from stored troves

use super::fingerprint::Reached;
use super::{
    ChangeSet, FileChange, FileContents, Job, JobFlags, NeededFile, TroveChange, TroveRef,
    hosted_locally,
};
use crate::db::models::{InfoType, Instance, TroveFileEntry, TroveInfo, TroveReference, TroveState};
use crate::error::{Error, Result};
use crate::filesystem::ContentStore;
use crate::hash::Digest;
use crate::trove::TroveTuple;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A built change set plus what the client must fetch elsewhere
#[derive(Debug, Clone)]
pub struct BuiltChangeSet {
    pub changeset: ChangeSet,
    /// Troves hosted on other repositories
    pub troves_needed: Vec<TroveTuple>,
    /// Files whose contents live on other repositories
    pub files_needed: Vec<NeededFile>,
    /// Identities of every trove embedded, for cache invalidation
    pub embedded: Vec<TroveTuple>,
}

pub struct ChangeSetBuilder<'a> {
    conn: &'a Connection,
    store: &'a ContentStore,
    server_names: &'a [String],
}

impl<'a> ChangeSetBuilder<'a> {
    pub fn new(conn: &'a Connection, store: &'a ContentStore, server_names: &'a [String]) -> Self {
        Self {
            conn,
            store,
            server_names,
        }
    }

    /// Build the change set for a normalized job
    ///
    /// `reached` comes from [`super::fingerprint::reachable`] so the builder
    /// embeds exactly the troves the fingerprint covered.
    pub fn build(&self, job: &Job, flags: JobFlags, reached: &[Reached]) -> Result<BuiltChangeSet> {
        let mut changeset = ChangeSet::new();
        let mut troves_needed = Vec::new();
        let mut files_needed = Vec::new();
        let mut embedded = Vec::new();
        let mut shipped = BTreeSet::new();

        for entry in reached {
            if !entry.local {
                troves_needed.push(entry.trove.clone());
                continue;
            }
            let Some(instance) = &entry.instance else {
                if entry.weak {
                    continue;
                }
                return Err(Error::missing(&entry.trove.name, Some(entry.trove.version.clone())));
            };

            let old = if entry.trove == job.new && !job.absolute {
                match &job.old {
                    Some(old) => Some(self.find_old(old)?),
                    None => None,
                }
            } else {
                None
            };

            let trove = self.trove_change(instance, old.as_ref(), flags)?;
            if flags.with_file_contents {
                for file in &trove.files {
                    let file_trove = TroveTuple::new(&trove.trove.name, &file.file_version, "");
                    if !hosted_locally(&file_trove, self.server_names) {
                        files_needed.push(NeededFile {
                            trove: instance.tuple(),
                            path: file.path.clone(),
                            file_id: file.file_id.clone(),
                            file_version: file.file_version.clone(),
                        });
                        continue;
                    }
                    if shipped.insert(file.sha256.clone()) {
                        let digest = Digest::new(file.sha256.clone())?;
                        changeset.contents.push(FileContents {
                            sha256: file.sha256.clone(),
                            data: self.store.retrieve(&digest)?,
                        });
                    }
                }
            }

            if entry.trove == job.new {
                changeset.primary.push(trove.trove.clone());
            }
            embedded.push(entry.trove.clone());
            changeset.troves.push(trove);
        }

        debug!(
            "Built change set for {}: {} trove(s), {} content blob(s), {} needed elsewhere",
            job.new,
            changeset.troves.len(),
            changeset.contents.len(),
            troves_needed.len() + files_needed.len()
        );

        Ok(BuiltChangeSet {
            changeset,
            troves_needed,
            files_needed,
            embedded,
        })
    }

    fn find_old(&self, old: &TroveTuple) -> Result<Instance> {
        Instance::find(self.conn, old)?
            .filter(|i| i.state == TroveState::Normal)
            .ok_or_else(|| Error::missing(&old.name, Some(old.version.clone())))
    }

    fn trove_change(&self, instance: &Instance, old: Option<&Instance>, flags: JobFlags) -> Result<TroveChange> {
        let id = instance
            .id
            .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;

        let mut change = TroveChange::new(instance.frozen_tuple()?);
        change.source_name = instance.source_name.clone();
        change.references = TroveReference::find_for_instance(self.conn, id)?
            .into_iter()
            .map(|r| TroveRef {
                trove: r.target,
                weak: r.weak,
            })
            .collect();

        let files = TroveFileEntry::find_for_instance(self.conn, id)?;
        let old_files: BTreeMap<String, TroveFileEntry> = match old {
            Some(old) => {
                change.absolute = false;
                change.old_version = Some(old.full_version()?.freeze());
                let old_id = old
                    .id
                    .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;
                TroveFileEntry::find_for_instance(self.conn, old_id)?
                    .into_iter()
                    .map(|f| (f.path.clone(), f))
                    .collect()
            }
            None => BTreeMap::new(),
        };

        let new_paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        change.removed_files = old_files
            .keys()
            .filter(|path| !new_paths.contains(path.as_str()))
            .cloned()
            .collect();

        if flags.with_files {
            change.files = files
                .iter()
                .filter(|f| old_files.get(&f.path).is_none_or(|o| o.file_id != f.file_id))
                .map(|f| FileChange {
                    path: f.path.clone(),
                    file_id: f.file_id.clone(),
                    file_version: f.file_version.clone(),
                    sha256: f.sha256.clone(),
                    size: f.size.max(0) as u64,
                    mode: f.mode,
                })
                .collect();
        }

        for info in TroveInfo::find_for_instance(self.conn, id)? {
            match info.info_type {
                InfoType::Sigs => change.sigs = Some(info.data),
                InfoType::Metadata => change.metadata = Some(info.data),
                InfoType::BuildInfo => change.build_info = Some(info.data),
            }
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::fingerprint::reachable;
    use crate::db;
    use crate::db::models::BranchEntry;
    use crate::version::Version;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        conn: Connection,
        store: ContentStore,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.db");
        db::init(&path).unwrap();
        let conn = db::open(&path).unwrap();
        let store = ContentStore::new(dir.path().join("contents")).unwrap();
        Fixture {
            _dir: dir,
            conn,
            store,
        }
    }

    fn add(fx: &Fixture, name: &str, version: &str, files: &[(&str, &[u8])]) -> (TroveTuple, i64) {
        let version = Version::parse(&format!("/a.example.com@rpl:devel/1000.000:{version}")).unwrap();
        let branch_id = BranchEntry::insert_or_get(&fx.conn, &version.branch).unwrap();
        let mut instance = Instance::new(&version, name, "", branch_id);
        let id = instance.insert(&fx.conn).unwrap();
        for (path, data) in files {
            let digest = fx.store.store(data).unwrap();
            TroveFileEntry {
                instance_id: id,
                path: path.to_string(),
                file_id: crate::hash::sha256(format!("{path}:{digest}").as_bytes()),
                file_version: version.as_string(),
                sha256: digest.to_string(),
                size: data.len() as i64,
                mode: 0o644,
            }
            .insert(&fx.conn)
            .unwrap();
        }
        (instance.tuple(), id)
    }

    fn build(fx: &Fixture, job: &Job, flags: JobFlags, server_names: &[String]) -> BuiltChangeSet {
        let reached = reachable(&fx.conn, &job.new, flags.recurse, server_names).unwrap();
        ChangeSetBuilder::new(&fx.conn, &fx.store, server_names)
            .build(job, flags, &reached)
            .unwrap()
    }

    const ALL: JobFlags = JobFlags {
        recurse: true,
        with_files: true,
        with_file_contents: true,
    };

    #[test]
    fn test_absolute_job_ships_everything() {
        let fx = setup();
        let (foo, _) = add(&fx, "foo", "1.0-1-1", &[("/a", b"one"), ("/b", b"two")]);

        let built = build(&fx, &Job::fresh(foo), ALL, &[]);
        let cs = built.changeset;
        assert_eq!(cs.primary.len(), 1);
        assert!(cs.primary[0].version.contains("1000.000:"));
        assert_eq!(cs.troves[0].files.len(), 2);
        assert_eq!(cs.contents.len(), 2);
        assert!(built.troves_needed.is_empty());
    }

    #[test]
    fn test_relative_job_ships_only_changes() {
        let fx = setup();
        let (old, _) = add(&fx, "foo", "1.0-1-1", &[("/a", b"one"), ("/b", b"two")]);
        let (new, _) = add(&fx, "foo", "1.1-1-1", &[("/a", b"one"), ("/c", b"three")]);

        let job = Job {
            old: Some(old),
            new,
            absolute: false,
        };
        let cs = build(&fx, &job, ALL, &[]).changeset;
        let trove = &cs.troves[0];
        assert!(!trove.absolute);
        assert!(trove.old_version.is_some());
        let paths: Vec<&str> = trove.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/c"]);
        assert_eq!(trove.removed_files, vec!["/b".to_string()]);
    }

    #[test]
    fn test_without_files_ships_no_contents() {
        let fx = setup();
        let (foo, _) = add(&fx, "foo", "1.0-1-1", &[("/a", b"one")]);
        let cs = build(&fx, &Job::fresh(foo), JobFlags::default(), &[]).changeset;
        assert!(cs.troves[0].files.is_empty());
        assert!(cs.contents.is_empty());
    }

    #[test]
    fn test_remote_references_become_needed() {
        let fx = setup();
        let (group, group_id) = add(&fx, "group-foo", "1.0-1-1", &[]);
        let remote = TroveTuple::new("bar", "/b.example.com@rpl:devel/1.0-1-1", "");
        TroveReference::new(group_id, remote.clone(), false).insert(&fx.conn).unwrap();

        let built = build(&fx, &Job::fresh(group), ALL, &["a.example.com".to_string()]);
        assert_eq!(built.troves_needed, vec![remote]);
        assert_eq!(built.changeset.troves.len(), 1);
    }

    #[test]
    fn test_missing_strong_child_fails() {
        let fx = setup();
        let (group, group_id) = add(&fx, "group-foo", "1.0-1-1", &[]);
        let ghost = TroveTuple::new("bar", "/a.example.com@rpl:devel/1.0-1-1", "");
        TroveReference::new(group_id, ghost, false).insert(&fx.conn).unwrap();

        let reached = reachable(&fx.conn, &group, true, &[]).unwrap();
        let err = ChangeSetBuilder::new(&fx.conn, &fx.store, &[])
            .build(&Job::fresh(group), ALL, &reached)
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactMissing { .. }));
    }

    #[test]
    fn test_shared_contents_ship_once() {
        let fx = setup();
        let (foo, _) = add(&fx, "foo", "1.0-1-1", &[("/a", b"same"), ("/b", b"same")]);
        let cs = build(&fx, &Job::fresh(foo), ALL, &[]).changeset;
        assert_eq!(cs.contents.len(), 1);
    }
}
