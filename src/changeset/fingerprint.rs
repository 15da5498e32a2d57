// src/changeset/fingerprint.rs

//! Content-derived cache keys for change-set requests
//!
//! A fingerprint covers the request (job and flags) and the mutable state of
//! every trove the change set would embed: for each reachable trove, a hash
//! of its signature and metadata blocks, or a sentinel when the trove is not
//! present here. Changing a trove's signatures or metadata therefore changes
//! every fingerprint that embedded it, so stale cache entries stop matching.

use super::{Job, JobFlags, hosted_locally};
use crate::db::models::{InfoType, Instance, TroveInfo, TroveReference, TroveState};
use crate::error::Result;
use crate::hash::FieldHasher;
use crate::trove::TroveTuple;
use rusqlite::Connection;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::debug;

/// Version tag of the fingerprint scheme itself
pub const SCHEME: &str = "reposerver-changeset-v1";

const REMOTE: &str = "remote";
const ABSENT: &str = "absent";
const UNSIGNED: &str = "unsigned";

/// A trove reachable from a job's new trove
#[derive(Debug, Clone)]
pub struct Reached {
    /// Canonical identity
    pub trove: TroveTuple,
    /// Reached only through weak references
    pub weak: bool,
    /// The local, published instance, if there is one
    pub instance: Option<Instance>,
    pub local: bool,
}

fn lookup(conn: &Connection, trove: &TroveTuple, server_names: &[String]) -> Result<(bool, Option<Instance>)> {
    if !hosted_locally(trove, server_names) {
        return Ok((false, None));
    }
    let instance = Instance::find(conn, trove)?.filter(|i| i.state == TroveState::Normal);
    Ok((true, instance))
}

/// Every trove a job embeds, in identity order
///
/// Without `recurse` only the root is returned. With it, strong references
/// are followed transitively; weak references are recorded but not expanded
/// since they already list the flattened membership.
pub fn reachable(
    conn: &Connection,
    root: &TroveTuple,
    recurse: bool,
    server_names: &[String],
) -> Result<Vec<Reached>> {
    let mut weak_flags: BTreeMap<TroveTuple, bool> = BTreeMap::new();
    let mut found: BTreeMap<TroveTuple, (bool, Option<Instance>)> = BTreeMap::new();
    let mut queue = VecDeque::from([root.clone()]);
    weak_flags.insert(root.clone(), false);

    while let Some(trove) = queue.pop_front() {
        let (local, instance) = lookup(conn, &trove, server_names)?;
        if recurse {
            if let Some(id) = instance.as_ref().and_then(|i| i.id) {
                for reference in TroveReference::find_for_instance(conn, id)? {
                    let target = reference.target;
                    match (weak_flags.get(&target).copied(), reference.weak) {
                        (None, true) => {
                            weak_flags.insert(target, true);
                        }
                        (None, false) | (Some(true), false) => {
                            weak_flags.insert(target.clone(), false);
                            queue.push_back(target);
                        }
                        _ => {}
                    }
                }
            }
        }
        found.insert(trove, (local, instance));
    }

    let mut reached = Vec::with_capacity(weak_flags.len());
    for (trove, weak) in weak_flags {
        let (local, instance) = match found.remove(&trove) {
            Some(entry) => entry,
            None => lookup(conn, &trove, server_names)?,
        };
        reached.push(Reached {
            trove,
            weak,
            instance,
            local,
        });
    }
    Ok(reached)
}

/// Hash of a trove's signature and metadata blocks, or a sentinel
fn info_hash(conn: &Connection, reached: &Reached) -> Result<String> {
    let Some(id) = reached.instance.as_ref().and_then(|i| i.id) else {
        return Ok(if reached.local { ABSENT } else { REMOTE }.to_string());
    };

    let sigs = TroveInfo::find(conn, id, InfoType::Sigs)?;
    let metadata = TroveInfo::find(conn, id, InfoType::Metadata)?;
    if sigs.is_none() && metadata.is_none() {
        return Ok(UNSIGNED.to_string());
    }

    let mut hasher = FieldHasher::new();
    hasher
        .optional(sigs.as_ref().map(|s| s.data.as_slice()))
        .optional(metadata.as_ref().map(|m| m.data.as_slice()));
    Ok(hasher.finish())
}

/// A change-set cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key for `job` (already normalized) given the troves it reaches
    ///
    /// Returns `None` when the job is uncacheable: some trove is reached only
    /// weakly and is not present here.
    pub fn compute(conn: &Connection, job: &Job, flags: JobFlags, reached: &[Reached]) -> Result<Option<Self>> {
        let mut hasher = FieldHasher::new();
        hasher
            .field(SCHEME)
            .field(&job.new.name)
            .field(&job.new.version)
            .field(&job.new.flavor);
        let old = job.old.as_ref().map(|o| format!("{}\n{}", o.version, o.flavor));
        hasher.optional(old.as_deref().map(str::as_bytes));
        hasher.field([
            job.absolute as u8,
            flags.recurse as u8,
            flags.with_files as u8,
            flags.with_file_contents as u8,
        ]);

        for entry in reached {
            if entry.weak && entry.instance.is_none() {
                debug!("Job for {} is uncacheable: {} reached weakly", job.new, entry.trove);
                return Ok(None);
            }
            hasher
                .field(&entry.trove.name)
                .field(&entry.trove.version)
                .field(&entry.trove.flavor)
                .field([entry.weak as u8])
                .field(info_hash(conn, entry)?);
        }

        Ok(Some(Self(hasher.finish())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn for_test(seed: &str) -> Self {
        Self(crate::hash::sha256(seed.as_bytes()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
