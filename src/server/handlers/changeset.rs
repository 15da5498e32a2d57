// src/server/handlers/changeset.rs
//! Change-set retrieval

use crate::auth::Access;
use crate::changeset::cache::write_temporary;
use crate::changeset::fingerprint::{self, Reached};
use crate::changeset::{CacheEntry, ChangeSetBuilder, Fingerprint, Job, JobFlags, NeededFile};
use crate::error::{Error, Result};
use crate::resolver::Resolver;
use crate::server::context::{CallContext, params, reply, write_manifest};
use crate::server::registry::Operation;
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub fn operations() -> Vec<Operation> {
    vec![Operation::read("getChangeSet", get_change_set)]
}

#[derive(Debug, Deserialize)]
struct ChangeSetParams {
    jobs: Vec<Job>,
    #[serde(flatten)]
    flags: JobFlags,
}

/// Reply of `getChangeSet`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetReply {
    /// Manifest listing one `path size` line per job
    pub location: String,
    pub sizes: Vec<u64>,
    pub troves_needed: Vec<TroveTuple>,
    pub files_needed: Vec<NeededFile>,
}

/// Every embedded local trove must be readable; otherwise the job fails
/// as if the trove did not exist
fn check_reached(ctx: &CallContext<'_>, reached: &[Reached]) -> Result<()> {
    let local: Vec<TroveTuple> = reached
        .iter()
        .filter(|r| r.local && r.instance.is_some())
        .map(|r| r.trove.clone())
        .collect();
    let granted = ctx.auth.batch_check(&local, Access::Read)?;
    match local.iter().zip(granted).find(|(_, ok)| !ok) {
        Some((trove, _)) => Err(Error::missing(&trove.name, Some(trove.version.clone()))),
        None => Ok(()),
    }
}

fn produce(ctx: &CallContext<'_>, job: &Job, flags: JobFlags) -> Result<CacheEntry> {
    let job = job.normalize()?;
    let resolver = Resolver::new(ctx.conn, ctx.auth);
    resolver.require_visible(&job.new)?;
    if let Some(old) = &job.old {
        resolver.require_visible(old)?;
    }

    let reached = fingerprint::reachable(ctx.conn, &job.new, flags.recurse, ctx.server_names())?;
    check_reached(ctx, &reached)?;

    let builder = ChangeSetBuilder::new(ctx.conn, &ctx.server.store, ctx.server_names());
    let fingerprint = Fingerprint::compute(ctx.conn, &job, flags, &reached)?;
    match (fingerprint, &ctx.server.cache) {
        (Some(fp), Some(cache)) => cache.get_or_build(&fp, || builder.build(&job, flags, &reached)),
        (fp, _) => {
            if fp.is_none() {
                debug!("Job for {} is uncacheable", job.new);
            }
            let built = builder.build(&job, flags, &reached)?;
            let entry = write_temporary(ctx.tmp_dir(), &built)?;
            ctx.hand_out(entry.path.clone());
            Ok(entry)
        }
    }
}

fn get_change_set(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: ChangeSetParams = params(value)?;
    if p.jobs.is_empty() {
        return Err(Error::InvalidRequest("no jobs requested".to_string()));
    }

    let mut artifacts = Vec::with_capacity(p.jobs.len());
    let mut troves_needed = Vec::new();
    let mut files_needed = Vec::new();
    for job in &p.jobs {
        let entry = produce(ctx, job, p.flags)?;
        artifacts.push((entry.path, entry.size));
        troves_needed.extend(entry.troves_needed);
        files_needed.extend(entry.files_needed);
    }
    troves_needed.sort();
    troves_needed.dedup();
    files_needed.sort();
    files_needed.dedup();

    let manifest = write_manifest(ctx.tmp_dir(), &artifacts)?;
    ctx.hand_out(manifest.clone());
    reply(&ChangeSetReply {
        location: manifest.display().to_string(),
        sizes: artifacts.iter().map(|(_, size)| *size).collect(),
        troves_needed,
        files_needed,
    })
}
