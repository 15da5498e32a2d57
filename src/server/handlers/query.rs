// src/server/handlers/query.rs
//! Read-only lookup operations
//!
//! Everything here answers only for troves the caller may read; a trove the
//! caller cannot see looks exactly like one that does not exist.

use super::encode_bytes;
use crate::auth::Access;
use crate::db::models::{InfoType, Instance, TroveFileEntry, TroveInfo, TroveReference, TroveState};
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::Digest;
use crate::resolver::{FlavorMode, LatestMode, Resolver, TroveQuery, TroveSpec, VersionMatch};
use crate::server::context::{CallContext, params, reply, write_manifest};
use crate::server::registry::{MAX_PROTOCOL, MIN_PROTOCOL, Operation};
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::read("checkVersion", check_version),
        Operation::read("troveNames", trove_names),
        Operation::read("getTroveVersionList", get_trove_version_list),
        Operation::read("getTroveVersionFlavors", get_trove_version_flavors),
        Operation::read("getAllTroveLeaves", get_all_trove_leaves),
        Operation::read("getTroveVersionsByBranch", get_trove_versions_by_branch),
        Operation::read("getTroveLeavesByBranch", get_trove_leaves_by_branch),
        Operation::read("getTroveVersionsByLabel", get_trove_versions_by_label),
        Operation::read("getTroveLeavesByLabel", get_trove_leaves_by_label),
        Operation::read("getTroveLatestVersion", get_trove_latest_version),
        Operation::read("hasTroves", has_troves),
        Operation::read("getCollectionMembers", get_collection_members),
        Operation::read("getTrovesBySource", get_troves_by_source),
        Operation::read("getMetadata", get_metadata),
        Operation::read("getFileContents", get_file_contents),
    ]
}

/// A resolution filter as sent by clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecParam {
    #[serde(default)]
    pub name: Option<String>,
    /// Label, branch or version depending on the operation
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub flavors: Option<Vec<String>>,
}

impl SpecParam {
    fn to_spec(&self) -> Result<TroveSpec> {
        let flavors = match &self.flavors {
            Some(list) => Some(list.iter().map(|f| Flavor::parse(f)).collect::<Result<Vec<_>>>()?),
            None => None,
        };
        Ok(TroveSpec {
            name: self.name.clone(),
            version: self.version.clone(),
            flavors,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SpecsParams {
    #[serde(default)]
    specs: Vec<SpecParam>,
    /// Keep only the best-scoring flavor per request
    #[serde(default)]
    best_flavor: bool,
}

/// Run a resolution with the flavor mode chosen by the caller
fn resolve_specs(ctx: &CallContext<'_>, value: Value, version_match: VersionMatch, latest: LatestMode) -> Result<Value> {
    let p: SpecsParams = params(value)?;
    let specs = p.specs.iter().map(SpecParam::to_spec).collect::<Result<Vec<_>>>()?;
    let flavor_mode = if p.best_flavor {
        FlavorMode::BestFlavor
    } else {
        FlavorMode::AllowedFlavor
    };
    let query = TroveQuery::new(version_match, latest, flavor_mode);
    reply(&Resolver::new(ctx.conn, ctx.auth).resolve(&query, &specs)?)
}

fn check_version(_ctx: &CallContext<'_>, _value: Value) -> Result<Value> {
    reply(&(MIN_PROTOCOL..=MAX_PROTOCOL).collect::<Vec<u32>>())
}

#[derive(Debug, Default, Deserialize)]
struct LabelParams {
    #[serde(default)]
    label: Option<String>,
}

fn trove_names(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: LabelParams = params(value)?;
    reply(&Resolver::new(ctx.conn, ctx.auth).trove_names(p.label.as_deref())?)
}

fn get_trove_version_list(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::None, LatestMode::AllVersions)
}

fn get_trove_version_flavors(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::Version, LatestMode::AllVersions)
}

fn get_all_trove_leaves(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::None, LatestMode::LatestOnly)
}

fn get_trove_versions_by_branch(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::Branch, LatestMode::AllVersions)
}

fn get_trove_leaves_by_branch(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::Branch, LatestMode::LatestOnly)
}

fn get_trove_versions_by_label(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::Label, LatestMode::AllVersions)
}

fn get_trove_leaves_by_label(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    resolve_specs(ctx, value, VersionMatch::Label, LatestMode::LatestOnly)
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    name: String,
    branch: String,
}

fn get_trove_latest_version(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: LatestParams = params(value)?;
    reply(&Resolver::new(ctx.conn, ctx.auth).latest_version(&p.name, &p.branch)?)
}

#[derive(Debug, Deserialize)]
struct TrovesParams {
    troves: Vec<TroveTuple>,
}

fn has_troves(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: TrovesParams = params(value)?;
    reply(&Resolver::new(ctx.conn, ctx.auth).has_troves(&p.troves)?)
}

#[derive(Debug, Deserialize)]
struct TroveParams {
    trove: TroveTuple,
}

/// A containment edge of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub trove: TroveTuple,
    pub weak: bool,
}

fn get_collection_members(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: TroveParams = params(value)?;
    let instance = Resolver::new(ctx.conn, ctx.auth).require_visible(&p.trove)?;
    let instance_id = instance
        .id
        .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;

    let refs = TroveReference::find_for_instance(ctx.conn, instance_id)?;
    let targets: Vec<TroveTuple> = refs.iter().map(|r| r.target.clone()).collect();
    let granted = ctx.auth.batch_check(&targets, Access::Read)?;
    let members: Vec<Member> = refs
        .into_iter()
        .zip(granted)
        .filter(|(_, ok)| *ok)
        .map(|(r, _)| Member {
            trove: r.target,
            weak: r.weak,
        })
        .collect();
    reply(&members)
}

#[derive(Debug, Deserialize)]
struct SourceParams {
    source_name: String,
}

fn get_troves_by_source(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: SourceParams = params(value)?;
    let published: Vec<Instance> = Instance::find_by_source(ctx.conn, &p.source_name)?
        .into_iter()
        .filter(|i| i.state == TroveState::Normal)
        .collect();
    let identities: Vec<TroveTuple> = published.iter().map(Instance::tuple).collect();
    let granted = ctx.auth.batch_check(&identities, Access::Read)?;

    let mut troves = Vec::new();
    for (instance, ok) in published.iter().zip(granted) {
        if ok {
            troves.push(instance.frozen_tuple()?);
        }
    }
    reply(&troves)
}

fn get_metadata(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: TrovesParams = params(value)?;
    let resolver = Resolver::new(ctx.conn, ctx.auth);

    let mut blocks: Vec<Option<String>> = Vec::with_capacity(p.troves.len());
    for trove in &p.troves {
        let block = match resolver.find_visible(trove)?.and_then(|i| i.id) {
            Some(id) => TroveInfo::find(ctx.conn, id, InfoType::Metadata)?.map(|info| encode_bytes(&info.data)),
            None => None,
        };
        blocks.push(block);
    }
    reply(&blocks)
}

/// A file stream requested by id and version
#[derive(Debug, Clone, Deserialize)]
pub struct FileRequest {
    pub file_id: String,
    pub file_version: String,
}

#[derive(Debug, Deserialize)]
struct FileContentsParams {
    files: Vec<FileRequest>,
}

/// Where requested contents can be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Located {
    pub location: String,
    pub sizes: Vec<u64>,
}

/// The first entry carrying `request` on a trove the caller may read
fn find_stream(ctx: &CallContext<'_>, request: &FileRequest) -> Result<TroveFileEntry> {
    let mut checked = BTreeSet::new();
    for entry in TroveFileEntry::find_by_file_id(ctx.conn, &request.file_id)? {
        if entry.file_version != request.file_version || !checked.insert(entry.instance_id) {
            continue;
        }
        let Some(instance) = Instance::find_by_id(ctx.conn, entry.instance_id)? else {
            continue;
        };
        if instance.state != TroveState::Normal {
            continue;
        }
        if ctx.auth.batch_check(&[instance.tuple()], Access::Read)?.into_iter().all(|ok| ok) {
            return Ok(entry);
        }
    }
    Err(Error::StreamNotFound(format!("{}={}", request.file_id, request.file_version)))
}

fn get_file_contents(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: FileContentsParams = params(value)?;
    let store = &ctx.server.store;

    let mut entries = Vec::with_capacity(p.files.len());
    for request in &p.files {
        let entry = find_stream(ctx, request)?;
        let digest = Digest::new(entry.sha256)?;
        let path = store.locate(&digest)?;
        let size = store.size(&path)?;
        entries.push((path, size));
    }

    let manifest = write_manifest(ctx.tmp_dir(), &entries)?;
    ctx.hand_out(manifest.clone());
    debug!("Located {} file content(s) in {}", entries.len(), manifest.display());
    reply(&Located {
        location: manifest.display().to_string(),
        sizes: entries.iter().map(|(_, size)| *size).collect(),
    })
}
