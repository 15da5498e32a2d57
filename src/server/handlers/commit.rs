// src/server/handlers/commit.rs
//! Write operations: commits, metadata, signatures and signing keys

use super::decode_bytes;
use crate::commit::signature::{self, TroveSignature};
use crate::commit::{self as pipeline, CommitOptions, CommitPipeline};
use crate::error::Result;
use crate::server::context::{CallContext, params, reply};
use crate::server::registry::Operation;
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::write("prepareChangeSet", prepare_change_set),
        Operation::write("commitChangeSet", commit_change_set).committing(),
        Operation::write("presentHiddenTroves", present_hidden_troves),
        Operation::write("updateMetadata", update_metadata),
        Operation::write("addDigitalSignature", add_digital_signature),
        Operation::write("addNewKey", add_new_key),
        Operation::read("getKey", get_key),
        Operation::write("revokeKey", revoke_key),
        Operation::write("changeKeyOwner", change_key_owner),
    ]
}

/// Reply of `prepareChangeSet`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// Name to pass back to `commitChangeSet`
    pub name: String,
    /// Where the transport layer writes the uploaded bytes
    pub location: String,
}

fn prepare_change_set(ctx: &CallContext<'_>, _value: Value) -> Result<Value> {
    let name = pipeline::prepare_upload(ctx.tmp_dir())?;
    let location = pipeline::upload_path(ctx.tmp_dir(), &name)?;
    reply(&Upload {
        name,
        location: location.display().to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct CommitParams {
    name: String,
    #[serde(default)]
    mirror: bool,
    #[serde(default)]
    hidden: bool,
}

fn commit_change_set(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: CommitParams = params(value)?;
    let cs = pipeline::read_upload(ctx.tmp_dir(), &p.name)?;
    let options = CommitOptions {
        mirror: p.mirror,
        hidden: p.hidden,
    };

    let outcome = CommitPipeline::new(ctx.conn, ctx.auth, &ctx.server.store, ctx.server_names()).commit(&cs, options)?;

    ctx.record_commit(&outcome.committed);
    ctx.invalidate(&outcome.committed);
    ctx.invalidate(&outcome.removed);
    ctx.cleanup(pipeline::upload_path(ctx.tmp_dir(), &p.name)?);
    reply(&true)
}

fn present_hidden_troves(ctx: &CallContext<'_>, _value: Value) -> Result<Value> {
    let published = pipeline::present_hidden_troves(ctx.conn, ctx.auth)?;
    reply(&published)
}

#[derive(Debug, Deserialize)]
struct MetadataParams {
    trove: TroveTuple,
    /// Base64-encoded metadata block
    data: String,
}

fn update_metadata(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: MetadataParams = params(value)?;
    let data = decode_bytes(&p.data)?;
    let identity = pipeline::update_metadata(ctx.conn, ctx.auth, &p.trove, &data)?;
    ctx.invalidate(std::slice::from_ref(&identity));
    reply(&identity)
}

#[derive(Debug, Deserialize)]
struct SignatureParams {
    trove: TroveTuple,
    signature: TroveSignature,
}

fn add_digital_signature(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: SignatureParams = params(value)?;
    let changed = signature::add_digital_signature(ctx.conn, ctx.auth, &p.trove, &p.signature)?;
    ctx.invalidate(&[p.trove.identity()?]);
    reply(&changed)
}

#[derive(Debug, Deserialize)]
struct NewKeyParams {
    #[serde(default)]
    owner: Option<String>,
    public_key: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

fn add_new_key(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: NewKeyParams = params(value)?;
    let fingerprint = signature::add_new_key(ctx.conn, ctx.auth, p.owner.as_deref(), &p.public_key, p.expires_at)?;
    reply(&fingerprint)
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    fingerprint: String,
}

/// Public record of a signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub public_key: String,
    pub owner: Option<String>,
    pub revoked: bool,
    pub expires_at: Option<i64>,
}

fn get_key(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: KeyParams = params(value)?;
    let key = signature::get_key(ctx.conn, &p.fingerprint)?;
    reply(&KeyInfo {
        fingerprint: key.fingerprint,
        public_key: key.public_key,
        owner: key.owner,
        revoked: key.revoked,
        expires_at: key.expires_at,
    })
}

fn revoke_key(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: KeyParams = params(value)?;
    signature::revoke_key(ctx.conn, ctx.auth, &p.fingerprint)?;
    reply(&true)
}

#[derive(Debug, Deserialize)]
struct OwnerParams {
    fingerprint: String,
    owner: String,
}

fn change_key_owner(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: OwnerParams = params(value)?;
    signature::change_key_owner(ctx.conn, ctx.auth, &p.fingerprint, &p.owner)?;
    reply(&true)
}
