// src/server/handlers/mirror.rs
//! Mirror feed operations

use super::{decode_bytes, encode_bytes};
use crate::db::models::InfoType;
use crate::error::Result;
use crate::mirror::{KeyRecord, MirrorEntry, MirrorPage, MirrorService};
use crate::server::context::{CallContext, params, reply};
use crate::server::registry::Operation;
use crate::trove::TroveTuple;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::read("getMirrorMark", get_mirror_mark),
        Operation::write("setMirrorMark", set_mirror_mark),
        Operation::read("getNewTroveList", get_new_trove_list),
        Operation::read("getNewSigList", get_new_sig_list),
        Operation::read("getNewTroveInfo", get_new_trove_info).since(38),
        Operation::read("getTroveSigs", get_trove_sigs),
        Operation::write("setTroveSigs", set_trove_sigs),
        Operation::read("getNewKeys", get_new_keys),
        Operation::write("addKeyList", add_key_list),
    ]
}

fn service<'c>(ctx: &'c CallContext<'c>) -> MirrorService<'c, 'c> {
    MirrorService::new(ctx.conn, ctx.auth).with_min_batch(ctx.config().mirror_min_batch)
}

#[derive(Debug, Deserialize)]
struct HostParams {
    host: String,
}

fn get_mirror_mark(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: HostParams = params(value)?;
    reply(&service(ctx).mirror_mark(&p.host)?)
}

#[derive(Debug, Deserialize)]
struct SetMarkParams {
    host: String,
    mark: i64,
}

fn set_mirror_mark(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: SetMarkParams = params(value)?;
    reply(&service(ctx).set_mirror_mark(&p.host, p.mark)?)
}

#[derive(Debug, Deserialize)]
struct MarkParams {
    mark: i64,
}

fn get_new_trove_list(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: MarkParams = params(value)?;
    reply(&service(ctx).new_troves(p.mark)?)
}

fn get_new_sig_list(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: MarkParams = params(value)?;
    reply(&service(ctx).new_sigs(p.mark)?)
}

#[derive(Debug, Deserialize)]
struct InfoParams {
    mark: i64,
    kinds: Vec<InfoType>,
    #[serde(default)]
    labels: Vec<String>,
}

/// An info block as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoBlock {
    pub trove: TroveTuple,
    pub info_type: InfoType,
    /// Base64-encoded block
    pub data: String,
}

fn get_new_trove_info(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: InfoParams = params(value)?;
    let page = service(ctx).new_trove_info(p.mark, &p.kinds, &p.labels)?;
    let entries = page
        .entries
        .into_iter()
        .map(|e| MirrorEntry {
            changed: e.changed,
            item: InfoBlock {
                trove: e.item.trove,
                info_type: e.item.info_type,
                data: encode_bytes(&e.item.data),
            },
        })
        .collect();
    reply(&MirrorPage {
        entries,
        mark: page.mark,
    })
}

#[derive(Debug, Deserialize)]
struct TrovesParams {
    troves: Vec<TroveTuple>,
}

fn get_trove_sigs(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: TrovesParams = params(value)?;
    let blocks = service(ctx).trove_sigs(&p.troves)?;
    reply(&blocks.iter().map(|b| encode_bytes(b)).collect::<Vec<_>>())
}

/// One signature block to store
#[derive(Debug, Clone, Deserialize)]
pub struct SigBlock {
    pub trove: TroveTuple,
    /// Base64-encoded block
    pub sigs: String,
}

#[derive(Debug, Deserialize)]
struct SetSigsParams {
    updates: Vec<SigBlock>,
}

fn set_trove_sigs(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: SetSigsParams = params(value)?;
    let updates = p
        .updates
        .into_iter()
        .map(|u| Ok((u.trove, decode_bytes(&u.sigs)?)))
        .collect::<Result<Vec<_>>>()?;

    let outcome = service(ctx).set_trove_sigs(&updates)?;
    ctx.invalidate(&outcome.troves);
    reply(&outcome.updated)
}

fn get_new_keys(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: MarkParams = params(value)?;
    reply(&service(ctx).new_keys(p.mark)?)
}

#[derive(Debug, Deserialize)]
struct KeyListParams {
    keys: Vec<KeyRecord>,
}

fn add_key_list(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: KeyListParams = params(value)?;
    reply(&service(ctx).add_key_list(&p.keys)?)
}
