// src/server/handlers/admin.rs
//! Identity administration: users, roles, ACLs and entitlements
//!
//! Everything except `getRoles` and changing one's own password requires an
//! administrator.

use crate::auth::admin::{self, AclEntry};
use crate::db::models::Role;
use crate::error::{Error, Result};
use crate::server::context::{CallContext, params, reply};
use crate::server::registry::Operation;
use serde::Deserialize;
use serde_json::Value;

pub fn operations() -> Vec<Operation> {
    vec![
        Operation::write("addUser", add_user),
        Operation::write("deleteUser", delete_user),
        Operation::write("changePassword", change_password),
        Operation::write("addRole", add_role),
        Operation::write("deleteRole", delete_role),
        Operation::read("listRoles", list_roles),
        Operation::write("updateRoleMembers", update_role_members),
        Operation::read("getRoleMembers", get_role_members),
        Operation::write("setRoleCanMirror", set_role_can_mirror),
        Operation::write("setRoleAdmin", set_role_admin),
        Operation::write("addAcl", add_acl),
        Operation::write("editAcl", edit_acl),
        Operation::write("deleteAcl", delete_acl),
        Operation::read("listAcls", list_acls),
        Operation::read("getRoles", get_roles),
        Operation::write("addEntitlementGroup", add_entitlement_group),
        Operation::write("addEntitlements", add_entitlements),
        Operation::write("deleteEntitlements", delete_entitlements),
        Operation::read("listEntitlements", list_entitlements),
    ]
}

#[derive(Debug, Deserialize)]
struct UserParams {
    user: String,
    #[serde(default)]
    password: String,
}

fn add_user(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: UserParams = params(value)?;
    reply(&admin::add_user(ctx.conn, &p.user, &p.password)?)
}

fn delete_user(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: UserParams = params(value)?;
    admin::delete_user(ctx.conn, &p.user)?;
    reply(&true)
}

fn change_password(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    let p: UserParams = params(value)?;
    let is_self = ctx.auth.user()?.is_some_and(|u| u.name == p.user);
    if !is_self {
        ctx.auth.require_admin()?;
    }
    admin::change_password(ctx.conn, &p.user, &p.password)?;
    reply(&true)
}

#[derive(Debug, Deserialize)]
struct RoleParams {
    role: String,
}

fn add_role(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: RoleParams = params(value)?;
    reply(&admin::add_role(ctx.conn, &p.role)?)
}

fn delete_role(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: RoleParams = params(value)?;
    admin::delete_role(ctx.conn, &p.role)?;
    reply(&true)
}

fn list_roles(ctx: &CallContext<'_>, _value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    reply(&admin::list_roles(ctx.conn)?)
}

#[derive(Debug, Deserialize)]
struct MembersParams {
    role: String,
    members: Vec<String>,
}

fn update_role_members(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: MembersParams = params(value)?;
    admin::update_role_members(ctx.conn, &p.role, &p.members)?;
    reply(&true)
}

fn get_role_members(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: RoleParams = params(value)?;
    reply(&admin::role_members(ctx.conn, &p.role)?)
}

#[derive(Debug, Deserialize)]
struct FlagParams {
    role: String,
    value: bool,
}

fn set_role_can_mirror(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: FlagParams = params(value)?;
    admin::set_role_can_mirror(ctx.conn, &p.role, p.value)?;
    reply(&true)
}

fn set_role_admin(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: FlagParams = params(value)?;
    admin::set_role_admin(ctx.conn, &p.role, p.value)?;
    reply(&true)
}

#[derive(Debug, Deserialize)]
struct AclParams {
    role: String,
    acl: AclEntry,
}

fn add_acl(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: AclParams = params(value)?;
    reply(&admin::add_acl(ctx.conn, &p.role, &p.acl)?)
}

#[derive(Debug, Deserialize)]
struct EditAclParams {
    role: String,
    old: AclEntry,
    new: AclEntry,
}

fn edit_acl(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: EditAclParams = params(value)?;
    admin::edit_acl(ctx.conn, &p.role, &p.old, &p.new)?;
    reply(&true)
}

#[derive(Debug, Deserialize)]
struct DeleteAclParams {
    role: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
}

fn delete_acl(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: DeleteAclParams = params(value)?;
    admin::delete_acl(ctx.conn, &p.role, p.label.as_deref(), p.pattern.as_deref())?;
    reply(&true)
}

fn list_acls(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: RoleParams = params(value)?;
    reply(&admin::list_acls(ctx.conn, &p.role)?)
}

/// Names of the roles the caller's credentials grant
fn get_roles(ctx: &CallContext<'_>, _value: Value) -> Result<Value> {
    let mut names = Vec::new();
    for id in ctx.auth.auth_roles()? {
        if let Some(role) = Role::find_by_id(ctx.conn, id)? {
            names.push(role.name);
        }
    }
    names.sort();
    reply(&names)
}

#[derive(Debug, Deserialize)]
struct GroupParams {
    group: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
}

fn add_entitlement_group(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: GroupParams = params(value)?;
    let role = p
        .role
        .ok_or_else(|| Error::InvalidRequest("role is required".to_string()))?;
    reply(&admin::add_entitlement_group(ctx.conn, &p.group, &role)?)
}

fn add_entitlements(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: GroupParams = params(value)?;
    admin::add_entitlements(ctx.conn, &p.group, &p.keys)?;
    reply(&true)
}

fn delete_entitlements(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: GroupParams = params(value)?;
    admin::delete_entitlements(ctx.conn, &p.group, &p.keys)?;
    reply(&true)
}

fn list_entitlements(ctx: &CallContext<'_>, value: Value) -> Result<Value> {
    ctx.auth.require_admin()?;
    let p: GroupParams = params(value)?;
    reply(&admin::list_entitlements(ctx.conn, &p.group)?)
}
