// src/auth/admin.rs

//! Identity administration: users, roles, entitlements and ACL rows
//!
//! These functions do no permission checking of their own; the call
//! handlers require an administrative role first.

use super::validate_pattern;
use crate::db::models::{
    ANY_LABEL, ANY_TROVE, EntitlementGroup, LabelEntry, Permission, Role, User,
};
use crate::error::{Error, Result};
use crate::label::Label;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

/// An ACL row as shown to administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// `None` for every label
    pub label: Option<String>,
    /// `None` for every trove name
    pub pattern: Option<String>,
    #[serde(default)]
    pub can_write: bool,
    #[serde(default)]
    pub can_remove: bool,
    /// Grants administrative rights to the role's members
    #[serde(default)]
    pub admin: bool,
}

fn find_user(conn: &Connection, name: &str) -> Result<User> {
    User::find_by_name(conn, name)?
        .ok_or_else(|| Error::InvalidRequest(format!("unknown user {name}")))
}

fn find_role(conn: &Connection, name: &str) -> Result<Role> {
    Role::find_by_name(conn, name)?
        .ok_or_else(|| Error::InvalidRequest(format!("unknown role {name}")))
}

fn find_group(conn: &Connection, name: &str) -> Result<EntitlementGroup> {
    EntitlementGroup::find_by_name(conn, name)?
        .ok_or_else(|| Error::InvalidRequest(format!("unknown entitlement group {name}")))
}

/// Label id for an ACL scope, creating the label row if needed
fn scope_label_id(conn: &Connection, label: Option<&str>) -> Result<i64> {
    match label {
        None => Ok(ANY_LABEL),
        Some(text) => {
            let parsed = Label::parse(text)?;
            LabelEntry::new(parsed.to_string()).insert_or_get(conn)
        }
    }
}

/// Label id for an ACL scope that must already exist
fn existing_label_id(conn: &Connection, label: Option<&str>) -> Result<Option<i64>> {
    match label {
        None => Ok(Some(ANY_LABEL)),
        Some(text) => Ok(LabelEntry::find_by_label(conn, text)?.and_then(|l| l.id)),
    }
}

fn scope_pattern(pattern: Option<&str>) -> Result<String> {
    let pattern = pattern.unwrap_or(ANY_TROVE);
    validate_pattern(pattern)?;
    Ok(pattern.to_string())
}

// === Users ===

pub fn add_user(conn: &Connection, name: &str, password: &str) -> Result<i64> {
    if User::find_by_name(conn, name)?.is_some() {
        return Err(Error::InvalidRequest(format!("user {name} already exists")));
    }
    let id = User::new(name, password).insert(conn)?;
    info!("Added user {}", name);
    Ok(id)
}

pub fn delete_user(conn: &Connection, name: &str) -> Result<()> {
    if !User::delete(conn, name)? {
        return Err(Error::InvalidRequest(format!("unknown user {name}")));
    }
    info!("Deleted user {}", name);
    Ok(())
}

pub fn change_password(conn: &Connection, name: &str, password: &str) -> Result<()> {
    let mut user = find_user(conn, name)?;
    user.set_password(conn, password)?;
    info!("Changed password for {}", name);
    Ok(())
}

// === Roles ===

pub fn add_role(conn: &Connection, name: &str) -> Result<i64> {
    if Role::find_by_name(conn, name)?.is_some() {
        return Err(Error::InvalidRequest(format!("role {name} already exists")));
    }
    let id = Role::new(name).insert(conn)?;
    info!("Added role {}", name);
    Ok(id)
}

pub fn delete_role(conn: &Connection, name: &str) -> Result<()> {
    if !Role::delete(conn, name)? {
        return Err(Error::InvalidRequest(format!("unknown role {name}")));
    }
    info!("Deleted role {}", name);
    Ok(())
}

pub fn list_roles(conn: &Connection) -> Result<Vec<String>> {
    Ok(Role::list_all(conn)?.into_iter().map(|r| r.name).collect())
}

/// Replace a role's membership
pub fn update_role_members(conn: &Connection, role: &str, users: &[String]) -> Result<()> {
    let role = find_role(conn, role)?;
    let mut ids = Vec::with_capacity(users.len());
    for user in users {
        ids.extend(find_user(conn, user)?.id);
    }
    role.set_members(conn, &ids)?;
    info!("Role {} now has {} member(s)", role.name, ids.len());
    Ok(())
}

pub fn role_members(conn: &Connection, role: &str) -> Result<Vec<String>> {
    find_role(conn, role)?.member_names(conn)
}

pub fn set_role_can_mirror(conn: &Connection, role: &str, can_mirror: bool) -> Result<()> {
    let mut role = find_role(conn, role)?;
    let admin = role.admin;
    role.set_flags(conn, can_mirror, admin)
}

pub fn set_role_admin(conn: &Connection, role: &str, admin: bool) -> Result<()> {
    let mut role = find_role(conn, role)?;
    let can_mirror = role.can_mirror;
    role.set_flags(conn, can_mirror, admin)
}

// === ACLs ===

pub fn add_acl(conn: &Connection, role: &str, acl: &AclEntry) -> Result<i64> {
    let role = find_role(conn, role)?;
    let pattern = scope_pattern(acl.pattern.as_deref())?;
    let label_id = scope_label_id(conn, acl.label.as_deref())?;
    let role_id = role.id.unwrap_or_default();

    if Permission::find(conn, role_id, label_id, &pattern)?.is_some() {
        return Err(Error::InvalidRequest(format!(
            "role {} already has an ACL for that scope",
            role.name
        )));
    }

    let mut perm = Permission::new(role_id, label_id, pattern);
    perm.can_write = acl.can_write;
    perm.can_remove = acl.can_remove;
    perm.admin = acl.admin;
    let id = perm.insert(conn)?;
    info!(
        "Added ACL for {}: label={:?} pattern={} write={} remove={}",
        role.name, acl.label, perm.pattern, perm.can_write, perm.can_remove
    );
    Ok(id)
}

/// Replace the ACL row scoped by `old` with `new`
pub fn edit_acl(conn: &Connection, role: &str, old: &AclEntry, new: &AclEntry) -> Result<()> {
    let role = find_role(conn, role)?;
    let role_id = role.id.unwrap_or_default();
    let old_pattern = old.pattern.as_deref().unwrap_or(ANY_TROVE);

    let existing = match existing_label_id(conn, old.label.as_deref())? {
        Some(label_id) => Permission::find(conn, role_id, label_id, old_pattern)?,
        None => None,
    };
    let mut perm = existing
        .ok_or_else(|| Error::InvalidRequest(format!("role {} has no such ACL", role.name)))?;

    perm.pattern = scope_pattern(new.pattern.as_deref())?;
    perm.label_id = scope_label_id(conn, new.label.as_deref())?;
    perm.can_write = new.can_write;
    perm.can_remove = new.can_remove;
    perm.admin = new.admin;
    perm.update(conn)?;
    info!(
        "Edited ACL for {}: label={:?} pattern={} write={} remove={}",
        role.name, new.label, perm.pattern, perm.can_write, perm.can_remove
    );
    Ok(())
}

pub fn delete_acl(conn: &Connection, role: &str, label: Option<&str>, pattern: Option<&str>) -> Result<()> {
    let role = find_role(conn, role)?;
    let role_id = role.id.unwrap_or_default();
    let pattern = pattern.unwrap_or(ANY_TROVE);

    if let Some(label_id) = existing_label_id(conn, label)? {
        if let Some(perm) = Permission::find(conn, role_id, label_id, pattern)? {
            perm.delete(conn)?;
            info!("Deleted ACL for {}: label={:?} pattern={}", role.name, label, pattern);
        }
    }
    Ok(())
}

pub fn list_acls(conn: &Connection, role: &str) -> Result<Vec<AclEntry>> {
    let role = find_role(conn, role)?;
    let mut entries = Vec::new();
    for perm in Permission::find_for_role(conn, role.id.unwrap_or_default())? {
        let label = if perm.label_id == ANY_LABEL {
            None
        } else {
            Some(conn.query_row(
                "SELECT label FROM labels WHERE id = ?1",
                [perm.label_id],
                |row| row.get::<_, String>(0),
            )?)
        };
        entries.push(AclEntry {
            label,
            pattern: (perm.pattern != ANY_TROVE).then_some(perm.pattern),
            can_write: perm.can_write,
            can_remove: perm.can_remove,
            admin: perm.admin,
        });
    }
    Ok(entries)
}

// === Entitlements ===

pub fn add_entitlement_group(conn: &Connection, group: &str, role: &str) -> Result<i64> {
    if EntitlementGroup::find_by_name(conn, group)?.is_some() {
        return Err(Error::InvalidRequest(format!("entitlement group {group} already exists")));
    }
    let role = find_role(conn, role)?;
    let id = EntitlementGroup::new(group, role.id.unwrap_or_default()).insert(conn)?;
    info!("Added entitlement group {} for role {}", group, role.name);
    Ok(id)
}

pub fn add_entitlements(conn: &Connection, group: &str, keys: &[String]) -> Result<()> {
    find_group(conn, group)?.add_keys(conn, keys)
}

pub fn delete_entitlements(conn: &Connection, group: &str, keys: &[String]) -> Result<()> {
    find_group(conn, group)?.delete_keys(conn, keys)
}

pub fn list_entitlements(conn: &Connection, group: &str) -> Result<Vec<String>> {
    find_group(conn, group)?.keys(conn)
}
