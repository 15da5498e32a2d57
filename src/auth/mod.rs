// src/auth/mod.rs

//! Access control evaluation
//!
//! An [`Authorizer`] is built per call from the caller's [`AuthToken`] and
//! the call's transaction. It resolves the caller's roles once, then answers
//! permission questions against the ACL rows of those roles.
//!
//! Read paths never learn *why* a trove is invisible: callers turn a failed
//! read check into "not found". Only write paths raise
//! [`Error::InsufficientPermission`].

pub mod admin;
mod pattern;

pub use pattern::{PatternCache, validate_pattern};

use crate::db::models::{ANY_LABEL, ANY_TROVE, Permission, Role, User};
use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use crate::version::Version;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Caller credentials as presented with every call
///
/// An empty token carries no identity and resolves to no roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub entitlements: Vec<String>,
}

impl AuthToken {
    pub fn user(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(name.into()),
            password: Some(password.into()),
            entitlements: Vec::new(),
        }
    }

    pub fn entitlement(key: impl Into<String>) -> Self {
        Self {
            user: None,
            password: None,
            entitlements: vec![key.into()],
        }
    }

    /// Name used in logs
    pub fn display_name(&self) -> &str {
        self.user.as_deref().unwrap_or("<anonymous>")
    }
}

/// Capability asked of a permission row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Remove,
}

impl Access {
    fn granted_by(self, permission: &ScopedPermission) -> bool {
        match self {
            Access::Read => true,
            Access::Write => permission.can_write,
            Access::Remove => permission.can_remove,
        }
    }
}

/// A permission row joined with its label text
#[derive(Debug, Clone)]
struct ScopedPermission {
    role_id: i64,
    /// `None` for the label wildcard
    label: Option<String>,
    pattern: String,
    can_write: bool,
    can_remove: bool,
    admin: bool,
}

impl ScopedPermission {
    fn label_matches(&self, label: &str) -> bool {
        self.label.as_deref().is_none_or(|l| l == label)
    }
}

/// Per-call access control evaluator
pub struct Authorizer<'a> {
    conn: &'a Connection,
    token: &'a AuthToken,
    roles: RefCell<Option<Vec<Role>>>,
    permissions: RefCell<Option<Vec<ScopedPermission>>>,
    patterns: PatternCache,
}

impl<'a> Authorizer<'a> {
    pub fn new(conn: &'a Connection, token: &'a AuthToken) -> Self {
        Self {
            conn,
            token,
            roles: RefCell::new(None),
            permissions: RefCell::new(None),
            patterns: PatternCache::new(),
        }
    }

    pub fn token(&self) -> &AuthToken {
        self.token
    }

    /// The user record behind the token, if its password checks out
    pub fn user(&self) -> Result<Option<User>> {
        let (Some(name), Some(password)) = (&self.token.user, &self.token.password) else {
            return Ok(None);
        };
        Ok(User::find_by_name(self.conn, name)?.filter(|u| u.check_password(password)))
    }

    /// Roles granted by the caller's credentials
    ///
    /// A wrong password or unknown entitlement simply grants nothing.
    pub fn auth_roles(&self) -> Result<BTreeSet<i64>> {
        Ok(self.roles()?.iter().filter_map(|r| r.id).collect())
    }

    fn roles(&self) -> Result<Vec<Role>> {
        if let Some(roles) = self.roles.borrow().as_ref() {
            return Ok(roles.clone());
        }

        let mut by_id: HashMap<i64, Role> = HashMap::new();

        if let (Some(name), Some(password)) = (&self.token.user, &self.token.password) {
            match User::find_by_name(self.conn, name)? {
                Some(user) if user.check_password(password) => {
                    if let Some(user_id) = user.id {
                        for role in Role::find_for_user(self.conn, user_id)? {
                            by_id.insert(role.id.unwrap_or_default(), role);
                        }
                    }
                }
                _ => debug!("Credentials for {} did not authenticate", name),
            }
        }

        for key in &self.token.entitlements {
            for role in Role::find_for_entitlement(self.conn, key)? {
                by_id.insert(role.id.unwrap_or_default(), role);
            }
        }

        let mut roles: Vec<Role> = by_id.into_values().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            "Resolved {} role(s) for {}",
            roles.len(),
            self.token.display_name()
        );
        *self.roles.borrow_mut() = Some(roles.clone());
        Ok(roles)
    }

    fn permissions(&self) -> Result<Vec<ScopedPermission>> {
        if let Some(perms) = self.permissions.borrow().as_ref() {
            return Ok(perms.clone());
        }

        let mut perms = Vec::new();
        for role_id in self.auth_roles()? {
            for row in Permission::find_for_role(self.conn, role_id)? {
                perms.push(self.scope(row)?);
            }
        }
        *self.permissions.borrow_mut() = Some(perms.clone());
        Ok(perms)
    }

    fn scope(&self, row: Permission) -> Result<ScopedPermission> {
        let label = if row.label_id == ANY_LABEL {
            None
        } else {
            let text: String = self.conn.query_row(
                "SELECT label FROM labels WHERE id = ?1",
                [row.label_id],
                |r| r.get(0),
            )?;
            Some(text)
        };

        Ok(ScopedPermission {
            role_id: row.role_id,
            label,
            pattern: row.pattern,
            can_write: row.can_write,
            can_remove: row.can_remove,
            admin: row.admin,
        })
    }

    /// Raw pattern test against a trove name, memoized for this call
    pub fn check_trove(&self, pattern: &str, name: &str) -> bool {
        self.patterns.matches(pattern, name)
    }

    /// Whether some permission grants `access` for the given scope
    ///
    /// `None` for label or trove means "any".
    pub fn check(&self, access: Access, label: Option<&str>, trove: Option<&str>) -> Result<bool> {
        for perm in self.permissions()? {
            if !access.granted_by(&perm) {
                continue;
            }
            if let Some(label) = label {
                if !perm.label_matches(label) {
                    continue;
                }
            }
            if let Some(trove) = trove {
                if !self.check_trove(&perm.pattern, trove) {
                    continue;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Role-flag checks used by administrative and mirror operations
    ///
    /// Administrative rights come from a role's own flag or from any ACL
    /// row of the caller carrying the admin flag.
    pub fn auth_check(&self, admin: bool, mirror: bool) -> Result<bool> {
        let roles = self.roles()?;
        if roles.is_empty() {
            return Ok(false);
        }
        if admin
            && !roles.iter().any(|r| r.admin)
            && !self.permissions()?.iter().any(|p| p.admin)
        {
            return Ok(false);
        }
        if mirror && !roles.iter().any(|r| r.can_mirror) {
            return Ok(false);
        }
        Ok(true)
    }

    /// Per-trove permission check
    ///
    /// Each entry is scoped by the label of the branch in its version.
    /// Entries whose version cannot be parsed are denied.
    pub fn batch_check(&self, troves: &[TroveTuple], access: Access) -> Result<Vec<bool>> {
        let perms = self.permissions()?;
        let mut results = Vec::with_capacity(troves.len());

        for trove in troves {
            let Ok(version) = Version::parse(&trove.version) else {
                results.push(false);
                continue;
            };
            let label = version.branch.label().to_string();

            let granted = perms.iter().any(|perm| {
                access.granted_by(perm)
                    && perm.label_matches(&label)
                    && self.check_trove(&perm.pattern, &trove.name)
            });
            results.push(granted);
        }
        Ok(results)
    }

    /// Fail with [`Error::InsufficientPermission`] unless every trove passes
    pub fn require_troves(&self, troves: &[TroveTuple], access: Access) -> Result<()> {
        if self.batch_check(troves, access)?.into_iter().all(|ok| ok) {
            Ok(())
        } else {
            Err(Error::InsufficientPermission)
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.auth_check(true, false)? {
            Ok(())
        } else {
            Err(Error::InsufficientPermission)
        }
    }

    pub fn require_mirror(&self) -> Result<()> {
        if self.auth_check(false, true)? {
            Ok(())
        } else {
            Err(Error::InsufficientPermission)
        }
    }

    pub fn is_admin(&self) -> Result<bool> {
        self.auth_check(true, false)
    }

    /// Ids of the caller's mirror-capable roles
    pub fn mirror_roles(&self) -> Result<BTreeSet<i64>> {
        Ok(self
            .roles()?
            .iter()
            .filter(|r| r.can_mirror)
            .filter_map(|r| r.id)
            .collect())
    }

    /// Number of permission rows held by the given roles
    pub fn permission_count(&self, role_ids: &BTreeSet<i64>) -> Result<usize> {
        Ok(self
            .permissions()?
            .iter()
            .filter(|p| role_ids.contains(&p.role_id))
            .count())
    }

    /// Memoized pattern matcher, shared with the resolver
    pub fn patterns(&self) -> &PatternCache {
        &self.patterns
    }
}

/// Whether a stored pattern is the trove-name wildcard
pub fn is_any_trove(pattern: &str) -> bool {
    pattern == ANY_TROVE
}
