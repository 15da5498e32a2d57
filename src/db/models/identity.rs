// src/db/models/identity.rs

//! Users, roles, entitlements and permissions

use crate::error::{Error, Result};
use crate::hash;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Wildcard stored in `permissions.pattern`
pub const ANY_TROVE: &str = "ALL";

/// Wildcard stored in `permissions.label_id`
pub const ANY_LABEL: i64 = 0;

#[derive(Debug, Clone)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub salt: String,
    pub password_hash: String,
}

impl User {
    /// Create a user record with a fresh salt
    pub fn new(name: impl Into<String>, password: &str) -> Self {
        let salt = hex::encode(rand::random::<[u8; 16]>());
        let password_hash = Self::hash_password(&salt, password);
        Self {
            id: None,
            name: name.into(),
            salt,
            password_hash,
        }
    }

    fn hash_password(salt: &str, password: &str) -> String {
        hash::sha256(format!("{salt}{password}").as_bytes())
    }

    pub fn check_password(&self, password: &str) -> bool {
        Self::hash_password(&self.salt, password) == self.password_hash
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO users (name, salt, password_hash) VALUES (?1, ?2, ?3)",
            params![&self.name, &self.salt, &self.password_hash],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn set_password(&mut self, conn: &Connection, password: &str) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InvalidRequest("Cannot update user without ID".to_string()))?;
        self.salt = hex::encode(rand::random::<[u8; 16]>());
        self.password_hash = Self::hash_password(&self.salt, password);
        conn.execute(
            "UPDATE users SET salt = ?1, password_hash = ?2 WHERE id = ?3",
            params![&self.salt, &self.password_hash, id],
        )?;
        Ok(())
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let user = conn
            .query_row(
                "SELECT id, name, salt, password_hash FROM users WHERE name = ?1",
                [name],
                Self::from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
        let count = conn.execute("DELETE FROM users WHERE name = ?1", [name])?;
        Ok(count > 0)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            salt: row.get(2)?,
            password_hash: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: Option<i64>,
    pub name: String,
    pub can_mirror: bool,
    pub admin: bool,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            can_mirror: false,
            admin: false,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO roles (name, can_mirror, admin) VALUES (?1, ?2, ?3)",
            params![&self.name, self.can_mirror, self.admin],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let role = conn
            .query_row(
                "SELECT id, name, can_mirror, admin FROM roles WHERE name = ?1",
                [name],
                Self::from_row,
            )
            .optional()?;
        Ok(role)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let role = conn
            .query_row(
                "SELECT id, name, can_mirror, admin FROM roles WHERE id = ?1",
                [id],
                Self::from_row,
            )
            .optional()?;
        Ok(role)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT id, name, can_mirror, admin FROM roles ORDER BY name")?;
        let roles = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(roles)
    }

    /// Roles a user belongs to
    pub fn find_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.can_mirror, r.admin FROM roles r
             JOIN role_members m ON m.role_id = r.id
             WHERE m.user_id = ?1 ORDER BY r.name",
        )?;
        let roles = stmt
            .query_map([user_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(roles)
    }

    /// Roles granted by an entitlement key
    pub fn find_for_entitlement(conn: &Connection, entitlement: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.can_mirror, r.admin FROM roles r
             JOIN entitlement_groups g ON g.role_id = r.id
             JOIN entitlements e ON e.group_id = g.id
             WHERE e.entitlement = ?1 ORDER BY r.name",
        )?;
        let roles = stmt
            .query_map([entitlement], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(roles)
    }

    pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
        let count = conn.execute("DELETE FROM roles WHERE name = ?1", [name])?;
        Ok(count > 0)
    }

    pub fn set_flags(&mut self, conn: &Connection, can_mirror: bool, admin: bool) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InvalidRequest("Cannot update role without ID".to_string()))?;
        conn.execute(
            "UPDATE roles SET can_mirror = ?1, admin = ?2 WHERE id = ?3",
            params![can_mirror, admin, id],
        )?;
        self.can_mirror = can_mirror;
        self.admin = admin;
        Ok(())
    }

    /// Replace the role's membership with `user_ids`
    pub fn set_members(&self, conn: &Connection, user_ids: &[i64]) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InvalidRequest("Cannot update role without ID".to_string()))?;
        conn.execute("DELETE FROM role_members WHERE role_id = ?1", [id])?;
        for user_id in user_ids {
            conn.execute(
                "INSERT OR IGNORE INTO role_members (role_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )?;
        }
        Ok(())
    }

    pub fn member_names(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT u.name FROM users u JOIN role_members m ON m.user_id = u.id
             WHERE m.role_id = ?1 ORDER BY u.name",
        )?;
        let names = stmt
            .query_map([self.id.unwrap_or_default()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            can_mirror: row.get(2)?,
            admin: row.get(3)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntitlementGroup {
    pub id: Option<i64>,
    pub name: String,
    pub role_id: i64,
}

impl EntitlementGroup {
    pub fn new(name: impl Into<String>, role_id: i64) -> Self {
        Self {
            id: None,
            name: name.into(),
            role_id,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO entitlement_groups (name, role_id) VALUES (?1, ?2)",
            params![&self.name, self.role_id],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let group = conn
            .query_row(
                "SELECT id, name, role_id FROM entitlement_groups WHERE name = ?1",
                [name],
                Self::from_row,
            )
            .optional()?;
        Ok(group)
    }

    pub fn add_keys(&self, conn: &Connection, keys: &[String]) -> Result<()> {
        let id = self.id.unwrap_or_default();
        for key in keys {
            conn.execute(
                "INSERT OR IGNORE INTO entitlements (group_id, entitlement) VALUES (?1, ?2)",
                params![id, key],
            )?;
        }
        Ok(())
    }

    pub fn delete_keys(&self, conn: &Connection, keys: &[String]) -> Result<()> {
        let id = self.id.unwrap_or_default();
        for key in keys {
            conn.execute(
                "DELETE FROM entitlements WHERE group_id = ?1 AND entitlement = ?2",
                params![id, key],
            )?;
        }
        Ok(())
    }

    pub fn keys(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT entitlement FROM entitlements WHERE group_id = ?1 ORDER BY entitlement",
        )?;
        let keys = stmt
            .query_map([self.id.unwrap_or_default()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            role_id: row.get(2)?,
        })
    }
}

/// An ACL row: what a role may do with troves matching a label and name pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub id: Option<i64>,
    pub role_id: i64,
    /// [`ANY_LABEL`] for every label
    pub label_id: i64,
    /// Glob pattern over trove names; [`ANY_TROVE`] for every name
    pub pattern: String,
    pub can_write: bool,
    pub can_remove: bool,
    pub admin: bool,
}

const PERMISSION_COLUMNS: &str = "id, role_id, label_id, pattern, can_write, can_remove, admin";

impl Permission {
    pub fn new(role_id: i64, label_id: i64, pattern: impl Into<String>) -> Self {
        Self {
            id: None,
            role_id,
            label_id,
            pattern: pattern.into(),
            can_write: false,
            can_remove: false,
            admin: false,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO permissions (role_id, label_id, pattern, can_write, can_remove, admin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.role_id,
                self.label_id,
                &self.pattern,
                self.can_write,
                self.can_remove,
                self.admin,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InvalidRequest("Cannot update permission without ID".to_string()))?;
        conn.execute(
            "UPDATE permissions SET label_id = ?1, pattern = ?2, can_write = ?3, can_remove = ?4, admin = ?5
             WHERE id = ?6",
            params![
                self.label_id,
                &self.pattern,
                self.can_write,
                self.can_remove,
                self.admin,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, role_id: i64, label_id: i64, pattern: &str) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions
             WHERE role_id = ?1 AND label_id = ?2 AND pattern = ?3"
        );
        let permission = conn
            .query_row(&sql, params![role_id, label_id, pattern], Self::from_row)
            .optional()?;
        Ok(permission)
    }

    pub fn find_for_role(conn: &Connection, role_id: i64) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE role_id = ?1 ORDER BY label_id, pattern"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([role_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, conn: &Connection) -> Result<()> {
        if let Some(id) = self.id {
            conn.execute("DELETE FROM permissions WHERE id = ?1", [id])?;
        }
        Ok(())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            role_id: row.get(1)?,
            label_id: row.get(2)?,
            pattern: row.get(3)?,
            can_write: row.get(4)?,
            can_remove: row.get(5)?,
            admin: row.get(6)?,
        })
    }
}
