// src/db/models/signing_key.rs

//! Signing key records

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

const COLUMNS: &str = "k.fingerprint, k.user_id, k.public_key, k.revoked, k.expires_at, k.changed, u.name";

/// A public signing key registered with the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyEntry {
    pub fingerprint: String,
    pub user_id: Option<i64>,
    /// Base64-encoded Ed25519 public key
    pub public_key: String,
    pub revoked: bool,
    /// Expiry in milliseconds since the epoch
    pub expires_at: Option<i64>,
    pub changed: i64,
    /// Owner name, filled in by queries that join users
    pub owner: Option<String>,
}

impl SigningKeyEntry {
    pub fn new(fingerprint: impl Into<String>, public_key: impl Into<String>, user_id: Option<i64>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            user_id,
            public_key: public_key.into(),
            revoked: false,
            expires_at: None,
            changed: 0,
            owner: None,
        }
    }

    /// Insert the key, or refresh revocation/expiry if it is already known
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO signing_keys (fingerprint, user_id, public_key, revoked, expires_at, changed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(fingerprint) DO UPDATE SET
                revoked = excluded.revoked,
                expires_at = excluded.expires_at,
                changed = excluded.changed",
            params![
                &self.fingerprint,
                self.user_id,
                &self.public_key,
                self.revoked,
                self.expires_at,
                self.changed,
            ],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, fingerprint: &str) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM signing_keys k LEFT JOIN users u ON u.id = k.user_id
             WHERE k.fingerprint = ?1"
        );
        let key = conn.query_row(&sql, [fingerprint], Self::from_row).optional()?;
        Ok(key)
    }

    /// Keys changed at or after `mark`, oldest change first
    pub fn find_changed_since(conn: &Connection, mark: i64) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM signing_keys k LEFT JOIN users u ON u.id = k.user_id
             WHERE k.changed >= ?1 ORDER BY k.changed, k.fingerprint"
        );
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map([mark], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn revoke(conn: &Connection, fingerprint: &str, changed: i64) -> Result<()> {
        let count = conn.execute(
            "UPDATE signing_keys SET revoked = 1, changed = ?1 WHERE fingerprint = ?2",
            params![changed, fingerprint],
        )?;
        if count == 0 {
            return Err(Error::IncompatibleKey(format!("unknown key {fingerprint}")));
        }
        Ok(())
    }

    pub fn set_owner(conn: &Connection, fingerprint: &str, user_id: i64, changed: i64) -> Result<()> {
        let count = conn.execute(
            "UPDATE signing_keys SET user_id = ?1, changed = ?2 WHERE fingerprint = ?3",
            params![user_id, changed, fingerprint],
        )?;
        if count == 0 {
            return Err(Error::IncompatibleKey(format!("unknown key {fingerprint}")));
        }
        Ok(())
    }

    /// Whether the key may sign at `now` (milliseconds since the epoch)
    pub fn is_usable(&self, now: i64) -> bool {
        !self.revoked && self.expires_at.is_none_or(|expiry| expiry > now)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            user_id: row.get(1)?,
            public_key: row.get(2)?,
            revoked: row.get(3)?,
            expires_at: row.get(4)?,
            changed: row.get(5)?,
            owner: row.get(6)?,
        })
    }
}
