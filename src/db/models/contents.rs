// src/db/models/contents.rs

//! Trove contents: references to other troves and file entries

use crate::error::Result;
use crate::trove::TroveTuple;
use rusqlite::{Connection, Row, params};

/// A containment edge from a collection to another trove
///
/// References are stored by identity rather than by row id so a collection
/// can point at troves hosted on another repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveReference {
    pub instance_id: i64,
    pub target: TroveTuple,
    pub weak: bool,
}

impl TroveReference {
    pub fn new(instance_id: i64, target: TroveTuple, weak: bool) -> Self {
        Self {
            instance_id,
            target,
            weak,
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO trove_troves (instance_id, name, version, flavor, weak)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.instance_id,
                &self.target.name,
                &self.target.version,
                &self.target.flavor,
                self.weak,
            ],
        )?;
        Ok(())
    }

    pub fn find_for_instance(conn: &Connection, instance_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instance_id, name, version, flavor, weak FROM trove_troves
             WHERE instance_id = ?1 ORDER BY weak, name, version, flavor",
        )?;
        let rows = stmt
            .query_map([instance_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            target: TroveTuple::new(
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ),
            weak: row.get(4)?,
        })
    }
}

/// A file carried by a trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveFileEntry {
    pub instance_id: i64,
    pub path: String,
    /// Stream identifier (hash of the file's metadata stream)
    pub file_id: String,
    /// Version of the trove that last changed this file
    pub file_version: String,
    /// Content digest in the blob store
    pub sha256: String,
    pub size: i64,
    pub mode: u32,
}

impl TroveFileEntry {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO trove_files (instance_id, path, file_id, file_version, sha256, size, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.instance_id,
                &self.path,
                &self.file_id,
                &self.file_version,
                &self.sha256,
                self.size,
                self.mode,
            ],
        )?;
        Ok(())
    }

    pub fn find_for_instance(conn: &Connection, instance_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instance_id, path, file_id, file_version, sha256, size, mode FROM trove_files
             WHERE instance_id = ?1 ORDER BY path",
        )?;
        let rows = stmt
            .query_map([instance_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Any entry carrying the given stream, with the instance that owns it
    pub fn find_by_file_id(conn: &Connection, file_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instance_id, path, file_id, file_version, sha256, size, mode FROM trove_files
             WHERE file_id = ?1 ORDER BY instance_id",
        )?;
        let rows = stmt
            .query_map([file_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            instance_id: row.get(0)?,
            path: row.get(1)?,
            file_id: row.get(2)?,
            file_version: row.get(3)?,
            sha256: row.get(4)?,
            size: row.get(5)?,
            mode: row.get(6)?,
        })
    }
}
