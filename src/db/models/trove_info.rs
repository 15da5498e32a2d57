// src/db/models/trove_info.rs

//! Mutable per-trove info blocks (signatures, metadata, build info)

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoType {
    Sigs,
    Metadata,
    BuildInfo,
}

impl InfoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfoType::Sigs => "sigs",
            InfoType::Metadata => "metadata",
            InfoType::BuildInfo => "buildinfo",
        }
    }

    pub fn all() -> [InfoType; 3] {
        [InfoType::Sigs, InfoType::Metadata, InfoType::BuildInfo]
    }
}

impl FromStr for InfoType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sigs" => Ok(InfoType::Sigs),
            "metadata" => Ok(InfoType::Metadata),
            "buildinfo" => Ok(InfoType::BuildInfo),
            _ => Err(format!("Invalid trove info type: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TroveInfo {
    pub instance_id: i64,
    pub info_type: InfoType,
    pub data: Vec<u8>,
    pub changed: i64,
}

impl TroveInfo {
    pub fn new(instance_id: i64, info_type: InfoType, data: Vec<u8>, changed: i64) -> Self {
        Self {
            instance_id,
            info_type,
            data,
            changed,
        }
    }

    /// Insert or replace this block
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO trove_info (instance_id, info_type, data, changed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_id, info_type)
             DO UPDATE SET data = excluded.data, changed = excluded.changed",
            params![self.instance_id, self.info_type.as_str(), &self.data, self.changed],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, instance_id: i64, info_type: InfoType) -> Result<Option<Self>> {
        let info = conn
            .query_row(
                "SELECT instance_id, info_type, data, changed FROM trove_info
                 WHERE instance_id = ?1 AND info_type = ?2",
                params![instance_id, info_type.as_str()],
                Self::from_row,
            )
            .optional()?;
        Ok(info)
    }

    pub fn find_for_instance(conn: &Connection, instance_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instance_id, info_type, data, changed FROM trove_info
             WHERE instance_id = ?1 ORDER BY info_type",
        )?;
        let rows = stmt
            .query_map([instance_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// No-op update that takes the write lock covering this block
    ///
    /// Concurrent signers of the same trove serialize on this statement.
    pub fn lock_for_update(conn: &Connection, instance_id: i64, info_type: InfoType) -> Result<()> {
        conn.execute(
            "UPDATE trove_info SET changed = changed WHERE instance_id = ?1 AND info_type = ?2",
            params![instance_id, info_type.as_str()],
        )?;
        Ok(())
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let info_type: String = row.get(1)?;
        let info_type = info_type.parse::<InfoType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            instance_id: row.get(0)?,
            info_type,
            data: row.get(2)?,
            changed: row.get(3)?,
        })
    }
}
