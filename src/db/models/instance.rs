// src/db/models/instance.rs

//! Trove instances
//!
//! One row per (name, version, flavor). Rows are never deleted: removal
//! turns the row into a tombstone and hidden rows wait for publication.

use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use crate::version::{self, Version};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Presence state of a trove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TroveState {
    Normal,
    /// Referenced but not present on this server
    Missing,
    /// Staged; invisible to ordinary readers until published
    Hidden,
    /// Tombstone left by a removal
    Removed,
}

impl TroveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TroveState::Normal => "normal",
            TroveState::Missing => "missing",
            TroveState::Hidden => "hidden",
            TroveState::Removed => "removed",
        }
    }
}

impl FromStr for TroveState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(TroveState::Normal),
            "missing" => Ok(TroveState::Missing),
            "hidden" => Ok(TroveState::Hidden),
            "removed" => Ok(TroveState::Removed),
            _ => Err(format!("Invalid trove state: {}", s)),
        }
    }
}

const COLUMNS: &str = "i.id, i.name, i.version, i.flavor, i.branch_id, i.timestamps, \
                       i.final_timestamp, i.state, i.changed, i.source_name, b.branch";

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: Option<i64>,
    pub name: String,
    /// Plain version string (no timestamps)
    pub version: String,
    /// Canonical flavor string
    pub flavor: String,
    pub branch_id: i64,
    /// Comma-separated `seconds.millis` node timestamps
    pub timestamps: String,
    /// Milliseconds since the epoch
    pub final_timestamp: i64,
    pub state: TroveState,
    pub changed: i64,
    pub source_name: Option<String>,
    /// Branch text, filled in by queries that join branches
    pub branch: Option<String>,
}

impl Instance {
    pub fn new(version: &Version, name: impl Into<String>, flavor: impl Into<String>, branch_id: i64) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: version.as_string(),
            flavor: flavor.into(),
            branch_id,
            timestamps: version::timestamps_to_column(&version.timestamps),
            final_timestamp: version.final_timestamp(),
            state: TroveState::Normal,
            changed: 0,
            source_name: None,
            branch: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO instances
                (name, version, flavor, branch_id, timestamps, final_timestamp, state, changed, source_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.name,
                &self.version,
                &self.flavor,
                self.branch_id,
                &self.timestamps,
                self.final_timestamp,
                self.state.as_str(),
                self.changed,
                &self.source_name,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Look up by identity; `tuple` must already be canonical
    pub fn find(conn: &Connection, tuple: &TroveTuple) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM instances i JOIN branches b ON b.id = i.branch_id
             WHERE i.name = ?1 AND i.version = ?2 AND i.flavor = ?3"
        );
        let instance = conn
            .query_row(&sql, params![&tuple.name, &tuple.version, &tuple.flavor], Self::from_row)
            .optional()?;
        Ok(instance)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM instances i JOIN branches b ON b.id = i.branch_id WHERE i.id = ?1"
        );
        let instance = conn.query_row(&sql, [id], Self::from_row).optional()?;
        Ok(instance)
    }

    pub fn find_by_state(conn: &Connection, state: TroveState) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM instances i JOIN branches b ON b.id = i.branch_id
             WHERE i.state = ?1 ORDER BY i.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([state.as_str()], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All versions built from a given source trove
    pub fn find_by_source(conn: &Connection, source_name: &str) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM instances i JOIN branches b ON b.id = i.branch_id
             WHERE i.source_name = ?1 ORDER BY i.name, i.version, i.flavor"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([source_name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Change presence state, stamping the row with a new `changed` value
    pub fn set_state(&mut self, conn: &Connection, state: TroveState, changed: i64) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InvalidRequest("Cannot update instance without ID".to_string()))?;
        conn.execute(
            "UPDATE instances SET state = ?1, changed = ?2 WHERE id = ?3",
            params![state.as_str(), changed, id],
        )?;
        self.state = state;
        self.changed = changed;
        Ok(())
    }

    pub fn tuple(&self) -> TroveTuple {
        TroveTuple::new(&self.name, &self.version, &self.flavor)
    }

    /// Parsed version with timestamps attached
    pub fn full_version(&self) -> Result<Version> {
        Version::from_stored(&self.version, &self.timestamps)
    }

    /// Tuple with the frozen version, as sent to clients
    pub fn frozen_tuple(&self) -> Result<TroveTuple> {
        Ok(TroveTuple::new(&self.name, self.full_version()?.freeze(), &self.flavor))
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let state: String = row.get(7)?;
        let state = state.parse::<TroveState>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            flavor: row.get(3)?,
            branch_id: row.get(4)?,
            timestamps: row.get(5)?,
            final_timestamp: row.get(6)?,
            state,
            changed: row.get(8)?,
            source_name: row.get(9)?,
            branch: row.get(10)?,
        })
    }
}
