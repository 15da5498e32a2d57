// src/db/models/mirror_mark.rs

//! Per-host mirror cursors

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// Mark reported for a host that has never pulled
pub const NO_MARK: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMark {
    pub host: String,
    pub mark: i64,
}

impl MirrorMark {
    /// Current mark for `host`, or [`NO_MARK`]
    pub fn get(conn: &Connection, host: &str) -> Result<i64> {
        let mark = conn
            .query_row("SELECT mark FROM mirror_marks WHERE host = ?1", [host], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(mark.unwrap_or(NO_MARK))
    }

    pub fn set(conn: &Connection, host: &str, mark: i64) -> Result<()> {
        conn.execute(
            "INSERT INTO mirror_marks (host, mark) VALUES (?1, ?2)
             ON CONFLICT(host) DO UPDATE SET mark = excluded.mark",
            params![host, mark],
        )?;
        Ok(())
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT host, mark FROM mirror_marks ORDER BY host")?;
        let marks = stmt
            .query_map([], |row| {
                Ok(Self {
                    host: row.get(0)?,
                    mark: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(marks)
    }
}
