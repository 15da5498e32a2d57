// src/db/models/label.rs

//! Label and branch lookup rows

use crate::error::Result;
use crate::label::Branch;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Database representation of a label
#[derive(Debug, Clone)]
pub struct LabelEntry {
    pub id: Option<i64>,
    pub label: String,
}

impl LabelEntry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: None,
            label: label.into(),
        }
    }

    /// Insert or get the existing row, returning its id
    pub fn insert_or_get(&mut self, conn: &Connection) -> Result<i64> {
        if let Some(existing) = Self::find_by_label(conn, &self.label)? {
            let id = existing.id.unwrap_or_default();
            self.id = Some(id);
            return Ok(id);
        }

        conn.execute("INSERT INTO labels (label) VALUES (?1)", [&self.label])?;
        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_label(conn: &Connection, label: &str) -> Result<Option<Self>> {
        let entry = conn
            .query_row(
                "SELECT id, label FROM labels WHERE label = ?1",
                [label],
                Self::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT id, label FROM labels ORDER BY label")?;
        let labels = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            label: row.get(1)?,
        })
    }
}

/// Database representation of a branch
#[derive(Debug, Clone)]
pub struct BranchEntry {
    pub id: Option<i64>,
    pub branch: String,
    pub label_id: i64,
}

impl BranchEntry {
    /// Insert or get the row for `branch`, creating its label row as needed
    pub fn insert_or_get(conn: &Connection, branch: &Branch) -> Result<i64> {
        let text = branch.to_string();
        if let Some(id) = conn
            .query_row("SELECT id FROM branches WHERE branch = ?1", [&text], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?
        {
            return Ok(id);
        }

        let label_id = LabelEntry::new(branch.label().to_string()).insert_or_get(conn)?;
        conn.execute(
            "INSERT INTO branches (branch, label_id) VALUES (?1, ?2)",
            params![text, label_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_by_branch(conn: &Connection, branch: &str) -> Result<Option<Self>> {
        let entry = conn
            .query_row(
                "SELECT id, branch, label_id FROM branches WHERE branch = ?1",
                [branch],
                Self::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            branch: row.get(1)?,
            label_id: row.get(2)?,
        })
    }
}
