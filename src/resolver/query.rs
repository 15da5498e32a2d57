// src/resolver/query.rs

//! Candidate query construction
//!
//! The candidate query is assembled from named fragments:
//!
//! - [`StagingRelation`]: the request's (name, version key) specs as a
//!   `VALUES` relation scoped to the statement
//! - [`VersionFilter`]: how the version key constrains a row
//! - [`PermissionJoin`]: the caller's ACL rows, joined on label scope
//!
//! Name and label scope are narrowed by the database in the same join; the
//! ACL name pattern is a glob and is tested by the caller on the returned
//! `pattern` column.

use crate::error::Result;
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use std::collections::BTreeSet;
use tracing::debug;

/// How a spec's version key is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VersionMatch {
    /// Ignore the version key
    #[default]
    None,
    /// Key is a label; matches rows whose branch lives on it
    Label,
    /// Key is a plain version
    Version,
    /// Key is a branch
    Branch,
}

/// One staged spec row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSpec {
    pub idx: usize,
    pub name: Option<String>,
    pub version_key: Option<String>,
}

/// The per-request `spec(idx, name, vkey)` relation
#[derive(Debug, Clone, Default)]
pub struct StagingRelation {
    rows: Vec<StagedSpec>,
}

impl StagingRelation {
    pub fn new(rows: Vec<StagedSpec>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `spec(idx, name, vkey) AS (VALUES (?, ?, ?), ...)`
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        let mut values = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let base = params.len();
            params.push(Value::Integer(row.idx as i64));
            params.push(row.name.clone().map_or(Value::Null, Value::Text));
            params.push(row.version_key.clone().map_or(Value::Null, Value::Text));
            values.push(format!("(?{}, ?{}, ?{})", base + 1, base + 2, base + 3));
        }
        format!("spec(idx, name, vkey) AS (VALUES {})", values.join(", "))
    }
}

/// Version-key predicate for a [`VersionMatch`] mode
#[derive(Debug, Clone, Copy)]
pub struct VersionFilter(pub VersionMatch);

impl VersionFilter {
    pub fn to_sql(&self) -> &'static str {
        match self.0 {
            VersionMatch::None => "1 = 1",
            VersionMatch::Label => "(spec.vkey IS NULL OR l.label = spec.vkey)",
            VersionMatch::Version => "(spec.vkey IS NULL OR i.version = spec.vkey)",
            VersionMatch::Branch => "(spec.vkey IS NULL OR b.branch = spec.vkey)",
        }
    }
}

/// Join against the ACL rows of the caller's roles
///
/// A row survives when some permission's label is the wildcard or equals
/// the row's branch label.
#[derive(Debug, Clone)]
pub struct PermissionJoin<'a> {
    pub roles: &'a BTreeSet<i64>,
}

impl PermissionJoin<'_> {
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        let mut holders = Vec::with_capacity(self.roles.len());
        for role in self.roles {
            params.push(Value::Integer(*role));
            holders.push(format!("?{}", params.len()));
        }
        format!(
            "JOIN permissions p ON p.role_id IN ({}) AND (p.label_id = 0 OR p.label_id = b.label_id)",
            holders.join(", ")
        )
    }
}

/// A row produced by the candidate query, before pattern and flavor checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub spec_idx: usize,
    pub instance_id: i64,
    pub name: String,
    pub version: String,
    pub flavor: String,
    pub branch: String,
    pub timestamps: String,
    pub final_timestamp: i64,
    pub pattern: String,
}

/// The assembled candidate query
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub staging: StagingRelation,
    pub version: VersionFilter,
    pub permissions: PermissionJoin<'a>,
    /// Presence states a row may be in
    pub states: &'a [&'static str],
}

impl CandidateQuery<'_> {
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let staging = self.staging.to_sql(&mut params);
        let permission_join = self.permissions.to_sql(&mut params);

        let mut states = Vec::with_capacity(self.states.len());
        for state in self.states {
            params.push(Value::Text((*state).to_string()));
            states.push(format!("?{}", params.len()));
        }

        let sql = format!(
            "WITH {staging}
             SELECT DISTINCT spec.idx, i.id, i.name, i.version, i.flavor, b.branch,
                    i.timestamps, i.final_timestamp, p.pattern
             FROM spec
             JOIN instances i ON (spec.name IS NULL OR i.name = spec.name)
             JOIN branches b ON b.id = i.branch_id
             JOIN labels l ON l.id = b.label_id
             {permission_join}
             WHERE i.state IN ({states}) AND {version}
             ORDER BY spec.idx, i.id, p.pattern",
            states = states.join(", "),
            version = self.version.to_sql(),
        );
        (sql, params)
    }

    pub fn fetch(&self, conn: &Connection) -> Result<Vec<CandidateRow>> {
        if self.staging.is_empty() || self.permissions.roles.is_empty() {
            return Ok(Vec::new());
        }

        let (sql, params) = self.to_sql();
        debug!("Candidate query with {} parameter(s)", params.len());

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok(CandidateRow {
                    spec_idx: row.get::<_, i64>(0)? as usize,
                    instance_id: row.get(1)?,
                    name: row.get(2)?,
                    version: row.get(3)?,
                    flavor: row.get(4)?,
                    branch: row.get(5)?,
                    timestamps: row.get(6)?,
                    final_timestamp: row.get(7)?,
                    pattern: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
