// src/mirror/feed.rs

//! Paged change feeds
//!
//! A feed lists rows whose `changed` value is at or past a mark, joined
//! against the permission rows of the caller's mirror roles. A row granted
//! by several permissions comes back several times, so the statement limit
//! is the page size times the number of those permissions. Pages always end
//! on a complete `changed` group: a client that advances its mark past the
//! page can never skip a row.

use crate::auth::Authorizer;
use crate::db::models::InfoType;
use crate::error::{Error, Result};
use crate::resolver::query::PermissionJoin;
use crate::trove::TroveTuple;
use crate::version::Version;
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params_from_iter};
use std::collections::HashSet;
use tracing::debug;

/// Smallest number of distinct rows a full page is sized for
pub const MIN_BATCH: usize = 1000;

/// Which rows a feed walks
#[derive(Debug, Clone, Copy)]
pub enum FeedSource<'a> {
    /// Instances, keyed by `instances.changed`
    Troves,
    /// Info blocks of the given kinds, keyed by `trove_info.changed`,
    /// optionally limited to troves on the given labels
    Info {
        kinds: &'a [InfoType],
        labels: &'a [String],
    },
}

/// Lower bound of a fetch
#[derive(Debug, Clone, Copy)]
enum Bound {
    From(i64),
    Exactly(i64),
}

/// One row of a feed, after pattern checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRow {
    pub instance_id: i64,
    pub name: String,
    pub version: String,
    pub flavor: String,
    pub timestamps: String,
    pub state: String,
    pub info_type: Option<String>,
    pub data: Option<Vec<u8>>,
    pub changed: i64,
}

impl FeedRow {
    /// Tuple with the frozen version, as sent to mirrors
    pub fn frozen_tuple(&self) -> Result<TroveTuple> {
        let version = Version::from_stored(&self.version, &self.timestamps)?;
        Ok(TroveTuple::new(&self.name, version.freeze(), &self.flavor))
    }
}

struct RawRow {
    pattern: String,
    row: FeedRow,
}

impl RawRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            pattern: row.get(0)?,
            row: FeedRow {
                instance_id: row.get(1)?,
                name: row.get(2)?,
                version: row.get(3)?,
                flavor: row.get(4)?,
                timestamps: row.get(5)?,
                state: row.get(6)?,
                info_type: row.get(7)?,
                data: row.get(8)?,
                changed: row.get(9)?,
            },
        })
    }
}

impl FeedSource<'_> {
    fn changed_column(&self) -> &'static str {
        match self {
            FeedSource::Troves => "i.changed",
            FeedSource::Info { .. } => "t.changed",
        }
    }

    fn columns(&self) -> &'static str {
        match self {
            FeedSource::Troves => {
                "p.pattern, i.id, i.name, i.version, i.flavor, i.timestamps, i.state, NULL, NULL, i.changed"
            }
            FeedSource::Info { .. } => {
                "p.pattern, i.id, i.name, i.version, i.flavor, i.timestamps, i.state, t.info_type, t.data, t.changed"
            }
        }
    }

    fn from_clause(&self) -> &'static str {
        match self {
            FeedSource::Troves => "instances i JOIN branches b ON b.id = i.branch_id",
            FeedSource::Info { .. } => {
                "trove_info t JOIN instances i ON i.id = t.instance_id
                 JOIN branches b ON b.id = i.branch_id
                 JOIN labels l ON l.id = b.label_id"
            }
        }
    }

    fn order(&self) -> &'static str {
        match self {
            FeedSource::Troves => "i.changed, i.id",
            FeedSource::Info { .. } => "t.changed, i.id, t.info_type",
        }
    }

    fn placeholders(values: impl IntoIterator<Item = String>, params: &mut Vec<Value>) -> String {
        let mut holders = Vec::new();
        for value in values {
            params.push(Value::Text(value));
            holders.push(format!("?{}", params.len()));
        }
        holders.join(", ")
    }

    fn filters(&self, bound: Bound, params: &mut Vec<Value>) -> String {
        let (op, value) = match bound {
            Bound::From(mark) => (">=", mark),
            Bound::Exactly(changed) => ("=", changed),
        };
        params.push(Value::Integer(value));
        let mut clauses = vec![format!("{} {} ?{}", self.changed_column(), op, params.len())];

        match self {
            // Removals replicate as tombstones; staged troves stay private
            FeedSource::Troves => clauses.push("i.state IN ('normal', 'removed')".to_string()),
            FeedSource::Info { kinds, labels } => {
                clauses.push("i.state = 'normal'".to_string());
                let kinds = Self::placeholders(kinds.iter().map(|k| k.as_str().to_string()), params);
                clauses.push(format!("t.info_type IN ({kinds})"));
                if !labels.is_empty() {
                    let labels = Self::placeholders(labels.iter().cloned(), params);
                    clauses.push(format!("l.label IN ({labels})"));
                }
            }
        }
        clauses.join(" AND ")
    }
}

/// Runs feed queries for one caller
pub struct Feed<'c, 'a> {
    conn: &'c Connection,
    auth: &'c Authorizer<'a>,
    min_batch: usize,
}

impl<'c, 'a> Feed<'c, 'a> {
    pub fn new(conn: &'c Connection, auth: &'c Authorizer<'a>, min_batch: usize) -> Self {
        Self {
            conn,
            auth,
            min_batch: min_batch.max(1),
        }
    }

    /// Size of the largest `changed` group at or past `mark`
    fn largest_group(&self, source: FeedSource<'_>, mark: i64) -> Result<usize> {
        if let FeedSource::Info { kinds, .. } = source {
            if kinds.is_empty() {
                return Ok(0);
            }
        }
        let mut params = Vec::new();
        let filters = source.filters(Bound::From(mark), &mut params);
        let sql = format!(
            "SELECT MAX(c) FROM (SELECT COUNT(*) AS c FROM {} WHERE {} GROUP BY {})",
            source.from_clause(),
            filters,
            source.changed_column()
        );
        let largest: Option<i64> = self
            .conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(largest.unwrap_or(0).max(0) as usize)
    }

    fn fetch(
        &self,
        source: FeedSource<'_>,
        roles: &std::collections::BTreeSet<i64>,
        bound: Bound,
        limit: Option<usize>,
    ) -> Result<Vec<RawRow>> {
        if let FeedSource::Info { kinds, .. } = source {
            if kinds.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut params = Vec::new();
        let join = PermissionJoin { roles }.to_sql(&mut params);
        let filters = source.filters(bound, &mut params);
        let mut sql = format!(
            "SELECT {} FROM {} {} WHERE {} ORDER BY {}",
            source.columns(),
            source.from_clause(),
            join,
            filters,
            source.order()
        );
        if let Some(limit) = limit {
            params.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pattern-check and collapse rows granted by more than one permission
    fn visible(&self, rows: Vec<RawRow>) -> Vec<FeedRow> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for raw in rows {
            if !self.auth.check_trove(&raw.pattern, &raw.row.name) {
                continue;
            }
            if seen.insert((raw.row.instance_id, raw.row.info_type.clone())) {
                out.push(raw.row);
            }
        }
        out
    }

    /// One page of `source` starting at `mark`, plus the mark that follows it
    ///
    /// The returned mark is one past the largest `changed` on the page, or
    /// `mark` itself when nothing is left.
    pub fn page(&self, source: FeedSource<'_>, mark: i64) -> Result<(Vec<FeedRow>, i64)> {
        let roles = self.auth.mirror_roles()?;
        let permissions = self.auth.permission_count(&roles)?;
        if permissions == 0 {
            return Err(Error::InsufficientPermission);
        }

        let mut mark = mark;
        loop {
            let lim = self.min_batch.max(self.largest_group(source, mark)? + 1);
            let limit = lim * permissions;
            let raw = self.fetch(source, &roles, Bound::From(mark), Some(limit))?;
            let truncated = raw.len() >= limit;
            let last = raw.last().map(|r| r.row.changed);
            let mut rows = self.visible(raw);

            if let (true, Some(last)) = (truncated, last) {
                rows.retain(|r| r.changed != last);
                if rows.is_empty() {
                    rows = self.visible(self.fetch(source, &roles, Bound::Exactly(last), None)?);
                }
                if rows.is_empty() {
                    // Everything up to `last` is invisible to this caller
                    mark = last + 1;
                    continue;
                }
            }

            let next = rows.iter().map(|r| r.changed).max().map_or(mark, |max| max + 1);
            debug!(
                "Feed page from mark {}: {} row(s), limit {}, next mark {}",
                mark,
                rows.len(),
                limit,
                next
            );
            return Ok((rows, next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trove_filters_number_after_join_params() {
        let mut params = vec![Value::Integer(1), Value::Integer(2)];
        let sql = FeedSource::Troves.filters(Bound::From(5), &mut params);
        assert_eq!(sql, "i.changed >= ?3 AND i.state IN ('normal', 'removed')");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_info_filters_scope_kinds_and_labels() {
        let kinds = [InfoType::Sigs, InfoType::Metadata];
        let labels = vec!["a.example.com@rpl:devel".to_string()];
        let source = FeedSource::Info {
            kinds: &kinds,
            labels: &labels,
        };
        let mut params = Vec::new();
        let sql = source.filters(Bound::Exactly(7), &mut params);
        assert_eq!(
            sql,
            "t.changed = ?1 AND i.state = 'normal' AND t.info_type IN (?2, ?3) AND l.label IN (?4)"
        );
        assert_eq!(params.len(), 4);
    }
}
