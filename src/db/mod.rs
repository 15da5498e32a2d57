// src/db/mod.rs

//! Repository database
//!
//! All repository state lives in one SQLite database. Every call runs in
//! exactly one transaction obtained from [`transaction`]; lock contention is
//! never waited out here (busy timeout is zero) but surfaces as
//! [`Error::LockConflict`](crate::Error::LockConflict) for the call loop to
//! retry.

pub mod models;
pub mod schema;

use crate::error::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Create (or upgrade) the repository database at `db_path`
pub fn init(db_path: impl AsRef<Path>) -> Result<()> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!("Initializing repository database at {}", db_path.display());
    let conn = open(db_path)?;
    schema::migrate(&conn)?;
    Ok(())
}

/// Open a connection with the pragmas every caller relies on
pub fn open(db_path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::ZERO)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run `f` in a deferred transaction, committing on success
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    transaction_with(conn, TransactionBehavior::Deferred, f)
}

/// Run `f` in a transaction with explicit locking behavior
///
/// Write calls use `Immediate` so the write lock is taken up front and a
/// conflict shows up before any work is done.
pub fn transaction_with<T, F>(conn: &mut Connection, behavior: TransactionBehavior, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction_with_behavior(behavior)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Take the next value of the repository-wide `changed` sequence
pub fn next_change(conn: &Connection) -> Result<i64> {
    conn.execute("UPDATE change_sequence SET value = value + 1 WHERE id = 1", [])?;
    let value = conn.query_row("SELECT value FROM change_sequence WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(value)
}

/// Current value of the `changed` sequence without advancing it
pub fn current_change(conn: &Connection) -> Result<i64> {
    let value = conn.query_row("SELECT value FROM change_sequence WHERE id = 1", [], |row| {
        row.get(0)
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("repo.db");
        init(&path).unwrap();
        let conn = open(&path).unwrap();
        assert_eq!(current_change(&conn).unwrap(), 0);
    }

    #[test]
    fn test_next_change_is_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.db");
        init(&path).unwrap();
        let mut conn = open(&path).unwrap();

        let first = transaction(&mut conn, |tx| next_change(tx)).unwrap();
        let second = transaction(&mut conn, |tx| next_change(tx)).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.db");
        init(&path).unwrap();
        let mut conn = open(&path).unwrap();

        let result: Result<()> = transaction(&mut conn, |tx| {
            next_change(tx)?;
            Err(crate::Error::InvalidRequest("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(current_change(&conn).unwrap(), 0);
    }

    #[test]
    fn test_second_writer_sees_lock_conflict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.db");
        init(&path).unwrap();
        let mut first = open(&path).unwrap();
        let mut second = open(&path).unwrap();

        let tx = first
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();
        next_change(&tx).unwrap();

        let err = transaction_with(&mut second, TransactionBehavior::Immediate, |tx| next_change(tx))
            .unwrap_err();
        assert!(err.is_lock_conflict());
        tx.rollback().unwrap();
    }
}
