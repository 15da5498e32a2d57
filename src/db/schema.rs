// src/db/schema.rs

//! Database schema definitions and migrations for the repository
//!
//! Troves are stored as instances keyed by (name, version, flavor). The
//! `changed` column on instances and trove info rows is drawn from the
//! single `change_sequence` counter and drives the mirror feeds.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::Config(format!("Unknown migration version: {}", version))),
    }
}

/// Initial schema - Version 1
///
/// - change_sequence: the single `changed` counter
/// - labels, branches: scoping namespaces
/// - instances: one row per (name, version, flavor), never deleted
/// - trove_troves, trove_files, trove_info: contents and mutable info blocks
/// - users, roles, role_members, entitlement_groups, entitlements, permissions
/// - signing_keys, mirror_marks
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE change_sequence (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        );
        INSERT INTO change_sequence (id, value) VALUES (1, 0);

        CREATE TABLE labels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL UNIQUE
        );

        CREATE TABLE branches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            branch TEXT NOT NULL UNIQUE,
            label_id INTEGER NOT NULL REFERENCES labels(id)
        );

        CREATE TABLE instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            flavor TEXT NOT NULL,
            branch_id INTEGER NOT NULL REFERENCES branches(id),
            timestamps TEXT NOT NULL,
            final_timestamp INTEGER NOT NULL,
            state TEXT NOT NULL CHECK(state IN ('normal', 'hidden', 'missing', 'removed')),
            changed INTEGER NOT NULL,
            source_name TEXT,
            UNIQUE(name, version, flavor)
        );

        CREATE INDEX idx_instances_name ON instances(name);
        CREATE INDEX idx_instances_branch ON instances(branch_id);
        CREATE INDEX idx_instances_changed ON instances(changed);
        CREATE INDEX idx_instances_source ON instances(source_name);

        CREATE TABLE trove_troves (
            instance_id INTEGER NOT NULL REFERENCES instances(id),
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            flavor TEXT NOT NULL,
            weak INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (instance_id, name, version, flavor)
        );

        CREATE TABLE trove_files (
            instance_id INTEGER NOT NULL REFERENCES instances(id),
            path TEXT NOT NULL,
            file_id TEXT NOT NULL,
            file_version TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            size INTEGER NOT NULL,
            mode INTEGER NOT NULL,
            PRIMARY KEY (instance_id, path)
        );

        CREATE INDEX idx_trove_files_file_id ON trove_files(file_id);

        CREATE TABLE trove_info (
            instance_id INTEGER NOT NULL REFERENCES instances(id),
            info_type TEXT NOT NULL CHECK(info_type IN ('sigs', 'metadata', 'buildinfo')),
            data BLOB NOT NULL,
            changed INTEGER NOT NULL,
            PRIMARY KEY (instance_id, info_type)
        );

        CREATE INDEX idx_trove_info_changed ON trove_info(changed);

        CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL
        );

        CREATE TABLE roles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            can_mirror INTEGER NOT NULL DEFAULT 0,
            admin INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE role_members (
            role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            PRIMARY KEY (role_id, user_id)
        );

        CREATE TABLE entitlement_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE
        );

        CREATE TABLE entitlements (
            group_id INTEGER NOT NULL REFERENCES entitlement_groups(id) ON DELETE CASCADE,
            entitlement TEXT NOT NULL,
            PRIMARY KEY (group_id, entitlement)
        );

        -- label_id 0 and pattern 'ALL' are the wildcards
        CREATE TABLE permissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
            label_id INTEGER NOT NULL DEFAULT 0,
            pattern TEXT NOT NULL DEFAULT 'ALL',
            can_write INTEGER NOT NULL DEFAULT 0,
            can_remove INTEGER NOT NULL DEFAULT 0,
            admin INTEGER NOT NULL DEFAULT 0,
            UNIQUE(role_id, label_id, pattern)
        );

        CREATE INDEX idx_permissions_role ON permissions(role_id);

        CREATE TABLE signing_keys (
            fingerprint TEXT PRIMARY KEY,
            user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
            public_key TEXT NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER,
            changed INTEGER NOT NULL
        );

        CREATE INDEX idx_signing_keys_changed ON signing_keys(changed);

        CREATE TABLE mirror_marks (
            host TEXT PRIMARY KEY,
            mark INTEGER NOT NULL
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        set_schema_version(&conn, 1).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "change_sequence",
            "instances",
            "trove_troves",
            "trove_files",
            "trove_info",
            "roles",
            "permissions",
            "signing_keys",
            "mirror_marks",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_trove_triple_is_unique() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO labels (label) VALUES ('a.com@rpl:devel')", []).unwrap();
        conn.execute(
            "INSERT INTO branches (branch, label_id) VALUES ('/a.com@rpl:devel', 1)",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO instances
            (name, version, flavor, branch_id, timestamps, final_timestamp, state, changed)
            VALUES ('foo', '/a.com@rpl:devel/1-1-1', '', 1, '1.000', 1000, 'normal', 1)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
