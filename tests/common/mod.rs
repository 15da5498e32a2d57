// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use conary_reposerver::auth::admin::{self, AclEntry};
use conary_reposerver::changeset::{FileChange, FileContents, TroveChange};
use conary_reposerver::server::MAX_PROTOCOL;
use conary_reposerver::server::handlers::commit::Upload;
use conary_reposerver::{AuthToken, ChangeSet, RepositoryServer, Result, ServerConfig, TroveTuple, db, hash};
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;

pub const LABEL: &str = "a.example.com@rpl:devel";
pub const V1: &str = "/a.example.com@rpl:devel/1.0-1-1";
pub const V2: &str = "/a.example.com@rpl:devel/1.1-1-1";

/// A repository rooted in a temporary directory.
///
/// Keep the struct alive for the duration of the test; dropping it removes
/// the directory.
pub struct TestRepo {
    pub dir: TempDir,
    pub server: RepositoryServer,
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::rooted(dir.path());
        configure(&mut config);
        let server = RepositoryServer::open(config).unwrap();
        let repo = Self { dir, server };
        repo.add_admin();
        repo
    }

    pub fn db_path(&self) -> &Path {
        &self.server.config.db_path
    }

    fn add_admin(&self) {
        let conn = db::open(self.db_path()).unwrap();
        admin::add_user(&conn, "root", "secret").unwrap();
        admin::add_role(&conn, "admins").unwrap();
        admin::update_role_members(&conn, "admins", &["root".to_string()]).unwrap();
        admin::set_role_admin(&conn, "admins", true).unwrap();
    }

    pub fn admin(&self) -> AuthToken {
        AuthToken::user("root", "secret")
    }

    pub fn call(&self, method: &str, token: &AuthToken, params: Value) -> Result<Value> {
        self.server.call(method, token, MAX_PROTOCOL, params)
    }

    /// Create `user` in a role of its own holding one ACL
    pub fn add_user_with_acl(&self, user: &str, acl: AclEntry) -> AuthToken {
        let admin = self.admin();
        let role = format!("{user}-role");
        self.call("addUser", &admin, json!({"user": user, "password": "pw"})).unwrap();
        self.call("addRole", &admin, json!({"role": role})).unwrap();
        self.call("updateRoleMembers", &admin, json!({"role": role, "members": [user]}))
            .unwrap();
        self.call("addAcl", &admin, json!({"role": role, "acl": acl})).unwrap();
        AuthToken::user(user, "pw")
    }

    /// Upload `cs` and commit it as `token`
    pub fn commit(&self, token: &AuthToken, cs: &ChangeSet) -> Result<Value> {
        let upload: Upload = serde_json::from_value(self.call("prepareChangeSet", token, Value::Null)?).unwrap();
        cs.write_to(Path::new(&upload.location))?;
        self.call("commitChangeSet", token, json!({"name": upload.name}))
    }

    pub fn current_change(&self) -> i64 {
        let conn = db::open(self.db_path()).unwrap();
        db::current_change(&conn).unwrap()
    }
}

pub fn acl(label: Option<&str>, pattern: Option<&str>, can_write: bool) -> AclEntry {
    AclEntry {
        label: label.map(str::to_string),
        pattern: pattern.map(str::to_string),
        can_write,
        can_remove: false,
        admin: false,
    }
}

/// A change set carrying one trove with the given files
pub fn change_set(name: &str, version: &str, files: &[(&str, &[u8])]) -> ChangeSet {
    let mut cs = ChangeSet::new();
    let mut trove = TroveChange::new(TroveTuple::new(name, version, "[ssl]"));
    for (path, data) in files {
        let sha = hash::sha256(data);
        trove.files.push(FileChange {
            path: path.to_string(),
            file_id: hash::sha256(format!("{path}:{sha}").as_bytes()),
            file_version: version.to_string(),
            sha256: sha.clone(),
            size: data.len() as u64,
            mode: 0o644,
        });
        cs.contents.push(FileContents {
            sha256: sha,
            data: data.to_vec(),
        });
    }
    cs.troves.push(trove);
    cs
}

pub fn tuple(name: &str, version: &str) -> TroveTuple {
    TroveTuple::new(name, version, "[ssl]")
}
