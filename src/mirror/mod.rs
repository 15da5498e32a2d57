// src/mirror/mod.rs

//! Mirror sync protocol
//!
//! Mirrors pull by mark: each feed call returns the rows changed at or after
//! the mark together with the mark to ask for next. A client repeats with
//! the returned mark until it gets an empty page. Every call here needs a
//! mirror-capable role.

pub mod feed;

pub use feed::{FeedRow, FeedSource, MIN_BATCH};

use crate::auth::{Access, Authorizer};
use crate::commit::signature::{decode_public_key, key_fingerprint};
use crate::db;
use crate::db::models::{InfoType, Instance, MirrorMark, SigningKeyEntry, TroveInfo, TroveState};
use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use feed::Feed;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One feed entry and the `changed` value it was recorded under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorEntry<T> {
    pub changed: i64,
    pub item: T,
}

/// A page of a mirror feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPage<T> {
    pub entries: Vec<MirrorEntry<T>>,
    /// Mark to request next
    pub mark: i64,
}

impl<T> MirrorPage<T> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A trove listed by [`MirrorService::new_troves`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTrove {
    /// Frozen tuple, timestamps included
    pub trove: TroveTuple,
    /// The trove was removed; mirrors replicate the tombstone
    pub removed: bool,
}

/// An info block listed by [`MirrorService::new_trove_info`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInfo {
    pub trove: TroveTuple,
    pub info_type: InfoType,
    pub data: Vec<u8>,
}

/// Key material exchanged between mirrors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Base64-encoded Ed25519 public key
    pub public_key: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl From<SigningKeyEntry> for KeyRecord {
    fn from(entry: SigningKeyEntry) -> Self {
        Self {
            public_key: entry.public_key,
            revoked: entry.revoked,
            expires_at: entry.expires_at,
        }
    }
}

/// Result of [`MirrorService::set_trove_sigs`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigUpdate {
    /// Number of signature blocks that changed
    pub updated: usize,
    /// Identities whose blocks changed
    pub troves: Vec<TroveTuple>,
}

/// Mirror operations for one caller
pub struct MirrorService<'c, 'a> {
    conn: &'c Connection,
    auth: &'c Authorizer<'a>,
    min_batch: usize,
}

impl<'c, 'a> MirrorService<'c, 'a> {
    pub fn new(conn: &'c Connection, auth: &'c Authorizer<'a>) -> Self {
        Self {
            conn,
            auth,
            min_batch: MIN_BATCH,
        }
    }

    pub fn with_min_batch(mut self, min_batch: usize) -> Self {
        self.min_batch = min_batch;
        self
    }

    fn feed(&self) -> Feed<'c, 'a> {
        Feed::new(self.conn, self.auth, self.min_batch)
    }

    /// Stored cursor of `host`, or -1 when it never pulled
    pub fn mirror_mark(&self, host: &str) -> Result<i64> {
        self.auth.require_mirror()?;
        MirrorMark::get(self.conn, host)
    }

    /// Store the cursor of `host`; returns the mark now stored
    ///
    /// Only administrators may move a mark backwards. For anybody else an
    /// older mark leaves the stored one in place.
    pub fn set_mirror_mark(&self, host: &str, mark: i64) -> Result<i64> {
        self.auth.require_mirror()?;
        let current = MirrorMark::get(self.conn, host)?;
        if mark < current && !self.auth.is_admin()? {
            warn!(
                "Ignoring backwards mirror mark for {}: {} < {}",
                host, mark, current
            );
            return Ok(current);
        }
        MirrorMark::set(self.conn, host, mark)?;
        info!("Mirror mark for {} set to {}", host, mark);
        Ok(mark)
    }

    /// Troves changed at or after `mark`
    pub fn new_troves(&self, mark: i64) -> Result<MirrorPage<NewTrove>> {
        self.auth.require_mirror()?;
        let (rows, next) = self.feed().page(FeedSource::Troves, mark)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(MirrorEntry {
                changed: row.changed,
                item: NewTrove {
                    trove: row.frozen_tuple()?,
                    removed: row.state == TroveState::Removed.as_str(),
                },
            });
        }
        Ok(MirrorPage { entries, mark: next })
    }

    /// Troves whose signature block changed at or after `mark`
    pub fn new_sigs(&self, mark: i64) -> Result<MirrorPage<TroveTuple>> {
        self.auth.require_mirror()?;
        let kinds = [InfoType::Sigs];
        let source = FeedSource::Info {
            kinds: &kinds,
            labels: &[],
        };
        let (rows, next) = self.feed().page(source, mark)?;
        let entries = rows
            .iter()
            .map(|row| {
                Ok(MirrorEntry {
                    changed: row.changed,
                    item: row.frozen_tuple()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MirrorPage { entries, mark: next })
    }

    /// Info blocks of the given kinds changed at or after `mark`
    ///
    /// An empty `labels` means every label.
    pub fn new_trove_info(&self, mark: i64, kinds: &[InfoType], labels: &[String]) -> Result<MirrorPage<NewInfo>> {
        self.auth.require_mirror()?;
        let source = FeedSource::Info { kinds, labels };
        let (rows, next) = self.feed().page(source, mark)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let info_type = row
                .info_type
                .as_deref()
                .unwrap_or_default()
                .parse::<InfoType>()
                .map_err(Error::ParseError)?;
            entries.push(MirrorEntry {
                changed: row.changed,
                item: NewInfo {
                    trove: row.frozen_tuple()?,
                    info_type,
                    data: row.data.unwrap_or_default(),
                },
            });
        }
        Ok(MirrorPage { entries, mark: next })
    }

    fn instance_for(&self, trove: &TroveTuple, access: Access) -> Result<(TroveTuple, i64)> {
        let identity = trove.identity()?;
        self.auth
            .require_troves(std::slice::from_ref(&identity), access)?;
        let instance_id = Instance::find(self.conn, &identity)?
            .filter(|i| i.state == TroveState::Normal)
            .and_then(|i| i.id)
            .ok_or_else(|| Error::missing(&identity.name, Some(identity.version.clone())))?;
        Ok((identity, instance_id))
    }

    /// Raw signature blocks of `troves`; empty for unsigned troves
    pub fn trove_sigs(&self, troves: &[TroveTuple]) -> Result<Vec<Vec<u8>>> {
        self.auth.require_mirror()?;
        let mut blocks = Vec::with_capacity(troves.len());
        for trove in troves {
            let (_, instance_id) = self.instance_for(trove, Access::Read)?;
            let block = TroveInfo::find(self.conn, instance_id, InfoType::Sigs)?
                .map(|info| info.data)
                .unwrap_or_default();
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Replace signature blocks copied from another repository
    ///
    /// Blocks are stored as received. Unchanged blocks are skipped and do
    /// not take a new `changed` value.
    pub fn set_trove_sigs(&self, updates: &[(TroveTuple, Vec<u8>)]) -> Result<SigUpdate> {
        self.auth.require_mirror()?;
        let mut stamp = None;
        let mut result = SigUpdate::default();

        for (trove, data) in updates {
            let (identity, instance_id) = self.instance_for(trove, Access::Write)?;
            TroveInfo::lock_for_update(self.conn, instance_id, InfoType::Sigs)?;
            let current = TroveInfo::find(self.conn, instance_id, InfoType::Sigs)?;
            if current.is_some_and(|c| &c.data == data) {
                continue;
            }

            let changed = match stamp {
                Some(value) => value,
                None => {
                    let value = db::next_change(self.conn)?;
                    stamp = Some(value);
                    value
                }
            };
            TroveInfo::new(instance_id, InfoType::Sigs, data.clone(), changed).upsert(self.conn)?;
            result.updated += 1;
            result.troves.push(identity);
        }

        if result.updated > 0 {
            info!("Mirror replaced {} signature block(s)", result.updated);
        }
        Ok(result)
    }

    /// Signing keys changed at or after `mark`
    pub fn new_keys(&self, mark: i64) -> Result<Vec<KeyRecord>> {
        self.auth.require_mirror()?;
        Ok(SigningKeyEntry::find_changed_since(self.conn, mark)?
            .into_iter()
            .map(KeyRecord::from)
            .collect())
    }

    /// Import keys from another repository; returns how many records changed
    ///
    /// Imported keys have no owner. Known keys only pick up revocation and
    /// expiry changes.
    pub fn add_key_list(&self, keys: &[KeyRecord]) -> Result<usize> {
        self.auth.require_mirror()?;
        let mut count = 0;

        for record in keys {
            let verifying_key = decode_public_key(&record.public_key)?;
            let fingerprint = key_fingerprint(verifying_key.as_bytes());

            let mut entry = match SigningKeyEntry::find(self.conn, &fingerprint)? {
                Some(existing) => {
                    let revoked = existing.revoked || record.revoked;
                    if revoked == existing.revoked && record.expires_at == existing.expires_at {
                        continue;
                    }
                    SigningKeyEntry {
                        revoked,
                        ..existing
                    }
                }
                None => SigningKeyEntry::new(&fingerprint, BASE64.encode(verifying_key.as_bytes()), None),
            };
            entry.expires_at = record.expires_at;
            entry.revoked = entry.revoked || record.revoked;
            entry.changed = db::next_change(self.conn)?;
            entry.upsert(self.conn)?;
            debug!("Imported signing key {}", fingerprint);
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::db::models::{ANY_LABEL, BranchEntry, LabelEntry, Permission, Role, User};
    use crate::version::Version;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    const BRANCH: &str = "/a.example.com@rpl:devel";
    const OTHER: &str = "/b.example.com@rpl:devel";

    fn setup() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.db");
        db::init(&path).unwrap();
        let conn = db::open(&path).unwrap();
        (dir, conn)
    }

    /// User `name` with one role; `perms` are (label, pattern) rows
    fn user(conn: &Connection, name: &str, mirror: bool, admin: bool, perms: &[(Option<&str>, &str)]) {
        let mut u = User::new(name, "pw");
        u.insert(conn).unwrap();
        let mut role = Role::new(format!("{name}-role"));
        role.insert(conn).unwrap();
        role.set_members(conn, &[u.id.unwrap()]).unwrap();
        role.set_flags(conn, mirror, admin).unwrap();
        for (label, pattern) in perms {
            let label_id = label.map_or(ANY_LABEL, |l| LabelEntry::new(l).insert_or_get(conn).unwrap());
            let mut perm = Permission::new(role.id.unwrap(), label_id, *pattern);
            perm.can_write = true;
            perm.insert(conn).unwrap();
        }
    }

    fn add(conn: &Connection, name: &str, branch: &str, rev: &str, changed: i64, state: TroveState) -> TroveTuple {
        let version = Version::parse(&format!("{branch}/1000.000:{rev}")).unwrap();
        let branch_id = BranchEntry::insert_or_get(conn, &version.branch).unwrap();
        let mut instance = Instance::new(&version, name, "", branch_id);
        instance.state = state;
        instance.changed = changed;
        instance.insert(conn).unwrap();
        instance.tuple()
    }

    fn with_batch<T>(
        conn: &Connection,
        name: &str,
        min_batch: usize,
        f: impl FnOnce(&MirrorService<'_, '_>) -> T,
    ) -> T {
        let token = AuthToken::user(name, "pw");
        let auth = Authorizer::new(conn, &token);
        let service = MirrorService::new(conn, &auth).with_min_batch(min_batch);
        f(&service)
    }

    fn with_service<T>(conn: &Connection, name: &str, f: impl FnOnce(&MirrorService<'_, '_>) -> T) -> T {
        with_batch(conn, name, MIN_BATCH, f)
    }

    /// Pull from `mark` until an empty page, checking the boundary on the way
    fn drain(svc: &MirrorService<'_, '_>, mut mark: i64) -> Vec<i64> {
        let mut seen = Vec::new();
        for _ in 0..20 {
            let page = svc.new_troves(mark).unwrap();
            if page.is_empty() {
                return seen;
            }
            assert!(page.entries.iter().all(|e| e.changed >= mark));
            seen.extend(page.entries.iter().map(|e| e.changed));
            mark = page.mark;
        }
        panic!("feed did not drain");
    }

    fn changes(page: &MirrorPage<NewTrove>) -> Vec<i64> {
        page.entries.iter().map(|e| e.changed).collect()
    }

    // === Mark tests ===

    #[test]
    fn test_mark_defaults_and_round_trips() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        with_service(&conn, "mirror", |svc| {
            assert_eq!(svc.mirror_mark("m1").unwrap(), -1);
            assert_eq!(svc.set_mirror_mark("m1", 10).unwrap(), 10);
            assert_eq!(svc.mirror_mark("m1").unwrap(), 10);
        });
    }

    #[test]
    fn test_mark_never_moves_back_for_non_admin() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        user(&conn, "root", true, true, &[(None, "ALL")]);
        with_service(&conn, "mirror", |svc| {
            svc.set_mirror_mark("m1", 10).unwrap();
            assert_eq!(svc.set_mirror_mark("m1", 5).unwrap(), 10);
        });
        with_service(&conn, "root", |svc| {
            assert_eq!(svc.set_mirror_mark("m1", 5).unwrap(), 5);
        });
    }

    #[test]
    fn test_mark_requires_mirror_role() {
        let (_dir, conn) = setup();
        user(&conn, "reader", false, false, &[(None, "ALL")]);
        with_service(&conn, "reader", |svc| {
            assert!(matches!(svc.mirror_mark("m1"), Err(Error::InsufficientPermission)));
        });
    }

    // === Trove feed tests ===

    #[test]
    fn test_mirror_role_without_permissions_is_refused() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[]);
        with_service(&conn, "mirror", |svc| {
            assert!(matches!(svc.new_troves(0), Err(Error::InsufficientPermission)));
        });
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);
        add(&conn, "b", BRANCH, "1-1-1", 2, TroveState::Normal);
        add(&conn, "c", BRANCH, "1-1-1", 3, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            let page = svc.new_troves(2).unwrap();
            assert_eq!(changes(&page), vec![2, 3]);
            assert_eq!(page.mark, 4);

            let empty = svc.new_troves(4).unwrap();
            assert!(empty.is_empty());
            assert_eq!(empty.mark, 4);
        });
    }

    #[test]
    fn test_hidden_excluded_removed_flagged() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Hidden);
        add(&conn, "b", BRANCH, "1-1-1", 2, TroveState::Removed);
        add(&conn, "c", BRANCH, "1-1-1", 3, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            let page = svc.new_troves(0).unwrap();
            let names: Vec<(&str, bool)> = page
                .entries
                .iter()
                .map(|e| (e.item.trove.name.as_str(), e.item.removed))
                .collect();
            assert_eq!(names, vec![("b", true), ("c", false)]);
            assert!(page.entries[0].item.trove.version.contains(':'));
        });
    }

    #[test]
    fn test_pages_end_on_complete_groups() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        for (i, changed) in [1, 1, 1, 2, 3, 4].iter().enumerate() {
            add(&conn, &format!("t{i}"), BRANCH, "1-1-1", *changed, TroveState::Normal);
        }

        with_batch(&conn, "mirror", 2, |svc| {
            let first = svc.new_troves(0).unwrap();
            assert_eq!(changes(&first), vec![1, 1, 1]);
            assert_eq!(first.mark, 2);
        });
    }

    #[test]
    fn test_repeated_pulls_drain_the_feed() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        for (i, changed) in [1, 1, 1, 2, 3, 4, 4, 5].iter().enumerate() {
            add(&conn, &format!("t{i}"), BRANCH, "1-1-1", *changed, TroveState::Normal);
        }

        with_batch(&conn, "mirror", 2, |svc| {
            assert_eq!(drain(svc, 0), vec![1, 1, 1, 2, 3, 4, 4, 5]);
            assert_eq!(drain(svc, 4), vec![4, 4, 5]);
        });
    }

    #[test]
    fn test_overlapping_permissions_do_not_duplicate() {
        let (_dir, conn) = setup();
        user(
            &conn,
            "mirror",
            true,
            false,
            &[(None, "ALL"), (Some("a.example.com@rpl:devel"), "ALL")],
        );
        add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);
        add(&conn, "b", BRANCH, "1-1-1", 2, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            assert_eq!(changes(&svc.new_troves(0).unwrap()), vec![1, 2]);
        });
        with_batch(&conn, "mirror", 1, |svc| {
            assert_eq!(drain(svc, 0), vec![1, 2]);
        });
    }

    #[test]
    fn test_feed_respects_scope() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(Some("a.example.com@rpl:devel"), "foo*")]);
        add(&conn, "foo", BRANCH, "1-1-1", 1, TroveState::Normal);
        add(&conn, "bar", BRANCH, "1-1-1", 2, TroveState::Normal);
        add(&conn, "foo", OTHER, "1-1-1", 3, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            let page = svc.new_troves(0).unwrap();
            assert_eq!(changes(&page), vec![1]);
            assert_eq!(page.mark, 2);
            assert!(svc.new_troves(page.mark).unwrap().is_empty());
        });
    }

    // === Info feed tests ===

    #[test]
    fn test_sig_feed_follows_info_changes() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);
        let b = add(&conn, "b", BRANCH, "1-1-1", 2, TroveState::Normal);
        let b_id = Instance::find(&conn, &b).unwrap().unwrap().id.unwrap();
        TroveInfo::new(b_id, InfoType::Sigs, b"sig".to_vec(), 7).upsert(&conn).unwrap();
        TroveInfo::new(b_id, InfoType::Metadata, b"meta".to_vec(), 8).upsert(&conn).unwrap();

        let frozen = Instance::find(&conn, &b).unwrap().unwrap().frozen_tuple().unwrap();

        with_service(&conn, "mirror", |svc| {
            let page = svc.new_sigs(3).unwrap();
            assert_eq!(page.entries.len(), 1);
            assert_eq!(page.entries[0].item, frozen);
            assert!(page.entries[0].item.version.contains(':'));
            assert_eq!(svc.new_troves(0).unwrap().entries[1].item.trove, frozen);
            assert_eq!(page.entries[0].changed, 7);
            assert_eq!(page.mark, 8);
            assert!(svc.new_sigs(8).unwrap().is_empty());
        });
    }

    #[test]
    fn test_info_feed_scopes_kinds_and_labels() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        let a = add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);
        let b = add(&conn, "b", OTHER, "1-1-1", 2, TroveState::Normal);
        for (trove, changed) in [(&a, 3), (&b, 4)] {
            let id = Instance::find(&conn, trove).unwrap().unwrap().id.unwrap();
            TroveInfo::new(id, InfoType::Metadata, b"meta".to_vec(), changed).upsert(&conn).unwrap();
            TroveInfo::new(id, InfoType::BuildInfo, b"build".to_vec(), changed).upsert(&conn).unwrap();
        }

        with_service(&conn, "mirror", |svc| {
            let labels = vec!["b.example.com@rpl:devel".to_string()];
            let page = svc.new_trove_info(0, &[InfoType::Metadata], &labels).unwrap();
            assert_eq!(page.entries.len(), 1);
            let frozen = Instance::find(&conn, &b).unwrap().unwrap().frozen_tuple().unwrap();
            assert_eq!(page.entries[0].item.trove, frozen);
            assert_eq!(page.entries[0].item.info_type, InfoType::Metadata);

            let all = svc
                .new_trove_info(0, &[InfoType::Metadata, InfoType::BuildInfo], &[])
                .unwrap();
            assert_eq!(all.entries.len(), 4);
            assert!(svc.new_trove_info(0, &[], &[]).unwrap().is_empty());
        });
    }

    // === Signature transfer tests ===

    #[test]
    fn test_trove_sigs_for_unsigned_and_missing() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        let a = add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            assert_eq!(svc.trove_sigs(&[a.clone()]).unwrap(), vec![Vec::<u8>::new()]);
            let ghost = TroveTuple::new("ghost", format!("{BRANCH}/1-1-1"), "");
            assert!(matches!(
                svc.trove_sigs(&[ghost]),
                Err(Error::ArtifactMissing { .. })
            ));
        });
    }

    #[test]
    fn test_set_trove_sigs_counts_changes() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        let a = add(&conn, "a", BRANCH, "1-1-1", 1, TroveState::Normal);

        with_service(&conn, "mirror", |svc| {
            let updates = vec![(a.clone(), b"block".to_vec())];
            let first = svc.set_trove_sigs(&updates).unwrap();
            assert_eq!(first.updated, 1);
            assert_eq!(first.troves, vec![a.clone()]);
            assert_eq!(svc.set_trove_sigs(&updates).unwrap().updated, 0);
            assert_eq!(svc.trove_sigs(&[a.clone()]).unwrap(), vec![b"block".to_vec()]);
        });
    }

    // === Key tests ===

    #[test]
    fn test_key_list_round_trip() {
        let (_dir, conn) = setup();
        user(&conn, "mirror", true, false, &[(None, "ALL")]);
        let key = SigningKey::generate(&mut OsRng);
        let record = KeyRecord {
            public_key: BASE64.encode(key.verifying_key().as_bytes()),
            revoked: false,
            expires_at: None,
        };

        with_service(&conn, "mirror", |svc| {
            assert_eq!(svc.add_key_list(&[record.clone()]).unwrap(), 1);
            assert_eq!(svc.add_key_list(&[record.clone()]).unwrap(), 0);
            assert_eq!(svc.new_keys(0).unwrap(), vec![record.clone()]);

            let revoked = KeyRecord {
                revoked: true,
                ..record.clone()
            };
            assert_eq!(svc.add_key_list(&[revoked]).unwrap(), 1);
            assert!(svc.new_keys(0).unwrap()[0].revoked);
        });
    }
}
