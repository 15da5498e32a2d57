// src/commit/signature.rs

//! Trove signatures and signing-key records
//!
//! Signatures are Ed25519 over `sha256(name \n version \n flavor)` of the
//! trove's storage identity. A trove's signature block is a CBOR list of
//! [`TroveSignature`] kept in its `sigs` info row.

use crate::auth::{Access, Authorizer};
use crate::db::models::{InfoType, Instance, SigningKeyEntry, TroveInfo, TroveState, User};
use crate::db;
use crate::error::{Error, Result};
use crate::hash;
use crate::trove::TroveTuple;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::info;

/// Hex digits kept from the public-key digest
const FINGERPRINT_LEN: usize = 40;

/// One signature over a trove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroveSignature {
    /// Fingerprint of the signing key
    pub fingerprint: String,
    /// Base64-encoded Ed25519 signature
    pub signature: String,
    /// Signing time, milliseconds since the epoch
    pub timestamp: i64,
}

/// The decoded signature block of a trove
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub signatures: Vec<TroveSignature>,
}

impl SignatureBlock {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        Ok(ciborium::from_reader(data)?)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.signatures.iter().any(|s| s.fingerprint == fingerprint)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Fingerprint of a raw Ed25519 public key
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let mut digest = hash::sha256(public_key);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Digest a signature covers; `trove` must be a storage identity
pub fn signed_message(trove: &TroveTuple) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(trove.name.as_bytes());
    hasher.update(b"\n");
    hasher.update(trove.version.as_bytes());
    hasher.update(b"\n");
    hasher.update(trove.flavor.as_bytes());
    hasher.finalize().to_vec()
}

pub(crate) fn decode_public_key(encoded: &str) -> Result<VerifyingKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::IncompatibleKey(format!("invalid public key: {e}")))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::IncompatibleKey("invalid key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::IncompatibleKey(format!("invalid key: {e}")))
}

fn verify(key: &SigningKeyEntry, trove: &TroveTuple, signature: &TroveSignature) -> Result<()> {
    let verifying_key = decode_public_key(&key.public_key)?;
    let sig_bytes = BASE64
        .decode(&signature.signature)
        .map_err(|e| Error::IncompatibleKey(format!("invalid signature: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::IncompatibleKey(format!("invalid signature: {e}")))?;
    verifying_key
        .verify(&signed_message(trove), &sig)
        .map_err(|_| Error::IncompatibleKey(format!("signature by {} does not verify", key.fingerprint)))
}

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Decoded signature block of an instance (empty when unsigned)
pub fn signatures_of(conn: &Connection, instance_id: i64) -> Result<SignatureBlock> {
    match TroveInfo::find(conn, instance_id, InfoType::Sigs)? {
        Some(info) => SignatureBlock::from_cbor(&info.data),
        None => Ok(SignatureBlock::default()),
    }
}

/// Add one signature to a trove
///
/// The sigs row is locked with a no-op update before it is read, so two
/// concurrent signers of the same trove serialize here. Returns the new
/// `changed` value of the block.
pub fn add_digital_signature(
    conn: &Connection,
    auth: &Authorizer<'_>,
    trove: &TroveTuple,
    signature: &TroveSignature,
) -> Result<i64> {
    let identity = trove.identity()?;
    auth.require_troves(std::slice::from_ref(&identity), Access::Write)?;

    let instance = Instance::find(conn, &identity)?
        .filter(|i| i.state == TroveState::Normal)
        .ok_or_else(|| Error::missing(&identity.name, Some(identity.version.clone())))?;
    let instance_id = instance
        .id
        .ok_or_else(|| Error::InvalidRequest("instance without ID".to_string()))?;

    TroveInfo::lock_for_update(conn, instance_id, InfoType::Sigs)?;
    let mut block = signatures_of(conn, instance_id)?;
    if block.contains(&signature.fingerprint) {
        return Err(Error::AlreadySigned(signature.fingerprint.clone()));
    }

    let key = SigningKeyEntry::find(conn, &signature.fingerprint)?
        .ok_or_else(|| Error::IncompatibleKey(format!("unknown key {}", signature.fingerprint)))?;
    if !key.is_usable(now_millis()) {
        return Err(Error::IncompatibleKey(format!(
            "key {} is revoked or expired",
            key.fingerprint
        )));
    }
    verify(&key, &identity, signature)?;

    block.signatures.push(signature.clone());
    let changed = db::next_change(conn)?;
    TroveInfo::new(instance_id, InfoType::Sigs, block.to_cbor()?, changed).upsert(conn)?;
    info!(
        "Added signature by {} to {} ({} total)",
        key.fingerprint,
        identity,
        block.len()
    );
    Ok(changed)
}

/// Register a public key for `owner` (the caller when `None`)
///
/// Registering for somebody else needs admin rights. Returns the key's
/// fingerprint.
pub fn add_new_key(
    conn: &Connection,
    auth: &Authorizer<'_>,
    owner: Option<&str>,
    public_key: &str,
    expires_at: Option<i64>,
) -> Result<String> {
    let caller = auth.user()?;
    let owner_id = match owner {
        Some(name) if caller.as_ref().is_none_or(|c| c.name != name) => {
            auth.require_admin()?;
            User::find_by_name(conn, name)?
                .and_then(|u| u.id)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown user {name}")))?
        }
        _ => caller
            .and_then(|u| u.id)
            .ok_or(Error::InsufficientPermission)?,
    };

    let verifying_key = decode_public_key(public_key)?;
    let fingerprint = key_fingerprint(verifying_key.as_bytes());
    if SigningKeyEntry::find(conn, &fingerprint)?.is_some() {
        return Ok(fingerprint);
    }

    let mut entry = SigningKeyEntry::new(&fingerprint, BASE64.encode(verifying_key.as_bytes()), Some(owner_id));
    entry.expires_at = expires_at;
    entry.changed = db::next_change(conn)?;
    entry.upsert(conn)?;
    info!("Registered signing key {}", fingerprint);
    Ok(fingerprint)
}

/// Public key record by fingerprint
pub fn get_key(conn: &Connection, fingerprint: &str) -> Result<SigningKeyEntry> {
    SigningKeyEntry::find(conn, fingerprint)?
        .ok_or_else(|| Error::IncompatibleKey(format!("unknown key {fingerprint}")))
}

/// Revoke a key; allowed for its owner and administrators
pub fn revoke_key(conn: &Connection, auth: &Authorizer<'_>, fingerprint: &str) -> Result<()> {
    let key = get_key(conn, fingerprint)?;
    let owns = match (auth.user()?, key.user_id) {
        (Some(user), Some(owner)) => user.id == Some(owner),
        _ => false,
    };
    if !owns {
        auth.require_admin()?;
    }
    SigningKeyEntry::revoke(conn, fingerprint, db::next_change(conn)?)?;
    info!("Revoked signing key {}", fingerprint);
    Ok(())
}

/// Reassign a key to another user; administrators only
pub fn change_key_owner(conn: &Connection, auth: &Authorizer<'_>, fingerprint: &str, owner: &str) -> Result<()> {
    auth.require_admin()?;
    let user_id = User::find_by_name(conn, owner)?
        .and_then(|u| u.id)
        .ok_or_else(|| Error::InvalidRequest(format!("unknown user {owner}")))?;
    SigningKeyEntry::set_owner(conn, fingerprint, user_id, db::next_change(conn)?)?;
    info!("Signing key {} now owned by {}", fingerprint, owner);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthToken;
    use crate::db::models::{ANY_LABEL, BranchEntry, Permission, Role};
    use crate::version::Version;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repo.db");
        db::init(&path).unwrap();
        let conn = db::open(&path).unwrap();

        let mut user = User::new("signer", "pw");
        user.insert(&conn).unwrap();
        let mut role = Role::new("signers");
        role.insert(&conn).unwrap();
        role.set_members(&conn, &[user.id.unwrap()]).unwrap();
        let mut perm = Permission::new(role.id.unwrap(), ANY_LABEL, "ALL");
        perm.can_write = true;
        perm.insert(&conn).unwrap();
        (dir, conn)
    }

    fn add_trove(conn: &Connection) -> TroveTuple {
        let version = Version::parse("/a.example.com@rpl:devel/1000.000:1.0-1-1").unwrap();
        let branch_id = BranchEntry::insert_or_get(conn, &version.branch).unwrap();
        let mut instance = Instance::new(&version, "foo", "[ssl]", branch_id);
        instance.insert(conn).unwrap();
        instance.tuple()
    }

    fn register(conn: &Connection, auth: &Authorizer<'_>) -> (SigningKey, String) {
        let key = SigningKey::generate(&mut OsRng);
        let public = BASE64.encode(key.verifying_key().as_bytes());
        let fingerprint = add_new_key(conn, auth, None, &public, None).unwrap();
        (key, fingerprint)
    }

    fn sign(key: &SigningKey, fingerprint: &str, trove: &TroveTuple) -> TroveSignature {
        TroveSignature {
            fingerprint: fingerprint.to_string(),
            signature: BASE64.encode(key.sign(&signed_message(trove)).to_bytes()),
            timestamp: now_millis(),
        }
    }

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(key_fingerprint(&[7u8; 32]).len(), 40);
    }

    #[test]
    fn test_duplicate_signature_is_rejected() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (key, fp) = register(&conn, &auth);

        add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap();
        let err = add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap_err();
        assert!(matches!(err, Error::AlreadySigned(_)));
    }

    #[test]
    fn test_second_key_adds_signature() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (first, first_fp) = register(&conn, &auth);
        let (second, second_fp) = register(&conn, &auth);

        add_digital_signature(&conn, &auth, &trove, &sign(&first, &first_fp, &trove)).unwrap();
        add_digital_signature(&conn, &auth, &trove, &sign(&second, &second_fp, &trove)).unwrap();

        let instance = Instance::find(&conn, &trove).unwrap().unwrap();
        assert_eq!(signatures_of(&conn, instance.id.unwrap()).unwrap().len(), 2);
    }

    #[test]
    fn test_revoked_key_is_incompatible() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (key, fp) = register(&conn, &auth);
        revoke_key(&conn, &auth, &fp).unwrap();

        let err = add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap_err();
        assert!(matches!(err, Error::IncompatibleKey(_)));
    }

    #[test]
    fn test_duplicate_is_reported_before_key_validity() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (key, fp) = register(&conn, &auth);

        add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap();
        revoke_key(&conn, &auth, &fp).unwrap();

        let err = add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap_err();
        assert!(matches!(err, Error::AlreadySigned(ref f) if *f == fp));
    }

    #[test]
    fn test_expired_key_is_incompatible() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let key = SigningKey::generate(&mut OsRng);
        let public = BASE64.encode(key.verifying_key().as_bytes());
        let fp = add_new_key(&conn, &auth, None, &public, Some(1)).unwrap();

        let err = add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &trove)).unwrap_err();
        assert!(matches!(err, Error::IncompatibleKey(_)));
    }

    #[test]
    fn test_bad_signature_is_incompatible() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (key, fp) = register(&conn, &auth);

        let other = TroveTuple::new("bar", &trove.version, "");
        let err = add_digital_signature(&conn, &auth, &trove, &sign(&key, &fp, &other)).unwrap_err();
        assert!(matches!(err, Error::IncompatibleKey(_)));
    }

    #[test]
    fn test_signing_needs_write_permission() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let trove = add_trove(&conn);
        let (key, fp) = register(&conn, &auth);

        let anonymous = AuthToken::default();
        let anon_auth = Authorizer::new(&conn, &anonymous);
        let err = add_digital_signature(&conn, &anon_auth, &trove, &sign(&key, &fp, &trove)).unwrap_err();
        assert!(matches!(err, Error::InsufficientPermission));
    }

    #[test]
    fn test_key_owner_changes_need_admin() {
        let (_dir, conn) = setup();
        let token = AuthToken::user("signer", "pw");
        let auth = Authorizer::new(&conn, &token);
        let (_, fp) = register(&conn, &auth);

        assert_eq!(get_key(&conn, &fp).unwrap().owner.as_deref(), Some("signer"));
        assert!(matches!(
            change_key_owner(&conn, &auth, &fp, "signer"),
            Err(Error::InsufficientPermission)
        ));
    }

    #[test]
    fn test_anonymous_cannot_register_keys() {
        let (_dir, conn) = setup();
        let token = AuthToken::default();
        let auth = Authorizer::new(&conn, &token);
        let key = SigningKey::generate(&mut OsRng);
        let public = BASE64.encode(key.verifying_key().as_bytes());
        assert!(matches!(
            add_new_key(&conn, &auth, None, &public, None),
            Err(Error::InsufficientPermission)
        ));
    }
}
