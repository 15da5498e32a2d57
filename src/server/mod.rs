// src/server/mod.rs
//! Repository server call surface
//!
//! [`RepositoryServer::call`] is the single entry point. Each call:
//! - is refused outright while the repository is closed
//! - is looked up in the [`OperationRegistry`]
//! - is checked against the advertised protocol range and the operation's minimum
//! - is refused in read-only mode when the operation writes
//! - runs in one transaction, rerun from the top on lock conflicts
//!
//! Post-commit work (notification, cache sweeps) only runs once the
//! transaction is durable.

pub mod config;
pub mod context;
pub mod handlers;
pub mod registry;
#[cfg(feature = "server")]
mod routes;

pub use config::RepositoryConfigFile;
pub use context::{CallContext, Effects, Scratch};
pub use registry::{Handler, MAX_PROTOCOL, MIN_PROTOCOL, Operation, OperationRegistry};
#[cfg(feature = "server")]
pub use routes::{RpcRequest, create_router};

use crate::auth::{AuthToken, Authorizer};
use crate::changeset::ChangeSetCache;
use crate::commit::{CommandNotifier, CommitNotifier, NoopNotifier};
use crate::db;
use crate::error::{Error, Result};
use crate::filesystem::ContentStore;
use parking_lot::Mutex;
use rusqlite::TransactionBehavior;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info, info_span, warn};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Host names of the labels served here; empty serves every label
    pub server_names: Vec<String>,
    /// Reject every write operation
    pub read_only: bool,
    /// Reject every call with this message
    pub closed: Option<String>,
    /// Run write calls one at a time
    pub serialize_commits: bool,
    /// Attempts per call before a lock conflict is reported
    pub deadlock_retry: u32,
    /// Command run after each successful commit
    pub commit_action: Option<String>,
    /// Path to the repository database
    pub db_path: PathBuf,
    /// Path to the content store
    pub contents_dir: PathBuf,
    /// Scratch directory for uploads and manifests
    pub tmp_dir: PathBuf,
    /// Change-set cache directory (None = caching disabled)
    pub cache_dir: Option<PathBuf>,
    /// Rows a full mirror feed page is sized for
    pub mirror_min_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            server_names: Vec::new(),
            read_only: false,
            closed: None,
            serialize_commits: false,
            deadlock_retry: 5,
            commit_action: None,
            db_path: PathBuf::from("/srv/conary/repo.db"),
            contents_dir: PathBuf::from("/srv/conary/contents"),
            tmp_dir: PathBuf::from("/srv/conary/tmp"),
            cache_dir: None,
            mirror_min_batch: crate::mirror::MIN_BATCH,
        }
    }
}

impl ServerConfig {
    /// Configuration with every path under `root`
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_path: root.join("repo.db"),
            contents_dir: root.join("contents"),
            tmp_dir: root.join("tmp"),
            cache_dir: Some(root.join("cache")),
            ..Self::default()
        }
    }
}

/// Runs before every attempt of a call, inside its transaction
pub type AttemptHook = Box<dyn Fn(&str, u32) -> Result<()> + Send + Sync>;

/// Shared server state
pub struct RepositoryServer {
    pub config: ServerConfig,
    pub store: ContentStore,
    pub cache: Option<ChangeSetCache>,
    registry: OperationRegistry,
    notifier: Box<dyn CommitNotifier>,
    commit_lock: Mutex<()>,
    attempt_hook: Option<AttemptHook>,
}

impl RepositoryServer {
    /// Open (creating when needed) the repository described by `config`
    pub fn open(config: ServerConfig) -> Result<Self> {
        db::init(&config.db_path)?;
        let store = ContentStore::new(&config.contents_dir)?;
        std::fs::create_dir_all(&config.tmp_dir)?;
        let cache = config.cache_dir.as_ref().map(ChangeSetCache::new).transpose()?;

        let registry = OperationRegistry::standard();
        registry.validate()?;

        let notifier: Box<dyn CommitNotifier> = match &config.commit_action {
            Some(command) => Box::new(CommandNotifier::new(command.clone())),
            None => Box::new(NoopNotifier),
        };

        info!(
            "Repository opened: {} operation(s), protocol {}..={}, cache {}",
            registry.len(),
            MIN_PROTOCOL,
            MAX_PROTOCOL,
            if cache.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            store,
            cache,
            registry,
            notifier,
            commit_lock: Mutex::new(()),
            attempt_hook: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn CommitNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_attempt_hook(mut self, hook: AttemptHook) -> Self {
        self.attempt_hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Run one call; errors come back typed and are translated by the transport
    pub fn call(&self, method: &str, token: &AuthToken, protocol: u32, params: Value) -> Result<Value> {
        let span = info_span!("call", method, user = token.display_name());
        let _enter = span.enter();

        let result = self.dispatch(method, token, protocol, params);
        if let Err(e) = &result {
            if e.is_classified() {
                debug!("Call failed: {}", e);
            } else {
                error!("Unclassified failure: {}", e);
            }
        }
        result
    }

    fn dispatch(&self, method: &str, token: &AuthToken, protocol: u32, params: Value) -> Result<Value> {
        if let Some(message) = &self.config.closed {
            return Err(Error::RepositoryClosed(message.clone()));
        }

        let op = *self
            .registry
            .get(method)
            .ok_or_else(|| Error::MethodNotSupported(method.to_string()))?;

        if !(MIN_PROTOCOL..=MAX_PROTOCOL).contains(&protocol) {
            return Err(Error::InvalidProtocolVersion {
                requested: protocol,
                min: MIN_PROTOCOL,
                max: MAX_PROTOCOL,
            });
        }
        if protocol < op.min_protocol {
            return Err(Error::InvalidProtocolVersion {
                requested: protocol,
                min: op.min_protocol,
                max: MAX_PROTOCOL,
            });
        }

        if op.requires_write && self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let _serialized = (op.requires_write && self.config.serialize_commits).then(|| self.commit_lock.lock());

        let (value, effects) = self.run_attempts(&op, token, protocol, params)?;
        self.apply(token, effects);
        Ok(value)
    }

    fn run_attempts(&self, op: &Operation, token: &AuthToken, protocol: u32, params: Value) -> Result<(Value, Effects)> {
        let mut conn = db::open(&self.config.db_path)?;
        let behavior = if op.requires_write {
            TransactionBehavior::Immediate
        } else {
            TransactionBehavior::Deferred
        };
        let budget = self.config.deadlock_retry.max(1);

        let mut attempt = 1;
        loop {
            let scratch = Scratch::default();
            let result = db::transaction_with(&mut conn, behavior, |tx| {
                if let Some(hook) = &self.attempt_hook {
                    hook(op.name, attempt)?;
                }
                let auth = Authorizer::new(tx, token);
                let ctx = CallContext::new(tx, &auth, protocol, self, &scratch);
                let value = (op.handler)(&ctx, params.clone())?;
                Ok((value, ctx.into_effects()))
            });
            if result.is_err() {
                let removed = scratch.discard();
                if removed > 0 {
                    debug!("Removed {} scratch file(s) of failed attempt {}", removed, attempt);
                }
            }

            match result {
                Err(e) if e.is_lock_conflict() || is_nested_conflict(&e) => {
                    if attempt < budget {
                        warn!("Lock conflict on attempt {}/{}: {}", attempt, budget, e);
                        attempt += 1;
                        continue;
                    }
                    warn!("Retry budget of {} exhausted", budget);
                    return Err(if op.commit {
                        Error::CommitFailed {
                            reason: "repository locked".to_string(),
                            cause: Some(Box::new(Error::RepositoryLocked)),
                        }
                    } else {
                        Error::RepositoryLocked
                    });
                }
                other => return other,
            }
        }
    }

    /// Post-commit work; failures here never undo the call
    fn apply(&self, token: &AuthToken, effects: Effects) {
        if !effects.committed.is_empty() {
            self.notifier.notify(token.display_name(), &effects.committed);
        }
        if let Some(cache) = &self.cache {
            match cache.invalidate(&effects.invalidate) {
                Ok(0) => {}
                Ok(n) => debug!("Swept {} cached change set(s)", n),
                Err(e) => warn!("Change set cache sweep failed: {}", e),
            }
        }
        for path in effects.cleanup {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// A commit failure caused by a lock conflict is still retryable
fn is_nested_conflict(err: &Error) -> bool {
    matches!(err, Error::CommitFailed { cause: Some(cause), .. } if cause.is_lock_conflict())
}

/// Start the repository server
#[cfg(feature = "server")]
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    use std::sync::Arc;

    tracing::info!("Starting repository server on {}", config.bind_addr);
    tracing::info!("Database: {:?}", config.db_path);
    tracing::info!("Content store: {:?}", config.contents_dir);
    if config.read_only {
        tracing::info!("Read-only mode: enabled");
    }
    if config.serialize_commits {
        tracing::info!("Commit serialization: enabled");
    }

    let bind_addr = config.bind_addr;
    let server = Arc::new(RepositoryServer::open(config)?);
    let app = create_router(server);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Repository server is ready to serve");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::admin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn setup(configure: impl FnOnce(&mut ServerConfig)) -> (TempDir, RepositoryServer) {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig::rooted(dir.path());
        configure(&mut config);
        let server = RepositoryServer::open(config).unwrap();
        (dir, server)
    }

    fn admin_token(server: &RepositoryServer) -> AuthToken {
        let conn = db::open(&server.config.db_path).unwrap();
        admin::add_user(&conn, "root", "secret").unwrap();
        admin::add_role(&conn, "admins").unwrap();
        admin::update_role_members(&conn, "admins", &["root".to_string()]).unwrap();
        admin::set_role_admin(&conn, "admins", true).unwrap();
        AuthToken::user("root", "secret")
    }

    // === Dispatch tests ===

    #[test]
    fn test_unknown_method() {
        let (_dir, server) = setup(|_| {});
        let err = server
            .call("frobnicate", &AuthToken::default(), MAX_PROTOCOL, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotSupported(_)));
    }

    #[test]
    fn test_protocol_outside_range_reports_range() {
        let (_dir, server) = setup(|_| {});
        let err = server
            .call("checkVersion", &AuthToken::default(), MIN_PROTOCOL - 1, Value::Null)
            .unwrap_err();
        match err {
            Error::InvalidProtocolVersion { requested, min, max } => {
                assert_eq!(requested, MIN_PROTOCOL - 1);
                assert_eq!(min, MIN_PROTOCOL);
                assert_eq!(max, MAX_PROTOCOL);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_version_lists_range() {
        let (_dir, server) = setup(|_| {});
        let value = server
            .call("checkVersion", &AuthToken::default(), MIN_PROTOCOL, Value::Null)
            .unwrap();
        let versions: Vec<u32> = serde_json::from_value(value).unwrap();
        assert_eq!(versions, (MIN_PROTOCOL..=MAX_PROTOCOL).collect::<Vec<_>>());
    }

    #[test]
    fn test_operation_minimum_protocol() {
        let (_dir, server) = setup(|_| {});
        let err = server
            .call("getNewTroveInfo", &AuthToken::default(), MIN_PROTOCOL, Value::Null)
            .unwrap_err();
        match err {
            Error::InvalidProtocolVersion { min, .. } => assert!(min > MIN_PROTOCOL),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_read_only_rejects_writes_only() {
        let (_dir, server) = setup(|c| c.read_only = true);
        let token = AuthToken::default();
        let err = server.call("prepareChangeSet", &token, MAX_PROTOCOL, Value::Null).unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
        assert!(server.call("troveNames", &token, MAX_PROTOCOL, Value::Null).is_ok());
    }

    #[test]
    fn test_closed_rejects_everything() {
        let (_dir, server) = setup(|c| c.closed = Some("maintenance".to_string()));
        let err = server
            .call("checkVersion", &AuthToken::default(), MAX_PROTOCOL, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryClosed(ref m) if m == "maintenance"));
    }

    // === Retry tests ===

    fn failing_hook(failures: u32, attempts: Arc<AtomicU32>) -> AttemptHook {
        Box::new(move |_method, attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            if attempt <= failures {
                Err(Error::LockConflict("injected".to_string()))
            } else {
                Ok(())
            }
        })
    }

    #[test]
    fn test_lock_conflicts_are_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (_dir, server) = setup(|c| c.deadlock_retry = 3);
        let server = server.with_attempt_hook(failing_hook(2, attempts.clone()));
        let token = admin_token(&server);

        let value = server.call("addRole", &token, MAX_PROTOCOL, serde_json::json!({"role": "devs"}));
        assert!(value.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let roles = server.call("listRoles", &token, MAX_PROTOCOL, Value::Null).unwrap();
        let roles: Vec<String> = serde_json::from_value(roles).unwrap();
        assert_eq!(roles.iter().filter(|r| *r == "devs").count(), 1);
    }

    #[test]
    fn test_exhausted_budget_reports_locked() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (_dir, server) = setup(|c| c.deadlock_retry = 2);
        let server = server.with_attempt_hook(failing_hook(u32::MAX, attempts.clone()));

        let err = server
            .call("troveNames", &AuthToken::default(), MAX_PROTOCOL, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryLocked));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exhausted_commit_wraps_locked() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (_dir, server) = setup(|c| c.deadlock_retry = 2);
        let server = server.with_attempt_hook(failing_hook(u32::MAX, attempts));

        let err = server
            .call(
                "commitChangeSet",
                &AuthToken::default(),
                MAX_PROTOCOL,
                serde_json::json!({"name": "upload-x.ccs"}),
            )
            .unwrap_err();
        match err {
            Error::CommitFailed { cause: Some(cause), .. } => {
                assert!(matches!(*cause, Error::RepositoryLocked));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let (_dir, server) = setup(|_| {});
        let counter = attempts.clone();
        let server = server.with_attempt_hook(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidRequest("boom".to_string()))
        }));

        let err = server
            .call("troveNames", &AuthToken::default(), MAX_PROTOCOL, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
