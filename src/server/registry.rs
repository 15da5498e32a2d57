// src/server/registry.rs
//! Operation registry
//!
//! Every callable operation is registered by name together with its
//! dispatch metadata. The table is built once at startup and validated
//! against the advertised protocol range.

use crate::error::{Error, Result};
use crate::server::context::CallContext;
use crate::server::handlers::{admin, changeset, commit, mirror, query};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lowest protocol version this server speaks
pub const MIN_PROTOCOL: u32 = 36;

/// Highest protocol version this server speaks
pub const MAX_PROTOCOL: u32 = 40;

/// Signature shared by every operation handler
pub type Handler = fn(&CallContext<'_>, Value) -> Result<Value>;

/// One registered operation
#[derive(Clone, Copy)]
pub struct Operation {
    pub name: &'static str,
    pub handler: Handler,
    /// Rejected in read-only mode; runs in an immediate transaction
    pub requires_write: bool,
    pub min_protocol: u32,
    /// Exhausting the retry budget reports `CommitFailed` instead of
    /// `RepositoryLocked`
    pub commit: bool,
}

impl Operation {
    pub const fn read(name: &'static str, handler: Handler) -> Self {
        Self {
            name,
            handler,
            requires_write: false,
            min_protocol: MIN_PROTOCOL,
            commit: false,
        }
    }

    pub const fn write(name: &'static str, handler: Handler) -> Self {
        Self {
            name,
            handler,
            requires_write: true,
            min_protocol: MIN_PROTOCOL,
            commit: false,
        }
    }

    pub const fn since(mut self, protocol: u32) -> Self {
        self.min_protocol = protocol;
        self
    }

    pub const fn committing(mut self) -> Self {
        self.commit = true;
        self
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("requires_write", &self.requires_write)
            .field("min_protocol", &self.min_protocol)
            .field("commit", &self.commit)
            .finish()
    }
}

/// Name-to-operation table
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<&'static str, Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every operation this server implements
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for operations in [
            query::operations(),
            changeset::operations(),
            commit::operations(),
            mirror::operations(),
            admin::operations(),
        ] {
            for op in operations {
                registry.register(op);
            }
        }
        registry
    }

    /// Add an operation, replacing any previous one of the same name
    pub fn register(&mut self, op: Operation) {
        self.operations.insert(op.name, op);
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Operations in name order
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Check that every operation is reachable from the advertised range
    pub fn validate(&self) -> Result<()> {
        for op in self.iter() {
            if !(MIN_PROTOCOL..=MAX_PROTOCOL).contains(&op.min_protocol) {
                return Err(Error::Config(format!(
                    "operation {} requires protocol {} outside {}..={}",
                    op.name, op.min_protocol, MIN_PROTOCOL, MAX_PROTOCOL
                )));
            }
        }
        Ok(())
    }
}
