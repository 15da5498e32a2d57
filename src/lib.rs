// src/lib.rs

//! Conary Repository Server
//!
//! Server side of a Conary package repository: stores troves, answers
//! permission-scoped queries, builds change sets and feeds mirrors.
//!
//! # Architecture
//!
//! - Database-first: all repository state in SQLite, one transaction per call
//! - Troves: (name, version, flavor) artifacts addressed by label and branch
//! - Flavors: scored for compatibility when resolving requests
//! - Change sets: cached by a fingerprint of everything they embed
//! - Mirrors: pull-based replication keyed by a monotonic mark

pub mod auth;
pub mod changeset;
pub mod commit;
pub mod db;
mod error;
pub mod filesystem;
pub mod flavor;
pub mod hash;
pub mod label;
pub mod mirror;
pub mod resolver;
pub mod server;
pub mod trove;
pub mod version;

pub use auth::{Access, AuthToken, Authorizer};
pub use changeset::{ChangeSet, Job, JobFlags};
pub use error::{Error, Fault, Result};
pub use flavor::Flavor;
pub use label::{Branch, Label};
pub use server::{RepositoryServer, ServerConfig};
pub use trove::TroveTuple;
pub use version::Version;
