// src/filesystem/mod.rs

//! Filesystem collaborators of the repository server
//!
//! File contents live in a content-addressed blob store keyed by their
//! SHA-256 digest, like git's object storage.

mod cas;

pub use cas::ContentStore;
