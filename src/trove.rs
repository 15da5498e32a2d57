// src/trove.rs

//! Trove identities as they travel between caller and server

use crate::error::Result;
use crate::flavor::Flavor;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A (name, version, flavor) triple
///
/// `version` may arrive frozen (with timestamps) or plain; use
/// [`TroveTuple::identity`] before using it as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TroveTuple {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub flavor: String,
}

impl TroveTuple {
    pub fn new(name: impl Into<String>, version: impl Into<String>, flavor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            flavor: flavor.into(),
        }
    }

    /// Canonical storage identity: plain version and canonical flavor text
    pub fn identity(&self) -> Result<TroveTuple> {
        let version = Version::parse(&self.version)?;
        let flavor = Flavor::parse(&self.flavor)?;
        Ok(TroveTuple {
            name: self.name.clone(),
            version: version.as_string(),
            flavor: flavor.to_string(),
        })
    }

    pub fn parsed_version(&self) -> Result<Version> {
        Version::parse(&self.version)
    }
}

impl fmt::Display for TroveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.version)?;
        if !self.flavor.is_empty() {
            write!(f, "{}", self.flavor)?;
        }
        Ok(())
    }
}
