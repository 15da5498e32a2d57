// src/resolver/mod.rs

//! Permission-scoped trove resolution
//!
//! The resolver answers "which (name, version, flavor) exist and are visible
//! to this caller". Resolution runs in three stages:
//!
//! 1. one candidate query narrows rows by name, version key and the
//!    caller's label scopes together ([`query`])
//! 2. ACL name patterns and requested flavors are checked on the candidates
//! 3. latest-only and best-flavor reductions pick winners ([`select`])
//!
//! Invisible troves are indistinguishable from absent ones: they simply do
//! not appear in the result.

pub mod query;
pub mod select;

pub use query::VersionMatch;

use crate::auth::{Access, Authorizer};
use crate::db::models::{Instance, TroveState};
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::label::{Branch, Label};
use crate::trove::TroveTuple;
use crate::version::Version;
use query::{CandidateQuery, PermissionJoin, StagedSpec, StagingRelation, VersionFilter};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Whether every matching version is returned or only the newest per branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LatestMode {
    #[default]
    AllVersions,
    LatestOnly,
}

/// How requested flavors constrain the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlavorMode {
    /// Requested flavors are ignored
    #[default]
    AllFlavors,
    /// Only the best-scoring compatible flavor survives
    BestFlavor,
    /// Every compatible flavor survives
    AllowedFlavor,
}

/// One entry of a resolution filter
///
/// `None` at any level means unconstrained. `flavors: Some(vec![])` asks for
/// nothing and matches nothing; `Some(vec![Flavor::empty()])` asks for the
/// empty flavor, which scores like any other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TroveSpec {
    pub name: Option<String>,
    pub version: Option<String>,
    pub flavors: Option<Vec<Flavor>>,
}

impl TroveSpec {
    /// Every trove
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_flavors(mut self, flavors: Vec<Flavor>) -> Self {
        self.flavors = Some(flavors);
        self
    }
}

/// Resolution parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TroveQuery {
    pub version_match: VersionMatch,
    pub latest: LatestMode,
    pub flavor_mode: FlavorMode,
    /// Return flavors alongside versions
    pub with_flavors: bool,
}

impl TroveQuery {
    pub fn new(version_match: VersionMatch, latest: LatestMode, flavor_mode: FlavorMode) -> Self {
        Self {
            version_match,
            latest,
            flavor_mode,
            with_flavors: true,
        }
    }

    pub fn versions_only(mut self) -> Self {
        self.with_flavors = false;
        self
    }
}

/// name -> frozen version -> flavors
///
/// The flavor set is empty when the query did not ask for flavors.
pub type TroveMap = BTreeMap<String, BTreeMap<String, BTreeSet<String>>>;

/// Per-call resolver over the caller's visible troves
pub struct Resolver<'c, 'a> {
    conn: &'c Connection,
    auth: &'c Authorizer<'a>,
}

impl<'c, 'a> Resolver<'c, 'a> {
    pub fn new(conn: &'c Connection, auth: &'c Authorizer<'a>) -> Self {
        Self { conn, auth }
    }

    /// Canonical version key for a match mode
    fn version_key(mode: VersionMatch, key: Option<&str>) -> Result<Option<String>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let normalized = match mode {
            VersionMatch::None => return Ok(None),
            VersionMatch::Label => Label::parse(key)?.to_string(),
            VersionMatch::Branch => Branch::parse(key)?.to_string(),
            VersionMatch::Version => Version::parse(key)?.as_string(),
        };
        Ok(Some(normalized))
    }

    pub fn resolve(&self, query: &TroveQuery, specs: &[TroveSpec]) -> Result<TroveMap> {
        let roles = self.auth.auth_roles()?;
        if roles.is_empty() || specs.is_empty() {
            return Ok(TroveMap::new());
        }

        let mut staged = Vec::with_capacity(specs.len());
        let mut requested = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            staged.push(StagedSpec {
                idx,
                name: spec.name.clone(),
                version_key: Self::version_key(query.version_match, spec.version.as_deref())?,
            });
            requested.push(spec.flavors.clone());
        }

        let candidates = CandidateQuery {
            staging: StagingRelation::new(staged),
            version: VersionFilter(query.version_match),
            permissions: PermissionJoin { roles: &roles },
            states: &["normal"],
        }
        .fetch(self.conn)?;
        let fetched = candidates.len();

        let visible: Vec<_> = candidates
            .into_iter()
            .filter(|row| self.auth.check_trove(&row.pattern, &row.name))
            .collect();
        let visible = select::dedupe(visible);

        let scored = select::apply_flavors(visible, &requested, query.flavor_mode)?;
        let winners = select::select(scored, query.latest, query.flavor_mode);
        debug!(
            "Resolved {} candidate row(s) to {} trove(s)",
            fetched,
            winners.len()
        );

        let mut result = TroveMap::new();
        for winner in winners {
            let row = winner.row;
            let frozen = Version::from_stored(&row.version, &row.timestamps)?.freeze();
            let flavors = result.entry(row.name).or_default().entry(frozen).or_default();
            if query.with_flavors {
                flavors.insert(row.flavor);
            }
        }
        Ok(result)
    }

    /// Names of visible troves, optionally limited to one label
    pub fn trove_names(&self, label: Option<&str>) -> Result<BTreeSet<String>> {
        let mut spec = TroveSpec::all();
        spec.version = label.map(str::to_string);
        let query = TroveQuery::new(VersionMatch::Label, LatestMode::AllVersions, FlavorMode::AllFlavors)
            .versions_only();
        Ok(self.resolve(&query, &[spec])?.into_keys().collect())
    }

    /// Newest visible version of `name` on `branch`, by final timestamp
    pub fn latest_version(&self, name: &str, branch: &str) -> Result<Option<String>> {
        let query = TroveQuery::new(VersionMatch::Branch, LatestMode::LatestOnly, FlavorMode::AllFlavors)
            .versions_only();
        let spec = TroveSpec::named(name).with_version(branch);
        let found = self.resolve(&query, &[spec])?;

        let mut best: Option<(i64, String)> = None;
        for version in found.into_values().flat_map(|versions| versions.into_keys()) {
            let stamp = Version::parse(&version)?.final_timestamp();
            if best.as_ref().is_none_or(|(current, _)| stamp > *current) {
                best = Some((stamp, version));
            }
        }
        Ok(best.map(|(_, version)| version))
    }

    /// Visibility of exact troves; forbidden and absent both read as `false`
    pub fn has_troves(&self, troves: &[TroveTuple]) -> Result<Vec<bool>> {
        let mut results = Vec::with_capacity(troves.len());
        for trove in troves {
            results.push(self.find_visible(trove)?.is_some());
        }
        Ok(results)
    }

    /// Look up a trove the caller may read
    ///
    /// Returns `Ok(None)` when the trove is absent, not published or not
    /// visible to the caller, without saying which.
    pub fn find_visible(&self, trove: &TroveTuple) -> Result<Option<Instance>> {
        let Ok(identity) = trove.identity() else {
            return Ok(None);
        };
        let Some(instance) = Instance::find(self.conn, &identity)? else {
            return Ok(None);
        };
        if instance.state != TroveState::Normal {
            return Ok(None);
        }
        let granted = self.auth.batch_check(std::slice::from_ref(&identity), Access::Read)?;
        if !granted.into_iter().all(|ok| ok) {
            return Ok(None);
        }
        Ok(Some(instance))
    }

    /// Like [`Resolver::find_visible`], failing with `ArtifactMissing`
    pub fn require_visible(&self, trove: &TroveTuple) -> Result<Instance> {
        self.find_visible(trove)?
            .ok_or_else(|| Error::missing(&trove.name, Some(trove.version.clone())))
    }
}
