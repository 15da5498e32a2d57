// src/resolver/select.rs

//! Flavor scoring and winner selection over candidate rows
//!
//! Selection never depends on the order rows come back from storage:
//! candidates are sorted into a canonical order first, then folded per group,
//! and a candidate only replaces the current winner when it is strictly
//! better. Equal candidates keep the one already selected.

use super::query::CandidateRow;
use super::{FlavorMode, LatestMode};
use crate::error::Result;
use crate::flavor::{self, Flavor};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// A candidate after flavor scoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scored {
    pub row: CandidateRow,
    /// Index of the requested flavor this score was taken against
    pub flavor_idx: Option<usize>,
    pub score: Option<i64>,
}

impl Scored {
    fn unscored(row: CandidateRow) -> Self {
        Self {
            row,
            flavor_idx: None,
            score: None,
        }
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        (&self.row.name, &self.row.version, &self.row.flavor)
            .cmp(&(&other.row.name, &other.row.version, &other.row.flavor))
            .then_with(|| self.row.spec_idx.cmp(&other.row.spec_idx))
            .then_with(|| self.flavor_idx.cmp(&other.flavor_idx))
            .then_with(|| self.row.instance_id.cmp(&other.row.instance_id))
    }
}

/// Collapse rows granted through several ACL rows into one per spec
pub fn dedupe(rows: Vec<CandidateRow>) -> Vec<CandidateRow> {
    let mut seen = BTreeSet::new();
    rows.into_iter()
        .filter(|row| seen.insert((row.spec_idx, row.instance_id)))
        .collect()
}

/// Score candidates against the requested flavors of their spec
///
/// `requested[i]` holds the flavors of spec `i`; `None` there (or
/// [`FlavorMode::AllFlavors`]) leaves the candidate unscored. Under
/// [`FlavorMode::BestFlavor`] a candidate is kept once per requested flavor
/// it is compatible with, so each requested flavor picks its own winner.
pub fn apply_flavors(
    rows: Vec<CandidateRow>,
    requested: &[Option<Vec<Flavor>>],
    mode: FlavorMode,
) -> Result<Vec<Scored>> {
    let mut scored = Vec::with_capacity(rows.len());

    for row in rows {
        let wanted = match (mode, requested.get(row.spec_idx)) {
            (FlavorMode::AllFlavors, _) | (_, None) | (_, Some(None)) => {
                scored.push(Scored::unscored(row));
                continue;
            }
            (_, Some(Some(wanted))) => wanted,
        };

        let present = Flavor::parse(&row.flavor)?;
        if mode == FlavorMode::AllowedFlavor {
            if let Some(best) = flavor::best_score(wanted, &present) {
                scored.push(Scored {
                    row,
                    flavor_idx: None,
                    score: Some(best),
                });
            }
            continue;
        }

        for (idx, req) in wanted.iter().enumerate() {
            if let Some(value) = flavor::score(req, &present) {
                scored.push(Scored {
                    row: row.clone(),
                    flavor_idx: Some(idx),
                    score: Some(value),
                });
            }
        }
    }

    Ok(scored)
}

/// Whether `candidate` strictly beats `current`
///
/// Score decides first when `by_score` is set; timestamps break score ties
/// (and decide alone otherwise).
fn better(candidate: &Scored, current: &Scored, by_score: bool) -> bool {
    if by_score {
        match candidate.score.cmp(&current.score) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    candidate.row.final_timestamp > current.row.final_timestamp
}

fn fold<K: Ord>(mut rows: Vec<Scored>, by_score: bool, key: impl Fn(&Scored) -> K) -> Vec<Scored> {
    rows.sort_by(|a, b| a.canonical_cmp(b));

    let mut winners: BTreeMap<K, Scored> = BTreeMap::new();
    for row in rows {
        let group = key(&row);
        match winners.get(&group) {
            Some(current) if !better(&row, current, by_score) => {}
            _ => {
                winners.insert(group, row);
            }
        }
    }
    winners.into_values().collect()
}

/// Group discriminator beyond (name, branch) for latest-only selection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum FlavorGroup {
    /// One winner per requested flavor
    Request(usize, usize),
    /// One winner per stored flavor
    Stored(String),
}

/// Apply the latest-only and best-flavor reductions
pub fn select(rows: Vec<Scored>, latest: LatestMode, mode: FlavorMode) -> Vec<Scored> {
    let by_score = mode == FlavorMode::BestFlavor;

    match latest {
        LatestMode::LatestOnly => fold(rows, by_score, |s| {
            let group = match s.flavor_idx {
                Some(idx) if by_score => FlavorGroup::Request(s.row.spec_idx, idx),
                _ => FlavorGroup::Stored(s.row.flavor.clone()),
            };
            (s.row.name.clone(), s.row.branch.clone(), group)
        }),
        LatestMode::AllVersions if by_score => fold(rows, true, |s| {
            (
                s.row.name.clone(),
                s.row.version.clone(),
                s.row.spec_idx,
                s.flavor_idx,
            )
        }),
        LatestMode::AllVersions => rows,
    }
}
