// src/version/mod.rs

//! Trove versions
//!
//! A version is a branch plus a revision (`upstream-sourcecount-buildcount`),
//! for example `/conary.example.com@rpl:devel/1.2.3-1-2`. Each version also
//! carries the commit timestamps of its nodes. Timestamps are a freshness
//! signal only: two versions with the same branch and revision are the same
//! version no matter when they were committed.
//!
//! The "frozen" form embeds the timestamps so they survive a round trip
//! through a client: `/conary.example.com@rpl:devel/1700000000.000:1.2.3-1-2`.

use crate::error::{Error, Result};
use crate::label::Branch;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Revision of a trove on its branch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub upstream: String,
    pub source_count: String,
    /// Absent for source troves
    pub build_count: Option<String>,
}

impl Revision {
    /// Parse `upstream-source[-build]`
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        let (upstream, source_count, build_count) = match parts.as_slice() {
            [upstream, source] => (*upstream, *source, None),
            [upstream, source, build] => (*upstream, *source, Some(*build)),
            _ => {
                return Err(Error::ParseError(format!(
                    "Revision must be upstream-source[-build]: {}",
                    s
                )));
            }
        };

        if upstream.is_empty() || upstream.contains(['/', ':']) {
            return Err(Error::ParseError(format!("Invalid upstream version in '{}'", s)));
        }
        for count in std::iter::once(source_count).chain(build_count) {
            if count.is_empty() || !count.split('.').all(|n| n.parse::<u32>().is_ok()) {
                return Err(Error::ParseError(format!("Invalid release count in '{}'", s)));
            }
        }

        Ok(Self {
            upstream: upstream.to_string(),
            source_count: source_count.to_string(),
            build_count: build_count.map(str::to_string),
        })
    }

    /// Convert the upstream part to a semver::Version for comparison
    ///
    /// Upstream versions are rarely semver-compliant, so missing or
    /// non-numeric components are normalized to zero.
    fn upstream_semver(&self) -> semver::Version {
        if let Ok(v) = semver::Version::parse(&self.upstream) {
            return v;
        }

        let parts: Vec<&str> = self.upstream.split('.').collect();
        let major = parts.first().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let minor = parts.get(1).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        let patch = parts.get(2).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

        semver::Version::new(major, minor, patch)
    }

    /// Compare two revisions
    pub fn compare(&self, other: &Revision) -> Ordering {
        match self.upstream_semver().cmp(&other.upstream_semver()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Fall back to string comparison when normalization loses information
        match self.upstream.cmp(&other.upstream) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match compare_counts(&self.source_count, &other.source_count) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match (&self.build_count, &other.build_count) {
            (Some(a), Some(b)) => compare_counts(a, b),
            (a, b) => a.is_some().cmp(&b.is_some()),
        }
    }
}

/// Compare dotted release counts numerically (`1.2` < `1.10`)
fn compare_counts(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u32> { s.split('.').filter_map(|n| n.parse().ok()).collect() };
    parse(a).cmp(&parse(b))
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.upstream, self.source_count)?;
        if let Some(ref build) = self.build_count {
            write!(f, "-{}", build)?;
        }
        Ok(())
    }
}

/// A full trove version
#[derive(Debug, Clone)]
pub struct Version {
    pub branch: Branch,
    pub revision: Revision,
    /// Commit timestamps in milliseconds since the epoch, one per node
    pub timestamps: Vec<i64>,
}

impl Version {
    pub fn new(branch: Branch, revision: Revision) -> Self {
        Self {
            branch,
            revision,
            timestamps: Vec::new(),
        }
    }

    /// Parse either the plain form or the frozen form
    pub fn parse(s: &str) -> Result<Self> {
        let slash = s
            .rfind('/')
            .filter(|&pos| pos > 0)
            .ok_or_else(|| Error::ParseError(format!("Version has no branch: {}", s)))?;

        let branch = Branch::parse(&s[..slash])?;
        let tail = &s[slash + 1..];

        let (timestamps, revision) = match tail.split_once(':') {
            Some((stamps, rev)) => (parse_timestamps(stamps)?, rev),
            None => (Vec::new(), tail),
        };

        Ok(Self {
            branch,
            revision: Revision::parse(revision)?,
            timestamps,
        })
    }

    /// Rebuild a version from its stored plain text and timestamp column
    pub fn from_stored(plain: &str, timestamps: &str) -> Result<Self> {
        let parsed = Self::parse(plain)?;
        if timestamps.is_empty() {
            return Ok(parsed);
        }
        Ok(parsed.with_timestamps(parse_timestamps(timestamps)?))
    }

    pub fn with_timestamps(mut self, timestamps: Vec<i64>) -> Self {
        self.timestamps = timestamps;
        self
    }

    /// Final commit timestamp, used for freshness tie-breaks
    pub fn final_timestamp(&self) -> i64 {
        self.timestamps.iter().copied().max().unwrap_or(0)
    }

    /// Plain form without timestamps; this is the identity used in storage
    pub fn as_string(&self) -> String {
        format!("{}/{}", self.branch, self.revision)
    }

    /// Frozen form carrying the timestamps
    pub fn freeze(&self) -> String {
        if self.timestamps.is_empty() {
            return self.as_string();
        }
        let stamps: Vec<String> = self.timestamps.iter().map(|t| format_timestamp(*t)).collect();
        format!("{}/{}:{}", self.branch, stamps.join(","), self.revision)
    }

    /// Compare by branch ancestry and revision, timestamps only as a tie-break
    ///
    /// Returns `None` for versions on unrelated branches.
    pub fn compare(&self, other: &Version) -> Option<Ordering> {
        if self.branch == other.branch {
            let ord = self
                .revision
                .compare(&other.revision)
                .then_with(|| self.final_timestamp().cmp(&other.final_timestamp()));
            return Some(ord);
        }

        if self.branch.is_ancestor_of(&other.branch) {
            Some(Ordering::Less)
        } else if other.branch.is_ancestor_of(&self.branch) {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.branch == other.branch && self.revision == other.revision
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.revision.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.revision)
    }
}

/// Render milliseconds as `seconds.millis`
pub fn format_timestamp(millis: i64) -> String {
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

/// Parse a comma-separated list of `seconds[.fraction]` timestamps
pub fn parse_timestamps(s: &str) -> Result<Vec<i64>> {
    s.split(',')
        .map(|stamp| {
            let seconds: f64 = stamp
                .trim()
                .parse()
                .map_err(|_| Error::ParseError(format!("Invalid timestamp: {}", stamp)))?;
            Ok((seconds * 1000.0).round() as i64)
        })
        .collect()
}

/// Store timestamps as the comma-separated text kept in the instances table
pub fn timestamps_to_column(timestamps: &[i64]) -> String {
    timestamps
        .iter()
        .map(|t| format_timestamp(*t))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_parse() {
        let rev = Revision::parse("1.2.3-1-2").unwrap();
        assert_eq!(rev.upstream, "1.2.3");
        assert_eq!(rev.source_count, "1");
        assert_eq!(rev.build_count.as_deref(), Some("2"));

        let source = Revision::parse("1.0-3").unwrap();
        assert!(source.build_count.is_none());
        assert_eq!(source.to_string(), "1.0-3");
    }

    #[test]
    fn test_revision_parse_errors() {
        assert!(Revision::parse("1.0").is_err());
        assert!(Revision::parse("1.0-a-1").is_err());
        assert!(Revision::parse("-1-1").is_err());
        assert!(Revision::parse("1.0-1-1-1").is_err());
    }

    #[test]
    fn test_revision_compare() {
        let a = Revision::parse("1.2.3-1-1").unwrap();
        let b = Revision::parse("1.10.0-1-1").unwrap();
        assert_eq!(a.compare(&b), Ordering::Less);

        let c = Revision::parse("1.2.3-1-2").unwrap();
        assert_eq!(a.compare(&c), Ordering::Less);

        let d = Revision::parse("1.2.3-1.10-1").unwrap();
        let e = Revision::parse("1.2.3-1.2-1").unwrap();
        assert_eq!(d.compare(&e), Ordering::Greater);
    }

    #[test]
    fn test_version_parse_plain() {
        let v = Version::parse("/conary.example.com@rpl:devel/1.0-1-1").unwrap();
        assert_eq!(v.branch.to_string(), "/conary.example.com@rpl:devel");
        assert_eq!(v.revision.to_string(), "1.0-1-1");
        assert!(v.timestamps.is_empty());
        assert_eq!(v.as_string(), "/conary.example.com@rpl:devel/1.0-1-1");
    }

    #[test]
    fn test_version_freeze_thaw() {
        let v = Version::parse("/a.com@rpl:devel/1.0-1-1")
            .unwrap()
            .with_timestamps(vec![1_700_000_000_250]);
        let frozen = v.freeze();
        assert_eq!(frozen, "/a.com@rpl:devel/1700000000.250:1.0-1-1");

        let thawed = Version::parse(&frozen).unwrap();
        assert_eq!(thawed.timestamps, vec![1_700_000_000_250]);
        assert_eq!(thawed, v);
    }

    #[test]
    fn test_version_shadow_branch() {
        let v = Version::parse("/a.com@rpl:devel//b.com@corp:stable/2.0-1.1-1").unwrap();
        assert_eq!(v.branch.labels().len(), 2);
        assert_eq!(v.branch.label().host(), "b.com");
    }

    #[test]
    fn test_timestamp_is_not_identity() {
        let a = Version::parse("/a.com@rpl:devel/1.0-1-1").unwrap().with_timestamps(vec![1000]);
        let b = Version::parse("/a.com@rpl:devel/1.0-1-1").unwrap().with_timestamps(vec![2000]);
        assert_eq!(a, b);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
    }

    #[test]
    fn test_compare_unrelated_branches() {
        let a = Version::parse("/a.com@rpl:devel/1.0-1-1").unwrap();
        let b = Version::parse("/b.com@rpl:devel/1.0-1-1").unwrap();
        assert_eq!(a.compare(&b), None);

        let shadow = Version::parse("/a.com@rpl:devel//b.com@x:y/1.0-1.1-1").unwrap();
        assert_eq!(a.compare(&shadow), Some(Ordering::Less));
    }

    #[test]
    fn test_timestamp_column_roundtrip() {
        let column = timestamps_to_column(&[1000, 2500]);
        assert_eq!(column, "1.000,2.500");
        assert_eq!(parse_timestamps(&column).unwrap(), vec![1000, 2500]);
    }
}
