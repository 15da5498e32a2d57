// src/flavor/mod.rs
//! Flavor parsing and compatibility scoring
//!
//! Flavors describe build-time variations of a trove. Syntax follows Conary:
//! `[ssl, !debug, ~vmware, ~!xen, is: x86 x86_64]`.
//!
//! For scoring, a flavor is decomposed into `(class, flag, sense)` triples.
//! Use flags land in the `use` class, architectures in the `is` class, and
//! every flavor (including the empty one) carries one implicit baseline
//! triple. The empty flavor is therefore a real value that scores, not a
//! wildcard.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Contribution of an incompatible pairing; totals at or below this are excluded
pub const INCOMPATIBLE: i64 = -500_000;

/// Flavor operators from Conary syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlavorOp {
    /// Required: built for systems with this feature (no prefix)
    Required,
    /// Not: built for systems WITHOUT this feature (! prefix)
    Not,
    /// Prefers: soft preference for the feature (~ prefix)
    Prefers,
    /// PrefersNot: soft preference against the feature (~! prefix)
    PrefersNot,
}

impl FlavorOp {
    /// Get the string prefix for this operator
    pub fn as_prefix(&self) -> &'static str {
        match self {
            Self::Required => "",
            Self::Not => "!",
            Self::Prefers => "~",
            Self::PrefersNot => "~!",
        }
    }

    /// Parse an operator and name from a string
    pub fn parse_with_name(s: &str) -> Result<(Self, &str)> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("Empty flavor item".to_string()));
        }

        // Longer prefixes first
        let (op, rest) = if let Some(rest) = s.strip_prefix("~!") {
            (Self::PrefersNot, rest)
        } else if let Some(rest) = s.strip_prefix('~') {
            (Self::Prefers, rest)
        } else if let Some(rest) = s.strip_prefix('!') {
            (Self::Not, rest)
        } else {
            (Self::Required, s)
        };

        let name = rest.trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!(
                "Missing name after '{}' operator",
                op.as_prefix()
            )));
        }
        if name.contains(|c: char| c.is_whitespace() || "[],".contains(c)) {
            return Err(Error::ParseError(format!("Invalid flavor flag: {}", name)));
        }

        Ok((op, name))
    }

    fn sense(self) -> Sense {
        match self {
            Self::Required => Sense::Required,
            Self::Not => Sense::Disallowed,
            Self::Prefers => Sense::Preferred,
            Self::PrefersNot => Sense::PreferNot,
        }
    }
}

/// A single flavor item with operator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlavorItem {
    pub name: String,
    pub op: FlavorOp,
}

impl FlavorItem {
    pub fn new(op: FlavorOp, name: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
        }
    }

    /// Parse a flavor item like "ssl", "!debug", "~vmware", "~!xen"
    pub fn parse(s: &str) -> Result<Self> {
        let (op, name) = FlavorOp::parse_with_name(s)?;
        Ok(Self::new(op, name))
    }
}

impl fmt::Display for FlavorItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_prefix(), self.name)
    }
}

/// A complete flavor like `[ssl, !debug, is: x86_64]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Flavor {
    pub items: Vec<FlavorItem>,
    pub arch: Vec<String>,
}

impl Flavor {
    /// The empty flavor
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(items: Vec<FlavorItem>, arch: Vec<String>) -> Self {
        let mut flavor = Self { items, arch };
        flavor.canonicalize();
        flavor
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.arch.is_empty()
    }

    /// Sort and dedupe so equal flavors always render (and store) identically
    ///
    /// When one flag appears with several operators the strongest one
    /// (Required, then Not, then the soft preferences) is kept.
    pub fn canonicalize(&mut self) {
        self.items.sort();
        self.items.dedup_by(|b, a| a.name == b.name);
        self.arch.sort();
        self.arch.dedup();
    }

    /// Parse a flavor string
    ///
    /// Accepts `[ssl, !debug, is: x86_64]`, the unbracketed form, `[]` and `""`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        let inner = if s.starts_with('[') && s.ends_with(']') {
            &s[1..s.len() - 1]
        } else {
            s
        };

        let mut items = Vec::new();
        let mut arch = Vec::new();

        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some(arch_str) = part.strip_prefix("is:") {
                let architectures: Vec<String> =
                    arch_str.split_whitespace().map(str::to_string).collect();
                if architectures.is_empty() {
                    return Err(Error::ParseError(
                        "Empty architecture specification after 'is:'".to_string(),
                    ));
                }
                arch.extend(architectures);
            } else {
                items.push(FlavorItem::parse(part)?);
            }
        }

        Ok(Self::new(items, arch))
    }

    /// Decompose into `(class, flag) -> sense`
    ///
    /// Keys are ordered, so every consumer sees the same enumeration.
    pub fn triples(&self) -> BTreeMap<(FlagClass, String), Sense> {
        let mut triples = BTreeMap::new();
        triples.insert((FlagClass::Baseline, String::new()), Sense::Required);

        for item in &self.items {
            triples
                .entry((FlagClass::Use, item.name.clone()))
                .or_insert(item.op.sense());
        }
        for arch in &self.arch {
            triples.insert((FlagClass::Arch, arch.clone()), Sense::Required);
        }
        triples
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }

        let mut parts: Vec<String> = self.items.iter().map(|item| item.to_string()).collect();
        if !self.arch.is_empty() {
            parts.push(format!("is: {}", self.arch.join(" ")));
        }

        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromStr for Flavor {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flavor::parse(s)
    }
}

/// Class a flag belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagClass {
    /// The implicit dependency every flavor carries
    Baseline,
    Use,
    Arch,
}

/// Sense of a flag within a flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sense {
    Required,
    Preferred,
    PreferNot,
    Disallowed,
}

/// Score of a single flag, keyed by (sense in present, sense in requested)
///
/// `None` is a flag the flavor doesn't mention.
fn contribution(present: Option<Sense>, requested: Option<Sense>) -> i64 {
    use Sense::*;
    match (present, requested) {
        (Some(Required), None) => INCOMPATIBLE,
        (Some(Disallowed), None) => 0,
        (Some(Preferred), None) => -1,
        (Some(PreferNot), None) => 1,

        (Some(Required), Some(Required)) => 2,
        (Some(Disallowed), Some(Required)) => INCOMPATIBLE,
        (Some(Preferred), Some(Required)) => 1,
        (Some(PreferNot), Some(Required)) => INCOMPATIBLE,

        (Some(Required), Some(Disallowed)) => INCOMPATIBLE,
        (Some(Disallowed), Some(Disallowed)) => 2,
        (Some(Preferred), Some(Disallowed)) => INCOMPATIBLE,
        (Some(PreferNot), Some(Disallowed)) => 1,

        (Some(Required), Some(Preferred)) => 1,
        (Some(Disallowed), Some(Preferred)) => -1,
        (Some(Preferred), Some(Preferred)) => 2,
        (Some(PreferNot), Some(Preferred)) => -1,

        (Some(Required), Some(PreferNot)) => -1,
        (Some(Disallowed), Some(PreferNot)) => 1,
        (Some(Preferred), Some(PreferNot)) => -1,
        (Some(PreferNot), Some(PreferNot)) => 2,

        (None, _) => 0,
    }
}

/// Raw compatibility score of `present` against `requested`
///
/// Walks the union of both flavors' flags in key order. Any incompatible
/// pairing makes the total the sum of the penalties alone, so it is always
/// at or below [`INCOMPATIBLE`].
pub fn raw_score(requested: &Flavor, present: &Flavor) -> i64 {
    let requested = requested.triples();
    let present = present.triples();

    let mut keys: Vec<&(FlagClass, String)> = requested.keys().chain(present.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut total = 0i64;
    let mut penalty = 0i64;
    for key in keys {
        let value = contribution(present.get(key).copied(), requested.get(key).copied());
        if value <= INCOMPATIBLE {
            penalty += value;
        } else {
            total += value;
        }
    }

    if penalty < 0 { penalty } else { total }
}

/// Score `present` against `requested`; `None` means incompatible
pub fn score(requested: &Flavor, present: &Flavor) -> Option<i64> {
    let value = raw_score(requested, present);
    (value > INCOMPATIBLE).then_some(value)
}

/// Best score of `present` against any of the requested flavors
pub fn best_score<'a>(
    requested: impl IntoIterator<Item = &'a Flavor>,
    present: &Flavor,
) -> Option<i64> {
    requested.into_iter().filter_map(|r| score(r, present)).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flavor(s: &str) -> Flavor {
        Flavor::parse(s).unwrap()
    }

    // === Parsing tests ===

    #[test]
    fn test_flavor_op_parse() {
        assert_eq!(FlavorOp::parse_with_name("ssl").unwrap(), (FlavorOp::Required, "ssl"));
        assert_eq!(FlavorOp::parse_with_name("!debug").unwrap(), (FlavorOp::Not, "debug"));
        assert_eq!(FlavorOp::parse_with_name("~vmware").unwrap(), (FlavorOp::Prefers, "vmware"));
        assert_eq!(FlavorOp::parse_with_name("  ~! xen ").unwrap(), (FlavorOp::PrefersNot, "xen"));
    }

    #[test]
    fn test_flavor_op_parse_errors() {
        assert!(FlavorOp::parse_with_name("").is_err());
        assert!(FlavorOp::parse_with_name("!").is_err());
        assert!(FlavorOp::parse_with_name("~!").is_err());
        assert!(FlavorOp::parse_with_name("two words").is_err());
    }

    #[test]
    fn test_flavor_parse_empty() {
        assert!(flavor("").is_empty());
        assert!(flavor("[]").is_empty());
        assert_eq!(flavor("[]").to_string(), "");
    }

    #[test]
    fn test_flavor_parse_canonical() {
        let f = flavor("[ssl, !debug, ~vmware, is: x86_64 x86]");
        assert_eq!(f.to_string(), "[!debug, ssl, ~vmware, is: x86 x86_64]");
        assert_eq!(flavor(&f.to_string()), f);
    }

    #[test]
    fn test_flavor_parse_empty_arch_error() {
        assert!(Flavor::parse("[ssl, is:]").is_err());
    }

    #[test]
    fn test_conflicting_flags_keep_strongest() {
        let a = flavor("[ssl, !ssl]");
        let b = flavor("[!ssl, ssl]");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "[ssl]");
    }

    #[test]
    fn test_empty_flavor_has_baseline_triple() {
        let triples = Flavor::empty().triples();
        assert_eq!(triples.len(), 1);
        assert_eq!(
            triples.get(&(FlagClass::Baseline, String::new())),
            Some(&Sense::Required)
        );
    }

    // === Scoring tests ===

    #[test]
    fn test_empty_against_empty_scores() {
        assert_eq!(score(&Flavor::empty(), &Flavor::empty()), Some(2));
    }

    #[test]
    fn test_required_flag_missing_from_request_is_incompatible() {
        assert_eq!(score(&Flavor::empty(), &flavor("[ssl]")), None);
        assert_eq!(score(&flavor("[is: x86_64]"), &flavor("[is: x86]")), None);
    }

    #[test]
    fn test_disallowed_mismatch_is_incompatible() {
        assert_eq!(score(&flavor("[!ssl]"), &flavor("[ssl]")), None);
        assert_eq!(score(&flavor("[ssl]"), &flavor("[!ssl]")), None);
        assert!(raw_score(&flavor("[ssl, ~a, ~b]"), &flavor("[!ssl, ~a, ~b]")) <= INCOMPATIBLE);
    }

    #[test]
    fn test_exact_match_beats_preference() {
        let request = flavor("[ssl, is: x86_64]");
        let exact = score(&request, &flavor("[ssl, is: x86_64]")).unwrap();
        let prefers = score(&request, &flavor("[~ssl, is: x86_64]")).unwrap();
        let plain = score(&request, &flavor("[is: x86_64]")).unwrap();
        assert!(exact > prefers);
        assert!(prefers > plain);
    }

    #[test]
    fn test_multilib_request_accepts_either_arch() {
        let request = flavor("[is: x86 x86_64]");
        assert!(score(&request, &flavor("[is: x86]")).is_some());
        assert!(score(&request, &flavor("[is: x86_64]")).is_some());
        assert!(score(&request, &flavor("[is: aarch64]")).is_none());
    }

    #[test]
    fn test_best_score_over_requests() {
        let requests = [flavor("[!ssl]"), flavor("[ssl]")];
        assert_eq!(best_score(&requests, &flavor("[ssl]")), Some(4));
        assert_eq!(best_score(&requests[..1], &flavor("[ssl]")), None);
    }

    fn arb_item() -> impl Strategy<Value = FlavorItem> {
        let op = prop_oneof![
            Just(FlavorOp::Required),
            Just(FlavorOp::Not),
            Just(FlavorOp::Prefers),
            Just(FlavorOp::PrefersNot),
        ];
        (op, "[a-e]").prop_map(|(op, name)| FlavorItem::new(op, name))
    }

    fn arb_arch() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(prop_oneof![Just("x86".to_string()), Just("x86_64".to_string())], 0..2)
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn prop_score_is_order_independent(
            req in prop::collection::vec(arb_item(), 0..6),
            present in prop::collection::vec(arb_item(), 0..6),
            req_arch in arb_arch(),
            present_arch in arb_arch(),
        ) {
            let mut req_rev = req.clone();
            req_rev.reverse();
            let mut present_rev = present.clone();
            present_rev.reverse();

            let forward = raw_score(
                &Flavor::new(req, req_arch.clone()),
                &Flavor::new(present, present_arch.clone()),
            );
            let backward = raw_score(
                &Flavor::new(req_rev, req_arch),
                &Flavor::new(present_rev, present_arch),
            );
            prop_assert_eq!(forward, backward);
        }

        #[test]
        fn prop_required_disallowed_mismatch_is_incompatible(
            req in prop::collection::vec(arb_item(), 0..6),
            present in prop::collection::vec(arb_item(), 0..6),
        ) {
            let mut req = req;
            let mut present = present;
            req.retain(|i| i.name != "zz");
            present.retain(|i| i.name != "zz");
            req.push(FlavorItem::new(FlavorOp::Not, "zz"));
            present.push(FlavorItem::new(FlavorOp::Required, "zz"));

            let value = raw_score(&Flavor::new(req, vec![]), &Flavor::new(present, vec![]));
            prop_assert!(value <= INCOMPATIBLE);
        }
    }
}
