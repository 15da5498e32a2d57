// src/auth/pattern.rs

//! Trove-name patterns used in ACL rows

use crate::db::models::ANY_TROVE;
use crate::error::{Error, Result};
use glob::Pattern;
use std::cell::RefCell;
use std::collections::HashMap;

/// Reject patterns that would never compile
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern == ANY_TROVE {
        return Ok(());
    }
    if pattern.is_empty() {
        return Err(Error::InvalidPattern("empty pattern".to_string()));
    }
    Pattern::new(pattern).map_err(|e| Error::InvalidPattern(format!("{pattern}: {e}")))?;
    Ok(())
}

/// Memoizing glob matcher
///
/// The same few patterns are tested against many candidate names during one
/// call, so both the compiled patterns and the individual answers are kept.
/// A pattern that fails to compile (a row written before validation)
/// matches nothing.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: RefCell<HashMap<String, Option<Pattern>>>,
    answers: RefCell<HashMap<(String, String), bool>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, pattern: &str, name: &str) -> bool {
        if pattern == ANY_TROVE {
            return true;
        }

        let key = (pattern.to_string(), name.to_string());
        if let Some(answer) = self.answers.borrow().get(&key) {
            return *answer;
        }

        let answer = self
            .compiled
            .borrow_mut()
            .entry(pattern.to_string())
            .or_insert_with(|| Pattern::new(pattern).ok())
            .as_ref()
            .is_some_and(|compiled| compiled.matches(name));

        self.answers.borrow_mut().insert(key, answer);
        answer
    }

    /// Number of memoized answers
    pub fn len(&self) -> usize {
        self.answers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.borrow().is_empty()
    }
}
