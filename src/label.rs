// src/label.rs

//! Labels and branches
//!
//! A label names a line of development on a repository host using the
//! format `repository@namespace:tag`. A branch is the chain of labels a
//! trove was shadowed through, written `/host@ns:tag//shadow@ns:tag`.
//!
//! Permissions scope on labels by exact string equality only; there is no
//! prefix or partial matching beyond the explicit wildcard handled in
//! [`crate::auth`].

use std::fmt;
use std::str::FromStr;

/// A Conary-style label
///
/// Format: `repository@namespace:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    /// Repository hostname
    pub repository: String,
    /// Namespace within the repository
    pub namespace: String,
    /// Branch tag
    pub tag: String,
}

impl Label {
    /// Create a new label
    pub fn new(repository: impl Into<String>, namespace: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            namespace: namespace.into(),
            tag: tag.into(),
        }
    }

    /// Parse a label from string format `repository@namespace:tag`
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let at_pos = s.find('@').ok_or_else(|| LabelParseError::MissingAt(s.to_string()))?;

        let colon_pos = s[at_pos..].find(':')
            .map(|p| at_pos + p)
            .ok_or_else(|| LabelParseError::MissingColon(s.to_string()))?;

        let repository = &s[..at_pos];
        let namespace = &s[at_pos + 1..colon_pos];
        let tag = &s[colon_pos + 1..];

        if repository.is_empty() {
            return Err(LabelParseError::EmptyRepository(s.to_string()));
        }
        if namespace.is_empty() {
            return Err(LabelParseError::EmptyNamespace(s.to_string()));
        }
        if tag.is_empty() {
            return Err(LabelParseError::EmptyTag(s.to_string()));
        }

        let valid_chars = |c: char| c.is_alphanumeric() || c == '.' || c == '-' || c == '_';

        if !repository.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidRepository(repository.to_string()));
        }
        if !namespace.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidNamespace(namespace.to_string()));
        }
        if !tag.chars().all(valid_chars) {
            return Err(LabelParseError::InvalidTag(tag.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            namespace: namespace.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Hostname of the repository serving this label
    pub fn host(&self) -> &str {
        &self.repository
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.repository, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}

/// A branch: the label a trove was built on plus any labels it was shadowed onto
///
/// The last label is the one the branch lives on; earlier labels are its
/// ancestors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Branch {
    labels: Vec<Label>,
}

impl Branch {
    /// A top-level branch on a single label
    pub fn new(label: Label) -> Self {
        Self {
            labels: vec![label],
        }
    }

    /// Parse `/host@ns:tag` or `/host@ns:tag//shadow@ns:tag`
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| LabelParseError::InvalidBranch(s.to_string()))?;

        let labels = rest
            .split("//")
            .map(Label::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { labels })
    }

    /// The label this branch lives on
    pub fn label(&self) -> &Label {
        // parse and new both guarantee at least one label
        &self.labels[self.labels.len() - 1]
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Shadow this branch onto another label
    pub fn shadow(&self, label: Label) -> Self {
        let mut labels = self.labels.clone();
        labels.push(label);
        Self { labels }
    }

    /// The branch this one was shadowed from, if any
    pub fn parent(&self) -> Option<Self> {
        if self.labels.len() < 2 {
            return None;
        }
        Some(Self {
            labels: self.labels[..self.labels.len() - 1].to_vec(),
        })
    }

    /// Whether `self` is `other` or one of its ancestors
    pub fn is_ancestor_of(&self, other: &Branch) -> bool {
        other.labels.len() >= self.labels.len() && other.labels[..self.labels.len()] == self.labels[..]
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            if i == 0 {
                write!(f, "/{}", label)?;
            } else {
                write!(f, "//{}", label)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Branch {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Branch::parse(s)
    }
}

/// Errors that can occur when parsing a label or branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelParseError {
    /// Missing @ separator
    MissingAt(String),
    /// Missing : separator
    MissingColon(String),
    /// Empty repository component
    EmptyRepository(String),
    /// Empty namespace component
    EmptyNamespace(String),
    /// Empty tag component
    EmptyTag(String),
    /// Invalid characters in repository
    InvalidRepository(String),
    /// Invalid characters in namespace
    InvalidNamespace(String),
    /// Invalid characters in tag
    InvalidTag(String),
    /// Branch string not rooted at `/`
    InvalidBranch(String),
}

impl fmt::Display for LabelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelParseError::MissingAt(s) => write!(f, "Missing '@' in label: {}", s),
            LabelParseError::MissingColon(s) => write!(f, "Missing ':' in label: {}", s),
            LabelParseError::EmptyRepository(s) => write!(f, "Empty repository in label: {}", s),
            LabelParseError::EmptyNamespace(s) => write!(f, "Empty namespace in label: {}", s),
            LabelParseError::EmptyTag(s) => write!(f, "Empty tag in label: {}", s),
            LabelParseError::InvalidRepository(s) => write!(f, "Invalid repository name: {}", s),
            LabelParseError::InvalidNamespace(s) => write!(f, "Invalid namespace: {}", s),
            LabelParseError::InvalidTag(s) => write!(f, "Invalid tag: {}", s),
            LabelParseError::InvalidBranch(s) => write!(f, "Branch must start with '/': {}", s),
        }
    }
}

impl std::error::Error for LabelParseError {}
