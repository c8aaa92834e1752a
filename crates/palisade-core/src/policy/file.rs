//! File path rules, evaluated deny-first per action

use super::permission::{AccessType, FileAction};
use crate::{PalisadeError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A path regex matched against the whole path.
#[derive(Clone)]
pub struct FileRegex {
    mask: String,
    compiled: Regex,
}

impl FileRegex {
    pub fn new(mask: impl Into<String>) -> Result<Self> {
        let mask = mask.into();
        let compiled = Regex::new(&format!("^(?:{mask})$"))
            .map_err(|e| PalisadeError::Config(format!("invalid file regex {mask:?}: {e}")))?;
        Ok(Self { mask, compiled })
    }

    #[must_use]
    pub fn mask(&self) -> &str {
        &self.mask
    }

    #[must_use]
    pub fn is_match(&self, path: &str) -> bool {
        self.compiled.is_match(path)
    }
}

impl fmt::Debug for FileRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileRegex").field(&self.mask).finish()
    }
}

impl PartialEq for FileRegex {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask
    }
}

impl Eq for FileRegex {}

impl Hash for FileRegex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mask.hash(state);
    }
}

impl PartialOrd for FileRegex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileRegex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.mask.cmp(&other.mask)
    }
}

impl Serialize for FileRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.mask)
    }
}

impl<'de> Deserialize<'de> for FileRegex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mask = String::deserialize(deserializer)?;
        Self::new(mask).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileMatcher {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Regex(FileRegex),
}

impl FileMatcher {
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(p) => path == p,
            Self::Prefix(p) => path.starts_with(p.as_str()),
            Self::Suffix(s) => path.ends_with(s.as_str()),
            Self::Regex(r) => r.is_match(path),
        }
    }
}

/// One file pattern, optionally negated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRule {
    matcher: FileMatcher,
    negate: bool,
}

impl FileRule {
    pub fn exact(path: impl Into<String>) -> Self {
        Self::from_matcher(FileMatcher::Exact(path.into()))
    }

    pub fn prefix(path: impl Into<String>) -> Self {
        Self::from_matcher(FileMatcher::Prefix(path.into()))
    }

    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self::from_matcher(FileMatcher::Suffix(suffix.into()))
    }

    pub fn regex(mask: impl Into<String>) -> Result<Self> {
        Ok(Self::from_matcher(FileMatcher::Regex(FileRegex::new(mask)?)))
    }

    #[must_use]
    pub const fn from_matcher(matcher: FileMatcher) -> Self {
        Self { matcher, negate: false }
    }

    /// Invert the rule: it then applies to every path the pattern misses.
    #[must_use]
    pub const fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    #[must_use]
    pub const fn matcher(&self) -> &FileMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn test(&self, path: &str) -> bool {
        self.matcher.matches(path) ^ self.negate
    }
}

/// Allow and deny patterns for one file action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRuleSet {
    allow: BTreeSet<FileRule>,
    deny: BTreeSet<FileRule>,
}

impl FileRuleSet {
    /// Deny wins; otherwise any allow grants; default is deny.
    #[must_use]
    pub fn check(&self, path: &str) -> bool {
        if self.deny.iter().any(|r| r.test(path)) {
            return false;
        }
        self.allow.iter().any(|r| r.test(path))
    }

    pub fn insert(&mut self, access: AccessType, rule: FileRule) -> bool {
        self.rules_mut(access).insert(rule)
    }

    pub fn remove(&mut self, access: AccessType, rule: &FileRule) -> bool {
        self.rules_mut(access).remove(rule)
    }

    #[must_use]
    pub const fn rules(&self, access: AccessType) -> &BTreeSet<FileRule> {
        match access {
            AccessType::Permit => &self.allow,
            AccessType::Deny => &self.deny,
        }
    }

    const fn rules_mut(&mut self, access: AccessType) -> &mut BTreeSet<FileRule> {
        match access {
            AccessType::Permit => &mut self.allow,
            AccessType::Deny => &mut self.deny,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.allow.extend(other.allow.iter().cloned());
        self.deny.extend(other.deny.iter().cloned());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allow.len() + self.deny.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// File rule sets for read, write and delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRules {
    read: FileRuleSet,
    write: FileRuleSet,
    delete: FileRuleSet,
}

impl FileRules {
    #[must_use]
    pub const fn get(&self, action: FileAction) -> &FileRuleSet {
        match action {
            FileAction::Read => &self.read,
            FileAction::Write => &self.write,
            FileAction::Delete => &self.delete,
        }
    }

    pub const fn get_mut(&mut self, action: FileAction) -> &mut FileRuleSet {
        match action {
            FileAction::Read => &mut self.read,
            FileAction::Write => &mut self.write,
            FileAction::Delete => &mut self.delete,
        }
    }

    pub(crate) fn absorb(&mut self, other: &Self) {
        for action in FileAction::ALL {
            self.get_mut(action).absorb(other.get(action));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        FileAction::ALL.iter().map(|a| self.get(*a).len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
