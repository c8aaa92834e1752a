//! Rule and request types shared by the policy checks

use crate::stack::AccessStack;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission type used for file requests
pub const FILE_PERMISSION: &str = "file";

/// Permission type guarding host-only loader operations
pub const RUNTIME_PERMISSION: &str = "palisade.runtime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessType {
    Permit,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchMode {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileAction {
    Read,
    Write,
    Delete,
}

impl FileAction {
    pub const ALL: [Self; 3] = [Self::Read, Self::Write, Self::Delete];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(actions: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == actions)
    }
}

/// Where in the access stack a constraint looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StackPosition {
    /// The frame at this depth, 0 being the most recent caller
    At(usize),
    /// Any frame
    Anywhere,
}

/// A single stack constraint of a contextual rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackEntry {
    position: StackPosition,
    type_name: String,
    prefix: bool,
}

impl StackEntry {
    pub fn at(position: usize, type_name: impl Into<String>) -> Self {
        Self {
            position: StackPosition::At(position),
            type_name: type_name.into(),
            prefix: false,
        }
    }

    pub fn anywhere(type_name: impl Into<String>) -> Self {
        Self {
            position: StackPosition::Anywhere,
            type_name: type_name.into(),
            prefix: false,
        }
    }

    /// Match frames starting with the type name instead of equal to it.
    #[must_use]
    pub const fn prefixed(mut self) -> Self {
        self.prefix = true;
        self
    }

    #[must_use]
    pub const fn position(&self) -> StackPosition {
        self.position
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn matches_frame(&self, frame: &str) -> bool {
        if self.prefix {
            frame.starts_with(&self.type_name)
        } else {
            frame == self.type_name
        }
    }

    #[must_use]
    pub fn holds(&self, stack: &AccessStack) -> bool {
        match self.position {
            StackPosition::At(depth) => stack.get(depth).is_some_and(|f| self.matches_frame(f)),
            StackPosition::Anywhere => stack.iter().any(|f| self.matches_frame(f)),
        }
    }
}

/// Class or package rule that only applies under certain callers.
///
/// The rule name is a prefix; every stack entry must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextualRule {
    name: String,
    entries: Vec<StackEntry>,
}

impl ContextualRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_entry(mut self, entry: StackEntry) -> Self {
        self.entries.push(entry);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entries(&self) -> &[StackEntry] {
        &self.entries
    }

    #[must_use]
    pub fn allows(&self, name: &str, stack: &AccessStack) -> bool {
        name.starts_with(&self.name) && stack.satisfies(&self.entries)
    }
}

/// A configured security permission rule.
///
/// `None` name or actions match any request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityPermission {
    kind: String,
    name: Option<String>,
    actions: Option<String>,
    entries: Vec<StackEntry>,
}

impl SecurityPermission {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            actions: None,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: impl Into<String>) -> Self {
        self.actions = Some(actions.into());
        self
    }

    #[must_use]
    pub fn with_entry(mut self, entry: StackEntry) -> Self {
        self.entries.push(entry);
        self
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn matches(&self, request: &Permission, stack: &AccessStack) -> bool {
        if let Some(name) = &self.name {
            if request.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(actions) = &self.actions {
            if request.actions.as_deref() != Some(actions.as_str()) {
                return false;
            }
        }
        stack.satisfies(&self.entries)
    }
}

/// A permission request raised by mediated code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    kind: String,
    name: Option<String>,
    actions: Option<String>,
}

impl Permission {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            actions: None,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_actions(mut self, actions: impl Into<String>) -> Self {
        self.actions = Some(actions.into());
        self
    }

    pub fn file(action: FileAction, path: impl Into<String>) -> Self {
        Self::new(FILE_PERMISSION).named(path).with_actions(action.as_str())
    }

    pub fn runtime(operation: impl Into<String>) -> Self {
        Self::new(RUNTIME_PERMISSION).named(operation)
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn actions(&self) -> Option<&str> {
        self.actions.as_deref()
    }

    /// Single-action file request on a named path, if this is one.
    #[must_use]
    pub fn file_action(&self) -> Option<(FileAction, &str)> {
        if self.kind != FILE_PERMISSION {
            return None;
        }
        let action = FileAction::parse(self.actions.as_deref()?)?;
        Some((action, self.name.as_deref()?))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.kind)?;
        if let Some(name) = &self.name {
            write!(f, " \"{name}\"")?;
        }
        if let Some(actions) = &self.actions {
            write!(f, " \"{actions}\"")?;
        }
        f.write_str(")")
    }
}
