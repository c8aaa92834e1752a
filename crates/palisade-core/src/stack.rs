//! Snapshot of the callers behind an access request

use crate::policy::StackEntry;
use std::fmt;

/// Caller type names, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessStack {
    frames: Vec<String>,
}

impl AccessStack {
    /// Build from frames ordered most recent first.
    #[must_use]
    pub const fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }

    /// Build from frames in call order, outermost first.
    pub fn from_call_order<I>(frames: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self {
            frames: frames.into_iter().rev().collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn get(&self, depth: usize) -> Option<&str> {
        self.frames.get(depth).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(String::as_str)
    }

    /// Whether every constraint holds against this stack.
    #[must_use]
    pub fn satisfies(&self, entries: &[StackEntry]) -> bool {
        entries.iter().all(|e| e.holds(self))
    }
}

impl fmt::Display for AccessStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate() {
            writeln!(f, "\t{depth}\t: {frame}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_order_is_reversed() {
        let stack = AccessStack::from_call_order(vec!["main".to_string(), "inner".to_string()]);
        assert_eq!(stack.get(0), Some("inner"));
        assert_eq!(stack.get(1), Some("main"));
    }

    #[test]
    fn empty_constraint_list_always_holds() {
        assert!(AccessStack::default().satisfies(&[]));
        assert!(!AccessStack::default().satisfies(&[StackEntry::anywhere("x")]));
    }

    #[test]
    fn display_lists_one_frame_per_line() {
        let stack = AccessStack::new(vec!["a.B".into(), "a.C".into()]);
        assert_eq!(stack.to_string(), "\t0\t: a.B\n\t1\t: a.C\n");
    }
}
