use crate::state::{AbstractValue, Merge};
use std::collections::VecDeque;
use std::fmt;

/// Abstract model of the operand stack.
///
/// For well-formed code the stack depth at any merge point is constant, so
/// merging two stacks reduces to an element-wise merge of their values.
/// Index 0 is the top of the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractStack<V> {
    values: VecDeque<V>,
}

impl<V> AbstractStack<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: V) {
        self.values.push_front(value);
    }

    /// Removes and returns the top value.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    pub fn pop(&mut self) -> V {
        self.values.pop_front().expect("pop on an empty abstract stack")
    }

    /// Removes the top `n` values.
    ///
    /// # Panics
    ///
    /// Panics if the stack holds fewer than `n` values.
    pub fn pop_n(&mut self, n: usize) {
        assert!(
            self.values.len() >= n,
            "bulk pop of {n} values exceeds stack depth {}",
            self.values.len()
        );
        for _ in 0..n {
            self.values.pop_front();
        }
    }

    /// The top value of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack is empty.
    #[must_use]
    pub fn top(&self) -> &V {
        self.values.front().expect("top on an empty abstract stack")
    }

    pub fn top_mut(&mut self) -> &mut V {
        self.values.front_mut().expect("top on an empty abstract stack")
    }

    /// The `idx`-th value of the stack, the top having index 0.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn get(&self, idx: usize) -> &V {
        &self.values[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut V {
        &mut self.values[idx]
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.values.iter()
    }
}

impl<V> Default for AbstractStack<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: AbstractValue> Merge for AbstractStack<V> {
    /// Element-wise merge.
    ///
    /// # Panics
    ///
    /// Panics if the two stacks have different depths: a depth mismatch at
    /// a merge point means the control flow height was mis-tracked, which
    /// is a contract violation of the analyzed code, not a recoverable
    /// condition.
    fn merge_with(&mut self, other: &Self) -> bool {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "at merge, stacks must have the same depth"
        );
        let mut changed = false;
        for (ours, theirs) in self.values.iter_mut().zip(other.values.iter()) {
            changed |= ours.merge_with(theirs);
        }
        changed
    }
}

impl<V: AbstractValue> fmt::Display for AbstractStack<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "stack depth: {}", self.values.len())?;
        for (i, value) in self.values.iter().enumerate() {
            writeln!(f, "  {i}: {value}")?;
        }
        Ok(())
    }
}
