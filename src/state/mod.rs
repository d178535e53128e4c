//! Abstract state model: operand stack, scoped environment, and their
//! composite threaded through the analysis drivers.

mod env;
mod stack;

pub use env::AbstractEnvironment;
pub use stack::AbstractStack;

use std::fmt;

/// The join operation of an abstract domain.
pub trait Merge {
    /// Merges the information of `other` into `self`, returning whether
    /// `self` changed. The drivers use the change flag as their
    /// convergence check, so it must be exact: reporting a spurious change
    /// delays termination, missing one loses soundness.
    fn merge_with(&mut self, other: &Self) -> bool;
}

/// Contract required of every abstract domain element.
///
/// `top` is the "no information" sentinel; `absent` stands for "statically
/// known not bound" and is merged into environment bindings that exist on
/// one control flow path only. A domain that does not care about the
/// distinction can make `absent` behave as its bottom.
pub trait AbstractValue: Merge + Clone + fmt::Display {
    fn top() -> Self;

    fn absent() -> Self;
}

/// Placeholder global component holding no information.
///
/// Terminates the recursive merge of an [`AbstractState`] that has no use
/// for a global part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoGlobal;

impl Merge for NoGlobal {
    fn merge_with(&mut self, _other: &Self) -> bool {
        false
    }
}

impl fmt::Display for NoGlobal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "-")
    }
}

/// Composite abstract state: one operand stack, one environment and one
/// analysis-specific global component.
///
/// This is the unit the drivers clone, thread along control flow branches
/// and merge at join points. Common stack and environment operations are
/// re-exposed as shorthands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractState<K, V, G = NoGlobal> {
    stack: AbstractStack<V>,
    env: AbstractEnvironment<K, V>,
    global: G,
}

impl<K, V, G> AbstractState<K, V, G>
where
    K: Ord + Clone,
    V: AbstractValue,
    G: Merge + Clone,
{
    #[must_use]
    pub fn new() -> Self
    where
        G: Default,
    {
        Self::with_global(G::default())
    }

    #[must_use]
    pub fn with_global(global: G) -> Self {
        Self {
            stack: AbstractStack::new(),
            env: AbstractEnvironment::new(),
            global,
        }
    }

    #[must_use]
    pub fn stack(&self) -> &AbstractStack<V> {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut AbstractStack<V> {
        &mut self.stack
    }

    #[must_use]
    pub fn env(&self) -> &AbstractEnvironment<K, V> {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut AbstractEnvironment<K, V> {
        &mut self.env
    }

    #[must_use]
    pub fn global(&self) -> &G {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut G {
        &mut self.global
    }

    // Stack shorthands.

    pub fn push(&mut self, value: V) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> V {
        self.stack.pop()
    }

    pub fn pop_n(&mut self, n: usize) {
        self.stack.pop_n(n);
    }

    #[must_use]
    pub fn top(&self) -> &V {
        self.stack.top()
    }

    // Environment shorthands.

    #[must_use]
    pub fn find(&self, key: &K) -> V {
        self.env.find(key)
    }

    pub fn set(&mut self, key: K, value: V) {
        self.env.set(key, value);
    }

    /// Merges the given value into every local environment binding.
    pub fn merge_all_env(&mut self, value: &V) {
        self.env.merge_all(value);
    }
}

impl<K, V, G> Default for AbstractState<K, V, G>
where
    K: Ord + Clone,
    V: AbstractValue,
    G: Merge + Clone + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, G> Merge for AbstractState<K, V, G>
where
    K: Ord + Clone,
    V: AbstractValue,
    G: Merge + Clone,
{
    fn merge_with(&mut self, other: &Self) -> bool {
        let mut changed = self.global.merge_with(&other.global);
        changed |= self.stack.merge_with(&other.stack);
        changed |= self.env.merge_with(&other.env);
        changed
    }
}

impl<K, V, G> fmt::Display for AbstractState<K, V, G>
where
    K: Ord + Clone + fmt::Display,
    V: AbstractValue,
    G: Merge + Clone + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "global: {}", self.global)?;
        write!(f, "{}", self.stack)?;
        write!(f, "{}", self.env)
    }
}
