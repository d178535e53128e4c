use crate::state::{AbstractValue, Merge};
use std::collections::BTreeMap;
use std::fmt;

/// Scoped abstract environment: key to value bindings with an optional
/// parent scope, forming a singly linked chain of lexical scopes.
///
/// Cloning an environment deep-copies the whole parent chain; parent
/// scopes are never shared between two environment values. This is the
/// authoritative copy rule, and merge correctness depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractEnvironment<K, V> {
    bindings: BTreeMap<K, V>,
    parent: Option<Box<AbstractEnvironment<K, V>>>,
}

impl<K: Ord + Clone, V: AbstractValue> AbstractEnvironment<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
            parent: None,
        }
    }

    /// Creates an empty environment scoped under `parent`.
    #[must_use]
    pub fn with_parent(parent: Self) -> Self {
        Self {
            bindings: BTreeMap::new(),
            parent: Some(Box::new(parent)),
        }
    }

    /// Whether the environment itself holds no bindings, disregarding its
    /// parents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Whether the key is bound locally, disregarding parents.
    #[must_use]
    pub fn has(&self, key: &K) -> bool {
        self.bindings.contains_key(key)
    }

    /// Simulates a variable lookup.
    ///
    /// The local bindings are consulted first, then the parent chain; a
    /// key absent everywhere yields [`AbstractValue::top`].
    #[must_use]
    pub fn find(&self, key: &K) -> V {
        match self.bindings.get(key) {
            Some(value) => value.clone(),
            None => match &self.parent {
                Some(parent) => parent.find(key),
                None => V::top(),
            },
        }
    }

    /// The local binding for the key, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.bindings.get(key)
    }

    /// Mutable access to the local binding, inserting
    /// [`AbstractValue::top`] if the key is unbound.
    pub fn local_mut(&mut self, key: K) -> &mut V {
        self.bindings.entry(key).or_insert_with(V::top)
    }

    pub fn set(&mut self, key: K, value: V) {
        self.bindings.insert(key, value);
    }

    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Self> {
        self.parent.as_deref()
    }

    pub fn parent_mut(&mut self) -> Option<&mut Self> {
        self.parent.as_deref_mut()
    }

    /// Merges the given value into every locally stored binding.
    ///
    /// Analyses use this to conservatively invalidate all locals, e.g.
    /// after a call that may write any variable.
    pub fn merge_all(&mut self, value: &V) {
        for bound in self.bindings.values_mut() {
            bound.merge_with(value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.bindings.iter()
    }
}

impl<K: Ord + Clone, V: AbstractValue> Default for AbstractEnvironment<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: AbstractValue> Merge for AbstractEnvironment<K, V> {
    /// Merges the other environment into this one.
    ///
    /// A key bound on only one of the two incoming paths cannot be assumed
    /// bottom: one control flow defines the variable, the other does not.
    /// Such one-sided bindings are therefore merged with
    /// [`AbstractValue::absent`], and it is up to the value domain to
    /// decide what that means (a domain that does not care can make absent
    /// behave as bottom).
    fn merge_with(&mut self, other: &Self) -> bool {
        let mut changed = false;

        for (key, theirs) in &other.bindings {
            match self.bindings.get_mut(key) {
                Some(ours) => {
                    changed |= ours.merge_with(theirs);
                }
                None => {
                    let mut missing = theirs.clone();
                    missing.merge_with(&V::absent());
                    self.bindings.insert(key.clone(), missing);
                    changed = true;
                }
            }
        }
        for (key, ours) in &mut self.bindings {
            if !other.bindings.contains_key(key) {
                changed |= ours.merge_with(&V::absent());
            }
        }

        match (&mut self.parent, &other.parent) {
            (None, Some(theirs)) => {
                self.parent = Some(theirs.clone());
                changed = true;
            }
            (Some(ours), Some(theirs)) => {
                changed |= ours.merge_with(theirs);
            }
            _ => {}
        }
        changed
    }
}

impl<K, V> fmt::Display for AbstractEnvironment<K, V>
where
    K: Ord + Clone + fmt::Display,
    V: AbstractValue,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "env:")?;
        for (key, value) in &self.bindings {
            writeln!(f, "  {key}: {value}")?;
        }
        match &self.parent {
            Some(parent) => write!(f, "parent {parent}"),
            None => writeln!(f, "no parent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Val {
        Top,
        Const(i64),
        Absent,
    }

    impl Merge for Val {
        fn merge_with(&mut self, other: &Self) -> bool {
            if self == other || *self == Self::Top {
                return false;
            }
            *self = Self::Top;
            true
        }
    }

    impl AbstractValue for Val {
        fn top() -> Self {
            Self::Top
        }

        fn absent() -> Self {
            Self::Absent
        }
    }

    impl fmt::Display for Val {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            match self {
                Self::Top => write!(f, "T"),
                Self::Const(c) => write!(f, "{c}"),
                Self::Absent => write!(f, "absent"),
            }
        }
    }

    type Env = AbstractEnvironment<String, Val>;

    fn env(bindings: &[(&str, Val)]) -> Env {
        let mut e = Env::new();
        for (key, value) in bindings {
            e.set((*key).to_string(), value.clone());
        }
        e
    }

    #[test]
    fn find_walks_the_scope_chain() {
        let parent = env(&[("outer", Val::Const(1))]);
        let mut e = Env::with_parent(parent);
        e.set("inner".to_string(), Val::Const(2));

        assert_eq!(e.find(&"inner".to_string()), Val::Const(2));
        assert_eq!(e.find(&"outer".to_string()), Val::Const(1));
        assert_eq!(e.find(&"nowhere".to_string()), Val::Top);
        assert!(e.has(&"inner".to_string()));
        assert!(!e.has(&"outer".to_string()));
    }

    #[test]
    fn one_sided_keys_are_merged_with_absent() {
        let mut a = env(&[("x", Val::Const(1))]);
        let b = env(&[("y", Val::Const(2))]);
        assert!(a.merge_with(&b));

        // x was bound locally only: merged with absent in place
        assert_eq!(*a.get(&"x".to_string()).unwrap(), Val::Top);
        // y was bound in the other only: inserted as value.merge(absent)
        let mut expected = Val::Const(2);
        expected.merge_with(&Val::absent());
        assert_eq!(*a.get(&"y".to_string()).unwrap(), expected);
    }

    #[test]
    fn merge_is_symmetric_on_resulting_bindings() {
        let mk_a = || {
            let mut a = env(&[("x", Val::Const(1)), ("y", Val::Const(7)), ("z", Val::Absent)]);
            a.parent = Some(Box::new(env(&[("p", Val::Const(9))])));
            a
        };
        let mk_b = || env(&[("y", Val::Const(7)), ("z", Val::Const(3)), ("w", Val::Top)]);

        let mut ab = mk_a();
        ab.merge_with(&mk_b());
        let mut ba = mk_b();
        ba.merge_with(&mk_a());

        for key in ["x", "y", "z", "w"] {
            let key = key.to_string();
            assert_eq!(ab.get(&key), ba.get(&key), "binding for {key} differs");
        }
        assert_eq!(
            ab.parent().unwrap().get(&"p".to_string()),
            ba.parent().unwrap().get(&"p".to_string())
        );
    }

    #[test]
    fn merge_reports_no_change_on_equal_environments() {
        let mut a = env(&[("x", Val::Const(1))]);
        let b = env(&[("x", Val::Const(1))]);
        assert!(!a.merge_with(&b));
    }

    #[test]
    fn missing_parent_chain_is_adopted_as_a_deep_copy() {
        let mut a = env(&[("x", Val::Const(1))]);
        let mut b = env(&[("x", Val::Const(1))]);
        b.parent = Some(Box::new(env(&[("p", Val::Const(5))])));

        assert!(a.merge_with(&b));
        assert!(a.has_parent());
        assert_eq!(a.parent().unwrap().get(&"p".to_string()), Some(&Val::Const(5)));

        // the adopted chain is a copy, not a shared scope
        a.parent_mut().unwrap().set("p".to_string(), Val::Top);
        assert_eq!(b.parent().unwrap().get(&"p".to_string()), Some(&Val::Const(5)));
    }

    #[test]
    fn local_only_parent_is_left_untouched() {
        let mut a = env(&[]);
        a.parent = Some(Box::new(env(&[("p", Val::Const(5))])));
        let b = env(&[]);

        assert!(!a.merge_with(&b));
        assert_eq!(a.parent().unwrap().get(&"p".to_string()), Some(&Val::Const(5)));
    }

    #[test]
    fn merge_all_touches_every_local_binding() {
        let mut e = env(&[("x", Val::Const(1)), ("y", Val::Const(2))]);
        e.parent = Some(Box::new(env(&[("p", Val::Const(3))])));
        e.merge_all(&Val::Top);

        assert_eq!(*e.get(&"x".to_string()).unwrap(), Val::Top);
        assert_eq!(*e.get(&"y".to_string()).unwrap(), Val::Top);
        // parents are out of merge_all's scope
        assert_eq!(e.parent().unwrap().get(&"p".to_string()), Some(&Val::Const(3)));
    }

    #[test]
    fn clone_deep_copies_the_parent_chain() {
        let mut e = env(&[("x", Val::Const(1))]);
        e.parent = Some(Box::new(env(&[("p", Val::Const(5))])));

        let mut copy = e.clone();
        copy.parent_mut().unwrap().set("p".to_string(), Val::Top);
        assert_eq!(e.parent().unwrap().get(&"p".to_string()), Some(&Val::Const(5)));
    }
}
