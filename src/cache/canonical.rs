//! Structural deduplication of query descriptors.
//!
//! A [`Canonicalizer`] hands out one shared [`Canonical`] reference for every
//! structurally equal input it has seen, for as long as some caller still
//! holds that reference. Entries are held weakly, so a descriptor nobody uses
//! any more lapses and the next equal input gets a fresh representative.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Descriptor types that can be canonicalized.
pub trait Canonicalize: Clone + PartialEq + Send + Sync + 'static {
  /// Representation-independent form of `self`.
  fn normalize(&self) -> Self;

  /// Path into the dedup index. Only values sharing a path are compared.
  fn bucket_path(&self) -> Vec<String>;
}

/// The unique live representative of a class of structurally equal values.
///
/// Equality and hashing are by reference, which is sound because the
/// canonicalizer never hands out two different references for equal values
/// while one of them is alive.
pub struct Canonical<T>(Arc<T>);

impl<T> Canonical<T> {
  pub fn ptr_eq(a: &Canonical<T>, b: &Canonical<T>) -> bool {
    Arc::ptr_eq(&a.0, &b.0)
  }

  pub fn as_arc(&self) -> &Arc<T> {
    &self.0
  }
}

impl<T> Clone for Canonical<T> {
  fn clone(&self) -> Self {
    Canonical(Arc::clone(&self.0))
  }
}

impl<T> Deref for Canonical<T> {
  type Target = T;

  fn deref(&self) -> &T {
    &self.0
  }
}

impl<T> PartialEq for Canonical<T> {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl<T> Eq for Canonical<T> {}

impl<T> Hash for Canonical<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
  }
}

impl<T: fmt::Debug> fmt::Debug for Canonical<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Canonical").field(&*self.0).finish()
  }
}

/// Index keyed by a path of strings.
#[derive(Debug)]
struct Trie<V> {
  value: Option<V>,
  children: BTreeMap<String, Trie<V>>,
}

impl<V> Default for Trie<V> {
  fn default() -> Self {
    Self {
      value: None,
      children: BTreeMap::new(),
    }
  }
}

impl<V: Default> Trie<V> {
  fn get_or_default(&mut self, path: &[String]) -> &mut V {
    let mut node = self;
    for segment in path {
      node = node.children.entry(segment.clone()).or_default();
    }
    node.value.get_or_insert_with(V::default)
  }
}

struct State<T> {
  /// Fast path: address of an input `Arc` to its canonical result.
  by_input: HashMap<usize, (Weak<T>, Weak<T>)>,
  index: Trie<Vec<Weak<T>>>,
  /// Live-entry count after the last prune of `by_input`.
  last_pruned_len: usize,
}

/// Weakly-memoizing canonicalizer for one descriptor type.
pub struct Canonicalizer<T: Canonicalize> {
  state: Mutex<State<T>>,
}

impl<T: Canonicalize> Default for Canonicalizer<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Canonicalize> Canonicalizer<T> {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State {
        by_input: HashMap::new(),
        index: Trie::default(),
        last_pruned_len: 0,
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Canonicalize an owned value.
  pub fn canonicalize(&self, input: T) -> Canonical<T> {
    self.canonicalize_arc(&Arc::new(input))
  }

  /// Canonicalize a shared value. Repeat calls with the same `Arc` skip
  /// normalization entirely.
  pub fn canonicalize_arc(&self, input: &Arc<T>) -> Canonical<T> {
    let addr = Arc::as_ptr(input) as *const () as usize;
    let mut state = self.state();

    if let Some((seen, result)) = state.by_input.get(&addr) {
      if let (Some(seen), Some(result)) = (seen.upgrade(), result.upgrade()) {
        if Arc::ptr_eq(&seen, input) {
          return Canonical(result);
        }
      }
    }

    let normalized = input.normalize();
    let bucket = state.index.get_or_default(&normalized.bucket_path());
    bucket.retain(|w| w.strong_count() > 0);

    let found = bucket
      .iter()
      .filter_map(Weak::upgrade)
      .find(|candidate| **candidate == normalized);

    let result = match found {
      Some(existing) => existing,
      None => {
        let fresh = Arc::new(normalized);
        bucket.push(Arc::downgrade(&fresh));
        fresh
      }
    };

    let result_addr = Arc::as_ptr(&result) as *const () as usize;
    state
      .by_input
      .insert(addr, (Arc::downgrade(input), Arc::downgrade(&result)));
    state
      .by_input
      .insert(result_addr, (Arc::downgrade(&result), Arc::downgrade(&result)));
    Self::maybe_prune(&mut state);

    Canonical(result)
  }

  fn maybe_prune(state: &mut State<T>) {
    if state.by_input.len() <= 64.max(state.last_pruned_len * 2) {
      return;
    }
    state
      .by_input
      .retain(|_, (input, result)| input.strong_count() > 0 && result.strong_count() > 0);
    state.last_pruned_len = state.by_input.len();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, Clone, PartialEq)]
  struct Words(Vec<String>);

  impl Canonicalize for Words {
    fn normalize(&self) -> Self {
      let mut v = self.0.clone();
      v.sort();
      v.dedup();
      Words(v)
    }

    fn bucket_path(&self) -> Vec<String> {
      self.0.first().cloned().into_iter().collect()
    }
  }

  fn words(w: &[&str]) -> Words {
    Words(w.iter().map(|s| s.to_string()).collect())
  }

  #[test]
  fn test_equal_inputs_share_reference() {
    let c = Canonicalizer::new();
    let a = c.canonicalize(words(&["b", "a"]));
    let b = c.canonicalize(words(&["a", "b", "a"]));
    assert!(Canonical::ptr_eq(&a, &b));

    let other = c.canonicalize(words(&["a", "c"]));
    assert!(!Canonical::ptr_eq(&a, &other));
  }

  #[test]
  fn test_same_arc_hits_fast_path() {
    let c = Canonicalizer::new();
    let input = Arc::new(words(&["z", "y"]));
    let first = c.canonicalize_arc(&input);
    let second = c.canonicalize_arc(&input);
    assert!(Canonical::ptr_eq(&first, &second));
    assert_eq!((*first).0, vec!["y".to_string(), "z".to_string()]);
  }

  #[test]
  fn test_canonicalizing_a_canonical_value_is_identity() {
    let c = Canonicalizer::new();
    let first = c.canonicalize(words(&["q", "p"]));
    let again = c.canonicalize_arc(first.as_arc());
    assert!(Canonical::ptr_eq(&first, &again));
  }

  #[test]
  fn test_unreferenced_entries_lapse() {
    let c = Canonicalizer::new();
    let first = c.canonicalize(words(&["a"]));
    let weak = Arc::downgrade(first.as_arc());
    drop(first);
    assert!(weak.upgrade().is_none());

    // still produces a consistent representative afterwards
    let x = c.canonicalize(words(&["a"]));
    let y = c.canonicalize(words(&["a"]));
    assert!(Canonical::ptr_eq(&x, &y));
  }
}
