//! Confirmed state plus an ordered stack of optimistic layers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::entry::Entry;
use super::key::CacheKey;

/// Token naming one pending optimistic mutation. Minted by
/// [`LayerStack::open_layer`], never reused within a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimisticId(u64);

impl fmt::Display for OptimisticId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "opt-{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStatus {
  /// Writes may still arrive
  Pending,
  /// The job's single batch has been written
  Applied,
}

/// `None` records a speculative delete.
type LayerValue = Option<Arc<Entry>>;

#[derive(Debug)]
struct Layer {
  id: OptimisticId,
  status: LayerStatus,
  entries: HashMap<CacheKey, LayerValue>,
}

/// Base entries overlaid by layers in insertion order. The visible value of a
/// key is the one from the topmost layer defining it, else the base value.
#[derive(Debug, Default)]
pub struct LayerStack {
  base: HashMap<CacheKey, Arc<Entry>>,
  layers: Vec<Layer>,
  last_id: u64,
}

impl LayerStack {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey) -> Option<Arc<Entry>> {
    for layer in self.layers.iter().rev() {
      if let Some(value) = layer.entries.get(key) {
        return value.clone();
      }
    }
    self.base.get(key).cloned()
  }

  pub fn get_base(&self, key: &CacheKey) -> Option<Arc<Entry>> {
    self.base.get(key).cloned()
  }

  /// Whether the visible value of `key` comes from a layer.
  pub fn is_optimistic(&self, key: &CacheKey) -> bool {
    self.layers.iter().any(|l| l.entries.contains_key(key))
  }

  /// Push an empty pending layer on top of the stack.
  pub fn open_layer(&mut self) -> OptimisticId {
    self.last_id += 1;
    let id = OptimisticId(self.last_id);
    self.layers.push(Layer {
      id,
      status: LayerStatus::Pending,
      entries: HashMap::new(),
    });
    id
  }

  /// Write to confirmed state, or into an open layer. Returns false when the
  /// layer is not open (never opened, or already removed) and nothing was
  /// written.
  pub fn write(&mut self, optimistic_id: Option<OptimisticId>, key: &CacheKey, value: LayerValue) -> bool {
    let Some(id) = optimistic_id else {
      match value {
        Some(entry) => self.base.insert(key.clone(), entry),
        None => self.base.remove(key),
      };
      return true;
    };

    match self.layers.iter_mut().find(|l| l.id == id) {
      Some(layer) => {
        layer.entries.insert(key.clone(), value);
        true
      }
      None => false,
    }
  }

  pub fn has_layer(&self, id: OptimisticId) -> bool {
    self.layers.iter().any(|l| l.id == id)
  }

  pub fn layer_status(&self, id: OptimisticId) -> Option<LayerStatus> {
    self.layers.iter().find(|l| l.id == id).map(|l| l.status)
  }

  pub fn set_status(&mut self, id: OptimisticId, status: LayerStatus) {
    if let Some(layer) = self.layers.iter_mut().find(|l| l.id == id) {
      layer.status = status;
    }
  }

  pub fn layer_keys(&self, id: OptimisticId) -> Vec<CacheKey> {
    self
      .layers
      .iter()
      .find(|l| l.id == id)
      .map(|l| l.entries.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// Remove a layer, returning the keys it defined.
  pub fn remove_layer(&mut self, id: OptimisticId) -> Vec<CacheKey> {
    match self.layers.iter().position(|l| l.id == id) {
      Some(idx) => self.layers.remove(idx).entries.into_keys().collect(),
      None => Vec::new(),
    }
  }

  pub fn layer_count(&self) -> usize {
    self.layers.len()
  }

  /// Drop a confirmed entry. Layered values are untouched.
  pub fn forget_base(&mut self, key: &CacheKey) -> Option<Arc<Entry>> {
    self.base.remove(key)
  }

  /// Every key with a base or layered value.
  pub fn keys(&self) -> HashSet<CacheKey> {
    let mut keys: HashSet<CacheKey> = self.base.keys().cloned().collect();
    for layer in &self.layers {
      keys.extend(layer.entries.keys().cloned());
    }
    keys
  }
}
