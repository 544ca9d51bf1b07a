//! Identity of derived-property clauses.
//!
//! A clause is identified by the set of output property names it defines.
//! Two clauses that define the same names with different expressions share
//! one identity; whichever query is created first keeps its own expressions.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::canonical::Canonicalize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DerivedPropertyNames(pub BTreeSet<String>);

impl DerivedPropertyNames {
  pub fn of(clause: &BTreeMap<String, Value>) -> Self {
    DerivedPropertyNames(clause.keys().cloned().collect())
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl Canonicalize for DerivedPropertyNames {
  fn normalize(&self) -> Self {
    self.clone()
  }

  fn bucket_path(&self) -> Vec<String> {
    self.0.iter().cloned().collect()
  }
}
