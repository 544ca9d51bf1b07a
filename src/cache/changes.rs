//! Per-transaction change set.

use std::collections::{HashMap, HashSet};

use super::key::CacheKey;
use crate::ontology::{ObjectHolder, ObjectLocator};

/// Keys touched by one write transaction, plus the object holders written,
/// grouped by object type.
#[derive(Debug, Clone, Default)]
pub struct Changes {
  pub added: HashSet<CacheKey>,
  pub modified: HashSet<CacheKey>,
  pub deleted: HashSet<CacheKey>,
  pub added_objects: HashMap<String, Vec<ObjectHolder>>,
  pub modified_objects: HashMap<String, Vec<ObjectHolder>>,
  pub deleted_objects: HashMap<String, Vec<ObjectLocator>>,
}

fn upsert_holder(map: &mut HashMap<String, Vec<ObjectHolder>>, holder: ObjectHolder) {
  let bucket = map.entry(holder.object_type.clone()).or_default();
  match bucket
    .iter_mut()
    .find(|h| h.primary_key == holder.primary_key)
  {
    Some(slot) => *slot = holder,
    None => bucket.push(holder),
  }
}

fn remove_holder(map: &mut HashMap<String, Vec<ObjectHolder>>, locator: &ObjectLocator) {
  if let Some(bucket) = map.get_mut(&locator.object_type) {
    bucket.retain(|h| h.primary_key != locator.primary_key);
    if bucket.is_empty() {
      map.remove(&locator.object_type);
    }
  }
}

impl Changes {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record an object write. A key already recorded in this transaction keeps
  /// its classification; only the holder is replaced with the latest one.
  pub fn register_object(&mut self, key: &CacheKey, holder: &ObjectHolder, is_new: bool) {
    if self.added.contains(key) {
      upsert_holder(&mut self.added_objects, holder.clone());
      return;
    }
    if self.deleted.remove(key) {
      let locator = holder.locator();
      if let Some(bucket) = self.deleted_objects.get_mut(&locator.object_type) {
        bucket.retain(|l| l != &locator);
      }
      self.modified.insert(key.clone());
      upsert_holder(&mut self.modified_objects, holder.clone());
      return;
    }
    if self.modified.contains(key) || !is_new {
      self.modified.insert(key.clone());
      upsert_holder(&mut self.modified_objects, holder.clone());
    } else {
      self.added.insert(key.clone());
      upsert_holder(&mut self.added_objects, holder.clone());
    }
  }

  pub fn register_list(&mut self, key: &CacheKey, is_new: bool) {
    if self.added.contains(key) || self.modified.contains(key) {
      return;
    }
    self.deleted.remove(key);
    if is_new {
      self.added.insert(key.clone());
    } else {
      self.modified.insert(key.clone());
    }
  }

  pub fn delete_object(&mut self, key: &CacheKey, locator: &ObjectLocator) {
    let was_added = self.added.remove(key);
    self.modified.remove(key);
    remove_holder(&mut self.added_objects, locator);
    remove_holder(&mut self.modified_objects, locator);
    // created and deleted in one transaction: nothing to report
    if was_added {
      return;
    }
    if self.deleted.insert(key.clone()) {
      self
        .deleted_objects
        .entry(locator.object_type.clone())
        .or_default()
        .push(locator.clone());
    }
  }

  pub fn delete_key(&mut self, key: &CacheKey) {
    self.added.remove(key);
    self.modified.remove(key);
    self.deleted.insert(key.clone());
  }

  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.added.contains(key) || self.modified.contains(key) || self.deleted.contains(key)
  }

  /// Whether any object of `object_type` was added or modified.
  pub fn touches_type(&self, object_type: &str) -> bool {
    self.added_objects.contains_key(object_type)
      || self.modified_objects.contains_key(object_type)
      || self.deleted_objects.contains_key(object_type)
  }

  /// Added and modified holders of one type.
  pub fn objects_of_type<'a>(&'a self, object_type: &str) -> impl Iterator<Item = &'a ObjectHolder> + 'a {
    self
      .added_objects
      .get(object_type)
      .into_iter()
      .chain(self.modified_objects.get(object_type))
      .flatten()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::key::CacheKeys;
  use crate::ontology::{ObjectData, PrimaryKey};
  use serde_json::json;

  fn holder(pk: i64, name: &str) -> ObjectHolder {
    ObjectHolder::new(ObjectData {
      object_type: "Employee".into(),
      primary_key: PrimaryKey::Integer(pk),
      title: None,
      rid: None,
      properties: json!({"name": name}).as_object().cloned().unwrap_or_default(),
    })
  }

  #[test]
  fn test_repeated_registration_is_idempotent() {
    let keys = CacheKeys::new();
    let k = keys.object("Employee", 1);
    let mut changes = Changes::new();
    assert!(changes.is_empty());

    changes.register_object(&k, &holder(1, "a"), true);
    changes.register_object(&k, &holder(1, "b"), false);
    changes.register_object(&k, &holder(1, "c"), true);

    assert_eq!(changes.added.len(), 1);
    assert!(changes.modified.is_empty());
    let objs = &changes.added_objects["Employee"];
    assert_eq!(objs.len(), 1);
    assert_eq!(objs[0].property("name"), Some(&json!("c")));
  }

  #[test]
  fn test_modify_then_delete() {
    let keys = CacheKeys::new();
    let k = keys.object("Employee", 2);
    let mut changes = Changes::new();
    changes.register_object(&k, &holder(2, "a"), false);
    changes.delete_object(&k, &ObjectLocator::new("Employee", 2));
    changes.delete_object(&k, &ObjectLocator::new("Employee", 2));

    assert!(changes.modified.is_empty());
    assert_eq!(changes.deleted.len(), 1);
    assert_eq!(changes.deleted_objects["Employee"].len(), 1);
    assert!(changes.touches_type("Employee"));
    assert_eq!(changes.objects_of_type("Employee").count(), 0);
  }

  #[test]
  fn test_add_then_delete_cancels_out() {
    let keys = CacheKeys::new();
    let k = keys.object("Employee", 3);
    let mut changes = Changes::new();
    changes.register_object(&k, &holder(3, "a"), true);
    changes.delete_object(&k, &ObjectLocator::new("Employee", 3));
    assert!(changes.is_empty());
  }

  #[test]
  fn test_lists() {
    let keys = CacheKeys::new();
    let k = keys.object("Office", "nyc");
    let mut changes = Changes::new();
    changes.register_list(&k, true);
    changes.register_list(&k, false);
    assert_eq!(changes.added.len(), 1);
    assert!(changes.modified.is_empty());
  }
}
