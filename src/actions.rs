//! Applying remote actions with optional optimistic predictions.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{Changes, Store};
use crate::error::Result;
use crate::ontology::{ActionEditResponse, ObjectLocator};
use crate::optimistic::{OptimisticBuilder, OptimisticJob};
use crate::query::LiveQuery;

type OptimisticUpdate = Box<dyn FnOnce(&mut OptimisticBuilder) + Send>;

#[derive(Default)]
pub struct ApplyActionOptions {
  optimistic_update: Option<OptimisticUpdate>,
}

impl ApplyActionOptions {
  /// Show a prediction while the action runs.
  pub fn optimistic(update: impl FnOnce(&mut OptimisticBuilder) + Send + 'static) -> Self {
    Self {
      optimistic_update: Some(Box::new(update)),
    }
  }
}

/// Runs actions against the remote and brings the cache up to date with
/// what they changed.
#[derive(Clone)]
pub struct ActionApplication {
  store: Arc<Store>,
}

impl ActionApplication {
  pub fn new(store: Arc<Store>) -> Self {
    Self { store }
  }

  /// Apply `action`. A prediction, if given, is visible until the cache has
  /// caught up with the remote, and is removed whether or not the action
  /// succeeds.
  ///
  /// A failed action reports its own error. A successful action whose
  /// prediction could not be built reports the prediction failure.
  pub async fn apply_action(
    &self,
    action: &str,
    args: Value,
    options: ApplyActionOptions,
  ) -> Result<ActionEditResponse> {
    let job = options
      .optimistic_update
      .map(|update| OptimisticJob::start(&self.store, update));

    let outcome = self.apply_and_invalidate(action, &args).await;
    let cleanup = match &job {
      Some(job) => job.dispose().await,
      None => Ok(()),
    };

    let response = outcome?;
    cleanup?;
    Ok(response)
  }

  /// Check `args` against the action without applying it. The cache is
  /// left alone.
  pub async fn validate_action(&self, action: &str, args: &Value) -> Result<Value> {
    Ok(self.store.remote().validate_action(action, args).await?)
  }

  async fn apply_and_invalidate(&self, action: &str, args: &Value) -> Result<ActionEditResponse> {
    let response = self.store.remote().apply_action(action, args).await?;
    info!(action, "action applied");

    let settle = self.store.config().settle_delay;
    if !settle.is_zero() {
      tokio::time::sleep(settle).await;
    }

    match &response {
      ActionEditResponse::Edits {
        added_objects,
        modified_objects,
        deleted_objects,
      } => {
        self
          .reload_edited(added_objects, modified_objects, deleted_objects)
          .await?
      }
      ActionEditResponse::ObjectTypes { edited_object_types } => {
        let results = join_all(
          edited_object_types
            .iter()
            .map(|t| self.store.invalidate_object_type(t, None)),
        )
        .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
      }
      ActionEditResponse::None => debug!(action, "action reported no edits"),
    }
    Ok(response)
  }

  async fn reload_edited(
    &self,
    added: &[ObjectLocator],
    modified: &[ObjectLocator],
    deleted: &[ObjectLocator],
  ) -> Result<()> {
    let reloads = added
      .iter()
      .chain(modified)
      .map(|locator| async move {
        let query = self
          .store
          .object_query(&locator.object_type, locator.primary_key.clone())?;
        query.revalidate(true).await
      });
    let results = join_all(reloads).await;

    let (_, mut changes) = self.store.write_batch(None, |ctx| {
      for locator in deleted {
        ctx.delete_object(locator);
      }
    });
    self.register_current(&mut changes, added, true);
    self.register_current(&mut changes, modified, false);
    self
      .store
      .maybe_revalidate_queries(Arc::new(changes), None)
      .await;

    results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
  }

  fn register_current(&self, changes: &mut Changes, locators: &[ObjectLocator], is_new: bool) {
    for locator in locators {
      let key = self.store.cache_keys().object_at(locator);
      if let Some(holder) = self.store.read(&key).and_then(|e| e.object().cloned()) {
        changes.register_object(&key, &holder, is_new);
      }
    }
  }
}
