//! Coalesces single-object loads into batched page fetches.
//!
//! Requests for one object type collect into a pending batch. The batch is
//! flushed when it reaches `max_entries` keys or when the window since its
//! first request elapses, whichever comes first. Each flush is one
//! `fetch_page` call filtering on the type's primary key field.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{PropertyFilter, WhereClause};
use crate::config::StoreConfig;
use crate::error::{RemoteError, Result, SyncError};
use crate::ontology::{MetadataCache, ObjectHolder, ObjectSetDefinition, PageRequest, PrimaryKey, RemoteDataSource};

type Waiter = oneshot::Sender<Result<ObjectHolder>>;

struct PendingBatch {
  id: u64,
  waiters: BTreeMap<PrimaryKey, Vec<Waiter>>,
}

#[derive(Default)]
struct LoaderState {
  next_id: u64,
  pending: HashMap<String, PendingBatch>,
}

struct Inner {
  remote: Arc<dyn RemoteDataSource>,
  metadata: Arc<MetadataCache>,
  max_entries: usize,
  window: Duration,
  state: Mutex<LoaderState>,
}

/// Batches `fetch(type, primary_key)` calls. Cheap to clone.
#[derive(Clone)]
pub struct BulkObjectLoader {
  inner: Arc<Inner>,
}

impl BulkObjectLoader {
  pub fn new(remote: Arc<dyn RemoteDataSource>, metadata: Arc<MetadataCache>, config: &StoreConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        remote,
        metadata,
        max_entries: config.bulk_load_max_entries.max(1),
        window: config.bulk_load_window,
        state: Mutex::new(LoaderState::default()),
      }),
    }
  }

  /// Queue a load. The key joins the pending batch as soon as this is
  /// called, not when the returned future is first polled.
  ///
  /// Must be called from within a tokio runtime.
  pub fn fetch(
    &self,
    object_type: impl Into<String>,
    primary_key: PrimaryKey,
  ) -> impl Future<Output = Result<ObjectHolder>> + Send + 'static {
    let object_type = object_type.into();
    let (tx, rx) = oneshot::channel();

    let full = {
      let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
      if !state.pending.contains_key(&object_type) {
        state.next_id += 1;
        let id = state.next_id;
        state.pending.insert(
          object_type.clone(),
          PendingBatch {
            id,
            waiters: BTreeMap::new(),
          },
        );
        self.schedule_flush(object_type.clone(), id);
      }

      let max_entries = self.inner.max_entries;
      match state.pending.get_mut(&object_type) {
        Some(batch) => {
          batch.waiters.entry(primary_key).or_default().push(tx);
          if batch.waiters.len() >= max_entries {
            state.pending.remove(&object_type)
          } else {
            None
          }
        }
        None => None,
      }
    };

    if let Some(batch) = full {
      tokio::spawn(Self::flush(self.inner.clone(), object_type, batch));
    }

    async move {
      rx.await.unwrap_or_else(|_| {
        Err(SyncError::Remote(RemoteError::Transport(
          "bulk load was abandoned".to_string(),
        )))
      })
    }
  }

  fn schedule_flush(&self, object_type: String, id: u64) {
    let inner = self.inner.clone();
    tokio::spawn(async move {
      tokio::time::sleep(inner.window).await;
      let batch = {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.pending.get(&object_type) {
          // a full batch was already flushed and a new one started
          Some(batch) if batch.id == id => state.pending.remove(&object_type),
          _ => None,
        }
      };
      if let Some(batch) = batch {
        Self::flush(inner, object_type, batch).await;
      }
    });
  }

  async fn flush(inner: Arc<Inner>, object_type: String, batch: PendingBatch) {
    let keys: Vec<PrimaryKey> = batch.waiters.keys().cloned().collect();
    debug!(object_type, keys = keys.len(), "flushing bulk load");

    let result = Self::load(&inner, &object_type, &keys).await;
    match result {
      Ok(mut found) => {
        for (pk, waiters) in batch.waiters {
          let outcome = found
            .remove(&pk)
            .ok_or_else(|| SyncError::not_found(object_type.clone(), &pk));
          if outcome.is_err() {
            warn!(object_type, primary_key = %pk, "bulk load returned no object");
          }
          for waiter in waiters {
            let _ = waiter.send(outcome.clone());
          }
        }
      }
      Err(e) => {
        for waiter in batch.waiters.into_values().flatten() {
          let _ = waiter.send(Err(e.clone()));
        }
      }
    }
  }

  async fn load(
    inner: &Inner,
    object_type: &str,
    keys: &[PrimaryKey],
  ) -> Result<HashMap<PrimaryKey, ObjectHolder>> {
    let metadata = inner.metadata.get(object_type).await?;
    let filter = match keys {
      [single] => PropertyFilter::Literal(single.to_json()),
      many => PropertyFilter::Operators(BTreeMap::from([(
        "$in".to_string(),
        Value::Array(many.iter().map(PrimaryKey::to_json).collect()),
      )])),
    };
    let where_clause = WhereClause::Properties(BTreeMap::from([(metadata.primary_key.clone(), filter)]));
    let object_set = ObjectSetDefinition::base(object_type).filter(where_clause);
    let request = PageRequest {
      page_size: Some(keys.len()),
      ..PageRequest::default()
    };

    let page = inner.remote.fetch_page(&object_set, &request).await?;
    Ok(
      page
        .data
        .into_iter()
        .map(|holder| (holder.primary_key.clone(), holder))
        .collect(),
    )
  }
}
