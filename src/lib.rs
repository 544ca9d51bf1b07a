//! Client-side synchronization for an ontology data service.
//!
//! An [`ObservableClient`] keeps a normalized cache of ontology objects,
//! collections and aggregations consistent with the remote service and with
//! pending optimistic mutations, and lets callers follow any query as it
//! changes.

pub mod actions;
pub mod bulk_loader;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod ontology;
pub mod optimistic;
pub mod query;

#[cfg(test)]
mod test_utils;

pub use actions::{ActionApplication, ApplyActionOptions};
pub use client::ObservableClient;
pub use config::{Config, StoreConfig};
pub use error::{RemoteError, Result, SyncError};
pub use ontology::{HttpDataSource, ObjectHolder, ObjectLocator, ObjectSetDefinition, PrimaryKey, RemoteDataSource};
pub use optimistic::{OptimisticBuilder, OptimisticJob};
pub use query::{
  AggregationOptions, FunctionOptions, LinkOptions, ListOptions, ObjectSetOptions, Subscription,
};
