//! Normalized, layered cache of ontology data.
//!
//! - Query descriptors (where clauses, orderings, derived property names) are
//!   canonicalized so structurally equal queries share one [`CacheKey`].
//! - Confirmed data lives in a base layer; each pending optimistic mutation
//!   writes to its own layer on top. Reads see the topmost value.
//! - Every write happens inside a [`Store::batch`] transaction. Subjects are
//!   notified once per transaction, after it commits, and the transaction's
//!   [`Changes`] are offered to every live query.

mod canonical;
mod changes;
mod derived;
mod entry;
mod key;
mod layer;
mod order_by;
mod store;
mod where_clause;

pub use canonical::{Canonical, Canonicalize, Canonicalizer};
pub use changes::Changes;
pub use derived::DerivedPropertyNames;
pub use entry::{CacheValue, CollectionData, Entry, Snapshot, Status};
pub use key::{CacheKey, CacheKeyParams, CacheKeys};
pub use layer::{LayerStack, LayerStatus, OptimisticId};
pub use order_by::{Direction, OrderBy, SortField};
pub use store::{BatchContext, BatchOptions, KeyGuard, Store};
pub use where_clause::{PropertyFilter, WhereClause};
