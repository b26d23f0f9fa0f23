//! Run-scoped record cache.
//!
//! Avoids redundant snapshot reads during a merge batch. The cache is an
//! explicit object threaded through the session and every resolver; there
//! is no change notification, so whoever mutates a record must call
//! [`RecordCache::invalidate`] for it.

use std::collections::HashMap;

use coalesce_core::{
  Result,
  record::{RecordId, RecordSnapshot},
  store::EntityStore,
};

/// Cache of [`RecordSnapshot`]s with a fixed attribute projection.
///
/// The projection (baseline attributes plus the union of resolver
/// requirements) is decided at construction; every load uses it, so cached
/// entries are interchangeable regardless of which call fetched them.
#[derive(Debug)]
pub struct RecordCache {
  attributes: Vec<String>,
  entries:    HashMap<RecordId, RecordSnapshot>,
}

impl RecordCache {
  pub fn new(attributes: Vec<String>) -> Self {
    Self { attributes, entries: HashMap::new() }
  }

  pub fn attributes(&self) -> &[String] { &self.attributes }

  /// Fetch the uncached subset of `ids` in one batch call and return the
  /// ids that were actually loaded. Already-cached entries are left
  /// untouched; deleted records are loaded too (the tombstone flag is part
  /// of the snapshot).
  pub async fn load<S: EntityStore>(
    &mut self,
    store: &S,
    ids: &[RecordId],
  ) -> Result<Vec<RecordId>> {
    let missing: Vec<RecordId> = ids
      .iter()
      .copied()
      .filter(|id| !self.entries.contains_key(id))
      .collect();

    if !missing.is_empty() {
      let snapshots =
        store.fetch_records(&missing, &self.attributes, true).await?;
      for snapshot in snapshots {
        self.entries.insert(snapshot.id, snapshot);
      }
    }

    Ok(missing)
  }

  /// The snapshot for `id`, loading it first if absent. `None` means the
  /// record does not exist in the store.
  pub async fn get<S: EntityStore>(
    &mut self,
    store: &S,
    id: RecordId,
  ) -> Result<Option<RecordSnapshot>> {
    if !self.entries.contains_key(&id) {
      self.load(store, &[id]).await?;
    }
    Ok(self.entries.get(&id).cloned())
  }

  /// Drop one entry; the next `get` reloads it from the store.
  pub fn invalidate(&mut self, id: RecordId) {
    self.entries.remove(&id);
  }

  pub fn cached(&self) -> usize { self.entries.len() }
}
