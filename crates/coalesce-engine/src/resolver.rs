//! Pre/post-merge conflict resolvers.
//!
//! A resolver may mutate either side of a pending merge through the store;
//! whatever it changes it must invalidate in the cache. `resolve` returning
//! an error signals an unresolved, merge-blocking conflict; `post_process`
//! is advisory cleanup whose failures the engine logs and swallows.
//!
//! Resolvers are a statically registered set selected by name, in keeping
//! with the rest of the strategy registries.

use coalesce_core::{
  Error, Result,
  record::{CONFLICT_LABEL, RecordId},
  store::EntityStore,
};

use crate::cache::RecordCache;

/// Everything a resolver may touch: the store, the session cache, and the
/// session's merge-detail stack.
pub struct ResolverContext<'a, S> {
  pub store:   &'a S,
  pub cache:   &'a mut RecordCache,
  pub details: &'a mut Vec<String>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
  SameKindGuard,
  AddressConflicts,
}

impl ResolverKind {
  pub const ALL: [ResolverKind; 2] =
    [Self::SameKindGuard, Self::AddressConflicts];

  pub fn from_name(name: &str) -> Result<Self> {
    match name {
      "same_kind" => Ok(Self::SameKindGuard),
      "address_conflicts" => Ok(Self::AddressConflicts),
      other => Err(Error::UnknownResolver(other.to_string())),
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::SameKindGuard => "same_kind",
      Self::AddressConflicts => "address_conflicts",
    }
  }

  pub fn help(self) -> &'static str {
    match self {
      Self::SameKindGuard => {
        "blocks merges between records of different kinds"
      }
      Self::AddressConflicts => {
        "same-label postal addresses are de-duplicated when identical and \
         moved to the 'conflict' label when they differ"
      }
    }
  }

  /// Record attributes this resolver needs in every cached snapshot, on top
  /// of the baseline (deletion flag, record kind).
  pub fn required_attributes(self) -> &'static [&'static str] {
    match self {
      Self::SameKindGuard => &[],
      Self::AddressConflicts => &[],
    }
  }

  /// Pre-merge hook. `Ok(true)` means something was changed.
  pub async fn resolve<S: EntityStore>(
    self,
    cx: &mut ResolverContext<'_, S>,
    survivor: RecordId,
    members: &[RecordId],
  ) -> Result<bool> {
    match self {
      Self::SameKindGuard => same_kind_guard(cx, survivor, members).await,
      Self::AddressConflicts => {
        resolve_address_conflicts(cx, survivor, members).await
      }
    }
  }

  /// Post-merge hook; best-effort cleanup on the surviving record.
  pub async fn post_process<S: EntityStore>(
    self,
    cx: &mut ResolverContext<'_, S>,
    survivor: RecordId,
  ) -> Result<()> {
    match self {
      Self::SameKindGuard => Ok(()),
      Self::AddressConflicts => {
        // Sub-records re-parented by the merge may now have a non-conflict
        // twin on the survivor; relabel what can be reconciled.
        reconcile_conflict_labels(cx, survivor).await?;
        Ok(())
      }
    }
  }
}

// ─── SameKindGuard ───────────────────────────────────────────────────────────

async fn same_kind_guard<S: EntityStore>(
  cx: &mut ResolverContext<'_, S>,
  survivor: RecordId,
  members: &[RecordId],
) -> Result<bool> {
  let resolver_error = |message: String| Error::Resolver {
    name: ResolverKind::SameKindGuard.name(),
    message,
  };

  let Some(survivor_snapshot) = cx.cache.get(cx.store, survivor).await? else {
    return Err(resolver_error(format!("record {survivor} not found")));
  };

  for member in members {
    let Some(member_snapshot) = cx.cache.get(cx.store, *member).await? else {
      return Err(resolver_error(format!("record {member} not found")));
    };
    if member_snapshot.kind != survivor_snapshot.kind {
      return Err(resolver_error(format!(
        "record kinds differ: {survivor} is {:?}, {member} is {:?}",
        survivor_snapshot.kind, member_snapshot.kind
      )));
    }
  }

  Ok(false)
}

// ─── AddressConflicts ────────────────────────────────────────────────────────

/// Relabel `record`'s conflict-marked sub-records back to a normal label
/// wherever a field-equal non-conflict sibling exists.
async fn reconcile_conflict_labels<S: EntityStore>(
  cx: &mut ResolverContext<'_, S>,
  record: RecordId,
) -> Result<bool> {
  let subrecords = cx.store.list_subrecords(record).await?;
  let mut changed = false;

  for sub in subrecords.iter().filter(|s| s.label == CONFLICT_LABEL) {
    let twin = subrecords.iter().find(|other| {
      other.id != sub.id
        && other.label != CONFLICT_LABEL
        && other.fields_match(sub)
    });
    if let Some(twin) = twin {
      cx.store.update_subrecord(sub.id, &twin.label, sub.is_primary).await?;
      cx.details.push(format!(
        "reconciled conflict sub-record [{}] of record {record} back to \
         '{}'",
        sub.id, twin.label
      ));
      cx.cache.invalidate(record);
      changed = true;
    }
  }

  Ok(changed)
}

async fn resolve_address_conflicts<S: EntityStore>(
  cx: &mut ResolverContext<'_, S>,
  survivor: RecordId,
  members: &[RecordId],
) -> Result<bool> {
  let mut changed = false;

  // Housekeeping first: reconcile anything already parked on the conflict
  // label, on both sides.
  changed |= reconcile_conflict_labels(cx, survivor).await?;
  for member in members {
    changed |= reconcile_conflict_labels(cx, *member).await?;
  }

  let survivor_subs = cx.store.list_subrecords(survivor).await?;
  for member in members {
    for sub in cx.store.list_subrecords(*member).await? {
      if sub.label == CONFLICT_LABEL {
        continue;
      }
      let Some(peer) =
        survivor_subs.iter().find(|s| s.label == sub.label)
      else {
        continue;
      };

      if peer.fields_match(&sub) {
        // Identical sub-record on both sides: keep the survivor's copy.
        cx.store.delete_subrecord(sub.id).await?;
        cx.details.push(format!(
          "removed duplicate '{}' sub-record [{}] from record {member}",
          sub.label, sub.id
        ));
      } else {
        // Differing data: park it on the conflict label instead of losing
        // it, which unblocks a safe-mode merge.
        cx.store.update_subrecord(sub.id, CONFLICT_LABEL, sub.is_primary).await?;
        cx.details.push(format!(
          "sub-record [{}] of record {member} bumped to '{CONFLICT_LABEL}' \
           label (was '{}')",
          sub.id, sub.label
        ));
      }
      cx.cache.invalidate(*member);
      changed = true;
    }
  }

  Ok(changed)
}
