//! Pluggable discovery strategies.
//!
//! Match strategies contribute SQL fragments (joins, predicates, grouping
//! keys) to the composed discovery query; filter strategies prune results
//! after insertion; survivor pickers override the default main-record
//! choice during paging. All three are statically registered enums selected
//! by name, so pluggability needs no dynamic dispatch.

use coalesce_core::{
  Error, Result,
  record::RecordId,
  store::EntityStore,
};

use crate::candidates::CandidateSet;

// ─── Criteria ────────────────────────────────────────────────────────────────

/// Baseline restrictions applied to every discovery query, independent of
/// the selected strategies.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCriteria {
  /// Restrict discovery to records of this kind.
  pub record_kind: Option<String>,
}

// ─── Query accumulation ──────────────────────────────────────────────────────

/// Accumulator the strategies write their SQL fragments into. The base
/// `records` table is aliased `record` in every fragment.
#[derive(Debug, Clone, Default)]
pub struct QueryParts {
  pub joins:      Vec<String>,
  pub predicates: Vec<String>,
  pub group_keys: Vec<String>,
}

// ─── Match strategies ────────────────────────────────────────────────────────

/// A matching dimension for the discovery query: what makes two records
/// "the same".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
  /// Records sharing an email address (case insensitive).
  EmailAddress,
  /// Records sharing given and family name (case insensitive).
  FullName,
  /// Records sharing a birth date.
  BirthDate,
}

impl MatchStrategy {
  pub fn from_name(name: &str) -> Result<Self> {
    match name {
      "email" => Ok(Self::EmailAddress),
      "name" => Ok(Self::FullName),
      "birth_date" => Ok(Self::BirthDate),
      other => Err(Error::UnknownMatchStrategy(other.to_string())),
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::EmailAddress => "email",
      Self::FullName => "name",
      Self::BirthDate => "birth_date",
    }
  }

  pub fn help(self) -> &'static str {
    match self {
      Self::EmailAddress => "records sharing an email address",
      Self::FullName => "records sharing given and family name",
      Self::BirthDate => "records sharing a birth date",
    }
  }

  pub fn contribute(self, parts: &mut QueryParts) {
    match self {
      Self::EmailAddress => {
        parts
          .joins
          .push("JOIN emails email ON email.record_id = record.id".into());
        parts.predicates.push("email.address != ''".into());
        parts.group_keys.push("lower(email.address)".into());
      }
      Self::FullName => {
        parts.predicates.push(
          "record.given_name IS NOT NULL AND record.given_name != ''".into(),
        );
        parts.predicates.push(
          "record.family_name IS NOT NULL AND record.family_name != ''".into(),
        );
        parts.group_keys.push("lower(record.given_name)".into());
        parts.group_keys.push("lower(record.family_name)".into());
      }
      Self::BirthDate => {
        parts.predicates.push(
          "record.birth_date IS NOT NULL AND record.birth_date != ''".into(),
        );
        parts.group_keys.push("record.birth_date".into());
      }
    }
  }
}

// ─── Filter strategies ───────────────────────────────────────────────────────

/// Pruning applied to discovery results. Filters may contribute query parts
/// as well; the two shipped here prune after insertion only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStrategy {
  /// Drop tuples whose every survivor-member pair has been marked as a
  /// confirmed non-duplicate.
  ExcludedPairs,
  /// Drop tuples with more members than the limit; oversized clusters are
  /// usually a sign of an over-broad matching dimension.
  ClusterSizeLimit(u32),
}

impl FilterStrategy {
  /// Name-keyed registry lookup; the size limit takes its parameter inline,
  /// e.g. `max_members=8`.
  pub fn from_name(name: &str) -> Result<Self> {
    if name == "excluded_pairs" {
      return Ok(Self::ExcludedPairs);
    }
    if let Some(raw) = name.strip_prefix("max_members=")
      && let Ok(limit) = raw.parse::<u32>()
    {
      return Ok(Self::ClusterSizeLimit(limit));
    }
    Err(Error::UnknownFilterStrategy(name.to_string()))
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::ExcludedPairs => "excluded_pairs",
      Self::ClusterSizeLimit(_) => "max_members",
    }
  }

  pub fn contribute(self, _parts: &mut QueryParts) {}

  /// Purge matching tuples from the run's storage; returns how many tuples
  /// were removed.
  pub async fn purge<S: EntityStore>(
    self,
    set: &CandidateSet<S>,
  ) -> Result<usize> {
    match self {
      Self::ClusterSizeLimit(limit) => {
        set
          .store()
          .execute(&format!(
            "DELETE FROM {} WHERE member_count > {limit}",
            set.table_name()
          ))
          .await
      }
      Self::ExcludedPairs => {
        let mut removed = 0;
        for tuple in set.tuples().await? {
          let mut all_excluded = true;
          for member in &tuple.members {
            if *member == tuple.survivor {
              continue;
            }
            if !set.store().is_excluded(tuple.survivor, *member).await? {
              all_excluded = false;
              break;
            }
          }
          if all_excluded {
            set.remove(tuple.survivor).await?;
            removed += 1;
          }
        }
        Ok(removed)
      }
    }
  }
}

// ─── Survivor pickers ────────────────────────────────────────────────────────

/// Overrides the stored survivor choice during paging. Pickers are tried in
/// registration order; the first to return `Some` decides, and the stored
/// survivor (the lowest member id) is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurvivorPicker {
  /// Keep the newest record instead of the oldest.
  HighestId,
  /// Keep the record with the earliest creation timestamp.
  OldestRecord,
}

impl SurvivorPicker {
  pub fn from_name(name: &str) -> Result<Self> {
    match name {
      "highest_id" => Ok(Self::HighestId),
      "oldest_record" => Ok(Self::OldestRecord),
      other => Err(Error::UnknownSurvivorPicker(other.to_string())),
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::HighestId => "highest_id",
      Self::OldestRecord => "oldest_record",
    }
  }

  pub async fn pick<S: EntityStore>(
    self,
    store: &S,
    members: &[RecordId],
  ) -> Result<Option<RecordId>> {
    match self {
      Self::HighestId => Ok(members.iter().max().copied()),
      Self::OldestRecord => {
        let snapshots = store
          .fetch_records(members, &["created_at".to_string()], true)
          .await?;
        Ok(
          snapshots
            .iter()
            .filter_map(|s| {
              s.attribute("created_at").map(|at| (at.to_owned(), s.id))
            })
            .min()
            .map(|(_, id)| id),
        )
      }
    }
  }
}
