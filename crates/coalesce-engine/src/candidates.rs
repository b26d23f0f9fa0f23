//! [`CandidateSet`] — durable storage and query logic for one discovery run.
//!
//! Each run owns a dynamically named working table in the same database as
//! the records. Discovery is a single `INSERT OR IGNORE … SELECT` statement
//! composed from the registered strategies; survivor-id collisions are
//! ignored, so the first discovery pass to claim a cluster wins and re-runs
//! are idempotent.

use std::time::{Duration as WallDuration, Instant};

use chrono::{Duration, Utc};

use coalesce_core::{
  Error, Result,
  record::{RecordId, SqlValue},
  run::RunId,
  store::EntityStore,
  tuple::CandidateTuple,
};

use crate::strategy::{
  DiscoveryCriteria, FilterStrategy, MatchStrategy, QueryParts, SurvivorPicker,
};

/// Name prefix of all run working tables.
pub const RUN_TABLE_PREFIX: &str = "tmp_coalesce_";

/// Outcome of a stale-run sweep.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
  pub dropped:      Vec<String>,
  /// Tables left alone: the caller's own run plus runs inside the horizon.
  pub skipped:      Vec<String>,
  /// Table names that did not parse as run identifiers. Reported only;
  /// never auto-dropped.
  pub unrecognised: Vec<String>,
}

/// One discovery run's working set of candidate tuples.
pub struct CandidateSet<S> {
  store:          S,
  run:            RunId,
  last_discovery: Option<WallDuration>,
}

impl<S: EntityStore> CandidateSet<S> {
  /// Start a fresh run: generate an identifier and create its storage.
  pub async fn create(store: S) -> Result<Self> {
    Self::attach(store, RunId::generate()).await
  }

  /// Attach to an existing run id, idempotently re-creating storage if it
  /// is gone.
  pub async fn attach(store: S, run: RunId) -> Result<Self> {
    let set = Self { store, run, last_discovery: None };
    set.ensure_storage().await?;
    Ok(set)
  }

  pub fn run_id(&self) -> &RunId { &self.run }

  pub fn store(&self) -> &S { &self.store }

  pub fn table_name(&self) -> String {
    format!("{RUN_TABLE_PREFIX}{}", self.run)
  }

  /// Wall-clock duration of the most recent [`CandidateSet::discover`].
  pub fn last_discovery_runtime(&self) -> Option<WallDuration> {
    self.last_discovery
  }

  async fn ensure_storage(&self) -> Result<()> {
    let table = self.table_name();
    self
      .store
      .execute(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
           survivor_id  INTEGER PRIMARY KEY,
           member_count INTEGER NOT NULL,
           member_ids   TEXT NOT NULL,
           merged_count INTEGER DEFAULT NULL
         )"
      ))
      .await?;
    self
      .store
      .execute(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_member_count
         ON {table} (member_count)"
      ))
      .await?;
    Ok(())
  }

  // ── Discovery ─────────────────────────────────────────────────────────

  /// Run one discovery pass and insert the found clusters, ignoring any
  /// whose survivor id is already present. Returns the number of newly
  /// inserted tuples.
  pub async fn discover(
    &mut self,
    criteria: &DiscoveryCriteria,
    matchers: &[MatchStrategy],
    filters: &[FilterStrategy],
  ) -> Result<usize> {
    let started = Instant::now();

    let mut parts = QueryParts::default();
    if let Some(kind) = &criteria.record_kind {
      parts
        .predicates
        .push(format!("record.kind = '{}'", kind.replace('\'', "''")));
    }
    parts
      .predicates
      .push("(record.is_deleted = 0 OR record.is_deleted IS NULL)".into());
    for matcher in matchers {
      matcher.contribute(&mut parts);
    }
    for filter in filters {
      filter.contribute(&mut parts);
    }

    let sql = compose_discovery_sql(&self.table_name(), &parts);
    let inserted = self.store.execute(&sql).await?;

    let mut purged = 0;
    for filter in filters {
      purged += filter.purge(self).await?;
    }

    let elapsed = started.elapsed();
    self.last_discovery = Some(elapsed);
    tracing::info!(
      run = %self.run,
      inserted,
      purged,
      elapsed_ms = elapsed.as_millis() as u64,
      "discovery pass finished"
    );

    Ok(inserted)
  }

  // ── Paging ────────────────────────────────────────────────────────────

  /// Up to `count` tuples starting at `offset`, in storage order. Pickers
  /// are tried in order to choose the main record; the stored survivor is
  /// the fallback. The chosen survivor is removed from each returned
  /// member list.
  pub async fn page(
    &self,
    count: usize,
    offset: usize,
    pickers: &[SurvivorPicker],
  ) -> Result<Vec<(RecordId, Vec<RecordId>)>> {
    let rows = self
      .store
      .query_rows(&format!(
        "SELECT survivor_id, member_ids FROM {}
         ORDER BY survivor_id LIMIT {count} OFFSET {offset}",
        self.table_name()
      ))
      .await?;

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
      let stored_survivor = row
        .first()
        .and_then(SqlValue::as_i64)
        .map(RecordId)
        .ok_or_else(|| Error::MalformedTuple("missing survivor id".into()))?;
      let members = CandidateTuple::decode_members(
        row
          .get(1)
          .and_then(|v| v.as_text())
          .ok_or_else(|| Error::MalformedTuple("missing member ids".into()))?,
      )?;

      let mut chosen = None;
      for picker in pickers {
        if let Some(id) = picker.pick(&self.store, &members).await? {
          chosen = Some(id);
          break;
        }
      }
      let survivor = chosen.unwrap_or(stored_survivor);

      let rest: Vec<RecordId> =
        members.iter().copied().filter(|id| *id != survivor).collect();
      tuples.push((survivor, rest));
    }

    Ok(tuples)
  }

  // ── Counting and bookkeeping ──────────────────────────────────────────

  /// Number of stored tuples.
  pub async fn count(&self) -> Result<u64> {
    let count = self
      .store
      .query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table_name()))
      .await?;
    Ok(count.unwrap_or(0) as u64)
  }

  /// Sum of member counts across all tuples.
  pub async fn total_members(&self) -> Result<u64> {
    let sum = self
      .store
      .query_scalar(&format!(
        "SELECT SUM(member_count) FROM {}",
        self.table_name()
      ))
      .await?;
    Ok(sum.unwrap_or(0) as u64)
  }

  /// Empty the working table without dropping it.
  pub async fn clear(&self) -> Result<()> {
    self
      .store
      .execute(&format!("DELETE FROM {}", self.table_name()))
      .await?;
    Ok(())
  }

  /// Remove the tuple keyed by `survivor`.
  pub async fn remove(&self, survivor: RecordId) -> Result<()> {
    self
      .store
      .execute(&format!(
        "DELETE FROM {} WHERE survivor_id = {}",
        self.table_name(),
        survivor.0
      ))
      .await?;
    Ok(())
  }

  /// Replace the tuple keyed by `old_survivor` with a new member list; the
  /// new survivor is the minimum of the new members. An empty replacement
  /// dissolves the tuple.
  pub async fn replace(
    &self,
    old_survivor: RecordId,
    new_members: &[RecordId],
  ) -> Result<()> {
    let mut members = new_members.to_vec();
    members.sort_unstable();
    members.dedup();

    let Some(new_survivor) = members.first().copied() else {
      return self.remove(old_survivor).await;
    };

    self
      .store
      .execute(&format!(
        "UPDATE {} SET survivor_id = {}, member_count = {}, member_ids = '{}'
         WHERE survivor_id = {}",
        self.table_name(),
        new_survivor.0,
        members.len(),
        CandidateTuple::encode_members(&members),
        old_survivor.0
      ))
      .await?;
    Ok(())
  }

  /// Record how many members a completed merge attempt actually absorbed.
  pub async fn record_merge_outcome(
    &self,
    survivor: RecordId,
    merged_count: u32,
  ) -> Result<()> {
    self
      .store
      .execute(&format!(
        "UPDATE {} SET merged_count = {merged_count} WHERE survivor_id = {}",
        self.table_name(),
        survivor.0
      ))
      .await?;
    Ok(())
  }

  /// Full dump of the working table, in storage order.
  pub async fn tuples(&self) -> Result<Vec<CandidateTuple>> {
    let rows = self
      .store
      .query_rows(&format!(
        "SELECT survivor_id, member_count, member_ids, merged_count
         FROM {} ORDER BY survivor_id",
        self.table_name()
      ))
      .await?;

    rows
      .into_iter()
      .map(|row| {
        let survivor = row
          .first()
          .and_then(SqlValue::as_i64)
          .map(RecordId)
          .ok_or_else(|| Error::MalformedTuple("missing survivor id".into()))?;
        let member_count = row
          .get(1)
          .and_then(SqlValue::as_i64)
          .ok_or_else(|| Error::MalformedTuple("missing member count".into()))?
          as u32;
        let members = CandidateTuple::decode_members(
          row
            .get(2)
            .and_then(|v| v.as_text())
            .ok_or_else(|| Error::MalformedTuple("missing member ids".into()))?,
        )?;
        let merged_count =
          row.get(3).and_then(SqlValue::as_i64).map(|n| n as u32);
        Ok(CandidateTuple { survivor, member_count, members, merged_count })
      })
      .collect()
  }

  // ── Exclusion ─────────────────────────────────────────────────────────

  /// Mark a tuple as a confirmed non-duplicate: persist every
  /// survivor-member pair as an exclusion, then drop the tuple from this
  /// run.
  pub async fn exclude(
    &self,
    survivor: RecordId,
    members: &[RecordId],
  ) -> Result<()> {
    for member in members {
      if *member == survivor {
        continue;
      }
      self.store.add_exclusion(survivor, *member).await?;
    }
    self.remove(survivor).await?;
    tracing::info!(
      run = %self.run,
      survivor = survivor.0,
      members = members.len(),
      "tuple excluded as non-duplicate"
    );
    Ok(())
  }

  // ── Housekeeping ──────────────────────────────────────────────────────

  /// Drop working tables of runs older than `horizon`. The caller's own
  /// table is never dropped; names that fail to parse are reported and
  /// left alone.
  pub async fn reap_stale_runs(&self, horizon: Duration) -> Result<ReapReport> {
    let now = Utc::now();
    let own_table = self.table_name();
    let mut report = ReapReport::default();

    for table in self.store.list_tables(RUN_TABLE_PREFIX).await? {
      if table == own_table {
        report.skipped.push(table);
        continue;
      }
      match RunId::parse(&table[RUN_TABLE_PREFIX.len()..]) {
        Ok(run) if run.is_older_than(horizon, now) => {
          self.store.execute(&format!("DROP TABLE {table}")).await?;
          report.dropped.push(table);
        }
        Ok(_) => report.skipped.push(table),
        Err(_) => {
          tracing::warn!(
            table = %table,
            "unrecognised working table; please clean up manually"
          );
          report.unrecognised.push(table);
        }
      }
    }

    Ok(report)
  }
}

// ─── Query composition ───────────────────────────────────────────────────────

fn compose_discovery_sql(table: &str, parts: &QueryParts) -> String {
  let joins = parts.joins.join("\n     ");
  let predicates = if parts.predicates.is_empty() {
    "TRUE".to_string()
  } else {
    format!("({})", parts.predicates.join(")\n       AND ("))
  };
  let group_by = if parts.group_keys.is_empty() {
    String::new()
  } else {
    format!("GROUP BY {}", parts.group_keys.join(", "))
  };

  format!(
    "INSERT OR IGNORE INTO {table} (survivor_id, member_count, member_ids)
     SELECT
       MIN(record.id),
       COUNT(DISTINCT record.id) AS member_count,
       GROUP_CONCAT(DISTINCT record.id)
     FROM records record
     {joins}
     WHERE {predicates}
     {group_by}
     HAVING member_count > 1"
  )
}

#[cfg(test)]
mod sql_tests {
  use super::*;

  #[test]
  fn composed_query_ands_predicates_and_groups() {
    let mut parts = QueryParts::default();
    parts.predicates.push("record.kind = 'person'".into());
    MatchStrategy::EmailAddress.contribute(&mut parts);

    let sql = compose_discovery_sql("tmp_coalesce_x", &parts);
    assert!(sql.contains("INSERT OR IGNORE INTO tmp_coalesce_x"));
    assert!(sql.contains("JOIN emails email ON email.record_id = record.id"));
    assert!(sql.contains("(record.kind = 'person')"));
    assert!(sql.contains("AND (email.address != '')"));
    assert!(sql.contains("GROUP BY lower(email.address)"));
    assert!(sql.contains("HAVING member_count > 1"));
  }

  #[test]
  fn composed_query_without_strategies_has_no_group_by() {
    let sql = compose_discovery_sql("t", &QueryParts::default());
    assert!(sql.contains("WHERE TRUE"));
    assert!(!sql.contains("GROUP BY"));
  }
}
