//! The `EntityStore` trait: everything the discovery and merge engines need
//! from the underlying relational record store.
//!
//! The trait is implemented by storage backends (e.g.
//! `coalesce-store-sqlite`). Engine code depends on this abstraction, not on
//! any concrete backend. It has three faces:
//!
//! - an arbitrary-statement surface, because the discovery working set lives
//!   in dynamically named tables inside the same database as the records;
//! - a transaction scope, which gives the merge engine its per-pair
//!   atomicity guarantee;
//! - the entity API proper: snapshot fetches, the merge primitive and its
//!   conflict report, sub-record access for resolvers, and the audit-trail
//!   hooks (notes, activities, non-duplicate exclusions).

use chrono::Duration;

use crate::{
  Result,
  record::{
    ConflictReport, MergeMode, MergeOutcome, RecordId, RecordSnapshot, SqlRow,
    SubRecord,
  },
};

/// Activity kind written by the merge primitive when a member is absorbed.
/// The merge engine locates these rows to attach its detail trail.
pub const MERGE_ACTIVITY_KIND: &str = "merge";

/// Abstraction over the relational store holding both the entity records and
/// the discovery working tables.
///
/// Implementations map their own failures into [`crate::Error::Store`];
/// every operation propagates failures to the caller, with no retry at this
/// layer.
pub trait EntityStore {
  // ── Arbitrary statements ──────────────────────────────────────────────

  /// Execute one write statement; returns the number of affected rows.
  async fn execute(&self, sql: &str) -> Result<usize>;

  /// Execute one read statement and return every row.
  async fn query_rows(&self, sql: &str) -> Result<Vec<SqlRow>>;

  /// Execute one read statement expected to yield a single integer cell.
  /// `None` when the statement yields no row or a NULL cell.
  async fn query_scalar(&self, sql: &str) -> Result<Option<i64>>;

  /// Names of all tables whose name starts with `prefix`.
  async fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;

  // ── Transaction scope ─────────────────────────────────────────────────

  /// Open a transaction scope. Scopes do not nest.
  async fn begin(&self) -> Result<()>;

  async fn commit(&self) -> Result<()>;

  async fn rollback(&self) -> Result<()>;

  // ── Records ───────────────────────────────────────────────────────────

  /// Fetch snapshots for `ids` in one batch, projected to the baseline
  /// attributes plus `attributes`. Records that do not exist are simply
  /// absent from the result; with `include_deleted` false, tombstoned
  /// records are absent too.
  async fn fetch_records(
    &self,
    ids: &[RecordId],
    attributes: &[String],
    include_deleted: bool,
  ) -> Result<Vec<RecordSnapshot>>;

  /// The merge primitive. Runs inside the caller's open transaction scope;
  /// a refused merge is reported through [`MergeOutcome::error`], not as an
  /// `Err`.
  async fn merge_records(
    &self,
    survivor: RecordId,
    member: RecordId,
    mode: MergeMode,
  ) -> Result<MergeOutcome>;

  /// Field-level conflicts that a [`MergeMode::Safe`] merge would refuse
  /// on.
  async fn merge_conflicts(
    &self,
    survivor: RecordId,
    member: RecordId,
  ) -> Result<ConflictReport>;

  // ── Sub-records ───────────────────────────────────────────────────────

  async fn list_subrecords(&self, record: RecordId) -> Result<Vec<SubRecord>>;

  /// Reassign a sub-record's label, preserving or updating its primary
  /// flag.
  async fn update_subrecord(
    &self,
    subrecord: i64,
    label: &str,
    is_primary: bool,
  ) -> Result<()>;

  async fn delete_subrecord(&self, subrecord: i64) -> Result<()>;

  // ── Audit trail ───────────────────────────────────────────────────────

  /// Attach a free-text note to a record.
  async fn create_note(
    &self,
    record: RecordId,
    subject: &str,
    body: &str,
  ) -> Result<()>;

  /// The most recent activity of `kind` associated with `record`, by
  /// highest activity id, restricted to activities created within `window`
  /// of now.
  async fn latest_activity(
    &self,
    record: RecordId,
    kind: &str,
    window: Duration,
  ) -> Result<Option<i64>>;

  /// Append text to an activity's detail field.
  async fn append_activity_details(
    &self,
    activity: i64,
    details: &str,
  ) -> Result<()>;

  // ── Non-duplicate exclusions ──────────────────────────────────────────

  /// Persist that `a` and `b` are known not to be duplicates of each
  /// other. The pair is unordered; storing it twice is harmless.
  async fn add_exclusion(&self, a: RecordId, b: RecordId) -> Result<()>;

  async fn is_excluded(&self, a: RecordId, b: RecordId) -> Result<bool>;
}
