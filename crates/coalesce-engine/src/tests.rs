//! Integration tests for the discovery and merge engines against an
//! in-memory SQLite backend.

use std::{
  collections::HashSet,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use chrono::Duration;

use coalesce_core::{
  Error,
  record::{
    CONFLICT_LABEL, ConflictReport, MergeMode, MergeOutcome, RecordId,
    RecordSnapshot, SqlRow, SubRecord,
  },
  run::RunId,
  store::EntityStore,
};
use coalesce_store_sqlite::{NewAddress, NewRecord, SqliteStore};

use crate::{
  CandidateSet, DiscoveryCriteria, FilterStrategy, MatchStrategy, MergeConfig,
  MergeSession, RUN_TABLE_PREFIX, RecordCache, SurvivorPicker,
};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory().await.expect("in-memory store")
}

fn person(given: &str, family: &str) -> NewRecord {
  NewRecord {
    given_name: Some(given.into()),
    family_name: Some(family.into()),
    ..NewRecord::default()
  }
}

async fn seed_pair(
  s: &SqliteStore,
  email: &str,
) -> (RecordId, RecordId) {
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Alice", "Liddell")).await.unwrap();
  s.add_email(a, email).await.unwrap();
  s.add_email(b, email).await.unwrap();
  (a, b)
}

fn session(s: &SqliteStore, config: MergeConfig) -> MergeSession<SqliteStore> {
  MergeSession::new(s.clone(), config).expect("merge session")
}

// ─── Harness store ───────────────────────────────────────────────────────────

/// Delegating wrapper used to count snapshot fetches and to simulate a merge
/// primitive that reports success without actually removing the member.
#[derive(Clone)]
struct HarnessStore {
  inner:        SqliteStore,
  fetch_calls:  Arc<AtomicUsize>,
  noop_members: Arc<Mutex<HashSet<i64>>>,
}

impl HarnessStore {
  fn new(inner: SqliteStore) -> Self {
    Self {
      inner,
      fetch_calls: Arc::new(AtomicUsize::new(0)),
      noop_members: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  fn fetches(&self) -> usize { self.fetch_calls.load(Ordering::SeqCst) }

  /// Make `merge_records` report success without mutating when absorbing
  /// this member, so post-merge verification fails.
  fn noop_merge_for(&self, member: RecordId) {
    self.noop_members.lock().unwrap().insert(member.0);
  }
}

impl EntityStore for HarnessStore {
  async fn execute(&self, sql: &str) -> coalesce_core::Result<usize> {
    self.inner.execute(sql).await
  }

  async fn query_rows(&self, sql: &str) -> coalesce_core::Result<Vec<SqlRow>> {
    self.inner.query_rows(sql).await
  }

  async fn query_scalar(&self, sql: &str) -> coalesce_core::Result<Option<i64>> {
    self.inner.query_scalar(sql).await
  }

  async fn list_tables(&self, prefix: &str) -> coalesce_core::Result<Vec<String>> {
    self.inner.list_tables(prefix).await
  }

  async fn begin(&self) -> coalesce_core::Result<()> { self.inner.begin().await }

  async fn commit(&self) -> coalesce_core::Result<()> {
    self.inner.commit().await
  }

  async fn rollback(&self) -> coalesce_core::Result<()> {
    self.inner.rollback().await
  }

  async fn fetch_records(
    &self,
    ids: &[RecordId],
    attributes: &[String],
    include_deleted: bool,
  ) -> coalesce_core::Result<Vec<RecordSnapshot>> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    self.inner.fetch_records(ids, attributes, include_deleted).await
  }

  async fn merge_records(
    &self,
    survivor: RecordId,
    member: RecordId,
    mode: MergeMode,
  ) -> coalesce_core::Result<MergeOutcome> {
    if self.noop_members.lock().unwrap().contains(&member.0) {
      return Ok(MergeOutcome::merged());
    }
    self.inner.merge_records(survivor, member, mode).await
  }

  async fn merge_conflicts(
    &self,
    survivor: RecordId,
    member: RecordId,
  ) -> coalesce_core::Result<ConflictReport> {
    self.inner.merge_conflicts(survivor, member).await
  }

  async fn list_subrecords(
    &self,
    record: RecordId,
  ) -> coalesce_core::Result<Vec<SubRecord>> {
    self.inner.list_subrecords(record).await
  }

  async fn update_subrecord(
    &self,
    subrecord: i64,
    label: &str,
    is_primary: bool,
  ) -> coalesce_core::Result<()> {
    self.inner.update_subrecord(subrecord, label, is_primary).await
  }

  async fn delete_subrecord(&self, subrecord: i64) -> coalesce_core::Result<()> {
    self.inner.delete_subrecord(subrecord).await
  }

  async fn create_note(
    &self,
    record: RecordId,
    subject: &str,
    body: &str,
  ) -> coalesce_core::Result<()> {
    self.inner.create_note(record, subject, body).await
  }

  async fn latest_activity(
    &self,
    record: RecordId,
    kind: &str,
    window: Duration,
  ) -> coalesce_core::Result<Option<i64>> {
    self.inner.latest_activity(record, kind, window).await
  }

  async fn append_activity_details(
    &self,
    activity: i64,
    details: &str,
  ) -> coalesce_core::Result<()> {
    self.inner.append_activity_details(activity, details).await
  }

  async fn add_exclusion(
    &self,
    a: RecordId,
    b: RecordId,
  ) -> coalesce_core::Result<()> {
    self.inner.add_exclusion(a, b).await
  }

  async fn is_excluded(
    &self,
    a: RecordId,
    b: RecordId,
  ) -> coalesce_core::Result<bool> {
    self.inner.is_excluded(a, b).await
  }
}

// ─── Discovery ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn discover_finds_email_duplicates() {
  let s = store().await;
  let (a, b) = seed_pair(&s, "alice@example.com").await;
  let lone = s.create_record(person("Bob", "Sole")).await.unwrap();
  s.add_email(lone, "bob@example.com").await.unwrap();

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  let inserted = set
    .discover(
      &DiscoveryCriteria::default(),
      &[MatchStrategy::EmailAddress],
      &[],
    )
    .await
    .unwrap();

  assert_eq!(inserted, 1);
  assert_eq!(set.count().await.unwrap(), 1);
  assert_eq!(set.total_members().await.unwrap(), 2);
  assert!(set.last_discovery_runtime().is_some());

  let tuples = set.tuples().await.unwrap();
  assert_eq!(tuples.len(), 1);
  assert!(tuples[0].is_consistent());
  assert_eq!(tuples[0].survivor, a.min(b));
  assert_eq!(tuples[0].members, vec![a.min(b), a.max(b)]);
  assert!(tuples[0].merged_count.is_none());
}

#[tokio::test]
async fn discover_is_idempotent() {
  let s = store().await;
  seed_pair(&s, "dup@example.com").await;

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  let criteria = DiscoveryCriteria::default();
  set
    .discover(&criteria, &[MatchStrategy::EmailAddress], &[])
    .await
    .unwrap();
  let before = set.tuples().await.unwrap();

  // Same data, same criteria: nothing changes for existing survivors.
  let inserted = set
    .discover(&criteria, &[MatchStrategy::EmailAddress], &[])
    .await
    .unwrap();
  assert_eq!(inserted, 0);
  assert_eq!(set.tuples().await.unwrap(), before);
}

#[tokio::test]
async fn discover_respects_record_kind_criteria() {
  let s = store().await;
  seed_pair(&s, "shared@example.com").await;

  let org = s
    .create_record(NewRecord { kind: "organization".into(), ..NewRecord::default() })
    .await
    .unwrap();
  s.add_email(org, "shared@example.com").await.unwrap();

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  set
    .discover(
      &DiscoveryCriteria { record_kind: Some("person".into()) },
      &[MatchStrategy::EmailAddress],
      &[],
    )
    .await
    .unwrap();

  let tuples = set.tuples().await.unwrap();
  assert_eq!(tuples.len(), 1);
  assert!(!tuples[0].members.contains(&org));
}

#[tokio::test]
async fn discover_ignores_deleted_records() {
  let s = store().await;
  let (a, _) = seed_pair(&s, "gone@example.com").await;
  s.execute(&format!("UPDATE records SET is_deleted = 1 WHERE id = {}", a.0))
    .await
    .unwrap();

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  set
    .discover(
      &DiscoveryCriteria::default(),
      &[MatchStrategy::EmailAddress],
      &[],
    )
    .await
    .unwrap();
  assert_eq!(set.count().await.unwrap(), 0);
}

#[tokio::test]
async fn cluster_size_limit_purges_oversized_tuples() {
  let s = store().await;
  for _ in 0..4 {
    let id = s.create_record(person("Many", "Copies")).await.unwrap();
    s.add_email(id, "many@example.com").await.unwrap();
  }

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  set
    .discover(
      &DiscoveryCriteria::default(),
      &[MatchStrategy::EmailAddress],
      &[FilterStrategy::ClusterSizeLimit(3)],
    )
    .await
    .unwrap();
  assert_eq!(set.count().await.unwrap(), 0);
}

// ─── Paging ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn page_returns_survivor_to_members_mapping() {
  let s = store().await;
  let set = CandidateSet::create(s.clone()).await.unwrap();
  s.execute(&format!(
    "INSERT INTO {} (survivor_id, member_count, member_ids)
     VALUES (5, 2, '5,7')",
    set.table_name()
  ))
  .await
  .unwrap();

  let page = set.page(1, 0, &[]).await.unwrap();
  assert_eq!(page, vec![(RecordId(5), vec![RecordId(7)])]);
}

#[tokio::test]
async fn page_pickers_override_stored_survivor() {
  let s = store().await;
  let set = CandidateSet::create(s.clone()).await.unwrap();
  s.execute(&format!(
    "INSERT INTO {} (survivor_id, member_count, member_ids)
     VALUES (5, 3, '5,7,9')",
    set.table_name()
  ))
  .await
  .unwrap();

  let page = set.page(10, 0, &[SurvivorPicker::HighestId]).await.unwrap();
  assert_eq!(page, vec![(RecordId(9), vec![RecordId(5), RecordId(7)])]);
}

#[tokio::test]
async fn page_applies_count_and_offset_in_storage_order() {
  let s = store().await;
  let set = CandidateSet::create(s.clone()).await.unwrap();
  for (survivor, members) in [(1, "1,2"), (5, "5,6"), (9, "9,10")] {
    s.execute(&format!(
      "INSERT INTO {} (survivor_id, member_count, member_ids)
       VALUES ({survivor}, 2, '{members}')",
      set.table_name()
    ))
    .await
    .unwrap();
  }

  let page = set.page(1, 1, &[]).await.unwrap();
  assert_eq!(page, vec![(RecordId(5), vec![RecordId(6)])]);
}

// ─── Tuple bookkeeping ───────────────────────────────────────────────────────

#[tokio::test]
async fn replace_recomputes_survivor_from_minimum() {
  let s = store().await;
  let set = CandidateSet::create(s.clone()).await.unwrap();
  s.execute(&format!(
    "INSERT INTO {} (survivor_id, member_count, member_ids)
     VALUES (5, 3, '5,7,9')",
    set.table_name()
  ))
  .await
  .unwrap();

  set.replace(RecordId(5), &[RecordId(9), RecordId(7)]).await.unwrap();

  let tuples = set.tuples().await.unwrap();
  assert_eq!(tuples.len(), 1);
  assert_eq!(tuples[0].survivor, RecordId(7));
  assert_eq!(tuples[0].members, vec![RecordId(7), RecordId(9)]);
  assert_eq!(tuples[0].member_count, 2);
  assert!(tuples[0].is_consistent());
}

#[tokio::test]
async fn remove_clear_and_merged_count() {
  let s = store().await;
  let set = CandidateSet::create(s.clone()).await.unwrap();
  for (survivor, members) in [(1, "1,2"), (5, "5,6,7")] {
    let count = members.split(',').count();
    s.execute(&format!(
      "INSERT INTO {} (survivor_id, member_count, member_ids)
       VALUES ({survivor}, {count}, '{members}')",
      set.table_name()
    ))
    .await
    .unwrap();
  }

  assert_eq!(set.count().await.unwrap(), 2);
  assert_eq!(set.total_members().await.unwrap(), 5);

  set.record_merge_outcome(RecordId(5), 2).await.unwrap();
  let tuples = set.tuples().await.unwrap();
  assert_eq!(
    tuples.iter().find(|t| t.survivor == RecordId(5)).unwrap().merged_count,
    Some(2)
  );

  set.remove(RecordId(1)).await.unwrap();
  assert_eq!(set.count().await.unwrap(), 1);

  set.clear().await.unwrap();
  assert_eq!(set.count().await.unwrap(), 0);
  assert_eq!(set.total_members().await.unwrap(), 0);
}

// ─── Exclusions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn excluded_tuples_are_persisted_and_purged_on_rediscovery() {
  let s = store().await;
  let (a, b) = seed_pair(&s, "notdup@example.com").await;

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  let criteria = DiscoveryCriteria::default();
  set
    .discover(&criteria, &[MatchStrategy::EmailAddress], &[])
    .await
    .unwrap();

  let page = set.page(1, 0, &[]).await.unwrap();
  let (survivor, members) = page[0].clone();
  set.exclude(survivor, &members).await.unwrap();

  assert!(s.is_excluded(a, b).await.unwrap());
  assert_eq!(set.count().await.unwrap(), 0);

  // A later pass re-inserts the cluster, then the filter purges it.
  set
    .discover(
      &criteria,
      &[MatchStrategy::EmailAddress],
      &[FilterStrategy::ExcludedPairs],
    )
    .await
    .unwrap();
  assert_eq!(set.count().await.unwrap(), 0);
}

// ─── Stale-run reaping ───────────────────────────────────────────────────────

#[tokio::test]
async fn reap_drops_only_wellformed_stale_tables() {
  let s = store().await;
  let stale = format!(
    "{RUN_TABLE_PREFIX}20200101120000_0123456789abcdef0123456789abcdef"
  );
  let fresh = format!(
    "{RUN_TABLE_PREFIX}{}",
    RunId::generate()
  );
  let malformed = format!("{RUN_TABLE_PREFIX}badname");
  for table in [&stale, &fresh, &malformed] {
    s.execute(&format!("CREATE TABLE {table} (x INTEGER)")).await.unwrap();
  }

  let set = CandidateSet::create(s.clone()).await.unwrap();
  let report = set.reap_stale_runs(Duration::days(2)).await.unwrap();

  assert_eq!(report.dropped, vec![stale.clone()]);
  assert_eq!(report.unrecognised, vec![malformed.clone()]);
  assert!(report.skipped.contains(&set.table_name()));
  assert!(report.skipped.contains(&fresh));

  let remaining = s.list_tables(RUN_TABLE_PREFIX).await.unwrap();
  assert!(!remaining.contains(&stale));
  assert!(remaining.contains(&malformed));
  assert!(remaining.contains(&set.table_name()));
}

// ─── Pair merge ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn merge_pair_absorbs_member_and_records_activity() {
  let s = store().await;
  let (a, b) = seed_pair(&s, "alice@example.com").await;
  s.add_email(b, "alice@other.example.com").await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  let (survivor, member) = (a.min(b), a.max(b));
  assert!(session.merge_pair(survivor, member, false).await.unwrap());

  // Member tombstoned, emails consolidated without duplicates.
  assert!(
    s.fetch_records(&[member], &[], false).await.unwrap().is_empty()
  );
  let email_count = s
    .query_scalar(&format!(
      "SELECT COUNT(*) FROM emails WHERE record_id = {}",
      survivor.0
    ))
    .await
    .unwrap();
  assert_eq!(email_count, Some(2));

  // The merge primitive left an auditable activity on the survivor.
  let activity = s
    .latest_activity(survivor, "merge", Duration::minutes(1))
    .await
    .unwrap();
  assert!(activity.is_some());

  let stats = session.finish();
  assert_eq!(stats.records_merged, 1);
  assert!(stats.errors.is_empty());
}

#[tokio::test]
async fn merge_pair_missing_member_is_nonfatal() {
  let s = store().await;
  let a = s.create_record(person("Only", "One")).await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  let merged = session.merge_pair(a, RecordId(9999), false).await.unwrap();

  assert!(!merged);
  assert!(
    session
      .details()
      .iter()
      .any(|d| d.contains("not found or deleted"))
  );
  // Abort happened before the transaction opened; no error entry yet.
  assert_eq!(session.stats().records_merged, 0);
}

#[tokio::test]
async fn merge_pair_conflicts_abort_without_force() {
  let s = store().await;
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Alice", "Hargreaves")).await.unwrap();
  s.add_email(a, "alice@example.com").await.unwrap();
  s.add_email(b, "alice@example.com").await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  assert!(!session.merge_pair(a, b, false).await.unwrap());

  // Both records untouched.
  assert_eq!(s.fetch_records(&[a, b], &[], false).await.unwrap().len(), 2);
  assert!(session.details().iter().any(|d| d.contains("family_name")));
  assert_eq!(session.stats().errors.len(), 1);
}

#[tokio::test]
async fn merge_pair_force_merges_past_conflicts() {
  let s = store().await;
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Alice", "Hargreaves")).await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  assert!(session.merge_pair(a, b, true).await.unwrap());

  // Aggressive mode keeps the survivor's value.
  let survivor = s
    .fetch_records(&[a], &["family_name".to_string()], false)
    .await
    .unwrap();
  assert_eq!(survivor[0].attribute("family_name"), Some("Liddell"));
  assert!(s.fetch_records(&[b], &[], false).await.unwrap().is_empty());
}

#[tokio::test]
async fn aborted_pair_rolls_back_resolver_mutations() {
  let s = store().await;
  // Scalar conflict forces an abort after the resolver has already bumped
  // the member's differing address.
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Alice", "Hargreaves")).await.unwrap();
  s.add_address(a, NewAddress {
    label: "home".into(),
    street: Some("1 Rabbit Hole".into()),
    ..NewAddress::default()
  })
  .await
  .unwrap();
  let address = s
    .add_address(b, NewAddress {
      label: "home".into(),
      street: Some("2 Looking Glass".into()),
      ..NewAddress::default()
    })
    .await
    .unwrap();

  let mut session = session(&s, MergeConfig {
    resolvers: vec!["address_conflicts".into()],
    ..MergeConfig::default()
  });
  assert!(!session.merge_pair(a, b, false).await.unwrap());

  // The bump to the conflict label was rolled back with everything else.
  let subs = s.list_subrecords(b).await.unwrap();
  assert_eq!(subs.len(), 1);
  assert_eq!(subs[0].id, address);
  assert_eq!(subs[0].label, "home");
}

// ─── Resolvers ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_resolver_name_is_fatal() {
  let s = store().await;
  let result = MergeSession::new(s, MergeConfig {
    resolvers: vec!["no_such_resolver".into()],
    ..MergeConfig::default()
  });
  assert!(matches!(result, Err(Error::UnknownResolver(_))));
}

#[tokio::test]
async fn same_kind_guard_blocks_mixed_kind_pairs() {
  let s = store().await;
  let a = s.create_record(person("Acme", "")).await.unwrap();
  let b = s
    .create_record(NewRecord { kind: "organization".into(), ..NewRecord::default() })
    .await
    .unwrap();

  let mut session = session(&s, MergeConfig {
    resolvers: vec!["same_kind".into()],
    ..MergeConfig::default()
  });
  assert!(!session.merge_pair(a, b, false).await.unwrap());
  assert!(
    session.stats().errors[0].contains("record kinds differ"),
    "got: {:?}",
    session.stats().errors
  );
  // Both still present.
  assert_eq!(s.fetch_records(&[a, b], &[], false).await.unwrap().len(), 2);
}

#[tokio::test]
async fn address_conflicts_resolver_dedupes_and_bumps() {
  let s = store().await;
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Alice", "Liddell")).await.unwrap();

  // Identical home address on both sides, differing work address.
  for record in [a, b] {
    s.add_address(record, NewAddress {
      label: "home".into(),
      street: Some("1 Rabbit Hole".into()),
      locality: Some("Oxford".into()),
      ..NewAddress::default()
    })
    .await
    .unwrap();
  }
  s.add_address(a, NewAddress {
    label: "work".into(),
    street: Some("10 University Rd".into()),
    ..NewAddress::default()
  })
  .await
  .unwrap();
  s.add_address(b, NewAddress {
    label: "work".into(),
    street: Some("99 Somewhere Else".into()),
    ..NewAddress::default()
  })
  .await
  .unwrap();

  let mut session = session(&s, MergeConfig {
    resolvers: vec!["address_conflicts".into()],
    ..MergeConfig::default()
  });
  assert!(session.merge_pair(a, b, false).await.unwrap());

  let labels: Vec<String> = s
    .list_subrecords(a)
    .await
    .unwrap()
    .into_iter()
    .map(|sub| sub.label)
    .collect();
  // One home (duplicate removed), the survivor's work, and the member's
  // differing work address parked on the conflict label.
  assert_eq!(labels.iter().filter(|l| *l == "home").count(), 1);
  assert_eq!(labels.iter().filter(|l| *l == "work").count(), 1);
  assert_eq!(labels.iter().filter(|l| *l == CONFLICT_LABEL).count(), 1);
  assert_eq!(session.stats().conflicts_resolved, 1);
}

// ─── Tuple merge ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn self_merge_fails_fast_without_store_access() {
  let s = store().await;
  let a = s.create_record(person("Solo", "Act")).await.unwrap();

  let harness = HarnessStore::new(s.clone());
  let mut session =
    MergeSession::new(harness.clone(), MergeConfig::default()).unwrap();

  let result = session.merge_tuple(a, &[RecordId(2), a]).await;
  assert!(matches!(result, Err(Error::SelfMerge(id)) if id == a));
  assert_eq!(harness.fetches(), 0);
}

#[tokio::test]
async fn deleted_survivor_aborts_whole_tuple() {
  let s = store().await;
  let (a, b) = seed_pair(&s, "dup@example.com").await;
  s.execute(&format!("UPDATE records SET is_deleted = 1 WHERE id = {}", a.0))
    .await
    .unwrap();

  let mut session = session(&s, MergeConfig::default());
  assert!(!session.merge_tuple(a, &[b]).await.unwrap());

  let stats = session.finish();
  assert_eq!(stats.tuples_merged, 0);
  assert_eq!(stats.errors.len(), 1);
  assert!(stats.errors[0].contains("is deleted"));
  // The member was never touched.
  assert_eq!(s.fetch_records(&[b], &[], false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn tuple_merge_succeeds_only_when_every_pair_does() {
  let s = store().await;
  let survivor = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let m1 = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let m2 = s.create_record(person("Alice", "Liddell")).await.unwrap();

  let harness = HarnessStore::new(s.clone());
  harness.noop_merge_for(m2);

  let set = CandidateSet::create(harness.clone()).await.unwrap();
  s.execute(&format!(
    "INSERT INTO {} (survivor_id, member_count, member_ids)
     VALUES ({}, 3, '{},{},{}')",
    set.table_name(),
    survivor.0,
    survivor.0,
    m1.0,
    m2.0
  ))
  .await
  .unwrap();

  let mut session =
    MergeSession::new(harness.clone(), MergeConfig::default()).unwrap();
  session
    .merge_candidates(&set, &[(survivor, vec![m1, m2])])
    .await
    .unwrap();

  let stats = session.finish();
  // m1 was absorbed; m2 survived its "merge" and failed verification.
  assert_eq!(stats.records_merged, 1);
  assert_eq!(stats.tuples_merged, 0);
  assert_eq!(stats.errors.len(), 1);
  assert!(stats.errors[0].contains("still exists"));
  assert_eq!(stats.failed.len(), 1);
  assert_eq!(stats.failed[0].survivor, survivor);

  // The tuple keeps its merged_count unset.
  let tuples = set.tuples().await.unwrap();
  assert_eq!(tuples[0].merged_count, None);
}

#[tokio::test]
async fn merge_candidates_records_merged_count_and_activity_details() {
  let s = store().await;
  let (a, b) = seed_pair(&s, "dup@example.com").await;

  let mut set = CandidateSet::create(s.clone()).await.unwrap();
  set
    .discover(
      &DiscoveryCriteria::default(),
      &[MatchStrategy::EmailAddress],
      &[],
    )
    .await
    .unwrap();
  let page = set.page(10, 0, &[]).await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  session.merge_candidates(&set, &page).await.unwrap();

  let stats = session.finish();
  assert_eq!(stats.tuples_merged, 1);

  let tuples = set.tuples().await.unwrap();
  assert_eq!(tuples[0].merged_count, Some(1));

  // The detail trail ended up on the survivor's merge activity.
  let survivor = a.min(b);
  let activity = s
    .latest_activity(survivor, "merge", Duration::minutes(1))
    .await
    .unwrap()
    .unwrap();
  let rows = s
    .query_rows(&format!(
      "SELECT details FROM activities WHERE id = {activity}"
    ))
    .await
    .unwrap();
  let details = rows[0][0].as_text().unwrap();
  assert!(details.contains("successfully merged"));
}

// ─── Record cache ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cache_loads_each_id_once_until_invalidated() {
  let s = store().await;
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();
  let b = s.create_record(person("Bob", "Builder")).await.unwrap();

  let harness = HarnessStore::new(s.clone());
  let mut cache = RecordCache::new(vec!["given_name".to_string()]);

  let loaded = cache.load(&harness, &[a, b]).await.unwrap();
  assert_eq!(loaded, vec![a, b]);
  assert_eq!(harness.fetches(), 1);

  // Already cached: no new fetch, and no implicit refresh.
  assert_eq!(cache.load(&harness, &[a]).await.unwrap(), vec![]);
  cache.get(&harness, a).await.unwrap().unwrap();
  assert_eq!(harness.fetches(), 1);

  s.execute(&format!(
    "UPDATE records SET given_name = 'Alicia' WHERE id = {}",
    a.0
  ))
  .await
  .unwrap();
  let stale = cache.get(&harness, a).await.unwrap().unwrap();
  assert_eq!(stale.attribute("given_name"), Some("Alice"));

  // Invalidation triggers exactly one fresh fetch on next access.
  cache.invalidate(a);
  let fresh = cache.get(&harness, a).await.unwrap().unwrap();
  assert_eq!(fresh.attribute("given_name"), Some("Alicia"));
  assert_eq!(harness.fetches(), 2);
}

#[tokio::test]
async fn cache_get_missing_record_returns_none() {
  let s = store().await;
  let mut cache = RecordCache::new(Vec::new());
  assert!(cache.get(&s, RecordId(424242)).await.unwrap().is_none());
}

// ─── Audit log and details ───────────────────────────────────────────────────

#[tokio::test]
async fn merge_log_appends_timestamped_lines() {
  let s = store().await;
  let path = std::env::temp_dir()
    .join(format!("coalesce-test-{}.log", RunId::generate()));

  let mut session = session(&s, MergeConfig {
    log_path: Some(path.clone()),
    ..MergeConfig::default()
  });
  session.log("hello from the batch");
  session.log_error("something went sideways");
  let stats = session.finish();

  let contents = std::fs::read_to_string(&path).unwrap();
  std::fs::remove_file(&path).ok();

  assert!(contents.contains("initialised merge session"));
  assert!(contents.contains("] hello from the batch"));
  assert!(contents.contains("] ERROR: something went sideways"));
  assert_eq!(stats.errors, vec!["something went sideways".to_string()]);
}

#[tokio::test]
async fn detail_note_is_written_to_survivor() {
  let s = store().await;
  let a = s.create_record(person("Alice", "Liddell")).await.unwrap();

  let mut session = session(&s, MergeConfig::default());
  session.add_detail("kept the Oxford address");
  session.create_detail_note(a, "Merge details").await.unwrap();

  let rows = s
    .query_rows(&format!("SELECT body FROM notes WHERE record_id = {}", a.0))
    .await
    .unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0][0].as_text(), Some("kept the Oxford address"));
}
