//! [`MergeSession`] — the actual merge process.
//!
//! One session covers one batch of tuple merges. Each pairwise merge is the
//! atomic unit of work: resolvers run, conflicts are checked, the store's
//! merge primitive fires, and the result is verified, all inside one
//! transaction scope. Any abort rolls the scope back and is recorded in the
//! session statistics; partial success across a batch is the expected
//! normal outcome, not an exceptional one.

use std::{
  fs::{File, OpenOptions},
  io::{BufWriter, Write as _},
  path::{Path, PathBuf},
};

use chrono::{Duration, Utc};

use coalesce_core::{
  Error, Result,
  record::{MergeMode, RecordId},
  stats::{MergeStats, MergeSummary},
  store::{EntityStore, MERGE_ACTIVITY_KIND},
  tuple::CandidateTuple,
};

use crate::{
  cache::RecordCache,
  candidates::CandidateSet,
  resolver::{ResolverContext, ResolverKind},
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Parameters for one merge session.
#[derive(Debug, Clone, Default)]
pub struct MergeConfig {
  /// Resolver names, applied in order. Unknown names are a fatal
  /// configuration error.
  pub resolvers:   Vec<String>,
  /// Continue past recoverable conflicts instead of aborting the pair.
  pub force_merge: bool,
  /// Append-mode audit log file; absent means log lines go to tracing.
  pub log_path:    Option<PathBuf>,
}

// ─── Audit log ───────────────────────────────────────────────────────────────

/// Line-oriented audit sink. With no file configured, lines are emitted on
/// the diagnostic channel instead so they are never silently lost.
struct MergeLog {
  sink: Option<BufWriter<File>>,
}

impl MergeLog {
  fn open(path: Option<&Path>) -> Result<Self> {
    let sink = path
      .map(|p| OpenOptions::new().create(true).append(true).open(p))
      .transpose()?
      .map(BufWriter::new);
    Ok(Self { sink })
  }

  fn write(&mut self, message: &str) {
    match &mut self.sink {
      Some(sink) => {
        let line =
          format!("[{}] {message}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(error) = sink.write_all(line.as_bytes()) {
          tracing::warn!(%error, "merge log write failed");
        }
      }
      None => tracing::info!(target: "coalesce::merge", "{message}"),
    }
  }

  fn flush(&mut self) {
    if let Some(sink) = &mut self.sink {
      if let Err(error) = sink.flush() {
        tracing::warn!(%error, "merge log flush failed");
      }
    }
  }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Executes tuple merges with resolver-mediated conflict handling,
/// transactional safety, and statistics/audit output.
pub struct MergeSession<S> {
  store:       S,
  resolvers:   Vec<ResolverKind>,
  force_merge: bool,
  stats:       MergeStats,
  log:         MergeLog,
  details:     Vec<String>,
  cache:       RecordCache,
}

impl<S: EntityStore> MergeSession<S> {
  pub fn new(store: S, config: MergeConfig) -> Result<Self> {
    let mut resolvers = Vec::new();
    let mut attributes: Vec<String> = Vec::new();
    for name in &config.resolvers {
      let name = name.trim();
      if name.is_empty() {
        continue;
      }
      let kind = ResolverKind::from_name(name).inspect_err(
        |error| tracing::error!(%error, "merge session configuration rejected"),
      )?;
      if !resolvers.contains(&kind) {
        resolvers.push(kind);
      }
      for attribute in kind.required_attributes() {
        if !attributes.iter().any(|a| a == attribute) {
          attributes.push((*attribute).to_string());
        }
      }
    }

    let mut log = MergeLog::open(config.log_path.as_deref())?;
    log.write(&format!(
      "initialised merge session: resolvers=[{}] force_merge={}",
      resolvers.iter().map(|r| r.name()).collect::<Vec<_>>().join(","),
      config.force_merge
    ));

    Ok(Self {
      store,
      resolvers,
      force_merge: config.force_merge,
      stats: MergeStats::default(),
      log,
      details: Vec::new(),
      cache: RecordCache::new(attributes),
    })
  }

  // ── Statistics and logging ────────────────────────────────────────────

  pub fn stats(&self) -> &MergeStats { &self.stats }

  pub fn summary(&self) -> MergeSummary { self.stats.summary() }

  /// Mark the whole batch as aborted for `reason`.
  pub fn set_aborted(&mut self, reason: impl Into<String>) {
    self.stats.aborted = Some(reason.into());
  }

  /// Append a timestamped line to the audit sink.
  pub fn log(&mut self, message: &str) { self.log.write(message); }

  /// Log an error line and record it in the statistics' error list.
  pub fn log_error(&mut self, message: impl Into<String>) {
    let message = message.into();
    self.log.write(&format!("ERROR: {message}"));
    self.stats.record_error(message);
  }

  /// Flush the audit sink and hand back the accumulated statistics.
  pub fn finish(mut self) -> MergeStats {
    self.log.flush();
    self.stats
  }

  // ── Merge details ─────────────────────────────────────────────────────

  pub fn details(&self) -> &[String] { &self.details }

  pub fn reset_details(&mut self) { self.details.clear(); }

  pub fn add_detail(&mut self, detail: impl Into<String>) {
    self.details.push(detail.into());
  }

  /// Write the current detail stack as a note attached to `record`.
  pub async fn create_detail_note(
    &mut self,
    record: RecordId,
    subject: &str,
  ) -> Result<()> {
    if self.details.is_empty() {
      return Ok(());
    }
    let body = self.details.join("\n");
    self.store.create_note(record, subject, &body).await
  }

  /// Append the current detail stack to the most recent merge activity on
  /// `record`. `Ok(false)` means no recent merge activity was found.
  pub async fn update_merge_activity(
    &mut self,
    record: RecordId,
  ) -> Result<bool> {
    if self.details.is_empty() {
      return Ok(true);
    }
    let Some(activity) = self
      .store
      .latest_activity(record, MERGE_ACTIVITY_KIND, Duration::minutes(1))
      .await?
    else {
      return Ok(false);
    };
    let details = self.details.join("\n");
    self.store.append_activity_details(activity, &details).await?;
    Ok(true)
  }

  // ── Tuple merge ───────────────────────────────────────────────────────

  /// Merge every member into the survivor, one pair at a time. The tuple
  /// counts as merged only if every pairwise merge succeeded.
  ///
  /// A survivor that appears in its own member list is a programming
  /// error, not a data condition, and fails fast before any store access.
  pub async fn merge_tuple(
    &mut self,
    survivor: RecordId,
    members: &[RecordId],
  ) -> Result<bool> {
    if members.contains(&survivor) {
      return Err(Error::SelfMerge(survivor));
    }

    self.log(&format!(
      "merging into record [{survivor}]: [{}]",
      CandidateTuple::encode_members(members)
    ));

    let mut involved = members.to_vec();
    involved.push(survivor);
    self.cache.load(&self.store, &involved).await?;

    match self.cache.get(&self.store, survivor).await? {
      None => {
        self.log_error(format!("survivor record [{survivor}] not found"));
        return Ok(false);
      }
      Some(snapshot) if snapshot.is_deleted => {
        self.log_error(format!(
          "survivor record [{survivor}] is deleted; refusing to merge into it"
        ));
        return Ok(false);
      }
      Some(_) => {}
    }

    let mut all_merged = true;
    for member in members {
      all_merged &=
        self.merge_pair(survivor, *member, self.force_merge).await?;
    }

    if all_merged {
      self.stats.tuples_merged += 1;
    } else {
      self.stats.record_failure(survivor, members);
    }
    Ok(all_merged)
  }

  // ── Pair merge ────────────────────────────────────────────────────────

  /// The atomic unit of work. Returns `Ok(false)` on any per-pair abort;
  /// every abort after the transaction opens rolls the scope back first.
  pub async fn merge_pair(
    &mut self,
    survivor: RecordId,
    member: RecordId,
    force_merge: bool,
  ) -> Result<bool> {
    // Fresh reads straight from the store, filtered to non-deleted. A
    // missing record here is a normal empty-result condition (e.g. a
    // concurrent operator already merged it).
    let fresh =
      self.store.fetch_records(&[survivor, member], &[], false).await?;
    if !fresh.iter().any(|r| r.id == survivor) {
      self
        .add_detail(format!("survivor record [{survivor}] not found or deleted"));
      return Ok(false);
    }
    if !fresh.iter().any(|r| r.id == member) {
      self.add_detail(format!("member record [{member}] not found or deleted"));
      return Ok(false);
    }

    self.store.begin().await?;
    match self.attempt_pair(survivor, member, force_merge).await {
      Ok(()) => {
        self.store.commit().await?;
        self.add_detail(format!(
          "successfully merged record [{member}] into [{survivor}]"
        ));
        self.stats.records_merged += 1;
        Ok(true)
      }
      Err(failure) => {
        self.store.rollback().await?;
        self.add_detail(format!(
          "ERROR: merge of [{member}] into [{survivor}] failed: {failure}"
        ));
        self.log_error(failure.to_string());
        Ok(false)
      }
    }
  }

  /// Steps 3 to 7 of the pair merge, inside the open transaction scope.
  /// Any `Err` aborts the pair; the caller rolls back.
  async fn attempt_pair(
    &mut self,
    survivor: RecordId,
    member: RecordId,
    force_merge: bool,
  ) -> Result<()> {
    // Pre-merge resolvers, in registration order.
    for resolver in self.resolvers.clone() {
      let outcome = {
        let mut cx = ResolverContext {
          store:   &self.store,
          cache:   &mut self.cache,
          details: &mut self.details,
        };
        resolver.resolve(&mut cx, survivor, &[member]).await
      };
      match outcome {
        Ok(true) => self.stats.conflicts_resolved += 1,
        Ok(false) => {}
        Err(failure) => {
          self.details.push(format!(
            "ERROR: resolver {} failed: {failure}",
            resolver.name()
          ));
          tracing::warn!(
            resolver = resolver.name(),
            error = %failure,
            "pre-merge resolver failed"
          );
          if !force_merge {
            return Err(failure);
          }
        }
      }
    }

    // Conflict report. A failing check is only survivable under force.
    match self.store.merge_conflicts(survivor, member).await {
      Ok(report) => {
        if !report.is_empty() {
          self.details.push("found conflicts before merge:".to_string());
          for line in report.describe() {
            self.details.push(line);
          }
          if !force_merge {
            return Err(Error::MergeConflicts { survivor, member });
          }
        }
      }
      Err(failure) => {
        self
          .details
          .push(format!("WARNING: could not check for conflicts: {failure}"));
        tracing::warn!(error = %failure, "conflict check failed");
        if !force_merge {
          return Err(failure);
        }
      }
    }

    // The merge primitive itself.
    let mode =
      if force_merge { MergeMode::Aggressive } else { MergeMode::Safe };
    let outcome = self.store.merge_records(survivor, member, mode).await?;
    if !outcome.merged {
      return Err(Error::MergeRejected(
        outcome.error.unwrap_or_else(|| "unspecified merge error".into()),
      ));
    }
    self.cache.invalidate(survivor);
    self.cache.invalidate(member);

    // Verify the member is actually gone.
    let still_there =
      self.store.fetch_records(&[member], &[], false).await?;
    if !still_there.is_empty() {
      self.details.push(format!(
        "WARNING: member record [{member}] still exists after merge"
      ));
      tracing::warn!(member = member.0, "merge verification failed");
      if !force_merge {
        return Err(Error::VerificationFailed(member));
      }
    }

    // Post-merge resolvers are best-effort cleanup.
    for resolver in self.resolvers.clone() {
      let outcome = {
        let mut cx = ResolverContext {
          store:   &self.store,
          cache:   &mut self.cache,
          details: &mut self.details,
        };
        resolver.post_process(&mut cx, survivor).await
      };
      if let Err(failure) = outcome {
        self.details.push(format!(
          "WARNING: post-process for resolver {} failed: {failure}",
          resolver.name()
        ));
        tracing::warn!(
          resolver = resolver.name(),
          error = %failure,
          "post-merge resolver failed"
        );
      }
    }

    Ok(())
  }

  // ── Batch driving ─────────────────────────────────────────────────────

  /// Merge a page of tuples, recording each fully-successful tuple's
  /// merged count on the candidate set and attaching the detail trail to
  /// the survivor's merge activity (best effort).
  pub async fn merge_candidates(
    &mut self,
    set: &CandidateSet<S>,
    tuples: &[(RecordId, Vec<RecordId>)],
  ) -> Result<()> {
    for (survivor, members) in tuples {
      self.reset_details();
      let merged = self.merge_tuple(*survivor, members).await?;
      if merged {
        set.record_merge_outcome(*survivor, members.len() as u32).await?;
        if let Err(error) = self.update_merge_activity(*survivor).await {
          tracing::warn!(
            %error,
            survivor = survivor.0,
            "could not attach merge details to activity"
          );
        }
      }
    }
    Ok(())
  }
}
