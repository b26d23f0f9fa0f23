//! Merge-session statistics.
//!
//! The raw form keeps every failure message verbatim (duplicates included);
//! the summary collapses errors into message frequencies and failed tuples
//! into a count, which is what operators usually want to read after a batch.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::record::RecordId;

/// A tuple whose merge did not fully succeed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTuple {
  pub survivor: RecordId,
  pub members:  Vec<RecordId>,
}

/// Running statistics for one merge session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeStats {
  /// Tuples where every pairwise merge succeeded.
  pub tuples_merged:      u32,
  /// Individual records absorbed into a survivor.
  pub records_merged:     u32,
  /// Resolver invocations that reported a change.
  pub conflicts_resolved: u32,
  /// Reason the batch was aborted early, if it was.
  pub aborted:            Option<String>,
  /// Every failure message, in occurrence order, duplicates kept.
  pub errors:             Vec<String>,
  pub failed:             Vec<FailedTuple>,
}

impl MergeStats {
  pub fn record_error(&mut self, message: impl Into<String>) {
    self.errors.push(message.into());
  }

  pub fn record_failure(&mut self, survivor: RecordId, members: &[RecordId]) {
    self
      .failed
      .push(FailedTuple { survivor, members: members.to_vec() });
  }

  pub fn summary(&self) -> MergeSummary {
    let mut errors: BTreeMap<String, u32> = BTreeMap::new();
    for message in &self.errors {
      *errors.entry(message.clone()).or_default() += 1;
    }

    MergeSummary {
      tuples_merged:      self.tuples_merged,
      records_merged:     self.records_merged,
      conflicts_resolved: self.conflicts_resolved,
      aborted:            self.aborted.clone(),
      errors,
      failed:             self.failed.len(),
    }
  }
}

/// Aggregated view of [`MergeStats`].
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
  pub tuples_merged:      u32,
  pub records_merged:     u32,
  pub conflicts_resolved: u32,
  pub aborted:            Option<String>,
  /// Failure message frequencies.
  pub errors:             BTreeMap<String, u32>,
  /// Number of failed tuples.
  pub failed:             usize,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn summary_collapses_errors_and_failures() {
    let mut stats = MergeStats::default();
    stats.record_error("member missing");
    stats.record_error("conflicts found");
    stats.record_error("member missing");
    stats.record_failure(RecordId(5), &[RecordId(7), RecordId(9)]);

    assert_eq!(stats.errors.len(), 3);

    let summary = stats.summary();
    assert_eq!(summary.errors.get("member missing"), Some(&2));
    assert_eq!(summary.errors.get("conflicts found"), Some(&1));
    assert_eq!(summary.failed, 1);
  }
}
