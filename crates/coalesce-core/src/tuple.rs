//! Candidate tuples: one discovered cluster of duplicate records.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, record::RecordId};

/// One row of a discovery run's working table.
///
/// Invariants: the survivor is always one of the members, and
/// `member_count` equals the member list length. Once `merged_count` is
/// set the tuple is immutable except for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTuple {
  /// Cluster representative; the lowest member id unless replaced.
  pub survivor:     RecordId,
  pub member_count: u32,
  /// All record ids in the cluster, survivor included, sorted ascending.
  pub members:      Vec<RecordId>,
  /// Number of members actually absorbed, set once a merge attempt
  /// completes.
  pub merged_count: Option<u32>,
}

impl CandidateTuple {
  pub fn is_consistent(&self) -> bool {
    self.members.contains(&self.survivor)
      && self.member_count as usize == self.members.len()
  }

  /// Decode the comma-separated member-id column. The result is sorted and
  /// de-duplicated, which is what makes "ordered set" a read-side
  /// guarantee regardless of aggregation order in the store.
  pub fn decode_members(raw: &str) -> Result<Vec<RecordId>> {
    let mut members = Vec::new();
    for part in raw.split(',') {
      let part = part.trim();
      if part.is_empty() {
        continue;
      }
      let id: i64 = part
        .parse()
        .map_err(|_| Error::MalformedTuple(format!("bad member id {part:?}")))?;
      members.push(RecordId(id));
    }
    if members.is_empty() {
      return Err(Error::MalformedTuple("empty member list".into()));
    }
    members.sort_unstable();
    members.dedup();
    Ok(members)
  }

  pub fn encode_members(members: &[RecordId]) -> String {
    members
      .iter()
      .map(|id| id.0.to_string())
      .collect::<Vec<_>>()
      .join(",")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decode_sorts_and_dedups() {
    let members = CandidateTuple::decode_members("12, 7,7,3").unwrap();
    assert_eq!(members, vec![RecordId(3), RecordId(7), RecordId(12)]);
  }

  #[test]
  fn decode_rejects_garbage() {
    assert!(matches!(
      CandidateTuple::decode_members("1,x,3"),
      Err(Error::MalformedTuple(_))
    ));
    assert!(matches!(
      CandidateTuple::decode_members(""),
      Err(Error::MalformedTuple(_))
    ));
  }

  #[test]
  fn encode_round_trips() {
    let members = vec![RecordId(3), RecordId(7), RecordId(12)];
    let encoded = CandidateTuple::encode_members(&members);
    assert_eq!(encoded, "3,7,12");
    assert_eq!(CandidateTuple::decode_members(&encoded).unwrap(), members);
  }

  #[test]
  fn consistency_invariants() {
    let tuple = CandidateTuple {
      survivor:     RecordId(3),
      member_count: 2,
      members:      vec![RecordId(3), RecordId(7)],
      merged_count: None,
    };
    assert!(tuple.is_consistent());

    let survivor_missing =
      CandidateTuple { survivor: RecordId(9), ..tuple.clone() };
    assert!(!survivor_missing.is_consistent());

    let wrong_count = CandidateTuple { member_count: 3, ..tuple };
    assert!(!wrong_count.is_consistent());
  }
}
