//! Discovery-run identifiers.
//!
//! A run identifier embeds a sortable UTC timestamp plus a random
//! disambiguator, so concurrently started runs never collide and stale runs
//! can be aged out by parsing the name alone.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, Timelike as _, Utc};
use uuid::Uuid;

use crate::{Error, Result};

/// How long a finished run's working table is kept around before it becomes
/// eligible for cleanup.
pub fn default_retention() -> Duration { Duration::days(2) }

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Identifier of one discovery run: `<14-digit UTC stamp>_<32 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId {
  stamp:  NaiveDateTime,
  suffix: String,
}

impl RunId {
  /// A fresh identifier stamped with the current time.
  pub fn generate() -> Self {
    let now = Utc::now().naive_utc();
    // The stamp format carries second precision only; truncate so
    // Display/parse round-trip exactly.
    let stamp = now.with_nanosecond(0).unwrap_or(now);

    Self {
      stamp,
      suffix: Uuid::new_v4().simple().to_string(),
    }
  }

  /// Parse an identifier previously produced by [`RunId::generate`].
  ///
  /// Anything that does not match the exact shape is rejected; callers that
  /// enumerate storage must treat that as a report-only condition.
  pub fn parse(raw: &str) -> Result<Self> {
    let malformed = || Error::MalformedRunId(raw.to_string());

    let (date_part, suffix) = raw.split_once('_').ok_or_else(malformed)?;
    if date_part.len() != 14
      || !date_part.bytes().all(|b| b.is_ascii_digit())
    {
      return Err(malformed());
    }
    if suffix.len() != 32
      || !suffix
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
      return Err(malformed());
    }

    let stamp = NaiveDateTime::parse_from_str(date_part, STAMP_FORMAT)
      .map_err(|_| malformed())?;

    Ok(Self { stamp, suffix: suffix.to_string() })
  }

  /// The moment this run was started.
  pub fn timestamp(&self) -> DateTime<Utc> { self.stamp.and_utc() }

  /// Whether this run's stamp lies beyond the retention horizon.
  pub fn is_older_than(&self, horizon: Duration, now: DateTime<Utc>) -> bool {
    self.timestamp() < now - horizon
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}_{}", self.stamp.format(STAMP_FORMAT), self.suffix)
  }
}
