//! [`SqliteStore`] — the SQLite implementation of
//! [`coalesce_core::store::EntityStore`].

use std::{collections::BTreeMap, path::Path};

use chrono::{Duration, Utc};
use rusqlite::OptionalExtension as _;

use coalesce_core::{
  record::{
    CONFLICT_LABEL, ConflictReport, MergeMode, MergeOutcome, RecordId,
    RecordSnapshot, SqlRow, SqlValue, SubRecord,
  },
  store::{EntityStore, MERGE_ACTIVITY_KIND},
};

use crate::{Error, Result, schema::SCHEMA};

type CoreResult<T> = coalesce_core::Result<T>;

// ─── Input types ─────────────────────────────────────────────────────────────

/// Input to [`SqliteStore::create_record`].
#[derive(Debug, Clone)]
pub struct NewRecord {
  pub kind:        String,
  pub given_name:  Option<String>,
  pub family_name: Option<String>,
  pub birth_date:  Option<String>,
}

impl Default for NewRecord {
  fn default() -> Self {
    Self {
      kind:        "person".into(),
      given_name:  None,
      family_name: None,
      birth_date:  None,
    }
  }
}

/// Input to [`SqliteStore::add_address`].
#[derive(Debug, Clone, Default)]
pub struct NewAddress {
  pub label:       String,
  pub street:      Option<String>,
  pub locality:    Option<String>,
  pub postal_code: Option<String>,
  pub country:     Option<String>,
  pub is_primary:  bool,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An entity store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted. All clones
/// share one connection, which is what makes the raw `BEGIN`/`COMMIT`
/// transaction scope of the trait work: every statement issued between the
/// two runs inside the same scope.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Seeding helpers ───────────────────────────────────────────────────

  /// Insert a fresh record and return its id.
  pub async fn create_record(&self, input: NewRecord) -> Result<RecordId> {
    let now = now_string();
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO records
             (kind, created_at, modified_at, given_name, family_name, birth_date)
           VALUES (?1, ?2, ?2, ?3, ?4, ?5)",
          rusqlite::params![
            input.kind,
            now,
            input.given_name,
            input.family_name,
            input.birth_date,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(RecordId(id))
  }

  pub async fn add_email(
    &self,
    record: RecordId,
    address: &str,
  ) -> Result<i64> {
    let address = address.to_owned();
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO emails (record_id, address) VALUES (?1, ?2)",
          rusqlite::params![record.0, address],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(id)
  }

  pub async fn add_address(
    &self,
    record: RecordId,
    input: NewAddress,
  ) -> Result<i64> {
    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO postal_addresses
             (record_id, label, street, locality, postal_code, country, is_primary)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            record.0,
            input.label,
            input.street,
            input.locality,
            input.postal_code,
            input.country,
            input.is_primary,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;
    Ok(id)
  }
}

// ─── Column-level helpers (run on the connection thread) ─────────────────────

/// Scalar record fields covered by conflict detection and empty-filling.
const SCALAR_FIELDS: [&str; 3] = ["given_name", "family_name", "birth_date"];

/// Attribute-name to column mapping for snapshot projections. Acts as the
/// whitelist that keeps resolver-declared attribute names out of raw SQL.
fn attribute_column(name: &str) -> Option<&'static str> {
  match name {
    "given_name" => Some("given_name"),
    "family_name" => Some("family_name"),
    "birth_date" => Some("birth_date"),
    "created_at" => Some("created_at"),
    "modified_at" => Some("modified_at"),
    _ => None,
  }
}

struct RawRecord {
  is_deleted: bool,
  scalars:    BTreeMap<&'static str, Option<String>>,
}

fn load_raw(
  conn: &rusqlite::Connection,
  id: RecordId,
) -> rusqlite::Result<Option<RawRecord>> {
  conn
    .query_row(
      "SELECT is_deleted, given_name, family_name, birth_date
       FROM records WHERE id = ?1",
      rusqlite::params![id.0],
      |row| {
        let mut scalars = BTreeMap::new();
        for (idx, field) in SCALAR_FIELDS.iter().enumerate() {
          scalars.insert(*field, row.get::<_, Option<String>>(idx + 1)?);
        }
        Ok(RawRecord { is_deleted: row.get(0)?, scalars })
      },
    )
    .optional()
}

fn load_addresses(
  conn: &rusqlite::Connection,
  record: RecordId,
) -> rusqlite::Result<Vec<SubRecord>> {
  let mut stmt = conn.prepare(
    "SELECT id, record_id, label, street, locality, postal_code, country,
            is_primary
     FROM postal_addresses WHERE record_id = ?1 ORDER BY id",
  )?;
  let rows = stmt
    .query_map(rusqlite::params![record.0], |row| {
      let mut fields = BTreeMap::new();
      for (idx, name) in
        ["street", "locality", "postal_code", "country"].iter().enumerate()
      {
        if let Some(value) = row.get::<_, Option<String>>(idx + 3)? {
          fields.insert(name.to_string(), value);
        }
      }
      Ok(SubRecord {
        id: row.get(0)?,
        record_id: RecordId(row.get(1)?),
        label: row.get(2)?,
        is_primary: row.get(7)?,
        fields,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

fn is_blank(value: &Option<String>) -> bool {
  value.as_deref().is_none_or(str::is_empty)
}

/// The conflict report a safe-mode merge would refuse on: scalar fields
/// where both sides hold differing values, plus same-label postal addresses
/// with differing fields. Sub-records already parked on the conflict label
/// never count.
fn compute_conflicts(
  conn: &rusqlite::Connection,
  survivor: RecordId,
  member: RecordId,
) -> rusqlite::Result<ConflictReport> {
  let mut report = ConflictReport::default();

  let (Some(surv), Some(memb)) =
    (load_raw(conn, survivor)?, load_raw(conn, member)?)
  else {
    return Ok(report);
  };

  for field in SCALAR_FIELDS {
    let a = &surv.scalars[field];
    let b = &memb.scalars[field];
    if !is_blank(a) && !is_blank(b) && a != b {
      report.add(
        "record",
        field,
        format!(
          "{:?} vs {:?}",
          a.as_deref().unwrap_or(""),
          b.as_deref().unwrap_or("")
        ),
      );
    }
  }

  let surv_addresses = load_addresses(conn, survivor)?;
  for member_address in load_addresses(conn, member)? {
    if member_address.label == CONFLICT_LABEL {
      continue;
    }
    let clash = surv_addresses.iter().any(|a| {
      a.label == member_address.label && !a.fields_match(&member_address)
    });
    if clash {
      report.add(
        "postal_address",
        &member_address.label,
        "differing address with the same label",
      );
    }
  }

  Ok(report)
}

fn now_string() -> String { Utc::now().to_rfc3339() }

fn decode_cell(value: rusqlite::types::ValueRef<'_>) -> SqlValue {
  use rusqlite::types::ValueRef;
  match value {
    ValueRef::Null => SqlValue::Null,
    ValueRef::Integer(n) => SqlValue::Integer(n),
    ValueRef::Real(f) => SqlValue::Text(f.to_string()),
    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
    ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
  }
}

// ─── EntityStore impl ────────────────────────────────────────────────────────

impl EntityStore for SqliteStore {
  // ── Arbitrary statements ──────────────────────────────────────────────

  async fn execute(&self, sql: &str) -> CoreResult<usize> {
    let sql = sql.to_owned();
    let affected = self
      .conn
      .call(move |conn| Ok(conn.execute(&sql, [])?))
      .await
      .map_err(Error::Database)?;
    Ok(affected)
  }

  async fn query_rows(&self, sql: &str) -> CoreResult<Vec<SqlRow>> {
    let sql = sql.to_owned();
    let rows = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt.column_count();
        let rows = stmt
          .query_map([], |row| {
            let mut cells = Vec::with_capacity(columns);
            for idx in 0..columns {
              cells.push(decode_cell(row.get_ref(idx)?));
            }
            Ok(cells)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(Error::Database)?;
    Ok(rows)
  }

  async fn query_scalar(&self, sql: &str) -> CoreResult<Option<i64>> {
    let sql = sql.to_owned();
    let value = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(&sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten(),
        )
      })
      .await
      .map_err(Error::Database)?;
    Ok(value)
  }

  async fn list_tables(&self, prefix: &str) -> CoreResult<Vec<String>> {
    let prefix = prefix.to_owned();
    let names = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )?;
        let names = stmt
          .query_map([], |row| row.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        // LIKE treats '_' as a wildcard, so filter here instead.
        Ok(names.into_iter().filter(|n| n.starts_with(&prefix)).collect())
      })
      .await
      .map_err(Error::Database)?;
    Ok(names)
  }

  // ── Transaction scope ─────────────────────────────────────────────────

  async fn begin(&self) -> CoreResult<()> {
    self
      .conn
      .call(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  async fn commit(&self) -> CoreResult<()> {
    self
      .conn
      .call(|conn| Ok(conn.execute_batch("COMMIT")?))
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  async fn rollback(&self) -> CoreResult<()> {
    self
      .conn
      .call(|conn| Ok(conn.execute_batch("ROLLBACK")?))
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  // ── Records ───────────────────────────────────────────────────────────

  async fn fetch_records(
    &self,
    ids: &[RecordId],
    attributes: &[String],
    include_deleted: bool,
  ) -> CoreResult<Vec<RecordSnapshot>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    // Validate the projection before any SQL is assembled.
    let mut projection: Vec<(String, &'static str)> = Vec::new();
    for name in attributes {
      let column = attribute_column(name)
        .ok_or_else(|| Error::UnknownAttribute(name.clone()))?;
      if !projection.iter().any(|(n, _)| n == name) {
        projection.push((name.clone(), column));
      }
    }

    let id_list = ids
      .iter()
      .map(|id| id.0.to_string())
      .collect::<Vec<_>>()
      .join(",");
    let extra_columns = projection
      .iter()
      .map(|(_, col)| format!(", {col}"))
      .collect::<String>();
    let deleted_guard =
      if include_deleted { "" } else { " AND is_deleted = 0" };
    let sql = format!(
      "SELECT id, kind, is_deleted{extra_columns}
       FROM records WHERE id IN ({id_list}){deleted_guard}"
    );

    let snapshots = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map([], |row| {
            let mut snapshot = RecordSnapshot {
              id:         RecordId(row.get(0)?),
              kind:       row.get(1)?,
              is_deleted: row.get(2)?,
              attributes: BTreeMap::new(),
            };
            for (idx, (name, _)) in projection.iter().enumerate() {
              snapshot
                .attributes
                .insert(name.clone(), row.get::<_, Option<String>>(idx + 3)?);
            }
            Ok(snapshot)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(Error::Database)?;
    Ok(snapshots)
  }

  async fn merge_records(
    &self,
    survivor: RecordId,
    member: RecordId,
    mode: MergeMode,
  ) -> CoreResult<MergeOutcome> {
    let now = now_string();
    let outcome = self
      .conn
      .call(move |conn| {
        let Some(surv) = load_raw(conn, survivor)? else {
          return Ok(MergeOutcome::rejected(format!(
            "survivor record {survivor} does not exist"
          )));
        };
        if surv.is_deleted {
          return Ok(MergeOutcome::rejected(format!(
            "survivor record {survivor} is deleted"
          )));
        }
        let Some(memb) = load_raw(conn, member)? else {
          return Ok(MergeOutcome::rejected(format!(
            "member record {member} does not exist"
          )));
        };
        if memb.is_deleted {
          return Ok(MergeOutcome::rejected(format!(
            "member record {member} is already deleted"
          )));
        }

        let report = compute_conflicts(conn, survivor, member)?;
        if mode == MergeMode::Safe && !report.is_empty() {
          return Ok(MergeOutcome::rejected(format!(
            "refused in safe mode: {} field conflict(s)",
            report.describe().len()
          )));
        }

        // Fill the survivor's blank scalar fields from the member. In
        // aggressive mode conflicting values simply stay with the survivor.
        for field in SCALAR_FIELDS {
          if is_blank(&surv.scalars[field]) && !is_blank(&memb.scalars[field])
          {
            conn.execute(
              &format!("UPDATE records SET {field} = ?1 WHERE id = ?2"),
              rusqlite::params![memb.scalars[field], survivor.0],
            )?;
          }
        }

        // Re-parent sub-records. Emails the survivor already has (case
        // insensitive) are dropped rather than duplicated.
        conn.execute(
          "UPDATE emails SET record_id = ?1
           WHERE record_id = ?2
             AND NOT EXISTS (
               SELECT 1 FROM emails e2
               WHERE e2.record_id = ?1
                 AND lower(e2.address) = lower(emails.address))",
          rusqlite::params![survivor.0, member.0],
        )?;
        conn.execute(
          "DELETE FROM emails WHERE record_id = ?1",
          rusqlite::params![member.0],
        )?;
        for table in ["postal_addresses", "activities", "notes"] {
          conn.execute(
            &format!(
              "UPDATE {table} SET record_id = ?1 WHERE record_id = ?2"
            ),
            rusqlite::params![survivor.0, member.0],
          )?;
        }

        // Tombstone the member and leave an audit activity on the survivor.
        conn.execute(
          "UPDATE records SET is_deleted = 1, modified_at = ?1 WHERE id = ?2",
          rusqlite::params![now, member.0],
        )?;
        conn.execute(
          "INSERT INTO activities (record_id, kind, subject, details, created_at)
           VALUES (?1, ?2, ?3, '', ?4)",
          rusqlite::params![
            survivor.0,
            MERGE_ACTIVITY_KIND,
            format!("Merged record [{member}]"),
            now,
          ],
        )?;

        Ok(MergeOutcome::merged())
      })
      .await
      .map_err(Error::Database)?;
    Ok(outcome)
  }

  async fn merge_conflicts(
    &self,
    survivor: RecordId,
    member: RecordId,
  ) -> CoreResult<ConflictReport> {
    let report = self
      .conn
      .call(move |conn| Ok(compute_conflicts(conn, survivor, member)?))
      .await
      .map_err(Error::Database)?;
    Ok(report)
  }

  // ── Sub-records ───────────────────────────────────────────────────────

  async fn list_subrecords(
    &self,
    record: RecordId,
  ) -> CoreResult<Vec<SubRecord>> {
    let rows = self
      .conn
      .call(move |conn| Ok(load_addresses(conn, record)?))
      .await
      .map_err(Error::Database)?;
    Ok(rows)
  }

  async fn update_subrecord(
    &self,
    subrecord: i64,
    label: &str,
    is_primary: bool,
  ) -> CoreResult<()> {
    let label = label.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE postal_addresses SET label = ?2, is_primary = ?3
           WHERE id = ?1",
          rusqlite::params![subrecord, label, is_primary],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  async fn delete_subrecord(&self, subrecord: i64) -> CoreResult<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM postal_addresses WHERE id = ?1",
          rusqlite::params![subrecord],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  // ── Audit trail ───────────────────────────────────────────────────────

  async fn create_note(
    &self,
    record: RecordId,
    subject: &str,
    body: &str,
  ) -> CoreResult<()> {
    let subject = subject.to_owned();
    let body = body.to_owned();
    let now = now_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO notes (record_id, subject, body, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![record.0, subject, body, now],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  async fn latest_activity(
    &self,
    record: RecordId,
    kind: &str,
    window: Duration,
  ) -> CoreResult<Option<i64>> {
    let kind = kind.to_owned();
    let cutoff = (Utc::now() - window).to_rfc3339();
    let id = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT id FROM activities
               WHERE record_id = ?1 AND kind = ?2 AND created_at >= ?3
               ORDER BY id DESC LIMIT 1",
              rusqlite::params![record.0, kind, cutoff],
              |row| row.get::<_, i64>(0),
            )
            .optional()?,
        )
      })
      .await
      .map_err(Error::Database)?;
    Ok(id)
  }

  async fn append_activity_details(
    &self,
    activity: i64,
    details: &str,
  ) -> CoreResult<()> {
    let details = details.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE activities
           SET details = CASE
             WHEN details = '' THEN ?2
             ELSE details || char(10) || ?2
           END
           WHERE id = ?1",
          rusqlite::params![activity, details],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  // ── Non-duplicate exclusions ──────────────────────────────────────────

  async fn add_exclusion(&self, a: RecordId, b: RecordId) -> CoreResult<()> {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let now = now_string();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO exclusions (record_a, record_b, created_at)
           VALUES (?1, ?2, ?3)",
          rusqlite::params![low.0, high.0, now],
        )?;
        Ok(())
      })
      .await
      .map_err(Error::Database)?;
    Ok(())
  }

  async fn is_excluded(&self, a: RecordId, b: RecordId) -> CoreResult<bool> {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let found = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM exclusions WHERE record_a = ?1 AND record_b = ?2",
              rusqlite::params![low.0, high.0],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await
      .map_err(Error::Database)?;
    Ok(found)
  }
}
