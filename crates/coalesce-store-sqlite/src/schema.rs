//! SQL schema for the coalesce SQLite store.
//!
//! Discovery working tables (`tmp_coalesce_*`) are created dynamically per
//! run and are not part of this baseline schema.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY,
    kind        TEXT NOT NULL DEFAULT 'person',  -- 'person' | 'organization'
    is_deleted  INTEGER NOT NULL DEFAULT 0,      -- tombstone; merged-away members end up here
    created_at  TEXT NOT NULL,                   -- ISO 8601 UTC
    modified_at TEXT NOT NULL,
    given_name  TEXT,
    family_name TEXT,
    birth_date  TEXT                             -- ISO 8601 date
);

CREATE TABLE IF NOT EXISTS emails (
    id          INTEGER PRIMARY KEY,
    record_id   INTEGER NOT NULL REFERENCES records(id),
    address     TEXT NOT NULL,
    is_primary  INTEGER NOT NULL DEFAULT 0
);

-- Sub-records in the engine's sense: labelled dependent rows that resolvers
-- may relabel (to the conflict marker) or delete.
CREATE TABLE IF NOT EXISTS postal_addresses (
    id          INTEGER PRIMARY KEY,
    record_id   INTEGER NOT NULL REFERENCES records(id),
    label       TEXT NOT NULL,                   -- 'home' | 'work' | ... | 'conflict'
    street      TEXT,
    locality    TEXT,
    postal_code TEXT,
    country     TEXT,
    is_primary  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS activities (
    id          INTEGER PRIMARY KEY,
    record_id   INTEGER NOT NULL REFERENCES records(id),
    kind        TEXT NOT NULL,                   -- 'merge' rows are written by the merge primitive
    subject     TEXT,
    details     TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notes (
    id          INTEGER PRIMARY KEY,
    record_id   INTEGER NOT NULL REFERENCES records(id),
    subject     TEXT,
    body        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

-- Operator-confirmed non-duplicates. Pairs are stored order-normalised
-- (record_a < record_b).
CREATE TABLE IF NOT EXISTS exclusions (
    record_a    INTEGER NOT NULL,
    record_b    INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (record_a, record_b)
);

CREATE INDEX IF NOT EXISTS emails_record_idx    ON emails(record_id);
CREATE INDEX IF NOT EXISTS addresses_record_idx ON postal_addresses(record_id);
CREATE INDEX IF NOT EXISTS activities_record_idx ON activities(record_id, kind);
CREATE INDEX IF NOT EXISTS notes_record_idx     ON notes(record_id);

PRAGMA user_version = 1;
";
