//! SQL schema for the pixeltrack SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! layout version; future migrations will be gated on it.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Append-only event log. No UPDATE or DELETE is ever issued against it.
-- action/subject/recipient are the classifier's reading of data_json,
-- denormalised for audit queries.
CREATE TABLE IF NOT EXISTS raw_events (
    event_id     TEXT PRIMARY KEY,
    time         INTEGER NOT NULL,   -- unix seconds
    action       TEXT NOT NULL,      -- 'send' | 'open'
    subject      TEXT NOT NULL,
    recipient    TEXT NOT NULL,
    data_json    TEXT NOT NULL,
    headers_json TEXT NOT NULL
);

-- One row per distinct subject text; subject_id = hash_subject(subject).
CREATE TABLE IF NOT EXISTS subject_aggregates (
    subject_id    TEXT PRIMARY KEY,
    subject       TEXT NOT NULL,
    sends         INTEGER NOT NULL DEFAULT 0 CHECK (sends >= 0),
    opens         INTEGER NOT NULL DEFAULT 0 CHECK (opens >= 0),  -- unique openers
    first_sent_at TEXT,              -- RFC 3339 UTC; NULL until first send
    first_seen_at TEXT NOT NULL
);

-- One row per (subject, recipient); pair_id = hash_pair(subject, recipient).
CREATE TABLE IF NOT EXISTS pair_aggregates (
    pair_id       TEXT PRIMARY KEY,
    subject_id    TEXT NOT NULL REFERENCES subject_aggregates(subject_id),
    subject       TEXT NOT NULL,
    recipient     TEXT NOT NULL,
    sends         INTEGER NOT NULL DEFAULT 0 CHECK (sends >= 0),
    opens         INTEGER NOT NULL DEFAULT 0 CHECK (opens >= 0),  -- every open
    first_sent_at TEXT,
    first_seen_at TEXT NOT NULL,
    -- 1 once this pair's first open has been added to the subject's opens.
    -- Subject opens always equal the number of pairs with this set.
    subject_counted INTEGER NOT NULL DEFAULT 0 CHECK (subject_counted IN (0, 1))
);

-- Events the work queue gave up on.
CREATE TABLE IF NOT EXISTS dead_letters (
    event_id   TEXT PRIMARY KEY,
    event_json TEXT NOT NULL,
    attempts   INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    failed_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS raw_events_time_idx    ON raw_events(time);
CREATE INDEX IF NOT EXISTS pair_subject_idx       ON pair_aggregates(subject_id);
CREATE INDEX IF NOT EXISTS subject_first_seen_idx ON subject_aggregates(first_seen_at);

PRAGMA user_version = 1;
";
