//! [`SqliteStore`]: the SQLite implementation of [`AggregateStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use pixeltrack_core::{
  aggregate::{
    DeadLetter, Reconciliation, SendCounts, SubjectAggregate, SubjectDetail,
  },
  event::RawEvent,
  identity::{EventKeys, SubjectId},
  store::AggregateStore,
};

use crate::{
  Error, Result,
  encode::{
    PAIR_COLUMNS, RawDeadLetter, RawEventRow, RawPair, RawSubject,
    SUBJECT_COLUMNS, decode_count, encode_dt, encode_params, encode_uuid,
  },
  schema::SCHEMA,
};

// ─── Statements ──────────────────────────────────────────────────────────────

/// Create the subject row with zero counters if it does not exist yet.
const ENSURE_SUBJECT: &str = "
  INSERT INTO subject_aggregates (subject_id, subject, sends, opens, first_sent_at, first_seen_at)
  VALUES (?1, ?2, 0, 0, NULL, ?3)
  ON CONFLICT(subject_id) DO NOTHING";

const SUBJECT_SEND: &str = "
  INSERT INTO subject_aggregates (subject_id, subject, sends, opens, first_sent_at, first_seen_at)
  VALUES (?1, ?2, 1, 0, ?3, ?3)
  ON CONFLICT(subject_id) DO UPDATE SET
    sends         = sends + 1,
    first_sent_at = COALESCE(first_sent_at, excluded.first_sent_at)
  RETURNING sends";

const PAIR_SEND: &str = "
  INSERT INTO pair_aggregates (pair_id, subject_id, subject, recipient, sends, opens, first_sent_at, first_seen_at)
  VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)
  ON CONFLICT(pair_id) DO UPDATE SET
    sends         = sends + 1,
    first_sent_at = COALESCE(first_sent_at, excluded.first_sent_at)
  RETURNING sends";

const PAIR_OPEN: &str = "
  INSERT INTO pair_aggregates (pair_id, subject_id, subject, recipient, sends, opens, first_sent_at, first_seen_at)
  VALUES (?1, ?2, ?3, ?4, 0, 1, NULL, ?5)
  ON CONFLICT(pair_id) DO UPDATE SET opens = opens + 1
  RETURNING opens";

/// Mark the pair's first open as counted. Changes no row if it already was.
const CLAIM_PAIR_OPEN: &str = "
  UPDATE pair_aggregates SET subject_counted = 1
  WHERE pair_id = ?1 AND subject_counted = 0";

const SUBJECT_OPEN: &str = "
  UPDATE subject_aggregates SET opens = opens + 1
  WHERE subject_id = ?1
  RETURNING opens";

// ─── Store ───────────────────────────────────────────────────────────────────

/// An aggregate store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Open it once
/// at process start and drop (or [`close`](Self::close)) it at shutdown.
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

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Flush and close the connection. Other clones fail with a transient
  /// error afterwards.
  pub async fn close(self) -> Result<()> {
    self.conn.close().await?;
    Ok(())
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
}

// ─── AggregateStore impl ─────────────────────────────────────────────────────

impl AggregateStore for SqliteStore {
  type Error = Error;

  // ── Raw event log ─────────────────────────────────────────────────────────

  async fn append_event(&self, event: RawEvent) -> Result<()> {
    let classified   = event.classify();
    let id_str       = encode_uuid(event.event_id);
    let time         = event.time.timestamp();
    let data_json    = encode_params(&event.data)?;
    let headers_json = encode_params(&event.headers)?;

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO raw_events
             (event_id, time, action, subject, recipient, data_json, headers_json)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            id_str,
            time,
            classified.action.as_str(),
            classified.subject,
            classified.recipient,
            data_json,
            headers_json,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_events(
    &self,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
  ) -> Result<Vec<RawEvent>> {
    let since_secs = since.map_or(i64::MIN, |dt| dt.timestamp());
    // SQLite treats a negative LIMIT as "no limit".
    let limit_val  = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

    let rows: Vec<RawEventRow> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT event_id, time, data_json, headers_json
           FROM raw_events
           WHERE time >= ?1
           ORDER BY time, rowid
           LIMIT ?2",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![since_secs, limit_val], |row| {
            Ok(RawEventRow {
              event_id:     row.get(0)?,
              time:         row.get(1)?,
              data_json:    row.get(2)?,
              headers_json: row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows.into_iter().map(RawEventRow::into_event).collect()
  }

  // ── Counter updates ───────────────────────────────────────────────────────

  async fn record_send(&self, keys: EventKeys, at: DateTime<Utc>) -> Result<SendCounts> {
    let at_str = encode_dt(at);

    let (pair_sends, subject_sends): (i64, i64) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Subject first: the pair row references it.
        let subject_sends: i64 = tx.query_row(
          SUBJECT_SEND,
          rusqlite::params![keys.subject_id.as_str(), keys.subject, at_str],
          |r| r.get(0),
        )?;
        let pair_sends: i64 = tx.query_row(
          PAIR_SEND,
          rusqlite::params![
            keys.pair_id.as_str(),
            keys.subject_id.as_str(),
            keys.subject,
            keys.recipient,
            at_str,
          ],
          |r| r.get(0),
        )?;
        tx.commit()?;
        Ok((pair_sends, subject_sends))
      })
      .await?;

    Ok(SendCounts {
      pair_sends:    decode_count(pair_sends)?,
      subject_sends: decode_count(subject_sends)?,
    })
  }

  async fn increment_pair_opens(&self, keys: EventKeys, at: DateTime<Utc>) -> Result<u64> {
    let at_str = encode_dt(at);

    let opens: i64 = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          ENSURE_SUBJECT,
          rusqlite::params![keys.subject_id.as_str(), keys.subject, at_str],
        )?;
        let opens: i64 = tx.query_row(
          PAIR_OPEN,
          rusqlite::params![
            keys.pair_id.as_str(),
            keys.subject_id.as_str(),
            keys.subject,
            keys.recipient,
            at_str,
          ],
          |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(opens)
      })
      .await?;

    decode_count(opens)
  }

  async fn increment_subject_opens(&self, keys: EventKeys) -> Result<Option<u64>> {
    let opens: Option<i64> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let claimed = tx.execute(CLAIM_PAIR_OPEN, rusqlite::params![keys.pair_id.as_str()])?;
        if claimed == 0 {
          return Ok(None);
        }
        let opens: i64 = tx.query_row(
          SUBJECT_OPEN,
          rusqlite::params![keys.subject_id.as_str()],
          |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(Some(opens))
      })
      .await?;

    opens.map(decode_count).transpose()
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  async fn list_subjects(&self) -> Result<Vec<SubjectAggregate>> {
    let raws: Vec<RawSubject> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBJECT_COLUMNS} FROM subject_aggregates
           ORDER BY first_seen_at DESC, subject_id"
        ))?;
        let rows = stmt
          .query_map([], RawSubject::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSubject::into_subject).collect()
  }

  async fn get_subject(&self, subject_id: SubjectId) -> Result<Option<SubjectDetail>> {
    let (raw_subject, raw_pairs): (Option<RawSubject>, Vec<RawPair>) = self
      .conn
      .call(move |conn| {
        let subject = conn
          .query_row(
            &format!("SELECT {SUBJECT_COLUMNS} FROM subject_aggregates WHERE subject_id = ?1"),
            rusqlite::params![subject_id.as_str()],
            RawSubject::from_row,
          )
          .optional()?;

        if subject.is_none() {
          return Ok((None, Vec::new()));
        }

        let mut stmt = conn.prepare(&format!(
          "SELECT {PAIR_COLUMNS} FROM pair_aggregates
           WHERE subject_id = ?1
           ORDER BY first_sent_at IS NULL, first_sent_at DESC, recipient"
        ))?;
        let pairs = stmt
          .query_map(rusqlite::params![subject_id.as_str()], RawPair::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok((subject, pairs))
      })
      .await?;

    let Some(raw_subject) = raw_subject else {
      return Ok(None);
    };

    Ok(Some(SubjectDetail {
      subject: raw_subject.into_subject()?,
      pairs:   raw_pairs
        .into_iter()
        .map(RawPair::into_pair)
        .collect::<Result<_>>()?,
    }))
  }

  async fn list_subject_ids(&self) -> Result<Vec<SubjectId>> {
    let ids: Vec<String> = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT subject_id FROM subject_aggregates ORDER BY subject_id")?;
        let rows = stmt
          .query_map([], |r| r.get(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    ids
      .iter()
      .map(|s| SubjectId::parse(s).map_err(Error::Core))
      .collect()
  }

  // ── Reconciliation ────────────────────────────────────────────────────────

  async fn reconcile_subject(&self, subject_id: SubjectId) -> Result<Option<Reconciliation>> {
    let id_str = subject_id.as_str().to_owned();

    let counts: Option<(i64, i64, i64, i64)> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let before: Option<(i64, i64)> = tx
          .query_row(
            "SELECT opens, sends FROM subject_aggregates WHERE subject_id = ?1",
            rusqlite::params![id_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?;

        let Some((opens_before, sends_before)) = before else {
          return Ok(None);
        };

        // Credit opened pairs whose first open never reached the subject,
        // then count from the flags. Concurrent first opens claim the same
        // flag, so a pair is never credited twice.
        tx.execute(
          "UPDATE pair_aggregates SET subject_counted = 1
           WHERE subject_id = ?1 AND opens >= 1 AND subject_counted = 0",
          rusqlite::params![id_str],
        )?;
        let (opens_after, sends_after): (i64, i64) = tx.query_row(
          "SELECT COALESCE(SUM(subject_counted), 0), COALESCE(SUM(sends), 0)
           FROM pair_aggregates WHERE subject_id = ?1",
          rusqlite::params![id_str],
          |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        if (opens_before, sends_before) != (opens_after, sends_after) {
          tx.execute(
            "UPDATE subject_aggregates SET opens = ?2, sends = ?3 WHERE subject_id = ?1",
            rusqlite::params![id_str, opens_after, sends_after],
          )?;
        }
        tx.commit()?;

        Ok(Some((opens_before, opens_after, sends_before, sends_after)))
      })
      .await?;

    let Some((opens_before, opens_after, sends_before, sends_after)) = counts else {
      return Ok(None);
    };

    let report = Reconciliation {
      subject_id,
      opens_before: decode_count(opens_before)?,
      opens_after:  decode_count(opens_after)?,
      sends_before: decode_count(sends_before)?,
      sends_after:  decode_count(sends_after)?,
    };
    if report.changed() {
      tracing::info!(
        subject_id = %report.subject_id,
        opens_before = report.opens_before,
        opens_after = report.opens_after,
        sends_before = report.sends_before,
        sends_after = report.sends_after,
        "reconciled subject counters"
      );
    }
    Ok(Some(report))
  }

  // ── Dead letters ──────────────────────────────────────────────────────────

  async fn record_dead_letter(&self, letter: DeadLetter) -> Result<()> {
    let id_str     = encode_uuid(letter.event.event_id);
    let event_json = serde_json::to_string(&letter.event)?;
    let at_str     = encode_dt(letter.failed_at);
    let attempts   = i64::from(letter.attempts);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO dead_letters (event_id, event_json, attempts, last_error, failed_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id_str, event_json, attempts, letter.last_error, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let raws: Vec<RawDeadLetter> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT event_json, attempts, last_error, failed_at
           FROM dead_letters ORDER BY failed_at, event_id",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawDeadLetter {
              event_json: row.get(0)?,
              attempts:   row.get(1)?,
              last_error: row.get(2)?,
              failed_at:  row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawDeadLetter::into_dead_letter).collect()
  }

  async fn remove_dead_letter(&self, event_id: Uuid) -> Result<bool> {
    let id_str = encode_uuid(event_id);

    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM dead_letters WHERE event_id = ?1",
          rusqlite::params![id_str],
        )?)
      })
      .await?;

    Ok(removed > 0)
  }
}
