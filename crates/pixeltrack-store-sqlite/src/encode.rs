//! Encoding and decoding helpers between domain types and the plain values
//! stored in SQLite columns.
//!
//! Timestamps are fixed-width RFC 3339 strings (microseconds, `Z` suffix) so
//! that lexical order is chronological. Event receive times are unix
//! seconds. Parameter maps are compact JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use pixeltrack_core::{
  aggregate::{DeadLetter, PairAggregate, SubjectAggregate},
  event::{Params, RawEvent},
  identity::{PairId, SubjectId},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_unix(secs: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp(secs, 0)
    .ok_or_else(|| Error::DateParse(format!("unix time out of range: {secs}")))
}

// ─── Counters ─────────────────────────────────────────────────────────────────

pub fn decode_count(v: i64) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::Corrupt(format!("negative counter: {v}")))
}

// ─── Params ───────────────────────────────────────────────────────────────────

pub fn encode_params(p: &Params) -> Result<String> { Ok(serde_json::to_string(p)?) }

pub fn decode_params(s: &str) -> Result<Params> { Ok(serde_json::from_str(s)?) }

// ─── Raw row types ────────────────────────────────────────────────────────────

/// Intermediate form of a `subject_aggregates` row.
pub struct RawSubject {
  pub subject_id:    String,
  pub subject:       String,
  pub sends:         i64,
  pub opens:         i64,
  pub first_sent_at: Option<String>,
  pub first_seen_at: String,
}

pub const SUBJECT_COLUMNS: &str =
  "subject_id, subject, sends, opens, first_sent_at, first_seen_at";

impl RawSubject {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subject_id:    row.get(0)?,
      subject:       row.get(1)?,
      sends:         row.get(2)?,
      opens:         row.get(3)?,
      first_sent_at: row.get(4)?,
      first_seen_at: row.get(5)?,
    })
  }

  pub fn into_subject(self) -> Result<SubjectAggregate> {
    Ok(SubjectAggregate {
      subject_id:    SubjectId::parse(&self.subject_id)?,
      subject:       self.subject,
      sends:         decode_count(self.sends)?,
      opens:         decode_count(self.opens)?,
      first_sent_at: self.first_sent_at.as_deref().map(decode_dt).transpose()?,
      first_seen_at: decode_dt(&self.first_seen_at)?,
    })
  }
}

/// Intermediate form of a `pair_aggregates` row.
pub struct RawPair {
  pub pair_id:       String,
  pub subject_id:    String,
  pub subject:       String,
  pub recipient:     String,
  pub sends:         i64,
  pub opens:         i64,
  pub first_sent_at: Option<String>,
  pub first_seen_at: String,
}

pub const PAIR_COLUMNS: &str = "pair_id, subject_id, subject, recipient, sends, opens, \
   first_sent_at, first_seen_at";

impl RawPair {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      pair_id:       row.get(0)?,
      subject_id:    row.get(1)?,
      subject:       row.get(2)?,
      recipient:     row.get(3)?,
      sends:         row.get(4)?,
      opens:         row.get(5)?,
      first_sent_at: row.get(6)?,
      first_seen_at: row.get(7)?,
    })
  }

  pub fn into_pair(self) -> Result<PairAggregate> {
    Ok(PairAggregate {
      pair_id:       PairId::parse(&self.pair_id)?,
      subject_id:    SubjectId::parse(&self.subject_id)?,
      subject:       self.subject,
      recipient:     self.recipient,
      sends:         decode_count(self.sends)?,
      opens:         decode_count(self.opens)?,
      first_sent_at: self.first_sent_at.as_deref().map(decode_dt).transpose()?,
      first_seen_at: decode_dt(&self.first_seen_at)?,
    })
  }
}

/// Intermediate form of a `raw_events` row.
pub struct RawEventRow {
  pub event_id:     String,
  pub time:         i64,
  pub data_json:    String,
  pub headers_json: String,
}

impl RawEventRow {
  pub fn into_event(self) -> Result<RawEvent> {
    Ok(RawEvent {
      event_id: decode_uuid(&self.event_id)?,
      time:     decode_unix(self.time)?,
      data:     decode_params(&self.data_json)?,
      headers:  decode_params(&self.headers_json)?,
    })
  }
}

/// Intermediate form of a `dead_letters` row.
pub struct RawDeadLetter {
  pub event_json: String,
  pub attempts:   i64,
  pub last_error: String,
  pub failed_at:  String,
}

impl RawDeadLetter {
  pub fn into_dead_letter(self) -> Result<DeadLetter> {
    Ok(DeadLetter {
      event:      serde_json::from_str(&self.event_json)?,
      attempts:   u32::try_from(self.attempts)
        .map_err(|_| Error::Corrupt(format!("attempt count: {}", self.attempts)))?,
      last_error: self.last_error,
      failed_at:  decode_dt(&self.failed_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;

  use super::*;

  #[test]
  fn timestamps_sort_lexically() {
    let a = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let b = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
    let c = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
    let mut encoded = vec![encode_dt(c), encode_dt(a), encode_dt(b)];
    encoded.sort();
    assert_eq!(encoded, vec![encode_dt(a), encode_dt(b), encode_dt(c)]);
    assert_eq!(decode_dt(&encode_dt(b)).unwrap(), b);
  }

  #[test]
  fn negative_counter_is_corrupt() {
    assert!(matches!(decode_count(-1), Err(Error::Corrupt(_))));
    assert_eq!(decode_count(7).unwrap(), 7);
  }
}
