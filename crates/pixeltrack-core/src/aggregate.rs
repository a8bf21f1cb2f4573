//! Aggregate rows and the read models built from them.
//!
//! Rows are keyed by identity hash and created lazily on first reference.
//! Nothing here is ever deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  event::RawEvent,
  identity::{PairId, SubjectId},
};

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Rollup for one subject line across all recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectAggregate {
  pub subject_id:    SubjectId,
  pub subject:       String,
  /// Sum of `sends` over every pair under this subject.
  pub sends:         u64,
  /// Distinct recipients who opened, not raw open events.
  pub opens:         u64,
  /// Set by the first send; `None` for subjects only ever seen via opens.
  pub first_sent_at: Option<DateTime<Utc>>,
  pub first_seen_at: DateTime<Utc>,
}

impl SubjectAggregate {
  /// Unique opens as a percentage of sends; `None` before anything was sent.
  pub fn open_rate(&self) -> Option<f64> {
    (self.sends > 0).then(|| self.opens as f64 / self.sends as f64 * 100.0)
  }
}

/// Rollup for one `(subject, recipient)` combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAggregate {
  pub pair_id:       PairId,
  pub subject_id:    SubjectId,
  pub subject:       String,
  pub recipient:     String,
  pub sends:         u64,
  /// Every open event for this pair, repeats included.
  pub opens:         u64,
  pub first_sent_at: Option<DateTime<Utc>>,
  pub first_seen_at: DateTime<Utc>,
}

// ─── Write results ───────────────────────────────────────────────────────────

/// Post-increment `sends` counters returned by a send upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCounts {
  pub pair_sends:    u64,
  pub subject_sends: u64,
}

/// Before/after counters from recomputing a subject from its pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
  pub subject_id:   SubjectId,
  pub opens_before: u64,
  pub opens_after:  u64,
  pub sends_before: u64,
  pub sends_after:  u64,
}

impl Reconciliation {
  pub fn changed(&self) -> bool {
    self.opens_before != self.opens_after || self.sends_before != self.sends_after
  }
}

// ─── Read models ─────────────────────────────────────────────────────────────

/// A subject together with every pair recorded under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectDetail {
  pub subject: SubjectAggregate,
  /// Most recently sent first; never-sent pairs last.
  pub pairs:   Vec<PairAggregate>,
}

/// An event the work queue gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub event:      RawEvent,
  pub attempts:   u32,
  pub last_error: String,
  pub failed_at:  DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::identity::hash_subject;

  fn subject(sends: u64, opens: u64) -> SubjectAggregate {
    SubjectAggregate {
      subject_id: hash_subject("Welcome"),
      subject: "Welcome".into(),
      sends,
      opens,
      first_sent_at: None,
      first_seen_at: Utc::now(),
    }
  }

  #[test]
  fn open_rate_is_none_without_sends() {
    assert_eq!(subject(0, 3).open_rate(), None);
  }

  #[test]
  fn open_rate_is_a_percentage() {
    assert_eq!(subject(4, 1).open_rate(), Some(25.0));
  }
}
