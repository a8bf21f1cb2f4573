//! The `AggregateStore` trait: the persistence contract the aggregator and
//! the read-side views are written against.
//!
//! Backends (e.g. `pixeltrack-store-sqlite`) implement it over whatever
//! storage they wrap. The one hard requirement is that the increment
//! operations are atomic and return the post-increment value; the unique-open
//! rule in [`crate::aggregator`] is decided from that value alone.
//!
//! Persisted layout, four logical collections:
//!
//! | collection           | key          | written by                    |
//! |----------------------|--------------|-------------------------------|
//! | raw events           | `event_id`   | [`AggregateStore::append_event`] (append-only) |
//! | subject aggregates   | `subject_id` | send / open increments        |
//! | pair aggregates      | `pair_id`    | send / open increments        |
//! | dead letters         | `event_id`   | the work queue                |

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
  Retryable,
  aggregate::{DeadLetter, Reconciliation, SendCounts, SubjectAggregate, SubjectDetail},
  event::RawEvent,
  identity::{EventKeys, SubjectId},
};

/// Abstraction over an aggregate store backend.
///
/// All methods return `Send` futures so a store can be shared across a
/// multi-threaded worker pool.
pub trait AggregateStore: Send + Sync {
  type Error: std::error::Error + Retryable + Send + Sync + 'static;

  // ── Raw event log ─────────────────────────────────────────────────────

  /// Append an event to the log. Appending an `event_id` that is already
  /// present is a no-op, so a redelivered job cannot duplicate the log.
  fn append_event(
    &self,
    event: RawEvent,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Read the log in receive order, optionally from `since` onwards.
  fn list_events(
    &self,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<RawEvent>, Self::Error>> + Send + '_;

  // ── Counter updates ───────────────────────────────────────────────────

  /// Upsert both rows for a send and increment their `sends`.
  /// Sets `first_sent_at` on each row the first time it is sent.
  fn record_send(
    &self,
    keys: EventKeys,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<SendCounts, Self::Error>> + Send + '_;

  /// Atomically increment the pair's `opens` and return the new value.
  ///
  /// Creates the pair row if absent, and the subject row it references
  /// (with zero counters) if that is absent too. Never touches the
  /// subject's counters.
  fn increment_pair_opens(
    &self,
    keys: EventKeys,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Credit the pair's first open to its subject: atomically mark the pair
  /// as counted and increment the subject's `opens`, returning the new
  /// value.
  ///
  /// Each pair is credited at most once, whether here or by
  /// [`reconcile_subject`](Self::reconcile_subject). Returns `None` if the
  /// pair was already credited or does not exist.
  fn increment_subject_opens(
    &self,
    keys: EventKeys,
  ) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Every subject aggregate, most recently seen first.
  fn list_subjects(
    &self,
  ) -> impl Future<Output = Result<Vec<SubjectAggregate>, Self::Error>> + Send + '_;

  /// A subject and its pairs. Returns `None` if the subject is unknown.
  fn get_subject(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Option<SubjectDetail>, Self::Error>> + Send + '_;

  fn list_subject_ids(
    &self,
  ) -> impl Future<Output = Result<Vec<SubjectId>, Self::Error>> + Send + '_;

  // ── Reconciliation ────────────────────────────────────────────────────

  /// Recompute a subject's counters from its pairs. Every opened pair not
  /// yet credited is credited, then `opens` becomes the number of credited
  /// pairs and `sends` the sum of pair sends. Safe to run while events are
  /// being applied. Returns `None` if the subject is unknown.
  fn reconcile_subject(
    &self,
    subject_id: SubjectId,
  ) -> impl Future<Output = Result<Option<Reconciliation>, Self::Error>> + Send + '_;

  // ── Dead letters ──────────────────────────────────────────────────────

  /// Park an event the work queue could not aggregate. Re-parking the same
  /// event replaces the earlier entry.
  fn record_dead_letter(
    &self,
    letter: DeadLetter,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn list_dead_letters(
    &self,
  ) -> impl Future<Output = Result<Vec<DeadLetter>, Self::Error>> + Send + '_;

  /// Drop a dead letter, e.g. after a successful replay. Returns whether
  /// one was removed.
  fn remove_dead_letter(
    &self,
    event_id: uuid::Uuid,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;
}
