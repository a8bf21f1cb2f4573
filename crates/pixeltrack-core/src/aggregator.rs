//! The aggregator: turns one classified event into store writes.
//!
//! Per `(subject, recipient)` pair the rows move through
//! `unseen -> sent -> opened-once -> opened-many`:
//!
//! - **send**: increment `sends` on the pair and the subject (creating either
//!   row on first reference). Independent of open state.
//! - **open**: atomically increment the pair's `opens` and look at the value
//!   the increment returned. Exactly when it is `1` this is the recipient's
//!   first open and the subject's `opens` is incremented too. Any other value
//!   leaves the subject alone.
//!
//! The first-open decision is taken from the increment's own return value,
//! never from a read after the write; two concurrent first opens would both
//! read `1` back. The pair write always happens before the subject write, so
//! a failure in between leaves an undercount that
//! [`AggregateStore::reconcile_subject`] can repair from the pair rows. The
//! store credits each pair to its subject at most once, so a reconcile that
//! lands between the two writes turns the subject write into a no-op
//! instead of a second count.
//!
//! Replaying an event counts it again. Deduplication happens at the identity
//! level only (same texts, same rows), not at the event level.
//!
//! Store errors are returned as-is so the caller (the work queue) can decide
//! whether to redeliver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  aggregate::SendCounts,
  event::{Action, ClassifiedEvent},
  identity::EventKeys,
  store::AggregateStore,
};

/// What a single [`Aggregator::apply`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outcome {
  Sent {
    keys:   EventKeys,
    counts: SendCounts,
  },
  Opened {
    keys:          EventKeys,
    /// Post-increment pair `opens`.
    pair_opens:    u64,
    /// Post-increment subject `opens`; `None` unless this event credited
    /// the pair's first open to the subject.
    subject_opens: Option<u64>,
  },
}

impl Outcome {
  pub fn keys(&self) -> &EventKeys {
    match self {
      Self::Sent { keys, .. } | Self::Opened { keys, .. } => keys,
    }
  }

  pub fn is_first_open(&self) -> bool {
    matches!(self, Self::Opened { subject_opens: Some(_), .. })
  }
}

/// Applies classified events to an [`AggregateStore`].
///
/// Holds no mutable state of its own; any number of clones may run
/// concurrently against the same store.
pub struct Aggregator<S> {
  store: Arc<S>,
}

impl<S> Clone for Aggregator<S> {
  fn clone(&self) -> Self { Self { store: Arc::clone(&self.store) } }
}

impl<S: AggregateStore> Aggregator<S> {
  pub fn new(store: Arc<S>) -> Self { Self { store } }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Apply `event`, observed at `at`, to the aggregate rows.
  pub async fn apply(
    &self,
    event: &ClassifiedEvent,
    at: DateTime<Utc>,
  ) -> Result<Outcome, S::Error> {
    let keys = event.keys();
    match event.action {
      Action::Send => self.apply_send(keys, at).await,
      Action::Open => self.apply_open(keys, at).await,
    }
  }

  async fn apply_send(
    &self,
    keys: EventKeys,
    at: DateTime<Utc>,
  ) -> Result<Outcome, S::Error> {
    let counts = self.store.record_send(keys.clone(), at).await?;
    tracing::debug!(
      subject_id = %keys.subject_id,
      pair_id = %keys.pair_id,
      pair_sends = counts.pair_sends,
      subject_sends = counts.subject_sends,
      "recorded send"
    );
    Ok(Outcome::Sent { keys, counts })
  }

  async fn apply_open(
    &self,
    keys: EventKeys,
    at: DateTime<Utc>,
  ) -> Result<Outcome, S::Error> {
    let pair_opens = self.store.increment_pair_opens(keys.clone(), at).await?;

    let subject_opens = if pair_opens == 1 {
      self.store.increment_subject_opens(keys.clone()).await?
    } else {
      None
    };

    tracing::debug!(
      subject_id = %keys.subject_id,
      pair_id = %keys.pair_id,
      pair_opens,
      first_open = subject_opens.is_some(),
      "recorded open"
    );
    Ok(Outcome::Opened { keys, pair_opens, subject_opens })
  }
}
