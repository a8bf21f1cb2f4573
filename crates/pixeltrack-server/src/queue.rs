//! At-least-once work queue between the front door and the aggregator.
//!
//! The front door calls [`WorkQueue::submit`], which never waits on the
//! store. A fixed pool of workers takes events off a bounded channel and
//! delivers each one:
//!
//! 1. append the raw event to the log (keyed by `event_id`, so a retry does
//!    not append twice),
//! 2. classify it and apply it through the [`Aggregator`],
//!
//! all under a per-attempt timeout. Transient failures are retried with
//! exponential backoff up to [`RetryPolicy::max_attempts`]; permanent
//! failures and exhausted retries land in the dead-letter table.
//!
//! A retried attempt may double-count (the earlier attempt might have
//! applied before failing). That is the at-least-once contract. What must
//! not happen is a lost first open: if an earlier attempt incremented the
//! pair but never reached the subject, the retry sees `opens > 1` and skips
//! the subject. So after an `open` succeeds on a retry the subject is
//! reconciled from its pairs. The same holds for an event replayed from the
//! dead-letter table with [`redeliver`]: its earlier attempts may have
//! landed, so even its first attempt counts as a retry.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use pixeltrack_core::{
  Retryable,
  aggregate::DeadLetter,
  aggregator::{Aggregator, Outcome},
  event::{Action, RawEvent},
  store::AggregateStore,
};
use tokio::{
  sync::{Mutex, mpsc},
  task::JoinHandle,
};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Bounds on how hard a worker tries before giving up on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub op_timeout:   Duration,
  pub backoff_base: Duration,
  pub backoff_max:  Duration,
}

impl RetryPolicy {
  /// Delay after failed attempt number `attempt` (1-based):
  /// `base * 2^(attempt - 1)`, capped at `backoff_max`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    self
      .backoff_base
      .checked_mul(factor)
      .map_or(self.backoff_max, |d| d.min(self.backoff_max))
  }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

/// How a single event's delivery ended.
#[derive(Debug)]
pub enum Delivery {
  Delivered { attempts: u32, outcome: Outcome },
  DeadLettered { attempts: u32, error: String },
}

enum AttemptError<E> {
  Store(E),
  TimedOut(Duration),
}

impl<E: std::error::Error + Retryable> AttemptError<E> {
  fn is_transient(&self) -> bool {
    match self {
      Self::Store(e) => e.is_transient(),
      Self::TimedOut(_) => true,
    }
  }

  fn describe(&self) -> String {
    match self {
      Self::Store(e) => e.to_string(),
      Self::TimedOut(d) => format!("timed out after {}ms", d.as_millis()),
    }
  }
}

async fn attempt<S: AggregateStore>(
  aggregator: &Aggregator<S>,
  event: &RawEvent,
  retried: bool,
) -> Result<Outcome, S::Error> {
  let store = aggregator.store();
  store.append_event(event.clone()).await?;

  let classified = event.classify();
  let outcome = aggregator.apply(&classified, event.time).await?;

  if retried && classified.action == Action::Open {
    store.reconcile_subject(outcome.keys().subject_id.clone()).await?;
  }
  Ok(outcome)
}

/// Deliver one event, retrying transient failures per `policy` and parking
/// it in the dead-letter table when delivery cannot succeed.
pub async fn deliver<S: AggregateStore>(
  aggregator: &Aggregator<S>,
  event: RawEvent,
  policy: &RetryPolicy,
) -> Delivery {
  run(aggregator, event, policy, false).await
}

/// Deliver an event that has been attempted before, e.g. one replayed from
/// the dead-letter table. An `open` is followed by a reconcile of its
/// subject even when the first attempt here succeeds.
pub async fn redeliver<S: AggregateStore>(
  aggregator: &Aggregator<S>,
  event: RawEvent,
  policy: &RetryPolicy,
) -> Delivery {
  run(aggregator, event, policy, true).await
}

async fn run<S: AggregateStore>(
  aggregator: &Aggregator<S>,
  event: RawEvent,
  policy: &RetryPolicy,
  redelivery: bool,
) -> Delivery {
  let mut attempts = 0;
  let mut last_error = String::new();

  while attempts < policy.max_attempts {
    attempts += 1;

    let result = tokio::time::timeout(
      policy.op_timeout,
      attempt(aggregator, &event, redelivery || attempts > 1),
    )
    .await
    .map_err(|_| AttemptError::TimedOut(policy.op_timeout))
    .and_then(|r| r.map_err(AttemptError::Store));

    match result {
      Ok(outcome) => return Delivery::Delivered { attempts, outcome },
      Err(e) => {
        last_error = e.describe();
        if !e.is_transient() {
          tracing::error!(
            event_id = %event.event_id,
            attempts,
            error = %last_error,
            "permanent failure aggregating event"
          );
          break;
        }
        if attempts < policy.max_attempts {
          let delay = policy.backoff(attempts);
          tracing::warn!(
            event_id = %event.event_id,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %last_error,
            "transient failure aggregating event, retrying"
          );
          tokio::time::sleep(delay).await;
        }
      }
    }
  }

  let letter = DeadLetter {
    event,
    attempts,
    last_error: last_error.clone(),
    failed_at: Utc::now(),
  };
  let event_id = letter.event.event_id;
  if let Err(e) = aggregator.store().record_dead_letter(letter).await {
    tracing::error!(%event_id, error = %e, "failed to record dead letter; event lost");
  } else {
    tracing::warn!(%event_id, attempts, "event dead-lettered");
  }

  Delivery::DeadLettered { attempts, error: last_error }
}

// ─── Queue & workers ─────────────────────────────────────────────────────────

/// Submission handle for the front door. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
  tx: mpsc::Sender<RawEvent>,
}

impl WorkQueue {
  /// Hand an event to the workers without waiting. Returns `false` (and
  /// drops the event) if the queue is full or shut down.
  pub fn submit(&self, event: RawEvent) -> bool {
    match self.tx.try_send(event) {
      Ok(()) => true,
      Err(mpsc::error::TrySendError::Full(event)) => {
        tracing::warn!(event_id = %event.event_id, "ingestion queue full, dropping event");
        false
      }
      Err(mpsc::error::TrySendError::Closed(event)) => {
        tracing::warn!(event_id = %event.event_id, "ingestion queue closed, dropping event");
        false
      }
    }
  }
}

/// The running workers. Dropping every [`WorkQueue`] handle closes the
/// channel; [`join`](Self::join) then waits for the backlog to drain.
pub struct WorkerPool {
  handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
  pub async fn join(self) {
    for handle in self.handles {
      if let Err(e) = handle.await {
        tracing::error!(error = %e, "worker panicked");
      }
    }
  }
}

/// Start `workers` workers over a queue holding at most `capacity` events.
pub fn start<S>(
  aggregator: Aggregator<S>,
  workers: usize,
  capacity: usize,
  policy: RetryPolicy,
) -> (WorkQueue, WorkerPool)
where
  S: AggregateStore + 'static,
{
  let (tx, rx) = mpsc::channel(capacity.max(1));
  let rx = Arc::new(Mutex::new(rx));

  let handles = (0..workers.max(1))
    .map(|worker| {
      let rx = Arc::clone(&rx);
      let aggregator = aggregator.clone();
      tokio::spawn(async move {
        loop {
          // Release the lock before delivering so other workers can pull.
          let next = rx.lock().await.recv().await;
          let Some(event) = next else { break };
          deliver(&aggregator, event, &policy).await;
        }
        tracing::debug!(worker, "worker stopped");
      })
    })
    .collect();

  tracing::info!(workers, capacity, "started aggregation workers");
  (WorkQueue { tx }, WorkerPool { handles })
}

/// A queue with no workers behind it, for exercising back-pressure.
#[cfg(test)]
pub(crate) fn detached(capacity: usize) -> (WorkQueue, mpsc::Receiver<RawEvent>) {
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (WorkQueue { tx }, rx)
}
