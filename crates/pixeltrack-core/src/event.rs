//! Raw events and the event classifier.
//!
//! A [`RawEvent`] is exactly what the front door saw: the request parameters
//! and headers, stamped with a receive time. It is appended to the event log
//! once and never changed. Classification turns its parameters into a
//! [`ClassifiedEvent`] by way of the typed [`EventPayload`].
//!
//! Classification never fails. Missing fields fall back to defaults so that
//! malformed or legacy senders still produce a (degenerate) record:
//!
//! | field     | source keys           | default  |
//! |-----------|-----------------------|----------|
//! | action    | `action`              | `open`   |
//! | subject   | `subject`             | `""`     |
//! | recipient | `to`, `recipient`     | `""`     |

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, SubsecRound as _, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, identity::EventKeys};

/// Ordered string map used for request parameters and headers.
pub type Params = BTreeMap<String, String>;

// ─── Action ──────────────────────────────────────────────────────────────────

/// What an event represents. A pixel fetch carries no action and is an open.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Send,
  #[default]
  Open,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Send => "send",
      Self::Open => "open",
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Action {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "send" => Ok(Self::Send),
      "open" => Ok(Self::Open),
      _ => Err(Error::UnknownAction(s.to_owned())),
    }
  }
}

// ─── RawEvent ────────────────────────────────────────────────────────────────

/// An ingested occurrence before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
  pub event_id: Uuid,
  /// Receive time; serialised as unix seconds.
  #[serde(with = "chrono::serde::ts_seconds")]
  pub time:     DateTime<Utc>,
  /// Query string or body parameters.
  pub data:     Params,
  /// Request headers, names lowercased.
  pub headers:  Params,
}

impl RawEvent {
  /// Stamp a new event with the current time (whole seconds).
  pub fn new(data: Params, headers: Params) -> Self {
    Self::at(Utc::now(), data, headers)
  }

  pub fn at(time: DateTime<Utc>, data: Params, headers: Params) -> Self {
    Self {
      event_id: Uuid::new_v4(),
      time: time.trunc_subsecs(0),
      data,
      headers,
    }
  }

  pub fn payload(&self) -> EventPayload { EventPayload::from_params(&self.data) }

  pub fn classify(&self) -> ClassifiedEvent { classify(&self.payload()) }
}

// ─── EventPayload ────────────────────────────────────────────────────────────

/// Typed view over the parameters the classifier cares about. Every field is
/// optional; defaults are applied in [`classify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPayload {
  pub action:  Option<String>,
  pub subject: Option<String>,
  /// `to`, falling back to `recipient`.
  pub to:      Option<String>,
  /// Sender address. Recorded in the log; not part of any identity.
  pub from:    Option<String>,
}

impl EventPayload {
  pub fn from_params(params: &Params) -> Self {
    Self {
      action:  params.get("action").cloned(),
      subject: params.get("subject").cloned(),
      to:      params
        .get("to")
        .or_else(|| params.get("recipient"))
        .cloned(),
      from:    params.get("from").cloned(),
    }
  }
}

// ─── Classification ──────────────────────────────────────────────────────────

/// The `(action, subject, recipient)` triple the aggregator works from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
  pub action:    Action,
  pub subject:   String,
  pub recipient: String,
}

impl ClassifiedEvent {
  pub fn keys(&self) -> EventKeys { EventKeys::derive(&self.subject, &self.recipient) }
}

/// Classify a payload. Never fails; see the module docs for defaults.
pub fn classify(payload: &EventPayload) -> ClassifiedEvent {
  let action = match payload.action.as_deref() {
    None => Action::default(),
    Some(raw) => raw.parse().unwrap_or_else(|_| {
      tracing::warn!(action = raw, "unrecognised action, treating as open");
      Action::Open
    }),
  };

  ClassifiedEvent {
    action,
    subject: payload.subject.clone().unwrap_or_default(),
    recipient: payload.to.clone().unwrap_or_default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
      .iter()
      .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
      .collect()
  }

  #[test]
  fn pixel_fetch_without_action_is_an_open() {
    let payload =
      EventPayload::from_params(&params(&[("subject", "Welcome"), ("to", "a@x.com")]));
    let event = classify(&payload);
    assert_eq!(event.action, Action::Open);
    assert_eq!(event.subject, "Welcome");
    assert_eq!(event.recipient, "a@x.com");
  }

  #[test]
  fn explicit_send_is_recognised_case_insensitively() {
    let payload = EventPayload::from_params(&params(&[("action", " SEND ")]));
    assert_eq!(classify(&payload).action, Action::Send);
  }

  #[test]
  fn unknown_action_falls_back_to_open() {
    let payload = EventPayload::from_params(&params(&[("action", "click")]));
    assert_eq!(classify(&payload).action, Action::Open);
  }

  #[test]
  fn missing_fields_default_to_empty_strings() {
    let event = classify(&EventPayload::default());
    assert_eq!(event.subject, "");
    assert_eq!(event.recipient, "");
    assert_eq!(event.keys(), EventKeys::derive("", ""));
  }

  #[test]
  fn recipient_alias_is_accepted_but_to_wins() {
    let alias = EventPayload::from_params(&params(&[("recipient", "b@y.com")]));
    assert_eq!(alias.to.as_deref(), Some("b@y.com"));

    let both = EventPayload::from_params(&params(&[
      ("recipient", "b@y.com"),
      ("to", "a@x.com"),
    ]));
    assert_eq!(both.to.as_deref(), Some("a@x.com"));
  }

  #[test]
  fn raw_event_time_serialises_as_unix_seconds() {
    let time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let event = RawEvent::at(time, Params::new(), Params::new());
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["time"], 1_700_000_000);
  }
}
