//! The ingestion front door.
//!
//! Handlers build a [`RawEvent`], hand it to the [`WorkQueue`] and return at
//! once. None of them touch the store.
//!
//! | Method | Path | Default action | Response |
//! |--------|------|----------------|----------|
//! | `GET`  | `/pixel.gif` | `open` | the 1x1 GIF, always |
//! | `GET`  | `/api/generate-pixel` | `send` | 200 + [`Receipt`] |
//! | `POST` | `/api/events/send` | `send` | 202 + [`Receipt`] |
//! | `POST` | `/api/events/open` | `open` | 202 + [`Receipt`] |
//!
//! Parameters (query string or a flat JSON object of strings): `to` (alias
//! `recipient`, ignored when `to` is present), `from`, `subject`, and an
//! optional `action` overriding the default. Every parameter is kept in the
//! event record, and all four routes read them through
//! [`EventPayload::from_params`](pixeltrack_core::event::EventPayload::from_params).

use std::collections::btree_map::Entry;

use axum::{
  Json,
  extract::{Query, State, rejection::QueryRejection},
  http::{HeaderMap, StatusCode},
  response::{IntoResponse, Response},
};
use pixeltrack_core::{
  event::{Action, Params, RawEvent},
  identity::{PairId, SubjectId},
  store::AggregateStore,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{AppState, error::ApiError, pixel};

/// Echoed back to explicit submitters: the ids their event will aggregate
/// under. Aggregation itself happens later, on a worker.
#[derive(Debug, Serialize)]
pub struct Receipt {
  pub event_id:   Uuid,
  pub action:     Action,
  pub subject_id: SubjectId,
  pub pair_id:    PairId,
}

/// Flatten request headers into the event record. Repeated headers are
/// joined with `", "`; non-UTF-8 bytes are replaced.
pub fn header_params(headers: &HeaderMap) -> Params {
  let mut out = Params::new();
  for (name, value) in headers {
    let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
    match out.entry(name.as_str().to_owned()) {
      Entry::Occupied(mut e) => {
        let joined = e.get_mut();
        joined.push_str(", ");
        joined.push_str(&value);
      }
      Entry::Vacant(e) => {
        e.insert(value);
      }
    }
  }
  out
}

// ─── Pixel ───────────────────────────────────────────────────────────────────

/// `GET /pixel.gif[?subject=...&to=...]`
///
/// Never fails: an unparseable query is recorded without parameters, and a
/// full queue drops the event. Either way the image is served.
pub async fn pixel<S>(
  State(state): State<AppState<S>>,
  query: Result<Query<Params>, QueryRejection>,
  headers: HeaderMap,
) -> Response
where
  S: AggregateStore + Clone + 'static,
{
  let data = match query {
    Ok(Query(params)) => params,
    Err(e) => {
      tracing::warn!(error = %e, "unparseable pixel query, recording without parameters");
      Params::new()
    }
  };

  state.queue.submit(RawEvent::new(data, header_params(&headers)));
  pixel::response()
}

// ─── Explicit submissions ────────────────────────────────────────────────────

fn accept<S>(
  state: &AppState<S>,
  mut data: Params,
  headers: &HeaderMap,
  default_action: Action,
) -> Result<Receipt, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  data
    .entry("action".to_owned())
    .or_insert_with(|| default_action.as_str().to_owned());

  let event = RawEvent::new(data, header_params(headers));
  let classified = event.classify();
  let keys = classified.keys();
  let receipt = Receipt {
    event_id:   event.event_id,
    action:     classified.action,
    subject_id: keys.subject_id,
    pair_id:    keys.pair_id,
  };

  if !state.queue.submit(event) {
    return Err(ApiError::Overloaded);
  }
  Ok(receipt)
}

/// `GET /api/generate-pixel?to=...&from=...&subject=...`: records a send.
pub async fn generate_pixel<S>(
  State(state): State<AppState<S>>,
  headers: HeaderMap,
  Query(data): Query<Params>,
) -> Result<Json<Receipt>, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  accept(&state, data, &headers, Action::Send).map(Json)
}

/// `POST /api/events/send`, body: `{"to":"...","from":"...","subject":"..."}`
pub async fn submit_send<S>(
  State(state): State<AppState<S>>,
  headers: HeaderMap,
  Json(data): Json<Params>,
) -> Result<impl IntoResponse, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  let receipt = accept(&state, data, &headers, Action::Send)?;
  Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// `POST /api/events/open`, same body as `/api/events/send`.
pub async fn submit_open<S>(
  State(state): State<AppState<S>>,
  headers: HeaderMap,
  Json(data): Json<Params>,
) -> Result<impl IntoResponse, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  let receipt = accept(&state, data, &headers, Action::Open)?;
  Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[cfg(test)]
mod tests {
  use axum::http::HeaderValue;

  use super::*;

  #[test]
  fn repeated_headers_are_joined() {
    let mut headers = HeaderMap::new();
    headers.append("accept", HeaderValue::from_static("image/gif"));
    headers.append("accept", HeaderValue::from_static("image/*"));
    headers.insert("user-agent", HeaderValue::from_static("Mail/1.0"));

    let params = header_params(&headers);
    assert_eq!(params["accept"], "image/gif, image/*");
    assert_eq!(params["user-agent"], "Mail/1.0");
  }
}
