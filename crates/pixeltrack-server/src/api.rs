//! Read-side JSON views over the aggregates.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/api/subjects` | Every subject with its open rate |
//! | `GET`  | `/api/subjects/{subject_id}` | Subject plus pairs; 400 on a malformed id, 404 if absent |

use axum::{
  Json,
  extract::{Path, State},
};
use pixeltrack_core::{
  aggregate::{SubjectAggregate, SubjectDetail},
  identity::SubjectId,
  store::AggregateStore,
};
use serde::Serialize;

use crate::{AppState, error::ApiError};

/// A subject row plus the derived open percentage.
#[derive(Debug, Serialize)]
pub struct SubjectSummary {
  #[serde(flatten)]
  pub subject:   SubjectAggregate,
  /// `opens / sends * 100`; `null` while nothing has been sent.
  pub open_rate: Option<f64>,
}

impl From<SubjectAggregate> for SubjectSummary {
  fn from(subject: SubjectAggregate) -> Self {
    let open_rate = subject.open_rate();
    Self { subject, open_rate }
  }
}

/// `GET /api/subjects`
pub async fn list_subjects<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<Vec<SubjectSummary>>, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  let subjects = state
    .store
    .list_subjects()
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?;
  Ok(Json(subjects.into_iter().map(SubjectSummary::from).collect()))
}

/// `GET /api/subjects/{subject_id}`
pub async fn get_subject<S>(
  State(state): State<AppState<S>>,
  Path(raw_id): Path<String>,
) -> Result<Json<SubjectDetail>, ApiError>
where
  S: AggregateStore + Clone + 'static,
{
  let subject_id =
    SubjectId::parse(&raw_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

  let detail = state
    .store
    .get_subject(subject_id)
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?
    .ok_or_else(|| ApiError::NotFound(format!("subject {raw_id} not found")))?;
  Ok(Json(detail))
}
