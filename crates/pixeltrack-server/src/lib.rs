//! HTTP surface for pixeltrack: the ingestion front door, the read-side
//! JSON views, and the work queue that connects the front door to the
//! aggregator.
//!
//! Exposes an axum [`Router`] backed by any [`AggregateStore`]. Login,
//! sessions and HTML rendering are left to whatever mounts it.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pixel;
pub mod queue;

pub use crate::config::ServerConfig;
pub use error::ApiError;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use pixeltrack_core::store::AggregateStore;
use tower_http::trace::TraceLayer;

use crate::queue::WorkQueue;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
#[derive(Clone)]
pub struct AppState<S: AggregateStore> {
  /// Read side only; writes go through `queue`.
  pub store: Arc<S>,
  pub queue: WorkQueue,
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the axum [`Router`] for the server.
pub fn router<S>(state: AppState<S>) -> Router
where
  S: AggregateStore + Clone + 'static,
{
  Router::new()
    // Front door
    .route("/pixel.gif",          get(ingest::pixel::<S>))
    .route("/api/generate-pixel", get(ingest::generate_pixel::<S>))
    .route("/api/events/send",    post(ingest::submit_send::<S>))
    .route("/api/events/open",    post(ingest::submit_open::<S>))
    // Read side
    .route("/api/subjects",              get(api::list_subjects::<S>))
    .route("/api/subjects/{subject_id}", get(api::get_subject::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

// ─── Integration tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
  };
  use pixeltrack_core::{
    aggregator::Aggregator,
    identity::{hash_pair, hash_subject},
  };
  use pixeltrack_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  use crate::queue::{RetryPolicy, WorkerPool};

  const POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    op_timeout:   Duration::from_secs(5),
    backoff_base: Duration::from_millis(1),
    backoff_max:  Duration::from_millis(5),
  };

  struct Harness {
    store: Arc<SqliteStore>,
    state: AppState<SqliteStore>,
    pool:  WorkerPool,
  }

  impl Harness {
    async fn new() -> Self {
      let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
      let (queue, pool) = queue::start(Aggregator::new(store.clone()), 2, 64, POLICY);
      Self {
        state: AppState { store: store.clone(), queue },
        store,
        pool,
      }
    }

    /// Close the queue and wait for every submitted event to be applied.
    async fn drain(self) -> Arc<SqliteStore> {
      drop(self.state);
      self.pool.join().await;
      self.store
    }
  }

  async fn oneshot_raw(
    state:   AppState<SqliteStore>,
    method:  &str,
    uri:     &str,
    headers: Vec<(header::HeaderName, &str)>,
    body:    &str,
  ) -> axum::response::Response {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
      builder = builder.header(k, v);
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();
    router(state).oneshot(req).await.unwrap()
  }

  async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  // ── Pixel ───────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn pixel_serves_gif_and_records_an_open() {
    let h = Harness::new().await;
    let resp = oneshot_raw(
      h.state.clone(),
      "GET",
      "/pixel.gif?subject=Welcome&to=a%40x.com",
      vec![(header::USER_AGENT, "Mail/1.0")],
      "",
    )
    .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/gif");
    assert!(
      resp.headers()[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .contains("no-store")
    );
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], pixel::PIXEL_GIF);

    let store = h.drain().await;
    let events = store.list_events(None, None).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["to"], "a@x.com");
    assert_eq!(events[0].headers["user-agent"], "Mail/1.0");

    let detail = store.get_subject(hash_subject("Welcome")).await.unwrap().unwrap();
    assert_eq!((detail.subject.sends, detail.subject.opens), (0, 1));
  }

  #[tokio::test]
  async fn pixel_is_served_even_when_the_queue_is_full() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let (queue, _rx) = queue::detached(1);
    let state = AppState { store, queue };

    for _ in 0..3 {
      let resp = oneshot_raw(state.clone(), "GET", "/pixel.gif", vec![], "").await;
      assert_eq!(resp.status(), StatusCode::OK);
      assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/gif");
    }

    // The explicit API does report back-pressure.
    let resp = oneshot_raw(state, "GET", "/api/generate-pixel?subject=Hi&to=a", vec![], "").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  // ── Full flow ───────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn send_then_two_pixel_fetches_count_one_unique_open() {
    let h = Harness::new().await;

    let resp = oneshot_raw(
      h.state.clone(),
      "GET",
      "/api/generate-pixel?to=a%40x.com&from=news%40x.com&subject=Welcome",
      vec![],
      "",
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let receipt = body_json(resp).await;
    assert_eq!(receipt["action"], "send");
    assert_eq!(receipt["subject_id"], hash_subject("Welcome").as_str());
    assert_eq!(receipt["pair_id"], hash_pair("Welcome", "a@x.com").as_str());

    // Let the send land before the opens.
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..2 {
      oneshot_raw(
        h.state.clone(),
        "GET",
        "/pixel.gif?subject=Welcome&to=a%40x.com",
        vec![],
        "",
      )
      .await;
    }

    let store = h.drain().await;
    let detail = store.get_subject(hash_subject("Welcome")).await.unwrap().unwrap();
    assert_eq!((detail.subject.sends, detail.subject.opens), (1, 1));
    assert_eq!((detail.pairs[0].sends, detail.pairs[0].opens), (1, 2));
  }

  #[tokio::test]
  async fn explicit_open_without_subject_is_tolerated() {
    let h = Harness::new().await;
    let resp = oneshot_raw(
      h.state.clone(),
      "POST",
      "/api/events/open",
      vec![(header::CONTENT_TYPE, "application/json")],
      r#"{"recipient":"a@x.com"}"#,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let receipt = body_json(resp).await;
    assert_eq!(receipt["action"], "open");
    assert_eq!(receipt["subject_id"], hash_subject("").as_str());

    let store = h.drain().await;
    let detail = store.get_subject(hash_subject("")).await.unwrap().unwrap();
    assert_eq!(detail.subject.opens, 1);
    assert_eq!(detail.pairs[0].recipient, "a@x.com");
  }

  #[tokio::test]
  async fn explicit_action_overrides_endpoint_default() {
    let h = Harness::new().await;
    let resp = oneshot_raw(
      h.state.clone(),
      "POST",
      "/api/events/send",
      vec![(header::CONTENT_TYPE, "application/json")],
      r#"{"to":"a@x.com","subject":"Hi","action":"open"}"#,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(resp).await["action"], "open");
    h.drain().await;
  }

  #[tokio::test]
  async fn to_and_recipient_together_prefer_to_on_every_route() {
    let h = Harness::new().await;
    let want = hash_pair("Hi", "a@x.com");

    let resp = oneshot_raw(
      h.state.clone(),
      "GET",
      "/api/generate-pixel?subject=Hi&to=a%40x.com&recipient=b%40x.com",
      vec![],
      "",
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["pair_id"], want.as_str());

    let resp = oneshot_raw(
      h.state.clone(),
      "POST",
      "/api/events/open",
      vec![(header::CONTENT_TYPE, "application/json")],
      r#"{"subject":"Hi","to":"a@x.com","recipient":"b@x.com"}"#,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(resp).await["pair_id"], want.as_str());

    oneshot_raw(
      h.state.clone(),
      "GET",
      "/pixel.gif?subject=Hi&to=a%40x.com&recipient=b%40x.com",
      vec![],
      "",
    )
    .await;

    let store = h.drain().await;
    let detail = store.get_subject(hash_subject("Hi")).await.unwrap().unwrap();
    assert_eq!(detail.pairs.len(), 1);
    assert_eq!(detail.pairs[0].recipient, "a@x.com");
    assert_eq!((detail.pairs[0].sends, detail.pairs[0].opens), (1, 2));
    assert_eq!((detail.subject.sends, detail.subject.opens), (1, 1));
  }

  // ── Read side ───────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn subjects_listing_and_detail() {
    let h = Harness::new().await;
    for to in ["a@x.com", "b@x.com", "c@x.com", "d@x.com"] {
      oneshot_raw(
        h.state.clone(),
        "POST",
        "/api/events/send",
        vec![(header::CONTENT_TYPE, "application/json")],
        &format!(r#"{{"to":"{to}","subject":"Digest"}}"#),
      )
      .await;
    }
    let store = h.drain().await;
    store
      .increment_pair_opens(
        pixeltrack_core::identity::EventKeys::derive("Digest", "a@x.com"),
        chrono::Utc::now(),
      )
      .await
      .unwrap();
    store
      .reconcile_subject(hash_subject("Digest"))
      .await
      .unwrap();

    let (queue, _rx) = queue::detached(1);
    let state = AppState { store, queue };

    let resp = oneshot_raw(state.clone(), "GET", "/api/subjects", vec![], "").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let list = body_json(resp).await;
    assert_eq!(list[0]["subject"], "Digest");
    assert_eq!(list[0]["sends"], 4);
    assert_eq!(list[0]["opens"], 1);
    assert_eq!(list[0]["open_rate"], 25.0);

    let uri = format!("/api/subjects/{}", hash_subject("Digest"));
    let resp = oneshot_raw(state.clone(), "GET", &uri, vec![], "").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let detail = body_json(resp).await;
    assert_eq!(detail["pairs"].as_array().unwrap().len(), 4);

    let uri = format!("/api/subjects/{}", hash_subject("missing"));
    let resp = oneshot_raw(state.clone(), "GET", &uri, vec![], "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = oneshot_raw(state, "GET", "/api/subjects/not-a-hash", vec![], "").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  }
}
