//! SQLite backend for the pixeltrack aggregate store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime. Every call is serialised on
//! that thread, and each counter update is a single `INSERT .. ON CONFLICT
//! .. RETURNING` statement, which is what makes increment-and-return atomic.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;
