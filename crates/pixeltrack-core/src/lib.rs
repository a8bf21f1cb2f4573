//! Core types and logic for the pixeltrack event aggregation engine.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! store backend and the HTTP front door both depend on it.

// Native `async fn` in traits; the store trait spells out `Send` futures
// explicitly where it matters.
#![allow(async_fn_in_trait)]

pub mod aggregate;
pub mod aggregator;
pub mod error;
pub mod event;
pub mod identity;
pub mod store;

pub use error::{Error, Result, Retryable};
