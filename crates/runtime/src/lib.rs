//! # ragway-runtime
//!
//! Runtime library for the ragway gateway: a multi-tenant
//! retrieval-augmented question-answering service fronting a text-generation
//! engine, an embedding engine, and a vector index.
//!
//! The crate is organized around the gateway's subsystems:
//!
//! - [`engines`] — adapters for the three external engines, behind traits
//! - [`tools`] — the guarded tool gateway (fingerprint, rate limit,
//!   single-flight, cache, circuit breaker, retry) and layered policies
//! - [`rag`] — the unary and streaming ask pipelines
//! - [`bulk`] — NDJSON import, background export jobs, direct downloads
//! - [`api`] — axum routes, request-context middleware, server assembly

pub mod api;
pub mod bulk;
pub mod config;
pub mod engines;
pub mod error;
pub mod metrics;
pub mod rag;
pub mod state;
pub mod tools;

pub use config::Settings;
pub use error::ApiError;
pub use state::{AppState, RequestCtx};
