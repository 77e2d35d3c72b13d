//! HTTP surface: middleware, routes, and the server.

pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{build_router, serve};
