//! HTTP API Module
//!
//! Read-only status endpoints for a running replica.

mod http;

pub use http::{HealthResponse, HttpServer, StatsResponse};
