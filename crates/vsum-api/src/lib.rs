//! Axum HTTP API server.
//!
//! This crate provides:
//! - Live job status over Server-Sent Events
//! - Job submission, retry and status polling endpoints
//! - Bearer token verification
//! - Security headers, CORS and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod stream;

pub use auth::{AuthUser, Claims, JwtVerifier};
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
pub use stream::{CloseReason, ConnectionState, StatusBridge};
