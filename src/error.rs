//! Kernel error taxonomy.
//!
//! Mirrors the hand-rolled error style used across the proxy layer this crate grew out
//! of (see the old `ProxyError`): no `thiserror`, a manual `Display`/`Error` impl, and a
//! thin HTTP-facing wrapper that implements `IntoResponse` directly.

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use std::fmt;

/// Errors raised by the kernel core (store, brake, cadence, scheduler, drives).
#[derive(Debug)]
pub enum KernelError {
    /// The store's file could not be opened or its schema could not be applied.
    StoreUnavailable(String),
    /// The store's busy-wait elapsed before a lock could be acquired.
    Busy(String),
    /// A required storage feature (e.g. FTS5) is not compiled into the underlying engine.
    FeatureUnavailable(String),
    /// A cadence string failed to parse.
    InvalidCadence(String),
    /// The parking brake is engaged for the scope a caller tried to act in.
    BrakeBlocked(String),
    /// A drive's body returned an error. Carries the drive id for tick bookkeeping.
    Drive { drive: String, message: String },
    /// A persistence operation (insert/update) failed outside of the duplicate-key case.
    Persistence(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            KernelError::Busy(msg) => write!(f, "store busy: {msg}"),
            KernelError::FeatureUnavailable(msg) => write!(f, "feature unavailable: {msg}"),
            KernelError::InvalidCadence(msg) => write!(f, "invalid cadence: {msg}"),
            KernelError::BrakeBlocked(msg) => write!(f, "brake blocked: {msg}"),
            KernelError::Drive { drive, message } => write!(f, "drive {drive} failed: {message}"),
            KernelError::Persistence(msg) => write!(f, "persistence error: {msg}"),
        }
    }
}

impl std::error::Error for KernelError {}

/// HTTP-facing wrapper. Keeps the axum response-building concern out of `KernelError`
/// itself so the core stays usable from the CLI and the scheduler without pulling axum in.
#[derive(Debug)]
pub enum ApiError {
    Kernel(KernelError),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<KernelError> for ApiError {
    fn from(e: KernelError) -> Self {
        ApiError::Kernel(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            ApiError::Kernel(KernelError::BrakeBlocked(msg)) => (StatusCode::FORBIDDEN, msg),
            ApiError::Kernel(KernelError::StoreUnavailable(msg)) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::Kernel(KernelError::Busy(msg)) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Kernel(KernelError::FeatureUnavailable(msg)) => {
                (StatusCode::NOT_IMPLEMENTED, msg)
            }
            ApiError::Kernel(KernelError::InvalidCadence(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Kernel(KernelError::Drive { drive, message }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{drive}: {message}"))
            }
            ApiError::Kernel(KernelError::Persistence(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::error!("api error: {} - {}", status, message);

        Response::builder()
            .status(status)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("internal error building error response")))
    }
}
