// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for canopy-core.
//!
//! Every component surfaces one of the kinds below. The HTTP layer maps
//! them onto status codes; nothing inside the core knows about HTTP.

use thiserror::Error;

use crate::routing::RoutingError;
use crate::store::StoreError;

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by core operations.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Validation failed, an unknown variant was supplied or a required
    /// field is missing.
    #[error("{0}")]
    BadRequest(String),

    /// No token, or the token could not be validated.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller is authenticated but lacks a required role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The addressed entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A uniqueness constraint or a resource booking clashed.
    #[error("{0}")]
    Conflict(String),

    /// An external routing collaborator failed transiently.
    #[error("routing unavailable: {0}")]
    RoutingUnavailable(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),

    /// The surrounding task was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::RoutingUnavailable(_) => "ROUTING_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::EntityNotFound { .. } => Error::NotFound(err.to_string()),
            StoreError::Conflict { .. } => Error::Conflict(err.to_string()),
            StoreError::Database { .. } => Error::Internal(err.to_string()),
        }
    }
}

impl From<RoutingError> for Error {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::Unavailable(msg) => Error::RoutingUnavailable(msg),
            RoutingError::InvalidInput(msg) => Error::BadRequest(msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(format!("io: {}", err))
    }
}
