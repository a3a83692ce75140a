// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer token middleware.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use canopy_core::Error;
use tracing::debug;

use crate::api::{ApiError, AppState};

/// Token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}

/// Validate the caller and attach its [`Principal`] to the request.
///
/// [`Principal`]: canopy_core::identity::Principal
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = bearer_token(req.headers()) else {
        debug!("Missing or invalid Authorization header");
        return Err(Error::Unauthorized("missing bearer token".to_string()).into());
    };
    let principal = state.identity.validate_token(token).await?;

    if let Some(role) = &state.required_role {
        if !principal.has_role(role) {
            debug!(subject = %principal.subject, role = %role, "Caller lacks required role");
            return Err(Error::Forbidden(format!("role '{}' is required", role)).into());
        }
    }

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
