//! Bearer-token authentication for the API

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use vmcaptain_common::User;

/// Request extension holding the authenticated caller
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

impl CurrentUser {
    /// Reject callers that are not admins
    pub fn require_admin(&self) -> ApiResult<()> {
        if self.user.is_admin() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Unauthorized"))
        }
    }
}

/// Resolve the `Authorization: Bearer` header to a user
pub fn authenticate(state: &AppState, header: Option<&str>) -> ApiResult<CurrentUser> {
    let header = header.ok_or_else(|| ApiError::unauthorized("Authorization header required"))?;
    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Invalid authorization header"))?;

    let user = state
        .db
        .session_user(token)?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

    Ok(CurrentUser {
        user,
        token: token.to_string(),
    })
}

/// Middleware that requires a logged-in user
pub async fn require_login(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match authenticate(&state, header) {
        Ok(current) => {
            request.extensions_mut().insert(current);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}
