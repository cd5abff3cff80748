//! HTTP API handlers

pub mod users;
pub mod vcenter;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, ApiResult};

/// Path parameters; a rejection is reported as a JSON error body
pub struct Path<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Path<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        axum::extract::Path::<T>::from_request_parts(parts, state)
            .await
            .map(|axum::extract::Path(value)| Path(value))
            .map_err(|e| ApiError::new(e.status(), e.body_text()))
    }
}

/// Query string; a rejection is reported as a JSON error body
pub struct Query<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
            .map(|axum::extract::Query(value)| Query(value))
            .map_err(|e| ApiError::new(e.status(), e.body_text()))
    }
}

/// Unwrap an optional JSON body, treating a missing or malformed body
/// as a request with every field absent.
pub(crate) fn body_or_default<T: Default>(body: Result<Json<T>, JsonRejection>) -> T {
    match body {
        Ok(Json(value)) => value,
        Err(e) => {
            tracing::debug!("Ignoring request body: {}", e);
            T::default()
        }
    }
}

/// A string field that is present and not blank
pub(crate) fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Require every field to be present, failing with `message` otherwise
pub(crate) fn require_all<'a, const N: usize>(
    fields: [&'a Option<String>; N],
    message: &str,
) -> ApiResult<[&'a str; N]> {
    let mut out = [""; N];
    for (slot, field) in out.iter_mut().zip(fields) {
        *slot = required(field).ok_or_else(|| ApiError::bad_request(message))?;
    }
    Ok(out)
}
