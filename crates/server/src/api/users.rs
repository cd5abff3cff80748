//! Console login and user management

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{body_or_default, require_all, Path};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use vmcaptain_common::{NewUser, Role, User};

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

#[derive(Debug, Default, Deserialize)]
pub struct AddUserRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: Option<String>,
    pub new_password: Option<String>,
}

fn message(text: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": text }))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let req = body_or_default(body);
    let [username, password] = require_all(
        [&req.username, &req.password],
        "Username and password are required",
    )?;

    let user = state
        .db
        .user_by_credentials(username, password)?
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    let (token, expires_at) = state
        .db
        .create_session(&user.id, state.config.sessions.login_ttl_secs)?;
    info!("User {} logged in", user.username);

    Ok(Json(LoginResponse {
        token,
        expires_at,
        user,
    }))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    state.db.delete_session(&current.token)?;
    info!("User {} logged out", current.user.username);
    Ok(message("Logged out"))
}

pub async fn whoami(Extension(current): Extension<CurrentUser>) -> Json<User> {
    Json(current.user)
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<User>>> {
    current.require_admin()?;
    Ok(Json(state.db.list_users()?))
}

pub async fn add_user(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    body: Result<Json<AddUserRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    current.require_admin()?;
    let req = body_or_default(body);
    let [username, password, role] = require_all(
        [&req.username, &req.password, &req.role],
        "Username, password, and role are required",
    )?;
    let role: Role = role.parse()?;

    let user = state
        .db
        .add_user(&NewUser {
            username: username.to_string(),
            password: password.to_string(),
            role,
        })
        .map_err(|e| match e {
            vmcaptain_common::Error::AlreadyExists { .. } => {
                ApiError::bad_request("Username already exists")
            }
            other => other.into(),
        })?;

    info!(
        "{} created user {} ({})",
        current.user.username, user.username, user.role
    );
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(user_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    current.require_admin()?;
    if user_id == current.user.id {
        return Err(ApiError::bad_request("Cannot delete yourself"));
    }
    if !state.db.delete_user(&user_id)? {
        return Err(ApiError::not_found("User not found"));
    }
    info!("{} deleted user {}", current.user.username, user_id);
    Ok(message("User deleted successfully"))
}

pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    body: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body_or_default(body);
    let [current_password, new_password] = require_all(
        [&req.current_password, &req.new_password],
        "Current and new passwords are required",
    )?;

    if !state
        .db
        .verify_user_password(&current.user.id, current_password)?
    {
        return Err(ApiError::unauthorized("Current password is incorrect"));
    }
    if !state.db.update_password(&current.user.id, new_password)? {
        return Err(ApiError::not_found("User not found"));
    }
    info!("User {} changed their password", current.user.username);
    Ok(message("Password updated successfully"))
}

pub async fn assign_vm(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((user_id, vm_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    current.require_admin()?;
    if !state.db.assign_vm(&user_id, &vm_id)? {
        return Err(ApiError::not_found("User not found"));
    }
    info!("Granted {} to {}", vm_id, user_id);
    Ok(message("VM assigned successfully"))
}

pub async fn remove_vm(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((user_id, vm_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    current.require_admin()?;
    if !state.db.remove_vm(&user_id, &vm_id)? {
        return Err(ApiError::not_found("User not found"));
    }
    info!("Revoked {} from {}", vm_id, user_id);
    Ok(message("VM removed successfully"))
}
