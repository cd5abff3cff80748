//! Hypervisor session and VM endpoints

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use super::{body_or_default, Path, Query};
use crate::auth::CurrentUser;
use crate::config::ConnectParams;
use crate::error::{ApiError, ApiResult};
use crate::hypervisor::{usage_history, Hypervisor};
use crate::server::AppState;
use vmcaptain_common::{
    CreateSnapshotRequest, PowerOperation, Result, Snapshot, StatsSummary, Vm, VmMetrics,
};

/// Header naming the hypervisor session a request runs against
pub const SESSION_HEADER: &str = "x-vcenter-session";

/// Longest history window served by the metrics endpoint
const MAX_METRIC_HOURS: usize = 24 * 7;

#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    pub hours: Option<usize>,
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn vm_not_found() -> ApiError {
    ApiError::not_found("VM not found")
}

/// Run `op` against the session named by the request header, or against
/// the default session when there is none.
async fn on_session<T, F, Fut>(
    state: &AppState,
    current: &CurrentUser,
    headers: &HeaderMap,
    op: F,
) -> ApiResult<T>
where
    F: Fn(Arc<dyn Hypervisor>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match session_id(headers) {
        Some(id) => {
            let session = state
                .sessions
                .get(id)
                .await
                .filter(|s| s.usable_by(&current.user.id, current.user.is_admin()))
                .ok_or_else(|| ApiError::unauthorized("Unauthorized or session expired"))?;
            Ok(op(session.backend).await?)
        }
        None => Ok(state
            .sessions
            .with_default(&state.config.vcenter, op)
            .await?),
    }
}

/// Reject VMs the caller has no grant for. Reported as absent.
fn ensure_visible(current: &CurrentUser, vm_id: &str) -> ApiResult<()> {
    if current.user.can_access(vm_id) {
        Ok(())
    } else {
        Err(vm_not_found())
    }
}

/// Run `op` only if the VM exists; `None` when it does not.
async fn if_exists<T, Fut>(hv: &dyn Hypervisor, vm_id: &str, op: Fut) -> Result<Option<T>>
where
    Fut: Future<Output = Result<T>>,
{
    if hv.get_vm(vm_id).await?.is_none() {
        return Ok(None);
    }
    op.await.map(Some)
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    body: std::result::Result<Json<ConnectParams>, JsonRejection>,
) -> ApiResult<Json<ConnectResponse>> {
    let params = body_or_default(body);
    let creds = state.config.vcenter.resolve(&params)?;
    let session_id = state
        .sessions
        .connect(&creds, Some(&current.user.id))
        .await?;
    info!(
        "{} connected to {} as {}",
        current.user.username, creds.url, creds.username
    );
    Ok(Json(ConnectResponse { session_id }))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let id = session_id(&headers)
        .ok_or_else(|| ApiError::bad_request(format!("{} header required", SESSION_HEADER)))?;
    let owned = state.sessions.get(id).await.is_some_and(|s| {
        s.owner.is_some() && s.usable_by(&current.user.id, current.user.is_admin())
    });
    if !owned || !state.sessions.disconnect(id).await {
        return Err(ApiError::not_found("Session not found"));
    }
    info!("{} disconnected session {}", current.user.username, id);
    Ok(Json(serde_json::json!({ "message": "Disconnected successfully" })))
}

pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Vm>>> {
    let mut vms = on_session(&state, &current, &headers, |hv| async move {
        hv.list_vms().await
    })
    .await?;
    vms.retain(|vm| current.user.can_access(&vm.id));
    Ok(Json(vms))
}

pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<Vm>> {
    ensure_visible(&current, &vm_id)?;
    let id = vm_id.as_str();
    let mut vm = on_session(&state, &current, &headers, move |hv| async move {
        hv.get_vm(id).await
    })
    .await?
    .ok_or_else(vm_not_found)?;

    if current.user.is_admin() {
        let assigned = state
            .db
            .list_users()?
            .into_iter()
            .filter(|u| u.assigned_vms.iter().any(|id| id == &vm.id))
            .map(|u| u.username)
            .collect();
        vm.assigned_users = Some(assigned);
    }
    Ok(Json(vm))
}

pub async fn power(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
    Path((vm_id, op)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let op: PowerOperation = op
        .parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid power operation: {}", op)))?;
    ensure_visible(&current, &vm_id)?;

    let id = vm_id.as_str();
    on_session(&state, &current, &headers, move |hv| async move {
        if_exists(hv.as_ref(), id, hv.power(id, op)).await
    })
    .await?
    .ok_or_else(vm_not_found)?;

    info!("{} requested {} on {}", current.user.username, op, vm_id);
    Ok(Json(serde_json::json!({
        "message": format!("VM {} operation initiated", op),
        "vm_id": vm_id,
        "operation": op,
    })))
}

pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<Vec<Snapshot>>> {
    ensure_visible(&current, &vm_id)?;
    let id = vm_id.as_str();
    let snapshots = on_session(&state, &current, &headers, move |hv| async move {
        if_exists(hv.as_ref(), id, hv.list_snapshots(id)).await
    })
    .await?
    .ok_or_else(vm_not_found)?;
    Ok(Json(snapshots))
}

pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    body: std::result::Result<Json<CreateSnapshotRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body_or_default(body);
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("Snapshot name is required"));
    }
    ensure_visible(&current, &vm_id)?;

    let (id, req) = (vm_id.as_str(), &req);
    let snapshot = on_session(&state, &current, &headers, move |hv| async move {
        if_exists(hv.as_ref(), id, hv.create_snapshot(id, req)).await
    })
    .await?
    .ok_or_else(vm_not_found)?;

    info!(
        "{} created snapshot {} ({}) of {}",
        current.user.username, snapshot.name, snapshot.id, vm_id
    );
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<VmMetrics>> {
    let hours = query.hours.unwrap_or(24);
    if hours > MAX_METRIC_HOURS {
        return Err(ApiError::bad_request(format!(
            "hours must be at most {}",
            MAX_METRIC_HOURS
        )));
    }
    ensure_visible(&current, &vm_id)?;
    let id = vm_id.as_str();
    let vm = on_session(&state, &current, &headers, move |hv| async move {
        hv.get_vm(id).await
    })
    .await?
    .ok_or_else(vm_not_found)?;
    Ok(Json(usage_history(&vm, hours, &mut rand::thread_rng())))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    headers: HeaderMap,
) -> ApiResult<Json<StatsSummary>> {
    let mut vms = on_session(&state, &current, &headers, |hv| async move {
        hv.list_vms().await
    })
    .await?;
    vms.retain(|vm| current.user.can_access(&vm.id));
    Ok(Json(StatsSummary::from_vms(&vms)))
}
